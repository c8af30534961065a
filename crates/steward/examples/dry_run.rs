use futures::future::join_all;
use gpu_steward::{EngineKind, RuntimeState, Steward, StewardConfig};
use std::time::Duration;

/// Drive every built-in resource through download, load and unload with the
/// stub engine, printing the status table as it changes.
#[async_std::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let home = tempfile::tempdir()?;
    let mut config = StewardConfig::with_dir(home.path());
    config.engine = EngineKind::Stub;
    let steward = Steward::start(config).await?;
    let registry = steward.registry().clone();

    let names = registry.names();
    let loads = names.iter().map(|name| registry.load(name, None));
    let watcher = async_std::task::spawn({
        let registry = registry.clone();
        async move {
            loop {
                let snapshot = registry.snapshot();
                for (name, resource) in &snapshot.resources {
                    let runtime = &resource.runtime;
                    println!(
                        "{:<10} {:<14} {:>5.1}%  {}",
                        name, runtime.state, runtime.progress, runtime.status_message
                    );
                }
                println!();
                if snapshot
                    .resources
                    .values()
                    .all(|r| r.runtime.state == RuntimeState::ReadyLoaded)
                {
                    break;
                }
                async_std::task::sleep(Duration::from_millis(40)).await;
            }
        }
    });

    for result in join_all(loads).await {
        result?;
    }
    watcher.await;

    steward.shutdown().await;
    Ok(())
}
