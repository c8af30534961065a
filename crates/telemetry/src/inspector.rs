use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use steward_core::DependencyStatus;

use crate::process::run_tool;

/// One component of the accelerator software stack.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn component(&self) -> &str;
    async fn probe(&self) -> Result<DependencyStatus>;
}

/// NVIDIA driver, read from the `nvidia-smi` banner.
pub struct DriverProbe;

#[async_trait]
impl DependencyProbe for DriverProbe {
    fn component(&self) -> &str {
        "nvidia-driver"
    }

    async fn probe(&self) -> Result<DependencyStatus> {
        let banner = run_tool("nvidia-smi", &[]).await?;
        parse_driver_banner(&banner)
    }
}

/// CUDA toolkit, read from `nvcc --version`.
pub struct NvccProbe;

#[async_trait]
impl DependencyProbe for NvccProbe {
    fn component(&self) -> &str {
        "cuda-toolkit"
    }

    async fn probe(&self) -> Result<DependencyStatus> {
        let out = run_tool("nvcc", &["--version"]).await?;
        parse_nvcc_version(&out)
    }
}

pub fn parse_driver_banner(banner: &str) -> Result<DependencyStatus> {
    let driver = field_after(banner, "Driver Version:")
        .ok_or_else(|| anyhow!("driver version missing from nvidia-smi output"))?;
    let mut status = DependencyStatus {
        component: "nvidia-driver".to_string(),
        version: Some(driver),
        accelerator_enabled: true,
        details: Default::default(),
        error: None,
    };
    if let Some(cuda) = field_after(banner, "CUDA Version:") {
        status
            .details
            .insert("cuda_version".into(), Value::String(cuda));
    }
    Ok(status)
}

pub fn parse_nvcc_version(out: &str) -> Result<DependencyStatus> {
    let release = out
        .split("release ")
        .nth(1)
        .and_then(|rest| rest.split(|c: char| c == ',' || c.is_whitespace()).next())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("release missing from nvcc output"))?;
    Ok(DependencyStatus {
        component: "cuda-toolkit".to_string(),
        version: Some(release.to_string()),
        accelerator_enabled: true,
        details: Default::default(),
        error: None,
    })
}

fn field_after(text: &str, label: &str) -> Option<String> {
    let rest = text.split(label).nth(1)?;
    rest.split_whitespace()
        .next()
        .map(|v| v.trim_end_matches('|').to_string())
        .filter(|v| !v.is_empty())
}

/// `"12.4"` -> `(12, 4)`; anything unparsable compares as unknown.
fn major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    Some((major, minor))
}

/// Advisory report on the accelerator stack. Never fails; probe errors and
/// version mismatches come back as data on the affected row.
pub struct DependencyInspector {
    expected_cuda: Option<String>,
    probes: Vec<Box<dyn DependencyProbe>>,
}

impl DependencyInspector {
    pub fn new(expected_cuda: Option<String>) -> Self {
        Self::with_probes(expected_cuda, vec![Box::new(DriverProbe), Box::new(NvccProbe)])
    }

    pub fn with_probes(expected_cuda: Option<String>, probes: Vec<Box<dyn DependencyProbe>>) -> Self {
        Self {
            expected_cuda,
            probes,
        }
    }

    pub async fn inspect(&self) -> Vec<DependencyStatus> {
        let mut report = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            let status = match probe.probe().await {
                Ok(status) => status,
                Err(e) => {
                    log::debug!("dependency probe {} failed: {}", probe.component(), e);
                    DependencyStatus::missing(probe.component(), e.to_string())
                }
            };
            report.push(status);
        }
        self.check_consistency(&mut report);
        report
    }

    fn check_consistency(&self, report: &mut [DependencyStatus]) {
        let driver_cuda = report
            .iter()
            .find(|s| s.component == "nvidia-driver")
            .and_then(|s| s.details.get("cuda_version"))
            .and_then(Value::as_str)
            .map(str::to_string);

        for status in report.iter_mut().filter(|s| s.error.is_none()) {
            let Some(version) = status.version.clone() else {
                continue;
            };
            match status.component.as_str() {
                "nvidia-driver" => {
                    if let (Some(expected), Some(actual)) = (&self.expected_cuda, &driver_cuda) {
                        if major_minor(expected).map(|v| v.0) != major_minor(actual).map(|v| v.0) {
                            status.error = Some(format!(
                                "driver supports CUDA {} but {} is expected",
                                actual, expected
                            ));
                        }
                    }
                }
                "cuda-toolkit" => {
                    if let Some(driver) = &driver_cuda {
                        if let (Some(toolkit), Some(limit)) =
                            (major_minor(&version), major_minor(driver))
                        {
                            if toolkit > limit {
                                status.error = Some(format!(
                                    "toolkit {} is newer than the driver's CUDA {}",
                                    version, driver
                                ));
                            }
                        }
                    }
                    if let Some(expected) = &self.expected_cuda {
                        if status.error.is_none()
                            && major_minor(expected).map(|v| v.0) != major_minor(&version).map(|v| v.0)
                        {
                            status.error =
                                Some(format!("toolkit {} does not match expected CUDA {}", version, expected));
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANNER: &str = "\
+-----------------------------------------------------------------------------------------+
| NVIDIA-SMI 550.54.15              Driver Version: 550.54.15      CUDA Version: 12.4     |
|-----------------------------------------+------------------------+----------------------+";

    const NVCC: &str = "nvcc: NVIDIA (R) Cuda compiler driver\n\
                        Cuda compilation tools, release 12.6, V12.6.77\n";

    struct Fixed(&'static str, std::result::Result<&'static str, &'static str>);

    #[async_trait]
    impl DependencyProbe for Fixed {
        fn component(&self) -> &str {
            self.0
        }

        async fn probe(&self) -> Result<DependencyStatus> {
            match self.1 {
                Ok(text) if self.0 == "nvidia-driver" => parse_driver_banner(text),
                Ok(text) => parse_nvcc_version(text),
                Err(e) => Err(anyhow!(e)),
            }
        }
    }

    #[test]
    fn reads_driver_and_cuda_from_banner() {
        let status = parse_driver_banner(BANNER).unwrap();
        assert_eq!(status.version.as_deref(), Some("550.54.15"));
        assert_eq!(status.details["cuda_version"], "12.4");
        assert!(status.accelerator_enabled);
    }

    #[test]
    fn reads_nvcc_release() {
        let status = parse_nvcc_version(NVCC).unwrap();
        assert_eq!(status.version.as_deref(), Some("12.6"));
        assert!(parse_nvcc_version("garbage").is_err());
    }

    #[async_std::test]
    async fn probe_failures_become_rows() {
        let inspector = DependencyInspector::with_probes(
            None,
            vec![
                Box::new(Fixed("nvidia-driver", Err("nvidia-smi is not installed"))),
                Box::new(Fixed("cuda-toolkit", Err("nvcc is not installed"))),
            ],
        );
        let report = inspector.inspect().await;
        assert_eq!(report.len(), 2);
        assert!(!report[0].accelerator_enabled);
        assert_eq!(report[0].error.as_deref(), Some("nvidia-smi is not installed"));
    }

    #[async_std::test]
    async fn flags_toolkit_newer_than_driver() {
        let inspector = DependencyInspector::with_probes(
            None,
            vec![
                Box::new(Fixed("nvidia-driver", Ok(BANNER))),
                Box::new(Fixed("cuda-toolkit", Ok(NVCC))),
            ],
        );
        let report = inspector.inspect().await;
        assert!(report[0].error.is_none());
        assert!(report[1].error.as_ref().unwrap().contains("newer than"));
    }

    #[async_std::test]
    async fn flags_unexpected_cuda_major() {
        let inspector = DependencyInspector::with_probes(
            Some("11.8".to_string()),
            vec![Box::new(Fixed("nvidia-driver", Ok(BANNER)))],
        );
        let report = inspector.inspect().await;
        assert!(report[0].error.as_ref().unwrap().contains("11.8"));
    }
}
