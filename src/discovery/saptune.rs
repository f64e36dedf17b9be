use serde::Serialize;
use std::sync::Arc;

use super::{Discovery, DiscoveryError, DiscoveryKind, DiscoveryOutcome};
use crate::command::CommandExecutor;

#[derive(Serialize, Debug)]
pub struct SaptuneDiscoveryPayload {
    pub package_version: Option<String>,
    pub saptune_installed: bool,
    pub status: Option<serde_json::Value>,
}

pub struct SaptuneDiscovery {
    executor: Arc<dyn CommandExecutor>,
}

impl SaptuneDiscovery {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> SaptuneDiscovery {
        SaptuneDiscovery { executor }
    }

    async fn package_version(&self) -> Option<String> {
        match self.executor.exec("rpm", &["-q", "--qf", "%{VERSION}", "saptune"]).await {
            Ok(output) if output.success() => Some(output.stdout_str()),
            Ok(_) => None,
            Err(err) => {
                debug!("{}", err);
                None
            }
        }
    }

    async fn status(&self) -> Option<serde_json::Value> {
        // saptune exits non-zero when the system is not tuned but still reports
        let output = self
            .executor
            .exec("saptune", &["--format", "json", "status"])
            .await
            .map_err(|err| warn!("{}", err))
            .ok()?;

        serde_json::from_slice(&output.stdout)
            .map_err(|err| warn!("could not parse saptune status: {}", err))
            .ok()
    }
}

#[async_trait::async_trait]
impl Discovery for SaptuneDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Saptune
    }

    async fn discover(&self) -> Result<DiscoveryOutcome, DiscoveryError> {
        let package_version = self.package_version().await;

        let payload = match package_version {
            None => SaptuneDiscoveryPayload {
                package_version: None,
                saptune_installed: false,
                status: None,
            },
            Some(version) => SaptuneDiscoveryPayload {
                status: self.status().await,
                package_version: Some(version),
                saptune_installed: true,
            },
        };

        let message = match &payload.package_version {
            Some(version) => format!("saptune {} discovered", version),
            None => "saptune is not installed".to_owned(),
        };
        DiscoveryOutcome::new(self.kind(), &payload, message)
    }
}
