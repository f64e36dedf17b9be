use serde::Serialize;
use std::sync::Arc;

use super::{Discovery, DiscoveryError, DiscoveryKind, DiscoveryOutcome};
use crate::command::CommandExecutor;

pub const METADATA_ENDPOINT: &str = "http://169.254.169.254";

const AZURE_ASSET_TAG: &str = "7783-7084-3265-9085-8269-3286-77";
const AWS_TOKEN_TTL_SECONDS: &str = "21600";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Azure,
    Aws,
    Gcp,
    Nutanix,
    Kvm,
    Vmware,
    #[serde(rename = "")]
    Unknown,
}

impl CloudProvider {
    pub fn name(&self) -> &'static str {
        match self {
            CloudProvider::Azure => "azure",
            CloudProvider::Aws => "aws",
            CloudProvider::Gcp => "gcp",
            CloudProvider::Nutanix => "nutanix",
            CloudProvider::Kvm => "kvm",
            CloudProvider::Vmware => "vmware",
            CloudProvider::Unknown => "",
        }
    }
}

#[derive(Serialize, Debug)]
pub struct CloudDiscoveryPayload {
    pub provider: CloudProvider,
    pub metadata: Option<serde_json::Value>,
}

pub struct CloudDiscovery {
    executor: Arc<dyn CommandExecutor>,
    http: reqwest::Client,
    metadata_endpoint: String,
}

impl CloudDiscovery {
    pub fn new(executor: Arc<dyn CommandExecutor>, http: reqwest::Client) -> CloudDiscovery {
        CloudDiscovery::with_metadata_endpoint(executor, http, METADATA_ENDPOINT)
    }

    pub fn with_metadata_endpoint(
        executor: Arc<dyn CommandExecutor>,
        http: reqwest::Client,
        metadata_endpoint: &str,
    ) -> CloudDiscovery {
        CloudDiscovery {
            executor,
            http,
            metadata_endpoint: metadata_endpoint.trim_end_matches('/').to_owned(),
        }
    }

    async fn dmi(&self, keyword: &str) -> String {
        match self.executor.exec("dmidecode", &["-s", keyword]).await {
            Ok(output) if output.success() => output.stdout_str(),
            Ok(output) => {
                debug!("dmidecode -s {} failed: {}", keyword, output.stderr_str());
                String::new()
            }
            Err(err) => {
                debug!("{}", err);
                String::new()
            }
        }
    }

    pub async fn detect_provider(&self) -> CloudProvider {
        if self.dmi("chassis-asset-tag").await == AZURE_ASSET_TAG {
            return CloudProvider::Azure;
        }

        let system_version = self.dmi("system-version").await.to_lowercase();
        let manufacturer = self.dmi("system-manufacturer").await.to_lowercase();
        if system_version.contains("amazon") || manufacturer.contains("amazon") {
            return CloudProvider::Aws;
        }

        if self.dmi("bios-vendor").await.to_lowercase().contains("google") {
            return CloudProvider::Gcp;
        }

        if manufacturer.contains("nutanix") {
            CloudProvider::Nutanix
        } else if manufacturer.contains("qemu") {
            CloudProvider::Kvm
        } else if manufacturer.contains("vmware") {
            CloudProvider::Vmware
        } else {
            CloudProvider::Unknown
        }
    }

    async fn metadata(&self, provider: CloudProvider) -> Result<Option<serde_json::Value>, reqwest::Error> {
        let base = &self.metadata_endpoint;
        let request = match provider {
            CloudProvider::Azure => self
                .http
                .get(format!("{}/metadata/instance?api-version=2021-02-01", base))
                .header("Metadata", "true"),
            CloudProvider::Gcp => self
                .http
                .get(format!("{}/computeMetadata/v1/?recursive=true", base))
                .header("Metadata-Flavor", "Google"),
            CloudProvider::Aws => {
                // IMDSv2: a session token first, then the identity document
                let token = self
                    .http
                    .put(format!("{}/latest/api/token", base))
                    .header("X-aws-ec2-metadata-token-ttl-seconds", AWS_TOKEN_TTL_SECONDS)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;

                self.http
                    .get(format!("{}/latest/dynamic/instance-identity/document", base))
                    .header("X-aws-ec2-metadata-token", token)
            }
            _ => return Ok(None),
        };

        let metadata = request
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        Ok(Some(metadata))
    }
}

#[async_trait::async_trait]
impl Discovery for CloudDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Cloud
    }

    async fn discover(&self) -> Result<DiscoveryOutcome, DiscoveryError> {
        let provider = self.detect_provider().await;

        let metadata = self.metadata(provider).await.unwrap_or_else(|err| {
            warn!("could not fetch {} instance metadata: {}", provider.name(), err);
            None
        });

        let message = match provider {
            CloudProvider::Unknown => "No cloud provider discovered".to_owned(),
            provider => format!("Cloud provider {} discovered", provider.name()),
        };

        DiscoveryOutcome::new(self.kind(), &CloudDiscoveryPayload { provider, metadata }, message)
    }
}
