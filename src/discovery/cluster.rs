use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::{Discovery, DiscoveryError, DiscoveryKind, DiscoveryOutcome};
use crate::command::CommandExecutor;
use crate::gatherers::{load_sbd_config, FactValue};
use crate::identity::AGENT_ID_NAMESPACE;

#[derive(Clone, Debug)]
pub struct ClusterPaths {
    pub cib: PathBuf,
    pub corosync_authkey: PathBuf,
    pub sbd_config: PathBuf,
}

impl Default for ClusterPaths {
    fn default() -> Self {
        ClusterPaths {
            cib: PathBuf::from("/var/lib/pacemaker/cib/cib.xml"),
            corosync_authkey: PathBuf::from("/etc/corosync/authkey"),
            sbd_config: PathBuf::from("/etc/sysconfig/sbd"),
        }
    }
}

/// Cluster documents are forwarded raw; the collector parses them.
#[derive(Serialize, Debug)]
pub struct ClusterDiscoveryPayload {
    pub id: String,
    pub name: String,
    pub cib: String,
    pub crmmon: Option<String>,
    pub sbd: Option<FactValue>,
}

pub struct ClusterDiscovery {
    executor: Arc<dyn CommandExecutor>,
    paths: ClusterPaths,
}

impl ClusterDiscovery {
    pub fn new(executor: Arc<dyn CommandExecutor>, paths: ClusterPaths) -> ClusterDiscovery {
        ClusterDiscovery { executor, paths }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, String> {
        let output = self
            .executor
            .exec(program, args)
            .await
            .map_err(|err| err.to_string())?;

        if !output.success() {
            return Err(format!(
                "{} exited with {:?}: {}",
                program,
                output.exit_code,
                output.stderr_str()
            ));
        }
        Ok(output.stdout_str())
    }

    async fn cluster_name(&self) -> String {
        let output = self
            .run(
                "crm_attribute",
                &["--type", "crm_config", "--name", "cluster-name", "--query"],
            )
            .await
            .unwrap_or_default();

        // scope=crm_config  name=cluster-name value=hana_cluster
        output
            .split_whitespace()
            .find_map(|field| field.strip_prefix("value="))
            .unwrap_or_default()
            .to_owned()
    }

    fn cluster_id(&self) -> Result<String, DiscoveryError> {
        let authkey = std::fs::read(&self.paths.corosync_authkey).map_err(|err| {
            DiscoveryError::DiscoveryFailed(
                self.kind(),
                format!(
                    "could not read {}: {}",
                    self.paths.corosync_authkey.display(),
                    err
                ),
            )
        })?;
        Ok(Uuid::new_v5(&AGENT_ID_NAMESPACE, &authkey).to_string())
    }
}

#[async_trait::async_trait]
impl Discovery for ClusterDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::HaCluster
    }

    async fn discover(&self) -> Result<DiscoveryOutcome, DiscoveryError> {
        if !self.paths.cib.exists() {
            return Ok(DiscoveryOutcome::empty(
                self.kind(),
                "No HA cluster discovered on this host",
            ));
        }

        // a host whose cluster stack is down reports no cluster
        let cib = match self.run("cibadmin", &["--query", "--local"]).await {
            Ok(cib) => cib,
            Err(err) => {
                warn!("could not query the cluster configuration: {}", err);
                return Ok(DiscoveryOutcome::empty(
                    self.kind(),
                    "No HA cluster discovered on this host",
                ));
            }
        };

        let crmmon = self
            .run("crm_mon", &["-X", "--inactive"])
            .await
            .map_err(|err| warn!("could not read the cluster status: {}", err))
            .ok();

        let sbd = load_sbd_config(&self.paths.sbd_config)
            .map_err(|err| debug!("sbd is not configured: {}", err))
            .ok();

        let payload = ClusterDiscoveryPayload {
            id: self.cluster_id()?,
            name: self.cluster_name().await,
            cib,
            crmmon,
            sbd,
        };

        let message = format!("Cluster {} discovered", payload.name);
        DiscoveryOutcome::new(self.kind(), &payload, message)
    }
}
