use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use sysinfo::System;

use super::{Discovery, DiscoveryError, DiscoveryKind, DiscoveryOutcome};
use crate::command::CommandExecutor;
use crate::config::PrometheusConfig;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const INSTALLATION_SOURCE: &str = "Community";
const NODE_EXPORTER_PORT: u16 = 9100;

const WATCHED_SYSTEMD_UNITS: [&str; 5] = [
    "pacemaker.service",
    "corosync.service",
    "sbd.service",
    "sapinit.service",
    "prometheus-node_exporter.service",
];

#[derive(Serialize, Debug, PartialEq)]
pub struct SystemdUnit {
    pub name: String,
    pub unit_file_state: String,
}

#[derive(Serialize, Debug)]
pub struct HostDiscoveryPayload {
    pub hostname: String,
    pub fully_qualified_domain_name: Option<String>,
    pub ip_addresses: Vec<String>,
    pub os_version: String,
    pub cpu_count: usize,
    pub total_memory_mb: u64,
    pub agent_version: String,
    pub installation_source: String,
    pub ssh_address: String,
    pub prometheus_targets: BTreeMap<String, String>,
    pub systemd_units: Vec<SystemdUnit>,
}

pub struct HostDiscovery {
    executor: Arc<dyn CommandExecutor>,
    instance_name: Option<String>,
    ssh_address: String,
    prometheus: PrometheusConfig,
}

impl HostDiscovery {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        instance_name: Option<String>,
        ssh_address: String,
        prometheus: PrometheusConfig,
    ) -> HostDiscovery {
        HostDiscovery {
            executor,
            instance_name,
            ssh_address,
            prometheus,
        }
    }

    async fn command_output(&self, program: &str, args: &[&str]) -> Option<String> {
        match self.executor.exec(program, args).await {
            Ok(output) if output.success() => Some(output.stdout_str()),
            Ok(output) => {
                debug!("{} exited with {:?}: {}", program, output.exit_code, output.stderr_str());
                None
            }
            Err(err) => {
                debug!("{}", err);
                None
            }
        }
    }

    async fn ip_addresses(&self) -> Vec<String> {
        self.command_output("hostname", &["-I"])
            .await
            .map(|output| output.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    async fn systemd_units(&self) -> Vec<SystemdUnit> {
        let mut units = Vec::with_capacity(WATCHED_SYSTEMD_UNITS.len());
        for unit in WATCHED_SYSTEMD_UNITS {
            // is-enabled prints the state even when exiting non-zero
            let state = match self.executor.exec("systemctl", &["is-enabled", unit]).await {
                Ok(output) if !output.stdout_str().is_empty() => output.stdout_str(),
                _ => "unknown".to_owned(),
            };
            units.push(SystemdUnit {
                name: unit.to_owned(),
                unit_file_state: state,
            });
        }
        units
    }

    fn prometheus_targets(&self, ip_addresses: &[String]) -> BTreeMap<String, String> {
        let node_exporter = self
            .prometheus
            .node_exporter_target
            .clone()
            .or_else(|| {
                ip_addresses
                    .first()
                    .map(|ip| format!("{}:{}", ip, NODE_EXPORTER_PORT))
            });

        node_exporter
            .map(|target| BTreeMap::from([("node_exporter".to_owned(), target)]))
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Discovery for HostDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Host
    }

    async fn discover(&self) -> Result<DiscoveryOutcome, DiscoveryError> {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        let hostname = match &self.instance_name {
            Some(name) => name.clone(),
            None => System::host_name().ok_or_else(|| {
                DiscoveryError::DiscoveryFailed(self.kind(), "could not read the hostname".to_owned())
            })?,
        };

        let ip_addresses = self.ip_addresses().await;
        let prometheus_targets = self.prometheus_targets(&ip_addresses);

        let payload = HostDiscoveryPayload {
            fully_qualified_domain_name: self.command_output("hostname", &["-f"]).await,
            os_version: System::os_version().unwrap_or_default(),
            cpu_count: system.cpus().len(),
            total_memory_mb: system.total_memory() / 1024 / 1024,
            agent_version: AGENT_VERSION.to_owned(),
            installation_source: INSTALLATION_SOURCE.to_owned(),
            ssh_address: self.ssh_address.clone(),
            systemd_units: self.systemd_units().await,
            prometheus_targets,
            ip_addresses,
            hostname,
        };

        let message = format!("Host {} discovered", payload.hostname);
        DiscoveryOutcome::new(self.kind(), &payload, message)
    }
}
