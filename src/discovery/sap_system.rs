use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{Discovery, DiscoveryError, DiscoveryKind, DiscoveryOutcome};

pub const SAP_INSTALLATION_PATH: &str = "/usr/sap";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SapSystemType {
    Database,
    Application,
    DiagnosticsAgent,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct SapInstance {
    pub name: String,
    pub instance_number: String,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct SapSystem {
    pub sid: String,
    pub system_type: SapSystemType,
    pub instances: Vec<SapInstance>,
}

/// Finds SAP installations by their directory layout, `/usr/sap/<SID>/<NAME><NN>`.
pub struct SapSystemDiscovery {
    installation_path: PathBuf,
}

impl SapSystemDiscovery {
    pub fn new(installation_path: &Path) -> SapSystemDiscovery {
        SapSystemDiscovery {
            installation_path: installation_path.to_owned(),
        }
    }

    fn systems(&self) -> Result<Vec<SapSystem>, std::io::Error> {
        let mut systems = Vec::new();
        for sid in sorted_dir_names(&self.installation_path)? {
            if !is_sid(&sid) {
                continue;
            }

            let instances: Vec<SapInstance> = sorted_dir_names(&self.installation_path.join(&sid))?
                .into_iter()
                .filter_map(|name| parse_instance(&name))
                .collect();

            if instances.is_empty() {
                continue;
            }

            systems.push(SapSystem {
                system_type: system_type(&instances),
                sid,
                instances,
            });
        }
        Ok(systems)
    }
}

fn sorted_dir_names(path: &Path) -> Result<Vec<String>, std::io::Error> {
    let mut names: Vec<String> = std::fs::read_dir(path)?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names)
}

/// Three characters, uppercase letter first, then uppercase letters or digits.
fn is_sid(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 3
        && bytes[0].is_ascii_uppercase()
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        && name != "SYS"
}

/// `HDB00`, `ASCS01`, `DVEBMGS10`: uppercase name followed by two digits.
fn parse_instance(name: &str) -> Option<SapInstance> {
    if name.len() < 3 || !name.is_ascii() {
        return None;
    }
    let (prefix, number) = name.split_at(name.len() - 2);
    if prefix.is_empty()
        || !prefix.bytes().all(|b| b.is_ascii_uppercase())
        || !number.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some(SapInstance {
        name: name.to_owned(),
        instance_number: number.to_owned(),
    })
}

fn system_type(instances: &[SapInstance]) -> SapSystemType {
    if instances.iter().any(|i| i.name.starts_with("HDB")) {
        SapSystemType::Database
    } else if instances.iter().all(|i| i.name.starts_with("SMDA")) {
        SapSystemType::DiagnosticsAgent
    } else {
        SapSystemType::Application
    }
}

#[async_trait::async_trait]
impl Discovery for SapSystemDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::SapSystem
    }

    async fn discover(&self) -> Result<DiscoveryOutcome, DiscoveryError> {
        if !self.installation_path.exists() {
            return Ok(DiscoveryOutcome::empty(self.kind(), "No SAP system discovered"));
        }

        let systems = self.systems().map_err(|err| {
            DiscoveryError::DiscoveryFailed(
                self.kind(),
                format!("could not scan {}: {}", self.installation_path.display(), err),
            )
        })?;

        if systems.is_empty() {
            return Ok(DiscoveryOutcome::empty(self.kind(), "No SAP system discovered"));
        }

        let sids: Vec<&str> = systems.iter().map(|s| s.sid.as_str()).collect();
        let message = format!("SAP system(s) with ID {} discovered", sids.join(", "));
        DiscoveryOutcome::new(self.kind(), &systems, message)
    }
}
