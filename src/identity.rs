use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Namespace under which machine ids are hashed into agent ids.
pub const AGENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0xfb92284e_aa5e_47f6_a883_bf9469e7a0dc);

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("could not read machine id from {0}: {1}")]
    UnreadableMachineId(PathBuf, std::io::Error),
    #[error("machine id in {0} is empty")]
    EmptyMachineId(PathBuf),
}

/// The stable agent id: `force_agent_id` when set, otherwise a UUIDv5 of the
/// machine id.
pub fn agent_id(force_agent_id: Option<&str>, machine_id_path: &Path) -> Result<String, IdentityError> {
    if let Some(forced) = force_agent_id.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(forced.to_owned());
    }

    let machine_id = std::fs::read_to_string(machine_id_path)
        .map_err(|err| IdentityError::UnreadableMachineId(machine_id_path.to_owned(), err))?;
    let machine_id = machine_id.trim();

    if machine_id.is_empty() {
        return Err(IdentityError::EmptyMachineId(machine_id_path.to_owned()));
    }

    Ok(Uuid::new_v5(&AGENT_ID_NAMESPACE, machine_id.as_bytes()).to_string())
}
