use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::FactValue;

pub const VALUE_NOT_FOUND: &str = "value-not-found";
pub const GATHERER_NOT_FOUND: &str = "gatherer-not-found";
pub const RPC_PLUGIN_LOADING_ERROR: &str = "rpc-plugin-loading-error";
pub const COMMAND_EXECUTION_ERROR: &str = "command-execution-error";
pub const PARSE_ERROR: &str = "parse-error";
pub const UNDEFINED_CONFIGURATION: &str = "undefined-configuration";
pub const GATHERER_EXECUTION_ERROR: &str = "gatherer-execution-error";

/// A gathering failure carried inside a reply. `kind` is a stable identifier
/// callers match on, `message` is for humans.
#[derive(Error, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct FactGatheringError {
    pub kind: String,
    pub message: String,
}

impl FactGatheringError {
    pub fn new(kind: &str, message: impl fmt::Display) -> FactGatheringError {
        FactGatheringError {
            kind: kind.to_owned(),
            message: message.to_string(),
        }
    }

    pub fn value_not_found(message: impl fmt::Display) -> FactGatheringError {
        FactGatheringError::new(VALUE_NOT_FOUND, message)
    }

    pub fn gatherer_not_found(gatherer: &str) -> FactGatheringError {
        FactGatheringError::new(
            GATHERER_NOT_FOUND,
            format!("requested gatherer {} not found", gatherer),
        )
    }

    pub fn command_execution(message: impl fmt::Display) -> FactGatheringError {
        FactGatheringError::new(COMMAND_EXECUTION_ERROR, message)
    }

    pub fn parse(message: impl fmt::Display) -> FactGatheringError {
        FactGatheringError::new(PARSE_ERROR, message)
    }

    pub fn undefined_configuration(message: impl fmt::Display) -> FactGatheringError {
        FactGatheringError::new(UNDEFINED_CONFIGURATION, message)
    }
}

/// The outcome of a single fact request: a value or an error, never both.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct GatheredFact {
    pub name: String,
    pub check_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FactValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FactGatheringError>,
}

impl GatheredFact {
    pub fn with_value(request: &FactRequest, value: FactValue) -> GatheredFact {
        GatheredFact {
            name: request.name.clone(),
            check_id: request.check_id.clone(),
            value: Some(value),
            error: None,
        }
    }

    pub fn with_error(request: &FactRequest, error: FactGatheringError) -> GatheredFact {
        GatheredFact {
            name: request.name.clone(),
            check_id: request.check_id.clone(),
            value: None,
            error: Some(error),
        }
    }

    pub fn from_result(
        request: &FactRequest,
        result: Result<FactValue, FactGatheringError>,
    ) -> GatheredFact {
        match result {
            Ok(value) => GatheredFact::with_value(request, value),
            Err(error) => GatheredFact::with_error(request, error),
        }
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct FactsGatheredReply {
    pub execution_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub group_id: String,
    pub facts: Vec<GatheredFact>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FactRequest {
    #[serde(default)]
    pub argument: String,
    pub check_id: String,
    pub gatherer: String,
    pub name: String,
}

#[derive(PartialEq, Eq, Debug)]
pub struct FactsGatheringRequest {
    pub execution_id: String,
    pub group_id: String,
    pub fact_requests: Vec<FactRequest>,
}

impl FactsGatheringRequest {
    /// Groups the requests by gatherer, in order of first appearance. Every
    /// request is tagged with its position in the original batch.
    pub fn facts_requests_by_gatherer(&self) -> IndexMap<String, Vec<(usize, FactRequest)>> {
        let mut grouped: IndexMap<String, Vec<(usize, FactRequest)>> = IndexMap::new();

        for (index, request) in self.fact_requests.iter().enumerate() {
            grouped
                .entry(request.gatherer.clone())
                .or_default()
                .push((index, request.clone()));
        }

        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, gatherer: &str) -> FactRequest {
        FactRequest {
            argument: String::new(),
            check_id: "check".to_owned(),
            gatherer: gatherer.to_owned(),
            name: name.to_owned(),
        }
    }

    #[test]
    fn test_group_by_gatherer_keeps_original_positions() {
        let request = FactsGatheringRequest {
            execution_id: "exec".to_owned(),
            group_id: "group".to_owned(),
            fact_requests: vec![
                request("a", "systemd"),
                request("b", "sysctl"),
                request("c", "systemd"),
            ],
        };

        let grouped = request.facts_requests_by_gatherer();

        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["systemd", "sysctl"]);
        let systemd: Vec<usize> = grouped["systemd"].iter().map(|(i, _)| *i).collect();
        assert_eq!(systemd, vec![0, 2]);
        assert_eq!(grouped["sysctl"][0].0, 1);
    }

    #[test]
    fn test_gathered_fact_serialization_omits_missing_side() {
        let fact = GatheredFact::with_error(
            &request("a", "missing"),
            FactGatheringError::gatherer_not_found("missing"),
        );

        let json = serde_json::to_value(&fact).unwrap();

        assert_eq!(json["error"]["kind"], "gatherer-not-found");
        assert!(json.get("value").is_none());
    }

    #[test]
    fn test_fact_request_argument_defaults_to_empty() {
        let request: FactRequest = serde_json::from_str(
            r#"{"check_id": "c1", "gatherer": "noop", "name": "n1"}"#,
        )
        .unwrap();

        assert_eq!(request.argument, "");
    }
}
