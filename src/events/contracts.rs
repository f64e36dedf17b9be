use serde::{Deserialize, Serialize};

use crate::gatherers::{FactRequest, FactsGatheringRequest};

pub(crate) use crate::gatherers::FactsGatheredReply as FactsGathered;

pub const DISCOVERY_REQUESTED_EVENT_TYPE: &str = "Trento.Discoveries.V1.DiscoveryRequested";
pub const FACTS_GATHERING_REQUESTED_EVENT_TYPE: &str = "Trento.Checks.V1.FactsGatheringRequested";
pub const FACTS_GATHERED_EVENT_TYPE: &str = "Trento.Checks.V1.FactsGathered";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequested {
    pub discovery_type: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FactsGatheringRequestedTarget {
    pub agent_id: String,
    #[serde(default)]
    pub fact_requests: Vec<FactRequest>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FactsGatheringRequested {
    pub execution_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub targets: Vec<FactsGatheringRequestedTarget>,
}

impl FactsGatheringRequested {
    /// The part of the request addressed to `agent_id`, if any.
    pub fn for_agent(&self, agent_id: &str) -> Option<FactsGatheringRequest> {
        self.targets
            .iter()
            .find(|target| target.agent_id == agent_id)
            .map(|target| FactsGatheringRequest {
                execution_id: self.execution_id.clone(),
                group_id: self.group_id.clone(),
                fact_requests: target.fact_requests.clone(),
            })
    }
}
