use std::sync::Arc;

use super::{gather_each, FactGatheringError, FactRequest, FactValue, GatheredFact, Gatherer};
use crate::command::CommandExecutor;

pub const GATHERER_NAME: &str = "systemd";

pub struct SystemdGatherer {
    executor: Arc<dyn CommandExecutor>,
}

impl SystemdGatherer {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> SystemdGatherer {
        SystemdGatherer { executor }
    }

    async fn unit_state(&self, request: FactRequest) -> Result<FactValue, FactGatheringError> {
        if request.argument.is_empty() {
            return Err(FactGatheringError::undefined_configuration(
                "missing required argument: unit name",
            ));
        }

        // is-active exits non-zero for inactive units but still prints the state
        let output = self
            .executor
            .exec("systemctl", &["is-active", request.argument.as_str()])
            .await
            .map_err(FactGatheringError::command_execution)?;

        let state = output.stdout_str();
        if state.is_empty() {
            return Err(FactGatheringError::command_execution(format!(
                "systemctl returned no state for {}: {}",
                request.argument,
                output.stderr_str()
            )));
        }

        Ok(FactValue::String(state))
    }
}

#[async_trait::async_trait]
impl Gatherer for SystemdGatherer {
    async fn gather(
        &self,
        fact_requests: Vec<FactRequest>,
    ) -> Result<Vec<GatheredFact>, FactGatheringError> {
        Ok(gather_each(fact_requests, |request| self.unit_state(request)).await)
    }

    fn name(&self) -> String {
        GATHERER_NAME.to_owned()
    }
}
