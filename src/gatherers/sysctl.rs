use std::sync::Arc;

use super::{
    gather_each, parse_string_to_value, FactGatheringError, FactRequest, FactValue, GatheredFact,
    Gatherer,
};
use crate::command::CommandExecutor;

pub const GATHERER_NAME: &str = "sysctl";

pub struct SysctlGatherer {
    executor: Arc<dyn CommandExecutor>,
}

impl SysctlGatherer {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> SysctlGatherer {
        SysctlGatherer { executor }
    }

    async fn sysctl_value(&self, request: FactRequest) -> Result<FactValue, FactGatheringError> {
        if request.argument.is_empty() {
            return Err(FactGatheringError::undefined_configuration(
                "missing required argument: sysctl key",
            ));
        }

        let output = self
            .executor
            .exec("sysctl", &["-n", request.argument.as_str()])
            .await
            .map_err(FactGatheringError::command_execution)?;

        if !output.success() {
            return Err(FactGatheringError::value_not_found(format!(
                "sysctl key {} not found: {}",
                request.argument,
                output.stderr_str()
            )));
        }

        Ok(parse_sysctl_output(&output.stdout_str()))
    }
}

/// Multi-valued keys such as `kernel.sem` come back as a list.
fn parse_sysctl_output(raw: &str) -> FactValue {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    match fields.len() {
        0 => FactValue::String(String::new()),
        1 => parse_string_to_value(fields[0]),
        _ => FactValue::List(fields.into_iter().map(parse_string_to_value).collect()),
    }
}

#[async_trait::async_trait]
impl Gatherer for SysctlGatherer {
    async fn gather(
        &self,
        fact_requests: Vec<FactRequest>,
    ) -> Result<Vec<GatheredFact>, FactGatheringError> {
        Ok(gather_each(fact_requests, |request| self.sysctl_value(request)).await)
    }

    fn name(&self) -> String {
        GATHERER_NAME.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeCommandExecutor;
    use crate::gatherers::VALUE_NOT_FOUND;

    fn request(argument: &str) -> FactRequest {
        FactRequest {
            argument: argument.to_owned(),
            check_id: "check".to_owned(),
            gatherer: GATHERER_NAME.to_owned(),
            name: argument.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_sysctl_values() {
        let executor = FakeCommandExecutor::new()
            .with_output("sysctl -n vm.swappiness", 0, "10\n")
            .with_output("sysctl -n kernel.sem", 0, "32000\t1024000000\t500\t32000\n")
            .with_output("sysctl -n net.unknown", 255, "");
        let gatherer = SysctlGatherer::new(Arc::new(executor));

        let facts = gatherer
            .gather(vec![
                request("vm.swappiness"),
                request("kernel.sem"),
                request("net.unknown"),
            ])
            .await
            .unwrap();

        assert_eq!(facts[0].value, Some(FactValue::Int(10)));
        assert_eq!(
            facts[1].value,
            Some(FactValue::List(vec![
                FactValue::Int(32000),
                FactValue::Int(1024000000),
                FactValue::Int(500),
                FactValue::Int(32000),
            ]))
        );
        assert_eq!(facts[2].error.as_ref().unwrap().kind, VALUE_NOT_FOUND);
    }
}
