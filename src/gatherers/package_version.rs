use std::sync::Arc;

use super::{gather_each, FactGatheringError, FactRequest, FactValue, GatheredFact, Gatherer};
use crate::command::CommandExecutor;

pub const GATHERER_NAME: &str = "package_version";

/// Installed version of an rpm package.
pub struct PackageVersionGatherer {
    executor: Arc<dyn CommandExecutor>,
}

impl PackageVersionGatherer {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> PackageVersionGatherer {
        PackageVersionGatherer { executor }
    }

    async fn package_version(&self, request: FactRequest) -> Result<FactValue, FactGatheringError> {
        if request.argument.is_empty() {
            return Err(FactGatheringError::undefined_configuration(
                "missing required argument: package name",
            ));
        }

        let output = self
            .executor
            .exec("rpm", &["-q", "--qf", "%{VERSION}", request.argument.as_str()])
            .await
            .map_err(FactGatheringError::command_execution)?;

        if !output.success() {
            return Err(FactGatheringError::command_execution(format!(
                "error getting version of package {}: {}",
                request.argument,
                output.stdout_str()
            )));
        }

        Ok(FactValue::String(output.stdout_str()))
    }
}

#[async_trait::async_trait]
impl Gatherer for PackageVersionGatherer {
    async fn gather(
        &self,
        fact_requests: Vec<FactRequest>,
    ) -> Result<Vec<GatheredFact>, FactGatheringError> {
        Ok(gather_each(fact_requests, |request| self.package_version(request)).await)
    }

    fn name(&self) -> String {
        GATHERER_NAME.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeCommandExecutor;
    use crate::gatherers::{COMMAND_EXECUTION_ERROR, UNDEFINED_CONFIGURATION};

    fn request(name: &str, argument: &str) -> FactRequest {
        FactRequest {
            argument: argument.to_owned(),
            check_id: "check".to_owned(),
            gatherer: GATHERER_NAME.to_owned(),
            name: name.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_package_version() {
        let executor = FakeCommandExecutor::new()
            .with_output("rpm -q --qf %{VERSION} corosync", 0, "2.4.5")
            .with_output(
                "rpm -q --qf %{VERSION} missing",
                1,
                "package missing is not installed",
            );
        let gatherer = PackageVersionGatherer::new(Arc::new(executor));

        let facts = gatherer
            .gather(vec![
                request("corosync", "corosync"),
                request("missing", "missing"),
                request("empty", ""),
            ])
            .await
            .unwrap();

        assert_eq!(facts[0].value, Some(FactValue::from("2.4.5")));
        assert_eq!(facts[1].error.as_ref().unwrap().kind, COMMAND_EXECUTION_ERROR);
        assert_eq!(facts[2].error.as_ref().unwrap().kind, UNDEFINED_CONFIGURATION);
    }
}
