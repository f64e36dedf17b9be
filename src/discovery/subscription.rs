use std::sync::Arc;

use super::{Discovery, DiscoveryError, DiscoveryKind, DiscoveryOutcome};
use crate::command::CommandExecutor;

pub struct SubscriptionDiscovery {
    executor: Arc<dyn CommandExecutor>,
}

impl SubscriptionDiscovery {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> SubscriptionDiscovery {
        SubscriptionDiscovery { executor }
    }
}

#[async_trait::async_trait]
impl Discovery for SubscriptionDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Subscription
    }

    async fn discover(&self) -> Result<DiscoveryOutcome, DiscoveryError> {
        let output = match self.executor.exec("SUSEConnect", &["-s"]).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                debug!("SUSEConnect exited with {:?}", output.exit_code);
                return Ok(DiscoveryOutcome::empty(self.kind(), "No subscription discovered"));
            }
            Err(err) => {
                debug!("{}", err);
                return Ok(DiscoveryOutcome::empty(self.kind(), "No subscription discovered"));
            }
        };

        let subscriptions: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
            .map_err(|err| {
                DiscoveryError::DiscoveryFailed(
                    self.kind(),
                    format!("could not parse SUSEConnect output: {}", err),
                )
            })?;

        let message = format!("{} subscription(s) discovered", subscriptions.len());
        DiscoveryOutcome::new(self.kind(), &subscriptions, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeCommandExecutor;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscriptions_discovered() {
        let executor = FakeCommandExecutor::new().with_output(
            "SUSEConnect -s",
            0,
            r#"[{"identifier":"SLES_SAP","version":"15.4","arch":"x86_64","status":"Registered"}]"#,
        );
        let discovery = SubscriptionDiscovery::new(Arc::new(executor));

        let outcome = discovery.discover().await.unwrap();

        assert_eq!(outcome.summary_message, "1 subscription(s) discovered");
        assert_eq!(
            outcome.payload.unwrap(),
            json!([{"identifier": "SLES_SAP", "version": "15.4", "arch": "x86_64", "status": "Registered"}])
        );
    }

    #[tokio::test]
    async fn test_suseconnect_unavailable() {
        let discovery = SubscriptionDiscovery::new(Arc::new(FakeCommandExecutor::new()));

        let outcome = discovery.discover().await.unwrap();

        assert_eq!(outcome.payload, None);
    }

    #[tokio::test]
    async fn test_garbage_output() {
        let executor = FakeCommandExecutor::new().with_output("SUSEConnect -s", 0, "not json");
        let discovery = SubscriptionDiscovery::new(Arc::new(executor));

        assert!(matches!(
            discovery.discover().await,
            Err(DiscoveryError::DiscoveryFailed(DiscoveryKind::Subscription, _))
        ));
    }
}
