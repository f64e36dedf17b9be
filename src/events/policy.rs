use anyhow::Result;

#[cfg(test)]
use mockall::automock;

/// Handles one delivery. An `Err` rejects the message without requeueing it.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait EventsPolicy: Send + Sync {
    async fn handle_event(&self, routing_key: &str, raw_event: &[u8]) -> Result<()>;
}
