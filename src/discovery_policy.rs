use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;

use crate::discovery::{DiscoveryKind, DiscoveryPublishers};
use crate::events::{decode_event, DiscoveryRequested, EventsPolicy, DISCOVERY_REQUESTED_EVENT_TYPE};

/// Runs a discovery out of schedule when the server asks this agent for it.
pub struct DiscoveryRequestPolicy {
    agent_id: String,
    publishers: Arc<DiscoveryPublishers>,
}

impl DiscoveryRequestPolicy {
    pub fn new(agent_id: &str, publishers: Arc<DiscoveryPublishers>) -> DiscoveryRequestPolicy {
        DiscoveryRequestPolicy {
            agent_id: agent_id.to_owned(),
            publishers,
        }
    }
}

#[async_trait::async_trait]
impl EventsPolicy for DiscoveryRequestPolicy {
    async fn handle_event(&self, routing_key: &str, raw_event: &[u8]) -> Result<()> {
        let event = decode_event(raw_event)?;

        if event.is_expired(Utc::now()) {
            warn!("event {} ({}) expired, skipping", event.id, event.event_type);
            return Ok(());
        }

        if event.event_type != DISCOVERY_REQUESTED_EVENT_TYPE {
            warn!(
                "unrecognized event type {} on {}, skipping",
                event.event_type, routing_key
            );
            return Ok(());
        }

        let requested: DiscoveryRequested = event.data_as()?;
        if !requested.targets.iter().any(|target| *target == self.agent_id) {
            debug!("{} not requested for this agent, skipping", requested.discovery_type);
            return Ok(());
        }

        let publisher = DiscoveryKind::from_id(&requested.discovery_type)
            .and_then(|kind| self.publishers.get(&kind))
            .ok_or_else(|| anyhow!("unknown discovery type {}", requested.discovery_type))?;

        info!("{} requested", requested.discovery_type);
        let message = publisher.discover_and_publish().await?;
        info!("{}: {}", requested.discovery_type, message);

        Ok(())
    }
}
