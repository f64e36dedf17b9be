#[cfg(test)]
use mockall::automock;

mod cloud;
mod cluster;
mod host;
mod sap_system;
mod saptune;
mod subscription;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) use cloud::CloudDiscovery;
pub(crate) use cluster::{ClusterDiscovery, ClusterPaths};
pub(crate) use host::HostDiscovery;
pub(crate) use sap_system::{SapSystemDiscovery, SAP_INSTALLATION_PATH};
pub(crate) use saptune::SaptuneDiscovery;
pub(crate) use subscription::SubscriptionDiscovery;

use crate::collector::{Collector, CollectorError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscoveryKind {
    HaCluster,
    SapSystem,
    Cloud,
    Subscription,
    Host,
    Saptune,
}

impl DiscoveryKind {
    pub const ALL: [DiscoveryKind; 6] = [
        DiscoveryKind::HaCluster,
        DiscoveryKind::SapSystem,
        DiscoveryKind::Cloud,
        DiscoveryKind::Subscription,
        DiscoveryKind::Host,
        DiscoveryKind::Saptune,
    ];

    /// Identifier sent to the collector as `discovery_type`.
    pub fn id(&self) -> &'static str {
        match self {
            DiscoveryKind::HaCluster => "ha_cluster_discovery",
            DiscoveryKind::SapSystem => "sap_system_discovery",
            DiscoveryKind::Cloud => "cloud_discovery",
            DiscoveryKind::Subscription => "subscription_discovery",
            DiscoveryKind::Host => "host_discovery",
            DiscoveryKind::Saptune => "saptune_discovery",
        }
    }

    pub fn from_id(id: &str) -> Option<DiscoveryKind> {
        DiscoveryKind::ALL.into_iter().find(|kind| kind.id() == id)
    }

    /// Name of the option configuring the period of this discovery.
    pub fn period_option(&self) -> &'static str {
        match self {
            DiscoveryKind::HaCluster => "cluster-discovery-period",
            DiscoveryKind::SapSystem => "sapsystem-discovery-period",
            DiscoveryKind::Cloud => "cloud-discovery-period",
            DiscoveryKind::Subscription => "subscription-discovery-period",
            DiscoveryKind::Host => "host-discovery-period",
            DiscoveryKind::Saptune => "saptune-discovery-period",
        }
    }

    pub fn min_interval(&self) -> Duration {
        match self {
            DiscoveryKind::Subscription => Duration::from_secs(20),
            _ => Duration::from_secs(1),
        }
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            DiscoveryKind::Subscription | DiscoveryKind::Saptune => Duration::from_secs(900),
            _ => Duration::from_secs(10),
        }
    }

    /// Payload published when a discovery finds nothing, so the collector can
    /// forget what it knew.
    pub fn empty_payload(&self) -> serde_json::Value {
        match self {
            DiscoveryKind::SapSystem | DiscoveryKind::Subscription => {
                serde_json::Value::Array(vec![])
            }
            _ => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("{0} failed: {1}")]
    DiscoveryFailed(DiscoveryKind, String),
    #[error("could not encode {0} payload: {1}")]
    EncodingError(DiscoveryKind, serde_json::Error),
    #[error(transparent)]
    CollectorError(#[from] CollectorError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryOutcome {
    pub discovery_kind: DiscoveryKind,
    pub payload: Option<serde_json::Value>,
    pub summary_message: String,
}

impl DiscoveryOutcome {
    pub fn new<T: serde::Serialize>(
        discovery_kind: DiscoveryKind,
        payload: &T,
        summary_message: impl Into<String>,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        let payload = serde_json::to_value(payload)
            .map_err(|err| DiscoveryError::EncodingError(discovery_kind, err))?;

        Ok(DiscoveryOutcome {
            discovery_kind,
            payload: Some(payload),
            summary_message: summary_message.into(),
        })
    }

    pub fn empty(discovery_kind: DiscoveryKind, summary_message: impl Into<String>) -> DiscoveryOutcome {
        DiscoveryOutcome {
            discovery_kind,
            payload: None,
            summary_message: summary_message.into(),
        }
    }
}

/// One inspection of the host.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    fn kind(&self) -> DiscoveryKind;

    async fn discover(&self) -> Result<DiscoveryOutcome, DiscoveryError>;
}

/// Runs a discovery and pushes its payload to the collector. Runs of the same
/// publisher never overlap, whether triggered by the timer or by a request.
pub struct DiscoveryPublisher {
    discovery: Arc<dyn Discovery>,
    collector: Arc<dyn Collector>,
    interval: Duration,
    running: tokio::sync::Mutex<()>,
}

impl DiscoveryPublisher {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        collector: Arc<dyn Collector>,
        interval: Duration,
    ) -> DiscoveryPublisher {
        DiscoveryPublisher {
            discovery,
            collector,
            interval,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn kind(&self) -> DiscoveryKind {
        self.discovery.kind()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn discover_and_publish(&self) -> Result<String, DiscoveryError> {
        let _running = self.running.lock().await;
        let kind = self.kind();

        let outcome = self.discovery.discover().await?;
        let payload = outcome.payload.unwrap_or_else(|| kind.empty_payload());

        self.collector.publish(kind.id(), payload).await?;

        Ok(outcome.summary_message)
    }

    /// Publishes right away, then every `interval` until cancelled. Failures
    /// are logged and the loop keeps its pace; a run longer than the interval
    /// skips the ticks it overlapped.
    pub async fn run(&self, cancel: CancellationToken) {
        let kind = self.kind();
        let start = Instant::now();
        let mut deadline = start;

        info!("starting {} loop every {:?}", kind, self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.discover_and_publish() => match result {
                    Ok(message) => info!("{}: {}", kind, message),
                    Err(err) => error!("error while running {}: {}", kind, err),
                }
            }

            deadline = next_tick(start, self.interval, Instant::now());
        }

        info!("{} loop stopped", kind);
    }
}

/// First `start + n * period` boundary strictly after `now`.
pub(crate) fn next_tick(start: Instant, period: Duration, now: Instant) -> Instant {
    let period_nanos = period.as_nanos().max(1);
    let elapsed = now.saturating_duration_since(start).as_nanos();
    let ticks = elapsed / period_nanos + 1;

    start + Duration::from_nanos(u64::try_from(ticks * period_nanos).unwrap_or(u64::MAX))
}

pub type DiscoveryPublishers = BTreeMap<DiscoveryKind, Arc<DiscoveryPublisher>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockCollector;
    use mockall::predicate::eq;
    use reqwest::StatusCode;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cluster_discovery(payload: Option<serde_json::Value>) -> MockDiscovery {
        let mut discovery = MockDiscovery::new();
        discovery.expect_kind().return_const(DiscoveryKind::HaCluster);
        discovery.expect_discover().returning(move || {
            Ok(DiscoveryOutcome {
                discovery_kind: DiscoveryKind::HaCluster,
                payload: payload.clone(),
                summary_message: "cluster discovered".to_owned(),
            })
        });
        discovery
    }

    #[test]
    fn test_kind_ids_roundtrip() {
        for kind in DiscoveryKind::ALL {
            assert_eq!(DiscoveryKind::from_id(kind.id()), Some(kind));
            assert!(kind.default_interval() >= kind.min_interval());
        }
        assert_eq!(DiscoveryKind::from_id("ha_cluster"), None);
        assert_eq!(
            DiscoveryKind::Subscription.min_interval(),
            Duration::from_secs(20)
        );
    }

    #[tokio::test]
    async fn test_discover_and_publish() {
        let mut collector = MockCollector::new();
        collector
            .expect_publish()
            .with(eq("ha_cluster_discovery"), eq(json!({"name": "hana", "id": "H"})))
            .times(1)
            .returning(|_, _| Ok(()));

        let publisher = DiscoveryPublisher::new(
            Arc::new(cluster_discovery(Some(json!({"name": "hana", "id": "H"})))),
            Arc::new(collector),
            Duration::from_secs(10),
        );

        let message = publisher.discover_and_publish().await.unwrap();

        assert_eq!(message, "cluster discovered");
    }

    #[tokio::test]
    async fn test_empty_outcome_publishes_neutral_payload() {
        let mut collector = MockCollector::new();
        collector
            .expect_publish()
            .with(eq("ha_cluster_discovery"), eq(serde_json::Value::Null))
            .times(1)
            .returning(|_, _| Ok(()));

        let publisher = DiscoveryPublisher::new(
            Arc::new(cluster_discovery(None)),
            Arc::new(collector),
            Duration::from_secs(10),
        );

        assert!(publisher.discover_and_publish().await.is_ok());
    }

    #[tokio::test]
    async fn test_collector_failure_is_surfaced() {
        let mut collector = MockCollector::new();
        collector.expect_publish().returning(|_, _| {
            Err(CollectorError::UnexpectedStatus(
                "http://srv/api/collect".to_owned(),
                StatusCode::BAD_GATEWAY,
            ))
        });

        let publisher = DiscoveryPublisher::new(
            Arc::new(cluster_discovery(None)),
            Arc::new(collector),
            Duration::from_secs(10),
        );

        assert!(matches!(
            publisher.discover_and_publish().await,
            Err(DiscoveryError::CollectorError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_immediately_and_keeps_pace_on_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut collector = MockCollector::new();
        collector.expect_publish().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CollectorError::UnexpectedStatus(
                "http://srv/api/collect".to_owned(),
                StatusCode::SERVICE_UNAVAILABLE,
            ))
        });

        let publisher = Arc::new(DiscoveryPublisher::new(
            Arc::new(cluster_discovery(None)),
            Arc::new(collector),
            Duration::from_secs(10),
        ));
        let cancel = CancellationToken::new();

        let handle = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { publisher.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_next_tick_skips_overlapped_boundaries() {
        let start = Instant::now();
        let period = Duration::from_secs(10);

        assert_eq!(next_tick(start, period, start), start + period);
        assert_eq!(
            next_tick(start, period, start + Duration::from_millis(10)),
            start + period
        );
        assert_eq!(
            next_tick(start, period, start + Duration::from_secs(10)),
            start + Duration::from_secs(20)
        );
        assert_eq!(
            next_tick(start, period, start + Duration::from_secs(25)),
            start + Duration::from_secs(30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_run_skips_missed_ticks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut discovery = MockDiscovery::new();
        discovery.expect_kind().return_const(DiscoveryKind::Host);
        discovery.expect_discover().returning(|| {
            Ok(DiscoveryOutcome::empty(DiscoveryKind::Host, "host discovered"))
        });

        let mut collector = MockCollector::new();
        collector.expect_publish().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let publisher = Arc::new(DiscoveryPublisher::new(
            Arc::new(discovery),
            Arc::new(collector),
            Duration::from_secs(10),
        ));

        // holding the run lock stalls the first tick for 25 seconds
        let guard = publisher.running.try_lock().unwrap();
        let cancel = CancellationToken::new();
        let handle = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { publisher.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
