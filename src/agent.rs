use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, CollectorClient};
use crate::command::{CommandExecutor, TokioCommandExecutor};
use crate::config::AgentConfig;
use crate::discovery::{
    next_tick, CloudDiscovery, ClusterDiscovery, ClusterPaths, Discovery, DiscoveryKind,
    DiscoveryPublisher, DiscoveryPublishers, HostDiscovery, SapSystemDiscovery, SaptuneDiscovery,
    SubscriptionDiscovery, SAP_INSTALLATION_PATH,
};
use crate::discovery_policy::DiscoveryRequestPolicy;
use crate::events::{
    discoveries_listener_settings, facts_listener_settings, run_listener, EventsPolicy,
    MessagingError,
};
use crate::facts_engine::FactsEnginePolicy;
use crate::gatherers::{builtin_gatherers, GatherersRegistry, PluginError, PluginLoader};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("could not build the http client: {0}")]
    HttpClientError(reqwest::Error),
    #[error(transparent)]
    PluginError(#[from] PluginError),
    #[error("{0} listener failed: {1}")]
    ListenerError(&'static str, MessagingError),
    #[error("agent task failed: {0}")]
    TaskError(String),
}

/// Supervises the long running tasks of the agent: one loop per discovery,
/// the heartbeat and, with a facts service, the two message listeners. The
/// first task failing stops all the others.
pub struct Agent {
    agent_id: String,
    collector: Arc<dyn Collector>,
    publishers: Arc<DiscoveryPublishers>,
    registry: Arc<GatherersRegistry>,
    facts_service_url: Option<String>,
    heartbeat_interval: Duration,
}

impl Agent {
    pub fn new(
        agent_id: &str,
        collector: Arc<dyn Collector>,
        publishers: DiscoveryPublishers,
        registry: Arc<GatherersRegistry>,
        facts_service_url: Option<String>,
    ) -> Agent {
        Agent {
            agent_id: agent_id.to_owned(),
            collector,
            publishers: Arc::new(publishers),
            registry,
            facts_service_url,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Runs until `cancel` fires or a task fails, in which case `cancel` is
    /// fired for everyone else. Tasks get a grace period to stop before being
    /// aborted.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        let mut tasks: JoinSet<Result<(), AgentError>> = JoinSet::new();

        for publisher in self.publishers.values() {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                publisher.run(cancel).await;
                Ok(())
            });
        }

        {
            let collector = self.collector.clone();
            let interval = self.heartbeat_interval;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                heartbeat(collector, interval, cancel).await;
                Ok(())
            });
        }

        match &self.facts_service_url {
            Some(service_url) => self.spawn_listeners(&mut tasks, service_url, &cancel),
            None => warn!("facts-service-url is not set, facts gathering and discovery requests are disabled"),
        }

        info!("agent {} started", self.agent_id);

        let mut result = Ok(());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        error!("{}", err);
                        result = Err(err);
                        break;
                    }
                    Some(Err(err)) => {
                        error!("agent task failed: {}", err);
                        result = Err(AgentError::TaskError(err.to_string()));
                        break;
                    }
                }
            }
        }

        info!("stopping agent");
        cancel.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, drain(&mut tasks))
            .await
            .is_err()
        {
            warn!(
                "{} tasks still running after {:?}, aborting them",
                tasks.len(),
                SHUTDOWN_GRACE_PERIOD
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!("agent stopped");
        result
    }

    fn spawn_listeners(
        &self,
        tasks: &mut JoinSet<Result<(), AgentError>>,
        service_url: &str,
        cancel: &CancellationToken,
    ) {
        let settings = discoveries_listener_settings(service_url, &self.agent_id);
        let agent_id = self.agent_id.clone();
        let publishers = self.publishers.clone();
        let listener_cancel = cancel.clone();
        tasks.spawn(async move {
            run_listener(settings, listener_cancel, move |_| {
                Arc::new(DiscoveryRequestPolicy::new(&agent_id, publishers.clone()))
                    as Arc<dyn EventsPolicy>
            })
            .await
            .map_err(|err| AgentError::ListenerError("discovery requests", err))
        });

        let settings = facts_listener_settings(service_url);
        let agent_id = self.agent_id.clone();
        let registry = self.registry.clone();
        let listener_cancel = cancel.clone();
        tasks.spawn(async move {
            run_listener(settings, listener_cancel, move |publisher| {
                Arc::new(FactsEnginePolicy::new(&agent_id, registry.clone(), publisher))
                    as Arc<dyn EventsPolicy>
            })
            .await
            .map_err(|err| AgentError::ListenerError("facts engine", err))
        });
    }
}

async fn drain(tasks: &mut JoinSet<Result<(), AgentError>>) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Err(err)) => warn!("task failed while stopping: {}", err),
            Err(err) if err.is_panic() => warn!("task panicked while stopping: {}", err),
            _ => {}
        }
    }
}

/// Tells the collector the agent is alive, right away and then every
/// `interval`.
async fn heartbeat(collector: Arc<dyn Collector>, interval: Duration, cancel: CancellationToken) {
    let start = Instant::now();
    let mut deadline = start;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = collector.heartbeat() => match result {
                Ok(()) => debug!("heartbeat sent"),
                Err(err) => error!("error while sending the heartbeat: {}", err),
            }
        }

        deadline = next_tick(start, interval, Instant::now());
    }

    debug!("heartbeat stopped");
}

/// Built-in gatherers plus the plugins found in `plugins_folder`. The
/// returned loader owns the plugin processes.
pub async fn load_gatherers(
    executor: Arc<dyn CommandExecutor>,
    plugins_folder: &Path,
    cancel: &CancellationToken,
) -> Result<(Arc<GatherersRegistry>, PluginLoader), AgentError> {
    let registry = Arc::new(builtin_gatherers(executor).build_registry());
    let plugins = PluginLoader::load_plugins(plugins_folder, &registry, cancel).await?;

    info!("available gatherers: {}", registry.inspect_gatherers().join(", "));
    Ok((registry, plugins))
}

pub fn discovery_publishers(
    config: &AgentConfig,
    collector: Arc<dyn Collector>,
    executor: Arc<dyn CommandExecutor>,
    http: reqwest::Client,
) -> DiscoveryPublishers {
    let discoveries: Vec<Arc<dyn Discovery>> = vec![
        Arc::new(ClusterDiscovery::new(executor.clone(), ClusterPaths::default())),
        Arc::new(SapSystemDiscovery::new(Path::new(SAP_INSTALLATION_PATH))),
        Arc::new(CloudDiscovery::new(executor.clone(), http)),
        Arc::new(SubscriptionDiscovery::new(executor.clone())),
        Arc::new(HostDiscovery::new(
            executor.clone(),
            config.instance_name.clone(),
            config.ssh_address.clone(),
            config.prometheus_config.clone(),
        )),
        Arc::new(SaptuneDiscovery::new(executor)),
    ];

    discoveries
        .into_iter()
        .map(|discovery| {
            let kind = discovery.kind();
            let interval = interval_for(config, kind);
            let publisher = DiscoveryPublisher::new(discovery, collector.clone(), interval);
            (kind, Arc::new(publisher))
        })
        .collect()
}

fn interval_for(config: &AgentConfig, kind: DiscoveryKind) -> Duration {
    config
        .discovery_intervals
        .get(&kind)
        .copied()
        .unwrap_or_else(|| kind.default_interval())
}

/// Builds the agent from its configuration and runs it until `cancel` fires.
pub async fn start(config: AgentConfig, cancel: CancellationToken) -> Result<(), AgentError> {
    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(AgentError::HttpClientError)?;
    let executor: Arc<dyn CommandExecutor> = Arc::new(TokioCommandExecutor::default());

    let (registry, plugins) = load_gatherers(executor.clone(), &config.plugins_folder, &cancel).await?;

    let collector: Arc<dyn Collector> = Arc::new(CollectorClient::new(
        config.collector_config.clone(),
        http.clone(),
    ));
    let publishers = discovery_publishers(&config, collector.clone(), executor, http);

    let facts_service_url = config
        .facts_service_url
        .clone()
        .filter(|_| config.facts_engine_enabled);

    let agent = Agent::new(
        &config.collector_config.agent_id,
        collector,
        publishers,
        registry,
        facts_service_url,
    );

    let result = agent.run(cancel).await;
    plugins.shutdown();
    result
}
