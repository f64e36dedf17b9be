use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::events::{
    decode_event, encode_event, EventsPolicy, FactsGathered, FactsGatheringRequested, Publisher,
    CHECKS_REPLIES_ROUTING_KEY, FACTS_GATHERED_EVENT_TYPE, FACTS_GATHERING_REQUESTED_EVENT_TYPE,
};
use crate::gatherers::{
    FactGatheringError, FactRequest, FactsGatheringRequest, GatheredFact, Gatherer,
    GatherersRegistry, GATHERER_EXECUTION_ERROR,
};

/// Gatherer groups running at the same time, per cpu.
const GATHERERS_PER_CPU: usize = 4;

fn max_concurrent_gatherers() -> usize {
    std::thread::available_parallelism()
        .map(|cpus| cpus.get())
        .unwrap_or(1)
        * GATHERERS_PER_CPU
}

/// Answers `FactsGatheringRequested` events addressed to this agent with a
/// `FactsGathered` reply.
pub struct FactsEnginePolicy {
    agent_id: String,
    registry: Arc<GatherersRegistry>,
    publisher: Arc<dyn Publisher>,
}

impl FactsEnginePolicy {
    pub fn new(
        agent_id: &str,
        registry: Arc<GatherersRegistry>,
        publisher: Arc<dyn Publisher>,
    ) -> FactsEnginePolicy {
        FactsEnginePolicy {
            agent_id: agent_id.to_owned(),
            registry,
            publisher,
        }
    }
}

#[async_trait::async_trait]
impl EventsPolicy for FactsEnginePolicy {
    async fn handle_event(&self, routing_key: &str, raw_event: &[u8]) -> Result<()> {
        let event = decode_event(raw_event)?;

        if event.is_expired(Utc::now()) {
            warn!("event {} ({}) expired, skipping", event.id, event.event_type);
            return Ok(());
        }

        if event.event_type != FACTS_GATHERING_REQUESTED_EVENT_TYPE {
            warn!(
                "unrecognized event type {} on {}, skipping",
                event.event_type, routing_key
            );
            return Ok(());
        }

        let requested: FactsGatheringRequested = event.data_as()?;
        let request = match requested.for_agent(&self.agent_id) {
            Some(request) => request,
            None => {
                debug!(
                    "execution {} does not target this agent, skipping",
                    requested.execution_id
                );
                return Ok(());
            }
        };

        info!(
            "Facts gathering requested event: execution_id {}, group_id {}, {} facts",
            request.execution_id,
            request.group_id,
            request.fact_requests.len()
        );

        let execution_id = request.execution_id.clone();
        let reply = gather_facts(&self.registry, &self.agent_id, request).await;
        let body = encode_event(FACTS_GATHERED_EVENT_TYPE, &reply)?;

        self.publisher
            .publish(CHECKS_REPLIES_ROUTING_KEY, body)
            .await?;

        info!("facts for execution {} published", execution_id);
        Ok(())
    }
}

/// Runs every request of the batch and returns one fact per request, in
/// request order. Requests are grouped by gatherer; each group is a single
/// call and groups run concurrently.
pub async fn gather_facts(
    registry: &GatherersRegistry,
    agent_id: &str,
    request: FactsGatheringRequest,
) -> FactsGathered {
    let mut facts: Vec<Option<GatheredFact>> = vec![None; request.fact_requests.len()];
    let semaphore = Arc::new(Semaphore::new(max_concurrent_gatherers()));
    let mut groups = JoinSet::new();

    for (gatherer_name, requests) in request.facts_requests_by_gatherer() {
        let gatherer = match registry.resolve(&gatherer_name) {
            Some(gatherer) => gatherer,
            None => {
                warn!("gatherer {} not found", gatherer_name);
                let error = FactGatheringError::gatherer_not_found(&gatherer_name);
                for (index, request) in requests {
                    facts[index] = Some(GatheredFact::with_error(&request, error.clone()));
                }
                continue;
            }
        };

        let semaphore = semaphore.clone();
        groups.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let gathered = run_gatherer(gatherer, &gatherer_name, &requests).await;
            requests
                .into_iter()
                .map(|(index, _)| index)
                .zip(gathered)
                .collect::<Vec<(usize, GatheredFact)>>()
        });
    }

    while let Some(group) = groups.join_next().await {
        match group {
            Ok(gathered) => {
                for (index, fact) in gathered {
                    facts[index] = Some(fact);
                }
            }
            Err(err) => error!("gathering task failed: {}", err),
        }
    }

    let facts = facts
        .into_iter()
        .zip(request.fact_requests.iter())
        .map(|(fact, request)| {
            fact.unwrap_or_else(|| {
                GatheredFact::with_error(
                    request,
                    FactGatheringError::new(GATHERER_EXECUTION_ERROR, "no fact was gathered"),
                )
            })
        })
        .collect();

    FactsGathered {
        execution_id: request.execution_id,
        agent_id: agent_id.to_owned(),
        group_id: request.group_id,
        facts,
    }
}

/// One call to `gatherer` for the whole group. A gatherer that fails, panics
/// or does not answer each request exactly once turns every fact of the
/// group into an error.
async fn run_gatherer(
    gatherer: Arc<dyn Gatherer>,
    gatherer_name: &str,
    requests: &[(usize, FactRequest)],
) -> Vec<GatheredFact> {
    let batch: Vec<FactRequest> = requests.iter().map(|(_, request)| request.clone()).collect();
    let expected = batch.len();

    let error = match tokio::spawn(async move { gatherer.gather(batch).await }).await {
        Ok(Ok(facts)) if facts.len() == expected => return facts,
        Ok(Ok(facts)) => FactGatheringError::new(
            GATHERER_EXECUTION_ERROR,
            format!(
                "gatherer {} returned {} facts for {} requests",
                gatherer_name,
                facts.len(),
                expected
            ),
        ),
        Ok(Err(err)) => err,
        Err(err) => FactGatheringError::new(
            GATHERER_EXECUTION_ERROR,
            format!("gatherer {} crashed: {}", gatherer_name, err),
        ),
    };

    error!("gatherer {} failed: {}", gatherer_name, error);

    requests
        .iter()
        .map(|(_, request)| GatheredFact::with_error(request, error.clone()))
        .collect()
}
