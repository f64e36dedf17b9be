mod cloud_event;
mod contracts;
mod policy;
mod rabbitmq_adapter;
mod rabbitmq_consumer;

pub(crate) use cloud_event::{decode_event, encode_event, CloudEvent};
pub(crate) use contracts::*;
#[cfg(test)]
pub(crate) use policy::MockEventsPolicy;
pub(crate) use policy::EventsPolicy;
#[cfg(test)]
pub(crate) use rabbitmq_adapter::MockPublisher;
pub(crate) use rabbitmq_adapter::{run_listener, ListenerSettings, MessagingError, Publisher};

pub const DISCOVERIES_EXCHANGE: &str = "trento.discoveries";
pub const DISCOVERIES_ROUTING_KEY: &str = "agents";
pub const CHECKS_EXCHANGE: &str = "trento.checks";
pub const CHECKS_EXECUTIONS_QUEUE: &str = "trento.checks.executions";
pub const CHECKS_EXECUTIONS_ROUTING_KEY: &str = "executions";
pub const CHECKS_REPLIES_ROUTING_KEY: &str = "agents";

pub fn discoveries_listener_settings(service_url: &str, agent_id: &str) -> ListenerSettings {
    ListenerSettings {
        service_url: service_url.to_owned(),
        queue: format!("{}.agents.{}", DISCOVERIES_EXCHANGE, agent_id),
        exchange: DISCOVERIES_EXCHANGE.to_owned(),
        routing_key: DISCOVERIES_ROUTING_KEY.to_owned(),
    }
}

pub fn facts_listener_settings(service_url: &str) -> ListenerSettings {
    ListenerSettings {
        service_url: service_url.to_owned(),
        queue: CHECKS_EXECUTIONS_QUEUE.to_owned(),
        exchange: CHECKS_EXCHANGE.to_owned(),
        routing_key: CHECKS_EXECUTIONS_ROUTING_KEY.to_owned(),
    }
}
