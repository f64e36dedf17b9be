use crate::events::policy::EventsPolicy;
use amqprs::{
    channel::{BasicAckArguments, BasicNackArguments, Channel},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use log::{debug, error};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Feeds deliveries to an [`EventsPolicy`] one at a time, acking on success
/// and rejecting without requeue on failure.
pub struct RabbitMqConsumer {
    policy: Arc<dyn EventsPolicy>,
    in_flight: Arc<RwLock<()>>,
}

impl RabbitMqConsumer {
    pub fn new(policy: Arc<dyn EventsPolicy>, in_flight: Arc<RwLock<()>>) -> RabbitMqConsumer {
        RabbitMqConsumer { policy, in_flight }
    }
}

#[async_trait::async_trait]
impl AsyncConsumer for RabbitMqConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let _in_flight = self.in_flight.read().await;
        debug!("consume delivery {} on channel {}", deliver, channel);

        let outcome = self
            .policy
            .handle_event(deliver.routing_key(), &content)
            .await;

        match outcome {
            Ok(_) => {
                debug!("processed event {} - {}", deliver, channel);
                if let Err(err) = channel
                    .basic_ack(BasicAckArguments::new(deliver.delivery_tag(), false))
                    .await
                {
                    error!("unable to ack rabbitmq message {}: {}", deliver, err);
                }
            }
            Err(err) => {
                error!("error during event processing {}", err);
                if let Err(err) = channel
                    .basic_nack(BasicNackArguments::new(deliver.delivery_tag(), false, false))
                    .await
                {
                    error!("unable to nack rabbitmq message {}: {}", deliver, err);
                }
            }
        }
    }
}
