use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicCancelArguments, BasicConsumeArguments, BasicPublishArguments, Channel,
        QueueBindArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
    BasicProperties,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use super::cloud_event::JSON_CONTENT_TYPE;
use super::policy::EventsPolicy;
use super::rabbitmq_consumer::RabbitMqConsumer;

const CONNECTION_ATTEMPTS: u32 = 5;
const CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("invalid message broker url {0}: {1}")]
    UrlError(String, String),
    #[error("could not connect to the message broker at {0}: {1}")]
    ConnectionError(String, String),
    #[error("message broker channel error: {0}")]
    ChannelError(String),
    #[error("connection to the message broker at {0} lost")]
    ConnectionLost(String),
    #[error("could not publish to exchange {0} with routing key {1}: {2}")]
    PublishError(String, String, String),
}

/// Where a listener consumes from. The queue is declared durable and
/// auto-delete and bound to an existing topic exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerSettings {
    pub service_url: String,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), MessagingError>;
}

/// Publishes persistent, mandatory JSON messages to one exchange on a
/// dedicated channel.
#[derive(Clone)]
pub struct RabbitMqPublisher {
    channel: Channel,
    exchange: String,
}

#[async_trait::async_trait]
impl Publisher for RabbitMqPublisher {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), MessagingError> {
        let properties = BasicProperties::default()
            .with_content_type(JSON_CONTENT_TYPE)
            .with_persistence(true)
            .finish();
        let args = BasicPublishArguments::new(&self.exchange, routing_key)
            .mandatory(true)
            .finish();

        self.channel
            .basic_publish(properties, body, args)
            .await
            .map_err(|err| {
                MessagingError::PublishError(
                    self.exchange.clone(),
                    routing_key.to_owned(),
                    err.to_string(),
                )
            })
    }
}

pub struct RabbitMqAdapter {
    connection: Connection,
    consumer_channel: Channel,
    publisher: RabbitMqPublisher,
    settings: ListenerSettings,
    in_flight: Arc<RwLock<()>>,
    consumer_tag: Option<String>,
}

impl RabbitMqAdapter {
    pub async fn connect(settings: &ListenerSettings) -> Result<RabbitMqAdapter, MessagingError> {
        let broker = redact_url(&settings.service_url);
        let args = OpenConnectionArguments::try_from(settings.service_url.as_str())
            .map_err(|err| MessagingError::UrlError(broker.clone(), err.to_string()))?;

        let connection = Connection::open(&args)
            .await
            .map_err(|err| MessagingError::ConnectionError(broker.clone(), err.to_string()))?;
        connection
            .register_callback(DefaultConnectionCallback)
            .await
            .map_err(|err| MessagingError::ConnectionError(broker.clone(), err.to_string()))?;

        let consumer_channel = open_channel(&connection).await?;
        let publisher_channel = open_channel(&connection).await?;

        let queue_args = QueueDeclareArguments::new(&settings.queue)
            .durable(true)
            .auto_delete(true)
            .finish();
        consumer_channel
            .queue_declare(queue_args)
            .await
            .map_err(|err| MessagingError::ChannelError(err.to_string()))?;

        consumer_channel
            .queue_bind(QueueBindArguments::new(
                &settings.queue,
                &settings.exchange,
                &settings.routing_key,
            ))
            .await
            .map_err(|err| MessagingError::ChannelError(err.to_string()))?;

        info!(
            "connected to {}, queue {} bound to {} with key {}",
            broker, settings.queue, settings.exchange, settings.routing_key
        );

        Ok(RabbitMqAdapter {
            connection,
            consumer_channel,
            publisher: RabbitMqPublisher {
                channel: publisher_channel,
                exchange: settings.exchange.clone(),
            },
            settings: settings.clone(),
            in_flight: Arc::new(RwLock::new(())),
            consumer_tag: None,
        })
    }

    pub fn publisher(&self) -> RabbitMqPublisher {
        self.publisher.clone()
    }

    /// Delivers messages to `policy` until `cancel` fires (`Ok`) or the
    /// connection breaks (`ConnectionLost`).
    pub async fn listen(
        &mut self,
        policy: Arc<dyn EventsPolicy>,
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let consumer_name = format!("{}.consumer", self.settings.queue);
        let args = BasicConsumeArguments::new(&self.settings.queue, &consumer_name)
            .manual_ack(true)
            .finish();

        let consumer_tag = self
            .consumer_channel
            .basic_consume(RabbitMqConsumer::new(policy, self.in_flight.clone()), args)
            .await
            .map_err(|err| MessagingError::ChannelError(err.to_string()))?;
        self.consumer_tag = Some(consumer_tag);

        debug!("consuming from {}", self.settings.queue);

        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = self.connection.listen_network_io_failure() => {
                Err(MessagingError::ConnectionLost(redact_url(&self.settings.service_url)))
            }
        }
    }

    /// Stops consuming, waits for the in-flight delivery and closes the
    /// channels and the connection.
    pub async fn unsubscribe(self) -> Result<(), MessagingError> {
        if let Some(consumer_tag) = &self.consumer_tag {
            self.consumer_channel
                .basic_cancel(BasicCancelArguments::new(consumer_tag))
                .await
                .map_err(|err| MessagingError::ChannelError(err.to_string()))?;
        }

        let _drained = self.in_flight.write().await;

        self.consumer_channel
            .close()
            .await
            .map_err(|err| MessagingError::ChannelError(err.to_string()))?;
        self.publisher
            .channel
            .close()
            .await
            .map_err(|err| MessagingError::ChannelError(err.to_string()))?;
        self.connection
            .close()
            .await
            .map_err(|err| MessagingError::ChannelError(err.to_string()))?;

        info!("unsubscribed from {}", self.settings.queue);
        Ok(())
    }
}

async fn open_channel(connection: &Connection) -> Result<Channel, MessagingError> {
    let channel = connection
        .open_channel(None)
        .await
        .map_err(|err| MessagingError::ChannelError(err.to_string()))?;
    channel
        .register_callback(DefaultChannelCallback)
        .await
        .map_err(|err| MessagingError::ChannelError(err.to_string()))?;
    Ok(channel)
}

/// Connects with a bounded number of attempts. Returns `None` when cancelled
/// while waiting.
async fn connect_with_retries(
    settings: &ListenerSettings,
    cancel: &CancellationToken,
) -> Result<Option<RabbitMqAdapter>, MessagingError> {
    let mut attempt = 1;
    loop {
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            connection = RabbitMqAdapter::connect(settings) => connection,
        };

        match connection {
            Ok(adapter) => return Ok(Some(adapter)),
            Err(err @ MessagingError::UrlError(_, _)) => return Err(err),
            Err(err) if attempt >= CONNECTION_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(
                    "connection attempt {}/{} failed: {}, retrying in {:?}",
                    attempt, CONNECTION_ATTEMPTS, err, CONNECTION_RETRY_DELAY
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(CONNECTION_RETRY_DELAY) => {}
        }
        attempt += 1;
    }
}

/// Runs a consumer until cancelled, reconnecting when the connection drops.
/// `make_policy` builds the handler, given a publisher on the same exchange.
/// Fails when the broker stays unreachable.
pub async fn run_listener<F>(
    settings: ListenerSettings,
    cancel: CancellationToken,
    make_policy: F,
) -> Result<(), MessagingError>
where
    F: Fn(Arc<dyn Publisher>) -> Arc<dyn EventsPolicy>,
{
    loop {
        let mut adapter = match connect_with_retries(&settings, &cancel).await? {
            Some(adapter) => adapter,
            None => return Ok(()),
        };

        let policy = make_policy(Arc::new(adapter.publisher()));

        match adapter.listen(policy, &cancel).await {
            Ok(()) => return adapter.unsubscribe().await,
            Err(MessagingError::ConnectionLost(broker)) => {
                warn!("connection to {} lost, reconnecting", broker);
            }
            Err(err) => {
                if let Err(unsubscribe_err) = adapter.unsubscribe().await {
                    warn!("could not unsubscribe from {}: {}", settings.queue, unsubscribe_err);
                }
                return Err(err);
            }
        }
    }
}

/// Drops credentials from an amqp url so it can be logged.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_owned(),
    }
}
