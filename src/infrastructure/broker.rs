use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::infrastructure::metrics::IngestMetrics;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
    pub prefetch: u16, // max unacknowledged deliveries per channel
    pub consumer_tag: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange: "balance_exchange".to_string(),
            queue: "balance_updates".to_string(),
            routing_key: "balance_updates".to_string(),
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
            prefetch: 50,
            consumer_tag: "balance-ingest".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn amqp_uri(&self) -> String {
        let vhost = match self.vhost.trim_start_matches('/') {
            "" => "%2f".to_string(),
            name => name.replace('/', "%2f"),
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP {context} failed: {source}")]
    Amqp {
        context: &'static str,
        #[source]
        source: lapin::Error,
    },
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("no open broker session")]
    NotConnected,
    #[error("gave up reconnecting to the broker after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl BrokerError {
    fn amqp(context: &'static str) -> impl FnOnce(lapin::Error) -> Self {
        move |source| BrokerError::Amqp { context, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject { requeue: bool },
}

/// Broker-side acknowledgement for a single delivery.
#[async_trait]
pub trait DeliveryHandle: Send + Sync {
    async fn settle(&self, settlement: Settlement) -> Result<(), BrokerError>;
}

/// A message taken off the queue. Settling consumes it, so each delivery is
/// acked or rejected at most once.
pub struct Delivery {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    handle: Box<dyn DeliveryHandle>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        handle: Box<dyn DeliveryHandle>,
    ) -> Self {
        Self {
            body,
            delivery_tag,
            redelivered,
            handle,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.handle.settle(Settlement::Ack).await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.handle.settle(Settlement::Reject { requeue }).await
    }

    pub async fn settle(self, settlement: Settlement) -> Result<(), BrokerError> {
        self.handle.settle(settlement).await
    }
}

/// Settles `delivery` and records the outcome. A failed settlement is logged
/// and counted; the broker redelivers anything left unacknowledged when the
/// channel goes away.
pub async fn settle(delivery: Delivery, settlement: Settlement, metrics: &IngestMetrics) {
    let tag = delivery.delivery_tag;
    match delivery.settle(settlement).await {
        Ok(()) => match settlement {
            Settlement::Ack => IngestMetrics::incr(&metrics.acks),
            Settlement::Reject { requeue: true } => IngestMetrics::incr(&metrics.rejects_requeued),
            Settlement::Reject { requeue: false } => IngestMetrics::incr(&metrics.rejects_dropped),
        },
        Err(e) => {
            IngestMetrics::incr(&metrics.settle_errors);
            warn!(delivery_tag = tag, "failed to settle delivery ({:?}): {}", settlement, e);
        }
    }
}

/// Graceful-stop hooks of an open session.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    /// Stops new deliveries; already delivered messages can still be settled.
    async fn stop_consuming(&self) -> Result<(), BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}

/// One live connection's worth of consumption.
pub struct BrokerSession {
    deliveries: mpsc::Receiver<Delivery>,
    lost: CancellationToken,
    closer: Box<dyn SessionCloser>,
}

impl BrokerSession {
    /// `lost` must be cancelled by the transport when the connection dies
    /// without being asked to.
    pub fn new(
        deliveries: mpsc::Receiver<Delivery>,
        lost: CancellationToken,
        closer: Box<dyn SessionCloser>,
    ) -> Self {
        Self {
            deliveries,
            lost,
            closer,
        }
    }

    pub fn split(self) -> (mpsc::Receiver<Delivery>, SessionHandle) {
        (
            self.deliveries,
            SessionHandle {
                lost: self.lost,
                closer: self.closer,
            },
        )
    }
}

pub struct SessionHandle {
    lost: CancellationToken,
    closer: Box<dyn SessionCloser>,
}

impl SessionHandle {
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub async fn stop_consuming(&self) -> Result<(), BrokerError> {
        self.closer.stop_consuming().await
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.closer.close().await
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Connects, declares the topology and starts consuming.
    async fn open(&self) -> Result<BrokerSession, BrokerError>;
}

/// RabbitMQ transport over `lapin`.
pub struct AmqpTransport {
    config: BrokerConfig,
}

impl AmqpTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<(), BrokerError> {
        let config = &self.config;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                durable_exchange(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::amqp("exchange declare"))?;

        let mut arguments = FieldTable::default();
        if let Some(dlx) = &config.dead_letter_exchange {
            channel
                .exchange_declare(dlx, ExchangeKind::Direct, durable_exchange(), FieldTable::default())
                .await
                .map_err(BrokerError::amqp("dead-letter exchange declare"))?;
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.clone().into()),
            );

            if let Some(dlq) = &config.dead_letter_routing_key {
                channel
                    .queue_declare(dlq, durable_queue(), FieldTable::default())
                    .await
                    .map_err(BrokerError::amqp("dead-letter queue declare"))?;
                channel
                    .queue_bind(dlq, dlx, dlq, QueueBindOptions::default(), FieldTable::default())
                    .await
                    .map_err(BrokerError::amqp("dead-letter queue bind"))?;
            }
        }
        if let Some(routing_key) = &config.dead_letter_routing_key {
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(routing_key.clone().into()),
            );
        }
        if let Some(ttl) = config.message_ttl {
            let millis = i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX);
            arguments.insert("x-message-ttl".into(), AMQPValue::LongInt(millis));
        }

        channel
            .queue_declare(&config.queue, durable_queue(), arguments)
            .await
            .map_err(BrokerError::amqp("queue declare"))?;
        channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                &config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::amqp("queue bind"))?;

        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn open(&self) -> Result<BrokerSession, BrokerError> {
        let config = &self.config;
        info!(
            "🔌 Connecting to RabbitMQ at {}:{} (vhost {})",
            config.host, config.port, config.vhost
        );

        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(BrokerError::amqp("connect"))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::amqp("channel open"))?;

        self.declare_topology(&channel).await?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(BrokerError::amqp("basic.qos"))?;
        let consumer = channel
            .basic_consume(
                &config.queue,
                &config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::amqp("basic.consume"))?;

        let lost = CancellationToken::new();
        let closing = CancellationToken::new();
        {
            let lost = lost.clone();
            let closing = closing.clone();
            connection.on_error(move |err| {
                if !closing.is_cancelled() {
                    error!("RabbitMQ connection error: {}", err);
                    lost.cancel();
                }
            });
        }

        let (tx, rx) = mpsc::channel(usize::from(config.prefetch.max(1)));
        tokio::spawn(pump_deliveries(consumer, tx, lost.clone(), closing.clone()));

        info!(
            "✅ Consuming from queue '{}' (prefetch {})",
            config.queue, config.prefetch
        );

        Ok(BrokerSession::new(
            rx,
            lost,
            Box::new(AmqpSessionCloser {
                connection,
                channel,
                consumer_tag: config.consumer_tag.clone(),
                closing,
            }),
        ))
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

async fn pump_deliveries(
    mut consumer: Consumer,
    tx: mpsc::Sender<Delivery>,
    lost: CancellationToken,
    closing: CancellationToken,
) {
    while let Some(next) = consumer.next().await {
        match next {
            Ok(delivery) => {
                let lapin::message::Delivery {
                    delivery_tag,
                    redelivered,
                    data,
                    acker,
                    ..
                } = delivery;
                let delivery = Delivery::new(
                    data,
                    delivery_tag,
                    redelivered,
                    Box::new(AmqpDeliveryHandle { acker }),
                );
                if tx.send(delivery).await.is_err() {
                    debug!("delivery receiver dropped, pump exiting");
                    return;
                }
            }
            Err(e) => {
                if !closing.is_cancelled() {
                    error!("consumer stream failed: {}", e);
                    lost.cancel();
                }
                return;
            }
        }
    }

    if !closing.is_cancelled() {
        warn!("consumer stream ended unexpectedly");
        lost.cancel();
    }
}

struct AmqpDeliveryHandle {
    acker: Acker,
}

#[async_trait]
impl DeliveryHandle for AmqpDeliveryHandle {
    async fn settle(&self, settlement: Settlement) -> Result<(), BrokerError> {
        match settlement {
            Settlement::Ack => self
                .acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(BrokerError::amqp("basic.ack")),
            Settlement::Reject { requeue } => self
                .acker
                .reject(BasicRejectOptions { requeue })
                .await
                .map_err(BrokerError::amqp("basic.reject")),
        }
    }
}

struct AmqpSessionCloser {
    connection: Connection,
    channel: Channel,
    consumer_tag: String,
    closing: CancellationToken,
}

#[async_trait]
impl SessionCloser for AmqpSessionCloser {
    async fn stop_consuming(&self) -> Result<(), BrokerError> {
        self.closing.cancel();
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(BrokerError::amqp("basic.cancel"))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closing.cancel();
        if self.channel.status().connected() {
            self.channel
                .close(200, "OK")
                .await
                .map_err(BrokerError::amqp("channel close"))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "OK")
                .await
                .map_err(BrokerError::amqp("connection close"))?;
        }
        Ok(())
    }
}
