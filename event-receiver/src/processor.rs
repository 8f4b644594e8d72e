use std::sync::Arc;

use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::statistics::Statistics;
use rdkafka::{ClientConfig, ClientContext, TopicPartitionList};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ProcessorSettings};
use crate::error::ReceiverError;
use crate::health::{ComponentStatus, HealthHandle};
use crate::listener::{EventHandler, PartitionEvent};
use crate::metrics::{ASSIGNED_PARTITIONS, CONSUMER_QUEUE_DEPTH};

/// SASL user name event hubs expects when the password is a connection string.
const CONNECTION_STRING_SASL_USERNAME: &str = "$ConnectionString";

/// Client context wiring librdkafka callbacks to the event handler and liveness.
pub struct ReceiverContext {
    handler: Arc<dyn EventHandler>,
    liveness: HealthHandle,
}

impl ClientContext for ReceiverContext {
    fn stats(&self, stats: Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();

        metrics::gauge!(CONSUMER_QUEUE_DEPTH).set(stats.replyq as f64);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        debug!("librdkafka client error: {}", reason);
        self.handler.process_error(None, &error);
    }
}

impl ConsumerContext for ReceiverContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                for partition in partitions.elements() {
                    info!(
                        event_hub = partition.topic(),
                        partition_id = partition.partition(),
                        "closing partition"
                    );
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => self.handler.process_error(None, e),
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            for partition in partitions.elements() {
                info!(
                    event_hub = partition.topic(),
                    partition_id = partition.partition(),
                    "initializing partition"
                );
            }
        }

        if let Ok(assignment) = base_consumer.assignment() {
            metrics::gauge!(ASSIGNED_PARTITIONS).set(assignment.count() as f64);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("checkpointed offsets for {} partitions", offsets.count()),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!("failed to checkpoint offsets: {}", e),
        }
    }
}

/// Opens subscriptions against an event hub through its Kafka-compatible endpoint.
/// Partition ownership and balancing are left to the consumer group protocol,
/// checkpoints are the group's committed offsets.
pub struct EventProcessor;

impl EventProcessor {
    /// Validate `config` and start delivering events to `handler`.
    pub fn start<H>(
        config: &Config,
        handler: Arc<H>,
        liveness: HealthHandle,
    ) -> Result<Subscription, ReceiverError>
    where
        H: EventHandler + 'static,
    {
        let settings = config.processor_settings()?;
        Self::start_with_settings(&settings, handler, liveness)
    }

    pub fn start_with_settings<H>(
        settings: &ProcessorSettings,
        handler: Arc<H>,
        liveness: HealthHandle,
    ) -> Result<Subscription, ReceiverError>
    where
        H: EventHandler + 'static,
    {
        let handler: Arc<dyn EventHandler> = handler;
        let context = ReceiverContext {
            handler: handler.clone(),
            liveness: liveness.clone(),
        };

        let consumer: StreamConsumer<ReceiverContext> =
            client_config(settings).create_with_context(context)?;
        consumer.subscribe(&[settings.event_hub_name.as_str()])?;

        info!(
            namespace = settings.namespace.fully_qualified_namespace(),
            key_name = settings.namespace.shared_access_key_name().unwrap_or("sas"),
            bootstrap_servers = %settings.bootstrap_servers,
            event_hub = %settings.event_hub_name,
            consumer_group = %settings.consumer_group,
            checkpoint_container = settings.checkpoint_store.container(),
            checkpoint_store = %settings.checkpoint_store.container_url(),
            "subscribed to event hub"
        );

        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        let task = tokio::spawn(consume_loop(
            consumer,
            handler,
            shutdown.clone(),
            closed.clone(),
            liveness,
        ));

        Ok(Subscription {
            event_hub_name: settings.event_hub_name.clone(),
            shutdown,
            closed,
            task,
        })
    }
}

fn client_config(settings: &ProcessorSettings) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &settings.bootstrap_servers)
        .set("group.id", &settings.consumer_group)
        .set("statistics.interval.ms", "10000")
        .set("session.timeout.ms", "30000")
        .set("auto.offset.reset", &settings.offset_reset)
        .set("enable.auto.commit", "true")
        .set(
            "auto.commit.interval.ms",
            settings.auto_commit_interval_ms.to_string(),
        )
        // only checkpoint messages the handler has seen
        .set("enable.auto.offset.store", "false");

    if settings.tls {
        client_config
            .set("security.protocol", "sasl_ssl")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", CONNECTION_STRING_SASL_USERNAME)
            .set("sasl.password", settings.namespace.expose_secret());
    }

    client_config
}

/// An open subscription. Events keep flowing to the handler until `stop` is called
/// or the client hits a fatal error.
pub struct Subscription {
    event_hub_name: String,
    shutdown: CancellationToken,
    closed: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn event_hub_name(&self) -> &str {
        &self.event_hub_name
    }

    /// True once the delivery loop has exited.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves once the delivery loop has exited and checkpointed, whether
    /// through `stop` or a fatal client error.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Stop delivering events, checkpoint what was consumed and leave the consumer group.
    pub async fn stop(self) -> Result<(), ReceiverError> {
        info!(event_hub = %self.event_hub_name, "stopping subscription");
        self.shutdown.cancel();
        self.task.await?;
        info!(event_hub = %self.event_hub_name, "subscription closed");
        Ok(())
    }
}

enum Delivery {
    Continue,
    Fatal,
}

async fn consume_loop(
    consumer: StreamConsumer<ReceiverContext>,
    handler: Arc<dyn EventHandler>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    liveness: HealthHandle,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = consumer.recv() => dispatch(&consumer, handler.as_ref(), received),
        };

        if let Delivery::Fatal = delivery {
            liveness.report_status(ComponentStatus::Unhealthy).await;
            break;
        }
    }

    // The final commit is synchronous
    if let Err(e) = tokio::task::spawn_blocking(move || close(&consumer)).await {
        warn!("failed to close consumer: {}", e);
    }
    closed.cancel();
}

fn dispatch(
    consumer: &StreamConsumer<ReceiverContext>,
    handler: &dyn EventHandler,
    received: KafkaResult<BorrowedMessage<'_>>,
) -> Delivery {
    match received {
        Ok(message) => {
            handler.process_event(PartitionEvent {
                partition_id: message.partition(),
                offset: message.offset(),
                body: message.payload(),
            });

            if let Err(e) = consumer.store_offset_from_message(&message) {
                handler.process_error(Some(message.partition()), &e);
            }
            Delivery::Continue
        }
        Err(e) => {
            let partition_id = match &e {
                KafkaError::PartitionEOF(partition) => Some(*partition),
                _ => None,
            };
            handler.process_error(partition_id, &e);

            match e {
                KafkaError::MessageConsumptionFatal(_) | KafkaError::Canceled => Delivery::Fatal,
                _ => Delivery::Continue,
            }
        }
    }
}

fn close(consumer: &StreamConsumer<ReceiverContext>) {
    match consumer.commit_consumer_state(CommitMode::Sync) {
        Ok(()) => info!("checkpointed consumed offsets"),
        Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
            debug!("no new offsets to checkpoint")
        }
        Err(e) => warn!("failed to checkpoint offsets on shutdown: {}", e),
    }
    consumer.unsubscribe();
}
