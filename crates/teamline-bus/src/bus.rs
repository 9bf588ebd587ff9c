//! # Event Bus
//!
//! Composes the subscription registry, the connection manager, and the
//! broker port into the publish and consume/dispatch paths.
//!
//! ```text
//!  business code ──publish()──→ [EventBus] ──short-lived channel──→ exchange
//!                                                                      │
//!                                                              routing key match
//!                                                                      │
//!  handlers ←──dispatch loop←──long-lived channel←── queue ←───────────┘
//! ```
//!
//! Publish is fire-and-forget: when the broker is down the event is
//! logged and dropped, and transient publish faults are retried with the
//! same backoff schedule the connection manager uses. Dispatch settles
//! every delivery exactly once: ack on success (or on drops that cannot
//! be repaired by redelivery), nack+requeue when any handler fails.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use teamline_events::{default_routing_key, Envelope, IntegrationEvent, CONTENT_TYPE_JSON};

use crate::broker::{Broker, BrokerChannel, Delivery, DeliveryStream, MessageProperties};
use crate::config::BusConfig;
use crate::connection::ConnectionManager;
use crate::error::{BrokerError, ConsumeError, DispatchError, PublishError, SubscribeError};
use crate::handler::{erase_dynamic, erase_typed, DynamicEventHandler, EventHandler, HandlerId};
use crate::registry::{HandlerKind, Subscription, SubscriptionRegistry};
use crate::stats::{BusStatistics, StatsSnapshot};

/// routing key ↔ event name mapping built from subscriptions.
#[derive(Default)]
struct RouteTable {
    by_key: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

struct ConsumerHandle {
    channel: Arc<dyn BrokerChannel>,
    task: JoinHandle<()>,
}

/// The integration event bus for one service instance.
///
/// Owns its subscription registry and connection manager; independent
/// instances share nothing.
pub struct EventBus {
    config: BusConfig,
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    routes: Arc<Mutex<RouteTable>>,
    consumer: Mutex<Option<ConsumerHandle>>,
    stats: Arc<BusStatistics>,
}

impl EventBus {
    /// A bus for the given broker endpoint and configuration.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: BusConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.set_removal_hook(Box::new(|event_name| {
            debug!(event_name, "Last handler removed, event no longer tracked");
        }));

        let connection = ConnectionManager::new(broker, config.retry.clone());
        Self {
            config,
            connection,
            registry,
            routes: Arc::new(Mutex::new(RouteTable::default())),
            consumer: Mutex::new(None),
            stats: Arc::new(BusStatistics::default()),
        }
    }

    /// The connection manager owning the broker link.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Whether the broker link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Establish the broker link (idempotent, backoff retries).
    pub async fn try_connect(&self) -> bool {
        self.connection.try_connect().await
    }

    /// The subscription registry owned by this bus.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Lifecycle counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // =========================================================================
    // PUBLISH PATH
    // =========================================================================

    /// Publish an event under its declared routing key.
    ///
    /// Fire-and-forget: a down broker means a logged drop, never an error
    /// or a block. Success means the broker accepted the message on the
    /// channel, not a durable commit beyond the broker's own guarantees.
    ///
    /// # Errors
    ///
    /// Only on envelope construction failure (non-object or reserved-field
    /// payload), which is a programming error in the event type.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), PublishError> {
        let envelope = Envelope::publish(event, &self.config.source_service)?;
        self.publish_envelope(&envelope, E::ROUTING_KEY).await
    }

    /// Publish an event linked to an existing flow by correlation id.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_correlated<E: IntegrationEvent>(
        &self,
        event: &E,
        correlation_id: &str,
    ) -> Result<(), PublishError> {
        let envelope =
            Envelope::publish(event, &self.config.source_service)?.correlated_with(correlation_id);
        self.publish_envelope(&envelope, E::ROUTING_KEY).await
    }

    /// Publish a pre-built envelope, e.g. a replay copy from
    /// [`Envelope::with_new_id`].
    ///
    /// # Errors
    ///
    /// Only on envelope serialization failure.
    pub async fn publish_envelope(
        &self,
        envelope: &Envelope,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let body = envelope.to_wire()?;

        if !self.connection.is_connected() {
            warn!(
                event_name = %envelope.meta.event_name,
                event_id = %envelope.meta.id,
                "Not connected to broker, dropping published event"
            );
            self.stats.record_publish_dropped();
            return Ok(());
        }

        let properties = MessageProperties {
            message_id: envelope.meta.id.to_string(),
            timestamp: envelope.meta.created_at.timestamp().max(0) as u64,
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            correlation_id: envelope.meta.correlation_id.clone(),
        };

        let mut attempt = 1u32;
        loop {
            match self.publish_once(routing_key, &properties, &body).await {
                Ok(()) => {
                    debug!(
                        event_name = %envelope.meta.event_name,
                        event_id = %envelope.meta.id,
                        routing_key,
                        "Event published"
                    );
                    self.stats.record_published();
                    return Ok(());
                }
                Err(error) if self.config.retry.has_retry_after(attempt) => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        event_id = %envelope.meta.id,
                        "Publish failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    error!(
                        attempts = attempt,
                        %error,
                        event_name = %envelope.meta.event_name,
                        event_id = %envelope.meta.id,
                        "Dropping event after exhausting publish retries"
                    );
                    self.stats.record_publish_dropped();
                    return Ok(());
                }
            }
        }
    }

    /// One publish attempt over a fresh short-lived channel.
    async fn publish_once(
        &self,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let connection = self.connection.connection()?;
        let channel = connection.create_channel().await?;
        channel.declare_exchange(&self.config.exchange_spec()).await?;
        let result = channel
            .publish(
                &self.config.exchange,
                routing_key,
                properties.clone(),
                body.to_vec(),
            )
            .await;
        channel.close().await;
        result
    }

    // =========================================================================
    // SUBSCRIBE / CONSUME PATH
    // =========================================================================

    /// Register a typed handler for `E`. The factory is called once per
    /// delivered message, so handler state is never shared across
    /// messages.
    ///
    /// The first subscription for an event name binds
    /// queue↔exchange↔routing-key at the broker (idempotent on repeats).
    ///
    /// # Errors
    ///
    /// Duplicate registration of the same handler type, or a broker
    /// rejection of the binding work.
    pub async fn subscribe<E, H, F>(&self, factory: F) -> Result<(), SubscribeError>
    where
        E: IntegrationEvent,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.register(
            E::NAME,
            E::ROUTING_KEY,
            Subscription {
                handler_id: HandlerId::of::<H>(),
                kind: HandlerKind::Typed,
                invoker: erase_typed::<E, H, F>(factory),
            },
        )
        .await
    }

    /// Register a dynamic handler bound only by event-name string,
    /// receiving the raw parsed payload. Routes under the
    /// lowercased-name default key.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_dynamic<H, F>(
        &self,
        event_name: &str,
        factory: F,
    ) -> Result<(), SubscribeError>
    where
        H: DynamicEventHandler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let routing_key = default_routing_key(event_name);
        self.subscribe_dynamic_routed(event_name, &routing_key, factory)
            .await
    }

    /// [`subscribe_dynamic`](Self::subscribe_dynamic) with an explicit
    /// routing key, for events published under a hierarchical key.
    ///
    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub async fn subscribe_dynamic_routed<H, F>(
        &self,
        event_name: &str,
        routing_key: &str,
        factory: F,
    ) -> Result<(), SubscribeError>
    where
        H: DynamicEventHandler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.register(
            event_name,
            routing_key,
            Subscription {
                handler_id: HandlerId::of::<H>(),
                kind: HandlerKind::Dynamic,
                invoker: erase_dynamic(factory),
            },
        )
        .await
    }

    /// Remove a typed handler registration. Removing the last handler for
    /// an event name unbinds its routing key at the broker.
    ///
    /// # Errors
    ///
    /// When the handler is not registered for the event name.
    pub async fn unsubscribe<E, H>(&self) -> Result<(), SubscribeError>
    where
        E: IntegrationEvent,
        H: EventHandler<E> + 'static,
    {
        self.deregister(E::NAME, HandlerId::of::<H>()).await
    }

    /// Remove a dynamic handler registration.
    ///
    /// # Errors
    ///
    /// When the handler is not registered for the event name.
    pub async fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<(), SubscribeError>
    where
        H: DynamicEventHandler + 'static,
    {
        self.deregister(event_name, HandlerId::of::<H>()).await
    }

    async fn register(
        &self,
        event_name: &str,
        routing_key: &str,
        subscription: Subscription,
    ) -> Result<(), SubscribeError> {
        if !self.registry.has_subscriptions(event_name) {
            self.bind(event_name, routing_key).await?;
        }

        self.registry.add(event_name, subscription)?;
        {
            let mut routes = self.routes.lock();
            routes
                .by_key
                .insert(routing_key.to_string(), event_name.to_string());
            routes
                .by_name
                .insert(event_name.to_string(), routing_key.to_string());
        }
        info!(event_name, routing_key, "Subscribed");
        Ok(())
    }

    async fn deregister(
        &self,
        event_name: &str,
        handler_id: HandlerId,
    ) -> Result<(), SubscribeError> {
        let outcome = self.registry.remove(event_name, handler_id)?;
        info!(event_name, handler = handler_id.label(), "Unsubscribed");

        if outcome.purged {
            let routing_key = {
                let mut routes = self.routes.lock();
                routes.by_name.remove(event_name).map(|key| {
                    routes.by_key.remove(&key);
                    key
                })
            };
            if let Some(routing_key) = routing_key {
                self.unbind(event_name, &routing_key).await;
            }
        }
        Ok(())
    }

    /// Declare the topology and bind one routing key, over a short-lived
    /// channel. Skipped (deferred to `start_consuming`) when the broker
    /// is unreachable.
    async fn bind(&self, event_name: &str, routing_key: &str) -> Result<(), SubscribeError> {
        if !self.connection.try_connect().await {
            warn!(
                event_name,
                routing_key, "Broker unreachable, binding deferred until consumption starts"
            );
            return Ok(());
        }

        let connection = self.connection.connection()?;
        let channel = connection.create_channel().await?;
        channel.declare_exchange(&self.config.exchange_spec()).await?;
        channel
            .declare_exchange(&self.config.dead_letter_spec())
            .await?;
        channel.declare_queue(&self.config.queue_spec()).await?;
        channel
            .bind_queue(&self.config.queue, &self.config.exchange, routing_key)
            .await?;
        channel.close().await;
        debug!(event_name, routing_key, queue = %self.config.queue, "Routing key bound");
        Ok(())
    }

    /// Best-effort unbind; the registry is authoritative, so a down
    /// broker only means the binding lingers until the queue expires it.
    async fn unbind(&self, event_name: &str, routing_key: &str) {
        let Ok(connection) = self.connection.connection() else {
            warn!(
                event_name,
                routing_key, "Broker unreachable, binding left in place"
            );
            return;
        };

        match connection.create_channel().await {
            Ok(channel) => {
                if let Err(error) = channel
                    .unbind_queue(&self.config.queue, &self.config.exchange, routing_key)
                    .await
                {
                    warn!(%error, event_name, routing_key, "Unbind failed");
                } else {
                    info!(event_name, routing_key, "Routing key unbound");
                }
                channel.close().await;
            }
            Err(error) => {
                warn!(%error, event_name, routing_key, "Unbind failed");
            }
        }
    }

    /// Begin asynchronous delivery from the bound queue.
    ///
    /// Declares the topology, (re)binds every subscribed routing key, and
    /// spawns the dispatch task on one long-lived channel.
    ///
    /// # Errors
    ///
    /// When already consuming, or when the broker cannot be reached;
    /// consumption never starts silently.
    pub async fn start_consuming(&self) -> Result<(), ConsumeError> {
        if self.consumer.lock().is_some() {
            return Err(ConsumeError::AlreadyConsuming);
        }

        if !self.connection.try_connect().await {
            warn!("Broker unreachable, consumption not started");
            return Err(BrokerError::NotConnected.into());
        }

        let connection = self.connection.connection()?;
        let channel = connection.create_channel().await?;
        channel.declare_exchange(&self.config.exchange_spec()).await?;
        channel
            .declare_exchange(&self.config.dead_letter_spec())
            .await?;
        channel.declare_queue(&self.config.queue_spec()).await?;

        let routing_keys: Vec<String> = self.routes.lock().by_key.keys().cloned().collect();
        for routing_key in &routing_keys {
            channel
                .bind_queue(&self.config.queue, &self.config.exchange, routing_key)
                .await?;
        }

        let consumer_tag = format!("{}-{}", self.config.source_service, Uuid::new_v4());
        let stream = channel.consume(&self.config.queue, &consumer_tag).await?;

        let context = DispatchContext {
            registry: self.registry.clone(),
            routes: self.routes.clone(),
            stats: self.stats.clone(),
            channel: channel.clone(),
        };
        let task = tokio::spawn(dispatch_loop(context, stream));
        *self.consumer.lock() = Some(ConsumerHandle { channel, task });

        info!(queue = %self.config.queue, consumer_tag, "Consuming started");
        Ok(())
    }

    /// Stop delivery: closes the consumer channel (requeueing anything
    /// unsettled) and waits for the dispatch task to finish.
    pub async fn stop_consuming(&self) {
        let handle = self.consumer.lock().take();
        if let Some(ConsumerHandle { channel, task }) = handle {
            channel.close().await;
            let _ = task.await;
            info!("Consuming stopped");
        }
    }

    /// Release everything: consumer, connection (terminal), and registry.
    pub async fn shutdown(&self) {
        self.stop_consuming().await;
        self.connection.shutdown().await;
        self.registry.clear();
        {
            let mut routes = self.routes.lock();
            routes.by_key.clear();
            routes.by_name.clear();
        }
        info!("Event bus shut down");
    }
}

struct DispatchContext {
    registry: Arc<SubscriptionRegistry>,
    routes: Arc<Mutex<RouteTable>>,
    stats: Arc<BusStatistics>,
    channel: Arc<dyn BrokerChannel>,
}

async fn dispatch_loop(context: DispatchContext, stream: DeliveryStream) {
    let mut stream = ReceiverStream::new(stream);
    while let Some(delivery) = stream.next().await {
        context.stats.record_delivery();
        dispatch_one(&context, delivery).await;
    }
    debug!("Consumer stream ended");
}

/// Settle one delivery: ack on success or on unrepairable drops, nack
/// with requeue when any handler fails.
async fn dispatch_one(context: &DispatchContext, delivery: Delivery) {
    let tag = delivery.delivery_tag;

    let event_name = context
        .routes
        .lock()
        .by_key
        .get(&delivery.routing_key)
        .cloned();
    let Some(event_name) = event_name else {
        // The exchange is shared; other services' events are not errors.
        warn!(
            routing_key = %delivery.routing_key,
            "No subscription for routing key, dropping message"
        );
        context.stats.record_dropped_no_handler();
        ack(context, tag).await;
        return;
    };

    let subscriptions = context.registry.handlers_for(&event_name);
    if subscriptions.is_empty() {
        warn!(event_name = %event_name, "No handlers registered, dropping message");
        context.stats.record_dropped_no_handler();
        ack(context, tag).await;
        return;
    }

    let envelope = match Envelope::from_wire(&delivery.body) {
        Ok(envelope) => envelope,
        Err(error) => {
            // Redelivery cannot repair a malformed body.
            error!(
                %error,
                routing_key = %delivery.routing_key,
                "Undecodable message body, dropping"
            );
            context.stats.record_dropped_malformed();
            ack(context, tag).await;
            return;
        }
    };

    // Handlers run sequentially, in registration order.
    for subscription in &subscriptions {
        match subscription.invoker.invoke(&envelope).await {
            Ok(()) => {}
            Err(DispatchError::Malformed { source }) => {
                error!(
                    %source,
                    event_name = %event_name,
                    handler = subscription.handler_id.label(),
                    "Payload does not decode, dropping message"
                );
                context.stats.record_dropped_malformed();
                ack(context, tag).await;
                return;
            }
            Err(DispatchError::Handler(failure)) => {
                warn!(
                    reason = %failure.reason,
                    event_name = %event_name,
                    event_id = %envelope.meta.id,
                    handler = subscription.handler_id.label(),
                    redelivered = delivery.redelivered,
                    "Handler failed, requeueing message"
                );
                context.stats.record_requeued();
                if let Err(error) = context.channel.nack(tag, true).await {
                    warn!(%error, tag, "Failed to nack delivery");
                }
                return;
            }
        }
    }

    context.stats.record_acked();
    ack(context, tag).await;
}

async fn ack(context: &DispatchContext, tag: u64) {
    if let Err(error) = context.channel.ack(tag).await {
        warn!(%error, tag, "Failed to ack delivery");
    }
}
