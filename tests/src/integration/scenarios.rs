//! # Publish → Dispatch Scenarios
//!
//! End-to-end flows between a producing service and a consuming service
//! sharing one broker:
//!
//! ```text
//! [chat svc bus] ──publish──→ exchange ──chat.message.sent──→ queue
//!                                                               │
//! [notification svc bus] ←──────── dispatch loop ←──────────────┘
//!       │
//!       ├── all handlers Ok  → ack
//!       ├── handler failed   → nack + requeue (whole message)
//!       ├── no subscription  → warn + ack
//!       └── undecodable body → error + ack
//! ```

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::sleep;
    use uuid::Uuid;

    use teamline_bus::{
        BusConfig, EventBus, EventHandler, HandlerError, InProcessBroker, RetryPolicy,
    };
    use teamline_events::catalog::{ChatMessageSent, TaskAssigned};
    use teamline_events::{Envelope, EventMetadata, IntegrationEvent};

    use crate::support::{
        chat_message, fast_config, init_tracing, raw_channel, raw_properties, wait_until,
    };

    type Seen = Arc<Mutex<Vec<(ChatMessageSent, EventMetadata)>>>;

    struct CollectChat {
        seen: Seen,
    }

    #[async_trait]
    impl EventHandler<ChatMessageSent> for CollectChat {
        async fn handle(
            &self,
            event: ChatMessageSent,
            meta: &EventMetadata,
        ) -> Result<(), HandlerError> {
            self.seen.lock().push((event, meta.clone()));
            Ok(())
        }
    }

    async fn consumer_with_collector(broker: &Arc<InProcessBroker>) -> (EventBus, Seen) {
        let bus = EventBus::new(broker.clone(), fast_config("notifications"));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe::<ChatMessageSent, _, _>(move || CollectChat { seen: sink.clone() })
            .await
            .expect("subscribe");
        bus.start_consuming().await.expect("consume");
        (bus, seen)
    }

    #[tokio::test]
    async fn test_message_with_two_recipients_reaches_handler_intact() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());
        let (_consumer, seen) = consumer_with_collector(&broker).await;

        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);

        let event = chat_message(vec![Uuid::new_v4(), Uuid::new_v4()]);
        producer.publish(&event).await.expect("publish");

        let probe = seen.clone();
        wait_until(move || !probe.lock().is_empty()).await;

        let (delivered, meta) = seen.lock()[0].clone();
        assert_eq!(delivered, event);
        assert_eq!(delivered.recipient_ids.len(), 2);
        assert_eq!(meta.event_name, ChatMessageSent::NAME);
        assert_eq!(meta.source_service, "chat");
        assert_eq!(meta.schema_version, 1);
        assert_eq!(producer.stats().published, 1);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_returns_without_delivery() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());
        let (_consumer, seen) = consumer_with_collector(&broker).await;

        // Producer never connects.
        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        producer
            .publish(&chat_message(vec![Uuid::new_v4()]))
            .await
            .expect("fire-and-forget never errors");

        sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());
        assert_eq!(producer.stats().publishes_dropped, 1);
        assert_eq!(producer.stats().published, 0);
    }

    #[tokio::test]
    async fn test_failing_handler_is_redelivered_once_then_acked() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());

        struct FailOnce {
            attempts: Arc<AtomicU32>,
        }

        #[async_trait]
        impl EventHandler<ChatMessageSent> for FailOnce {
            async fn handle(
                &self,
                _event: ChatMessageSent,
                _meta: &EventMetadata,
            ) -> Result<(), HandlerError> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(HandlerError::new("notification store briefly offline"));
                }
                Ok(())
            }
        }

        let attempts = Arc::new(AtomicU32::new(0));
        let consumer = EventBus::new(broker.clone(), fast_config("notifications"));
        let counter = attempts.clone();
        consumer
            .subscribe::<ChatMessageSent, _, _>(move || FailOnce {
                attempts: counter.clone(),
            })
            .await
            .expect("subscribe");
        consumer.start_consuming().await.expect("consume");

        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);
        producer
            .publish(&chat_message(vec![Uuid::new_v4()]))
            .await
            .expect("publish");

        let counter = attempts.clone();
        wait_until(move || counter.load(Ordering::SeqCst) == 2).await;
        wait_until(|| consumer.stats().acked == 1).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.stats().requeued, 1);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.dead_lettered(), 0);
    }

    #[tokio::test]
    async fn test_event_without_subscription_is_acked_not_requeued() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());

        // A consumer with a live queue but no handler for the foreign key.
        let consumer = EventBus::new(broker.clone(), fast_config("notifications"));
        assert!(consumer.try_connect().await);
        consumer.start_consuming().await.expect("consume");

        // Another tenant of the shared exchange binds a foreign event into
        // this queue.
        let channel = raw_channel(&broker).await;
        channel
            .bind_queue(
                "teamline.events.notifications",
                "teamline.events",
                "billing.invoice.paid",
            )
            .await
            .expect("bind");
        channel
            .publish(
                "teamline.events",
                "billing.invoice.paid",
                raw_properties(),
                br#"{"eventName":"InvoicePaid"}"#.to_vec(),
            )
            .await
            .expect("publish");

        wait_until(|| consumer.stats().dropped_no_handler == 1).await;
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("teamline.events.notifications"), 0);
        assert_eq!(consumer.stats().requeued, 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_acked_and_dropped() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());
        let (consumer, seen) = consumer_with_collector(&broker).await;

        let channel = raw_channel(&broker).await;
        channel
            .publish(
                "teamline.events",
                ChatMessageSent::ROUTING_KEY,
                raw_properties(),
                b"not an envelope".to_vec(),
            )
            .await
            .expect("publish");

        wait_until(|| consumer.stats().dropped_malformed == 1).await;
        assert!(seen.lock().is_empty());
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("teamline.events.notifications"), 0);
    }

    #[tokio::test]
    async fn test_wire_metadata_survives_transport_verbatim() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());

        type Raw = Arc<Mutex<Vec<(serde_json::Value, EventMetadata)>>>;
        struct CollectRaw {
            seen: Raw,
        }

        #[async_trait]
        impl teamline_bus::DynamicEventHandler for CollectRaw {
            async fn handle(
                &self,
                payload: serde_json::Value,
                meta: &EventMetadata,
            ) -> Result<(), HandlerError> {
                self.seen.lock().push((payload, meta.clone()));
                Ok(())
            }
        }

        let consumer = EventBus::new(broker.clone(), fast_config("notifications"));
        let seen: Raw = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer
            .subscribe_dynamic_routed(
                ChatMessageSent::NAME,
                ChatMessageSent::ROUTING_KEY,
                move || CollectRaw { seen: sink.clone() },
            )
            .await
            .expect("subscribe");
        consumer.start_consuming().await.expect("consume");

        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);

        let envelope = Envelope::publish(&chat_message(vec![Uuid::new_v4()]), "chat")
            .expect("envelope")
            .correlated_with("flow-123");
        producer
            .publish_envelope(&envelope, ChatMessageSent::ROUTING_KEY)
            .await
            .expect("publish");

        let probe = seen.clone();
        wait_until(move || !probe.lock().is_empty()).await;

        let (payload, meta) = seen.lock()[0].clone();
        // Identity and metadata preserved verbatim across the wire.
        assert_eq!(meta, envelope.meta);
        assert_eq!(meta.correlation_id.as_deref(), Some("flow-123"));
        assert_eq!(payload, serde_json::Value::Object(envelope.payload.clone()));
    }

    #[tokio::test]
    async fn test_replay_with_new_id_is_a_distinct_delivery() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());
        let (_consumer, seen) = consumer_with_collector(&broker).await;

        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);

        let envelope =
            Envelope::publish(&chat_message(vec![Uuid::new_v4()]), "chat").expect("envelope");
        let replay = envelope.with_new_id();

        producer
            .publish_envelope(&envelope, ChatMessageSent::ROUTING_KEY)
            .await
            .expect("publish");
        producer
            .publish_envelope(&replay, ChatMessageSent::ROUTING_KEY)
            .await
            .expect("publish replay");

        let probe = seen.clone();
        wait_until(move || probe.lock().len() == 2).await;

        let collected = seen.lock();
        assert_ne!(collected[0].1.id, collected[1].1.id);
        assert_eq!(collected[0].0, collected[1].0);
    }

    #[tokio::test]
    async fn test_correlated_publish_propagates_correlation_id() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());
        let (_consumer, seen) = consumer_with_collector(&broker).await;

        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);
        producer
            .publish_correlated(&chat_message(vec![Uuid::new_v4()]), "req-9000")
            .await
            .expect("publish");

        let probe = seen.clone();
        wait_until(move || !probe.lock().is_empty()).await;
        assert_eq!(
            seen.lock()[0].1.correlation_id.as_deref(),
            Some("req-9000")
        );
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());

        type Order = Arc<Mutex<Vec<&'static str>>>;
        struct First {
            order: Order,
        }
        struct Second {
            order: Order,
        }

        #[async_trait]
        impl EventHandler<TaskAssigned> for First {
            async fn handle(
                &self,
                _event: TaskAssigned,
                _meta: &EventMetadata,
            ) -> Result<(), HandlerError> {
                self.order.lock().push("first");
                Ok(())
            }
        }

        #[async_trait]
        impl EventHandler<TaskAssigned> for Second {
            async fn handle(
                &self,
                _event: TaskAssigned,
                _meta: &EventMetadata,
            ) -> Result<(), HandlerError> {
                self.order.lock().push("second");
                Ok(())
            }
        }

        let consumer = EventBus::new(broker.clone(), fast_config("notifications"));
        let order: Order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        consumer
            .subscribe::<TaskAssigned, _, _>(move || First { order: sink.clone() })
            .await
            .expect("subscribe first");
        let sink = order.clone();
        consumer
            .subscribe::<TaskAssigned, _, _>(move || Second { order: sink.clone() })
            .await
            .expect("subscribe second");
        consumer.start_consuming().await.expect("consume");

        let producer = EventBus::new(broker.clone(), fast_config("tasks"));
        assert!(producer.try_connect().await);
        producer
            .publish(&TaskAssigned {
                task_id: Uuid::new_v4(),
                team_id: Uuid::new_v4(),
                assignee_id: Uuid::new_v4(),
                assigner_id: Uuid::new_v4(),
            })
            .await
            .expect("publish");

        let probe = order.clone();
        wait_until(move || probe.lock().len() == 2).await;
        assert_eq!(order.lock().as_slice(), ["first", "second"]);
    }

    #[tokio::test]
    async fn test_two_buses_own_independent_registries() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());
        let (consumer, _seen) = consumer_with_collector(&broker).await;

        let other = EventBus::new(broker.clone(), {
            BusConfig {
                retry: RetryPolicy::fast(3),
                ..BusConfig::for_service("digest")
            }
        });

        assert!(consumer
            .subscriptions()
            .has_subscriptions(ChatMessageSent::NAME));
        assert!(!other
            .subscriptions()
            .has_subscriptions(ChatMessageSent::NAME));
    }
}
