//! # Resilience Scenarios
//!
//! Broker loss, transient publish faults, and poison-message containment:
//!
//! ```text
//! connection lost ──→ manager heals ──→ consumption restarted, backlog drained
//! publish fault   ──→ backoff retry ──→ accepted (or logged drop at exhaustion)
//! poison message  ──→ requeue … requeue ──→ delivery limit ──→ dead-letter queue
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
    use teamline_events::catalog::ChatMessageSent;
    use teamline_events::EventMetadata;

    use crate::support::{
        chat_message, fast_config, init_tracing, raw_channel, wait_until, PublishFlakyBroker,
    };

    type Seen = Arc<Mutex<Vec<ChatMessageSent>>>;

    struct Collect {
        seen: Seen,
    }

    #[async_trait]
    impl EventHandler<ChatMessageSent> for Collect {
        async fn handle(
            &self,
            event: ChatMessageSent,
            _meta: &EventMetadata,
        ) -> Result<(), HandlerError> {
            self.seen.lock().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_retries_transient_faults_then_succeeds() {
        init_tracing();
        let inner = Arc::new(InProcessBroker::new());
        let flaky = Arc::new(PublishFlakyBroker::new(inner.clone()));

        let consumer = EventBus::new(inner.clone(), fast_config("notifications"));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer
            .subscribe::<ChatMessageSent, _, _>(move || Collect { seen: sink.clone() })
            .await
            .expect("subscribe");
        consumer.start_consuming().await.expect("consume");

        let producer = EventBus::new(flaky.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);

        flaky.fail_next_publishes(2);
        producer
            .publish(&chat_message(vec![Uuid::new_v4()]))
            .await
            .expect("publish");

        let probe = seen.clone();
        wait_until(move || !probe.lock().is_empty()).await;
        assert_eq!(producer.stats().published, 1);
        assert_eq!(producer.stats().publishes_dropped, 0);
    }

    #[tokio::test]
    async fn test_publish_drops_after_retry_exhaustion() {
        init_tracing();
        let inner = Arc::new(InProcessBroker::new());
        let flaky = Arc::new(PublishFlakyBroker::new(inner.clone()));

        let producer = EventBus::new(flaky.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);

        // More faults than the 3-attempt policy can absorb.
        flaky.fail_next_publishes(10);
        producer
            .publish(&chat_message(vec![Uuid::new_v4()]))
            .await
            .expect("fire-and-forget never errors");

        assert_eq!(producer.stats().publishes_dropped, 1);
        assert_eq!(producer.stats().published, 0);
    }

    #[tokio::test]
    async fn test_poison_message_dead_letters_after_delivery_limit() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());

        struct AlwaysFails {
            attempts: Arc<AtomicU32>,
        }

        #[async_trait]
        impl EventHandler<ChatMessageSent> for AlwaysFails {
            async fn handle(
                &self,
                _event: ChatMessageSent,
                _meta: &EventMetadata,
            ) -> Result<(), HandlerError> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("handler bug"))
            }
        }

        let config = BusConfig {
            delivery_limit: Some(2),
            retry: RetryPolicy::fast(3),
            ..BusConfig::for_service("notifications")
        };
        let consumer = EventBus::new(broker.clone(), config);

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        consumer
            .subscribe::<ChatMessageSent, _, _>(move || AlwaysFails {
                attempts: counter.clone(),
            })
            .await
            .expect("subscribe");

        // Quarantine queue capturing what the dead-letter exchange emits.
        let channel = raw_channel(&broker).await;
        channel
            .declare_queue(&teamline_bus::QueueSpec {
                name: "quarantine".to_string(),
                durable: true,
                message_ttl: Duration::from_secs(3600),
                dead_letter_exchange: None,
                delivery_limit: None,
            })
            .await
            .expect("declare");
        channel
            .bind_queue(
                "quarantine",
                "teamline.events.dead-letter",
                "chat.message.sent",
            )
            .await
            .expect("bind");

        consumer.start_consuming().await.expect("consume");

        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);
        producer
            .publish(&chat_message(vec![Uuid::new_v4()]))
            .await
            .expect("publish");

        wait_until(|| broker.dead_lettered() == 1).await;

        // Delivered exactly delivery_limit times, then quarantined.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(consumer.stats().requeued, 2);
        assert_eq!(broker.queue_depth("quarantine"), 1);
        assert_eq!(broker.queue_depth("teamline.events.notifications"), 0);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_backlog_is_dead_lettered_not_dispatched() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());

        let config = BusConfig {
            message_ttl: Duration::from_millis(1),
            retry: RetryPolicy::fast(3),
            ..BusConfig::for_service("notifications")
        };
        let consumer = EventBus::new(broker.clone(), config);
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer
            .subscribe::<ChatMessageSent, _, _>(move || Collect { seen: sink.clone() })
            .await
            .expect("subscribe");

        // Publish while nothing consumes, then let the TTL lapse.
        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);
        producer
            .publish(&chat_message(vec![Uuid::new_v4()]))
            .await
            .expect("publish");
        sleep(Duration::from_millis(20)).await;

        consumer.start_consuming().await.expect("consume");

        wait_until(|| broker.dead_lettered() == 1).await;
        assert!(seen.lock().is_empty());
        assert_eq!(broker.queue_depth("teamline.events.notifications"), 0);
    }

    #[tokio::test]
    async fn test_consumption_resumes_after_broker_restart() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());

        let consumer = EventBus::new(broker.clone(), fast_config("notifications"));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer
            .subscribe::<ChatMessageSent, _, _>(move || Collect { seen: sink.clone() })
            .await
            .expect("subscribe");
        consumer.start_consuming().await.expect("consume");

        let producer = EventBus::new(broker.clone(), fast_config("chat"));
        assert!(producer.try_connect().await);

        // Broker restart: every connection drops, topology survives.
        broker.drop_connections("broker restart");
        wait_until(|| consumer.is_connected() && producer.is_connected()).await;

        // The queue keeps accumulating while the old consumer channel is
        // gone.
        producer
            .publish(&chat_message(vec![Uuid::new_v4()]))
            .await
            .expect("publish");
        wait_until(|| broker.queue_depth("teamline.events.notifications") == 1).await;
        assert!(seen.lock().is_empty());

        // Restarting consumption drains the backlog.
        consumer.stop_consuming().await;
        consumer.start_consuming().await.expect("consume again");

        let probe = seen.clone();
        wait_until(move || !probe.lock().is_empty()).await;
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_connection_and_registry() {
        init_tracing();
        let broker = Arc::new(InProcessBroker::new());

        let bus = EventBus::new(broker.clone(), fast_config("notifications"));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe::<ChatMessageSent, _, _>(move || Collect { seen: sink.clone() })
            .await
            .expect("subscribe");
        bus.start_consuming().await.expect("consume");

        bus.shutdown().await;

        assert!(!bus.is_connected());
        assert!(bus.subscriptions().is_empty());
        assert!(!bus.try_connect().await);
        assert_eq!(broker.connection_count(), 0);
    }
}
