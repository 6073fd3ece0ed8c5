//! End-to-end publishing over the built-in TCP transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_config, TestReceiver};
use databridge_agent::{
    Agent, AgentError, DropReason, EndpointState, EventPublisher, PublishOutcome,
    TransportSettings, TCP_PROTOCOL,
};
use databridge_core::{stream_id, Event};

fn event(n: i32) -> Event {
    Event::builder(stream_id("org.example.MediatorStatistics", "1.0.0"))
        .meta_data(vec!["127.0.0.1".into()])
        .payload_data(vec!["example".into(), 123.4.into(), n.into(), 12.4.into(), 1.3.into()])
        .build()
        .unwrap()
}

/// Receiver expression doubles as auth expression: the test receiver serves
/// both channels on one port.
fn connect(agent: &Arc<Agent>, receivers: &str) -> EventPublisher {
    EventPublisher::builder(TCP_PROTOCOL, receivers)
        .auth_urls(receivers)
        .credentials("admin", "admin")
        .connect(agent)
        .unwrap()
}

/// URL of a port nothing listens on.
async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("tcp://{}", addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_publish_thousand_events_blocking() {
    let receiver = TestReceiver::start().await;
    let agent = Agent::new(fast_config()).unwrap();
    let publisher = connect(&agent, &receiver.url());

    for n in 0..1000 {
        assert_eq!(publisher.publish(event(n)).await, PublishOutcome::Enqueued);
    }
    assert!(publisher.flush_timeout(Duration::from_secs(10)).await);

    assert_eq!(receiver.received(), 1000);
    let stats = publisher.stats();
    assert_eq!(stats.enqueued, 1000);
    assert_eq!(stats.delivered, 1000);
    assert_eq!(stats.pending, 0);

    publisher.shutdown_with_agent().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_publish_thousand_events_non_blocking_and_timed() {
    let receiver = TestReceiver::start().await;
    let agent = Agent::new(fast_config()).unwrap();
    let publisher = connect(&agent, &receiver.url());

    for n in 0..1000 {
        let outcome = if n % 2 == 0 {
            publisher.try_publish(event(n)).await
        } else {
            publisher
                .try_publish_timeout(event(n), Duration::from_secs(1))
                .await
        };
        assert!(outcome.is_enqueued());
    }
    assert!(publisher.flush_timeout(Duration::from_secs(10)).await);
    assert_eq!(receiver.received(), 1000);

    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_balanced_across_group() {
    let a = TestReceiver::start().await;
    let b = TestReceiver::start().await;
    let agent = Agent::new(fast_config()).unwrap();
    let publisher = connect(&agent, &format!("{{{}|{}}}", a.url(), b.url()));

    assert!(
        eventually(Duration::from_secs(5), || publisher
            .endpoints()
            .iter()
            .all(|e| e.state == EndpointState::Active))
        .await
    );

    for n in 0..400 {
        publisher.publish(event(n)).await;
    }
    assert!(publisher.flush_timeout(Duration::from_secs(10)).await);

    assert_eq!(a.received() + b.received(), 400);
    assert!(a.received() > 0);
    assert!(b.received() > 0);

    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_to_secondary_tier() {
    let primary = dead_url().await;
    let secondary = TestReceiver::start().await;
    let agent = Agent::new(fast_config()).unwrap();
    let publisher = connect(&agent, &format!("{{{}}},{{{}}}", primary, secondary.url()));

    for n in 0..100 {
        publisher.publish(event(n)).await;
    }
    assert!(publisher.flush_timeout(Duration::from_secs(10)).await);

    assert_eq!(secondary.received(), 100);
    assert_eq!(publisher.stats().delivered, 100);
    assert_eq!(publisher.active_tier(), 1);

    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_receiver_loss_moves_traffic() {
    let a = TestReceiver::start().await;
    let b = TestReceiver::start().await;
    let agent = Agent::new(fast_config()).unwrap();
    let publisher = connect(&agent, &format!("{{{}}},{{{}}}", a.url(), b.url()));
    assert!(
        eventually(Duration::from_secs(5), || publisher
            .endpoints()
            .iter()
            .all(|e| e.state == EndpointState::Active))
        .await
    );

    for n in 0..50 {
        publisher.publish(event(n)).await;
    }
    assert!(publisher.flush_timeout(Duration::from_secs(10)).await);
    assert_eq!(a.received(), 50);

    a.stop();
    for n in 0..50 {
        publisher.publish(event(n)).await;
    }
    assert!(publisher.flush_timeout(Duration::from_secs(10)).await);

    assert_eq!(a.received() + b.received(), 100);
    assert!(b.received() > 0);
    assert_eq!(publisher.stats().dropped, 0);

    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_busy_receiver_is_retried() {
    let receiver = TestReceiver::start().await;
    receiver.busy(3);
    let agent = Agent::new(fast_config()).unwrap();
    let publisher = connect(&agent, &receiver.url());

    for n in 0..10 {
        publisher.publish(event(n)).await;
    }
    assert!(publisher.flush_timeout(Duration::from_secs(10)).await);

    assert_eq!(receiver.received(), 10);
    assert_eq!(publisher.stats().dropped, 0);

    publisher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_credentials_drop_events() {
    let receiver = TestReceiver::start_with_credentials("admin", "secret").await;

    let mut config = fast_config();
    let mut settings = TransportSettings::named(TCP_PROTOCOL);
    settings.max_attempts = 2;
    settings.retry_backoff_ms = 20;
    settings.reconnection_interval_ms = 20;
    settings.max_reconnection_interval_ms = 50;
    config.upsert(settings);

    let agent = Agent::new(config).unwrap();
    let publisher = connect(&agent, &receiver.url());

    for n in 0..10 {
        publisher.publish(event(n)).await;
    }
    assert!(publisher.flush_timeout(Duration::from_secs(10)).await);

    assert_eq!(receiver.received(), 0);
    assert_eq!(publisher.stats().dropped, 10);

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_invalid_topologies_rejected() {
    let agent = Agent::new(fast_config()).unwrap();

    let err = EventPublisher::builder(TCP_PROTOCOL, "{tcp://a:7611},{tcp://b:7611}")
        .auth_urls("{ssl://a:7711}")
        .connect(&agent)
        .unwrap_err();
    assert!(matches!(err, AgentError::Configuration(_)));

    let err = EventPublisher::builder(TCP_PROTOCOL, "{tcp://a:7611|tcp://b:7611}")
        .auth_urls("{ssl://a:7711}")
        .connect(&agent)
        .unwrap_err();
    assert!(matches!(err, AgentError::Configuration(_)));

    let err = EventPublisher::builder(TCP_PROTOCOL, "tcp://a")
        .connect(&agent)
        .unwrap_err();
    assert!(err.is_config_error());

    let err = EventPublisher::builder("carrier-pigeon", "tcp://a:7611")
        .connect(&agent)
        .unwrap_err();
    assert!(matches!(err, AgentError::UnknownProtocol(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_releases_blocked_producer() {
    let mut config = fast_config();
    let mut settings = TransportSettings::named(TCP_PROTOCOL);
    settings.worker_count = 1;
    settings.queue_capacity = 4;
    settings.batch_size = 1;
    settings.max_attempts = 100;
    settings.shutdown_grace_ms = 200;
    config.upsert(settings);

    let agent = Agent::new(config).unwrap();
    let url = dead_url().await;
    let publisher = Arc::new(connect(&agent, &url));

    let mut full = false;
    for n in 0..100 {
        if publisher.try_publish(event(n)).await == PublishOutcome::Dropped(DropReason::QueueFull) {
            full = true;
            break;
        }
    }
    assert!(full);

    let blocked = {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.publish(event(-1)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    publisher.shutdown().await;

    let outcome = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Dropped(DropReason::ShuttingDown));

    let stats = publisher.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.enqueued, stats.dropped);
    assert!(publisher
        .endpoints()
        .iter()
        .all(|e| e.state == EndpointState::Closed));
}
