//! Message transport: a small star-topology bus.
//!
//! Named topics with fan-out publication, plus synchronous service calls
//! with a probe primitive for startup readiness. This is deliberately not a
//! general pub/sub framework: the harness uses a fixed, small set of
//! well-known channels (see [`crate::msg::topics`] and
//! [`crate::msg::services`]) and one broker per evaluation session.

mod broker;
mod client;
mod frame;

pub use broker::Broker;
pub use client::{BusClient, ServiceRequest};
pub use frame::{BrokerFrame, BusErrorKind, BusMessage, ClientFrame};

/// Transport-level failures. At the evaluator these are non-fatal to the
/// session: collected results are kept and the session stops gracefully.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus connection closed")]
    Closed,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("bus protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn start_broker() -> String {
        let broker = Broker::bind("127.0.0.1:0").await.unwrap();
        let addr = broker.local_addr().unwrap();
        tokio::spawn(broker.run());
        addr.to_string()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let addr = start_broker().await;
        let sub = BusClient::connect(&addr).await.unwrap();
        let mut rx = sub.subscribe("rgb").unwrap();

        // make sure the subscription frame is processed first
        sub.probe("nothing").await.unwrap_err();

        let publisher = BusClient::connect(&addr).await.unwrap();
        publisher
            .publish("rgb", BusMessage::new(7, &json!({"px": 1})).unwrap())
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.stamp, 7);
        assert_eq!(msg.payload, json!({"px": 1}));
    }

    #[tokio::test]
    async fn test_subscribe_many_preserves_arrival_order() {
        let addr = start_broker().await;
        let sub = BusClient::connect(&addr).await.unwrap();
        let mut rx = sub.subscribe_many(&["a", "b"]).unwrap();
        sub.probe("nothing").await.unwrap_err();

        let publisher = BusClient::connect(&addr).await.unwrap();
        for stamp in 0..3 {
            publisher
                .publish("a", BusMessage::new(stamp, &json!("a")).unwrap())
                .unwrap();
            publisher
                .publish("b", BusMessage::new(stamp, &json!("b")).unwrap())
                .unwrap();
        }

        for stamp in 0..3 {
            for expected in ["a", "b"] {
                let (topic, msg) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(topic, expected);
                assert_eq!(msg.stamp, stamp);
            }
        }
    }

    #[tokio::test]
    async fn test_service_call_round_trip() {
        let addr = start_broker().await;
        let provider = BusClient::connect(&addr).await.unwrap();
        provider.register("echo").unwrap();
        let mut requests = provider.take_requests().unwrap();
        tokio::spawn(async move {
            while let Some(req) = requests.recv().await {
                provider
                    .respond(req.id, json!({"echo": req.payload}))
                    .unwrap();
            }
        });

        let caller = BusClient::connect(&addr).await.unwrap();
        caller
            .wait_for_service("echo", 50, Duration::from_millis(10))
            .await
            .unwrap();
        let reply = caller.call("echo", json!(42)).await.unwrap();
        assert_eq!(reply, json!({"echo": 42}));
    }

    #[tokio::test]
    async fn test_unregistered_service_is_unavailable() {
        let addr = start_broker().await;
        let caller = BusClient::connect(&addr).await.unwrap();
        let err = caller.call("env/eval_episode", json!({})).await.unwrap_err();
        assert!(matches!(err, BusError::ServiceUnavailable(_)));

        let err = caller
            .wait_for_service("env/eval_episode", 3, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_provider_disconnect_fails_pending_call() {
        let addr = start_broker().await;
        let provider = BusClient::connect(&addr).await.unwrap();
        provider.register("slow").unwrap();
        let mut requests = provider.take_requests().unwrap();

        let caller = BusClient::connect(&addr).await.unwrap();
        caller
            .wait_for_service("slow", 50, Duration::from_millis(10))
            .await
            .unwrap();

        let call = tokio::spawn(async move { caller.call("slow", json!(null)).await });

        // wait for the request to arrive, then vanish without answering
        let _req = requests.recv().await.unwrap();
        drop(provider);
        drop(requests);

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BusError::ServiceUnavailable(_))));
    }
}
