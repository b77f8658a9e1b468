#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use huddle_backend_client::Backend;
use huddle_backend_client::SsePushChannel;
use huddle_sync_core::bridge::BroadcastKind;
use huddle_sync_core::bridge::ChangeFeed;
use huddle_sync_core::bridge::InvalidationBridge;
use huddle_sync_core::bridge::PushChannel;
use huddle_sync_core::bridge::PushError;
use huddle_sync_core::bridge::PushMessage;
use huddle_sync_core::bridge::ReloadTarget;
use huddle_sync_core::bridge::Reloader;
use huddle_sync_core::bridge::Topic;
use huddle_sync_core::config::RemoteConfig;
use huddle_sync_core::model::ClientId;
use huddle_sync_core::model::TenantId;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_json;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::path_regex;

fn channel(server: &MockServer) -> SsePushChannel {
    let backend = Backend::new(&RemoteConfig {
        base_url: server.uri(),
        access_token: Some("secret".to_string()),
    })
    .unwrap();
    SsePushChannel::new(backend)
}

async fn next(receiver: &mut broadcast::Receiver<PushMessage>) -> Result<PushMessage, RecvError> {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("event within timeout")
}

fn tenant() -> TenantId {
    TenantId::new("h1")
}

#[tokio::test]
async fn stream_events_become_push_messages() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: change\n",
        "data: {\"id\":\"t1\",\"status\":\"DONE\"}\n\n",
        "event: ping\n",
        "data:\n\n",
        "data: {\"origin\":\"c2\",\"payload\":{\"kind\":\"task-update\"}}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/realtime/h1:tasks"))
        .and(header("accept", "text/event-stream"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;
    let channel = channel(&server);

    let mut receiver = channel
        .subscribe(&Topic::changes(tenant(), ChangeFeed::Tasks))
        .await
        .unwrap();

    let first = next(&mut receiver).await.unwrap();
    assert_eq!(first, PushMessage::change(json!({"id": "t1", "status": "DONE"})));
    let second = next(&mut receiver).await.unwrap();
    assert_eq!(second.origin, Some(ClientId::new("c2")));
    assert_eq!(next(&mut receiver).await, Err(RecvError::Closed));
    assert_eq!(channel.open_streams(), 0);
}

#[tokio::test]
async fn rejected_subscription_is_a_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realtime/h1:scopes"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = channel(&server)
        .subscribe(&Topic::changes(tenant(), ChangeFeed::Scopes))
        .await
        .unwrap_err();

    assert!(matches!(err, PushError::Transport(_)));
}

#[tokio::test]
async fn publish_posts_the_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/realtime/h1:scope-update"))
        .and(body_json(json!({"origin": "c1", "payload": {"kind": "scope-update"}})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    channel(&server)
        .publish(
            &Topic::broadcast(tenant(), BroadcastKind::ScopeUpdate),
            PushMessage {
                origin: Some(ClientId::new("c1")),
                payload: json!({"kind": "scope-update"}),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn closed_channel_refuses_new_subscriptions() {
    let server = MockServer::start().await;
    let channel = channel(&server);
    channel.close();

    let err = channel
        .subscribe(&Topic::changes(tenant(), ChangeFeed::InboxItems))
        .await
        .unwrap_err();

    assert_eq!(err, PushError::Closed);
}

struct RecordingReloader {
    tx: mpsc::UnboundedSender<ReloadTarget>,
}

#[async_trait]
impl Reloader for RecordingReloader {
    async fn reload(&self, _tenant: &TenantId, target: ReloadTarget) {
        let _ = self.tx.send(target);
    }
}

#[tokio::test]
async fn ended_stream_is_reopened_and_keeps_delivering() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realtime/h1:tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/event-stream"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/realtime/h1:tasks"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("data: {\"id\":\"t9\"}\n\n", "text/event-stream"),
        )
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/realtime/h1:"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/event-stream"))
        .with_priority(10)
        .mount(&server)
        .await;
    let (tx, mut reloads) = mpsc::unbounded_channel();
    let bridge = InvalidationBridge::new(
        Arc::new(channel(&server)),
        Arc::new(RecordingReloader { tx }),
        ClientId::new("c1"),
    );

    bridge.activate(&tenant()).await.unwrap();

    let target = tokio::time::timeout(Duration::from_secs(5), reloads.recv())
        .await
        .expect("event after the first stream ended");
    assert_eq!(target, Some(ReloadTarget::Tasks));
    let task_streams = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/realtime/h1:tasks")
        .count();
    assert!(task_streams >= 2);
    bridge.deactivate().await;
}
