//! Invalidation bridge: push notifications in, guarded reloads out.
//!
//! Per active tenant the bridge listens on six change-notification topics and
//! two broadcast topics. Any notification triggers a reload of the affected
//! store through that store's single-flight guard. Broadcasts carry the
//! publishing client's id; a client drops its own broadcasts on receipt, which
//! is what lets an optimistic write stand without being re-fetched over.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use huddle_async_utils::CancellationToken;
use huddle_async_utils::OrCancelExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::model::ClientId;
use crate::model::TenantId;

/// Server-side change-notification feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeFeed {
    Tasks,
    Scopes,
    ScopeMembers,
    TimelineOverrides,
    InboxItems,
    TaskFavorites,
}

impl ChangeFeed {
    pub const ALL: [ChangeFeed; 6] = [
        ChangeFeed::Tasks,
        ChangeFeed::Scopes,
        ChangeFeed::ScopeMembers,
        ChangeFeed::TimelineOverrides,
        ChangeFeed::InboxItems,
        ChangeFeed::TaskFavorites,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeFeed::Tasks => "tasks",
            ChangeFeed::Scopes => "scopes",
            ChangeFeed::ScopeMembers => "scope-members",
            ChangeFeed::TimelineOverrides => "timeline-overrides",
            ChangeFeed::InboxItems => "inbox-items",
            ChangeFeed::TaskFavorites => "task-favorites",
        }
    }

    pub fn target(self) -> ReloadTarget {
        match self {
            ChangeFeed::Tasks | ChangeFeed::TaskFavorites => ReloadTarget::Tasks,
            ChangeFeed::Scopes | ChangeFeed::ScopeMembers => ReloadTarget::Scopes,
            ChangeFeed::TimelineOverrides => ReloadTarget::Timeline,
            ChangeFeed::InboxItems => ReloadTarget::Inbox,
        }
    }
}

/// Client-to-client fan-out topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastKind {
    ScopeUpdate,
    TaskUpdate,
}

impl BroadcastKind {
    pub const ALL: [BroadcastKind; 2] = [BroadcastKind::ScopeUpdate, BroadcastKind::TaskUpdate];

    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastKind::ScopeUpdate => "scope-update",
            BroadcastKind::TaskUpdate => "task-update",
        }
    }

    pub fn target(self) -> ReloadTarget {
        match self {
            BroadcastKind::ScopeUpdate => ReloadTarget::Scopes,
            BroadcastKind::TaskUpdate => ReloadTarget::Tasks,
        }
    }
}

/// Store a notification invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReloadTarget {
    Tasks,
    Scopes,
    Timeline,
    Inbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Changes(ChangeFeed),
    Broadcast(BroadcastKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub tenant_id: TenantId,
    pub kind: TopicKind,
}

impl Topic {
    pub fn changes(tenant_id: TenantId, feed: ChangeFeed) -> Self {
        Self {
            tenant_id,
            kind: TopicKind::Changes(feed),
        }
    }

    pub fn broadcast(tenant_id: TenantId, kind: BroadcastKind) -> Self {
        Self {
            tenant_id,
            kind: TopicKind::Broadcast(kind),
        }
    }

    /// Every topic a client subscribes to for `tenant`.
    pub fn all_for(tenant: &TenantId) -> Vec<Topic> {
        ChangeFeed::ALL
            .into_iter()
            .map(|feed| Topic::changes(tenant.clone(), feed))
            .chain(
                BroadcastKind::ALL
                    .into_iter()
                    .map(|kind| Topic::broadcast(tenant.clone(), kind)),
            )
            .collect()
    }

    /// Wire name, e.g. `h1:scope-members`.
    pub fn name(&self) -> String {
        let kind = match self.kind {
            TopicKind::Changes(feed) => feed.as_str(),
            TopicKind::Broadcast(kind) => kind.as_str(),
        };
        format!("{}:{kind}", self.tenant_id)
    }

    pub fn target(&self) -> ReloadTarget {
        match self.kind {
            TopicKind::Changes(feed) => feed.target(),
            TopicKind::Broadcast(kind) => kind.target(),
        }
    }
}

/// One notification. `origin` is set on broadcasts only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ClientId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PushMessage {
    pub fn change(payload: serde_json::Value) -> Self {
        Self {
            origin: None,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("push channel transport error: {0}")]
    Transport(String),

    #[error("push channel closed")]
    Closed,
}

/// Pub/sub transport.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<PushMessage>, PushError>;

    async fn publish(&self, topic: &Topic, message: PushMessage) -> Result<(), PushError>;
}

/// Runs the guarded reload for a target. Implemented by the engine.
#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self, tenant: &TenantId, target: ReloadTarget);
}

/// Announces a successful local write to other clients.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn announce(&self, tenant: &TenantId, kind: BroadcastKind);
}

struct Subscription {
    tenant_id: TenantId,
    cancel: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
}

pub struct InvalidationBridge {
    channel: Arc<dyn PushChannel>,
    reloader: Arc<dyn Reloader>,
    client_id: ClientId,
    active: Mutex<Option<Subscription>>,
}

impl InvalidationBridge {
    pub fn new(channel: Arc<dyn PushChannel>, reloader: Arc<dyn Reloader>, client_id: ClientId) -> Self {
        Self {
            channel,
            reloader,
            client_id,
            active: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub async fn active_tenant(&self) -> Option<TenantId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|sub| sub.tenant_id.clone())
    }

    /// Tear down the previous tenant's subscriptions, then subscribe to all
    /// topics of `tenant`. Returns the number of topics subscribed.
    pub async fn activate(&self, tenant: &TenantId) -> Result<usize, PushError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            teardown(previous).await;
        }

        let cancel = CancellationToken::new();
        let mut listeners = Vec::new();
        for topic in Topic::all_for(tenant) {
            let receiver = match self.channel.subscribe(&topic).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    cancel.cancel();
                    for listener in listeners {
                        let _ = listener.await;
                    }
                    return Err(e);
                }
            };
            listeners.push(tokio::spawn(listen(
                receiver,
                topic,
                Listener {
                    channel: Arc::clone(&self.channel),
                    client_id: self.client_id.clone(),
                    reloader: Arc::clone(&self.reloader),
                    cancel: cancel.clone(),
                },
            )));
        }
        let count = listeners.len();
        tracing::info!("Subscribed to {count} topics for {tenant}");
        *active = Some(Subscription {
            tenant_id: tenant.clone(),
            cancel,
            listeners,
        });
        Ok(count)
    }

    pub async fn deactivate(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            teardown(previous).await;
        }
    }
}

async fn teardown(subscription: Subscription) {
    subscription.cancel.cancel();
    for listener in subscription.listeners {
        let _ = listener.await;
    }
    tracing::debug!("Unsubscribed from topics for {}", subscription.tenant_id);
}

const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_millis(250);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

struct Listener {
    channel: Arc<dyn PushChannel>,
    client_id: ClientId,
    reloader: Arc<dyn Reloader>,
    cancel: CancellationToken,
}

/// Forward notifications on `topic` to the reloader until the subscription
/// is cancelled. A topic whose stream closes is resubscribed with capped
/// exponential backoff; only cancellation or a closed channel ends the loop.
async fn listen(mut receiver: broadcast::Receiver<PushMessage>, topic: Topic, listener: Listener) {
    let target = topic.target();
    let mut delay = RESUBSCRIBE_INITIAL_DELAY;
    loop {
        match receiver.recv().or_cancel(&listener.cancel).await {
            Err(_) => break,
            Ok(Ok(message)) => {
                delay = RESUBSCRIBE_INITIAL_DELAY;
                if message.origin.as_ref() == Some(&listener.client_id) {
                    tracing::trace!("Dropping own broadcast on {}", topic.name());
                    continue;
                }
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                tracing::debug!("{} lagged by {skipped} messages; reloading once", topic.name());
            }
            Ok(Err(RecvError::Closed)) => {
                tracing::debug!("{} closed; resubscribing in {delay:?}", topic.name());
                match resubscribe(&topic, &listener, &mut delay).await {
                    Some(fresh) => {
                        receiver = fresh;
                        continue;
                    }
                    None => break,
                }
            }
        }
        let reloader = Arc::clone(&listener.reloader);
        let tenant = topic.tenant_id.clone();
        tokio::spawn(async move { reloader.reload(&tenant, target).await });
    }
}

/// `None` once the subscription is cancelled or the channel is shut down.
async fn resubscribe(
    topic: &Topic,
    listener: &Listener,
    delay: &mut Duration,
) -> Option<broadcast::Receiver<PushMessage>> {
    loop {
        tokio::time::sleep(*delay)
            .or_cancel(&listener.cancel)
            .await
            .ok()?;
        *delay = (*delay * 2).min(RESUBSCRIBE_MAX_DELAY);
        match listener
            .channel
            .subscribe(topic)
            .or_cancel(&listener.cancel)
            .await
            .ok()?
        {
            Ok(receiver) => {
                tracing::debug!("Resubscribed to {}", topic.name());
                return Some(receiver);
            }
            Err(PushError::Closed) => return None,
            Err(e) => tracing::debug!("Resubscribing to {} failed: {e}", topic.name()),
        }
    }
}

#[async_trait]
impl ChangePublisher for InvalidationBridge {
    async fn announce(&self, tenant: &TenantId, kind: BroadcastKind) {
        let topic = Topic::broadcast(tenant.clone(), kind);
        let message = PushMessage {
            origin: Some(self.client_id.clone()),
            payload: serde_json::json!({ "kind": kind }),
        };
        if let Err(e) = self.channel.publish(&topic, message).await {
            tracing::warn!("Broadcast on {} failed: {e}", topic.name());
        }
    }
}

const HUB_CAPACITY: usize = 256;

/// In-process push channel. Every subscriber of a topic sees every message.
#[derive(Default)]
pub struct LocalPushHub {
    topics: StdMutex<HashMap<String, broadcast::Sender<PushMessage>>>,
}

impl LocalPushHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &Topic) -> broadcast::Sender<PushMessage> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.name())
            .or_insert_with(|| broadcast::channel(HUB_CAPACITY).0)
            .clone()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic.name())
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Emit a server-side change notification.
    pub fn notify_change(&self, tenant: &TenantId, feed: ChangeFeed) {
        let _ = self
            .sender(&Topic::changes(tenant.clone(), feed))
            .send(PushMessage::change(serde_json::Value::Null));
    }
}

#[async_trait]
impl PushChannel for LocalPushHub {
    async fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<PushMessage>, PushError> {
        Ok(self.sender(topic).subscribe())
    }

    async fn publish(&self, topic: &Topic, message: PushMessage) -> Result<(), PushError> {
        // Publishing to a topic nobody listens on is not an error.
        let _ = self.sender(topic).send(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    struct RecordingReloader {
        tx: mpsc::UnboundedSender<(TenantId, ReloadTarget)>,
    }

    #[async_trait]
    impl Reloader for RecordingReloader {
        async fn reload(&self, tenant: &TenantId, target: ReloadTarget) {
            let _ = self.tx.send((tenant.clone(), target));
        }
    }

    fn bridge(
        hub: &Arc<LocalPushHub>,
        client: &str,
    ) -> (InvalidationBridge, mpsc::UnboundedReceiver<(TenantId, ReloadTarget)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = InvalidationBridge::new(
            hub.clone(),
            Arc::new(RecordingReloader { tx }),
            ClientId::new(client),
        );
        (bridge, rx)
    }

    #[test]
    fn eight_topics_per_tenant() {
        let topics = Topic::all_for(&TenantId::new("h1"));
        assert_eq!(topics.len(), 8);
        let names: Vec<String> = topics.iter().map(Topic::name).collect();
        assert!(names.contains(&"h1:scope-members".to_string()));
        assert!(names.contains(&"h1:task-update".to_string()));
    }

    #[tokio::test]
    async fn change_notification_triggers_reload() {
        let hub = Arc::new(LocalPushHub::new());
        let (bridge, mut reloads) = bridge(&hub, "c1");
        let tenant = TenantId::new("h1");
        assert_eq!(bridge.activate(&tenant).await.unwrap(), 8);

        hub.notify_change(&tenant, ChangeFeed::ScopeMembers);

        assert_eq!(reloads.recv().await, Some((tenant, ReloadTarget::Scopes)));
    }

    #[tokio::test]
    async fn own_broadcast_is_not_reprocessed() {
        let hub = Arc::new(LocalPushHub::new());
        let (me, mut my_reloads) = bridge(&hub, "me");
        let (peer, mut peer_reloads) = bridge(&hub, "peer");
        let tenant = TenantId::new("h1");
        me.activate(&tenant).await.unwrap();
        peer.activate(&tenant).await.unwrap();

        me.announce(&tenant, BroadcastKind::TaskUpdate).await;

        assert_eq!(
            peer_reloads.recv().await,
            Some((tenant.clone(), ReloadTarget::Tasks))
        );
        let own = tokio::time::timeout(Duration::from_millis(50), my_reloads.recv()).await;
        assert!(own.is_err(), "publisher re-received its own broadcast");
    }

    #[tokio::test]
    async fn switching_tenant_tears_down_old_topics() {
        let hub = Arc::new(LocalPushHub::new());
        let (bridge, mut reloads) = bridge(&hub, "c1");
        let old = TenantId::new("h1");
        let new = TenantId::new("h2");
        bridge.activate(&old).await.unwrap();
        bridge.activate(&new).await.unwrap();

        for topic in Topic::all_for(&old) {
            assert_eq!(hub.subscriber_count(&topic), 0);
        }
        for topic in Topic::all_for(&new) {
            assert_eq!(hub.subscriber_count(&topic), 1);
        }
        assert_eq!(bridge.active_tenant().await, Some(new.clone()));

        hub.notify_change(&old, ChangeFeed::Tasks);
        hub.notify_change(&new, ChangeFeed::InboxItems);
        assert_eq!(reloads.recv().await, Some((new, ReloadTarget::Inbox)));

        bridge.deactivate().await;
        assert_eq!(bridge.active_tenant().await, None);
    }

    /// Hands out one already-closed receiver for the tasks feed, then
    /// delegates to the hub.
    struct DroppingFirstStream {
        hub: Arc<LocalPushHub>,
        dropped: AtomicBool,
    }

    #[async_trait]
    impl PushChannel for DroppingFirstStream {
        async fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<PushMessage>, PushError> {
            if topic.kind == TopicKind::Changes(ChangeFeed::Tasks)
                && !self.dropped.swap(true, Ordering::SeqCst)
            {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                return Ok(receiver);
            }
            self.hub.subscribe(topic).await
        }

        async fn publish(&self, topic: &Topic, message: PushMessage) -> Result<(), PushError> {
            self.hub.publish(topic, message).await
        }
    }

    #[tokio::test]
    async fn closed_stream_is_resubscribed() {
        let hub = Arc::new(LocalPushHub::new());
        let (tx, mut reloads) = mpsc::unbounded_channel();
        let bridge = InvalidationBridge::new(
            Arc::new(DroppingFirstStream {
                hub: hub.clone(),
                dropped: AtomicBool::new(false),
            }),
            Arc::new(RecordingReloader { tx }),
            ClientId::new("c1"),
        );
        let tenant = TenantId::new("h1");
        let tasks = Topic::changes(tenant.clone(), ChangeFeed::Tasks);
        bridge.activate(&tenant).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.subscriber_count(&tasks) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("tasks feed resubscribed");
        hub.notify_change(&tenant, ChangeFeed::Tasks);

        assert_eq!(reloads.recv().await, Some((tenant, ReloadTarget::Tasks)));
    }
}
