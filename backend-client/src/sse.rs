//! Push channel over server-sent events.
//!
//! Each topic is one long-lived `GET /realtime/{topic}` stream, shared by all
//! local subscribers of that topic. Broadcasts are published with
//! `POST /realtime/{topic}` and fanned out by the server to every stream.
//!
//! Change feeds deliver arbitrary JSON rows; broadcasts deliver the
//! `{origin, payload}` envelope so receivers can drop their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use huddle_async_utils::CancellationToken;
use huddle_async_utils::OrCancelExt;
use huddle_sync_core::bridge::PushChannel;
use huddle_sync_core::bridge::PushError;
use huddle_sync_core::bridge::PushMessage;
use huddle_sync_core::bridge::Topic;
use reqwest::Response;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::backend::Backend;

const STREAM_CAPACITY: usize = 64;
const KEEPALIVE_EVENTS: &[&str] = &["ping", "keepalive", "heartbeat"];

type Streams = Arc<Mutex<HashMap<String, broadcast::Sender<PushMessage>>>>;

pub struct SsePushChannel {
    backend: Backend,
    streams: Streams,
    shutdown: CancellationToken,
}

impl SsePushChannel {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            streams: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Topics with a live event stream.
    pub fn open_streams(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop every stream reader. Subscribers observe `Closed`.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn existing(&self, name: &str) -> Option<broadcast::Receiver<PushMessage>> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(broadcast::Sender::subscribe)
    }
}

impl Drop for SsePushChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn path_for(topic: &Topic) -> String {
    format!("realtime/{}", topic.name())
}

/// Map one event's data onto a [`PushMessage`].
fn parse_event(data: &str) -> PushMessage {
    let data = data.trim();
    if data.is_empty() {
        return PushMessage::change(Value::Null);
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => {
            let is_envelope = value
                .as_object()
                .is_some_and(|object| object.contains_key("origin") || object.contains_key("payload"));
            if is_envelope {
                serde_json::from_value(value.clone()).unwrap_or_else(|_| PushMessage::change(value))
            } else {
                PushMessage::change(value)
            }
        }
        Err(_) => PushMessage::change(Value::String(data.to_string())),
    }
}

async fn read_stream(
    response: Response,
    name: String,
    sender: broadcast::Sender<PushMessage>,
    streams: Streams,
    cancel: CancellationToken,
) {
    let mut events = Box::pin(response.bytes_stream().eventsource());
    loop {
        let event = match events.next().or_cancel(&cancel).await {
            Err(_) => break,
            Ok(None) => {
                tracing::debug!("Event stream {name} ended");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!("Event stream {name} failed: {e}");
                break;
            }
            Ok(Some(Ok(event))) => event,
        };
        if KEEPALIVE_EVENTS.contains(&event.event.as_str()) {
            continue;
        }
        if sender.send(parse_event(&event.data)).is_err() {
            tracing::debug!("No listeners left on {name}; closing stream");
            break;
        }
    }

    let mut streams = streams.lock().unwrap_or_else(PoisonError::into_inner);
    if streams
        .get(&name)
        .is_some_and(|current| current.same_channel(&sender))
    {
        streams.remove(&name);
    }
}

#[async_trait]
impl PushChannel for SsePushChannel {
    async fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<PushMessage>, PushError> {
        let name = topic.name();
        if let Some(receiver) = self.existing(&name) {
            return Ok(receiver);
        }
        if self.shutdown.is_cancelled() {
            return Err(PushError::Closed);
        }

        let response = self
            .backend
            .streaming(&path_for(topic))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Transport(format!(
                "subscribing to {name} returned {status}"
            )));
        }

        let (sender, receiver) = broadcast::channel(STREAM_CAPACITY);
        {
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            // Lost a race with a concurrent subscribe; share its stream.
            if let Some(existing) = streams.get(&name) {
                return Ok(existing.subscribe());
            }
            streams.insert(name.clone(), sender.clone());
        }
        tracing::debug!("Opened event stream {name}");
        tokio::spawn(read_stream(
            response,
            name,
            sender,
            Arc::clone(&self.streams),
            self.shutdown.child_token(),
        ));
        Ok(receiver)
    }

    async fn publish(&self, topic: &Topic, message: PushMessage) -> Result<(), PushError> {
        let response = self
            .backend
            .post(&path_for(topic))
            .json(&message)
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Transport(format!(
                "publishing to {} returned {status}",
                topic.name()
            )));
        }
        Ok(())
    }
}
