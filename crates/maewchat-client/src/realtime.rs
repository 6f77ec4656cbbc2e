//! Realtime change feeds over the platform's Phoenix-channel websocket.
//!
//! One socket per client, opened when the first subscription is made and
//! reopened by the next subscription after it drops. A background task owns
//! the socket; subscriptions talk to it through a command channel and receive
//! their changes on a per-topic channel.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, trace, warn};
use url::Url;

use maewchat_types::events::{
    ChangeData, ChangeEvent, PHX_CLOSE, PHX_ERROR, PHX_REPLY, POSTGRES_CHANGES, PhoenixMessage,
    PostgresChangeFilter, PostgresChangesPayload, ReplyPayload, join_payload,
};

use crate::config::endpoint;
use crate::error::ClientError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const PROTOCOL_VSN: &str = "1.0.0";

/// Topic prefix every realtime channel carries on the wire.
const TOPIC_PREFIX: &str = "realtime:";

enum Command {
    Join {
        id: u64,
        topic: String,
        payload: Value,
        events: mpsc::UnboundedSender<ChangeData>,
        joined: oneshot::Sender<Result<(), ClientError>>,
    },
    Leave {
        id: u64,
        topic: String,
    },
    /// A refreshed JWT for every joined channel.
    AccessToken(String),
}

pub struct RealtimeClient {
    endpoint: Url,
    next_id: AtomicU64,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl RealtimeClient {
    pub(crate) fn new(project: &Url, api_key: &str) -> Result<Self, ClientError> {
        let mut url = endpoint(project, "realtime/v1/websocket");
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(ClientError::Invalid(format!("Unsupported URL scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Invalid(format!("Cannot switch URL to {scheme}")))?;
        url.query_pairs_mut()
            .append_pair("apikey", api_key)
            .append_pair("vsn", PROTOCOL_VSN);
        Ok(Self {
            endpoint: url,
            next_id: AtomicU64::new(1),
            commands: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Push a refreshed access token to the joined channels, so the platform
    /// does not close them when the old token expires. No-op without a socket.
    pub fn set_auth(&self, access_token: &str) {
        let slot = match self.commands.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(Command::AccessToken(access_token.to_string()));
        }
    }

    /// Command sender of the live socket task, spawning one if there is none.
    fn connection(&self) -> mpsc::UnboundedSender<Command> {
        let mut slot = match self.commands.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = slot.as_ref().filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(self.endpoint.clone(), rx));
        *slot = Some(tx.clone());
        tx
    }

    /// Join `name` with the given change bindings. Resolves once the platform
    /// acknowledged the join.
    pub async fn subscribe<T: DeserializeOwned>(
        &self,
        name: &str,
        filters: &[PostgresChangeFilter],
        access_token: &str,
    ) -> Result<Subscription<T>, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic = format!("{TOPIC_PREFIX}{name}");
        let commands = self.connection();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (joined_tx, joined_rx) = oneshot::channel();
        commands
            .send(Command::Join {
                id,
                topic: topic.clone(),
                payload: join_payload(filters, access_token),
                events: events_tx,
                joined: joined_tx,
            })
            .map_err(|_| ClientError::Closed)?;
        joined_rx.await.map_err(|_| ClientError::Closed)??;

        debug!("Subscribed to {}", topic);
        let leave_topic = topic.clone();
        Ok(Subscription::new(topic, events_rx, move || {
            let _ = commands.send(Command::Leave { id, topic: leave_topic });
        }))
    }
}

/// Acquire/release handle on one realtime channel.
///
/// Changes come out of [`next`](Self::next) in the order the socket delivered
/// them. [`release`](Self::release) leaves the channel; dropping the handle
/// does the same.
pub struct Subscription<T> {
    topic: String,
    events: mpsc::UnboundedReceiver<ChangeData>,
    release: Option<Box<dyn FnOnce() + Send>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    pub fn new(
        topic: impl Into<String>,
        events: mpsc::UnboundedReceiver<ChangeData>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            events,
            release: Some(Box::new(release)),
            _record: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next change, or `None` once the channel or socket is gone. Rows that do
    /// not decode as `T` are logged and skipped.
    pub async fn next(&mut self) -> Option<ChangeEvent<T>> {
        loop {
            let data = self.events.recv().await?;
            match data.decode() {
                Ok(event) => return Some(event),
                Err(e) => warn!("Undecodable change on {}: {}", self.topic, e),
            }
        }
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            debug!("Releasing {}", self.topic);
            release();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// -- Socket task --

struct PendingJoin {
    id: u64,
    topic: String,
    events: mpsc::UnboundedSender<ChangeData>,
    joined: oneshot::Sender<Result<(), ClientError>>,
}

struct Route {
    id: u64,
    join_ref: String,
    events: mpsc::UnboundedSender<ChangeData>,
}

/// Channel bookkeeping for one socket, kept apart from the IO so the routing
/// rules can be exercised without a server.
#[derive(Default)]
struct Channels {
    next_ref: u64,
    pending: HashMap<String, PendingJoin>,
    routes: HashMap<String, Route>,
}

impl Channels {
    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn heartbeat(&mut self) -> PhoenixMessage {
        let msg_ref = self.make_ref();
        PhoenixMessage::heartbeat(msg_ref)
    }

    fn command(&mut self, command: Command) -> Vec<PhoenixMessage> {
        match command {
            Command::Join { id, topic, payload, events, joined } => {
                let msg_ref = self.make_ref();
                let frame = PhoenixMessage::join(&topic, payload, msg_ref.clone());
                self.pending.insert(msg_ref, PendingJoin { id, topic, events, joined });
                vec![frame]
            }
            Command::Leave { id, topic } => {
                // A newer subscription may have taken the topic over.
                let owned = self.routes.get(&topic).is_some_and(|r| r.id == id);
                if owned {
                    self.routes.remove(&topic);
                    let msg_ref = self.make_ref();
                    return vec![PhoenixMessage::leave(&topic, msg_ref)];
                }
                self.pending.retain(|_, p| p.id != id);
                Vec::new()
            }
            Command::AccessToken(token) => {
                let joined: Vec<(String, String)> = self
                    .routes
                    .iter()
                    .map(|(topic, route)| (topic.clone(), route.join_ref.clone()))
                    .collect();
                debug!("Refreshing access token on {} channels", joined.len());
                joined
                    .into_iter()
                    .map(|(topic, join_ref)| {
                        let msg_ref = self.make_ref();
                        PhoenixMessage::access_token(&topic, &token, &join_ref, msg_ref)
                    })
                    .collect()
            }
        }
    }

    /// Apply one incoming frame. Returns a frame to send back, if any.
    fn incoming(&mut self, frame: PhoenixMessage) -> Option<PhoenixMessage> {
        match frame.event.as_str() {
            PHX_REPLY => {
                let pending = frame.msg_ref.as_ref().and_then(|r| self.pending.remove(r))?;
                let reply: ReplyPayload = match serde_json::from_value(frame.payload) {
                    Ok(reply) => reply,
                    Err(e) => {
                        let _ = pending
                            .joined
                            .send(Err(ClientError::Realtime(format!("Malformed join reply: {e}"))));
                        return None;
                    }
                };
                if !reply.is_ok() {
                    let _ = pending.joined.send(Err(ClientError::Realtime(reply.reason())));
                    return None;
                }
                let join_ref = frame.msg_ref.unwrap_or_default();
                if pending.joined.send(Ok(())).is_err() {
                    // Subscriber gave up before the ack arrived.
                    let msg_ref = self.make_ref();
                    return Some(PhoenixMessage::leave(&pending.topic, msg_ref));
                }
                info!("Joined {}", pending.topic);
                self.routes.insert(
                    pending.topic,
                    Route { id: pending.id, join_ref, events: pending.events },
                );
                None
            }
            POSTGRES_CHANGES => {
                let Some(route) = self.routes.get(&frame.topic) else {
                    trace!("Change for unrouted topic {}", frame.topic);
                    return None;
                };
                match serde_json::from_value::<PostgresChangesPayload>(frame.payload) {
                    Ok(payload) => {
                        if route.events.send(payload.data).is_err() {
                            trace!("Subscriber for {} is gone", frame.topic);
                        }
                    }
                    Err(e) => warn!("Malformed change on {}: {}", frame.topic, e),
                }
                None
            }
            PHX_ERROR | PHX_CLOSE => {
                let matches = self.routes.get(&frame.topic).is_some_and(|r| {
                    frame.join_ref.as_ref().is_none_or(|j| *j == r.join_ref)
                });
                if matches {
                    warn!("Channel {} closed by server ({})", frame.topic, frame.event);
                    self.routes.remove(&frame.topic);
                }
                None
            }
            _ => None,
        }
    }
}

async fn run_socket(endpoint: Url, mut commands: mpsc::UnboundedReceiver<Command>) {
    let socket = match tokio_tungstenite::connect_async(endpoint.as_str()).await {
        Ok((socket, _)) => socket,
        Err(e) => {
            warn!("Realtime connect failed: {}", e);
            let reason = e.to_string();
            commands.close();
            while let Some(command) = commands.recv().await {
                if let Command::Join { joined, .. } = command {
                    let _ = joined.send(Err(ClientError::Realtime(reason.clone())));
                }
            }
            return;
        }
    };
    info!("Realtime socket connected");

    let (mut sink, mut stream) = socket.split();
    let mut channels = Channels::default();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    'socket: loop {
        let outgoing: Vec<PhoenixMessage> = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => channels.command(command),
                // Client dropped.
                None => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<PhoenixMessage>(text.as_str()) {
                    Ok(frame) => channels.incoming(frame).into_iter().collect(),
                    Err(e) => {
                        warn!("Unparseable realtime frame: {}", e);
                        Vec::new()
                    }
                },
                Some(Ok(WsMessage::Ping(data))) => {
                    if sink.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                    Vec::new()
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    warn!("Realtime socket error: {}", e);
                    break;
                }
            },
            _ = heartbeat.tick() => vec![channels.heartbeat()],
        };

        for frame in outgoing {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Cannot encode realtime frame: {}", e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break 'socket;
            }
        }
    }

    // Dropping `channels` ends every subscription stream and fails pending joins.
    info!("Realtime socket closed");
}
