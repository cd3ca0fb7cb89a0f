//! One `queue/data` connection per session. The server multiplexes every
//! submission of a session onto it, so a single pump task reads it and fans
//! messages out to per-submission channels by event id.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use super::QueueEvent;
use crate::error::{SpaceError, SpaceResult};
use crate::transport::{HttpRequest, HttpTransport};

/// Submissions whose messages arrive before they subscribe are buffered, up
/// to this many distinct ids.
const MAX_UNCLAIMED: usize = 64;

type EventSender = mpsc::UnboundedSender<SpaceResult<QueueEvent>>;

/// Normalises an event id to its string form. Servers send either strings
/// or numbers.
pub(crate) fn event_id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    msg: String,
    #[serde(default)]
    event_id: Option<Value>,
    #[serde(default)]
    rank: Option<u64>,
    #[serde(default)]
    queue_size: Option<u64>,
    #[serde(default)]
    rank_eta: Option<f64>,
    #[serde(default)]
    eta: Option<f64>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    progress_data: Option<Value>,
    #[serde(default)]
    log: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
    Event(QueueEvent),
    /// The server gave up on a submission.
    Error(String),
    /// The server is closing the session stream.
    Close,
    Ignored,
}

/// Parses one raw message into its event id (if any) and outcome.
pub(crate) fn decode(raw: &str) -> Result<(Option<String>, Outcome), serde_json::Error> {
    let message: WireMessage = serde_json::from_str(raw)?;
    let event_id = message.event_id.as_ref().and_then(event_id_from_value);
    let outcome = match message.msg.as_str() {
        "estimation" => Outcome::Event(QueueEvent::Estimation {
            rank: message.rank,
            queue_size: message.queue_size,
            eta: message.rank_eta,
        }),
        "process_starts" => Outcome::Event(QueueEvent::ProcessStarts { eta: message.eta }),
        "progress" => Outcome::Event(QueueEvent::Progress {
            data: message.progress_data.unwrap_or(Value::Null),
        }),
        "process_generating" => Outcome::Event(QueueEvent::Generating {
            output: message.output.unwrap_or(Value::Null),
            success: message.success.unwrap_or(true),
        }),
        "log" => Outcome::Event(QueueEvent::Log {
            level: message.level,
            message: message.log.unwrap_or_default(),
        }),
        "heartbeat" => Outcome::Event(QueueEvent::Heartbeat),
        "process_completed" => Outcome::Event(QueueEvent::Completed {
            success: message.success.unwrap_or(true),
            output: message.output.unwrap_or(Value::Null),
        }),
        "unexpected_error" => Outcome::Error(
            message
                .message
                .unwrap_or_else(|| "unknown error".to_string()),
        ),
        "close_stream" => Outcome::Close,
        other => {
            trace!(target = "space_client::queue", msg = other, "ignoring queue message");
            Outcome::Ignored
        }
    };
    Ok((event_id, outcome))
}

fn ends_stream(item: &SpaceResult<QueueEvent>) -> bool {
    !matches!(item, Ok(event) if !event.is_terminal())
}

#[derive(Default)]
struct RouterState {
    subscribers: HashMap<String, EventSender>,
    unclaimed: HashMap<String, Vec<SpaceResult<QueueEvent>>>,
    unclaimed_order: VecDeque<String>,
    /// Joins in flight; their ids are not known yet.
    pending_joins: usize,
    pumping: bool,
}

impl RouterState {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.pending_joins == 0
    }

    fn deliver(&mut self, event_id: &str, item: SpaceResult<QueueEvent>) {
        let finished = ends_stream(&item);
        match self.subscribers.get(event_id) {
            Some(sender) => {
                // A closed receiver is detached by its subscription's drop.
                let _ = sender.send(item);
                if finished {
                    self.subscribers.remove(event_id);
                }
            }
            None => self.stash(event_id, item),
        }
    }

    fn stash(&mut self, event_id: &str, item: SpaceResult<QueueEvent>) {
        if !self.unclaimed.contains_key(event_id) {
            if self.unclaimed_order.len() == MAX_UNCLAIMED {
                if let Some(oldest) = self.unclaimed_order.pop_front() {
                    self.unclaimed.remove(&oldest);
                    debug!(
                        target = "space_client::queue",
                        event_id = %oldest,
                        "dropping unclaimed queue messages"
                    );
                }
            }
            self.unclaimed_order.push_back(event_id.to_string());
        }
        self.unclaimed
            .entry(event_id.to_string())
            .or_default()
            .push(item);
    }

    fn broadcast(&mut self, event: QueueEvent) {
        for sender in self.subscribers.values() {
            let _ = sender.send(Ok(event.clone()));
        }
    }

    /// Ends every subscriber with an error built for its id.
    fn fail_all(&mut self, error: impl Fn(&str) -> SpaceError) {
        for (event_id, sender) in self.subscribers.drain() {
            let _ = sender.send(Err(error(&event_id)));
        }
    }
}

pub(crate) struct SessionQueue {
    transport: Arc<dyn HttpTransport>,
    request: HttpRequest,
    state: Mutex<RouterState>,
    idle: Notify,
}

impl fmt::Debug for SessionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionQueue")
            .field("url", &self.request.url.as_str())
            .field("subscribers", &state.subscribers.len())
            .field("pumping", &state.pumping)
            .finish()
    }
}

impl SessionQueue {
    pub(crate) fn new(transport: Arc<dyn HttpTransport>, request: HttpRequest) -> Self {
        Self {
            transport,
            request,
            state: Mutex::new(RouterState::default()),
            idle: Notify::new(),
        }
    }

    /// Holds the connection open while a join is in flight.
    pub(crate) fn begin_join(self: &Arc<Self>) -> JoinGuard {
        self.state.lock().pending_joins += 1;
        JoinGuard {
            queue: Arc::clone(self),
        }
    }

    /// Registers `event_id`, first handing over anything already buffered
    /// for it.
    pub(crate) fn subscribe(self: &Arc<Self>, event_id: &str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let mut open = true;
        if let Some(buffered) = state.unclaimed.remove(event_id) {
            state.unclaimed_order.retain(|id| id != event_id);
            for item in buffered {
                let finished = ends_stream(&item);
                let _ = sender.send(item);
                if finished {
                    open = false;
                    break;
                }
            }
        }
        if open {
            state.subscribers.insert(event_id.to_string(), sender);
        }
        drop(state);

        Subscription {
            queue: Arc::clone(self),
            event_id: event_id.to_string(),
            receiver,
            registered: open,
        }
    }

    /// Starts the pump unless one is already reading the connection.
    pub(crate) fn ensure_pump(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.pumping {
            return;
        }
        state.pumping = true;
        drop(state);
        tokio::spawn(Arc::clone(self).pump());
    }

    fn stop_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_idle() {
            state.pumping = false;
            true
        } else {
            false
        }
    }

    fn shut_down(&self, error: impl Fn(&str) -> SpaceError) {
        let mut state = self.state.lock();
        state.pumping = false;
        state.fail_all(error);
    }

    fn release(&self, event_id: Option<&str>) {
        let mut state = self.state.lock();
        match event_id {
            Some(event_id) => {
                state.subscribers.remove(event_id);
            }
            None => state.pending_joins = state.pending_joins.saturating_sub(1),
        }
        if state.is_idle() {
            self.idle.notify_one();
        }
    }

    async fn pump(self: Arc<Self>) {
        let mut messages = match self.transport.open_stream(self.request.clone()).await {
            Ok(messages) => messages,
            Err(err) => {
                let err = SpaceError::from(err);
                warn!(
                    target = "space_client::queue",
                    error = %err,
                    "failed to open queue stream"
                );
                self.shut_down(|_| err.clone());
                return;
            }
        };
        debug!(target = "space_client::queue", "queue stream opened");

        loop {
            tokio::select! {
                biased;
                _ = self.idle.notified() => {}
                message = messages.next() => match message {
                    Some(Ok(raw)) => {
                        if !self.route(&raw) {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let err = SpaceError::from(err);
                        self.shut_down(|_| err.clone());
                        return;
                    }
                    None => {
                        self.shut_down(|event_id| {
                            SpaceError::Server(format!(
                                "event stream ended before {event_id} completed"
                            ))
                        });
                        return;
                    }
                },
            }
            if self.stop_if_idle() {
                debug!(target = "space_client::queue", "queue stream idle; closing");
                return;
            }
        }
    }

    /// Routes one raw message. Returns false once the connection is done.
    fn route(&self, raw: &str) -> bool {
        let (event_id, outcome) = match decode(raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.shut_down(|event_id| {
                    SpaceError::MalformedResponse(format!("queue event for {event_id}: {err}"))
                });
                return false;
            }
        };

        let mut state = self.state.lock();
        match (outcome, event_id) {
            (Outcome::Ignored, _) => {}
            (Outcome::Close, _) => {
                state.pumping = false;
                state.fail_all(|event_id| {
                    SpaceError::Server(format!("event stream closed before {event_id} completed"))
                });
                return false;
            }
            (Outcome::Event(event), Some(event_id)) => state.deliver(&event_id, Ok(event)),
            (Outcome::Error(reason), Some(event_id)) => state.deliver(
                &event_id,
                Err(SpaceError::Server(format!(
                    "queue reported an error for {event_id}: {reason}"
                ))),
            ),
            (Outcome::Event(event), None) if !event.is_terminal() => state.broadcast(event),
            (Outcome::Event(event), None) => {
                let sole = if state.subscribers.len() == 1 {
                    state.subscribers.keys().next().cloned()
                } else {
                    None
                };
                match sole {
                    Some(event_id) => state.deliver(&event_id, Ok(event)),
                    None => warn!(
                        target = "space_client::queue",
                        "dropping completion without an event id"
                    ),
                }
            }
            (Outcome::Error(reason), None) => state.fail_all(|event_id| {
                SpaceError::Server(format!("queue reported an error for {event_id}: {reason}"))
            }),
        }
        true
    }
}

/// Dropped once the join's event id has been subscribed.
pub(crate) struct JoinGuard {
    queue: Arc<SessionQueue>,
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        self.queue.release(None);
    }
}

/// One submission's channel. Dropping it detaches the submission.
pub(crate) struct Subscription {
    queue: Arc<SessionQueue>,
    event_id: String,
    receiver: mpsc::UnboundedReceiver<SpaceResult<QueueEvent>>,
    /// False when the buffered messages already finished the submission.
    registered: bool,
}

impl Subscription {
    pub(crate) fn start(&self) {
        if self.registered {
            self.queue.ensure_pump();
        }
    }

    pub(crate) async fn recv(&mut self) -> Option<SpaceResult<QueueEvent>> {
        self.receiver.recv().await
    }

    pub(crate) fn event_id(&self) -> &str {
        &self.event_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.registered {
            self.queue.release(Some(&self.event_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn decode_normalises_numeric_event_ids() {
        let (event_id, outcome) =
            decode(r#"{"msg":"process_starts","event_id":42,"eta":1.0}"#).unwrap();
        assert_eq!(event_id.as_deref(), Some("42"));
        assert_eq!(outcome, Outcome::Event(QueueEvent::ProcessStarts { eta: Some(1.0) }));

        let (event_id, _) = decode(r#"{"msg":"heartbeat"}"#).unwrap();
        assert_eq!(event_id, None);
    }

    #[test_timeout::timeout]
    fn decode_maps_message_kinds() {
        let (_, outcome) = decode(
            r#"{"msg":"estimation","event_id":"123","rank":2,"queue_size":5,"rank_eta":1.5}"#,
        )
        .unwrap();
        assert_eq!(
            outcome,
            Outcome::Event(QueueEvent::Estimation {
                rank: Some(2),
                queue_size: Some(5),
                eta: Some(1.5)
            })
        );

        let completed = json!({
            "msg": "process_completed",
            "event_id": "123",
            "success": true,
            "output": {"data": ["hi"]}
        });
        let (_, outcome) = decode(&completed.to_string()).unwrap();
        assert!(matches!(outcome, Outcome::Event(event) if event.is_terminal()));

        assert_eq!(
            decode(r#"{"msg":"unexpected_error","message":"boom"}"#).unwrap().1,
            Outcome::Error("boom".into())
        );
        assert_eq!(decode(r#"{"msg":"close_stream"}"#).unwrap().1, Outcome::Close);
        assert_eq!(decode(r#"{"msg":"send_hash"}"#).unwrap().1, Outcome::Ignored);
        assert!(decode("not json").is_err());
    }

    #[test_timeout::timeout]
    fn unclaimed_messages_wait_for_their_subscriber() {
        let mut state = RouterState::default();
        state.deliver("a", Ok(QueueEvent::Heartbeat));
        state.deliver(
            "a",
            Ok(QueueEvent::Completed {
                success: true,
                output: Value::Null,
            }),
        );
        assert_eq!(state.unclaimed["a"].len(), 2);

        for index in 0..MAX_UNCLAIMED {
            state.deliver(&format!("other-{index}"), Ok(QueueEvent::Heartbeat));
        }
        assert!(!state.unclaimed.contains_key("a"));
        assert_eq!(state.unclaimed.len(), MAX_UNCLAIMED);
    }

    #[test_timeout::timeout]
    fn terminal_delivery_detaches_the_subscriber() {
        let mut state = RouterState::default();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        state.subscribers.insert("a".into(), sender);

        state.deliver("a", Ok(QueueEvent::Heartbeat));
        assert!(!state.is_idle());
        state.deliver(
            "a",
            Ok(QueueEvent::Completed {
                success: true,
                output: Value::Null,
            }),
        );
        assert!(state.is_idle());
        assert_eq!(receiver.try_recv().unwrap(), Ok(QueueEvent::Heartbeat));
        assert!(receiver.try_recv().unwrap().unwrap().is_terminal());
    }
}
