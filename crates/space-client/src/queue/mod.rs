//! Queue protocol: `join` hands back an event id, and the session's event
//! connection then reports that submission's progress until a terminal
//! message.

mod router;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SpaceError, SpaceResult};
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::transport::{join_url, HttpRequest, HttpTransport};
use router::{event_id_from_value, Subscription};

pub(crate) use router::SessionQueue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Index(u64),
    /// Named endpoint, with or without the leading `/`.
    Name(String),
}

/// One unit of work for the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub endpoint: Endpoint,
    pub data: Vec<Value>,
    pub event_data: Option<Value>,
    pub trigger_id: Option<u64>,
}

impl Submission {
    pub fn by_index(fn_index: u64, data: Vec<Value>) -> Self {
        Self::new(Endpoint::Index(fn_index), data)
    }

    pub fn by_name(api_name: impl Into<String>, data: Vec<Value>) -> Self {
        Self::new(Endpoint::Name(api_name.into()), data)
    }

    fn new(endpoint: Endpoint, data: Vec<Value>) -> Self {
        Self {
            endpoint,
            data,
            event_data: None,
            trigger_id: None,
        }
    }

    pub fn with_event_data(mut self, event_data: Value) -> Self {
        self.event_data = Some(event_data);
        self
    }

    pub fn with_trigger_id(mut self, trigger_id: u64) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Estimation {
        rank: Option<u64>,
        queue_size: Option<u64>,
        eta: Option<f64>,
    },
    ProcessStarts {
        eta: Option<f64>,
    },
    Progress {
        data: Value,
    },
    /// Intermediate output of a generator endpoint.
    Generating {
        output: Value,
        success: bool,
    },
    Log {
        level: Option<String>,
        message: String,
    },
    Heartbeat,
    /// Terminal.
    Completed {
        success: bool,
        output: Value,
    },
}

impl QueueEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueEvent::Completed { .. })
    }
}

#[derive(Debug, Deserialize)]
struct JoinResponse {
    event_id: Value,
}

enum StreamState {
    Idle(Subscription),
    Open(Subscription),
    Done,
}

/// Finite, ordered progress of one submission. The session's connection
/// opens on first poll; the stream ends after a terminal event or the first
/// error.
pub struct EventStream {
    event_id: String,
    inner: stream::Fuse<BoxStream<'static, SpaceResult<QueueEvent>>>,
}

impl EventStream {
    fn new(subscription: Subscription) -> Self {
        let event_id = subscription.event_id().to_string();
        let inner = stream::unfold(StreamState::Idle(subscription), next_event)
            .boxed()
            .fuse();
        Self { event_id, inner }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }
}

impl Stream for EventStream {
    type Item = SpaceResult<QueueEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

async fn next_event(state: StreamState) -> Option<(SpaceResult<QueueEvent>, StreamState)> {
    let mut subscription = match state {
        StreamState::Done => return None,
        StreamState::Idle(subscription) => {
            subscription.start();
            subscription
        }
        StreamState::Open(subscription) => subscription,
    };
    match subscription.recv().await {
        Some(Ok(event)) if event.is_terminal() => Some((Ok(event), StreamState::Done)),
        Some(Ok(event)) => Some((Ok(event), StreamState::Open(subscription))),
        Some(Err(err)) => Some((Err(err), StreamState::Done)),
        None => {
            let err = SpaceError::Server(format!(
                "event stream ended before {} completed",
                subscription.event_id()
            ));
            Some((Err(err), StreamState::Done))
        }
    }
}

pub struct QueueClient {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
}

impl QueueClient {
    pub fn new(transport: Arc<dyn HttpTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Enqueues `submission` and returns its event id. Server errors are
    /// retried; no event id is returned unless the join succeeded.
    pub async fn join(
        &self,
        session: &Session,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> SpaceResult<String> {
        let fn_index = match &submission.endpoint {
            Endpoint::Index(index) => *index,
            Endpoint::Name(name) => session.config().fn_index(name).ok_or_else(|| {
                SpaceError::NotFound(format!("endpoint '{name}' on {}", session.target()))
            })?,
        };
        let url = join_url(session.root(), "queue/join")?;
        let body = json!({
            "data": submission.data,
            "fn_index": fn_index,
            "session_hash": session.session_hash(),
            "event_data": submission.event_data,
            "trigger_id": submission.trigger_id,
        });

        let event_id = self
            .retry
            .run("queue_join", cancel, || {
                let request = session.authorize(HttpRequest::post(url.clone()).json(body.clone()));
                async move {
                    let response = self.transport.send(request).await?;
                    if !response.is_success() {
                        return Err(SpaceError::from_status(response.status, "queue join"));
                    }
                    let joined: JoinResponse = response.json().map_err(|err| {
                        SpaceError::MalformedResponse(format!("queue join: {err}"))
                    })?;
                    event_id_from_value(&joined.event_id).ok_or_else(|| {
                        SpaceError::MalformedResponse(format!(
                            "queue join returned event id {}",
                            joined.event_id
                        ))
                    })
                }
            })
            .await?;

        debug!(
            target = "space_client::queue",
            space = %session.target(),
            fn_index,
            event_id = %event_id,
            "submission queued"
        );
        Ok(event_id)
    }

    /// Events for `event_id`. Nothing is requested until the stream is
    /// polled; every stream of a session shares one connection.
    pub fn events(
        &self,
        session: &Session,
        event_id: impl Into<String>,
    ) -> SpaceResult<EventStream> {
        let queue = self.session_queue(session)?;
        Ok(EventStream::new(queue.subscribe(&event_id.into())))
    }

    pub async fn submit(
        &self,
        session: &Session,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> SpaceResult<EventStream> {
        let queue = self.session_queue(session)?;
        let _joining = queue.begin_join();
        let event_id = self.join(session, submission, cancel).await?;
        Ok(EventStream::new(queue.subscribe(&event_id)))
    }

    fn session_queue(&self, session: &Session) -> SpaceResult<Arc<SessionQueue>> {
        if let Some(queue) = session.event_queue().get() {
            return Ok(Arc::clone(queue));
        }
        let mut url = join_url(session.root(), "queue/data")?;
        url.query_pairs_mut()
            .append_pair("session_hash", session.session_hash());
        let request = session.authorize(HttpRequest::get(url));
        let queue = session
            .event_queue()
            .get_or_init(|| Arc::new(SessionQueue::new(Arc::clone(&self.transport), request)));
        Ok(Arc::clone(queue))
    }
}

/// Drains `events` to the completed output. Generator endpoints yield their
/// last intermediate output when completion carries none.
pub async fn collect_output(mut events: EventStream) -> SpaceResult<Value> {
    let mut last_generated = Value::Null;
    while let Some(event) = events.next().await {
        match event? {
            QueueEvent::Generating { output, .. } => last_generated = output,
            QueueEvent::Completed { success: true, output } => {
                return Ok(if output.is_null() { last_generated } else { output });
            }
            QueueEvent::Completed { success: false, output } => {
                let reason = output
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| output.to_string());
                warn!(
                    target = "space_client::queue",
                    event_id = %events.event_id(),
                    reason = %reason,
                    "prediction failed"
                );
                return Err(SpaceError::Server(format!("prediction failed: {reason}")));
            }
            _ => {}
        }
    }
    Err(SpaceError::Server(format!(
        "event stream for {} ended without a result",
        events.event_id()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn submission_builders() {
        let submission = Submission::by_name("/predict", vec![json!("hi")])
            .with_event_data(json!({"x": 1}))
            .with_trigger_id(4);
        assert_eq!(submission.endpoint, Endpoint::Name("/predict".into()));
        assert_eq!(submission.trigger_id, Some(4));
    }
}
