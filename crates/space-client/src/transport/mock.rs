//! Scripted in-memory transport. Routes are matched on method plus URL
//! (query string ignored) and every request is recorded, so tests can assert
//! on exactly which network calls were made.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use url::Url;

use super::{
    HttpRequest, HttpResponse, HttpTransport, Method, MessageStream, StatusCode, TransportError,
};

type Handler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

#[derive(Clone)]
enum ScriptedStream {
    Messages(Vec<String>),
    Status(StatusCode),
}

#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), Handler>>,
    streams: Mutex<HashMap<String, ScriptedStream>>,
    requests: Mutex<Vec<HttpRequest>>,
    latency: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response, letting tests overlap concurrent calls.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn on<F>(&self, method: Method, url: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .insert((method, route_key_str(url)), Arc::new(handler));
    }

    pub fn respond(&self, method: Method, url: &str, response: HttpResponse) {
        self.on(method, url, move |_| response.clone());
    }

    pub fn stream(&self, url: &str, messages: Vec<String>) {
        self.streams
            .lock()
            .insert(route_key_str(url), ScriptedStream::Messages(messages));
    }

    pub fn stream_status(&self, url: &str, status: StatusCode) {
        self.streams
            .lock()
            .insert(route_key_str(url), ScriptedStream::Status(status));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of recorded requests for `method` whose URL (sans query) is `url`.
    pub fn count(&self, method: Method, url: &str) -> usize {
        let key = route_key_str(url);
        self.requests
            .lock()
            .iter()
            .filter(|request| request.method == method && route_key(&request.url) == key)
            .count()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.clone());
        self.simulate_latency().await;
        let handler = self
            .routes
            .lock()
            .get(&(request.method.clone(), route_key(&request.url)))
            .cloned();
        Ok(match handler {
            Some(handler) => handler(&request),
            None => HttpResponse::empty(StatusCode::NOT_FOUND),
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<MessageStream, TransportError> {
        self.requests.lock().push(request.clone());
        self.simulate_latency().await;
        let script = self.streams.lock().get(&route_key(&request.url)).cloned();
        match script {
            Some(ScriptedStream::Messages(messages)) => {
                Ok(futures::stream::iter(messages.into_iter().map(Ok)).boxed())
            }
            Some(ScriptedStream::Status(status)) => Err(TransportError::Status(status)),
            None => Err(TransportError::Status(StatusCode::NOT_FOUND)),
        }
    }
}

fn route_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

fn route_key_str(url: &str) -> String {
    Url::parse(url)
        .map(|parsed| route_key(&parsed))
        .unwrap_or_else(|_| url.to_string())
}
