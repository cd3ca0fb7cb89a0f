use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest_eventsource::{Event, EventSource};

use super::{HttpRequest, HttpResponse, HttpTransport, MessageStream, RequestBody, TransportError};
use crate::config::ClientConfig;

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self { client })
    }

    fn builder(&self, request: HttpRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(files) => {
                let mut form = Form::new();
                for file in files {
                    let mut part = Part::bytes(file.bytes.to_vec()).file_name(file.name);
                    if let Some(mime) = file.mime.as_deref() {
                        part = part.mime_str(mime)?;
                    }
                    form = form.part("files", part);
                }
                builder.multipart(form)
            }
        };
        Ok(builder)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self.builder(request)?.send().await?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<MessageStream, TransportError> {
        let mut source = EventSource::new(self.builder(request)?)
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        // Surface open failures (bad status) to the caller before handing out a stream.
        match source.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(_))) => {
                return Err(TransportError::Network(
                    "event stream sent data before opening".into(),
                ));
            }
            Some(Err(err)) => {
                source.close();
                return Err(event_source_error(err));
            }
            None => return Err(TransportError::Network("event stream closed".into())),
        }

        let stream = futures::stream::unfold(Some(source), |state| async move {
            let mut source = state?;
            loop {
                match source.next().await {
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(message))) => {
                        return Some((Ok(message.data), Some(source)));
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                        source.close();
                        return None;
                    }
                    Some(Err(err)) => {
                        source.close();
                        return Some((Err(event_source_error(err)), None));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

fn event_source_error(err: reqwest_eventsource::Error) -> TransportError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => TransportError::Status(status),
        reqwest_eventsource::Error::Transport(err) => TransportError::from(err),
        other => TransportError::Network(other.to_string()),
    }
}
