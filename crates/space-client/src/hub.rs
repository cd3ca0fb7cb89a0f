//! Hub-side management calls that sit outside the resolution path.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::auth::AuthManager;
use crate::error::{SpaceError, SpaceResult};
use crate::reference::{Credential, SpaceReference};
use crate::retry::RetryPolicy;
use crate::runtime::RuntimeStage;
use crate::transport::{join_url, HttpRequest, HttpResponse, HttpTransport, StatusCode};

/// Hub record of a space, reduced to what the client acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceSummary {
    pub id: String,
    pub stage: RuntimeStage,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    id: String,
    #[serde(default)]
    runtime: Option<RuntimeField>,
}

#[derive(Debug, Deserialize)]
struct RuntimeField {
    stage: String,
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateOptions {
    /// Target `owner/name`; the hub picks one when absent.
    pub repository: Option<String>,
    pub private: bool,
    pub hardware: Option<String>,
    pub sleep_time_secs: Option<u64>,
}

pub struct HubClient {
    transport: Arc<dyn HttpTransport>,
    hub: Url,
    retry: RetryPolicy,
}

impl HubClient {
    pub fn new(transport: Arc<dyn HttpTransport>, hub: Url, retry: RetryPolicy) -> Self {
        Self {
            transport,
            hub,
            retry,
        }
    }

    /// Clones `reference` into the credential owner's namespace and returns
    /// the hub's duplicate record.
    pub async fn duplicate(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
        options: &DuplicateOptions,
    ) -> SpaceResult<Value> {
        let credential = credential.ok_or_else(|| {
            SpaceError::Unauthorized("duplicating a space requires a token".into())
        })?;
        let url = space_url(&self.hub, reference, "duplicate")?;

        let mut body = json!({ "private": options.private });
        if let Some(repository) = &options.repository {
            body["repository"] = json!(repository);
        }
        if let Some(hardware) = &options.hardware {
            body["hardware"] = json!(hardware);
        }
        if let Some(seconds) = options.sleep_time_secs {
            body["sleepTimeSeconds"] = json!(seconds);
        }

        let request = AuthManager::attach(HttpRequest::post(url).json(body), Some(credential));
        let response = self.transport.send(request).await?;
        let record = json_or_error(response, &format!("duplicate {reference}"))?;
        info!(
            target = "space_client::hub",
            reference = %reference,
            "space duplicated"
        );
        Ok(record)
    }

    pub async fn set_sleep_time(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
        seconds: u64,
        cancel: &CancellationToken,
    ) -> SpaceResult<Value> {
        self.retry
            .run("set_sleep_time", cancel, || async move {
                let request = sleep_time_request(&self.hub, reference, credential, seconds)?;
                let response = self.transport.send(request).await?;
                json_or_error(response, &format!("sleep time for {reference}"))
            })
            .await
    }

    pub async fn space_summary(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> SpaceResult<SpaceSummary> {
        let url = join_url(
            &self.hub,
            &format!("api/spaces/{}/{}", reference.owner(), reference.name()),
        )?;
        let summary = self
            .retry
            .run("space_summary", cancel, || {
                let request = AuthManager::attach(HttpRequest::get(url.clone()), credential);
                async move {
                    let response = self.transport.send(request).await?;
                    if !response.is_success() {
                        return Err(SpaceError::from_status(
                            response.status,
                            &format!("summary of {reference}"),
                        ));
                    }
                    response.json::<SummaryResponse>().map_err(|err| {
                        SpaceError::MalformedResponse(format!("summary of {reference}: {err}"))
                    })
                }
            })
            .await?;

        let stage = summary
            .runtime
            .map(|runtime| RuntimeStage::parse(&runtime.stage))
            .unwrap_or_else(|| RuntimeStage::Unknown(String::new()));
        Ok(SpaceSummary {
            id: summary.id,
            stage,
        })
    }

    /// Probes whether discussions are enabled. A 403 means disabled and is
    /// not an error.
    pub async fn discussions_enabled(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
    ) -> SpaceResult<bool> {
        let url = space_url(&self.hub, reference, "discussions")?;
        let request = AuthManager::attach(HttpRequest::head(url), credential);
        let response = self.transport.send(request).await?;
        match response.status {
            status if status.is_success() => Ok(true),
            StatusCode::FORBIDDEN => {
                debug!(
                    target = "space_client::hub",
                    reference = %reference,
                    "discussions disabled"
                );
                Ok(false)
            }
            status => Err(SpaceError::from_status(
                status,
                &format!("discussions probe for {reference}"),
            )),
        }
    }
}

pub(crate) fn space_url(hub: &Url, reference: &SpaceReference, leaf: &str) -> SpaceResult<Url> {
    Ok(join_url(
        hub,
        &format!("api/spaces/{}/{}/{leaf}", reference.owner(), reference.name()),
    )?)
}

/// `POST /api/spaces/{ref}/sleeptime`. Also serves as the wake signal for
/// paused spaces.
pub(crate) fn sleep_time_request(
    hub: &Url,
    reference: &SpaceReference,
    credential: Option<&Credential>,
    seconds: u64,
) -> SpaceResult<HttpRequest> {
    let url = space_url(hub, reference, "sleeptime")?;
    Ok(AuthManager::attach(
        HttpRequest::post(url).json(json!({ "seconds": seconds })),
        credential,
    ))
}

fn json_or_error(response: HttpResponse, context: &str) -> SpaceResult<Value> {
    if !response.is_success() {
        return Err(SpaceError::from_status(response.status, context));
    }
    if response.body.is_empty() {
        return Ok(Value::Null);
    }
    response
        .json()
        .map_err(|err| SpaceError::MalformedResponse(format!("{context}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::Method;
    use std::time::Duration;

    fn hub_client(mock: Arc<MockTransport>) -> HubClient {
        HubClient::new(
            mock,
            Url::parse("https://huggingface.co").unwrap(),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10)),
        )
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn summary_reads_runtime_stage() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            Method::GET,
            "https://huggingface.co/api/spaces/hmb/paused_space",
            HttpResponse::json_body(
                StatusCode::OK,
                &json!({"id": "hmb/paused_space", "runtime": {"stage": "PAUSED"}}),
            ),
        );
        let summary = hub_client(mock)
            .space_summary(
                &SpaceReference::parse("hmb/paused_space").unwrap(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(summary.id, "hmb/paused_space");
        assert_eq!(summary.stage, RuntimeStage::Paused);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn summary_5xx_is_retried_then_surfaced() {
        let mock = Arc::new(MockTransport::new());
        let url = "https://huggingface.co/api/spaces/hmb/failed_space";
        mock.respond(Method::GET, url, HttpResponse::empty(StatusCode::INTERNAL_SERVER_ERROR));

        let err = hub_client(mock.clone())
            .space_summary(
                &SpaceReference::parse("hmb/failed_space").unwrap(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SpaceError::Server(_)));
        assert_eq!(mock.count(Method::GET, url), 2);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn discussions_probe_treats_403_as_disabled() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            Method::HEAD,
            "https://huggingface.co/api/spaces/hmb/hello_world/discussions",
            HttpResponse::empty(StatusCode::OK),
        );
        mock.respond(
            Method::HEAD,
            "https://huggingface.co/api/spaces/hmb/bye_world/discussions",
            HttpResponse::empty(StatusCode::FORBIDDEN),
        );
        let hub = hub_client(mock);

        let hello = SpaceReference::parse("hmb/hello_world").unwrap();
        let bye = SpaceReference::parse("hmb/bye_world").unwrap();
        assert!(hub.discussions_enabled(&hello, None).await.unwrap());
        assert!(!hub.discussions_enabled(&bye, None).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn duplicate_requires_a_token() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            Method::POST,
            "https://huggingface.co/api/spaces/hmb/hello_world/duplicate",
            |request| {
                if request.bearer_token() != Some("hf_123") {
                    return HttpResponse::empty(StatusCode::UNAUTHORIZED);
                }
                HttpResponse::json_body(StatusCode::OK, &json!({"url": "hmb/hello_world_copy"}))
            },
        );
        let hub = hub_client(mock.clone());
        let reference = SpaceReference::parse("hmb/hello_world").unwrap();

        let err = hub
            .duplicate(&reference, None, &DuplicateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SpaceError::Unauthorized(_)));
        assert!(mock.requests().is_empty());

        let wrong = Credential::new("hf_bad").unwrap();
        let err = hub
            .duplicate(&reference, Some(&wrong), &DuplicateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SpaceError::Unauthorized(_)));

        let right = Credential::new("hf_123").unwrap();
        let record = hub
            .duplicate(
                &reference,
                Some(&right),
                &DuplicateOptions {
                    private: true,
                    ..DuplicateOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(record["url"], "hmb/hello_world_copy");
        let sent = mock.requests().pop().unwrap();
        assert!(matches!(
            sent.body,
            crate::transport::RequestBody::Json(ref body) if body["private"] == true
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn sleep_time_posts_seconds() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            Method::POST,
            "https://huggingface.co/api/spaces/hmb/hello_world/sleeptime",
            HttpResponse::json_body(StatusCode::OK, &json!({"gcTimeout": 300})),
        );
        let record = hub_client(mock.clone())
            .set_sleep_time(
                &SpaceReference::parse("hmb/hello_world").unwrap(),
                None,
                300,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(record["gcTimeout"], 300);
        let sent = mock.requests().pop().unwrap();
        assert!(matches!(
            sent.body,
            crate::transport::RequestBody::Json(ref body) if body["seconds"] == 300
        ));
    }
}
