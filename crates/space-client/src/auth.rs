use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{SpaceError, SpaceResult};
use crate::reference::{Credential, SpaceReference};
use crate::retry::RetryPolicy;
use crate::session::ExchangeToken;
use crate::transport::{join_url, HttpRequest, HttpTransport};

/// Account behind a token, as reported by the identity endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default, deserialize_with = "org_names")]
    pub orgs: Vec<String>,
}

fn org_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Org {
        name: String,
    }
    let orgs = Option::<Vec<Org>>::deserialize(deserializer)?;
    Ok(orgs
        .unwrap_or_default()
        .into_iter()
        .map(|org| org.name)
        .collect())
}

#[derive(Debug, Deserialize)]
struct JwtResponse {
    token: String,
}

pub struct AuthManager {
    transport: Arc<dyn HttpTransport>,
    hub: Url,
    retry: RetryPolicy,
}

impl AuthManager {
    pub fn new(transport: Arc<dyn HttpTransport>, hub: Url, retry: RetryPolicy) -> Self {
        Self {
            transport,
            hub,
            retry,
        }
    }

    /// Adds `Authorization: Bearer` when a credential is present.
    pub fn attach(request: HttpRequest, credential: Option<&Credential>) -> HttpRequest {
        match credential {
            Some(credential) => Self::attach_token(request, credential.token()),
            None => request,
        }
    }

    pub(crate) fn attach_token(request: HttpRequest, token: &str) -> HttpRequest {
        request.header("Authorization", format!("Bearer {token}"))
    }

    /// Validates a token independent of any space. Any rejection or
    /// unreadable answer is reported as [`SpaceError::Unauthorized`].
    pub async fn whoami(&self, credential: Option<&Credential>) -> SpaceResult<Identity> {
        let credential = credential
            .ok_or_else(|| SpaceError::Unauthorized("identity check requires a token".into()))?;
        let url = join_url(&self.hub, "api/whoami-v2")?;
        let response = self
            .transport
            .send(Self::attach(HttpRequest::get(url), Some(credential)))
            .await
            .map_err(|err| SpaceError::Unauthorized(format!("identity check failed: {err}")))?;

        if !response.is_success() {
            return Err(SpaceError::Unauthorized(format!(
                "identity check failed ({})",
                response.status
            )));
        }
        let identity: Identity = response.json().map_err(|err| {
            SpaceError::Unauthorized(format!("identity check returned unreadable body: {err}"))
        })?;
        debug!(
            target = "space_client::auth",
            name = %identity.name,
            "credential validated"
        );
        Ok(identity)
    }

    /// Trades the long-lived credential for a token scoped to `reference`.
    /// Non-success statuses are server-side failures, retried with backoff.
    pub async fn exchange_jwt(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> SpaceResult<ExchangeToken> {
        let url = join_url(
            &self.hub,
            &format!("api/spaces/{}/{}/jwt", reference.owner(), reference.name()),
        )?;

        let token = self
            .retry
            .run("exchange_jwt", cancel, || {
                let request = Self::attach(HttpRequest::get(url.clone()), credential);
                async move {
                    let response = self.transport.send(request).await?;
                    if !response.is_success() {
                        warn!(
                            target = "space_client::auth",
                            reference = %reference,
                            status = %response.status,
                            "token exchange failed"
                        );
                        return Err(SpaceError::Server(format!(
                            "token exchange for {reference} failed ({})",
                            response.status
                        )));
                    }
                    let body: JwtResponse = response.json().map_err(|err| {
                        SpaceError::MalformedResponse(format!(
                            "token exchange for {reference}: {err}"
                        ))
                    })?;
                    Ok(body.token)
                }
            })
            .await?;

        debug!(
            target = "space_client::auth",
            reference = %reference,
            "exchange token issued"
        );
        Ok(ExchangeToken::new(token, reference.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::{HttpResponse, Method, StatusCode};
    use serde_json::json;
    use std::time::Duration;

    fn hub() -> Url {
        Url::parse("https://huggingface.co").unwrap()
    }

    fn manager(mock: Arc<MockTransport>) -> AuthManager {
        AuthManager::new(
            mock,
            hub(),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10)),
        )
    }

    #[test_timeout::timeout]
    fn attach_adds_bearer_only_with_credential() {
        let url = Url::parse("https://example.com").unwrap();
        let credential = Credential::new("hf_123").unwrap();

        let anonymous = AuthManager::attach(HttpRequest::get(url.clone()), None);
        assert!(anonymous.header_value("authorization").is_none());

        let authed = AuthManager::attach(HttpRequest::get(url), Some(&credential));
        assert_eq!(authed.header_value("Authorization"), Some("Bearer hf_123"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn whoami_parses_identity() {
        let mock = Arc::new(MockTransport::new());
        mock.on(Method::GET, "https://huggingface.co/api/whoami-v2", |request| {
            if request.bearer_token() != Some("hf_123") {
                return HttpResponse::empty(StatusCode::UNAUTHORIZED);
            }
            HttpResponse::json_body(
                StatusCode::OK,
                &json!({
                    "type": "user",
                    "name": "hmb",
                    "fullname": "Hannah",
                    "orgs": [{"name": "gradio"}]
                }),
            )
        });
        let auth = manager(mock);

        let identity = auth
            .whoami(Some(&Credential::new("hf_123").unwrap()))
            .await
            .unwrap();
        assert_eq!(identity.name, "hmb");
        assert_eq!(identity.kind.as_deref(), Some("user"));
        assert_eq!(identity.orgs, vec!["gradio".to_string()]);

        let err = auth
            .whoami(Some(&Credential::new("hf_bad").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, SpaceError::Unauthorized(_)));

        let err = auth.whoami(None).await.unwrap_err();
        assert!(matches!(err, SpaceError::Unauthorized(_)));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn exchange_returns_scoped_token() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(
            Method::GET,
            "https://huggingface.co/api/spaces/hmb/hello_world/jwt",
            HttpResponse::json_body(StatusCode::OK, &json!({"token": "jwt_123"})),
        );
        let auth = manager(mock);
        let reference = SpaceReference::parse("hmb/hello_world").unwrap();

        let token = auth
            .exchange_jwt(
                &reference,
                Some(&Credential::new("hf_123").unwrap()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(token.token(), "jwt_123");
        assert_eq!(token.space(), &reference);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn exchange_failure_is_a_server_error_after_retries() {
        let mock = Arc::new(MockTransport::new());
        let url = "https://huggingface.co/api/spaces/hmb/bye_world/jwt";
        mock.respond(Method::GET, url, HttpResponse::empty(StatusCode::INTERNAL_SERVER_ERROR));
        let auth = manager(mock.clone());
        let reference = SpaceReference::parse("hmb/bye_world").unwrap();

        let err = auth
            .exchange_jwt(&reference, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SpaceError::Server(_)));
        assert_eq!(mock.count(Method::GET, url), 2);
    }
}
