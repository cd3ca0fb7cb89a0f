use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::auth::AuthManager;
use crate::error::{SpaceError, SpaceResult};
use crate::reference::Credential;
use crate::retry::RetryPolicy;
use crate::session::{Host, Session};
use crate::transport::{join_url, HttpRequest, HttpResponse, HttpTransport, StatusCode};

/// Capability document of a running space.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    root: Url,
    version: Option<String>,
    protocol: Option<String>,
    space_id: Option<String>,
    auth_required: bool,
    components: Vec<Value>,
    dependencies: Vec<Value>,
    raw: Value,
}

impl ConfigSnapshot {
    /// Builds a snapshot from the raw document. `root` wins over the host
    /// the document was fetched from.
    pub fn from_document(host: &Host, raw: Value) -> SpaceResult<Self> {
        let object = raw.as_object().ok_or_else(|| {
            SpaceError::MalformedResponse("space config is not a json object".into())
        })?;
        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let list = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        let root = match text("root") {
            Some(root) => Url::parse(&root)
                .or_else(|_| join_url(host.base_url(), &root).map_err(|err| err.to_string()))
                .map_err(|err| {
                    SpaceError::MalformedResponse(format!("space config root '{root}': {err}"))
                })?,
            None => host.base_url().clone(),
        };

        Ok(Self {
            root,
            version: text("version"),
            protocol: text("protocol"),
            space_id: text("space_id"),
            auth_required: object
                .get("auth_required")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            components: list("components"),
            dependencies: list("dependencies"),
            raw,
        })
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn space_id(&self) -> Option<&str> {
        self.space_id.as_deref()
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    pub fn components(&self) -> &[Value] {
        &self.components
    }

    pub fn dependencies(&self) -> &[Value] {
        &self.dependencies
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Dependency index serving the named endpoint (`/predict` or `predict`).
    pub fn fn_index(&self, api_name: &str) -> Option<u64> {
        let wanted = api_name.trim().trim_start_matches('/');
        self.dependencies
            .iter()
            .enumerate()
            .find(|(_, dependency)| {
                dependency
                    .get("api_name")
                    .and_then(Value::as_str)
                    .map(|name| name.trim_start_matches('/') == wanted)
                    .unwrap_or(false)
            })
            .map(|(index, dependency)| {
                dependency
                    .get("id")
                    .and_then(Value::as_u64)
                    .unwrap_or(index as u64)
            })
    }
}

/// Endpoint signatures published at `{root}/info`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiInfo {
    raw: Value,
}

impl ApiInfo {
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn named_endpoints(&self) -> Vec<String> {
        self.raw
            .get("named_endpoints")
            .and_then(Value::as_object)
            .map(|endpoints| endpoints.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct ConfigFetcher {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
}

impl ConfigFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub async fn fetch(
        &self,
        host: &Host,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> SpaceResult<ConfigSnapshot> {
        let url = join_url(host.base_url(), "config")?;
        let raw = self
            .retry
            .run("fetch_config", cancel, || {
                let request = AuthManager::attach(HttpRequest::get(url.clone()), credential);
                self.get_document(request, "space config")
            })
            .await?;
        let snapshot = ConfigSnapshot::from_document(host, raw)?;
        debug!(
            target = "space_client::config",
            host = %host.base_url(),
            root = %snapshot.root(),
            version = snapshot.version().unwrap_or("unknown"),
            "space config fetched"
        );
        Ok(snapshot)
    }

    pub async fn fetch_info(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> SpaceResult<ApiInfo> {
        let url = join_url(session.root(), "info")?;
        let raw = self
            .retry
            .run("fetch_info", cancel, || {
                let request = session.authorize(HttpRequest::get(url.clone()));
                self.get_document(request, "api info")
            })
            .await?;
        Ok(ApiInfo { raw })
    }

    async fn get_document(&self, request: HttpRequest, what: &'static str) -> SpaceResult<Value> {
        let response = self.transport.send(request).await?;
        document_from_response(response, what)
    }
}

fn document_from_response(response: HttpResponse, what: &str) -> SpaceResult<Value> {
    match response.status {
        status if status.is_success() => response
            .json::<Value>()
            .map_err(|err| SpaceError::MalformedResponse(format!("{what}: {err}"))),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SpaceError::Unauthorized(
            format!("{what} ({})", response.status),
        )),
        // Cold-starting spaces answer with all sorts of statuses; treat them as transient.
        status => Err(SpaceError::Server(format!("{what} ({status})"))),
    }
}
