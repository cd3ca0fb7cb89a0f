use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::AuthManager;
use crate::queue::SessionQueue;
use crate::reference::{Credential, SpaceReference, SpaceTarget};
use crate::runtime::RuntimeStage;
use crate::space_config::ConfigSnapshot;
use crate::transport::HttpRequest;

/// Network location of a resolved space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    subdomain: String,
    base_url: Url,
}

impl Host {
    pub(crate) fn new(subdomain: impl Into<String>, base_url: Url) -> Self {
        Self {
            subdomain: subdomain.into(),
            base_url,
        }
    }

    /// Host for a space addressed by URL; the subdomain is the first host label.
    pub(crate) fn direct(base_url: Url) -> Self {
        let subdomain = base_url
            .host_str()
            .and_then(|host| host.split('.').next())
            .unwrap_or_default()
            .to_string();
        Self {
            subdomain,
            base_url,
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

/// Short-lived token scoped to one space.
#[derive(Clone, PartialEq, Eq)]
pub struct ExchangeToken {
    token: String,
    space: SpaceReference,
}

impl ExchangeToken {
    pub(crate) fn new(token: String, space: SpaceReference) -> Self {
        Self { token, space }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn space(&self) -> &SpaceReference {
        &self.space
    }
}

impl fmt::Debug for ExchangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeToken")
            .field("token", &"<redacted>")
            .field("space", &self.space)
            .finish()
    }
}

/// A ready-to-use handle bound to one space. Only the orchestrator builds
/// these, and only once the space reported itself running.
#[derive(Debug, Clone)]
pub struct Session {
    target: SpaceTarget,
    host: Host,
    credential: Option<Credential>,
    config: ConfigSnapshot,
    exchange_token: Option<ExchangeToken>,
    session_hash: String,
    /// Event connection shared by every clone of this session.
    events: Arc<OnceLock<Arc<SessionQueue>>>,
}

impl Session {
    pub(crate) fn new(
        target: SpaceTarget,
        host: Host,
        credential: Option<Credential>,
        config: ConfigSnapshot,
        exchange_token: Option<ExchangeToken>,
    ) -> Self {
        Self {
            target,
            host,
            credential,
            config,
            exchange_token,
            session_hash: uuid::Uuid::new_v4().simple().to_string(),
            events: Arc::default(),
        }
    }

    pub fn target(&self) -> &SpaceTarget {
        &self.target
    }

    pub fn reference(&self) -> Option<&SpaceReference> {
        self.target.reference()
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn config(&self) -> &ConfigSnapshot {
        &self.config
    }

    pub fn exchange_token(&self) -> Option<&ExchangeToken> {
        self.exchange_token.as_ref()
    }

    pub fn session_hash(&self) -> &str {
        &self.session_hash
    }

    /// Base for every request to the space itself. Comes from the config
    /// document, which may differ from the resolved host.
    pub fn root(&self) -> &Url {
        self.config.root()
    }

    pub(crate) fn event_queue(&self) -> &OnceLock<Arc<SessionQueue>> {
        &self.events
    }

    /// Requests to the space prefer the exchanged token over the long-lived one.
    pub(crate) fn authorize(&self, request: HttpRequest) -> HttpRequest {
        match &self.exchange_token {
            Some(exchange) => AuthManager::attach_token(request, exchange.token()),
            None => AuthManager::attach(request, self.credential.as_ref()),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "space={} host={} root={}",
            self.target,
            self.host.base_url(),
            self.root()
        )
    }
}

/// Progress notifications emitted while a session resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionStatus {
    HostResolved { base_url: Url },
    ConfigFetched { root: Url },
    CredentialValidated { name: String },
    RuntimeStage(RuntimeStage),
    Waking,
    Ready,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub credential: Option<Credential>,
    /// Overall runtime wait; falls back to the client configuration.
    pub runtime_timeout: Option<Duration>,
    pub cancel: CancellationToken,
    /// Exchange the credential for a space-scoped token.
    pub exchange_token: bool,
    /// Check the credential against the identity endpoint before use.
    pub validate_credential: bool,
    pub status: Option<mpsc::UnboundedSender<ResolutionStatus>>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_runtime_timeout(mut self, timeout: Duration) -> Self {
        self.runtime_timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_exchange_token(mut self, exchange: bool) -> Self {
        self.exchange_token = exchange;
        self
    }

    pub fn with_credential_validation(mut self, validate: bool) -> Self {
        self.validate_credential = validate;
        self
    }

    pub fn with_status(mut self, sender: mpsc::UnboundedSender<ResolutionStatus>) -> Self {
        self.status = Some(sender);
        self
    }

    pub(crate) fn report(&self, status: ResolutionStatus) {
        if let Some(sender) = &self.status {
            let _ = sender.send(status);
        }
    }
}
