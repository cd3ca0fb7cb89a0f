//! The entry point: turns a [`SpaceTarget`] into a ready [`Session`] and
//! runs work against it.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthManager, Identity};
use crate::config::ClientConfig;
use crate::error::{SpaceError, SpaceResult};
use crate::host::HostResolver;
use crate::hub::HubClient;
use crate::queue::{collect_output, EventStream, QueueClient, Submission};
use crate::reference::{Credential, SpaceReference, SpaceTarget};
use crate::retry::cancellable;
use crate::runtime::RuntimeMonitor;
use crate::session::{Host, ResolutionStatus, Session, SessionOptions};
use crate::space_config::{ApiInfo, ConfigFetcher, ConfigSnapshot};
use crate::transport::http::ReqwestTransport;
use crate::transport::{join_url, HttpRequest, HttpTransport, UploadFile};
use crate::upload::{UploadManager, UploadResult};

pub struct SpaceClient {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    hosts: HostResolver,
    auth: AuthManager,
    configs: ConfigFetcher,
    runtime: RuntimeMonitor,
    queue: QueueClient,
    uploads: UploadManager,
    hub: HubClient,
}

impl SpaceClient {
    pub fn new(config: ClientConfig) -> SpaceResult<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Self::with_transport(Arc::new(transport), config)
    }

    pub fn with_transport(
        transport: Arc<dyn HttpTransport>,
        config: ClientConfig,
    ) -> SpaceResult<Self> {
        let hub = config.hub_base()?;
        let retry = config.retry_policy();
        Ok(Self {
            hosts: HostResolver::new(Arc::clone(&transport), hub.clone()),
            auth: AuthManager::new(Arc::clone(&transport), hub.clone(), retry),
            configs: ConfigFetcher::new(Arc::clone(&transport), retry),
            runtime: RuntimeMonitor::new(Arc::clone(&transport), hub.clone(), &config),
            queue: QueueClient::new(Arc::clone(&transport), retry),
            uploads: UploadManager::new(Arc::clone(&transport)),
            hub: HubClient::new(Arc::clone(&transport), hub, retry),
            transport,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn hub(&self) -> &HubClient {
        &self.hub
    }

    pub fn runtime(&self) -> &RuntimeMonitor {
        &self.runtime
    }

    /// Resolves `target` into a ready session: host, then config, then the
    /// optional credential steps, then runtime readiness. The first permanent
    /// failure ends resolution.
    pub async fn resolve(
        &self,
        target: impl Into<SpaceTarget>,
        options: SessionOptions,
    ) -> SpaceResult<Session> {
        let target = target.into();
        let mut options = options;
        if options.credential.is_none() {
            options.credential = self.config.credential();
        }

        let outcome = self.resolve_inner(&target, &options).await;
        match &outcome {
            Ok(session) => {
                info!(target = "space_client::client", session = %session, "session ready");
                options.report(ResolutionStatus::Ready);
            }
            Err(err) => warn!(
                target = "space_client::client",
                space = %target,
                error = %err,
                "session resolution failed"
            ),
        }
        outcome
    }

    async fn resolve_inner(
        &self,
        target: &SpaceTarget,
        options: &SessionOptions,
    ) -> SpaceResult<Session> {
        let cancel = &options.cancel;
        let credential = options.credential.as_ref();
        if cancel.is_cancelled() {
            return Err(SpaceError::Cancelled);
        }

        let host = match target {
            SpaceTarget::Reference(reference) => {
                self.hosts
                    .resolve_with_cancel(reference, credential, cancel)
                    .await?
            }
            SpaceTarget::Direct(url) => Host::direct(url.clone()),
        };
        options.report(ResolutionStatus::HostResolved {
            base_url: host.base_url().clone(),
        });

        let (config, runtime_checked) = self.fetch_config(target, &host, options).await?;
        options.report(ResolutionStatus::ConfigFetched {
            root: config.root().clone(),
        });

        if options.validate_credential {
            let identity = cancellable(cancel, self.auth.whoami(credential)).await?;
            options.report(ResolutionStatus::CredentialValidated {
                name: identity.name,
            });
        }

        let exchange_token = match (target.reference(), credential) {
            (Some(reference), Some(credential)) if options.exchange_token => Some(
                self.auth
                    .exchange_jwt(reference, Some(credential), cancel)
                    .await?,
            ),
            _ => None,
        };

        if let (Some(reference), false) = (target.reference(), runtime_checked) {
            self.runtime.wait_until_ready(reference, options).await?;
        }

        Ok(Session::new(
            target.clone(),
            host,
            options.credential.clone(),
            config,
            exchange_token,
        ))
    }

    /// Fetches the config document. For hub spaces that keep failing with
    /// server errors, waits for the runtime and tries once more; the flag
    /// reports whether that wait already happened.
    async fn fetch_config(
        &self,
        target: &SpaceTarget,
        host: &Host,
        options: &SessionOptions,
    ) -> SpaceResult<(ConfigSnapshot, bool)> {
        let cancel = &options.cancel;
        let credential = options.credential.as_ref();
        match (self.configs.fetch(host, credential, cancel).await, target.reference()) {
            (Ok(config), _) => Ok((config, false)),
            (Err(SpaceError::Server(reason)), Some(reference)) => {
                debug!(
                    target = "space_client::client",
                    reference = %reference,
                    reason = %reason,
                    "config unavailable; waiting for runtime"
                );
                self.runtime.wait_until_ready(reference, options).await?;
                let config = self.configs.fetch(host, credential, cancel).await?;
                Ok((config, true))
            }
            (Err(err), _) => Err(err),
        }
    }

    /// Joins the queue and returns the submission's event stream.
    pub async fn submit(
        &self,
        session: &Session,
        submission: &Submission,
    ) -> SpaceResult<EventStream> {
        self.queue
            .submit(session, submission, &CancellationToken::new())
            .await
    }

    /// Submits and waits for the completed output.
    pub async fn predict(&self, session: &Session, submission: &Submission) -> SpaceResult<Value> {
        collect_output(self.submit(session, submission).await?).await
    }

    pub async fn upload(
        &self,
        session: &Session,
        files: Vec<UploadFile>,
    ) -> SpaceResult<UploadResult> {
        self.uploads.upload(session, files).await
    }

    pub async fn api_info(&self, session: &Session) -> SpaceResult<ApiInfo> {
        self.configs
            .fetch_info(session, &CancellationToken::new())
            .await
    }

    /// Posts an arbitrary JSON body to the space root.
    pub async fn post_data(&self, session: &Session, body: Value) -> SpaceResult<Value> {
        let url = join_url(session.root(), "")?;
        let response = self
            .transport
            .send(session.authorize(HttpRequest::post(url).json(body)))
            .await?;
        if !response.is_success() {
            return Err(SpaceError::from_status(response.status, "post data"));
        }
        response
            .json()
            .map_err(|err| SpaceError::MalformedResponse(format!("post data: {err}")))
    }

    pub async fn whoami(&self, credential: Option<&Credential>) -> SpaceResult<Identity> {
        let fallback = self.config.credential();
        self.auth.whoami(credential.or(fallback.as_ref())).await
    }

    /// Forgets the cached host of `reference`; the next resolve looks it up again.
    pub fn invalidate(&self, reference: &SpaceReference) {
        self.hosts.invalidate(reference);
    }
}
