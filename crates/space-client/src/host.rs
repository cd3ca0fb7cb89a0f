//! Maps `owner/name` references onto live hosts.
//!
//! Lookups are coalesced: concurrent callers asking for the same reference
//! with the same credential share one in-flight request and all receive its
//! outcome. A successful lookup stays cached until [`HostResolver::invalidate`]
//! or until another credential's lookup of the same reference succeeds;
//! failed ones are forgotten once every waiter has seen them.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::auth::AuthManager;
use crate::error::{SpaceError, SpaceResult};
use crate::reference::{Credential, SpaceReference};
use crate::retry::cancellable;
use crate::session::Host;
use crate::transport::{join_url, HttpRequest, HttpTransport, StatusCode};

type Lookup = Shared<BoxFuture<'static, SpaceResult<Host>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    reference: SpaceReference,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HostResponse {
    subdomain: String,
    host: String,
}

pub struct HostResolver {
    transport: Arc<dyn HttpTransport>,
    hub: Url,
    lookups: Mutex<HashMap<LookupKey, Lookup>>,
}

impl HostResolver {
    pub fn new(transport: Arc<dyn HttpTransport>, hub: Url) -> Self {
        Self {
            transport,
            hub,
            lookups: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
    ) -> SpaceResult<Host> {
        self.resolve_with_cancel(reference, credential, &CancellationToken::new())
            .await
    }

    /// Cancelling only detaches this caller; other waiters on the same
    /// lookup still receive its outcome.
    pub async fn resolve_with_cancel(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> SpaceResult<Host> {
        if cancel.is_cancelled() {
            return Err(SpaceError::Cancelled);
        }

        let key = LookupKey {
            reference: reference.clone(),
            token: credential.map(|credential| credential.token().to_string()),
        };
        let lookup = {
            let mut lookups = self.lookups.lock();
            lookups
                .entry(key.clone())
                .or_insert_with(|| self.start_lookup(reference.clone(), credential.cloned()))
                .clone()
        };

        let outcome = cancellable(cancel, lookup.clone()).await;
        match &outcome {
            // Only the latest credential's success stays cached per reference.
            Ok(_) => self.lookups.lock().retain(|other, pending| {
                other.reference != key.reference || *other == key || pending.peek().is_none()
            }),
            Err(SpaceError::Cancelled) => {}
            Err(_) => {
                let mut lookups = self.lookups.lock();
                let same = lookups
                    .get(&key)
                    .map(|current| current.ptr_eq(&lookup))
                    .unwrap_or(false);
                if same {
                    lookups.remove(&key);
                }
            }
        }
        outcome
    }

    /// Drops every cached or pending lookup for `reference`.
    pub fn invalidate(&self, reference: &SpaceReference) {
        self.lookups
            .lock()
            .retain(|key, _| &key.reference != reference);
    }

    fn start_lookup(&self, reference: SpaceReference, credential: Option<Credential>) -> Lookup {
        let transport = Arc::clone(&self.transport);
        let url = join_url(
            &self.hub,
            &format!("api/spaces/{}/{}/host", reference.owner(), reference.name()),
        );
        async move {
            let url = url?;
            lookup_host(transport.as_ref(), url, &reference, credential.as_ref()).await
        }
        .boxed()
        .shared()
    }
}

async fn lookup_host(
    transport: &dyn HttpTransport,
    url: Url,
    reference: &SpaceReference,
    credential: Option<&Credential>,
) -> SpaceResult<Host> {
    debug!(
        target = "space_client::host",
        reference = %reference,
        authenticated = credential.is_some(),
        "looking up space host"
    );
    let request = AuthManager::attach(HttpRequest::get(url), credential);
    let response = transport.send(request).await?;

    match response.status {
        status if status.is_success() => {
            let body: HostResponse = response.json().map_err(|err| {
                SpaceError::MalformedResponse(format!("host lookup for {reference}: {err}"))
            })?;
            let base_url = Url::parse(body.host.trim()).map_err(|err| {
                SpaceError::MalformedResponse(format!(
                    "host lookup for {reference} returned invalid url '{}': {err}",
                    body.host
                ))
            })?;
            debug!(
                target = "space_client::host",
                reference = %reference,
                host = %base_url,
                "space host resolved"
            );
            Ok(Host::new(body.subdomain, base_url))
        }
        StatusCode::NOT_FOUND => Err(SpaceError::NotFound(reference.to_string())),
        StatusCode::UNAUTHORIZED => Err(SpaceError::Unauthorized(match credential {
            Some(_) => format!("token rejected for {reference}"),
            None => format!("{reference} requires a token"),
        })),
        status => Err(SpaceError::from_status(
            status,
            &format!("host lookup for {reference}"),
        )),
    }
}
