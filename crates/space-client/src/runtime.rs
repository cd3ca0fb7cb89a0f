//! Runtime lifecycle tracking.
//!
//! [`RuntimeWait`] is a pure state machine: it is fed one [`Observation`] at a
//! time and answers with the next [`Step`]. [`RuntimeMonitor`] performs the
//! network calls and sleeps the machine asks for, which keeps every
//! suspension point in one loop where cancellation and the deadline apply.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::AuthManager;
use crate::config::ClientConfig;
use crate::error::{SpaceError, SpaceResult};
use crate::hub::{sleep_time_request, space_url};
use crate::reference::{Credential, SpaceReference};
use crate::retry::{cancellable, sleep_cancellable};
use crate::session::{ResolutionStatus, SessionOptions};
use crate::transport::{HttpRequest, HttpTransport, StatusCode};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeStage {
    Running,
    Building,
    Paused,
    Stopped,
    Failed,
    NotFound,
    /// A stage the client has no rule for. Polled like `Building`.
    Unknown(String),
}

impl RuntimeStage {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => RuntimeStage::Running,
            "BUILDING" | "RUNNING_BUILDING" | "APP_STARTING" | "RUNNING_APP_STARTING" => {
                RuntimeStage::Building
            }
            "PAUSED" | "SLEEPING" => RuntimeStage::Paused,
            "STOPPED" => RuntimeStage::Stopped,
            "FAILED" | "BUILD_ERROR" | "RUNTIME_ERROR" | "CONFIG_ERROR" | "NO_APP_FILE" => {
                RuntimeStage::Failed
            }
            "NOT_FOUND" => RuntimeStage::NotFound,
            _ => RuntimeStage::Unknown(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RuntimeStage::Running => "RUNNING",
            RuntimeStage::Building => "BUILDING",
            RuntimeStage::Paused => "PAUSED",
            RuntimeStage::Stopped => "STOPPED",
            RuntimeStage::Failed => "FAILED",
            RuntimeStage::NotFound => "NOT_FOUND",
            RuntimeStage::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for RuntimeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to one tick of the wait machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Stage(RuntimeStage),
    /// The status poll itself failed.
    PollFailed(SpaceError),
    WakeSent,
    WakeFailed(SpaceError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Ready,
    Fail(SpaceError),
    /// Send the wake signal, then report [`Observation::WakeSent`] or
    /// [`Observation::WakeFailed`].
    Wake,
    /// Sleep, then poll again.
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct RuntimeWait {
    subject: String,
    next_delay: Duration,
    max_delay: Duration,
    max_poll_failures: u32,
    poll_failures: u32,
    woken: bool,
}

impl RuntimeWait {
    pub fn new(
        subject: impl Into<String>,
        initial_delay: Duration,
        max_delay: Duration,
        max_poll_failures: u32,
    ) -> Self {
        Self {
            subject: subject.into(),
            next_delay: initial_delay,
            max_delay: max_delay.max(initial_delay),
            max_poll_failures: max_poll_failures.max(1),
            poll_failures: 0,
            woken: false,
        }
    }

    pub fn woken(&self) -> bool {
        self.woken
    }

    pub fn tick(&mut self, observation: Observation) -> Step {
        match observation {
            Observation::Stage(stage) => {
                self.poll_failures = 0;
                match stage {
                    RuntimeStage::Running => Step::Ready,
                    RuntimeStage::NotFound => {
                        Step::Fail(SpaceError::NotFound(self.subject.clone()))
                    }
                    RuntimeStage::Failed => Step::Fail(SpaceError::Server(format!(
                        "{} failed to build or run",
                        self.subject
                    ))),
                    RuntimeStage::Paused if !self.woken => {
                        self.woken = true;
                        Step::Wake
                    }
                    RuntimeStage::Paused
                    | RuntimeStage::Building
                    | RuntimeStage::Stopped
                    | RuntimeStage::Unknown(_) => self.backoff(),
                }
            }
            Observation::PollFailed(err) if err.is_transient() => {
                self.poll_failures += 1;
                if self.poll_failures >= self.max_poll_failures {
                    Step::Fail(err)
                } else {
                    self.backoff()
                }
            }
            Observation::PollFailed(err) => Step::Fail(err),
            Observation::WakeSent => self.backoff(),
            // A wake the server could not process is not fatal; the space may
            // still come up on its own.
            Observation::WakeFailed(err) if err.is_transient() => self.backoff(),
            Observation::WakeFailed(err) => Step::Fail(err),
        }
    }

    fn backoff(&mut self) -> Step {
        let delay = self.next_delay;
        self.next_delay = self
            .next_delay
            .checked_mul(2)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        Step::Wait(delay)
    }
}

#[derive(Debug, Deserialize)]
struct RuntimeResponse {
    stage: String,
}

pub struct RuntimeMonitor {
    transport: Arc<dyn HttpTransport>,
    hub: Url,
    default_timeout: Duration,
    poll_initial: Duration,
    poll_max: Duration,
    max_poll_failures: u32,
    wake_sleep_time_secs: u64,
}

impl RuntimeMonitor {
    pub fn new(transport: Arc<dyn HttpTransport>, hub: Url, config: &ClientConfig) -> Self {
        let (poll_initial, poll_max) = config.poll_backoff();
        Self {
            transport,
            hub,
            default_timeout: config.runtime_timeout(),
            poll_initial,
            poll_max,
            max_poll_failures: config.retry_max_attempts,
            wake_sleep_time_secs: config.wake_sleep_time_secs,
        }
    }

    /// One poll of the runtime endpoint. A 404 is reported as
    /// [`RuntimeStage::NotFound`] rather than an error.
    pub async fn stage(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
    ) -> SpaceResult<RuntimeStage> {
        let url = space_url(&self.hub, reference, "runtime")?;
        let response = self
            .transport
            .send(AuthManager::attach(HttpRequest::get(url), credential))
            .await?;
        match response.status {
            status if status.is_success() => {
                let body: RuntimeResponse = response.json().map_err(|err| {
                    SpaceError::MalformedResponse(format!("runtime of {reference}: {err}"))
                })?;
                Ok(RuntimeStage::parse(&body.stage))
            }
            StatusCode::NOT_FOUND => Ok(RuntimeStage::NotFound),
            status => Err(SpaceError::from_status(
                status,
                &format!("runtime of {reference}"),
            )),
        }
    }

    /// Sends the wake signal once, without retrying.
    pub async fn wake(
        &self,
        reference: &SpaceReference,
        credential: Option<&Credential>,
    ) -> SpaceResult<()> {
        let request =
            sleep_time_request(&self.hub, reference, credential, self.wake_sleep_time_secs)?;
        let response = self.transport.send(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SpaceError::from_status(
                response.status,
                &format!("wake {reference}"),
            ))
        }
    }

    /// Polls until the space runs, fails, disappears, the deadline passes or
    /// `options.cancel` fires.
    pub async fn wait_until_ready(
        &self,
        reference: &SpaceReference,
        options: &SessionOptions,
    ) -> SpaceResult<RuntimeStage> {
        let timeout = options.runtime_timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, self.drive(reference, options)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    target = "space_client::runtime",
                    reference = %reference,
                    timeout_secs = timeout.as_secs_f64(),
                    "space did not become ready in time"
                );
                Err(SpaceError::Server(format!(
                    "{reference} did not become ready within {timeout:?}"
                )))
            }
        }
    }

    async fn drive(
        &self,
        reference: &SpaceReference,
        options: &SessionOptions,
    ) -> SpaceResult<RuntimeStage> {
        let cancel: &CancellationToken = &options.cancel;
        let credential = options.credential.as_ref();
        let mut wait = RuntimeWait::new(
            reference.to_string(),
            self.poll_initial,
            self.poll_max,
            self.max_poll_failures,
        );
        let mut last_stage: Option<RuntimeStage> = None;

        let mut observation =
            poll_observation(cancellable(cancel, self.stage(reference, credential)).await)?;
        loop {
            if let Observation::Stage(stage) = &observation {
                if last_stage.as_ref() != Some(stage) {
                    info!(
                        target = "space_client::runtime",
                        reference = %reference,
                        stage = %stage,
                        "runtime stage observed"
                    );
                    options.report(ResolutionStatus::RuntimeStage(stage.clone()));
                    last_stage = Some(stage.clone());
                }
            }

            match wait.tick(observation) {
                Step::Ready => return Ok(RuntimeStage::Running),
                Step::Fail(err) => return Err(err),
                Step::Wake => {
                    info!(
                        target = "space_client::runtime",
                        reference = %reference,
                        "waking paused space"
                    );
                    options.report(ResolutionStatus::Waking);
                    observation = match cancellable(cancel, self.wake(reference, credential)).await
                    {
                        Ok(()) => Observation::WakeSent,
                        Err(SpaceError::Cancelled) => return Err(SpaceError::Cancelled),
                        Err(err) => {
                            warn!(
                                target = "space_client::runtime",
                                reference = %reference,
                                error = %err,
                                "wake request failed"
                            );
                            Observation::WakeFailed(err)
                        }
                    };
                }
                Step::Wait(delay) => {
                    debug!(
                        target = "space_client::runtime",
                        reference = %reference,
                        delay_ms = delay.as_millis() as u64,
                        "waiting for runtime"
                    );
                    sleep_cancellable(cancel, delay).await?;
                    observation = poll_observation(
                        cancellable(cancel, self.stage(reference, credential)).await,
                    )?;
                }
            }
        }
    }
}

fn poll_observation(outcome: SpaceResult<RuntimeStage>) -> SpaceResult<Observation> {
    match outcome {
        Ok(stage) => Ok(Observation::Stage(stage)),
        Err(SpaceError::Cancelled) => Err(SpaceError::Cancelled),
        Err(err) => Ok(Observation::PollFailed(err)),
    }
}
