pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod hub;
pub mod queue;
pub mod reference;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod space_config;
pub mod transport;
pub mod upload;

pub use auth::{AuthManager, Identity};
pub use client::SpaceClient;
pub use config::ClientConfig;
pub use error::{SpaceError, SpaceResult};
pub use host::HostResolver;
pub use hub::{DuplicateOptions, HubClient, SpaceSummary};
pub use queue::{Endpoint, EventStream, QueueClient, QueueEvent, Submission};
pub use reference::{Credential, SpaceReference, SpaceTarget};
pub use retry::RetryPolicy;
pub use runtime::{RuntimeMonitor, RuntimeStage};
pub use session::{ExchangeToken, Host, ResolutionStatus, Session, SessionOptions};
pub use space_config::{ApiInfo, ConfigFetcher, ConfigSnapshot};
pub use transport::{HttpTransport, UploadFile};
pub use upload::{UploadManager, UploadResult};
