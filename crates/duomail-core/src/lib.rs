pub mod accounts;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod db;
pub mod drafts;
pub mod emails;
pub mod gmail;
pub mod labels;
pub mod mapper;
pub mod migrations;
pub mod protocol;
pub mod remote;
pub mod sanitize;
pub mod secrets;
pub mod spool;
pub mod sync;
pub mod telemetry;

pub use accounts::{Account, AccountError, AccountRepository, SyncState};
pub use config::Config;
pub use credentials::{CredentialError, CredentialManager, CredentialSettings, CredentialState};
pub use db::Database;
pub use emails::{Email, EmailRepository, MailStore, StoreError};
pub use labels::LabelRepository;
pub use mapper::{MapperOptions, MappingError, map_message};
pub use protocol::{Dispatcher, ProtocolError, ProtocolSettings, RequestContext};
pub use remote::{AccessToken, RemoteError, RemoteMail};
pub use secrets::{KeyringSecretStore, MemorySecretStore, SecretError, SecretStore};
pub use sync::{SyncCoordinator, SyncError, SyncEvent, SyncReport, SyncSettings};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
