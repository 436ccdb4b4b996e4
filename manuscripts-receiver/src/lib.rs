pub mod advertise;
pub mod config;
pub mod cooldown;
pub mod events;
pub mod identity;
pub mod runtime;
pub mod server;
pub mod session;
pub mod stop;
pub mod store;

pub use advertise::MdnsAdvertiser;
pub use events::{EventBus, SessionEvent, StatusEvent};
pub use identity::{CredentialStore, IdentityError, ReceiverIdentity};
pub use runtime::{ReceiverError, RunningReceiver, ShutdownReport, StartOptions, bind_with_fallback};
pub use server::{AppState, ServerSettings, SessionTotals, build_router, serve};
pub use session::{SessionState, SubmissionSession};
pub use store::{NamingScheme, Store, StoreError, StoredFile};
