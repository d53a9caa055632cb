pub mod batch;
pub mod fingerprint;
pub mod google_api;
pub mod google_auth;
pub mod scheduler;
pub mod sync_engine;

pub use google_api::{ApiError, CalendarApi, GoogleCalendarClient};
pub use google_auth::{AuthError, BrowserPrompt, TokenManager, TokenSource};
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use sync_engine::{EngineSettings, SyncEngine, SyncError, SyncReport};
