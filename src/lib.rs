pub mod calendar;
pub mod storage;
pub mod sync;

pub use calendar::{OccurrenceKey, SourceEvent};
pub use sync::{SyncEngine, SyncReport};
