pub mod event;
pub mod remote_event;
pub mod source;

pub use event::{OccurrenceKey, SourceEvent};
pub use remote_event::{ExtendedProperties, RemoteDateTime, RemoteEvent};
pub use source::{EventSource, JsonFileSource, SourceError, TimeWindow};
