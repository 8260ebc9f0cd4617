//! Exchange records and the stores that keep them

mod record;
mod store;

pub use record::{HeaderList, Outcome, RequestRecord, ResponseSnapshot};
pub use store::{DirStore, MemoryStore, RecordStore};

/// File extension used by [`DirStore`]
pub const RECORD_EXTENSION: &str = "toml";
