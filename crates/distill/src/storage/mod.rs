pub mod content;
pub mod results;

pub use content::{ContentError, ContentStore, FsContentStore, StoredContent};
pub use results::{NoopResultSink, ResultSink, SavedResult, SinkError, SqliteResultSink};
