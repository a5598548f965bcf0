pub mod jobs;
pub mod logs;

pub use jobs::JsonJobStore;
pub use logs::{LogPage, LogSink, LogStream};
