pub mod common;
pub mod downloader;
pub mod manifest;
pub mod post_process;

pub use downloader::manager::{DownloadEngine, ProgressSink};
pub use downloader::task::{Progress, Task, TaskState};
