#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod foreign;
pub mod formats;
pub mod import;
pub mod logging;
pub mod parser;
pub mod persist;
pub mod progress;
pub mod store;
pub mod transfer;
pub mod whole;

pub use config::ImportConfig;
pub use error::ImportError;
pub use import::{SessionData, SessionImporter, SkippedChapter};
pub use progress::{ImportProgress, ImportStage, ProgressSink};
pub use store::{ChapterStore, LocalFsChapterStore, MemoryChapterStore};
