//! Event streams over flight recordings.
//!
//! An [`EventStream`] reads a recording file, or follows a directory of
//! chunk files while a recorder writes them, and delivers each decoded
//! event to the handlers registered for its type.

mod config;
mod dispatch;
mod error;
mod repository;
mod stream;

pub use config::{StreamOptions, CONFIG_ENV};
pub use dispatch::{
    CloseHandler, ErrorHandler, EventHandler, FlushHandler, MetadataEvent, MetadataHandler,
};
pub use error::{Result, StreamError};
pub use repository::{DirectoryRepository, RepositoryFiles};
pub use stream::EventStream;

pub use encore_flightparser::{Record, RecordKind, RecordedEvent, Value};
