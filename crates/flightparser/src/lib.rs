//! Streaming decoder for flight recordings.
//!
//! A recording is a sequence of self-describing chunks. Each chunk starts
//! with a 68-byte header that the writer rewrites in place while the chunk
//! grows, followed by records:
//!
//! | Field   | Encoding          |
//! |---------|-------------------|
//! | Size    | varint (4 bytes)  |
//! | Type id | varint            |
//! | Payload | depends on type   |
//!
//! Type id 0 is a metadata record declaring the types of the recording,
//! type id 1 a checkpoint holding constant pool entries, and every other id
//! an event of a declared event type.
//!
//! # Usage
//!
//! ```no_run
//! use encore_flightparser::{ChunkParser, ChunkRecord, ParserConfiguration};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ParserConfiguration::default();
//! let mut parser = ChunkParser::open("recording.jfr", config, CancellationToken::new())?;
//! loop {
//!     while let Some(record) = parser.read_event()? {
//!         if let ChunkRecord::Event(event) = record {
//!             println!("{} at {}", event.name(), event.end_nanos);
//!         }
//!     }
//!     if parser.is_last_chunk()? {
//!         break;
//!     }
//!     parser = parser.next_chunk_parser()?;
//! }
//! # Ok::<(), encore_flightparser::ParseError>(())
//! ```

pub mod chunk;
pub mod filter;
pub mod header;
pub mod metadata;
pub mod parser;
pub mod pool;
pub mod reader;
pub mod types;
pub mod value;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use chunk::{ChunkParser, ChunkRecord, PoolFillStats};
pub use filter::{EventFilter, ParserConfiguration};
pub use header::ChunkHeader;
pub use metadata::{Field, Metadata, Type};
pub use reader::{ByteSource, ChunkFile};
pub use types::{ParseError, RecordedEvent, Result, TimeConverter};
pub use value::{ObjectFactory, PoolRef, Record, RecordKind, Value};
