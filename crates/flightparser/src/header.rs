use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;

use crate::metadata::{self, Metadata};
use crate::reader::{ByteSource, ChunkFile};
use crate::types::{ParseError, Result};

pub const MAGIC: [u8; 4] = *b"FLR\0";

pub const HEADER_SIZE: u64 = 68;

// Header field offsets, relative to the chunk start.
const CHUNK_SIZE_POSITION: u64 = 8;
pub const START_NANOS_POSITION: u64 = 32;
const FILE_STATE_POSITION: u64 = 64;
const FLAG_BYTE_POSITION: u64 = 67;

/// File state byte value while the writer is updating the header.
const UPDATING: u8 = 0xFF;
const MASK_FINAL_CHUNK: u8 = 1 << 1;

const MIN_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(16);

/// Delays between header read attempts: 1ms doubling up to 16ms.
fn retry_delays() -> impl Iterator<Item = Duration> {
    std::iter::once(MIN_BACKOFF).chain(ExponentialBackoff::from_millis(2).max_delay(MAX_BACKOFF))
}

/// The mutable part of the header, captured by one consistent read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSnapshot {
    pub file_state: u8,
    pub chunk_size: u64,
    pub constant_pool_offset: u64,
    pub metadata_offset: u64,
    pub duration_nanos: i64,
    pub flags: u8,
}

/// Why a header read had to be retried.
#[derive(Debug)]
pub enum TornRead {
    /// The file state byte changed between the two reads.
    StateChanged,
    /// The writer was in the middle of updating the header.
    Updating,
    /// The chunk exists but no metadata has been committed yet.
    NoMetadata,
    /// The header has not been fully written to the file.
    Incomplete,
    Failed(ParseError),
}

/// The header of one chunk, refreshed in place while the chunk is written.
#[derive(Debug, Clone)]
pub struct ChunkHeader {
    absolute_start: u64,
    major: u16,
    minor: u16,
    start_nanos: i64,
    start_ticks: i64,
    ticks_per_second: i64,
    chunk_size: u64,
    constant_pool_offset: u64,
    metadata_offset: u64,
    duration_nanos: i64,
    final_chunk: bool,
    finished: bool,
    metadata_read_offset: u64,
    last_attempts: u32,
}

impl ChunkHeader {
    /// Reads the header of the chunk starting at `absolute_start` and leaves
    /// the source positioned at the first record.
    pub fn new<F: ChunkFile>(
        source: &mut ByteSource<F>,
        absolute_start: u64,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut magic = [0u8; 4];
        source.position_physical(absolute_start);
        source.read_physical_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ParseError::InvalidMagic(absolute_start));
        }
        let major = source.read_physical_short()? as u16;
        let minor = source.read_physical_short()? as u16;
        if major != 1 && major != 2 {
            return Err(ParseError::UnsupportedVersion { major, minor });
        }
        source.position_physical(absolute_start + START_NANOS_POSITION);
        let start_nanos = source.read_physical_long()?;
        source.position_physical(absolute_start + 48);
        let start_ticks = source.read_physical_long()?;
        let ticks_per_second = source.read_physical_long()?;

        let mut header = Self {
            absolute_start,
            major,
            minor,
            start_nanos,
            start_ticks,
            ticks_per_second,
            chunk_size: 0,
            constant_pool_offset: 0,
            metadata_offset: 0,
            duration_nanos: 0,
            final_chunk: false,
            finished: false,
            metadata_read_offset: 0,
            last_attempts: 0,
        };
        header.refresh(source, cancel)?;
        source.seek(header.event_start())?;
        Ok(header)
    }

    /// One attempt at reading the mutable header fields consistently.
    pub fn read_snapshot<F: ChunkFile>(
        &self,
        source: &mut ByteSource<F>,
    ) -> std::result::Result<HeaderSnapshot, TornRead> {
        let read = |source: &mut ByteSource<F>| -> Result<(u8, HeaderSnapshot)> {
            source.position_physical(self.absolute_start + FILE_STATE_POSITION);
            let before = source.read_physical_byte()?;
            source.position_physical(self.absolute_start + CHUNK_SIZE_POSITION);
            let chunk_size = source.read_physical_long()? as u64;
            let constant_pool_offset = source.read_physical_long()? as u64;
            let metadata_offset = source.read_physical_long()? as u64;
            source.position_physical(self.absolute_start + 40);
            let duration_nanos = source.read_physical_long()?;
            source.position_physical(self.absolute_start + FILE_STATE_POSITION);
            let after = source.read_physical_byte()?;
            source.position_physical(self.absolute_start + FLAG_BYTE_POSITION);
            let flags = source.read_physical_byte()?;
            Ok((
                before,
                HeaderSnapshot {
                    file_state: after,
                    chunk_size,
                    constant_pool_offset,
                    metadata_offset,
                    duration_nanos,
                    flags,
                },
            ))
        };

        let (before, snapshot) = match read(source) {
            Ok(v) => v,
            Err(ParseError::Truncated { .. }) => return Err(TornRead::Incomplete),
            Err(e) => return Err(TornRead::Failed(e)),
        };
        if before != snapshot.file_state {
            return Err(TornRead::StateChanged);
        }
        if before == UPDATING {
            return Err(TornRead::Updating);
        }
        if snapshot.metadata_offset == 0 {
            return Err(TornRead::NoMetadata);
        }
        Ok(snapshot)
    }

    /// Re-reads the mutable header fields, retrying with backoff until a
    /// consistent read is obtained.
    pub fn refresh<F: ChunkFile>(
        &mut self,
        source: &mut ByteSource<F>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut delays = retry_delays();
        let mut attempts = 0;
        let snapshot = loop {
            attempts += 1;
            match self.read_snapshot(source) {
                Ok(snapshot) => break snapshot,
                Err(TornRead::Failed(e)) => return Err(e),
                Err(torn) => {
                    log::trace!("torn chunk header at {}: {:?}", self.absolute_start, torn);
                }
            }
            if cancel.is_cancelled() {
                return Err(ParseError::Closed);
            }
            std::thread::sleep(delays.next().unwrap_or(MAX_BACKOFF));
        };
        if attempts > 1 {
            log::debug!(
                "chunk header at {} consistent after {} attempts",
                self.absolute_start,
                attempts
            );
        }
        self.last_attempts = attempts;

        self.chunk_size = snapshot.chunk_size;
        self.constant_pool_offset = snapshot.constant_pool_offset;
        self.metadata_offset = snapshot.metadata_offset;
        self.duration_nanos = snapshot.duration_nanos;
        self.final_chunk = snapshot.flags & MASK_FINAL_CHUNK != 0;
        if snapshot.file_state == 0 {
            self.finished = true;
        }

        if self.finished {
            // Once finished, everything in the file is committed, including
            // any chunks that follow.
            let size = source.file_size()?;
            source.set_valid_size(size);
        } else {
            source.set_valid_size(self.end());
        }
        log::trace!(
            "refreshed chunk header at {}: size={} finished={}",
            self.absolute_start,
            self.chunk_size,
            self.finished
        );
        Ok(())
    }

    /// Polls the file state byte until the writer marks the chunk finished.
    pub fn await_finished<F: ChunkFile>(
        &mut self,
        source: &mut ByteSource<F>,
        cancel: &CancellationToken,
        poll_interval: Duration,
    ) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        loop {
            if cancel.is_cancelled() {
                return Err(ParseError::Closed);
            }
            source.position_physical(self.absolute_start + FILE_STATE_POSITION);
            if source.read_physical_byte()? == 0 {
                return self.refresh(source, cancel);
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Reads the header of the chunk following this one.
    pub fn next_header<F: ChunkFile>(
        &self,
        source: &mut ByteSource<F>,
        cancel: &CancellationToken,
    ) -> Result<ChunkHeader> {
        ChunkHeader::new(source, self.end(), cancel)
    }

    /// Reads the metadata this header points at, reusing `previous` when it
    /// describes the same generation.
    pub fn read_metadata<F: ChunkFile>(
        &mut self,
        source: &mut ByteSource<F>,
        previous: Option<&Arc<Metadata>>,
    ) -> Result<Arc<Metadata>> {
        let metadata = metadata::read_metadata(source, self.metadata_position(), previous)?;
        self.metadata_read_offset = self.metadata_offset;
        Ok(metadata)
    }

    pub fn is_new_metadata_available(&self) -> bool {
        self.metadata_offset != self.metadata_read_offset
    }

    /// Whether this chunk ends exactly at the end of the file.
    pub fn is_last_chunk<F: ChunkFile>(&self, source: &mut ByteSource<F>) -> Result<bool> {
        Ok(source.file_size()? == self.end())
    }

    pub fn version(&self) -> (u16, u16) {
        (self.major, self.minor)
    }

    pub fn start(&self) -> u64 {
        self.absolute_start
    }

    pub fn end(&self) -> u64 {
        self.absolute_start + self.chunk_size
    }

    pub fn size(&self) -> u64 {
        self.chunk_size
    }

    pub fn event_start(&self) -> u64 {
        self.absolute_start + HEADER_SIZE
    }

    pub fn metadata_position(&self) -> u64 {
        self.absolute_start + self.metadata_offset
    }

    pub fn has_constant_pools(&self) -> bool {
        self.constant_pool_offset != 0
    }

    pub fn constant_pool_position(&self) -> u64 {
        self.absolute_start + self.constant_pool_offset
    }

    pub fn start_nanos(&self) -> i64 {
        self.start_nanos
    }

    pub fn duration_nanos(&self) -> i64 {
        self.duration_nanos
    }

    pub fn last_nanos(&self) -> i64 {
        self.start_nanos.saturating_add(self.duration_nanos)
    }

    pub fn start_ticks(&self) -> i64 {
        self.start_ticks
    }

    pub fn ticks_per_second(&self) -> i64 {
        self.ticks_per_second
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_final_chunk(&self) -> bool {
        self.final_chunk
    }

    /// Number of read attempts the last refresh needed.
    pub fn last_refresh_attempts(&self) -> u32 {
        self.last_attempts
    }
}
