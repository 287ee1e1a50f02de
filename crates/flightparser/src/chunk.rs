use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::filter::ParserConfiguration;
use crate::header::ChunkHeader;
use crate::metadata::{Metadata, Type};
use crate::parser::{EventParser, ParserFactory, ParserSet, RecordType, CHECKPOINT_TYPE_ID};
use crate::pool::ConstantPools;
use crate::reader::{ByteSource, ChunkFile};
use crate::types::{ParseError, RecordedEvent, Result, TimeConverter};

/// Checkpoint type bit marking the end of a flush segment.
const FLUSH_MASK: u8 = 1;

/// Counts of constant pool values decoded and skipped while filling pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolFillStats {
    pub parsed: u64,
    pub skipped: u64,
}

/// What [`ChunkParser::read_event`] found.
#[derive(Debug)]
pub enum ChunkRecord {
    Event(RecordedEvent),
    /// The end of a flush segment.
    Flush,
}

#[derive(Debug, Clone, Copy)]
struct EventSettings {
    enabled: bool,
    threshold_nanos: i64,
}

/// Decodes the events of one chunk.
///
/// A parser is created for the first chunk of a file and then replaced by
/// its successor with [`ChunkParser::next_chunk_parser`] or
/// [`ChunkParser::new_chunk_parser`], which carries over the byte source,
/// the constant pools and, when the metadata generation is unchanged, the
/// parsers built from it.
pub struct ChunkParser<F: ChunkFile = File> {
    source: ByteSource<F>,
    header: ChunkHeader,
    metadata: Arc<Metadata>,
    parsers: Arc<ParserSet>,
    pools: ConstantPools,
    converter: TimeConverter,
    config: ParserConfiguration,
    settings: HashMap<u64, EventSettings>,
    slots: Vec<RecordedEvent>,
    cancel: CancellationToken,
    chunk_finished: bool,
    stats: PoolFillStats,
    /// Start of the first record not yet consumed.
    resume: u64,
}

impl ChunkParser<File> {
    /// Opens the first chunk of the file at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        config: ParserConfiguration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Self::new(ByteSource::open(path)?, config, cancel)
    }
}

impl<F: ChunkFile> ChunkParser<F> {
    pub fn new(
        source: ByteSource<F>,
        config: ParserConfiguration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Self::build(source, 0, config, cancel, None, ConstantPools::new())
    }

    fn build(
        mut source: ByteSource<F>,
        start: u64,
        config: ParserConfiguration,
        cancel: CancellationToken,
        previous: Option<(Arc<Metadata>, Arc<ParserSet>)>,
        mut pools: ConstantPools,
    ) -> Result<Self> {
        let mut header = ChunkHeader::new(&mut source, start, &cancel)?;
        let metadata = header.read_metadata(&mut source, previous.as_ref().map(|(m, _)| m))?;
        let parsers = match previous {
            Some((old, parsers)) if Arc::ptr_eq(&old, &metadata) => parsers,
            _ => Arc::new(ParserFactory::new(&metadata, &mut pools).build()?),
        };
        pools.reset();

        let converter = TimeConverter::new(
            header.start_ticks(),
            header.start_nanos(),
            header.ticks_per_second(),
        );
        let mut parser = Self {
            source,
            header,
            metadata,
            parsers,
            pools,
            converter,
            config,
            settings: HashMap::new(),
            slots: Vec::new(),
            cancel,
            chunk_finished: false,
            stats: PoolFillStats::default(),
            resume: 0,
        };
        parser.apply_settings();
        parser.fill_constant_pools(None)?;
        parser.pools.resolve_all();

        let first = parser.header.event_start();
        parser.source.seek(first)?;
        parser.resume = first;
        log::debug!(
            "opened chunk at {} (size {}, metadata generation {}, finished {})",
            parser.header.start(),
            parser.header.size(),
            parser.metadata.id(),
            parser.header.is_finished()
        );
        Ok(parser)
    }

    /// Parser for the chunk that follows this one in the same file.
    pub fn next_chunk_parser(self) -> Result<Self> {
        let start = self.header.end();
        log::debug!("moving to chunk at {}", start);
        self.successor(start)
    }

    /// Parser for the first chunk of another file.
    pub fn new_chunk_parser(mut self, file: F) -> Result<Self> {
        log::debug!("moving to a new chunk file");
        self.source.set_file(file);
        self.successor(0)
    }

    fn successor(self, start: u64) -> Result<Self> {
        let Self {
            source,
            config,
            cancel,
            metadata,
            parsers,
            pools,
            slots,
            ..
        } = self;
        let mut next = Self::build(source, start, config, cancel, Some((metadata, parsers)), pools)?;
        next.slots = slots;
        Ok(next)
    }

    /// Replaces the configuration applied to subsequent events.
    pub fn update_configuration(&mut self, config: ParserConfiguration) {
        self.config = config;
        if !self.config.reuse {
            self.slots.clear();
        }
        self.apply_settings();
    }

    fn apply_settings(&mut self) {
        let filter = &self.config.filter;
        self.settings = self
            .metadata
            .event_types()
            .iter()
            .map(|ty| {
                let threshold = filter.threshold(&ty.name);
                let settings = EventSettings {
                    enabled: threshold.is_some(),
                    threshold_nanos: threshold.unwrap_or(0),
                };
                (ty.id, settings)
            })
            .collect();
    }

    /// Reads constant pools starting at the header's newest checkpoint and
    /// following the deltas backwards, stopping at `abort` or at the first
    /// checkpoint.
    pub fn fill_constant_pools(&mut self, abort: Option<u64>) -> Result<()> {
        if !self.header.has_constant_pools() {
            return Ok(());
        }
        let parsers = Arc::clone(&self.parsers);
        let mut position = self.header.constant_pool_position();
        let mut visited = HashSet::new();
        loop {
            if Some(position) == abort {
                break;
            }
            if !visited.insert(position) {
                return Err(ParseError::CheckpointCycle { position });
            }
            self.source.seek(position)?;
            let (size, type_id) = self.read_record_start(position)?;
            if type_id != CHECKPOINT_TYPE_ID as i64 {
                return Err(ParseError::ExpectedCheckpoint {
                    position,
                    found: type_id,
                });
            }
            let _timestamp = self.source.read_long()?;
            let _duration = self.source.read_long()?;
            let delta = self.source.read_long()?;
            let _kind = self.source.read_byte()?;
            let pool_count = self.source.read_length()?;
            for _ in 0..pool_count {
                let pool_type = self.source.read_long()? as u64;
                let ty = self
                    .metadata
                    .get(pool_type)
                    .ok_or(ParseError::MissingType(pool_type))?;
                let parser = parsers
                    .pool_parser(pool_type)
                    .ok_or(ParseError::MissingParser(pool_type))?;
                let count = self.source.read_length()?;
                if count == 0 {
                    return Err(ParseError::EmptyPool(ty.name.clone()));
                }
                self.pools.register(ty);
                for _ in 0..count {
                    let key = self.source.read_long()?;
                    if self.pools.previous_resolved(pool_type, key).is_some() {
                        parsers.skip(parser, &mut self.source)?;
                        self.stats.skipped += 1;
                    } else {
                        let value = parsers.parse(parser, &mut self.source, &self.pools)?;
                        self.pools.put(pool_type, key, value);
                        self.stats.parsed += 1;
                    }
                }
            }
            if Some(self.source.position()) != position.checked_add(size) {
                return Err(ParseError::CheckpointSizeMismatch { position });
            }
            if delta == 0 {
                break;
            }
            position = position.checked_add_signed(delta).ok_or(
                ParseError::ExpectedCheckpoint {
                    position,
                    found: delta,
                },
            )?;
        }
        log::debug!(
            "filled constant pools: {} parsed, {} skipped",
            self.stats.parsed,
            self.stats.skipped
        );
        Ok(())
    }

    /// Reads the next event or flush marker of the chunk's data known so
    /// far. Returns `None` at the end of that data.
    pub fn read_event(&mut self) -> Result<Option<ChunkRecord>> {
        let parsers = Arc::clone(&self.parsers);
        while self.source.position() < self.header.end() {
            let position = self.source.position();
            self.resume = position;
            let (size, type_id) = self.read_record_start(position)?;
            let type_id = type_id as u64;
            let next = position
                .checked_add(size)
                .ok_or(ParseError::InvalidRecordSize {
                    position,
                    size: size as i64,
                })?;

            let found = match parsers.record_type(type_id) {
                RecordType::Metadata => None,
                RecordType::Checkpoint => {
                    let _timestamp = self.source.read_long()?;
                    let _duration = self.source.read_long()?;
                    let _delta = self.source.read_long()?;
                    let kind = self.source.read_byte()?;
                    (kind & FLUSH_MASK != 0).then_some(ChunkRecord::Flush)
                }
                RecordType::Event(parser) => self.parse_event(parser)?.map(ChunkRecord::Event),
                RecordType::Unknown => {
                    log::warn!("skipping record of unknown type {} at {}", type_id, position);
                    None
                }
            };
            self.source.seek(next)?;
            self.resume = next;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Reads the size and type id that start every record. The size must
    /// cover at least those two fields.
    fn read_record_start(&mut self, position: u64) -> Result<(u64, i64)> {
        let size = self.source.read_long()?;
        let type_id = self.source.read_long()?;
        let prefix = self.source.position() - position;
        if size <= 0 || (size as u64) < prefix {
            return Err(ParseError::InvalidRecordSize { position, size });
        }
        Ok((size as u64, type_id))
    }

    fn parse_event(&mut self, parser: &EventParser) -> Result<Option<RecordedEvent>> {
        let settings = match self.settings.get(&parser.ty.id) {
            Some(s) if s.enabled => *s,
            _ => return Ok(None),
        };
        let start_ticks = if parser.has_start_time {
            self.source.read_long()?
        } else {
            0
        };
        let duration_ticks = if parser.has_duration {
            self.source.read_long()?
        } else {
            0
        };
        if self.converter.convert_timespan(duration_ticks) < settings.threshold_nanos {
            return Ok(None);
        }
        let end_ticks = start_ticks.saturating_add(duration_ticks);
        let end_nanos = self.converter.convert_timestamp(end_ticks);
        if !self.config.in_window(end_nanos) {
            return Ok(None);
        }

        let mut event = self.take_slot(&parser.ty);
        event.start_ticks = start_ticks;
        event.end_ticks = end_ticks;
        event.start_nanos = self.converter.convert_timestamp(start_ticks);
        event.end_nanos = end_nanos;
        for field in &parser.fields {
            let value = self.parsers.parse(*field, &mut self.source, &self.pools)?;
            event.values.push(value);
        }
        Ok(Some(event))
    }

    fn take_slot(&mut self, ty: &Arc<Type>) -> RecordedEvent {
        match self.slots.pop() {
            Some(mut event) => {
                event.event_type = Arc::clone(ty);
                event.values.clear();
                event
            }
            None => RecordedEvent {
                event_type: Arc::clone(ty),
                start_ticks: 0,
                end_ticks: 0,
                start_nanos: 0,
                end_nanos: 0,
                values: Vec::new(),
            },
        }
    }

    /// Returns an event to the parser so that its allocation is reused for
    /// a later event. Only has an effect in reuse mode.
    pub fn release(&mut self, event: RecordedEvent) {
        if self.config.reuse {
            self.slots.push(event);
        }
    }

    /// Reads the next event of a chunk that may still be written.
    ///
    /// Returns `None` at the end of a flush segment and when the chunk is
    /// finished; [`ChunkParser::is_chunk_finished`] tells the two apart.
    /// Blocks while waiting for the writer to commit more data.
    pub fn read_streaming_event(&mut self) -> Result<Option<RecordedEvent>> {
        loop {
            match self.read_event() {
                Ok(Some(ChunkRecord::Event(event))) => return Ok(Some(event)),
                Ok(Some(ChunkRecord::Flush)) => return Ok(None),
                Ok(None) => {}
                Err(ParseError::Truncated { .. }) => self.source.seek(self.resume)?,
                Err(e) => return Err(e),
            }

            let end = self.header.end();
            let metadata_position = self.header.metadata_position();
            let had_pools = self.header.has_constant_pools();
            let pool_position = self.header.constant_pool_position();
            if self.await_updated_header(end)? {
                self.chunk_finished = true;
                log::debug!("chunk at {} finished", self.header.start());
                return Ok(None);
            }

            if self.header.metadata_position() != metadata_position {
                let metadata = self.header.read_metadata(&mut self.source, Some(&self.metadata))?;
                if !Arc::ptr_eq(&metadata, &self.metadata) {
                    log::debug!("new metadata generation {}", metadata.id());
                    let parsers = ParserFactory::new(&metadata, &mut self.pools).build()?;
                    self.metadata = metadata;
                    self.parsers = Arc::new(parsers);
                    self.apply_settings();
                }
            }
            if !had_pools || self.header.constant_pool_position() != pool_position {
                if self.header.has_constant_pools() {
                    log::debug!("new constant pool data in chunk at {}", self.header.start());
                    self.pools.new_pools();
                    self.fill_constant_pools(had_pools.then_some(pool_position))?;
                    self.pools.resolve_all();
                }
            }
            self.source.seek(self.resume)?;
        }
    }

    /// Waits until the header reports more data or the end of the chunk.
    /// Returns whether the chunk is finished.
    fn await_updated_header(&mut self, end: u64) -> Result<bool> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            if self.header.last_nanos() > self.config.filter_end {
                return Ok(true);
            }
            match self.header.refresh(&mut self.source, &self.cancel) {
                Ok(()) => {}
                Err(ParseError::Closed) => return Ok(true),
                Err(e) => return Err(e),
            }
            if self.header.end() != end {
                return Ok(false);
            }
            if self.header.is_finished() {
                return Ok(true);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    pub fn type_map(&self) -> &HashMap<u64, Arc<Type>> {
        self.metadata.type_map()
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn parsers(&self) -> &Arc<ParserSet> {
        &self.parsers
    }

    pub fn pools(&self) -> &ConstantPools {
        &self.pools
    }

    pub fn config(&self) -> &ParserConfiguration {
        &self.config
    }

    pub fn start_nanos(&self) -> i64 {
        self.header.start_nanos()
    }

    pub fn chunk_duration(&self) -> i64 {
        self.header.duration_nanos()
    }

    pub fn is_chunk_finished(&self) -> bool {
        self.chunk_finished
    }

    /// Whether this chunk ends at the current end of the file.
    pub fn is_last_chunk(&mut self) -> Result<bool> {
        self.header.is_last_chunk(&mut self.source)
    }

    pub fn is_final_chunk(&self) -> bool {
        self.header.is_final_chunk()
    }

    pub fn fill_stats(&self) -> PoolFillStats {
        self.stats
    }

    /// Number of released event slots waiting to be reused.
    pub fn free_slots(&self) -> usize {
        self.slots.len()
    }
}
