use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use encore_flightparser::{
    ByteSource, ChunkFile, ChunkParser, ChunkRecord, Metadata, ParserConfiguration, RecordedEvent,
};
use tokio_util::sync::CancellationToken;

use crate::config::{StreamConfiguration, StreamOptions};
use crate::dispatch::{guarded, Dispatcher, Handlers, MetadataEvent};
use crate::error::{Result, StreamError};
use crate::repository::{DirectoryRepository, RepositoryFiles};

/// Lower bound on how often a directory is rescanned for the next chunk.
const MIN_DIRECTORY_POLL: Duration = Duration::from_millis(10);

enum Source {
    File(PathBuf),
    Repository(Box<dyn RepositoryFiles>),
}

#[derive(Default)]
struct RunState {
    started: bool,
    closed: bool,
    close_fired: bool,
    terminated: bool,
    /// Error that ended a loop started with `start_async`, until it is
    /// reported by `await_termination`.
    outcome: Option<StreamError>,
}

struct Shared {
    config: Mutex<StreamConfiguration>,
    /// Bumped whenever a handler is added.
    version: AtomicU64,
    state: Mutex<RunState>,
    changed: Condvar,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn close(&self) {
        self.cancel.cancel();
        let fire = {
            let mut state = lock(&self.state);
            state.closed = true;
            if !state.started {
                state.terminated = true;
            }
            let fire = !state.close_fired;
            state.close_fired = true;
            self.changed.notify_all();
            fire
        };
        if fire {
            let handlers = lock(&self.config).handlers.close.clone();
            for handler in handlers {
                if let Err(err) = guarded(|| {
                    handler();
                    Ok(())
                }) {
                    log::error!("flight stream close handler failed: {:#}", err);
                }
            }
        }
    }

    fn terminate(&self, outcome: Option<StreamError>) {
        self.close();
        let mut state = lock(&self.state);
        state.terminated = true;
        state.outcome = outcome;
        self.changed.notify_all();
    }

    /// Sleeps for `timeout` or until the stream is closed.
    /// Returns false if the stream is closed.
    fn sleep(&self, timeout: Duration) -> bool {
        let state = lock(&self.state);
        if state.closed {
            return false;
        }
        let (state, _) = self
            .changed
            .wait_timeout(state, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        !state.closed
    }
}

/// A stream of events read from a recording file or a directory of chunk
/// files, delivered to registered handlers.
///
/// ```no_run
/// use encore_flightstream::EventStream;
///
/// let stream = EventStream::open_file("recording.jfr")?;
/// stream.set_ordered(false)?;
/// stream.on_event("app.Request", |event| {
///     println!("request took {} ns", event.duration_nanos());
///     Ok(())
/// });
/// stream.start()?;
/// # Ok::<(), encore_flightstream::StreamError>(())
/// ```
pub struct EventStream {
    shared: Arc<Shared>,
    source: Mutex<Option<Source>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

impl EventStream {
    /// A stream over the chunks of a recording file.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a file", path.display()),
            )
            .into());
        }
        Ok(Self::new(Source::File(path.to_path_buf())))
    }

    /// A live stream over the chunk files of a directory.
    pub fn open_directory(path: impl Into<PathBuf>) -> Result<Self> {
        let repo = DirectoryRepository::new(path)?;
        Ok(Self::open_repository(repo))
    }

    pub fn open_repository(repo: impl RepositoryFiles + 'static) -> Self {
        Self::new(Source::Repository(Box::new(repo)))
    }

    fn new(source: Source) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(StreamConfiguration::default()),
                version: AtomicU64::new(0),
                state: Mutex::new(RunState::default()),
                changed: Condvar::new(),
                cancel: CancellationToken::new(),
            }),
            source: Mutex::new(Some(source)),
            thread: Mutex::new(None),
        }
    }

    fn configure<T>(&self, f: impl FnOnce(&mut StreamConfiguration) -> Result<T>) -> Result<T> {
        let state = lock(&self.shared.state);
        if state.started {
            return Err(StreamError::AlreadyStarted);
        }
        if state.closed {
            return Err(StreamError::Closed);
        }
        let mut config = lock(&self.shared.config);
        f(&mut config)
    }

    /// Whether events are delivered sorted by end time within each flush
    /// segment. Defaults to true.
    pub fn set_ordered(&self, ordered: bool) -> Result<()> {
        self.configure(|c| {
            c.ordered = ordered;
            Ok(())
        })
    }

    /// Whether event allocations are recycled after delivery. Defaults to true.
    pub fn set_reuse(&self, reuse: bool) -> Result<()> {
        self.configure(|c| {
            c.reuse = reuse;
            Ok(())
        })
    }

    /// Only deliver events ending at or after `start`.
    pub fn set_start_time(&self, start: DateTime<Utc>) -> Result<()> {
        self.configure(|c| c.set_start_time(start))
    }

    /// Only deliver events ending at or before `end`.
    pub fn set_end_time(&self, end: DateTime<Utc>) -> Result<()> {
        self.configure(|c| c.set_end_time(end))
    }

    /// Only deliver events named `name` that last at least `threshold`.
    pub fn set_threshold(&self, name: impl Into<String>, threshold: Duration) -> Result<()> {
        self.configure(|c| {
            c.thresholds.insert(name.into(), threshold);
            Ok(())
        })
    }

    pub fn set_poll_interval(&self, interval: Duration) -> Result<()> {
        self.configure(|c| {
            c.poll_interval = interval;
            Ok(())
        })
    }

    pub fn with_options(&self, options: &StreamOptions) -> Result<()> {
        self.configure(|c| c.apply(options))
    }

    fn add_handler(&self, f: impl FnOnce(&mut Handlers)) {
        let mut config = lock(&self.shared.config);
        f(&mut config.handlers);
        self.shared.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_event<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&RecordedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        self.add_handler(|h| h.add_event(Some(name), Arc::new(handler)));
    }

    pub fn on_any_event<F>(&self, handler: F)
    where
        F: Fn(&RecordedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_handler(|h| h.add_event(None, Arc::new(handler)));
    }

    /// Called after the events of each flush segment are delivered.
    pub fn on_flush<F>(&self, handler: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_handler(|h| h.flush.push(Arc::new(handler)));
    }

    /// Called once, when the stream is closed or runs out of events.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_handler(|h| h.close.push(Arc::new(handler)));
    }

    /// Receives the errors returned by other handlers. Without an error
    /// handler they are logged.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        self.add_handler(|h| h.error.push(Arc::new(handler)));
    }

    /// Called when a new metadata generation is seen, before its events.
    pub fn on_metadata<F>(&self, handler: F)
    where
        F: Fn(&MetadataEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_handler(|h| h.metadata.push(Arc::new(handler)));
    }

    fn begin(&self) -> Result<Source> {
        let mut state = lock(&self.shared.state);
        if state.started {
            return Err(StreamError::AlreadyStarted);
        }
        if state.closed {
            return Err(StreamError::Closed);
        }
        let source = lock(&self.source)
            .take()
            .ok_or(StreamError::AlreadyStarted)?;
        state.started = true;
        Ok(source)
    }

    /// Reads events on the current thread until the stream ends or is closed.
    pub fn start(&self) -> Result<()> {
        let source = self.begin()?;
        let result = run(&self.shared, source);
        self.shared.terminate(None);
        result
    }

    /// Reads events on a background thread.
    pub fn start_async(&self) -> Result<()> {
        let source = self.begin()?;
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("flightstream".into())
            .spawn(move || {
                let outcome = run(&shared, source).err();
                if let Some(err) = &outcome {
                    log::debug!("flight stream ended with error: {}", err);
                }
                shared.terminate(outcome);
            });
        match spawned {
            Ok(handle) => {
                *lock(&self.thread) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.terminate(None);
                Err(e.into())
            }
        }
    }

    /// Stops the stream. Close handlers run once, on the first call.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Waits for the stream to end, up to `timeout` if given.
    ///
    /// Returns `Ok(false)` if the timeout elapsed first, and the error that
    /// ended a background stream, if any.
    pub fn await_termination(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.shared.state);
        while !state.terminated {
            state = match deadline {
                None => self
                    .shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        let outcome = state.outcome.take();
        drop(state);

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                log::error!("flight stream thread panicked");
            }
        }
        match outcome {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

fn run(shared: &Shared, source: Source) -> Result<()> {
    match source {
        Source::File(path) => run_file(shared, &path),
        Source::Repository(repo) => run_repository(shared, repo),
    }
}

/// Per-run state of the loop that reads chunks and delivers their events.
struct StreamLoop<'a> {
    shared: &'a Shared,
    version: u64,
    config: ParserConfiguration,
    dispatcher: Dispatcher,
    metadata: Option<Arc<Metadata>>,
    sorted: Vec<RecordedEvent>,
    /// Events were delivered or buffered since the last flush.
    pending: bool,
}

impl<'a> StreamLoop<'a> {
    fn new(shared: &'a Shared) -> Self {
        let config = lock(&shared.config);
        Self {
            shared,
            version: shared.version.load(Ordering::Acquire),
            config: config.parser_configuration(),
            dispatcher: Dispatcher::new(config.handlers.clone()),
            metadata: None,
            sorted: Vec::new(),
            pending: false,
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Picks up handlers added since the last call and announces new
    /// metadata generations.
    fn update<F: ChunkFile>(&mut self, parser: &mut ChunkParser<F>) {
        let version = self.shared.version.load(Ordering::Acquire);
        if version != self.version {
            let config = lock(&self.shared.config);
            let mut parser_config = config.parser_configuration();
            parser_config.filter_start = self.config.filter_start;
            self.dispatcher = Dispatcher::new(config.handlers.clone());
            drop(config);

            log::debug!("flight stream handlers changed (version {})", version);
            self.version = version;
            self.config = parser_config;
            parser.update_configuration(self.config.clone());
        }

        let metadata = parser.metadata();
        if !self
            .metadata
            .as_ref()
            .is_some_and(|m| Arc::ptr_eq(m, metadata))
        {
            let event = MetadataEvent::new(self.metadata.as_deref(), Arc::clone(metadata));
            self.metadata = Some(Arc::clone(metadata));
            self.dispatcher.metadata(&event);
        }
    }

    fn emit<F: ChunkFile>(&mut self, parser: &mut ChunkParser<F>, event: RecordedEvent) {
        self.pending = true;
        if self.config.ordered {
            self.sorted.push(event);
            return;
        }
        self.dispatcher.dispatch(&event);
        parser.release(event);
    }

    /// Delivers the buffered events of an ordered stream and runs the flush
    /// handlers.
    fn flush<F: ChunkFile>(&mut self, parser: &mut ChunkParser<F>) {
        if !self.sorted.is_empty() {
            let mut sorted = std::mem::take(&mut self.sorted);
            sorted.sort_by_key(|e| (e.end_nanos, e.event_type.id));
            for event in sorted.drain(..) {
                self.dispatcher.dispatch(&event);
                parser.release(event);
            }
            self.sorted = sorted;
        }
        self.pending = false;
        self.dispatcher.flush();
    }

    /// Flushes unless nothing happened since the last flush.
    fn end_segment<F: ChunkFile>(&mut self, parser: &mut ChunkParser<F>) {
        if self.pending {
            self.flush(parser);
        }
    }

    /// Ends a closed run. Events decoded before the close are still
    /// delivered.
    fn finish_closed<F: ChunkFile>(&mut self, parser: &mut ChunkParser<F>) {
        log::debug!("flight stream closed with {} buffered events", self.sorted.len());
        self.end_segment(parser);
    }
}

/// Whether a finished chunk ends before the stream window starts.
fn ends_before_window<F: ChunkFile>(parser: &ChunkParser<F>, filter_start: i64) -> bool {
    let header = parser.header();
    header.is_finished() && header.duration_nanos() > 0 && header.last_nanos() < filter_start
}

fn run_file(shared: &Shared, path: &Path) -> Result<()> {
    let mut lp = StreamLoop::new(shared);
    let mut parser = ChunkParser::open(path, lp.config.clone(), shared.cancel.clone())?;
    loop {
        if parser.start_nanos() > lp.config.filter_end {
            log::debug!("chunk starts after the end of the stream window");
            break;
        }
        if ends_before_window(&parser, lp.config.filter_start) {
            log::debug!("skipping chunk ending before the stream window");
        } else {
            lp.update(&mut parser);
            while let Some(record) = parser.read_event()? {
                match record {
                    ChunkRecord::Event(event) => lp.emit(&mut parser, event),
                    ChunkRecord::Flush => lp.flush(&mut parser),
                }
                if lp.is_closed() {
                    lp.finish_closed(&mut parser);
                    return Ok(());
                }
                lp.update(&mut parser);
            }
            lp.end_segment(&mut parser);
        }

        if lp.is_closed() || parser.is_last_chunk()? {
            break;
        }
        parser = parser.next_chunk_parser()?;
    }
    Ok(())
}

fn run_repository(shared: &Shared, mut repo: Box<dyn RepositoryFiles>) -> Result<()> {
    let mut lp = StreamLoop::new(shared);
    let start = lock(&shared.config).start_nanos;
    let poll = lp.config.poll_interval.max(MIN_DIRECTORY_POLL);

    let first = wait_for_path(shared, poll, || match start {
        Some(start) => repo.first_path(start),
        None => repo.last_path(),
    })?;
    let Some(path) = first else {
        return Ok(());
    };
    log::debug!("streaming chunks from {}", path.display());
    let source = ByteSource::open(&path)?;
    let mut parser = ChunkParser::new(source, lp.config.clone(), shared.cancel.clone())?;
    if start.is_none() {
        lp.config.filter_start = parser.header().last_nanos();
        parser.update_configuration(lp.config.clone());
    }

    loop {
        lp.update(&mut parser);
        loop {
            match parser.read_streaming_event()? {
                Some(event) => lp.emit(&mut parser, event),
                None if parser.is_chunk_finished() => break,
                None => lp.flush(&mut parser),
            }
            if lp.is_closed() {
                lp.finish_closed(&mut parser);
                return Ok(());
            }
            lp.update(&mut parser);
        }
        lp.end_segment(&mut parser);

        if lp.is_closed() {
            return Ok(());
        }
        if parser.header().last_nanos() > lp.config.filter_end {
            log::debug!("chunk ends after the end of the stream window");
            return Ok(());
        }
        if repo.has_fixed_path() && parser.is_final_chunk() {
            log::debug!("reached the final chunk");
            return Ok(());
        }

        // A chunk without duration would otherwise be found again.
        let after = parser.start_nanos() + parser.chunk_duration().max(1);
        let next = wait_for_path(shared, poll, || repo.next_path(after))?;
        let Some(path) = next else {
            return Ok(());
        };
        log::debug!("continuing with chunk file {}", path.display());
        parser = parser.new_chunk_parser(File::open(&path)?)?;
    }
}

/// Polls `find` until it returns a path. Returns `None` if the stream is
/// closed first.
fn wait_for_path(
    shared: &Shared,
    poll: Duration,
    mut find: impl FnMut() -> Result<Option<PathBuf>>,
) -> Result<Option<PathBuf>> {
    loop {
        if let Some(path) = find()? {
            return Ok(Some(path));
        }
        if !shared.sleep(poll) {
            return Ok(None);
        }
    }
}
