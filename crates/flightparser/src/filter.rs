use std::collections::HashMap;
use std::time::Duration;

/// Which event types to decode, and the minimum duration of each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    accept_all: bool,
    thresholds: HashMap<String, i64>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl EventFilter {
    /// Decodes every event type with no threshold.
    pub fn accept_all() -> Self {
        Self {
            accept_all: true,
            thresholds: HashMap::new(),
        }
    }

    /// Decodes only the event types given a threshold with [`EventFilter::enable`].
    pub fn named() -> Self {
        Self {
            accept_all: false,
            thresholds: HashMap::new(),
        }
    }

    /// Enables an event type with a duration threshold in nanoseconds.
    pub fn enable(&mut self, name: impl Into<String>, threshold_nanos: i64) {
        self.thresholds.insert(name.into(), threshold_nanos);
    }

    pub fn accepts_all(&self) -> bool {
        self.accept_all
    }

    /// The threshold for an event type, or `None` if it is not decoded.
    pub fn threshold(&self, name: &str) -> Option<i64> {
        match self.thresholds.get(name) {
            Some(t) => Some(*t),
            None if self.accept_all => Some(0),
            None => None,
        }
    }
}

/// Settings a chunk parser applies to every event it reads.
#[derive(Debug, Clone)]
pub struct ParserConfiguration {
    /// Inclusive lower bound on event end times, in epoch nanoseconds.
    pub filter_start: i64,
    /// Inclusive upper bound on event end times, in epoch nanoseconds.
    pub filter_end: i64,
    pub ordered: bool,
    /// Recycle event slots released with `ChunkParser::release`.
    pub reuse: bool,
    pub filter: EventFilter,
    /// How long to sleep between polls for new data.
    pub poll_interval: Duration,
}

impl Default for ParserConfiguration {
    fn default() -> Self {
        Self {
            filter_start: i64::MIN,
            filter_end: i64::MAX,
            ordered: false,
            reuse: false,
            filter: EventFilter::default(),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl ParserConfiguration {
    pub fn in_window(&self, end_nanos: i64) -> bool {
        self.filter_start <= end_nanos && end_nanos <= self.filter_end
    }
}
