use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use encore_flightparser::{EventFilter, ParserConfiguration};
use serde::Deserialize;

use crate::dispatch::Handlers;
use crate::error::{Result, StreamError};

/// Environment variable holding [`StreamOptions`] as JSON.
pub const CONFIG_ENV: &str = "ENCORE_FLIGHTSTREAM_CONFIG";

/// Serializable stream settings.
///
/// ```json
/// {
///   "ordered": false,
///   "start_time": "2024-01-01T00:00:00Z",
///   "thresholds": { "app.Request": 20 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    pub ordered: bool,
    pub reuse: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Minimum event duration per event name, in milliseconds.
    pub thresholds: HashMap<String, u64>,
    pub poll_interval_ms: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            reuse: true,
            start_time: None,
            end_time: None,
            thresholds: HashMap::new(),
            poll_interval_ms: 1,
        }
    }
}

impl StreamOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| StreamError::Config(format!("unable to parse stream options: {}", e)))
    }

    /// Reads the options from [`CONFIG_ENV`], returning `None` when it is not set.
    pub fn from_env() -> Result<Option<Self>> {
        let json = match std::env::var(CONFIG_ENV) {
            Ok(json) => json,
            Err(std::env::VarError::NotPresent) => return Ok(None),
            Err(e) => return Err(StreamError::Config(format!("{}: {}", CONFIG_ENV, e))),
        };
        Self::from_json(&json).map(Some)
    }
}

/// Live configuration of an event stream, shared between the stream handle
/// and the loop that reads it.
#[derive(Clone)]
pub(crate) struct StreamConfiguration {
    pub ordered: bool,
    pub reuse: bool,
    pub start_nanos: Option<i64>,
    pub end_nanos: Option<i64>,
    pub thresholds: HashMap<String, Duration>,
    pub poll_interval: Duration,
    pub handlers: Handlers,
}

impl Default for StreamConfiguration {
    fn default() -> Self {
        let options = StreamOptions::default();
        Self {
            ordered: options.ordered,
            reuse: options.reuse,
            start_nanos: None,
            end_nanos: None,
            thresholds: HashMap::new(),
            poll_interval: Duration::from_millis(options.poll_interval_ms),
            handlers: Handlers::default(),
        }
    }
}

impl StreamConfiguration {
    pub fn apply(&mut self, options: &StreamOptions) -> Result<()> {
        let start = options.start_time.map(epoch_nanos).transpose()?;
        let end = options.end_time.map(epoch_nanos).transpose()?;
        check_window(start.or(self.start_nanos), end.or(self.end_nanos))?;

        self.ordered = options.ordered;
        self.reuse = options.reuse;
        if start.is_some() {
            self.start_nanos = start;
        }
        if end.is_some() {
            self.end_nanos = end;
        }
        for (name, millis) in &options.thresholds {
            self.thresholds
                .insert(name.clone(), Duration::from_millis(*millis));
        }
        self.poll_interval = Duration::from_millis(options.poll_interval_ms);
        Ok(())
    }

    pub fn set_start_time(&mut self, start: DateTime<Utc>) -> Result<()> {
        let start = epoch_nanos(start)?;
        check_window(Some(start), self.end_nanos)?;
        self.start_nanos = Some(start);
        Ok(())
    }

    pub fn set_end_time(&mut self, end: DateTime<Utc>) -> Result<()> {
        let end = epoch_nanos(end)?;
        check_window(self.start_nanos, Some(end))?;
        self.end_nanos = Some(end);
        Ok(())
    }

    /// The event filter implied by the registered handlers and thresholds.
    ///
    /// Without name-specific handlers, or with any catch-all handler, every
    /// event type is accepted. Otherwise only the handled names are.
    pub fn filter(&self) -> EventFilter {
        let named = self.handlers.event_names();
        if named.is_empty() || self.handlers.has_catch_all() {
            let mut filter = EventFilter::accept_all();
            for (name, threshold) in &self.thresholds {
                filter.enable(name.clone(), duration_nanos(*threshold));
            }
            return filter;
        }

        let mut filter = EventFilter::named();
        for name in named {
            let threshold = self
                .thresholds
                .get(name)
                .copied()
                .map(duration_nanos)
                .unwrap_or(0);
            filter.enable(name.to_string(), threshold);
        }
        filter
    }

    pub fn parser_configuration(&self) -> ParserConfiguration {
        ParserConfiguration {
            filter_start: self.start_nanos.unwrap_or(i64::MIN),
            filter_end: self.end_nanos.unwrap_or(i64::MAX),
            ordered: self.ordered,
            reuse: self.reuse,
            filter: self.filter(),
            poll_interval: self.poll_interval,
        }
    }
}

fn epoch_nanos(time: DateTime<Utc>) -> Result<i64> {
    time.timestamp_nanos_opt()
        .ok_or_else(|| StreamError::Config(format!("time {} out of range", time)))
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn check_window(start: Option<i64>, end: Option<i64>) -> Result<()> {
    match (start, end) {
        (Some(start), Some(end)) if start > end => Err(StreamError::Config(format!(
            "start time {} is after end time {}",
            start, end
        ))),
        _ => Ok(()),
    }
}
