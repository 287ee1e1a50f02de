use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use encore_flightparser::{Metadata, RecordedEvent, Type};

pub type EventHandler = Arc<dyn Fn(&RecordedEvent) -> anyhow::Result<()> + Send + Sync>;
pub type FlushHandler = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
pub type MetadataHandler = Arc<dyn Fn(&MetadataEvent) -> anyhow::Result<()> + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// A new metadata generation seen by the stream.
#[derive(Debug, Clone)]
pub struct MetadataEvent {
    pub metadata: Arc<Metadata>,
    /// Event types not declared by the previous generation.
    pub added: Vec<Arc<Type>>,
    /// Event types of the previous generation that are gone.
    pub removed: Vec<Arc<Type>>,
}

impl MetadataEvent {
    pub(crate) fn new(previous: Option<&Metadata>, metadata: Arc<Metadata>) -> Self {
        let names = |md: &Metadata| -> HashSet<String> {
            md.event_types().iter().map(|t| t.name.clone()).collect()
        };
        let (added, removed) = match previous {
            None => (metadata.event_types().to_vec(), Vec::new()),
            Some(previous) => {
                let old = names(previous);
                let new = names(&metadata);
                let added = metadata
                    .event_types()
                    .iter()
                    .filter(|t| !old.contains(&t.name))
                    .cloned()
                    .collect();
                let removed = previous
                    .event_types()
                    .iter()
                    .filter(|t| !new.contains(&t.name))
                    .cloned()
                    .collect();
                (added, removed)
            }
        };
        Self {
            metadata,
            added,
            removed,
        }
    }
}

/// Handlers registered on a stream.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    /// Event handlers with the event name they handle, `None` for all events.
    events: Vec<(Option<String>, EventHandler)>,
    pub flush: Vec<FlushHandler>,
    pub close: Vec<CloseHandler>,
    pub error: Vec<ErrorHandler>,
    pub metadata: Vec<MetadataHandler>,
}

impl Handlers {
    pub fn add_event(&mut self, name: Option<String>, handler: EventHandler) {
        self.events.push((name, handler));
    }

    pub fn has_catch_all(&self) -> bool {
        self.events.iter().any(|(name, _)| name.is_none())
    }

    /// Distinct names with a name-specific handler.
    pub fn event_names(&self) -> BTreeSet<&str> {
        self.events
            .iter()
            .filter_map(|(name, _)| name.as_deref())
            .collect()
    }

    /// Handlers for events named `name`, in registration order.
    fn matching(&self, name: &str) -> Arc<[EventHandler]> {
        self.events
            .iter()
            .filter(|(n, _)| n.as_deref().map_or(true, |n| n == name))
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }
}

/// Routes events to handlers.
///
/// The handlers for an event type are looked up once per type id and
/// cached until the next metadata generation.
pub(crate) struct Dispatcher {
    handlers: Handlers,
    cache: HashMap<u64, Arc<[EventHandler]>>,
}

impl Dispatcher {
    pub fn new(handlers: Handlers) -> Self {
        Self {
            handlers,
            cache: HashMap::new(),
        }
    }

    pub fn dispatch(&mut self, event: &RecordedEvent) {
        let handlers = match self.cache.get(&event.event_type.id) {
            Some(handlers) => Arc::clone(handlers),
            None => {
                let handlers = self.handlers.matching(&event.event_type.name);
                self.cache
                    .insert(event.event_type.id, Arc::clone(&handlers));
                handlers
            }
        };
        for handler in handlers.iter() {
            if let Err(err) = guarded(|| handler(event)) {
                self.report(&err.context(format!("handling {}", event.name())));
            }
        }
    }

    pub fn flush(&self) {
        for handler in &self.handlers.flush {
            if let Err(err) = guarded(|| handler()) {
                self.report(&err.context("flush handler"));
            }
        }
    }

    /// Notifies metadata handlers. Type ids may be reassigned by a new
    /// generation, so the handler cache is dropped.
    pub fn metadata(&mut self, event: &MetadataEvent) {
        self.cache.clear();
        for handler in &self.handlers.metadata {
            if let Err(err) = guarded(|| handler(event)) {
                self.report(&err.context("metadata handler"));
            }
        }
    }

    pub fn report(&self, err: &anyhow::Error) {
        if self.handlers.error.is_empty() {
            log::error!("flight stream handler failed: {:#}", err);
            return;
        }
        for handler in &self.handlers.error {
            if let Err(panicked) = guarded(|| {
                handler(err);
                Ok(())
            }) {
                log::error!("flight stream error handler failed: {:#}", panicked);
            }
        }
    }
}

/// Runs a handler, turning a panic into an error so that the read loop
/// keeps going.
pub(crate) fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(anyhow::anyhow!("handler panicked: {}", msg))
        }
    }
}
