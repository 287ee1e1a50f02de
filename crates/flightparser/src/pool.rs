use std::collections::HashMap;
use std::sync::Arc;

use crate::metadata::Type;
use crate::value::{ObjectFactory, PoolRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveState {
    Unresolved,
    Started,
    Finished,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    state: ResolveState,
}

/// The constant pool entries of one type for one generation.
#[derive(Debug, Default)]
pub struct ConstantMap {
    entries: HashMap<i64, Entry>,
    resolving: bool,
    all_resolved: bool,
    factory: Option<ObjectFactory>,
}

impl ConstantMap {
    fn new(factory: Option<ObjectFactory>) -> Self {
        Self {
            factory,
            ..Default::default()
        }
    }

    /// Stores a raw value. The first value stored for a key wins.
    pub fn put(&mut self, key: i64, value: Value) {
        self.entries.entry(key).or_insert(Entry {
            value,
            state: ResolveState::Unresolved,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_all_resolved(&self) -> bool {
        self.all_resolved
    }

    fn resolved(&self, key: i64) -> Option<&Value> {
        self.entries
            .get(&key)
            .filter(|e| e.state == ResolveState::Finished)
            .map(|e| &e.value)
    }

    /// A fresh map holding only the resolved entries of this one.
    fn carry_over(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == ResolveState::Finished)
            .map(|(k, e)| (*k, e.clone()))
            .collect();
        Self {
            entries,
            ..Self::new(self.factory)
        }
    }
}

/// The generations of one constant pool type.
#[derive(Debug)]
pub struct ConstantLookup {
    ty: Arc<Type>,
    previous: ConstantMap,
    current: ConstantMap,
}

impl ConstantLookup {
    pub fn new(ty: Arc<Type>) -> Self {
        let factory = ObjectFactory::for_type(&ty.name);
        Self {
            ty,
            previous: ConstantMap::new(factory),
            current: ConstantMap::new(factory),
        }
    }

    pub fn ty(&self) -> &Arc<Type> {
        &self.ty
    }

    /// Starts a new generation. Resolved values are carried into it.
    pub fn new_pool(&mut self) {
        let next = self.current.carry_over();
        self.previous = std::mem::replace(&mut self.current, next);
    }

    /// Starts a fresh chain, dropping every generation.
    pub fn reset(&mut self) {
        let factory = self.current.factory;
        self.previous = ConstantMap::new(factory);
        self.current = ConstantMap::new(factory);
    }

    pub fn previous_resolved(&self, key: i64) -> Option<&Value> {
        self.previous.resolved(key)
    }

    pub fn current_resolved(&self, key: i64) -> Option<&Value> {
        self.current
            .resolved(key)
            .or_else(|| self.previous_resolved(key))
    }

    pub fn current(&self) -> &ConstantMap {
        &self.current
    }
}

/// All constant pools of a chunk parser chain, keyed by type id.
#[derive(Debug, Default)]
pub struct ConstantPools {
    lookups: HashMap<u64, ConstantLookup>,
}

impl ConstantPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure a lookup exists for `ty`, updating its declaration.
    pub fn register(&mut self, ty: &Arc<Type>) {
        match self.lookups.get_mut(&ty.id) {
            Some(lookup) => {
                if lookup.ty != *ty {
                    lookup.ty = Arc::clone(ty);
                    let factory = ObjectFactory::for_type(&ty.name);
                    lookup.previous.factory = factory;
                    lookup.current.factory = factory;
                }
            }
            None => {
                self.lookups.insert(ty.id, ConstantLookup::new(Arc::clone(ty)));
            }
        }
    }

    pub fn lookup(&self, type_id: u64) -> Option<&ConstantLookup> {
        self.lookups.get(&type_id)
    }

    /// Stores a raw value in the current generation of a registered pool.
    pub fn put(&mut self, type_id: u64, key: i64, value: Value) {
        if let Some(lookup) = self.lookups.get_mut(&type_id) {
            lookup.current.put(key, value);
        }
    }

    pub fn previous_resolved(&self, type_id: u64, key: i64) -> Option<&Value> {
        self.lookups
            .get(&type_id)
            .and_then(|l| l.previous_resolved(key))
    }

    /// The resolved value of a key, as seen by events.
    pub fn current_resolved(&self, type_id: u64, key: i64) -> Option<&Value> {
        self.lookups
            .get(&type_id)
            .and_then(|l| l.current_resolved(key))
    }

    /// The value of a reference made from inside another pool entry.
    ///
    /// A value resolved in an earlier generation is used directly; anything
    /// else becomes a placeholder that is resolved later.
    pub fn reference(&self, type_id: u64, key: i64) -> Value {
        let Some(lookup) = self.lookups.get(&type_id) else {
            return Value::Unresolved(PoolRef { type_id, key });
        };
        if let Some(value) = lookup.previous_resolved(key) {
            return value.clone();
        }
        if lookup.current.all_resolved {
            if let Some(value) = lookup.current.resolved(key) {
                return value.clone();
            }
        }
        Value::Unresolved(PoolRef { type_id, key })
    }

    /// Resolves a single entry of the current generation.
    pub fn get(&mut self, type_id: u64, key: i64) -> Value {
        let Some(lookup) = self.lookups.get_mut(&type_id) else {
            log::debug!("reference to unknown constant pool type {}", type_id);
            return Value::Null;
        };
        if lookup.current.all_resolved {
            return lookup.current_resolved(key).cloned().unwrap_or_default();
        }
        if !lookup.current.resolving {
            return Value::Unresolved(PoolRef { type_id, key });
        }
        if !lookup.current.entries.contains_key(&key) {
            if let Some(value) = lookup.previous_resolved(key) {
                return value.clone();
            }
            log::debug!(
                "missing constant pool entry {} in {}",
                key,
                lookup.ty.name
            );
            return Value::Null;
        }
        let factory = lookup.current.factory;
        let raw = match lookup.current.entries.get_mut(&key) {
            None => return Value::Null,
            Some(entry) => match entry.state {
                ResolveState::Finished => return entry.value.clone(),
                // Reached again while resolving itself.
                ResolveState::Started => return Value::Null,
                ResolveState::Unresolved => {
                    entry.state = ResolveState::Started;
                    std::mem::take(&mut entry.value)
                }
            },
        };

        let mut resolved = self.resolve_value(raw);
        if let Some(factory) = factory {
            resolved = factory.apply(resolved);
        }
        if let Some(entry) = self
            .lookups
            .get_mut(&type_id)
            .and_then(|l| l.current.entries.get_mut(&key))
        {
            entry.value = resolved.clone();
            entry.state = ResolveState::Finished;
        }
        resolved
    }

    fn resolve_value(&mut self, value: Value) -> Value {
        match value {
            Value::Unresolved(r) => self.get(r.type_id, r.key),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.resolve_value(v)).collect())
            }
            Value::Object(mut record) => {
                if record.fields.iter().any(needs_resolution) {
                    let fields = &mut Arc::make_mut(&mut record).fields;
                    for field in fields.iter_mut() {
                        *field = self.resolve_value(std::mem::take(field));
                    }
                }
                Value::Object(record)
            }
            other => other,
        }
    }

    /// Starts resolution of the current generation of every pool.
    pub fn set_resolving(&mut self) {
        for lookup in self.lookups.values_mut() {
            lookup.current.resolving = true;
        }
    }

    /// Marks the current generation of every pool as fully resolved.
    pub fn set_resolved(&mut self) {
        for lookup in self.lookups.values_mut() {
            lookup.current.resolving = false;
            lookup.current.all_resolved = true;
        }
    }

    /// Resolves every entry of the current generation.
    pub fn resolve(&mut self) {
        let type_ids: Vec<u64> = self.lookups.keys().copied().collect();
        for type_id in type_ids {
            let keys: Vec<i64> = match self.lookups.get(&type_id) {
                Some(l) if !l.current.all_resolved => l.current.entries.keys().copied().collect(),
                _ => continue,
            };
            for key in keys {
                self.get(type_id, key);
            }
        }
    }

    pub fn resolve_all(&mut self) {
        self.set_resolving();
        self.resolve();
        self.set_resolved();
    }

    /// Starts a new generation in every pool.
    pub fn new_pools(&mut self) {
        for lookup in self.lookups.values_mut() {
            lookup.new_pool();
        }
    }

    /// Drops all generations of every pool.
    pub fn reset(&mut self) {
        for lookup in self.lookups.values_mut() {
            lookup.reset();
        }
    }
}

fn needs_resolution(value: &Value) -> bool {
    match value {
        Value::Unresolved(_) => true,
        Value::Array(items) => items.iter().any(needs_resolution),
        Value::Object(record) => record.fields.iter().any(needs_resolution),
        _ => false,
    }
}
