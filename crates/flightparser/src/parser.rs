use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::metadata::{Field, Metadata, Type};
use crate::pool::ConstantPools;
use crate::reader::{ByteSource, ChunkFile, EncodedString};
use crate::types::{ParseError, Result};
use crate::value::{Record, Value};

/// Record type id of checkpoint records.
pub const CHECKPOINT_TYPE_ID: u64 = 1;

/// Index of a parser in a [`ParserSet`].
pub type ParserId = usize;

/// Where a value is being decoded, which decides how constant pool
/// references are looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Event,
    Pool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
}

impl Primitive {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "boolean" => Primitive::Boolean,
            "byte" => Primitive::Byte,
            "short" => Primitive::Short,
            "char" => Primitive::Char,
            "int" => Primitive::Int,
            "long" => Primitive::Long,
            "float" => Primitive::Float,
            "double" => Primitive::Double,
            _ => return None,
        })
    }
}

fn is_string_type(name: &str) -> bool {
    name == "java.lang.String" || name == "string"
}

#[derive(Debug, Clone)]
pub enum Parser {
    Primitive(Primitive),
    /// A tagged string; pool keys refer to the pool of `pool_type`.
    String { pool_type: u64, context: Context },
    Composite { ty: Arc<Type>, fields: Vec<ParserId> },
    Array(ParserId),
    /// A key resolved against the current resolved generation.
    EventConstant { type_id: u64 },
    /// A key resolved lazily, while the pool generation is being filled.
    PoolConstant { type_id: u64 },
}

/// Decodes the events of one event type.
#[derive(Debug, Clone)]
pub struct EventParser {
    pub ty: Arc<Type>,
    pub has_start_time: bool,
    pub has_duration: bool,
    /// Parsers for the emitted fields, after start time and duration.
    pub fields: Vec<ParserId>,
}

/// How a record with a given type id is handled.
#[derive(Debug)]
pub enum RecordType<'a> {
    Metadata,
    Checkpoint,
    Event(&'a EventParser),
    Unknown,
}

/// The parsers built from one metadata generation.
#[derive(Debug, Default)]
pub struct ParserSet {
    parsers: Vec<Parser>,
    by_type: HashMap<(u64, Context), ParserId>,
    events: HashMap<u64, EventParser>,
}

impl ParserSet {
    pub fn get(&self, id: ParserId) -> &Parser {
        &self.parsers[id]
    }

    /// The parser for values stored in the constant pool of `type_id`.
    pub fn pool_parser(&self, type_id: u64) -> Option<ParserId> {
        self.by_type.get(&(type_id, Context::Pool)).copied()
    }

    pub fn event_parser(&self, type_id: u64) -> Option<&EventParser> {
        self.events.get(&type_id)
    }

    pub fn event_parsers(&self) -> impl Iterator<Item = &EventParser> {
        self.events.values()
    }

    pub fn record_type(&self, type_id: u64) -> RecordType<'_> {
        match type_id {
            0 => RecordType::Metadata,
            CHECKPOINT_TYPE_ID => RecordType::Checkpoint,
            id => match self.events.get(&id) {
                Some(parser) => RecordType::Event(parser),
                None => RecordType::Unknown,
            },
        }
    }

    /// Decodes one value.
    pub fn parse<F: ChunkFile>(
        &self,
        id: ParserId,
        source: &mut ByteSource<F>,
        pools: &ConstantPools,
    ) -> Result<Value> {
        Ok(match &self.parsers[id] {
            Parser::Primitive(p) => read_primitive(*p, source)?,
            Parser::String { pool_type, context } => match source.read_encoded_string()? {
                EncodedString::Null => Value::Null,
                EncodedString::Value(s) => Value::String(s.into()),
                EncodedString::PoolKey(key) => constant(pools, *pool_type, key, *context),
            },
            Parser::Composite { ty, fields } => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.parse(*field, source, pools)?);
                }
                Value::Object(Arc::new(Record::new(Arc::clone(ty), values)))
            }
            Parser::Array(element) => {
                let len = source.read_length()?;
                let mut values = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    values.push(self.parse(*element, source, pools)?);
                }
                Value::Array(values)
            }
            Parser::EventConstant { type_id } => {
                let key = source.read_long()?;
                constant(pools, *type_id, key, Context::Event)
            }
            Parser::PoolConstant { type_id } => {
                let key = source.read_long()?;
                constant(pools, *type_id, key, Context::Pool)
            }
        })
    }

    /// Skips one value.
    pub fn skip<F: ChunkFile>(&self, id: ParserId, source: &mut ByteSource<F>) -> Result<()> {
        match &self.parsers[id] {
            Parser::Primitive(Primitive::Boolean | Primitive::Byte) => source.skip(1),
            Parser::Primitive(Primitive::Float) => source.skip(4),
            Parser::Primitive(Primitive::Double) => source.skip(8),
            Parser::Primitive(_) | Parser::EventConstant { .. } | Parser::PoolConstant { .. } => {
                source.read_long().map(drop)
            }
            Parser::String { .. } => source.skip_encoded_string(),
            Parser::Composite { fields, .. } => {
                for field in fields {
                    self.skip(*field, source)?;
                }
                Ok(())
            }
            Parser::Array(element) => {
                let len = source.read_length()?;
                for _ in 0..len {
                    self.skip(*element, source)?;
                }
                Ok(())
            }
        }
    }
}

fn read_primitive<F: ChunkFile>(p: Primitive, source: &mut ByteSource<F>) -> Result<Value> {
    Ok(match p {
        Primitive::Boolean => Value::Boolean(source.read_boolean()?),
        Primitive::Byte => Value::Byte(source.read_byte()? as i8),
        Primitive::Short => Value::Short(source.read_short()?),
        Primitive::Char => Value::Char(source.read_char()?),
        Primitive::Int => Value::Int(source.read_int()?),
        Primitive::Long => Value::Long(source.read_long()?),
        Primitive::Float => Value::Float(source.read_float()?),
        Primitive::Double => Value::Double(source.read_double()?),
    })
}

fn constant(pools: &ConstantPools, type_id: u64, key: i64, context: Context) -> Value {
    match context {
        Context::Event => pools
            .current_resolved(type_id, key)
            .cloned()
            .unwrap_or(Value::Null),
        Context::Pool => pools.reference(type_id, key),
    }
}

/// Builds a [`ParserSet`] from metadata, registering every constant pool
/// the parsers refer to.
pub struct ParserFactory<'a> {
    metadata: &'a Metadata,
    pools: &'a mut ConstantPools,
    set: ParserSet,
    building: HashSet<(u64, Context)>,
}

impl<'a> ParserFactory<'a> {
    pub fn new(metadata: &'a Metadata, pools: &'a mut ConstantPools) -> Self {
        Self {
            metadata,
            pools,
            set: ParserSet::default(),
            building: HashSet::new(),
        }
    }

    pub fn build(mut self) -> Result<ParserSet> {
        let metadata = self.metadata;
        for ty in metadata.types() {
            let leaf = Primitive::from_name(&ty.name).is_some() || is_string_type(&ty.name);
            if !ty.fields.is_empty() || leaf {
                self.type_parser(ty.id, Context::Pool)?;
            }
        }
        for ty in metadata.event_types() {
            let parser = self.event_parser(ty)?;
            self.set.events.insert(ty.id, parser);
        }
        log::debug!(
            "built {} parsers for {} event types",
            self.set.parsers.len(),
            self.set.events.len()
        );
        Ok(self.set)
    }

    fn push(&mut self, parser: Parser) -> ParserId {
        self.set.parsers.push(parser);
        self.set.parsers.len() - 1
    }

    fn event_parser(&mut self, ty: &Arc<Type>) -> Result<EventParser> {
        let offset = ty.event_value_offset();
        let mut fields = Vec::with_capacity(ty.fields.len() - offset);
        for field in &ty.fields[offset..] {
            fields.push(self.field_parser(field, Context::Event)?);
        }
        Ok(EventParser {
            ty: Arc::clone(ty),
            has_start_time: !ty.fields.is_empty(),
            has_duration: ty.has_duration(),
            fields,
        })
    }

    fn field_parser(&mut self, field: &Field, context: Context) -> Result<ParserId> {
        let element = if field.is_constant_pool {
            let ty = self
                .metadata
                .get(field.type_id)
                .ok_or(ParseError::MissingType(field.type_id))?;
            self.pools.register(ty);
            let type_id = field.type_id;
            self.push(match context {
                Context::Event => Parser::EventConstant { type_id },
                Context::Pool => Parser::PoolConstant { type_id },
            })
        } else {
            self.type_parser(field.type_id, context)?
        };
        Ok(if field.is_array {
            self.push(Parser::Array(element))
        } else {
            element
        })
    }

    fn type_parser(&mut self, type_id: u64, context: Context) -> Result<ParserId> {
        if let Some(id) = self.set.by_type.get(&(type_id, context)) {
            return Ok(*id);
        }
        let ty = Arc::clone(
            self.metadata
                .get(type_id)
                .ok_or(ParseError::MissingType(type_id))?,
        );

        if ty.fields.is_empty() {
            let parser = if is_string_type(&ty.name) {
                self.pools.register(&ty);
                Parser::String {
                    pool_type: type_id,
                    context,
                }
            } else {
                Parser::Primitive(
                    Primitive::from_name(&ty.name)
                        .ok_or_else(|| ParseError::UnknownPrimitive(ty.name.clone()))?,
                )
            };
            let id = self.push(parser);
            self.set.by_type.insert((type_id, context), id);
            return Ok(id);
        }

        if ty.simple_type && ty.fields.len() == 1 {
            if !self.building.insert((type_id, context)) {
                return Err(ParseError::InvalidMetadata(format!(
                    "simple type {} refers to itself",
                    ty.name
                )));
            }
            let id = self.field_parser(&ty.fields[0], context)?;
            self.building.remove(&(type_id, context));
            self.set.by_type.insert((type_id, context), id);
            return Ok(id);
        }

        // Registered before its fields so that recursive types terminate.
        let id = self.push(Parser::Composite {
            ty: Arc::clone(&ty),
            fields: Vec::new(),
        });
        self.set.by_type.insert((type_id, context), id);
        let mut fields = Vec::with_capacity(ty.fields.len());
        for field in &ty.fields {
            fields.push(self.field_parser(field, context)?);
        }
        if let Parser::Composite { fields: slot, .. } = &mut self.set.parsers[id] {
            *slot = fields;
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::EVENT_SUPER_TYPE;
    use crate::testutil::{RecordBuffer, SharedFile};
    use crate::value::PoolRef;
    use assert_matches::assert_matches;

    fn placeholder(type_id: u64, key: i64) -> Value {
        Value::Unresolved(PoolRef { type_id, key })
    }

    fn field(name: &str, type_id: u64) -> Field {
        Field {
            name: name.into(),
            type_id,
            is_array: false,
            is_constant_pool: false,
        }
    }

    fn ty(id: u64, name: &str, fields: Vec<Field>) -> Type {
        Type {
            id,
            name: name.into(),
            super_type: None,
            simple_type: false,
            fields,
        }
    }

    fn source(buf: RecordBuffer) -> ByteSource<SharedFile> {
        let bytes = buf.into_bytes();
        let len = bytes.len() as u64;
        let mut source = ByteSource::new(SharedFile::new(bytes)).unwrap();
        source.set_valid_size(len);
        source
    }

    fn base_types() -> Vec<Type> {
        vec![
            ty(1, "long", vec![]),
            ty(2, "java.lang.String", vec![]),
            ty(3, "int", vec![]),
        ]
    }

    #[test]
    fn test_recursive_type_terminates() {
        let mut types = base_types();
        types.push(ty(10, "demo.Node", vec![field("value", 1), field("next", 10)]));
        let metadata = Metadata::new(1, types);
        let mut pools = ConstantPools::new();
        let set = ParserFactory::new(&metadata, &mut pools).build().unwrap();

        let id = set.pool_parser(10).unwrap();
        match set.get(id) {
            Parser::Composite { fields, .. } => assert_eq!(fields[1], id),
            other => panic!("unexpected parser {other:?}"),
        }
    }

    #[test]
    fn test_unknown_primitive() {
        let mut types = base_types();
        types.push(ty(4, "quad", vec![]));
        types.push(ty(10, "demo.Wide", vec![field("value", 4)]));
        let metadata = Metadata::new(1, types);
        let mut pools = ConstantPools::new();
        assert_matches!(
            ParserFactory::new(&metadata, &mut pools).build(),
            Err(ParseError::UnknownPrimitive(name)) if name == "quad"
        );
    }

    #[test]
    fn test_missing_type() {
        let mut types = base_types();
        types.push(ty(10, "demo.Broken", vec![field("value", 99)]));
        let metadata = Metadata::new(1, types);
        let mut pools = ConstantPools::new();
        assert_matches!(
            ParserFactory::new(&metadata, &mut pools).build(),
            Err(ParseError::MissingType(99))
        );
    }

    #[test]
    fn test_simple_type_reduces_to_field() {
        let mut types = base_types();
        let mut wrapper = ty(10, "demo.Millis", vec![field("value", 1)]);
        wrapper.simple_type = true;
        types.push(wrapper);
        types.push(ty(11, "demo.Holder", vec![field("millis", 10)]));
        let metadata = Metadata::new(1, types);
        let mut pools = ConstantPools::new();
        let set = ParserFactory::new(&metadata, &mut pools).build().unwrap();

        let mut buf = RecordBuffer::new();
        buf.long(42);
        let mut src = source(buf);
        let value = set.parse(set.pool_parser(11).unwrap(), &mut src, &pools).unwrap();
        let record = value.as_object().unwrap();
        assert_eq!(record.get("millis"), Some(&Value::Long(42)));
    }

    #[test]
    fn test_event_parser_excludes_time_fields() {
        let mut types = base_types();
        let mut event = ty(
            20,
            "demo.Event",
            vec![field("startTime", 1), field("duration", 1), field("count", 3)],
        );
        event.super_type = Some(EVENT_SUPER_TYPE.into());
        types.push(event);
        let metadata = Metadata::new(1, types);
        let mut pools = ConstantPools::new();
        let set = ParserFactory::new(&metadata, &mut pools).build().unwrap();

        let parser = set.event_parser(20).unwrap();
        assert!(parser.has_start_time);
        assert!(parser.has_duration);
        assert_eq!(parser.fields.len(), 1);
        assert_matches!(set.record_type(20), RecordType::Event(_));
        assert_matches!(set.record_type(1), RecordType::Checkpoint);
        assert_matches!(set.record_type(0), RecordType::Metadata);
        assert_matches!(set.record_type(77), RecordType::Unknown);
    }

    #[test]
    fn test_constant_fields_by_context() {
        let mut types = base_types();
        let mut thread_ref = field("thread", 10);
        thread_ref.is_constant_pool = true;
        types.push(ty(10, "demo.Thread", vec![field("name", 2)]));
        types.push(ty(11, "demo.Frame", vec![thread_ref.clone()]));
        let mut event = ty(20, "demo.Event", vec![field("startTime", 1), thread_ref]);
        event.super_type = Some(EVENT_SUPER_TYPE.into());
        types.push(event);
        let metadata = Metadata::new(1, types);
        let mut pools = ConstantPools::new();
        let set = ParserFactory::new(&metadata, &mut pools).build().unwrap();
        assert!(pools.lookup(10).is_some());

        let frame = set.pool_parser(11).unwrap();
        let mut buf = RecordBuffer::new();
        buf.long(5);
        let value = set.parse(frame, &mut source(buf), &pools).unwrap();
        assert_eq!(value.as_object().unwrap().fields[0], placeholder(10, 5));

        let event = set.event_parser(20).unwrap();
        let mut buf = RecordBuffer::new();
        buf.long(5);
        let value = set.parse(event.fields[0], &mut source(buf), &pools).unwrap();
        // Nothing resolved in the pool yet.
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_parse_and_skip_agree() {
        let mut types = base_types();
        let mut values = field("values", 3);
        values.is_array = true;
        types.push(ty(5, "double", vec![]));
        types.push(ty(6, "boolean", vec![]));
        types.push(ty(
            10,
            "demo.Mixed",
            vec![
                field("name", 2),
                values,
                field("ratio", 5),
                field("flag", 6),
                field("id", 1),
            ],
        ));
        let metadata = Metadata::new(1, types);
        let mut pools = ConstantPools::new();
        let set = ParserFactory::new(&metadata, &mut pools).build().unwrap();
        let id = set.pool_parser(10).unwrap();

        let write = |buf: &mut RecordBuffer| {
            buf.string(Some("mixed"));
            buf.int(3);
            buf.int(1);
            buf.int(-2);
            buf.int(300);
            buf.double(0.5);
            buf.bool(true);
            buf.long(1 << 40);
        };
        let mut buf = RecordBuffer::new();
        write(&mut buf);
        write(&mut buf);
        buf.long(7);
        let mut src = source(buf);

        let value = set.parse(id, &mut src, &pools).unwrap();
        let record = value.as_object().unwrap();
        assert_eq!(record.get("name").and_then(Value::as_str), Some("mixed"));
        assert_eq!(
            record.get("values"),
            Some(&Value::Array(vec![Value::Int(1), Value::Int(-2), Value::Int(300)]))
        );
        assert_eq!(record.get("ratio"), Some(&Value::Double(0.5)));
        assert_eq!(record.get("flag"), Some(&Value::Boolean(true)));
        assert_eq!(record.get("id"), Some(&Value::Long(1 << 40)));

        set.skip(id, &mut src).unwrap();
        assert_eq!(src.read_long().unwrap(), 7);
    }
}
