use std::sync::Arc;

use crate::metadata::Type;

/// A reference into a constant pool that has not been resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolRef {
    pub type_id: u64,
    pub key: i64,
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Char(char),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(Arc<str>),
    Array(Vec<Value>),
    Object(Arc<Record>),
    Unresolved(PoolRef),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widens any integral value to an i64.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(*v as i64),
            Value::Short(v) => Some(*v as i64),
            Value::Char(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Record> {
        match self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }
}

/// What a record represents, for types with special meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordKind {
    #[default]
    Plain,
    Class,
    ClassLoader,
    Thread,
    ThreadGroup,
    StackTrace,
    StackFrame,
    Method,
    Package,
    Module,
}

/// A decoded composite value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub ty: Arc<Type>,
    pub kind: RecordKind,
    pub fields: Vec<Value>,
}

impl Record {
    pub fn new(ty: Arc<Type>, fields: Vec<Value>) -> Self {
        Self {
            ty,
            kind: RecordKind::Plain,
            fields,
        }
    }

    /// Looks up a field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.ty
            .fields
            .iter()
            .position(|f| f.name == name)
            .and_then(|i| self.fields.get(i))
    }
}

static WELL_KNOWN_TYPES: &[(&str, RecordKind)] = &[
    ("java.lang.Class", RecordKind::Class),
    ("java.lang.ClassLoader", RecordKind::ClassLoader),
    ("java.lang.Thread", RecordKind::Thread),
    ("java.lang.ThreadGroup", RecordKind::ThreadGroup),
    ("jdk.types.StackTrace", RecordKind::StackTrace),
    ("jdk.types.StackFrame", RecordKind::StackFrame),
    ("jdk.types.Method", RecordKind::Method),
    ("jdk.types.Package", RecordKind::Package),
    ("jdk.types.Module", RecordKind::Module),
];

/// Tags resolved pool values of well-known types with their [`RecordKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectFactory {
    kind: RecordKind,
}

impl ObjectFactory {
    /// Returns the factory for a type name, if it is a well-known type.
    pub fn for_type(name: &str) -> Option<Self> {
        WELL_KNOWN_TYPES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| Self { kind: *kind })
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn apply(&self, value: Value) -> Value {
        match value {
            Value::Object(mut record) => {
                Arc::make_mut(&mut record).kind = self.kind;
                Value::Object(record)
            }
            other => other,
        }
    }
}
