use std::collections::HashMap;
use std::sync::Arc;

use crate::reader::{ByteSource, ChunkFile, EncodedString};
use crate::types::{ParseError, Result};

/// Record type id of metadata records.
pub const METADATA_TYPE_ID: i64 = 0;

/// Super type that marks a type as an event type.
pub const EVENT_SUPER_TYPE: &str = "jdk.jfr.Event";

/// A field of a [`Type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub type_id: u64,
    pub is_array: bool,
    pub is_constant_pool: bool,
}

/// A type declared in the recording metadata.
/// A type without fields is a primitive leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub id: u64,
    pub name: String,
    pub super_type: Option<String>,
    pub simple_type: bool,
    pub fields: Vec<Field>,
}

impl Type {
    pub fn is_event_type(&self) -> bool {
        self.super_type.as_deref() == Some(EVENT_SUPER_TYPE)
    }

    /// Whether the second field of an event type carries its duration.
    pub fn has_duration(&self) -> bool {
        self.fields.get(1).is_some_and(|f| f.name == "duration")
    }

    /// Index of the first event field that is emitted as a value.
    /// The start time and duration are not.
    pub fn event_value_offset(&self) -> usize {
        self.fields.len().min(1) + self.has_duration() as usize
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// One generation of type declarations.
#[derive(Debug)]
pub struct Metadata {
    id: i64,
    types: Vec<Arc<Type>>,
    by_id: HashMap<u64, Arc<Type>>,
    event_types: Vec<Arc<Type>>,
    gmt_offset: i64,
    locale: Option<String>,
}

impl Metadata {
    pub fn new(id: i64, types: Vec<Type>) -> Self {
        let types: Vec<Arc<Type>> = types.into_iter().map(Arc::new).collect();
        let by_id = types.iter().map(|t| (t.id, Arc::clone(t))).collect();
        let event_types = types
            .iter()
            .filter(|t| t.is_event_type())
            .cloned()
            .collect();
        Self {
            id,
            types,
            by_id,
            event_types,
            gmt_offset: 0,
            locale: None,
        }
    }

    /// The generation id.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn types(&self) -> &[Arc<Type>] {
        &self.types
    }

    pub fn type_map(&self) -> &HashMap<u64, Arc<Type>> {
        &self.by_id
    }

    pub fn event_types(&self) -> &[Arc<Type>] {
        &self.event_types
    }

    pub fn get(&self, id: u64) -> Option<&Arc<Type>> {
        self.by_id.get(&id)
    }

    pub fn type_by_name(&self, name: &str) -> Option<&Arc<Type>> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Offset from GMT of the recording host, in milliseconds.
    pub fn gmt_offset(&self) -> i64 {
        self.gmt_offset
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }
}

/// Reads the metadata record at `position`.
///
/// If the record carries the same generation id as `previous`, the
/// previous metadata is returned without decoding the rest of the record.
pub fn read_metadata<F: ChunkFile>(
    source: &mut ByteSource<F>,
    position: u64,
    previous: Option<&Arc<Metadata>>,
) -> Result<Arc<Metadata>> {
    source.seek(position)?;
    let _size = source.read_long()?;
    let type_id = source.read_long()?;
    if type_id != METADATA_TYPE_ID {
        return Err(ParseError::ExpectedMetadata {
            position,
            found: type_id,
        });
    }
    let _start_time = source.read_long()?;
    let _duration = source.read_long()?;
    let id = source.read_long()?;
    if let Some(previous) = previous {
        if previous.id == id {
            return Ok(Arc::clone(previous));
        }
    }

    let count = source.read_length()?;
    let mut strings = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        match source.read_encoded_string()? {
            EncodedString::Null => strings.push(String::new()),
            EncodedString::Value(s) => strings.push(s),
            EncodedString::PoolKey(_) => {
                return Err(ParseError::InvalidMetadata(
                    "constant pool reference in string table".into(),
                ))
            }
        }
    }
    let root = Element::read(source, &strings, 0)?;
    let metadata = build(id, &root)?;
    log::debug!(
        "read metadata generation {} with {} types",
        id,
        metadata.types.len()
    );
    Ok(Arc::new(metadata))
}

/// Nesting limit of the element tree.
const MAX_ELEMENT_DEPTH: usize = 64;

/// A node of the metadata element tree.
#[derive(Debug)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
}

impl Element {
    fn read<F: ChunkFile>(
        source: &mut ByteSource<F>,
        strings: &[String],
        depth: usize,
    ) -> Result<Self> {
        if depth > MAX_ELEMENT_DEPTH {
            return Err(ParseError::InvalidMetadata(format!(
                "elements nested deeper than {}",
                MAX_ELEMENT_DEPTH
            )));
        }
        let name = lookup(strings, source.read_int()?)?;
        let attribute_count = source.read_length()?;
        let mut attributes = Vec::with_capacity(attribute_count.min(64));
        for _ in 0..attribute_count {
            let key = lookup(strings, source.read_int()?)?;
            let value = lookup(strings, source.read_int()?)?;
            attributes.push((key, value));
        }
        let child_count = source.read_length()?;
        let mut children = Vec::with_capacity(child_count.min(4096));
        for _ in 0..child_count {
            children.push(Element::read(source, strings, depth + 1)?);
        }
        Ok(Self {
            name,
            attributes,
            children,
        })
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.attribute(key).ok_or_else(|| {
            ParseError::InvalidMetadata(format!("{} element without {}", self.name, key))
        })
    }

    fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn lookup(strings: &[String], index: i32) -> Result<String> {
    usize::try_from(index)
        .ok()
        .and_then(|i| strings.get(i))
        .cloned()
        .ok_or_else(|| ParseError::InvalidMetadata(format!("string index {index} out of range")))
}

fn parse_id(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| ParseError::InvalidMetadata(format!("invalid type id: {value}")))
}

fn build(id: i64, root: &Element) -> Result<Metadata> {
    let mut types = Vec::new();
    for class in root.children("metadata").flat_map(|m| m.children("class")) {
        let mut fields = Vec::new();
        for field in class.children("field") {
            fields.push(Field {
                name: field.required("name")?.to_string(),
                type_id: parse_id(field.required("class")?)?,
                is_array: field.attribute("dimension") == Some("1"),
                is_constant_pool: field.attribute("constantPool") == Some("true"),
            });
        }
        types.push(Type {
            id: parse_id(class.required("id")?)?,
            name: class.required("name")?.to_string(),
            super_type: class.attribute("superType").map(str::to_string),
            simple_type: class.attribute("simpleType") == Some("true"),
            fields,
        });
    }

    let mut metadata = Metadata::new(id, types);
    if let Some(region) = root.children("region").next() {
        metadata.gmt_offset = region
            .attribute("gmtOffset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        metadata.locale = region.attribute("locale").map(str::to_string);
    }
    Ok(metadata)
}
