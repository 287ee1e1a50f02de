//! Writers for building recordings in tests.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{BufMut, BytesMut};

use crate::header::HEADER_SIZE;
use crate::metadata::EVENT_SUPER_TYPE;
use crate::reader::ChunkFile;

/// A buffer for encoding record payloads.
#[derive(Default)]
pub struct RecordBuffer {
    buf: BytesMut,
}

impl AsRef<[u8]> for RecordBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Writes a single byte.
    pub fn byte(&mut self, byte: u8) {
        self.buf.put_u8(byte);
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn bool(&mut self, b: bool) {
        self.byte(if b { 1 } else { 0 });
    }

    /// Writes a variable-length long.
    pub fn long(&mut self, value: i64) {
        let mut v = value as u64;
        for _ in 0..8 {
            if v < 0x80 {
                self.buf.put_u8(v as u8);
                return;
            }
            self.buf.put_u8((v as u8 & 0x7F) | 0x80);
            v >>= 7;
        }
        // The ninth byte carries all eight remaining bits.
        self.buf.put_u8(v as u8);
    }

    pub fn int(&mut self, value: i32) {
        self.long(value as i64);
    }

    /// Writes a variable-length value always using four bytes, the way
    /// record sizes are written.
    pub fn padded_int(&mut self, value: u32) {
        self.buf.put_u8((value & 0x7F) as u8 | 0x80);
        self.buf.put_u8((value >> 7 & 0x7F) as u8 | 0x80);
        self.buf.put_u8((value >> 14 & 0x7F) as u8 | 0x80);
        self.buf.put_u8((value >> 21 & 0x7F) as u8);
    }

    pub fn float(&mut self, f: f32) {
        self.buf.put_f32(f);
    }

    pub fn double(&mut self, f: f64) {
        self.buf.put_f64(f);
    }

    /// Writes a string as null or UTF-8.
    pub fn string(&mut self, s: Option<&str>) {
        match s {
            None => self.byte(0),
            Some("") => self.byte(1),
            Some(s) => {
                self.byte(3);
                self.int(s.len() as i32);
                self.buf.put_slice(s.as_bytes());
            }
        }
    }

    /// Writes a string as a reference into the string constant pool.
    pub fn string_pool_ref(&mut self, key: i64) {
        self.byte(2);
        self.long(key);
    }

    pub fn string_chars(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.byte(4);
        self.int(units.len() as i32);
        for unit in units {
            self.long(unit as i64);
        }
    }

    /// Writes a string with Latin-1 encoding. Characters above U+00FF are
    /// not representable and must not be passed.
    pub fn string_latin1(&mut self, s: &str) {
        let bytes: Vec<u8> = s.chars().map(|c| c as u8).collect();
        self.byte(5);
        self.int(bytes.len() as i32);
        self.buf.put_slice(&bytes);
    }
}

/// A field declaration for [`TypeDef`].
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub type_id: u64,
    pub constant_pool: bool,
    pub array: bool,
}

/// A type declaration to be written into a metadata record.
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub id: u64,
    pub name: String,
    pub super_type: Option<String>,
    pub simple_type: bool,
    pub fields: Vec<FieldDef>,
}

impl TypeDef {
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            super_type: None,
            simple_type: false,
            fields: Vec::new(),
        }
    }

    /// An event type, which should declare `startTime` as its first field.
    pub fn event(id: u64, name: &str) -> Self {
        let mut ty = Self::new(id, name);
        ty.super_type = Some(EVENT_SUPER_TYPE.to_string());
        ty
    }

    pub fn simple(mut self) -> Self {
        self.simple_type = true;
        self
    }

    pub fn field(self, name: &str, type_id: u64) -> Self {
        self.push(name, type_id, false, false)
    }

    pub fn pool_field(self, name: &str, type_id: u64) -> Self {
        self.push(name, type_id, true, false)
    }

    pub fn array_field(self, name: &str, type_id: u64) -> Self {
        self.push(name, type_id, false, true)
    }

    fn push(mut self, name: &str, type_id: u64, constant_pool: bool, array: bool) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            type_id,
            constant_pool,
            array,
        });
        self
    }
}

struct ElementDef {
    name: &'static str,
    attributes: Vec<(&'static str, String)>,
    children: Vec<ElementDef>,
}

impl ElementDef {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    fn attr(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.attributes.push((key, value.into()));
        self
    }
}

#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, i32>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> i32 {
        if let Some(i) = self.index.get(s) {
            return *i;
        }
        let i = self.strings.len() as i32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }

    fn collect(&mut self, element: &ElementDef) {
        self.intern(element.name);
        for (k, v) in &element.attributes {
            self.intern(k);
            self.intern(v);
        }
        for child in &element.children {
            self.collect(child);
        }
    }
}

fn write_element(buf: &mut RecordBuffer, table: &mut StringTable, element: &ElementDef) {
    buf.int(table.intern(element.name));
    buf.int(element.attributes.len() as i32);
    for (k, v) in &element.attributes {
        buf.int(table.intern(k));
        buf.int(table.intern(v));
    }
    buf.int(element.children.len() as i32);
    for child in &element.children {
        write_element(buf, table, child);
    }
}

/// Constant pool entries for one checkpoint.
#[derive(Default)]
pub struct CheckpointBuilder {
    pools: Vec<PoolBuilder>,
}

impl CheckpointBuilder {
    /// Adds a pool of `type_id` to the checkpoint.
    pub fn pool(&mut self, type_id: u64) -> &mut PoolBuilder {
        self.pools.push(PoolBuilder {
            type_id,
            entries: Vec::new(),
        });
        let last = self.pools.len() - 1;
        &mut self.pools[last]
    }
}

pub struct PoolBuilder {
    type_id: u64,
    entries: Vec<(i64, RecordBuffer)>,
}

impl PoolBuilder {
    pub fn entry(&mut self, key: i64, f: impl FnOnce(&mut RecordBuffer)) -> &mut Self {
        let mut buf = RecordBuffer::new();
        f(&mut buf);
        self.entries.push((key, buf));
        self
    }
}

/// Builds a single chunk, record by record.
pub struct ChunkWriter {
    start_nanos: i64,
    start_ticks: i64,
    ticks_per_second: i64,
    duration_nanos: i64,
    body: RecordBuffer,
    metadata_offset: u64,
    constant_pool_offset: u64,
    region: Option<(i64, String)>,
    file_state: u8,
    flags: u8,
}

impl ChunkWriter {
    pub fn new(start_nanos: i64, start_ticks: i64, ticks_per_second: i64) -> Self {
        Self {
            start_nanos,
            start_ticks,
            ticks_per_second,
            duration_nanos: 0,
            body: RecordBuffer::new(),
            metadata_offset: 0,
            constant_pool_offset: 0,
            region: None,
            file_state: 1,
            flags: 0,
        }
    }

    /// Offset of the next record, relative to the chunk start.
    pub fn offset(&self) -> u64 {
        HEADER_SIZE + self.body.len() as u64
    }

    /// Appends a record with the given type id and payload.
    pub fn record(&mut self, type_id: u64, payload: &[u8]) -> u64 {
        let offset = self.offset();
        let mut id = RecordBuffer::new();
        id.long(type_id as i64);
        let size = 4 + id.len() + payload.len();
        self.body.padded_int(size as u32);
        self.body.raw(id.as_ref());
        self.body.raw(payload);
        offset
    }

    /// Appends raw bytes that are not a well-formed record.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.body.raw(bytes);
    }

    /// Sets the region written with subsequent metadata records.
    pub fn region(&mut self, gmt_offset: i64, locale: &str) {
        self.region = Some((gmt_offset, locale.to_string()));
    }

    /// Appends a metadata record and points the header at it.
    pub fn metadata(&mut self, id: i64, types: &[TypeDef]) -> u64 {
        let mut metadata = ElementDef::new("metadata");
        for ty in types {
            let mut class = ElementDef::new("class")
                .attr("id", ty.id.to_string())
                .attr("name", ty.name.as_str());
            if let Some(super_type) = &ty.super_type {
                class = class.attr("superType", super_type.as_str());
            }
            if ty.simple_type {
                class = class.attr("simpleType", "true");
            }
            for field in &ty.fields {
                let mut f = ElementDef::new("field")
                    .attr("name", field.name.as_str())
                    .attr("class", field.type_id.to_string());
                if field.constant_pool {
                    f = f.attr("constantPool", "true");
                }
                if field.array {
                    f = f.attr("dimension", "1");
                }
                class.children.push(f);
            }
            metadata.children.push(class);
        }
        let mut root = ElementDef::new("root");
        root.children.push(metadata);
        if let Some((gmt_offset, locale)) = &self.region {
            root.children.push(
                ElementDef::new("region")
                    .attr("gmtOffset", gmt_offset.to_string())
                    .attr("locale", locale.as_str()),
            );
        }

        let mut table = StringTable::default();
        table.collect(&root);
        let mut payload = RecordBuffer::new();
        payload.long(self.start_ticks);
        payload.long(0);
        payload.long(id);
        payload.int(table.strings.len() as i32);
        for s in table.strings.clone() {
            payload.string(Some(&s));
        }
        write_element(&mut payload, &mut table, &root);

        let offset = self.record(0, payload.as_ref());
        self.metadata_offset = offset;
        offset
    }

    /// Appends an event record; `f` writes the fields, starting with the
    /// start time.
    pub fn event(&mut self, type_id: u64, f: impl FnOnce(&mut RecordBuffer)) -> u64 {
        let mut payload = RecordBuffer::new();
        f(&mut payload);
        self.record(type_id, payload.as_ref())
    }

    /// Appends a checkpoint and points the header at it.
    pub fn checkpoint(&mut self, flush: bool, f: impl FnOnce(&mut CheckpointBuilder)) -> u64 {
        let mut builder = CheckpointBuilder::default();
        f(&mut builder);

        let offset = self.offset();
        let delta = if self.constant_pool_offset == 0 {
            0
        } else {
            self.constant_pool_offset as i64 - offset as i64
        };
        let mut payload = RecordBuffer::new();
        payload.long(self.start_ticks);
        payload.long(0);
        payload.long(delta);
        payload.byte(if flush { 1 } else { 0 });
        payload.int(builder.pools.len() as i32);
        for pool in &builder.pools {
            payload.long(pool.type_id as i64);
            payload.int(pool.entries.len() as i32);
            for (key, value) in &pool.entries {
                payload.long(*key);
                payload.raw(value.as_ref());
            }
        }
        self.record(1, payload.as_ref());
        self.constant_pool_offset = offset;
        offset
    }

    /// Points the header at the checkpoint written at `offset`.
    pub fn point_constant_pools(&mut self, offset: u64) {
        self.constant_pool_offset = offset;
    }

    pub fn duration(&mut self, nanos: i64) {
        self.duration_nanos = nanos;
    }

    /// Marks the chunk as completely written.
    pub fn finish(&mut self) {
        self.file_state = 0;
    }

    /// Marks this as the last chunk of the recording.
    pub fn final_chunk(&mut self) {
        self.flags |= 1 << 1;
    }

    /// Sets the raw file state byte.
    pub fn file_state(&mut self, state: u8) {
        self.file_state = state;
    }

    /// Encodes the header followed by every record written so far.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(HEADER_SIZE as usize + self.body.len());
        out.put_slice(b"FLR\0");
        out.put_u16(2);
        out.put_u16(1);
        out.put_u64(self.offset());
        out.put_u64(self.constant_pool_offset);
        out.put_u64(self.metadata_offset);
        out.put_i64(self.start_nanos);
        out.put_i64(self.duration_nanos);
        out.put_i64(self.start_ticks);
        out.put_i64(self.ticks_per_second);
        out.put_u8(self.file_state);
        out.put_u8(0);
        out.put_u8(0);
        out.put_u8(self.flags);
        out.put_slice(self.body.as_ref());
        out.to_vec()
    }
}

/// An in-memory file that can be grown and rewritten while a reader has
/// it open.
#[derive(Debug, Clone, Default)]
pub struct SharedFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    /// Overwrites bytes at `position`, growing the file if needed.
    pub fn write_at(&self, position: u64, bytes: &[u8]) {
        let mut data = self.lock();
        let start = position as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
    }

    /// Replaces the whole content.
    pub fn replace(&self, bytes: Vec<u8>) {
        *self.lock() = bytes;
    }
}

impl ChunkFile for SharedFile {
    fn read_at(&mut self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.lock();
        let start = (position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.lock().len() as u64)
    }
}
