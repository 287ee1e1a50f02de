use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

use crate::types::{ParseError, Result};

/// Size of each of the two cached blocks.
pub const DEFAULT_BLOCK_SIZE: usize = 64_000;

/// Maximum encoded length of a variable-length long.
const MAX_VARINT_LEN: usize = 9;

// String encoding tags (wire format byte values).
const STRING_NULL: u8 = 0;
const STRING_EMPTY: u8 = 1;
const STRING_CONSTANT_POOL: u8 = 2;
const STRING_UTF8: u8 = 3;
const STRING_CHAR_ARRAY: u8 = 4;
const STRING_LATIN1: u8 = 5;

/// Random access to the bytes of a chunk file that may still be growing.
pub trait ChunkFile {
    /// Reads up to `buf.len()` bytes starting at `position`.
    /// Returns the number of bytes read, which is only short at end of file.
    fn read_at(&mut self, position: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// The current length of the file.
    fn size(&mut self) -> io::Result<u64>;
}

impl ChunkFile for File {
    fn read_at(&mut self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(position))?;
        let mut read = 0;
        while read < buf.len() {
            match self.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// A string as it appears on the wire, before any constant pool lookup.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EncodedString {
    Null,
    Value(String),
    PoolKey(i64),
}

/// A cached region of the file.
#[derive(Debug, Default)]
struct Block {
    position: u64,
    bytes: Vec<u8>,
}

impl Block {
    fn contains(&self, position: u64) -> bool {
        position >= self.position && position < self.end()
    }

    fn end(&self) -> u64 {
        self.position + self.bytes.len() as u64
    }
}

/// Block-cached reader over a growing chunk file.
///
/// The logical path (`seek`, `read_*`) serves bulk decoding out of two
/// alternating blocks. The physical path (`position_physical`,
/// `read_physical_*`) always goes to the file and is used to poll the chunk
/// header, which the writer rewrites in place after blocks may have been
/// cached.
pub struct ByteSource<F: ChunkFile = File> {
    file: F,
    block_size: usize,
    current: Block,
    previous: Block,
    position: u64,
    physical: u64,
    valid_size: u64,
}

impl ByteSource<File> {
    /// Opens the file at `path`. Nothing is readable through the logical
    /// path until a chunk header has established the valid size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(file)
    }
}

impl<F: ChunkFile> ByteSource<F> {
    pub fn new(file: F) -> Result<Self> {
        Self::with_block_size(file, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(file: F, block_size: usize) -> Result<Self> {
        Ok(Self {
            file,
            block_size: block_size.max(MAX_VARINT_LEN),
            current: Block::default(),
            previous: Block::default(),
            position: 0,
            physical: 0,
            valid_size: 0,
        })
    }

    /// Switches to reading another file, dropping all cached blocks.
    pub fn set_file(&mut self, file: F) {
        self.valid_size = 0;
        self.file = file;
        self.current = Block::default();
        self.previous = Block::default();
        self.position = 0;
        self.physical = 0;
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// The furthest byte known to be committed by the writer.
    pub fn valid_size(&self) -> u64 {
        self.valid_size
    }

    /// Extends the valid region. The valid size never shrinks.
    pub fn set_valid_size(&mut self, size: u64) {
        if size > self.valid_size {
            self.valid_size = size;
        }
    }

    /// The current length of the underlying file.
    pub fn file_size(&mut self) -> Result<u64> {
        Ok(self.file.size()?)
    }

    /// Moves the logical position. Blocks are loaded lazily on the next read.
    pub fn seek(&mut self, position: u64) -> Result<()> {
        if position > self.valid_size {
            return Err(ParseError::Truncated {
                position,
                size: self.valid_size,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.seek(self.position + n)
    }

    // --- Logical path ---

    /// Makes sure the current block holds the current position.
    fn ensure_block(&mut self) -> Result<()> {
        if self.current.contains(self.position) {
            return Ok(());
        }
        if !self.previous.contains(self.position) {
            if self.position >= self.valid_size {
                return Err(ParseError::Truncated {
                    position: self.position,
                    size: self.valid_size,
                });
            }
            let start = self.block_start(self.position).min(self.position);
            self.load_previous(start)?;
        }
        std::mem::swap(&mut self.current, &mut self.previous);
        Ok(())
    }

    /// Aligns the next block to the current one when moving one block
    /// forward or backward, otherwise centres it around `position`.
    fn block_start(&self, position: u64) -> u64 {
        let size = self.block_size as u64;
        let current = &self.current;
        if !current.bytes.is_empty() {
            if position >= size && current.contains(position - size) {
                return current.end();
            }
            if current.contains(position + size) {
                return current.position.saturating_sub(size);
            }
        }
        position.saturating_sub(size / 2)
    }

    fn load_previous(&mut self, start: u64) -> Result<()> {
        let len = (self.valid_size - start).min(self.block_size as u64) as usize;
        let block = &mut self.previous;
        block.position = start;
        block.bytes.resize(len, 0);
        let read = self.file.read_at(start, &mut block.bytes)?;
        if read < len {
            block.bytes.truncate(read);
            if !block.contains(self.position) {
                return Err(ParseError::Truncated {
                    position: self.position,
                    size: start + read as u64,
                });
            }
        }
        log::trace!("loaded block [{}, {})", start, block.end());
        Ok(())
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        self.ensure_block()?;
        let b = self.current.bytes[(self.position - self.current.position) as usize];
        self.position += 1;
        Ok(b)
    }

    /// Read a boolean (single byte, 0 = false).
    pub fn read_boolean(&mut self) -> Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    /// Read `n` bytes into a new Vec.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n.min(self.block_size));
        while out.len() < n {
            self.ensure_block()?;
            let offset = (self.position - self.current.position) as usize;
            let available = &self.current.bytes[offset..];
            let take = available.len().min(n - out.len());
            out.extend_from_slice(&available[..take]);
            self.position += take as u64;
        }
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        for b in out.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(out)
    }

    /// Read a big-endian i16.
    pub fn read_raw_short(&mut self) -> Result<i16> {
        Ok(BigEndian::read_i16(&self.read_array::<2>()?))
    }

    /// Read a big-endian i32.
    pub fn read_raw_int(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(&self.read_array::<4>()?))
    }

    /// Read a big-endian i64.
    pub fn read_raw_long(&mut self) -> Result<i64> {
        Ok(BigEndian::read_i64(&self.read_array::<8>()?))
    }

    /// Read a big-endian f32.
    pub fn read_float(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_raw_int()? as u32))
    }

    /// Read a big-endian f64.
    pub fn read_double(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_raw_long()? as u64))
    }

    /// Read a variable-length long.
    ///
    /// Seven bits per byte, least significant group first; a ninth byte,
    /// if reached, carries a full eight bits.
    pub fn read_long(&mut self) -> Result<i64> {
        if self.current.contains(self.position) {
            let offset = (self.position - self.current.position) as usize;
            let bytes = &self.current.bytes[offset..];
            if bytes.len() >= MAX_VARINT_LEN {
                let (value, len) = decode_varint(bytes);
                self.position += len as u64;
                return Ok(value);
            }
        }
        self.read_long_slow()
    }

    fn read_long_slow(&mut self) -> Result<i64> {
        let mut result: u64 = 0;
        for i in 0..MAX_VARINT_LEN - 1 {
            let b = self.read_byte()?;
            result |= ((b & 0x7F) as u64) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(result as i64);
            }
        }
        let b = self.read_byte()?;
        result |= (b as u64) << 56;
        Ok(result as i64)
    }

    /// Read a variable-length int.
    pub fn read_int(&mut self) -> Result<i32> {
        Ok(self.read_long()? as i32)
    }

    /// Read a variable-length short.
    pub fn read_short(&mut self) -> Result<i16> {
        Ok(self.read_long()? as i16)
    }

    /// Read a variable-length UTF-16 code unit.
    pub fn read_char(&mut self) -> Result<char> {
        let unit = self.read_long()? as u16;
        Ok(char::from_u32(unit as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
    }

    /// Read a tagged string, leaving constant pool keys unresolved.
    pub(crate) fn read_encoded_string(&mut self) -> Result<EncodedString> {
        let tag = self.read_byte()?;
        match tag {
            STRING_NULL => Ok(EncodedString::Null),
            STRING_EMPTY => Ok(EncodedString::Value(String::new())),
            STRING_CONSTANT_POOL => Ok(EncodedString::PoolKey(self.read_long()?)),
            STRING_UTF8 => {
                let len = self.read_length()?;
                let bytes = self.read_bytes(len)?;
                Ok(EncodedString::Value(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))
            }
            STRING_CHAR_ARRAY => {
                let len = self.read_length()?;
                let mut units = Vec::with_capacity(len.min(self.block_size));
                for _ in 0..len {
                    units.push(self.read_long()? as u16);
                }
                Ok(EncodedString::Value(String::from_utf16_lossy(&units)))
            }
            STRING_LATIN1 => {
                let len = self.read_length()?;
                let bytes = self.read_bytes(len)?;
                Ok(EncodedString::Value(
                    bytes.into_iter().map(char::from).collect(),
                ))
            }
            other => Err(ParseError::InvalidStringEncoding(other)),
        }
    }

    /// Skip a tagged string.
    pub(crate) fn skip_encoded_string(&mut self) -> Result<()> {
        let tag = self.read_byte()?;
        match tag {
            STRING_NULL | STRING_EMPTY => Ok(()),
            STRING_CONSTANT_POOL => self.read_long().map(drop),
            STRING_UTF8 | STRING_LATIN1 => {
                let len = self.read_length()?;
                self.skip(len as u64)
            }
            STRING_CHAR_ARRAY => {
                let len = self.read_length()?;
                for _ in 0..len {
                    self.read_long()?;
                }
                Ok(())
            }
            other => Err(ParseError::InvalidStringEncoding(other)),
        }
    }

    /// Read a non-negative int used as an element or byte count.
    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let position = self.position;
        let len = self.read_int()?;
        usize::try_from(len).map_err(|_| ParseError::InvalidLength {
            position,
            length: len as i64,
        })
    }

    // --- Physical path ---

    /// Positions the physical (uncached) read path.
    pub fn position_physical(&mut self, position: u64) {
        self.physical = position;
    }

    fn read_physical(&mut self, buf: &mut [u8]) -> Result<()> {
        let read = self.file.read_at(self.physical, buf)?;
        if read < buf.len() {
            return Err(ParseError::Truncated {
                position: self.physical + read as u64,
                size: self.physical + read as u64,
            });
        }
        self.physical += read as u64;
        Ok(())
    }

    pub fn read_physical_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_physical(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_physical_short(&mut self) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read_physical(&mut buf)?;
        Ok(BigEndian::read_i16(&buf))
    }

    pub fn read_physical_long(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_physical(&mut buf)?;
        Ok(BigEndian::read_i64(&buf))
    }

    pub(crate) fn read_physical_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_physical(buf)
    }
}

/// Decodes a variable-length long from a slice holding at least nine bytes.
/// Returns the value and the number of bytes consumed.
fn decode_varint(bytes: &[u8]) -> (i64, usize) {
    let mut result: u64 = 0;
    for (i, &b) in bytes.iter().take(MAX_VARINT_LEN - 1).enumerate() {
        result |= ((b & 0x7F) as u64) << (7 * i);
        if b & 0x80 == 0 {
            return (result as i64, i + 1);
        }
    }
    result |= (bytes[MAX_VARINT_LEN - 1] as u64) << 56;
    (result as i64, MAX_VARINT_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordBuffer, SharedFile};
    use assert_matches::assert_matches;

    fn source(data: Vec<u8>, block_size: usize) -> ByteSource<SharedFile> {
        let len = data.len() as u64;
        let mut source = ByteSource::with_block_size(SharedFile::new(data), block_size).unwrap();
        source.set_valid_size(len);
        source
    }

    #[test]
    fn test_read_long() {
        // 0 => [0x00]
        let mut r = source(vec![0x00], 64);
        assert_eq!(r.read_long().unwrap(), 0);

        // 127 => [0x7F]
        let mut r = source(vec![0x7F], 64);
        assert_eq!(r.read_long().unwrap(), 127);

        // 128 => [0x80, 0x01]
        let mut r = source(vec![0x80, 0x01], 64);
        assert_eq!(r.read_long().unwrap(), 128);

        // 300 => [0xAC, 0x02]
        let mut r = source(vec![0xAC, 0x02], 64);
        assert_eq!(r.read_long().unwrap(), 300);
    }

    #[test]
    fn test_read_long_nine_bytes() {
        for value in [-1i64, i64::MIN, i64::MAX, 1 << 56, (1 << 56) - 1] {
            let mut buf = RecordBuffer::new();
            buf.long(value);
            let mut r = source(buf.into_bytes(), 64);
            assert_eq!(r.read_long().unwrap(), value, "value {value}");
        }
    }

    #[test]
    fn test_fast_and_slow_path_agree() {
        let mut buf = RecordBuffer::new();
        let values: Vec<i64> = (0..200).map(|i| (i * 7919) << (i % 50)).collect();
        for v in &values {
            buf.long(*v);
        }
        // A tiny block size forces many varints across block boundaries.
        let mut r = source(buf.into_bytes(), 10);
        for v in &values {
            assert_eq!(r.read_long().unwrap(), *v);
        }
    }

    #[test]
    fn test_padded_varint() {
        // 5 written as a four byte padded int.
        let mut r = source(vec![0x85, 0x80, 0x80, 0x00], 64);
        assert_eq!(r.read_int().unwrap(), 5);
        assert_eq!(r.position(), 4);
    }

    #[test]
    fn test_raw_reads_are_big_endian() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0102u16.to_be_bytes());
        data.extend_from_slice(&42i64.to_be_bytes());
        data.extend_from_slice(&1.5f32.to_be_bytes());
        data.extend_from_slice(&2.25f64.to_be_bytes());
        let mut r = source(data, 64);
        assert_eq!(r.read_raw_short().unwrap(), 0x0102);
        assert_eq!(r.read_raw_long().unwrap(), 42);
        assert_eq!(r.read_float().unwrap(), 1.5);
        assert_eq!(r.read_double().unwrap(), 2.25);
    }

    #[test]
    fn test_truncated_read() {
        let mut r = source(vec![0x01], 64);
        assert_eq!(r.read_byte().unwrap(), 1);
        assert_matches!(
            r.read_byte(),
            Err(ParseError::Truncated { position: 1, size: 1 })
        );
        assert_matches!(r.seek(5), Err(ParseError::Truncated { .. }));
    }

    #[test]
    fn test_seek_backward_and_forward_across_blocks() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut r = source(data, 16);
        r.seek(200).unwrap();
        assert_eq!(r.read_byte().unwrap(), 200);
        r.seek(184).unwrap();
        assert_eq!(r.read_byte().unwrap(), 184);
        r.seek(3).unwrap();
        assert_eq!(r.read_byte().unwrap(), 3);
        r.seek(250).unwrap();
        assert_eq!(r.read_bytes(6).unwrap(), vec![250, 251, 252, 253, 254, 255]);
    }

    #[test]
    fn test_read_bytes_spanning_blocks() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut r = source(data.clone(), 16);
        r.seek(10).unwrap();
        assert_eq!(r.read_bytes(50).unwrap(), data[10..60].to_vec());
    }

    #[test]
    fn test_valid_size_limits_reads_until_extended() {
        let file = SharedFile::new(vec![1, 2, 3, 4]);
        let mut r = ByteSource::with_block_size(file.clone(), 64).unwrap();
        r.set_valid_size(4);
        file.append(&[5, 6]);
        r.seek(4).unwrap();
        assert_matches!(r.read_byte(), Err(ParseError::Truncated { .. }));

        r.set_valid_size(6);
        assert_eq!(r.read_byte().unwrap(), 5);

        // Never shrinks.
        r.set_valid_size(2);
        assert_eq!(r.valid_size(), 6);
    }

    #[test]
    fn test_physical_reads_bypass_cache() {
        let file = SharedFile::new(vec![7; 32]);
        let mut r = ByteSource::with_block_size(file.clone(), 64).unwrap();
        r.set_valid_size(32);
        assert_eq!(r.read_byte().unwrap(), 7);

        file.write_at(0, &[9]);
        r.seek(0).unwrap();
        // The cached block still holds the old byte.
        assert_eq!(r.read_byte().unwrap(), 7);
        r.position_physical(0);
        assert_eq!(r.read_physical_byte().unwrap(), 9);
    }

    #[test]
    fn test_encoded_strings() {
        let mut buf = RecordBuffer::new();
        buf.string(None);
        buf.string(Some(""));
        buf.string_pool_ref(17);
        buf.string(Some("héllo"));
        buf.string_chars("chars");
        buf.string_latin1("caf\u{e9}");
        buf.byte(9);
        let mut r = source(buf.into_bytes(), 64);
        assert_eq!(r.read_encoded_string().unwrap(), EncodedString::Null);
        assert_eq!(
            r.read_encoded_string().unwrap(),
            EncodedString::Value(String::new())
        );
        assert_eq!(r.read_encoded_string().unwrap(), EncodedString::PoolKey(17));
        assert_eq!(
            r.read_encoded_string().unwrap(),
            EncodedString::Value("héllo".to_string())
        );
        assert_eq!(
            r.read_encoded_string().unwrap(),
            EncodedString::Value("chars".to_string())
        );
        assert_eq!(
            r.read_encoded_string().unwrap(),
            EncodedString::Value("café".to_string())
        );
        assert_matches!(
            r.read_encoded_string(),
            Err(ParseError::InvalidStringEncoding(9))
        );
    }

    #[test]
    fn test_skip_encoded_strings() {
        let mut buf = RecordBuffer::new();
        buf.string(Some("skipped"));
        buf.string_chars("also skipped");
        buf.string_pool_ref(300);
        buf.int(42);
        let mut r = source(buf.into_bytes(), 64);
        r.skip_encoded_string().unwrap();
        r.skip_encoded_string().unwrap();
        r.skip_encoded_string().unwrap();
        assert_eq!(r.read_int().unwrap(), 42);
    }
}
