use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use encore_flightparser::header::{HEADER_SIZE, MAGIC, START_NANOS_POSITION};

use crate::error::Result;

const CHUNK_EXTENSION: &str = "jfr";

/// The chunk files of a recording repository, ordered by chunk start time.
pub trait RepositoryFiles: Send {
    /// The chunk to start reading from: the newest one starting at or before
    /// `start_nanos`, or the oldest one if all start later.
    fn first_path(&mut self, start_nanos: i64) -> Result<Option<PathBuf>>;

    /// The oldest chunk starting at or after `after_nanos`.
    fn next_path(&mut self, after_nanos: i64) -> Result<Option<PathBuf>>;

    /// The newest chunk.
    fn last_path(&mut self) -> Result<Option<PathBuf>>;

    /// Start time of a known chunk, in epoch nanoseconds.
    fn timestamp(&self, path: &Path) -> Option<i64>;

    /// Whether the repository is a fixed directory rather than one that a
    /// recorder may replace. A stream over a fixed path ends at the final chunk.
    fn has_fixed_path(&self) -> bool;
}

/// Chunk files (`*.jfr`) in a single directory.
///
/// The directory is rescanned on every lookup, and the start time of each
/// new file is read from its header.
pub struct DirectoryRepository {
    dir: PathBuf,
    chunks: BTreeMap<i64, PathBuf>,
    timestamps: HashMap<PathBuf, i64>,
}

impl DirectoryRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", dir.display()),
            )
            .into());
        }
        Ok(Self {
            dir,
            chunks: BTreeMap::new(),
            timestamps: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn scan(&mut self) -> Result<()> {
        let mut present = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXTENSION) {
                continue;
            }
            if !self.timestamps.contains_key(&path) {
                match read_start_nanos(&path)? {
                    Some(start) => {
                        log::trace!("found chunk {} starting at {}", path.display(), start);
                        self.timestamps.insert(path.clone(), start);
                    }
                    // Not written far enough yet, or not a chunk.
                    None => continue,
                }
            }
            present.push(path);
        }

        // Files removed since the last scan are forgotten.
        self.timestamps.retain(|path, _| present.contains(path));
        self.chunks.clear();
        for path in present {
            let start = self.timestamps[&path];
            self.chunks.entry(start).or_insert(path);
        }
        Ok(())
    }
}

impl RepositoryFiles for DirectoryRepository {
    fn first_path(&mut self, start_nanos: i64) -> Result<Option<PathBuf>> {
        self.scan()?;
        let path = self
            .chunks
            .range(..=start_nanos)
            .next_back()
            .or_else(|| self.chunks.iter().next())
            .map(|(_, p)| p.clone());
        Ok(path)
    }

    fn next_path(&mut self, after_nanos: i64) -> Result<Option<PathBuf>> {
        self.scan()?;
        let path = self
            .chunks
            .range((Bound::Included(after_nanos), Bound::Unbounded))
            .next()
            .map(|(_, p)| p.clone());
        Ok(path)
    }

    fn last_path(&mut self) -> Result<Option<PathBuf>> {
        self.scan()?;
        Ok(self.chunks.values().next_back().cloned())
    }

    fn timestamp(&self, path: &Path) -> Option<i64> {
        self.timestamps.get(path).copied()
    }

    fn has_fixed_path(&self) -> bool {
        true
    }
}

/// Reads the start time from a chunk file header. Returns `None` if the
/// file is shorter than a header or does not start with the chunk magic.
fn read_start_nanos(path: &Path) -> Result<Option<i64>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        // Removed between listing and opening.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut buf = [0u8; HEADER_SIZE as usize];
    match file.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if buf[..MAGIC.len()] != MAGIC {
        log::debug!("skipping {}: not a chunk file", path.display());
        return Ok(None);
    }
    let at = START_NANOS_POSITION as usize;
    Ok(Some(BigEndian::read_i64(&buf[at..at + 8])))
}
