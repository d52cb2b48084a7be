use crate::{AuditError, Result};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Append-only storage handle for one log file.
pub trait LogSink: Send {
    fn name(&self) -> &str;

    /// Append `line` followed by CRLF.
    fn append_line(&mut self, line: &str) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Everything appended so far, as stored.
    fn read_back(&mut self) -> Result<Vec<u8>>;
}

/// Storage medium that hands out sinks by name.
pub trait LogStore {
    fn exists(&self, name: &str) -> bool;

    /// Create a new file. Must not truncate an existing one.
    fn open(&mut self, name: &str) -> Result<Box<dyn LogSink>>;
}

/// First unused name in the `prefix_NNNN.csv` sequence, starting at 0001.
pub fn next_log_name(store: &dyn LogStore, prefix: &str) -> Result<String> {
    (1..=9999u32)
        .map(|i| format!("{prefix}_{i:04}.csv"))
        .find(|name| !store.exists(name))
        .ok_or_else(|| AuditError::NamesExhausted(prefix.to_string()))
}

/// Log files in a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl LogStore for FileStore {
    fn exists(&self, name: &str) -> bool {
        self.path_of(name).exists()
    }

    fn open(&mut self, name: &str) -> Result<Box<dyn LogSink>> {
        let path = self.path_of(name);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| AuditError::Open {
                name: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(FileSink {
            name: name.to_string(),
            path,
            writer: BufWriter::new(file),
        }))
    }
}

pub struct FileSink {
    name: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn append_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn read_back(&mut self) -> Result<Vec<u8>> {
        self.writer.flush()?;
        Ok(fs::read(&self.path)?)
    }
}

type Files = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// In-memory store for tests and dry runs. Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: Files,
    full: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a file already exists (e.g. from an earlier run).
    pub fn insert(&self, name: &str, contents: &[u8]) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(name.to_string(), contents.to_vec());
        }
    }

    pub fn contents(&self, name: &str) -> Option<String> {
        let files = self.files.lock().ok()?;
        files.get(name).map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Make every subsequent append fail, as a full medium would.
    pub fn set_full(&self, full: bool) {
        if let Ok(mut flag) = self.full.lock() {
            *flag = full;
        }
    }
}

impl LogStore for MemoryStore {
    fn exists(&self, name: &str) -> bool {
        self.files
            .lock()
            .map(|files| files.contains_key(name))
            .unwrap_or(false)
    }

    fn open(&mut self, name: &str) -> Result<Box<dyn LogSink>> {
        let mut files = self.files.lock().map_err(|_| poisoned())?;
        if files.contains_key(name) {
            return Err(AuditError::Open {
                name: name.to_string(),
                reason: "already exists".to_string(),
            });
        }
        files.insert(name.to_string(), Vec::new());
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            full: Arc::clone(&self.full),
            buffered: Vec::new(),
        }))
    }
}

/// Buffers appends until `flush`, like a file behind a `BufWriter`.
pub struct MemorySink {
    name: String,
    files: Files,
    full: Arc<Mutex<bool>>,
    buffered: Vec<u8>,
}

impl LogSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn append_line(&mut self, line: &str) -> Result<()> {
        if *self.full.lock().map_err(|_| poisoned())? {
            return Err(AuditError::Io(io::Error::other("memory store full")));
        }
        self.buffered.extend_from_slice(line.as_bytes());
        self.buffered.extend_from_slice(b"\r\n");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut files = self.files.lock().map_err(|_| poisoned())?;
        files
            .entry(self.name.clone())
            .or_default()
            .append(&mut self.buffered);
        Ok(())
    }

    fn read_back(&mut self) -> Result<Vec<u8>> {
        self.flush()?;
        let files = self.files.lock().map_err(|_| poisoned())?;
        Ok(files.get(&self.name).cloned().unwrap_or_default())
    }
}

fn poisoned() -> AuditError {
    AuditError::Io(io::Error::other("memory store lock poisoned"))
}
