use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Durable record of completed work, one store per pipeline stage.
///
/// Each completion is one line in `{root}/{stage}.index`, formatted as
/// `{remote_key}\t{local_path}`. Entries are append-only; a re-run after a
/// crash performs strictly the remaining work. Within one run, the
/// check-then-act span is made atomic per key by `try_claim`, so two
/// concurrent tasks can never both decide to download the same key.
pub struct CacheStore {
    index_path: PathBuf,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    completed: HashMap<String, PathBuf>,
    in_flight: HashSet<String>,
    writer: File,
}

impl CacheStore {
    /// Open (or create) the index for one stage under the cache root.
    pub fn open(cache_root: &Path, stage: &str) -> Result<Self> {
        fs::create_dir_all(cache_root).map_err(|e| Error::io(cache_root, e))?;
        let index_path = cache_root.join(format!("{stage}.index"));

        let mut completed = HashMap::new();
        if index_path.exists() {
            let file = File::open(&index_path).map_err(|e| Error::io(&index_path, e))?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| Error::io(&index_path, e))?;
                match line.split_once('\t') {
                    Some((key, path)) if !key.is_empty() => {
                        completed.insert(key.to_string(), PathBuf::from(path));
                    }
                    _ => warn!(stage, line = %line, "Skipping malformed cache index line"),
                }
            }
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)
            .map_err(|e| Error::io(&index_path, e))?;

        debug!(stage, entries = completed.len(), "Opened cache index");

        Ok(Self {
            index_path,
            inner: Mutex::new(CacheInner {
                completed,
                in_flight: HashSet::new(),
                writer,
            }),
        })
    }

    /// Whether the key was already completed (this run or a previous one).
    pub fn has(&self, key: &str) -> bool {
        self.inner.lock().unwrap().completed.contains_key(key)
    }

    /// Local path recorded for a completed key.
    pub fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.inner.lock().unwrap().completed.get(key).cloned()
    }

    /// Atomically check-and-reserve a key.
    ///
    /// Returns true if the caller should perform the work; false if the key is
    /// already complete or another in-run task owns it.
    pub fn try_claim(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.completed.contains_key(key) {
            return false;
        }
        inner.in_flight.insert(key.to_string())
    }

    /// Give up a claim after a failure so a later run retries the key.
    pub fn release(&self, key: &str) {
        self.inner.lock().unwrap().in_flight.remove(key);
    }

    /// Record a completion. Call only after a fully successful write.
    pub fn mark_complete(&self, key: &str, local_path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(key);
        if inner.completed.contains_key(key) {
            return Ok(());
        }
        writeln!(inner.writer, "{}\t{}", key, local_path.display())
            .and_then(|_| inner.writer.flush())
            .map_err(|e| Error::io(&self.index_path, e))?;
        inner
            .completed
            .insert(key.to_string(), local_path.to_path_buf());
        Ok(())
    }

    /// Number of completed entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries and truncate the index file.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.completed.clear();
        inner.in_flight.clear();
        inner.writer = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.index_path)
            .map_err(|e| Error::io(&self.index_path, e))?;
        Ok(())
    }
}

/// Cache usage summary for `cache-info`.
#[derive(Debug, Default)]
pub struct CacheUsage {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Walk the cache root and total up file count and bytes.
pub fn cache_usage(cache_root: &Path) -> CacheUsage {
    let mut usage = CacheUsage::default();
    for entry in walkdir::WalkDir::new(cache_root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            usage.file_count += 1;
            usage.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    usage
}

/// Remove the entire cache root. The next run starts from scratch.
pub fn clear_cache_root(cache_root: &Path) -> Result<()> {
    warn!(root = %cache_root.display(), "Clearing all cached state");
    if cache_root.exists() {
        fs::remove_dir_all(cache_root).map_err(|e| Error::io(cache_root, e))?;
    }
    fs::create_dir_all(cache_root).map_err(|e| Error::io(cache_root, e))?;
    Ok(())
}
