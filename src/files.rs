//! File store collaborator: where a sender's bytes come from and where a
//! receiver's bytes go.
//!
//! The receiving side always writes through a [`FileWriter`], which must be
//! either committed or aborted. Aborting removes whatever was written so a
//! cancelled or failed drop leaves no partial files behind.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
};

use arkdrop_entities::{BytesData, Data, ManifestEntry};
use tracing::{debug, warn};

const PART_SUFFIX: &str = "part";

pub trait FileStore: Send + Sync {
    /// Opens the sender-side source of `entry`.
    fn open(&self, entry: &ManifestEntry) -> io::Result<Box<dyn Data>>;

    /// Starts receiving `entry` into the `destination` directory.
    fn create(
        &self,
        destination: &Path,
        entry: &ManifestEntry,
    ) -> io::Result<Box<dyn FileWriter>>;
}

pub trait FileWriter: Send {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;

    /// Bytes written so far.
    fn written(&self) -> u64;

    /// Makes the file visible under its final name and returns that path.
    fn commit(self: Box<Self>) -> io::Result<PathBuf>;

    /// Discards the file.
    fn abort(self: Box<Self>);
}

/// Turns a manifest name into a relative path that cannot escape the
/// destination directory.
pub fn sanitize_name(name: &str) -> PathBuf {
    let relative: PathBuf = Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if relative.as_os_str().is_empty() {
        PathBuf::from("unnamed")
    } else {
        relative
    }
}

/// First of `path`, `stem (1).ext`, `stem (2).ext`, ... for which `taken`
/// returns false.
pub fn free_path(path: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    if !taken(path) {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = path.with_file_name(name);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Reads sources from, and writes drops to, the local filesystem.
///
/// Manifest handles are paths. Incoming files are written as `name.part`
/// and renamed on commit, picking `name (1).ext` and so on if the final name
/// is taken.
#[derive(Clone, Debug, Default)]
pub struct FsFileStore;

impl FsFileStore {
    pub fn new() -> Self {
        Self
    }
}

impl FileStore for FsFileStore {
    fn open(&self, entry: &ManifestEntry) -> io::Result<Box<dyn Data>> {
        let file = File::open(&entry.handle)?;
        let len = file.metadata()?.len();
        return Ok(Box::new(FsData {
            len,
            file: Mutex::new(file),
        }));
    }

    fn create(
        &self,
        destination: &Path,
        entry: &ManifestEntry,
    ) -> io::Result<Box<dyn FileWriter>> {
        let target = destination.join(sanitize_name(&entry.name));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut part = target.clone().into_os_string();
        part.push(".");
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part)?;
        debug!(part = %part.display(), "receiving file");
        return Ok(Box::new(FsWriter {
            target,
            part,
            file,
            written: 0,
        }));
    }
}

struct FsData {
    len: u64,
    file: Mutex<File>,
}

impl Data for FsData {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_chunk(&self, size: u64) -> io::Result<Vec<u8>> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("file handle poisoned"))?;
        let mut buf = Vec::with_capacity(size as usize);
        (&mut *file).take(size).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

struct FsWriter {
    target: PathBuf,
    part: PathBuf,
    file: File,
    written: u64,
}

impl FileWriter for FsWriter {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn commit(mut self: Box<Self>) -> io::Result<PathBuf> {
        self.file.flush()?;
        self.file.sync_all()?;
        let target = free_path(&self.target, |p| p.exists());
        fs::rename(&self.part, &target)?;
        Ok(target)
    }

    fn abort(self: Box<Self>) {
        let FsWriter { part, file, .. } = *self;
        drop(file);
        if let Err(e) = fs::remove_file(&part) {
            warn!(part = %part.display(), "failed to remove partial file: {e}");
        }
    }
}

/// In-memory store for tests and demos.
///
/// Sources are registered by handle; received files end up in a map keyed
/// by their final path. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryFileStore {
    inner: Arc<Mutex<MemoryFiles>>,
}

#[derive(Default)]
struct MemoryFiles {
    sources: HashMap<String, Vec<u8>>,
    partial: HashMap<PathBuf, Vec<u8>>,
    committed: HashMap<PathBuf, Vec<u8>>,
    fail_writes: bool,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, handle: impl Into<String>, bytes: Vec<u8>) {
        self.files().sources.insert(handle.into(), bytes);
    }

    /// Contents of a committed file.
    pub fn committed(&self, path: &Path) -> Option<Vec<u8>> {
        self.files().committed.get(path).cloned()
    }

    pub fn committed_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> =
            self.files().committed.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of files currently being written.
    pub fn partial_count(&self) -> usize {
        self.files().partial.len()
    }

    /// Makes every subsequent chunk write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.files().fail_writes = fail;
    }

    fn files(&self) -> std::sync::MutexGuard<'_, MemoryFiles> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl FileStore for MemoryFileStore {
    fn open(&self, entry: &ManifestEntry) -> io::Result<Box<dyn Data>> {
        match self.files().sources.get(&entry.handle) {
            Some(bytes) => Ok(Box::new(BytesData::new(bytes.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no source {}", entry.handle),
            )),
        }
    }

    fn create(
        &self,
        destination: &Path,
        entry: &ManifestEntry,
    ) -> io::Result<Box<dyn FileWriter>> {
        let target = destination.join(sanitize_name(&entry.name));
        self.files().partial.insert(target.clone(), Vec::new());
        Ok(Box::new(MemoryWriter {
            store: self.clone(),
            target,
            written: 0,
        }))
    }
}

struct MemoryWriter {
    store: MemoryFileStore,
    target: PathBuf,
    written: u64,
}

impl FileWriter for MemoryWriter {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let mut files = self.store.files();
        if files.fail_writes {
            return Err(io::Error::other("simulated write failure"));
        }
        files
            .partial
            .entry(self.target.clone())
            .or_default()
            .extend_from_slice(data);
        self.written += data.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn commit(self: Box<Self>) -> io::Result<PathBuf> {
        let mut files = self.store.files();
        let bytes = files.partial.remove(&self.target).unwrap_or_default();
        let target =
            free_path(&self.target, |p| files.committed.contains_key(p));
        files.committed.insert(target.clone(), bytes);
        Ok(target)
    }

    fn abort(self: Box<Self>) {
        self.store.files().partial.remove(&self.target);
    }
}
