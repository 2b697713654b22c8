//! Persistence of metadata records, one backend per repository tree.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::config::CacheBackendKind;
use crate::cpv::Cpv;
use crate::error::{Error, Result};
use crate::record::MetadataRecord;
use crate::repository::RepositoryTree;

/// One flat file per record: `<root>/<category>/<package>-<version>`.
///
/// Writes go to a temporary file in the target directory that is then
/// renamed over the record, so readers never see a partial record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatBackend {
    root: PathBuf,
}

impl FlatBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FlatBackend { root: root.into() }
    }

    /// Backend for `tree` under the dependency cache directory: the tree's
    /// absolute path is mirrored below `depcachedir`.
    pub fn for_tree(depcachedir: &Path, tree: &RepositoryTree) -> Self {
        let mut root = depcachedir.to_path_buf();
        root.extend(tree.path.components().filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        }));
        FlatBackend { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, cpv: &Cpv) -> PathBuf {
        self.root.join(&cpv.category).join(cpv.pf())
    }

    pub fn get(&self, cpv: &Cpv) -> Result<Option<MetadataRecord>> {
        let path = self.record_path(cpv);
        match fs::read_to_string(&path) {
            Ok(text) => MetadataRecord::parse(&text).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io(&path, err)),
        }
    }

    pub fn set(&self, cpv: &Cpv, record: &MetadataRecord) -> Result<()> {
        let path = self.record_path(cpv);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
        tmp.write_all(record.serialize().as_bytes())
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| Error::io(&path, e.error))?;
        debug!(path = %path.display(), "wrote metadata record");
        Ok(())
    }

    pub fn delete(&self, cpv: &Cpv) -> Result<()> {
        let path = self.record_path(cpv);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(&path, err)),
        }
    }
}

/// Storage for the records of one tree.
#[derive(Debug, Clone)]
pub enum Backend {
    /// In memory only.
    Volatile(HashMap<Cpv, MetadataRecord>),
    /// Flat files, written through.
    Flat(FlatBackend),
    /// Reads flat files, keeps changes in memory. A `None` entry hides a
    /// record deleted from the read-only layer.
    Overlay {
        base: FlatBackend,
        changes: HashMap<Cpv, Option<MetadataRecord>>,
    },
}

impl Backend {
    pub fn new(kind: CacheBackendKind, depcachedir: &Path, tree: &RepositoryTree) -> Self {
        match kind {
            CacheBackendKind::Volatile => Backend::Volatile(HashMap::new()),
            CacheBackendKind::Flat => Backend::Flat(FlatBackend::for_tree(depcachedir, tree)),
            CacheBackendKind::ReadOnlyOverlay => Backend::Overlay {
                base: FlatBackend::for_tree(depcachedir, tree),
                changes: HashMap::new(),
            },
        }
    }

    /// The stored record, if any.
    ///
    /// A record that exists but cannot be decoded is reported as
    /// [`Error::InvalidCacheEntry`].
    pub fn get(&self, cpv: &Cpv) -> Result<Option<MetadataRecord>> {
        match self {
            Backend::Volatile(records) => Ok(records.get(cpv).cloned()),
            Backend::Flat(flat) => flat.get(cpv),
            Backend::Overlay { base, changes } => match changes.get(cpv) {
                Some(change) => Ok(change.clone()),
                None => base.get(cpv),
            },
        }
    }

    pub fn set(&mut self, cpv: &Cpv, record: MetadataRecord) -> Result<()> {
        match self {
            Backend::Volatile(records) => {
                records.insert(cpv.clone(), record);
                Ok(())
            }
            Backend::Flat(flat) => flat.set(cpv, &record),
            Backend::Overlay { changes, .. } => {
                changes.insert(cpv.clone(), Some(record));
                Ok(())
            }
        }
    }

    pub fn delete(&mut self, cpv: &Cpv) -> Result<()> {
        match self {
            Backend::Volatile(records) => {
                records.remove(cpv);
                Ok(())
            }
            Backend::Flat(flat) => flat.delete(cpv),
            Backend::Overlay { changes, .. } => {
                changes.insert(cpv.clone(), None);
                Ok(())
            }
        }
    }

    /// Flush pending writes. Every current variant writes through or keeps
    /// its changes in memory, so there is nothing left to do.
    pub fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The backends of a [`MetadataStore`](crate::MetadataStore), keyed by tree
/// path and created on first use.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    kind: CacheBackendKind,
    depcachedir: PathBuf,
    backends: HashMap<PathBuf, Backend>,
}

impl BackendRegistry {
    pub fn new(kind: CacheBackendKind, depcachedir: impl Into<PathBuf>) -> Self {
        BackendRegistry {
            kind,
            depcachedir: depcachedir.into(),
            backends: HashMap::new(),
        }
    }

    pub fn kind(&self) -> CacheBackendKind {
        self.kind
    }

    pub fn backend_for(&mut self, tree: &RepositoryTree) -> &mut Backend {
        let (kind, depcachedir) = (self.kind, &self.depcachedir);
        self.backends
            .entry(tree.path.clone())
            .or_insert_with(|| Backend::new(kind, depcachedir, tree))
    }

    /// Number of open backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn sync_all(&mut self) -> Result<()> {
        for backend in self.backends.values_mut() {
            backend.sync()?;
        }
        Ok(())
    }

    /// Sync and drop every backend. They are reopened lazily.
    pub fn close(&mut self) -> Result<()> {
        self.sync_all()?;
        self.backends.clear();
        Ok(())
    }
}
