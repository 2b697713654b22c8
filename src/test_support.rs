//! Fixtures shared by the unit tests.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tempfile::TempDir;

use crate::config::{CacheBackendKind, Settings};
use crate::cpv::Cpv;
use crate::extract::{ExtractContext, ExtractOutcome};
use crate::record::parse_key_values;
use crate::repository::{RepositorySet, REPO_NAME_LOCATION};
use crate::store::MetadataStore;

/// A throwaway repository tree on disk.
pub(crate) struct TreeBuilder {
    dir: TempDir,
}

impl TreeBuilder {
    pub(crate) fn new(name: &str) -> Self {
        let tree = Self::unnamed();
        tree.write(REPO_NAME_LOCATION, &format!("{name}\n"));
        tree
    }

    pub(crate) fn unnamed() -> Self {
        TreeBuilder {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `content` to `rel`, creating parent directories.
    pub(crate) fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    pub(crate) fn file(self, rel: &str, content: &str) -> Self {
        self.write(rel, content);
        self
    }

    /// Add `cat/pkg/pkg-ver.ebuild`. The body is read back by
    /// [`counting_extractor`] as `KEY=VALUE` lines.
    pub(crate) fn ebuild(self, cpv: &str, body: &str) -> Self {
        let rel = Self::ebuild_rel(cpv);
        self.file(&rel, body)
    }

    pub(crate) fn eclass(self, name: &str, content: &str) -> Self {
        self.file(&format!("eclass/{name}.eclass"), content)
    }

    pub(crate) fn ebuild_path(&self, cpv: &str) -> PathBuf {
        self.dir.path().join(Self::ebuild_rel(cpv))
    }

    fn ebuild_rel(cpv: &str) -> String {
        let cpv = Cpv::parse(cpv).unwrap();
        format!("{}/{}/{}.ebuild", cpv.category, cpv.package, cpv.pf())
    }
}

/// Extractor that parses the ebuild itself as `KEY=VALUE` lines and counts
/// its invocations. A line reading `FAIL` makes extraction fail.
pub(crate) fn counting_extractor(
    calls: Rc<Cell<usize>>,
) -> impl FnMut(&Path, &ExtractContext<'_>) -> ExtractOutcome {
    move |ebuild, _ctx| {
        calls.set(calls.get() + 1);
        let body = fs::read_to_string(ebuild).unwrap_or_default();
        if body.lines().any(|line| line.trim() == "FAIL") {
            return ExtractOutcome::Failure;
        }
        ExtractOutcome::Success(parse_key_values(&body))
    }
}

/// A store over `repos` with an in-memory backend and the counting extractor.
pub(crate) fn volatile_store(repos: RepositorySet, calls: Rc<Cell<usize>>) -> MetadataStore {
    let settings = Settings {
        cache_backend: CacheBackendKind::Volatile,
        ..Settings::default()
    };
    MetadataStore::new(repos, &settings, Box::new(counting_extractor(calls)))
}
