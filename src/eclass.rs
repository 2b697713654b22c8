use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::manifest::sha256_file;
use crate::repository::RepositorySet;

/// Identity and content signature of one eclass.
///
/// Stored alongside every cached record that inherited the eclass; the
/// record stays valid only while every stored fingerprint still matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EclassFingerprint {
    pub name: String,
    /// Hex SHA-256 of the eclass file.
    pub digest: String,
}

/// Live view of the eclasses available across a repository set.
///
/// Lookups follow repository priority, so an overlay's eclass shadows the
/// primary tree's eclass of the same name. Digests are memoized per file
/// and recomputed whenever the file's size or mtime changes.
#[derive(Debug, Clone, Default)]
pub struct EclassRegistry {
    /// `eclass/` directories, highest priority first.
    dirs: Vec<PathBuf>,
    memo: HashMap<PathBuf, (SystemTime, u64, String)>,
}

impl EclassRegistry {
    pub fn new(repos: &RepositorySet) -> Self {
        EclassRegistry {
            dirs: repos.by_priority().map(|t| t.path.join("eclass")).collect(),
            memo: HashMap::new(),
        }
    }

    /// Path of the eclass `name` that currently wins.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(format!("{name}.eclass")))
            .find(|path| path.is_file())
    }

    /// Every eclass name available in any tree.
    pub fn names(&self) -> BTreeSet<String> {
        self.dirs
            .iter()
            .filter_map(|dir| fs::read_dir(dir).ok())
            .flat_map(|entries| entries.flatten())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".eclass"))
                    .map(str::to_string)
            })
            .collect()
    }

    /// Current fingerprint of `name`, or `None` if no tree provides it.
    pub fn fingerprint(&mut self, name: &str) -> Option<EclassFingerprint> {
        let path = self.locate(name)?;
        match self.digest(&path) {
            Ok(digest) => Some(EclassFingerprint {
                name: name.to_string(),
                digest,
            }),
            Err(err) => {
                warn!(eclass = name, %err, "cannot fingerprint eclass");
                None
            }
        }
    }

    /// Fingerprints for the inherited eclasses `names`.
    ///
    /// Names that no tree provides are left out with a warning.
    pub fn fingerprints_for<S: AsRef<str>>(
        &mut self,
        names: &[S],
    ) -> BTreeMap<String, EclassFingerprint> {
        let mut out = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            match self.fingerprint(name) {
                Some(fp) => {
                    out.insert(name.to_string(), fp);
                }
                None => warn!(eclass = name, "inherited eclass not found"),
            }
        }
        out
    }

    /// Whether every stored fingerprint still matches the live eclass.
    ///
    /// An eclass that no longer resolves makes the set invalid.
    pub fn is_valid(&mut self, stored: &[EclassFingerprint]) -> bool {
        stored.iter().all(|fp| match self.fingerprint(&fp.name) {
            Some(live) => live == *fp,
            None => {
                debug!(eclass = %fp.name, "stored eclass no longer available");
                false
            }
        })
    }

    fn digest(&mut self, path: &Path) -> Result<String> {
        let meta = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        let mtime = meta.modified().map_err(|e| Error::io(path, e))?;
        let len = meta.len();
        if let Some((m, l, digest)) = self.memo.get(path) {
            if *m == mtime && *l == len {
                return Ok(digest.clone());
            }
        }
        let digest = sha256_file(path).map_err(|e| Error::io(path, e))?;
        self.memo
            .insert(path.to_path_buf(), (mtime, len, digest.clone()));
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::test_support::TreeBuilder;

    #[test]
    fn overlay_eclass_wins() {
        let main = TreeBuilder::new("gentoo").eclass("base", "main").eclass("only-main", "x");
        let overlay = TreeBuilder::new("local").eclass("base", "overlay");
        let repos = RepositorySet::new(main.path(), [overlay.path()]);
        let mut registry = EclassRegistry::new(&repos);

        let located = registry.locate("base").unwrap();
        assert!(located.starts_with(&repos.trees()[1].path));
        assert!(registry.locate("only-main").is_some());
        assert!(registry.locate("missing").is_none());

        let fp = registry.fingerprint("base").unwrap();
        assert_eq!(fp.digest, hex::encode(Sha256::digest(b"overlay")));
        assert_eq!(
            registry.names().into_iter().collect::<Vec<_>>(),
            vec!["base", "only-main"]
        );
    }

    #[test]
    fn fingerprints_skip_unknown() {
        let main = TreeBuilder::new("gentoo").eclass("a", "1").eclass("b", "2");
        let repos = RepositorySet::new(main.path(), Vec::<PathBuf>::new());
        let mut registry = EclassRegistry::new(&repos);
        let fps = registry.fingerprints_for(&["b", "a", "zzz"]);
        assert_eq!(fps.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn validity_follows_content() {
        let main = TreeBuilder::new("gentoo").eclass("a", "one");
        let repos = RepositorySet::new(main.path(), Vec::<PathBuf>::new());
        let mut registry = EclassRegistry::new(&repos);
        let stored: Vec<EclassFingerprint> =
            registry.fingerprints_for(&["a"]).into_values().collect();
        assert!(registry.is_valid(&stored));

        main.write("eclass/a.eclass", "two, and longer");
        assert!(!registry.is_valid(&stored));

        fs::remove_file(main.path().join("eclass/a.eclass")).unwrap();
        let stored_missing = vec![EclassFingerprint {
            name: "a".to_string(),
            digest: "whatever".to_string(),
        }];
        assert!(!registry.is_valid(&stored_missing));
        assert!(registry.is_valid(&[]));
    }
}
