use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::atom::{parse_slot, Atom};
use crate::backend::{Backend, BackendRegistry};
use crate::config::Settings;
use crate::cpv::Cpv;
use crate::eapi::Eapi;
use crate::eclass::EclassRegistry;
use crate::error::{Error, Result};
use crate::extract::{ExtractContext, ExtractOutcome, MetadataExtractor, DEPEND_PHASE};
use crate::record::{MetadataRecord, AUX_KEYS};
use crate::repository::{RepositorySet, RepositoryTree};
use crate::verify::{GpgChecker, ManifestVerifier};

/// Keys kept in the in-memory cache. Visibility checks ask for nothing else,
/// so a hit there avoids touching the filesystem at all.
pub const AUX_CACHE_KEYS: &[&str] = &["EAPI", "KEYWORDS", "LICENSE", "SLOT"];

/// Lazily regenerated, persisted metadata for every ebuild of a
/// repository set.
///
/// A persisted record is reused while the ebuild's mtime and every
/// inherited eclass are unchanged; otherwise the ebuild goes through the
/// [`MetadataExtractor`] again. Ebuilds whose extraction failed stay broken
/// for the lifetime of the store.
pub struct MetadataStore {
    repos: RepositorySet,
    eclasses: EclassRegistry,
    backends: BackendRegistry,
    aux_cache: HashMap<Cpv, HashMap<String, String>>,
    broken: HashSet<PathBuf>,
    verifier: Option<ManifestVerifier>,
    extractor: Box<dyn MetadataExtractor>,
}

impl MetadataStore {
    /// Open a store over `repos`.
    ///
    /// The cache backend comes from [`Settings::cache_backend`]. When
    /// `FEATURES` contains `gpg`, every package Manifest is verified with
    /// `gpg` before its metadata is used.
    pub fn new(
        repos: RepositorySet,
        settings: &Settings,
        extractor: Box<dyn MetadataExtractor>,
    ) -> Self {
        let verifier = settings.verify_policy().map(|policy| {
            ManifestVerifier::new(policy, Box::new(GpgChecker::new(&settings.gpg_dir)))
        });
        MetadataStore {
            eclasses: EclassRegistry::new(&repos),
            backends: BackendRegistry::new(settings.cache_backend, &settings.depcachedir),
            repos,
            aux_cache: HashMap::new(),
            broken: HashSet::new(),
            verifier,
            extractor,
        }
    }

    /// Replace the Manifest verifier, or disable verification with `None`.
    pub fn with_verifier(mut self, verifier: Option<ManifestVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn repositories(&self) -> &RepositorySet {
        &self.repos
    }

    pub fn eclasses_mut(&mut self) -> &mut EclassRegistry {
        &mut self.eclasses
    }

    /// Whether extraction of `ebuild` failed earlier.
    pub fn is_broken(&self, ebuild: &Path) -> bool {
        self.broken.contains(ebuild)
    }

    /// Metadata values for `cpv`, in the order of `fields`.
    ///
    /// Unknown keys yield empty strings. `repository` restricts the lookup
    /// to the tree of that name. Returns [`Error::NotFound`] when no ebuild
    /// resolves or the ebuild cannot be sourced, and a
    /// [`Error::Signature`] when Manifest verification rejects the package.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use portage_repo::{Cpv, Md5CacheExtractor, MetadataStore, RepositorySet, Settings};
    ///
    /// let repos = RepositorySet::new(Path::new("/var/db/repos/gentoo"), Vec::<&Path>::new());
    /// let mut store = MetadataStore::new(repos, &Settings::default(), Box::new(Md5CacheExtractor));
    /// let cpv = Cpv::parse("sys-apps/portage-3.0.63").unwrap();
    /// let values = store.aux_get(&cpv, &["SLOT", "KEYWORDS"], None).unwrap();
    /// println!("slot {} keywords {}", values[0], values[1]);
    /// ```
    pub fn aux_get(
        &mut self,
        cpv: &Cpv,
        fields: &[&str],
        repository: Option<&str>,
    ) -> Result<Vec<String>> {
        let cacheable =
            repository.is_none() && fields.iter().all(|f| AUX_CACHE_KEYS.contains(f));
        if cacheable {
            if let Some(hit) = self.aux_cache.get(cpv) {
                return Ok(fields
                    .iter()
                    .map(|f| hit.get(*f).cloned().unwrap_or_default())
                    .collect());
            }
        }

        let resolved = match repository {
            Some(name) => self.repos.resolve_in(cpv, name),
            None => self.repos.resolve(cpv),
        };
        let (ebuild, tree) = match resolved {
            Some((ebuild, tree)) => (ebuild, tree.clone()),
            None => {
                debug!(%cpv, ?repository, "ebuild not found");
                return Err(Error::NotFound(cpv.to_string()));
            }
        };

        if let Some(verifier) = &mut self.verifier {
            let manifest = ebuild.with_file_name("Manifest");
            verifier.verify(&manifest)?;
        }

        let mtime = mtime_secs(&ebuild)?;
        let record = match self.load_fresh(cpv, &tree, mtime) {
            Some(record) => record,
            None => {
                if self.broken.contains(&ebuild) {
                    return Err(Error::NotFound(format!("{cpv}: ebuild is broken")));
                }
                self.regenerate(cpv, &ebuild, &tree, mtime)?
            }
        };

        if cacheable {
            let entry = AUX_CACHE_KEYS
                .iter()
                .map(|key| (key.to_string(), record.get(key)))
                .collect();
            self.aux_cache.insert(cpv.clone(), entry);
        }

        Ok(fields.iter().map(|f| record.get(f)).collect())
    }

    /// The persisted record for `cpv` if it is still fresh.
    ///
    /// Corrupt records are deleted so the regenerated one replaces them.
    fn load_fresh(&mut self, cpv: &Cpv, tree: &RepositoryTree, mtime: u64) -> Option<MetadataRecord> {
        let backend = self.backends.backend_for(tree);
        let record = match backend.get(cpv) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(Error::InvalidCacheEntry(reason)) => {
                warn!(%cpv, %reason, "discarding corrupt metadata record");
                discard(backend, cpv);
                return None;
            }
            Err(err) => {
                warn!(%cpv, %err, "cannot read metadata record");
                return None;
            }
        };

        if record.source_mtime != mtime {
            debug!(%cpv, stored = record.source_mtime, live = mtime, "ebuild changed");
            return None;
        }
        if !record.eclasses.is_empty() && !self.eclasses.is_valid(&record.eclasses) {
            debug!(%cpv, "inherited eclass changed");
            return None;
        }
        // A negated EAPI marks one that was unsupported when extracted.
        let eapi = record.get("EAPI");
        if let Some(old) = eapi.strip_prefix('-') {
            if Eapi::is_supported(old) {
                debug!(%cpv, eapi = old, "EAPI became supported");
                return None;
            }
        }
        Some(record)
    }

    fn regenerate(
        &mut self,
        cpv: &Cpv,
        ebuild: &Path,
        tree: &RepositoryTree,
        mtime: u64,
    ) -> Result<MetadataRecord> {
        let ctx = ExtractContext {
            cpv,
            tree,
            phase: DEPEND_PHASE,
        };
        let mut fields = match self.extractor.extract(ebuild, &ctx) {
            ExtractOutcome::Success(fields) => fields,
            ExtractOutcome::Failure => {
                warn!(%cpv, ebuild = %ebuild.display(), "metadata extraction failed");
                self.broken.insert(ebuild.to_path_buf());
                return Err(Error::NotFound(format!("{cpv}: metadata extraction failed")));
            }
        };
        debug!(%cpv, "regenerated metadata");

        let eapi = fields
            .get("EAPI")
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "0".to_string());
        let inherited = fields.remove("INHERITED").unwrap_or_default();

        let eclasses = if Eapi::is_supported(&eapi) {
            fields.insert("EAPI".to_string(), eapi);
            let names: Vec<&str> = inherited.split_whitespace().collect();
            self.eclasses.fingerprints_for(&names).into_values().collect()
        } else {
            debug!(%cpv, %eapi, "unsupported EAPI");
            fields = blank_fields();
            fields.insert("EAPI".to_string(), format!("-{eapi}"));
            Vec::new()
        };

        let record = MetadataRecord {
            fields,
            source_mtime: mtime,
            eclasses,
        };
        if let Err(err) = self.backends.backend_for(tree).set(cpv, record.clone()) {
            warn!(%cpv, %err, "cannot store metadata record");
        }
        Ok(record)
    }

    /// Whether `atom` matches `cpv`, including its `::repo` and slot
    /// restrictions.
    ///
    /// A version whose `SLOT` cannot be found never matches. Other lookup
    /// failures, signature failures in particular, are returned.
    pub fn matches_atom(&mut self, atom: &Atom, cpv: &Cpv) -> Result<bool> {
        if !atom.matches(cpv) {
            return Ok(false);
        }
        if let Some(repo) = &atom.repository {
            if self.repos.resolve_in(cpv, repo).is_none() {
                return Ok(false);
            }
        }
        if atom.slot.is_none() {
            return Ok(true);
        }
        let values = match self.aux_get(cpv, &["SLOT"], atom.repository.as_deref()) {
            Ok(values) => values,
            Err(Error::NotFound(reason)) => {
                debug!(%cpv, %reason, "no SLOT to match against");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        Ok(values
            .first()
            .and_then(|slot| parse_slot(slot))
            .map_or(false, |slot| atom.matches_slot(&slot)))
    }

    /// Drop the in-memory metadata cache. Persisted records are kept.
    pub fn clear_aux_cache(&mut self) {
        self.aux_cache.clear();
    }

    /// Sync every cache backend.
    pub fn flush(&mut self) -> Result<()> {
        self.backends.sync_all()
    }

    /// Sync and close every cache backend.
    pub fn close(&mut self) -> Result<()> {
        self.backends.close()
    }
}

fn discard(backend: &mut Backend, cpv: &Cpv) {
    if let Err(err) = backend.delete(cpv) {
        warn!(%cpv, %err, "cannot delete metadata record");
    }
}

fn blank_fields() -> BTreeMap<String, String> {
    AUX_KEYS
        .iter()
        .filter(|key| **key != "INHERITED")
        .map(|key| (key.to_string(), String::new()))
        .collect()
}

fn mtime_secs(path: &Path) -> Result<u64> {
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| Error::io(path, e))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}
