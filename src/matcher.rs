use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::atom::Atom;
use crate::cpv::{split_package_version, Cpv};
use crate::error::{Error, Result};
use crate::store::MetadataStore;
use crate::version::best;
use crate::visibility::VisibilityFilter;

/// What an [`MatchEngine::xmatch`] query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Every visible version of the atom's package, version ignored.
    ListVisible,
    /// The highest visible match.
    BestmatchVisible,
    /// Every visible match.
    MatchVisible,
    /// Every match, masked or not.
    MatchAll,
    /// The highest match within a caller-supplied list.
    BestmatchList,
    /// Every match within a caller-supplied list.
    MatchList,
}

impl Level {
    /// Levels evaluated against a caller-supplied list. These are never
    /// memoized.
    pub fn takes_list(self) -> bool {
        matches!(self, Level::BestmatchList | Level::MatchList)
    }

    fn is_best(self) -> bool {
        matches!(self, Level::BestmatchVisible | Level::BestmatchList)
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "list-visible" => Ok(Level::ListVisible),
            "bestmatch-visible" => Ok(Level::BestmatchVisible),
            "match-visible" => Ok(Level::MatchVisible),
            "match-all" => Ok(Level::MatchAll),
            "bestmatch-list" => Ok(Level::BestmatchList),
            "match-list" => Ok(Level::MatchList),
            _ => Err(Error::InvalidDependency(format!("unknown match level: {s}"))),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Level::ListVisible => "list-visible",
            Level::BestmatchVisible => "bestmatch-visible",
            Level::MatchVisible => "match-visible",
            Level::MatchAll => "match-all",
            Level::BestmatchList => "bestmatch-list",
            Level::MatchList => "match-list",
        })
    }
}

/// Memoized query results, by level then dependency string.
type Snapshot = HashMap<Level, HashMap<String, Vec<Cpv>>>;

/// Answers dependency queries against a repository set.
///
/// While frozen, results of the non-list levels are memoized; the snapshot
/// is only ever discarded as a whole by [`melt`](Self::melt). Every result
/// is a fresh vector.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use portage_repo::{Level, MatchEngine, Md5CacheExtractor, MetadataStore, RepositorySet, Settings, VisibilityFilter};
///
/// let settings = Settings {
///     accept_keywords: vec!["amd64".to_string()],
///     ..Settings::default()
/// };
/// let repos = RepositorySet::new(Path::new("/var/db/repos/gentoo"), Vec::<&Path>::new());
/// let store = MetadataStore::new(repos, &settings, Box::new(Md5CacheExtractor));
/// let mut engine = MatchEngine::new(store, VisibilityFilter::new(settings));
///
/// engine.freeze();
/// let best = engine.xmatch(Level::BestmatchVisible, "sys-apps/portage").unwrap();
/// println!("{best:?}");
/// engine.melt();
/// ```
pub struct MatchEngine {
    store: MetadataStore,
    filter: VisibilityFilter,
    snapshot: Option<Snapshot>,
}

impl MatchEngine {
    pub fn new(store: MetadataStore, filter: VisibilityFilter) -> Self {
        MatchEngine {
            store,
            filter,
            snapshot: None,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MetadataStore {
        &mut self.store
    }

    pub fn filter(&self) -> &VisibilityFilter {
        &self.filter
    }

    /// Start memoizing. Freezing an already frozen engine keeps its snapshot.
    pub fn freeze(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(HashMap::new());
        }
    }

    /// Stop memoizing and drop everything memoized.
    pub fn melt(&mut self) {
        self.snapshot = None;
    }

    pub fn is_frozen(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Evaluate `dep` at one of the non-list levels.
    ///
    /// The list levels need candidates; use [`xmatch_list`](Self::xmatch_list).
    pub fn xmatch(&mut self, level: Level, dep: &str) -> Result<Vec<Cpv>> {
        if level.takes_list() {
            return Err(Error::InvalidDependency(format!(
                "{level} needs a candidate list"
            )));
        }
        if let Some(hit) = self.memoized(level, dep) {
            return Ok(hit);
        }
        let atom = self.dep_expand(dep)?;
        let found = self.evaluate(level, &atom, &[])?;
        if let Some(snapshot) = &mut self.snapshot {
            let by_dep = snapshot.entry(level).or_default();
            let normalized = atom.to_string();
            if normalized != dep {
                by_dep.insert(dep.to_string(), found.clone());
            }
            by_dep.insert(normalized, found.clone());
        }
        Ok(found)
    }

    /// Evaluate `dep` against `candidates` at a list level (`match-list`,
    /// `bestmatch-list`). Other levels ignore `candidates`.
    pub fn xmatch_list(&mut self, level: Level, dep: &str, candidates: &[Cpv]) -> Result<Vec<Cpv>> {
        if !level.takes_list() {
            return self.xmatch(level, dep);
        }
        let atom = self.dep_expand(dep)?;
        self.evaluate(level, &atom, candidates)
    }

    /// Every visible match of `dep`.
    pub fn match_visible(&mut self, dep: &str) -> Result<Vec<Cpv>> {
        self.xmatch(Level::MatchVisible, dep)
    }

    /// Parse `dep`, filling in the category when it is missing.
    ///
    /// A bare package name is looked up in every tree: a single category
    /// containing it is used, none yields the `null` category, and more
    /// than one is an ambiguity error.
    pub fn dep_expand(&self, dep: &str) -> Result<Atom> {
        let dep = dep.trim();
        let rest = dep.trim_start_matches(|c| matches!(c, '<' | '>' | '=' | '~'));
        let operator = &dep[..dep.len() - rest.len()];
        let name_end = rest
            .find(|c| matches!(c, ':' | '[' | '*'))
            .unwrap_or(rest.len());
        if rest[..name_end].contains('/') {
            return Atom::parse(dep);
        }

        let pf = &rest[..name_end];
        let package = if operator.is_empty() {
            pf
        } else {
            split_package_version(pf)
                .map(|(name, _)| name)
                .ok_or_else(|| Error::InvalidDependency(format!("missing version: {dep}")))?
        };
        let categories = self.store.repositories().categories_with_package(package);
        let category = match categories.as_slice() {
            [] => "null",
            [only] => only.as_str(),
            _ => {
                return Err(Error::InvalidDependency(format!(
                    "ambiguous package name '{package}': {}",
                    categories.join(", ")
                )))
            }
        };
        Atom::parse(&format!("{operator}{category}/{rest}"))
    }

    /// All versions of `category/package`, empty for unknown categories.
    pub fn cp_list(&self, category: &str, package: &str, repository: Option<&str>) -> Vec<Cpv> {
        if !self.filter.settings().is_known_category(category) {
            warn!(category, "invalid category");
            return Vec::new();
        }
        self.store
            .repositories()
            .cp_list(category, package, repository)
    }

    /// Sync every metadata cache backend.
    pub fn flush_cache(&mut self) -> Result<()> {
        self.store.flush()
    }

    /// Sync and close every metadata cache backend.
    pub fn close_caches(&mut self) -> Result<()> {
        self.store.close()
    }

    fn memoized(&self, level: Level, dep: &str) -> Option<Vec<Cpv>> {
        self.snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.get(&level))
            .and_then(|by_dep| by_dep.get(dep))
            .cloned()
    }

    fn evaluate(&mut self, level: Level, atom: &Atom, candidates: &[Cpv]) -> Result<Vec<Cpv>> {
        let mut found = match level {
            Level::ListVisible => self.list_visible(atom)?,
            Level::MatchVisible | Level::BestmatchVisible => {
                let visible = self.list_visible(atom)?;
                atom.filter(&visible)
            }
            Level::MatchAll => {
                let all = self.cp_list(&atom.category, &atom.package, None);
                atom.filter(&all)
            }
            Level::MatchList | Level::BestmatchList => atom.filter(candidates),
        };

        if atom.slot.is_some() || atom.repository.is_some() {
            let restriction = Atom {
                operator: None,
                version: None,
                glob: false,
                ..atom.clone()
            };
            let mut kept = Vec::with_capacity(found.len());
            for cpv in found {
                if self.store.matches_atom(&restriction, &cpv)? {
                    kept.push(cpv);
                }
            }
            found = kept;
        }

        if level.is_best() {
            found = best(&found, |cpv| &cpv.version).cloned().into_iter().collect();
        }
        debug!(%level, %atom, matches = found.len(), "xmatch");
        Ok(found)
    }

    /// Visible versions of the atom's package, memoized under the key.
    fn list_visible(&mut self, atom: &Atom) -> Result<Vec<Cpv>> {
        let key = atom.key();
        if let Some(hit) = self.memoized(Level::ListVisible, &key) {
            return Ok(hit);
        }
        let all = self.cp_list(&atom.category, &atom.package, None);
        let visible = self.filter.visible(&mut self.store, &all)?;
        if let Some(snapshot) = &mut self.snapshot {
            snapshot
                .entry(Level::ListVisible)
                .or_default()
                .insert(key, visible.clone());
        }
        Ok(visible)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::rc::Rc;

    use super::*;
    use crate::config::{PackageAtoms, Settings};
    use crate::error::SignatureError;
    use crate::repository::RepositorySet;
    use crate::test_support::{volatile_store, TreeBuilder};
    use crate::verify::{ArmorChecker, ManifestVerifier, VerifyPolicy};

    fn names(list: &[Cpv]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    fn engine(tree: &TreeBuilder, settings: Settings) -> (MatchEngine, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let repos = RepositorySet::new(tree.path(), Vec::<PathBuf>::new());
        let store = volatile_store(repos, calls.clone());
        (MatchEngine::new(store, VisibilityFilter::new(settings)), calls)
    }

    fn amd64() -> Settings {
        Settings {
            accept_keywords: vec!["amd64".to_string()],
            ..Settings::default()
        }
    }

    fn sample_tree() -> TreeBuilder {
        TreeBuilder::new("gentoo")
            .ebuild("dev-libs/foo-1.0", "EAPI=8\nSLOT=1\nKEYWORDS=amd64\n")
            .ebuild("dev-libs/foo-2.0", "EAPI=8\nSLOT=2\nKEYWORDS=amd64\n")
            .ebuild("dev-libs/foo-2.1", "EAPI=8\nSLOT=2\nKEYWORDS=~amd64\n")
            .ebuild("dev-libs/foo-3.0", "EAPI=8\nSLOT=3\nKEYWORDS=amd64\n")
    }

    #[test]
    fn levels() {
        let tree = sample_tree();
        let settings = Settings {
            package_mask: PackageAtoms::parse("=dev-libs/foo-3.0\n"),
            ..amd64()
        };
        let (mut engine, _) = engine(&tree, settings);

        assert_eq!(
            names(&engine.xmatch(Level::MatchAll, "dev-libs/foo").unwrap()),
            vec!["dev-libs/foo-1.0", "dev-libs/foo-2.0", "dev-libs/foo-2.1", "dev-libs/foo-3.0"]
        );
        assert_eq!(
            names(&engine.xmatch(Level::ListVisible, ">=dev-libs/foo-2").unwrap()),
            vec!["dev-libs/foo-1.0", "dev-libs/foo-2.0"]
        );
        assert_eq!(
            names(&engine.xmatch(Level::MatchVisible, ">=dev-libs/foo-2").unwrap()),
            vec!["dev-libs/foo-2.0"]
        );
        assert_eq!(
            names(&engine.xmatch(Level::BestmatchVisible, "dev-libs/foo").unwrap()),
            vec!["dev-libs/foo-2.0"]
        );
        assert!(engine
            .xmatch(Level::BestmatchVisible, "dev-libs/missing")
            .unwrap()
            .is_empty());

        let list = engine.xmatch(Level::MatchAll, "dev-libs/foo").unwrap();
        assert_eq!(
            names(&engine.xmatch_list(Level::BestmatchList, "<dev-libs/foo-3", &list).unwrap()),
            vec!["dev-libs/foo-2.1"]
        );
        assert_eq!(
            names(&engine.xmatch_list(Level::MatchList, "~dev-libs/foo-2.0", &list).unwrap()),
            vec!["dev-libs/foo-2.0"]
        );
        assert!(engine.xmatch(Level::MatchList, "dev-libs/foo").is_err());
    }

    #[test]
    fn slot_filtering() {
        let tree = sample_tree();
        let (mut engine, _) = engine(&tree, amd64());
        assert_eq!(
            names(&engine.xmatch(Level::MatchAll, "dev-libs/foo:2").unwrap()),
            vec!["dev-libs/foo-2.0", "dev-libs/foo-2.1"]
        );
        assert_eq!(
            names(&engine.xmatch(Level::BestmatchVisible, "dev-libs/foo:2").unwrap()),
            vec!["dev-libs/foo-2.0"]
        );
        assert!(engine.xmatch(Level::MatchAll, "dev-libs/foo:9").unwrap().is_empty());
    }

    #[test]
    fn slot_lookup_failures_are_dropped() {
        let tree = sample_tree().ebuild("dev-libs/foo-4.0", "FAIL\n");
        let (mut engine, _) = engine(&tree, amd64());
        assert_eq!(
            names(&engine.xmatch(Level::MatchAll, "dev-libs/foo:3").unwrap()),
            vec!["dev-libs/foo-3.0"]
        );
        assert_eq!(engine.xmatch(Level::MatchAll, "dev-libs/foo").unwrap().len(), 5);
    }

    #[test]
    fn slot_lookups_surface_signature_failures() {
        let tree = sample_tree().file("dev-libs/foo/Manifest", "DIST foo-1.0.tar.gz 3 SHA256 00\n");
        let repos = RepositorySet::new(tree.path(), Vec::<PathBuf>::new());
        let store = volatile_store(repos, Rc::new(Cell::new(0))).with_verifier(Some(
            ManifestVerifier::new(VerifyPolicy::Severe, Box::new(ArmorChecker)),
        ));
        let mut engine = MatchEngine::new(store, VisibilityFilter::new(amd64()));

        // listing needs no metadata, so nothing is verified
        assert_eq!(engine.xmatch(Level::MatchAll, "dev-libs/foo").unwrap().len(), 4);
        for (level, dep) in [
            (Level::MatchAll, "dev-libs/foo:2"),
            (Level::MatchVisible, "dev-libs/foo"),
            (Level::BestmatchVisible, "dev-libs/foo"),
        ] {
            assert!(
                matches!(
                    engine.xmatch(level, dep),
                    Err(Error::Signature(SignatureError::Missing(_)))
                ),
                "{level} {dep}"
            );
        }
    }

    #[test]
    fn freeze_and_melt() {
        let tree = sample_tree();
        let (mut engine, calls) = engine(&tree, amd64());
        engine.freeze();
        assert!(engine.is_frozen());

        let before = engine.xmatch(Level::MatchVisible, "foo").unwrap();
        assert_eq!(before.len(), 3);
        let extractions = calls.get();

        // the tree changes but the frozen snapshot does not
        tree.write("dev-libs/foo/foo-4.0.ebuild", "EAPI=8\nSLOT=4\nKEYWORDS=amd64\n");
        assert_eq!(engine.xmatch(Level::MatchVisible, "foo").unwrap(), before);
        assert_eq!(engine.xmatch(Level::MatchVisible, "dev-libs/foo").unwrap(), before);
        assert_eq!(calls.get(), extractions);

        let mut copy = engine.xmatch(Level::MatchVisible, "foo").unwrap();
        copy.clear();
        assert_eq!(engine.xmatch(Level::MatchVisible, "foo").unwrap(), before);

        engine.melt();
        assert!(!engine.is_frozen());
        assert_eq!(engine.xmatch(Level::MatchVisible, "foo").unwrap().len(), 4);
    }

    #[test]
    fn unfrozen_engine_sees_changes() {
        let tree = sample_tree();
        let (mut engine, _) = engine(&tree, amd64());
        assert_eq!(engine.xmatch(Level::MatchAll, "dev-libs/foo").unwrap().len(), 4);
        tree.write("dev-libs/foo/foo-4.0.ebuild", "EAPI=8\n");
        assert_eq!(engine.xmatch(Level::MatchAll, "dev-libs/foo").unwrap().len(), 5);
    }

    #[test]
    fn expand_bare_names() {
        let tree = sample_tree()
            .ebuild("app-misc/bar-1", "EAPI=8\n")
            .ebuild("dev-libs/bar-1", "EAPI=8\n");
        let (engine, _) = engine(&tree, amd64());

        assert_eq!(engine.dep_expand("foo").unwrap().key(), "dev-libs/foo");
        let atom = engine.dep_expand(">=foo-2.0:2").unwrap();
        assert_eq!(atom.to_string(), ">=dev-libs/foo-2.0:2");
        assert_eq!(engine.dep_expand("nothere").unwrap().key(), "null/nothere");
        assert!(matches!(
            engine.dep_expand("bar"),
            Err(Error::InvalidDependency(_))
        ));
        assert!(engine.dep_expand("dev-libs/").is_err());
    }

    #[test]
    fn unknown_category_lists_nothing() {
        let tree = sample_tree();
        let settings = Settings {
            categories: HashSet::from(["app-misc".to_string()]),
            ..amd64()
        };
        let (mut engine, _) = engine(&tree, settings);
        assert!(engine.xmatch(Level::MatchAll, "dev-libs/foo").unwrap().is_empty());
        assert!(engine.cp_list("dev-libs", "foo", None).is_empty());
    }

    #[test]
    fn level_names() {
        for name in [
            "list-visible",
            "bestmatch-visible",
            "match-visible",
            "match-all",
            "bestmatch-list",
            "match-list",
        ] {
            assert_eq!(name.parse::<Level>().unwrap().to_string(), name);
        }
        assert!("match-everything".parse::<Level>().is_err());
    }
}
