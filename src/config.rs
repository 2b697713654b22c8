//! Configuration consumed by the repository layer.
//!
//! Loading `make.conf` and the profile stack is someone else's job; this
//! module only holds the already-resolved values plus parsers for the
//! line-oriented `/etc/portage/package.*` files.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::warn;

use crate::atom::Atom;
use crate::cpv::Cpv;
use crate::iuse::IUse;
use crate::license::LicenseGroups;
use crate::verify::VerifyPolicy;

/// Which storage backend the metadata store persists records into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackendKind {
    /// Records live only in memory.
    Volatile,
    /// One flat file per record under the dependency cache directory.
    #[default]
    Flat,
    /// Read existing flat records, keep regenerated ones in memory.
    /// For users who cannot write to the cache directory.
    ReadOnlyOverlay,
}

/// Per-package atom lists, keyed by `category/package`.
///
/// Each atom carries the tokens that followed it on its line (keywords,
/// licenses or USE flags, depending on the file). Mask files have none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageAtoms {
    entries: HashMap<String, Vec<(Atom, Vec<String>)>>,
}

impl PackageAtoms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `package.*` file.
    ///
    /// `#` starts a comment; blank lines are skipped; lines whose atom does
    /// not parse are skipped with a warning.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::PackageAtoms;
    ///
    /// let keywords = PackageAtoms::parse("# testing\n=dev-libs/foo-2.0 ~amd64\n");
    /// let entries = keywords.for_key("dev-libs/foo");
    /// assert_eq!(entries.len(), 1);
    /// assert_eq!(entries[0].1, vec!["~amd64"]);
    /// ```
    pub fn parse(text: &str) -> Self {
        let mut atoms = PackageAtoms::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let mut tokens = line.split_whitespace();
            let Some(first) = tokens.next() else {
                continue;
            };
            match Atom::parse(first) {
                Ok(atom) => atoms.insert(atom, tokens.map(str::to_string).collect()),
                Err(err) => warn!(line = lineno + 1, %err, "ignoring invalid package atom"),
            }
        }
        atoms
    }

    pub fn insert(&mut self, atom: Atom, tokens: Vec<String>) {
        self.entries
            .entry(atom.key())
            .or_default()
            .push((atom, tokens));
    }

    /// Entries for `category/package`, in declaration order.
    pub fn for_key(&self, cp: &str) -> &[(Atom, Vec<String>)] {
        self.entries.get(cp).map(Vec::as_slice).unwrap_or_default()
    }

    /// Just the atoms for `category/package`.
    pub fn atoms<'a>(&'a self, cp: &str) -> impl Iterator<Item = &'a Atom> + 'a {
        self.for_key(cp).iter().map(|(atom, _)| atom)
    }

    pub fn contains_key(&self, cp: &str) -> bool {
        self.entries.contains_key(cp)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolved configuration for one repository set.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Stacked `ACCEPT_KEYWORDS`.
    pub accept_keywords: Vec<String>,
    /// `ACCEPT_KEYWORDS` from the calling environment, with its negative
    /// entries intact. Stacked after per-package keywords.
    pub backup_accept_keywords: Vec<String>,
    /// `package.accept_keywords`.
    pub package_keywords: PackageAtoms,
    /// `ACCEPT_LICENSE` tokens.
    pub accept_license: Vec<String>,
    /// `package.license`.
    pub package_license: PackageAtoms,
    /// `profiles/license_groups` of every tree.
    pub license_groups: LicenseGroups,
    /// Profile and user `package.mask`.
    pub package_mask: PackageAtoms,
    /// `package.unmask`.
    pub package_unmask: PackageAtoms,
    /// Profile `packages` version pins.
    pub profile_packages: PackageAtoms,
    /// Stacked global `USE`.
    pub use_flags: Vec<String>,
    /// `package.use`.
    pub package_use: PackageAtoms,
    /// Known categories. Empty disables the check.
    pub categories: HashSet<String>,
    /// `FEATURES`.
    pub features: HashSet<String>,
    /// Where distfiles are downloaded to.
    pub distdir: PathBuf,
    /// Root of the persisted metadata cache.
    pub depcachedir: PathBuf,
    pub cache_backend: CacheBackendKind,
    /// Keyring directory for manifest signature checks.
    pub gpg_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            accept_keywords: Vec::new(),
            backup_accept_keywords: Vec::new(),
            package_keywords: PackageAtoms::new(),
            accept_license: vec!["*".to_string()],
            package_license: PackageAtoms::new(),
            license_groups: LicenseGroups::default(),
            package_mask: PackageAtoms::new(),
            package_unmask: PackageAtoms::new(),
            profile_packages: PackageAtoms::new(),
            use_flags: Vec::new(),
            package_use: PackageAtoms::new(),
            categories: HashSet::new(),
            features: HashSet::new(),
            distdir: PathBuf::from("/var/cache/distfiles"),
            depcachedir: PathBuf::from("/var/cache/edb/dep"),
            cache_backend: CacheBackendKind::Flat,
            gpg_dir: PathBuf::from("/etc/portage/gpg"),
        }
    }
}

impl Settings {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Manifest verification policy selected by `FEATURES`.
    ///
    /// `gpg` enables verification; `strict` and `severe` raise the bar.
    pub fn verify_policy(&self) -> Option<VerifyPolicy> {
        if !self.has_feature("gpg") {
            None
        } else if self.has_feature("strict") {
            Some(VerifyPolicy::Strict)
        } else if self.has_feature("severe") {
            Some(VerifyPolicy::Severe)
        } else {
            Some(VerifyPolicy::PresenceOnly)
        }
    }

    /// Whether `category` is known, or no category list is configured.
    pub fn is_known_category(&self, category: &str) -> bool {
        self.categories.is_empty() || self.categories.contains(category)
    }
}

/// Stack incremental tokens: `-*` clears, `-foo` removes `foo`, anything
/// else is appended once. Declaration order decides.
///
/// # Examples
///
/// ```
/// use portage_repo::stack_incrementals;
///
/// let stacked = stack_incrementals(["x86", "~x86", "-x86", "-*", "amd64"]);
/// assert_eq!(stacked, vec!["amd64"]);
/// ```
pub fn stack_incrementals<I, S>(tokens: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut stacked: Vec<String> = Vec::new();
    for token in tokens {
        let token = token.as_ref();
        if token == "-*" {
            stacked.clear();
        } else if let Some(removed) = token.strip_prefix('-') {
            stacked.retain(|t| t != removed);
        } else if !token.is_empty() && !stacked.iter().any(|t| t == token) {
            stacked.push(token.to_string());
        }
    }
    stacked
}

/// Source of the effective USE flags of a package.
pub trait UseResolver {
    fn use_flags(&self, cpv: &Cpv, iuse: &[IUse]) -> HashSet<String>;
}

/// USE resolution from IUSE defaults, global `USE` and `package.use`,
/// stacked in that order.
#[derive(Debug, Clone, Default)]
pub struct UseConfig {
    pub global: Vec<String>,
    pub package_use: PackageAtoms,
}

impl UseConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        UseConfig {
            global: settings.use_flags.clone(),
            package_use: settings.package_use.clone(),
        }
    }
}

impl UseResolver for UseConfig {
    fn use_flags(&self, cpv: &Cpv, iuse: &[IUse]) -> HashSet<String> {
        let defaults = iuse.iter().filter_map(IUse::default_token);
        let per_package = self
            .package_use
            .for_key(&cpv.cp())
            .iter()
            .filter(|(atom, _)| atom.matches(cpv))
            .flat_map(|(_, flags)| flags.iter().cloned());
        stack_incrementals(
            defaults
                .chain(self.global.iter().cloned())
                .chain(per_package),
        )
        .into_iter()
        .collect()
    }
}
