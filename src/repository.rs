use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cpv::Cpv;
use crate::license::LicenseGroups;

/// Location of the repository name inside a tree.
pub const REPO_NAME_LOCATION: &str = "profiles/repo_name";

/// Top-level directories of a tree that are never categories.
const NON_CATEGORY_DIRS: &[&str] = &[
    "eclass",
    "licenses",
    "metadata",
    "profiles",
    "scripts",
    "distfiles",
    "packages",
];

/// One ebuild repository on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryTree {
    /// Canonical absolute path.
    pub path: PathBuf,
    /// Name declared in `profiles/repo_name`, if any.
    pub name: Option<String>,
    /// Declaration index. Higher wins for file lookup.
    pub priority: usize,
}

impl RepositoryTree {
    /// Open the tree at `path`, reading its declared name.
    pub fn open(path: &Path, priority: usize) -> Self {
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let name = fs::read_to_string(path.join(REPO_NAME_LOCATION))
            .ok()
            .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
            .filter(|s| !s.is_empty());
        RepositoryTree {
            path,
            name,
            priority,
        }
    }

    /// `<tree>/<category>/<package>/<package>-<version>.ebuild`
    pub fn ebuild_path(&self, cpv: &Cpv) -> PathBuf {
        self.package_dir(&cpv.category, &cpv.package)
            .join(format!("{}.ebuild", cpv.pf()))
    }

    pub fn package_dir(&self, category: &str, package: &str) -> PathBuf {
        self.path.join(category).join(package)
    }

    /// Categories of this tree: `profiles/categories` when present,
    /// otherwise every plausible top-level directory.
    pub fn categories(&self) -> BTreeSet<String> {
        if let Ok(listed) = fs::read_to_string(self.path.join("profiles/categories")) {
            return listed
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
        }
        list_dirs(&self.path)
            .into_iter()
            .filter(|name| !name.starts_with('.') && !NON_CATEGORY_DIRS.contains(&name.as_str()))
            .collect()
    }
}

/// The primary tree plus overlays, in declaration order.
///
/// Declaration order is priority order: overlays declared later shadow
/// earlier trees when looking up an ebuild or an eclass.
#[derive(Debug, Clone, Default)]
pub struct RepositorySet {
    trees: Vec<RepositoryTree>,
}

impl RepositorySet {
    /// Build the set from the primary tree and its overlays.
    pub fn new<I, P>(primary: &Path, overlays: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut trees = vec![RepositoryTree::open(primary, 0)];
        for overlay in overlays {
            let priority = trees.len();
            trees.push(RepositoryTree::open(overlay.as_ref(), priority));
        }
        RepositorySet { trees }
    }

    /// Trees in declaration order.
    pub fn trees(&self) -> &[RepositoryTree] {
        &self.trees
    }

    /// Trees from highest to lowest priority.
    pub fn by_priority(&self) -> impl Iterator<Item = &RepositoryTree> {
        self.trees.iter().rev()
    }

    /// Find the ebuild for `cpv` in the highest-priority tree containing it.
    pub fn resolve(&self, cpv: &Cpv) -> Option<(PathBuf, &RepositoryTree)> {
        self.by_priority().find_map(|tree| {
            let ebuild = tree.ebuild_path(cpv);
            ebuild.is_file().then_some((ebuild, tree))
        })
    }

    /// Find the ebuild for `cpv` in the named tree only.
    pub fn resolve_in(&self, cpv: &Cpv, repository: &str) -> Option<(PathBuf, &RepositoryTree)> {
        let tree = self.tree_named(repository)?;
        let ebuild = tree.ebuild_path(cpv);
        ebuild.is_file().then_some((ebuild, tree))
    }

    pub fn tree_named(&self, name: &str) -> Option<&RepositoryTree> {
        self.by_priority()
            .find(|tree| tree.name.as_deref() == Some(name))
    }

    /// Path of the repository declaring `name`.
    pub fn repository_path(&self, name: &str) -> Option<&Path> {
        self.tree_named(name).map(|tree| tree.path.as_path())
    }

    /// Every declared repository name. Unnamed trees are left out.
    pub fn repository_names(&self) -> BTreeSet<String> {
        self.trees.iter().filter_map(|t| t.name.clone()).collect()
    }

    /// All versions of `category/package` across the trees (or in one
    /// named tree), deduplicated and sorted by version.
    pub fn cp_list(&self, category: &str, package: &str, repository: Option<&str>) -> Vec<Cpv> {
        let trees: Vec<&RepositoryTree> = match repository {
            Some(name) => self.tree_named(name).into_iter().collect(),
            None => self.trees.iter().collect(),
        };
        let mut found = BTreeSet::new();
        for tree in trees {
            let dir = tree.package_dir(category, package);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(pf) = file_name.to_str().and_then(|n| n.strip_suffix(".ebuild")) else {
                    continue;
                };
                match Cpv::from_pf(category, pf) {
                    Ok(cpv) if cpv.package == package => {
                        found.insert(cpv);
                    }
                    _ => warn!(path = %dir.join(&file_name).display(), "invalid ebuild name"),
                }
            }
        }
        found.into_iter().collect()
    }

    /// Every `category/package` in any tree, restricted to `categories`
    /// when that set is non-empty.
    pub fn cp_all(&self, categories: &BTreeSet<String>) -> Vec<String> {
        let categories = if categories.is_empty() {
            self.categories()
        } else {
            categories.clone()
        };
        let mut all = BTreeSet::new();
        for category in &categories {
            for tree in &self.trees {
                for package in list_dirs(&tree.path.join(category)) {
                    if !package.starts_with('.') {
                        all.insert(format!("{category}/{package}"));
                    }
                }
            }
        }
        all.into_iter().collect()
    }

    /// Union of the categories of every tree.
    pub fn categories(&self) -> BTreeSet<String> {
        self.trees.iter().flat_map(|t| t.categories()).collect()
    }

    /// Categories that contain a package directory named `package`.
    pub fn categories_with_package(&self, package: &str) -> Vec<String> {
        self.categories()
            .into_iter()
            .filter(|category| {
                self.trees
                    .iter()
                    .any(|tree| tree.package_dir(category, package).is_dir())
            })
            .collect()
    }

    /// Whether an ebuild for `cpv` exists in any tree. No masking applies.
    pub fn cpv_exists(&self, cpv: &Cpv) -> bool {
        self.resolve(cpv).is_some()
    }

    /// `profiles/license_groups` of every tree merged, primary first.
    pub fn license_groups(&self) -> LicenseGroups {
        let mut groups = LicenseGroups::default();
        for tree in &self.trees {
            if let Ok(text) = fs::read_to_string(tree.path.join("profiles/license_groups")) {
                groups.extend(&text);
            }
        }
        groups
    }

    /// Path of the license text `name`, overlays first.
    pub fn find_license_path(&self, name: &str) -> Option<PathBuf> {
        self.by_priority()
            .map(|tree| tree.path.join("licenses").join(name))
            .find(|path| path.is_file())
    }
}

fn list_dirs(path: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}
