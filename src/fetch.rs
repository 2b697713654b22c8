use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::{Settings, UseConfig, UseResolver};
use crate::cpv::Cpv;
use crate::eapi::Eapi;
use crate::error::{Error, Result};
use crate::iuse::IUse;
use crate::manifest::Manifest;
use crate::src_uri::SrcUriEntry;
use crate::store::MetadataStore;

/// Which USE-conditional groups of `SRC_URI` apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UseSelection {
    /// The package's effective USE flags.
    #[default]
    Default,
    /// Exactly these flags.
    Flags(Vec<String>),
    /// Every conditional group, whatever the flags.
    All,
}

/// Works out what a package downloads and what is still missing from the
/// distfiles directory.
pub struct FetchPlanner {
    distdir: PathBuf,
    use_resolver: Box<dyn UseResolver>,
}

impl FetchPlanner {
    pub fn new(settings: &Settings) -> Self {
        FetchPlanner {
            distdir: settings.distdir.clone(),
            use_resolver: Box::new(UseConfig::from_settings(settings)),
        }
    }

    pub fn with_use_resolver(mut self, resolver: Box<dyn UseResolver>) -> Self {
        self.use_resolver = resolver;
        self
    }

    /// URIs and distinct filenames of `cpv`'s sources under `selection`.
    ///
    /// Every URI is returned, including mirrors of the same file; filenames
    /// are deduplicated in first-seen order.
    pub fn fetch_list(
        &self,
        store: &mut MetadataStore,
        cpv: &Cpv,
        selection: &UseSelection,
        repository: Option<&str>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let values = store
            .aux_get(cpv, &["SRC_URI", "EAPI", "IUSE"], repository)
            .map_err(|err| match err {
                Error::NotFound(_) => {
                    Error::InvalidDependency(format!("error reading metadata of {cpv}"))
                }
                other => other,
            })?;
        let [src_uri, eapi, iuse] = <[String; 3]>::try_from(values)
            .map_err(|_| Error::InvalidDependency(format!("error reading metadata of {cpv}")))?;

        let eapi = Eapi::from_metadata(&eapi)?;
        let entries = SrcUriEntry::parse(&src_uri)?;
        SrcUriEntry::check_eapi(&entries, eapi)?;

        let flags: Option<HashSet<String>> = match selection {
            UseSelection::All => None,
            UseSelection::Flags(flags) => Some(flags.iter().cloned().collect()),
            UseSelection::Default => {
                let iuse = IUse::parse_line(&iuse)?;
                IUse::check_eapi(&iuse, eapi)?;
                Some(self.use_resolver.use_flags(cpv, &iuse))
            }
        };

        let mut uris = Vec::new();
        let mut files: Vec<String> = Vec::new();
        for download in SrcUriEntry::reduce(&entries, flags.as_ref())? {
            if !files.contains(&download.filename) {
                files.push(download.filename);
            }
            uris.push(download.url);
        }
        Ok((uris, files))
    }

    /// Bytes still to download per file, from the `DIST` entries of the
    /// package Manifest.
    ///
    /// A partial download counts its remainder; a file larger than its
    /// digest counts in full since it has to be fetched again. Complete
    /// files are left out. `None` when the package exists but has no
    /// distfile digests.
    pub fn fetch_sizes(
        &self,
        store: &mut MetadataStore,
        cpv: &Cpv,
        selection: &UseSelection,
        repository: Option<&str>,
    ) -> Result<Option<BTreeMap<String, u64>>> {
        let (_, files) = self.fetch_list(store, cpv, selection, repository)?;
        let Some(manifest) = self.manifest(store, cpv, repository) else {
            return Ok(None);
        };
        if manifest.dist_digests().next().is_none() {
            return Ok(None);
        }

        let mut sizes = BTreeMap::new();
        for file in files {
            let Some(entry) = manifest.dist(&file) else {
                debug!(%cpv, %file, "no digest for distfile");
                continue;
            };
            let present = fs::metadata(self.distdir.join(&file))
                .map(|meta| meta.len())
                .unwrap_or(0);
            if present < entry.size {
                sizes.insert(file, entry.size - present);
            } else if present > entry.size {
                sizes.insert(file, entry.size);
            }
        }
        Ok(Some(sizes))
    }

    /// Whether every distfile of `cpv` has a digest and verifies against it.
    pub fn fetch_check(
        &self,
        store: &mut MetadataStore,
        cpv: &Cpv,
        selection: &UseSelection,
        repository: Option<&str>,
    ) -> Result<bool> {
        let (_, files) = self.fetch_list(store, cpv, selection, repository)?;
        let manifest = self.manifest(store, cpv, repository).unwrap_or_default();
        for file in files {
            let Some(entry) = manifest.dist(&file) else {
                warn!(%cpv, %file, "no digest for distfile");
                return Ok(false);
            };
            if !entry.verify_file(&self.distdir.join(&file))? {
                debug!(%cpv, %file, "distfile does not verify");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn manifest(&self, store: &MetadataStore, cpv: &Cpv, repository: Option<&str>) -> Option<Manifest> {
        let repos = store.repositories();
        let (ebuild, _) = match repository {
            Some(name) => repos.resolve_in(cpv, name)?,
            None => repos.resolve(cpv)?,
        };
        let path = ebuild.with_file_name("Manifest");
        match Manifest::load(&path) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                debug!(path = %path.display(), %err, "no usable Manifest");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::config::PackageAtoms;
    use crate::repository::RepositorySet;
    use crate::test_support::{volatile_store, TreeBuilder};

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn setup(tree: &TreeBuilder) -> (MetadataStore, tempfile::TempDir, Settings) {
        let repos = RepositorySet::new(tree.path(), Vec::<PathBuf>::new());
        let store = volatile_store(repos, Rc::new(Cell::new(0)));
        let distdir = tempfile::tempdir().unwrap();
        let settings = Settings {
            distdir: distdir.path().to_path_buf(),
            ..Settings::default()
        };
        (store, distdir, settings)
    }

    fn foo_tree() -> TreeBuilder {
        TreeBuilder::new("gentoo")
            .ebuild(
                "app-misc/foo-1",
                "EAPI=8\nIUSE=+doc ssl\nSRC_URI=https://a.example/foo-1.tar.gz https://b.example/foo-1.tar.gz doc? ( https://a.example/foo-doc.tar.gz ) ssl? ( https://a.example/ssl.patch )\n",
            )
            .file(
                "app-misc/foo/Manifest",
                &format!(
                    "DIST foo-1.tar.gz 1000 SHA256 00\nDIST foo-doc.tar.gz 3 SHA256 {ABC}\nDIST ssl.patch 1200 SHA256 00\n"
                ),
            )
    }

    #[test]
    fn lists_follow_use() {
        let tree = foo_tree();
        let (mut store, _distdir, settings) = setup(&tree);
        let planner = FetchPlanner::new(&settings);
        let cpv = Cpv::parse("app-misc/foo-1").unwrap();

        let (uris, files) = planner
            .fetch_list(&mut store, &cpv, &UseSelection::Default, None)
            .unwrap();
        assert_eq!(
            uris,
            vec![
                "https://a.example/foo-1.tar.gz",
                "https://b.example/foo-1.tar.gz",
                "https://a.example/foo-doc.tar.gz",
            ]
        );
        assert_eq!(files, vec!["foo-1.tar.gz", "foo-doc.tar.gz"]);

        let (_, files) = planner
            .fetch_list(&mut store, &cpv, &UseSelection::Flags(vec!["ssl".to_string()]), None)
            .unwrap();
        assert_eq!(files, vec!["foo-1.tar.gz", "ssl.patch"]);

        let (uris, files) = planner
            .fetch_list(&mut store, &cpv, &UseSelection::All, None)
            .unwrap();
        assert_eq!(uris.len(), 4);
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn package_use_is_applied() {
        let tree = foo_tree();
        let (mut store, _distdir, mut settings) = setup(&tree);
        settings.package_use = PackageAtoms::parse("app-misc/foo -doc ssl\n");
        let planner = FetchPlanner::new(&settings);
        let cpv = Cpv::parse("app-misc/foo-1").unwrap();
        let (_, files) = planner
            .fetch_list(&mut store, &cpv, &UseSelection::Default, None)
            .unwrap();
        assert_eq!(files, vec!["foo-1.tar.gz", "ssl.patch"]);
    }

    #[test]
    fn missing_package_and_bad_uris() {
        let tree = TreeBuilder::new("gentoo")
            .ebuild("app-misc/dir-1", "EAPI=8\nSRC_URI=https://a.example/dir/\n")
            .ebuild("app-misc/arrow-1", "EAPI=1\nSRC_URI=https://a.example/v1 -> arrow-1.tar.gz\n");
        let (mut store, _distdir, settings) = setup(&tree);
        let planner = FetchPlanner::new(&settings);

        let missing = Cpv::parse("app-misc/none-1").unwrap();
        assert!(matches!(
            planner.fetch_list(&mut store, &missing, &UseSelection::All, None),
            Err(Error::InvalidDependency(_))
        ));
        let dir = Cpv::parse("app-misc/dir-1").unwrap();
        assert_eq!(
            planner.fetch_list(&mut store, &dir, &UseSelection::All, None),
            Err(Error::InvalidDependency(
                "URI has no basename: 'https://a.example/dir/'".to_string()
            ))
        );
        let arrow = Cpv::parse("app-misc/arrow-1").unwrap();
        assert!(matches!(
            planner.fetch_list(&mut store, &arrow, &UseSelection::All, None),
            Err(Error::InvalidSrcUri(_))
        ));
    }

    #[test]
    fn remaining_sizes() {
        let tree = foo_tree();
        let (mut store, distdir, settings) = setup(&tree);
        let planner = FetchPlanner::new(&settings);
        let cpv = Cpv::parse("app-misc/foo-1").unwrap();
        let ssl = UseSelection::Flags(vec!["ssl".to_string(), "doc".to_string()]);

        fs::write(distdir.path().join("foo-1.tar.gz"), vec![0u8; 400]).unwrap();
        fs::write(distdir.path().join("foo-doc.tar.gz"), "abc").unwrap();
        let sizes = planner.fetch_sizes(&mut store, &cpv, &ssl, None).unwrap().unwrap();
        assert_eq!(sizes.get("foo-1.tar.gz"), Some(&600));
        assert_eq!(sizes.get("foo-doc.tar.gz"), None);
        assert_eq!(sizes.get("ssl.patch"), Some(&1200));

        // an oversized file is fetched again in full
        fs::write(distdir.path().join("foo-1.tar.gz"), vec![0u8; 1200]).unwrap();
        let sizes = planner.fetch_sizes(&mut store, &cpv, &ssl, None).unwrap().unwrap();
        assert_eq!(sizes.get("foo-1.tar.gz"), Some(&1000));
    }

    #[test]
    fn sizes_need_digests() {
        let tree = TreeBuilder::new("gentoo")
            .ebuild("app-misc/bare-1", "EAPI=8\nSRC_URI=https://a.example/bare.tar.gz\n")
            .ebuild("app-misc/nodist-1", "EAPI=8\nSRC_URI=https://a.example/nodist.tar.gz\n")
            .file("app-misc/nodist/Manifest", "EBUILD nodist-1.ebuild 10 SHA256 00\n")
            .ebuild("app-misc/partial-1", "EAPI=8\nSRC_URI=https://a.example/a.tar.gz https://a.example/b.tar.gz\n")
            .file("app-misc/partial/Manifest", "DIST a.tar.gz 10 SHA256 00\n");
        let (mut store, _distdir, settings) = setup(&tree);
        let planner = FetchPlanner::new(&settings);

        for name in ["app-misc/bare-1", "app-misc/nodist-1"] {
            let cpv = Cpv::parse(name).unwrap();
            assert_eq!(
                planner.fetch_sizes(&mut store, &cpv, &UseSelection::All, None),
                Ok(None),
                "{name}"
            );
        }
        let nothere = Cpv::parse("app-misc/nothere-1").unwrap();
        assert_eq!(
            planner.fetch_sizes(&mut store, &nothere, &UseSelection::All, None),
            Err(Error::InvalidDependency(
                "error reading metadata of app-misc/nothere-1".to_string()
            ))
        );
        let partial = Cpv::parse("app-misc/partial-1").unwrap();
        let sizes = planner
            .fetch_sizes(&mut store, &partial, &UseSelection::All, None)
            .unwrap()
            .unwrap();
        assert_eq!(sizes.into_iter().collect::<Vec<_>>(), vec![("a.tar.gz".to_string(), 10)]);
    }

    #[test]
    fn check_distfiles() {
        let tree = foo_tree();
        let (mut store, distdir, settings) = setup(&tree);
        let planner = FetchPlanner::new(&settings);
        let cpv = Cpv::parse("app-misc/foo-1").unwrap();
        let doc_only = UseSelection::Flags(vec!["doc".to_string()]);

        // foo-1.tar.gz has a bogus digest
        fs::write(distdir.path().join("foo-doc.tar.gz"), "abc").unwrap();
        assert_eq!(planner.fetch_check(&mut store, &cpv, &doc_only, None), Ok(false));

        let tree = TreeBuilder::new("gentoo")
            .ebuild("app-misc/doc-1", "EAPI=8\nSRC_URI=https://a.example/foo-doc.tar.gz\n")
            .file("app-misc/doc/Manifest", &format!("DIST foo-doc.tar.gz 3 SHA256 {ABC}\n"));
        let repos = RepositorySet::new(tree.path(), Vec::<PathBuf>::new());
        let mut store = volatile_store(repos, Rc::new(Cell::new(0)));
        let cpv = Cpv::parse("app-misc/doc-1").unwrap();
        assert_eq!(planner.fetch_check(&mut store, &cpv, &UseSelection::All, None), Ok(true));

        fs::write(distdir.path().join("foo-doc.tar.gz"), "abd").unwrap();
        assert_eq!(planner.fetch_check(&mut store, &cpv, &UseSelection::All, None), Ok(false));
    }
}
