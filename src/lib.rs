//! Query layer over Gentoo ebuild repositories, based on [PMS].
//!
//! This crate answers the questions a package manager asks of its
//! repositories: which versions of a package exist, which of them the
//! local configuration allows, what metadata each one declares and what
//! it needs to download.
//!
//! [PMS]: https://projects.gentoo.org/pms/latest/pms.html
//!
//! # Overview
//!
//! Ebuild metadata needs a shell to evaluate. A [`MetadataStore`] obtains
//! it through a [`MetadataExtractor`] and keeps it in a per-tree cache
//! [`Backend`], invalidated by ebuild mtime and eclass digests. Optionally
//! every package Manifest is signature-checked first ([`ManifestVerifier`]).
//!
//! On top of the store, a [`VisibilityFilter`] applies `package.mask`,
//! `ACCEPT_KEYWORDS` and `ACCEPT_LICENSE`, a [`MatchEngine`] answers
//! dependency queries at the various match levels, and a [`FetchPlanner`]
//! resolves `SRC_URI` against USE flags and the distfiles directory.
//!
//! # Examples
//!
//! Compare versions and match atoms:
//!
//! ```
//! use portage_repo::{Atom, Cpv, Version};
//!
//! let a = Version::parse("1.0_rc1").unwrap();
//! let b = Version::parse("1.0").unwrap();
//! assert!(a.vercmp(&b).is_lt());
//!
//! let atom = Atom::parse("~dev-libs/foo-1.0").unwrap();
//! assert!(atom.matches(&Cpv::parse("dev-libs/foo-1.0-r3").unwrap()));
//! ```
//!
//! Read a cache record:
//!
//! ```
//! use portage_repo::MetadataRecord;
//!
//! let record = MetadataRecord::parse("EAPI=8\nSLOT=0\n_mtime_=1700000000\n").unwrap();
//! assert_eq!(record.get("SLOT"), "0");
//! assert_eq!(record.source_mtime, 1700000000);
//! ```

mod atom;
mod backend;
mod config;
mod cpv;
mod depspec;
mod eapi;
mod eclass;
mod error;
mod extract;
mod fetch;
mod iuse;
mod keyword;
mod license;
mod manifest;
mod matcher;
mod record;
mod repository;
mod src_uri;
mod store;
mod verify;
mod version;
mod visibility;

#[cfg(test)]
mod test_support;

// Re-export public types
pub use atom::{Atom, Operator, SlotOperator};
pub use backend::{Backend, BackendRegistry, FlatBackend};
pub use config::{
    stack_incrementals, CacheBackendKind, PackageAtoms, Settings, UseConfig, UseResolver,
};
pub use cpv::Cpv;
pub use eapi::Eapi;
pub use eclass::{EclassFingerprint, EclassRegistry};
pub use error::{Error, Result, SignatureError};
pub use extract::{
    CommandExtractor, ExtractContext, ExtractOutcome, Md5CacheExtractor, MetadataExtractor,
    DEPEND_PHASE,
};
pub use fetch::{FetchPlanner, UseSelection};
pub use iuse::{IUse, IUseDefault};
pub use keyword::{check_keywords, Keyword, KeywordCheck, Stability};
pub use license::{LicenseAcceptance, LicenseExpr, LicenseGroups};
pub use manifest::{EntryKind, Manifest, ManifestEntry};
pub use matcher::{Level, MatchEngine};
pub use portage_atom::Slot;
pub use record::{MetadataRecord, AUX_KEYS};
pub use repository::{RepositorySet, RepositoryTree, REPO_NAME_LOCATION};
pub use src_uri::{Download, SrcUriEntry, UriRestriction, UriSpec};
pub use store::{MetadataStore, AUX_CACHE_KEYS};
pub use verify::{
    parse_status, ArmorChecker, GpgChecker, ManifestVerifier, SignatureChecker, SignatureStatus,
    TrustLevel, VerifyPolicy,
};
pub use version::{best, Suffix, SuffixKind, Version};
pub use visibility::VisibilityFilter;
