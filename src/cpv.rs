use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::version::Version;

/// A fully qualified package version: `category/package-version[-rN]`.
///
/// Identifies one ebuild within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cpv {
    pub category: String,
    pub package: String,
    pub version: Version,
}

impl Cpv {
    /// Parse `category/package-version`.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::Cpv;
    ///
    /// let cpv = Cpv::parse("dev-libs/foo-bar-1.2-r1").unwrap();
    /// assert_eq!(cpv.package, "foo-bar");
    /// assert_eq!(cpv.version.to_string(), "1.2-r1");
    /// assert_eq!(cpv.cp(), "dev-libs/foo-bar");
    /// ```
    pub fn parse(input: &str) -> Result<Cpv> {
        let (category, pf) = input
            .split_once('/')
            .ok_or_else(|| Error::InvalidDependency(format!("missing category: {input}")))?;
        if !is_valid_category(category) {
            return Err(Error::InvalidDependency(format!(
                "invalid category: {input}"
            )));
        }
        let (package, version) = split_package_version(pf)
            .ok_or_else(|| Error::InvalidDependency(format!("invalid cpv: {input}")))?;
        Ok(Cpv {
            category: category.to_string(),
            package: package.to_string(),
            version,
        })
    }

    /// Build a `Cpv` from a category and an ebuild basename (`pkg-ver`).
    pub fn from_pf(category: &str, pf: &str) -> Result<Cpv> {
        Cpv::parse(&format!("{category}/{pf}"))
    }

    /// `category/package`
    pub fn cp(&self) -> String {
        format!("{}/{}", self.category, self.package)
    }

    /// `package-version`, the ebuild file stem.
    pub fn pf(&self) -> String {
        format!("{}-{}", self.package, self.version)
    }
}

/// Split `pkg-1.0-r1` into `("pkg", 1.0-r1)`.
///
/// The first hyphen followed by a complete version wins.
pub(crate) fn split_package_version(pf: &str) -> Option<(&str, Version)> {
    pf.match_indices('-').find_map(|(idx, _)| {
        let (name, rest) = (&pf[..idx], &pf[idx + 1..]);
        if !is_valid_package(name) {
            return None;
        }
        Version::parse(rest).ok().map(|v| (name, v))
    })
}

pub(crate) fn is_valid_category(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(['-', '.', '+'])
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

pub(crate) fn is_valid_package(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(['-', '+'])
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+'))
}

impl Ord for Cpv {
    fn cmp(&self, other: &Self) -> Ordering {
        self.category
            .cmp(&other.category)
            .then_with(|| self.package.cmp(&other.package))
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl PartialOrd for Cpv {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Cpv {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Cpv::parse(s)
    }
}

impl fmt::Display for Cpv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}-{}", self.category, self.package, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let cpv = Cpv::parse("sys-apps/portage-2.1.3").unwrap();
        assert_eq!(cpv.category, "sys-apps");
        assert_eq!(cpv.package, "portage");
        assert_eq!(cpv.version.to_string(), "2.1.3");
        assert_eq!(cpv.to_string(), "sys-apps/portage-2.1.3");
        assert_eq!(cpv.pf(), "portage-2.1.3");
    }

    #[test]
    fn package_with_digits_after_hyphen() {
        let cpv = Cpv::parse("media-fonts/font-adobe-100dpi-1.0.0").unwrap();
        assert_eq!(cpv.package, "font-adobe-100dpi");
        assert_eq!(cpv.version.to_string(), "1.0.0");
    }

    #[test]
    fn invalid() {
        assert!(Cpv::parse("foo-1.0").is_err());
        assert!(Cpv::parse("cat/foo").is_err());
        assert!(Cpv::parse("cat/-1.0").is_err());
        assert!(Cpv::parse("/foo-1.0").is_err());
    }

    #[test]
    fn ordering_by_version() {
        let mut cpvs: Vec<Cpv> = ["cat/pkg-2.0", "cat/pkg-1.0", "cat/pkg-10"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        cpvs.sort();
        let names: Vec<String> = cpvs.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["cat/pkg-1.0", "cat/pkg-2.0", "cat/pkg-10"]);
    }
}
