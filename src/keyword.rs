use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// How a `KEYWORDS` entry marks its architecture.
///
/// See [PMS 7.3.3](https://projects.gentoo.org/pms/9/pms.html#keywords).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stability {
    Stable,
    /// `~arch`
    Testing,
    /// `-arch`
    Disabled,
    /// `-*`
    DisabledAll,
}

impl Stability {
    fn prefix(self) -> &'static str {
        match self {
            Stability::Stable => "",
            Stability::Testing => "~",
            Stability::Disabled | Stability::DisabledAll => "-",
        }
    }
}

/// One `KEYWORDS` entry. For `-*` the arch is `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyword {
    pub arch: String,
    pub stability: Stability,
}

impl Keyword {
    /// Split a `KEYWORDS` value into its entries.
    ///
    /// ```
    /// use portage_repo::{Keyword, Stability};
    ///
    /// let kws = Keyword::parse_line("amd64 ~arm64 -*").unwrap();
    /// let marks: Vec<_> = kws.iter().map(|kw| kw.stability).collect();
    /// assert_eq!(marks, [Stability::Stable, Stability::Testing, Stability::DisabledAll]);
    /// ```
    pub fn parse_line(input: &str) -> Result<Vec<Keyword>> {
        input.split_whitespace().map(str::parse).collect()
    }

    /// The literal `*` keyword, which accepts the package everywhere.
    pub fn is_any_arch(&self) -> bool {
        self.stability == Stability::Stable && self.arch == "*"
    }
}

/// Result of checking a package's `KEYWORDS` against an accepted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordCheck {
    /// Whether the package is visible for the accepted set.
    pub accepted: bool,
    /// Set when the package carries `*`, or `-*` as its only keyword.
    /// Both are suspicious in a tree and deserve a warning.
    pub wildcard: Option<Keyword>,
}

/// Check a package's keywords against `accepted` (an already stacked
/// `ACCEPT_KEYWORDS` list).
///
/// A keyword listed verbatim in `accepted` makes the package visible.
/// Otherwise `~*` accepts any testing keyword, `*` any stable keyword and
/// `**` anything at all, including packages with no keywords.
///
/// # Examples
///
/// ```
/// use portage_repo::{check_keywords, Keyword};
///
/// let kws = Keyword::parse_line("~amd64").unwrap();
/// let stable_only = vec!["amd64".to_string()];
/// assert!(!check_keywords(&kws, &stable_only).accepted);
///
/// let any_testing = vec!["amd64".to_string(), "~*".to_string()];
/// assert!(check_keywords(&kws, &any_testing).accepted);
/// ```
pub fn check_keywords(keywords: &[Keyword], accepted: &[String]) -> KeywordCheck {
    let listed = |token: &str| accepted.iter().any(|a| a == token);
    let lone = keywords.len() == 1;
    let mut wildcard = None;
    let mut has_stable = false;
    let mut has_testing = false;

    for keyword in keywords {
        if keyword.is_any_arch() || (keyword.stability == Stability::DisabledAll && lone) {
            wildcard = Some(keyword.clone());
            if keyword.is_any_arch() {
                return KeywordCheck {
                    accepted: true,
                    wildcard,
                };
            }
        } else if listed(&keyword.to_string()) {
            return KeywordCheck {
                accepted: true,
                wildcard,
            };
        } else {
            match keyword.stability {
                Stability::Testing => has_testing = true,
                Stability::Stable => has_stable = true,
                Stability::Disabled | Stability::DisabledAll => {}
            }
        }
    }

    let accepted = (has_testing && listed("~*")) || (has_stable && listed("*")) || listed("**");
    KeywordCheck { accepted, wildcard }
}

impl FromStr for Keyword {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (stability, arch) = match s.as_bytes().first() {
            Some(b'-') if s == "-*" => (Stability::DisabledAll, "*"),
            Some(b'-') => (Stability::Disabled, &s[1..]),
            Some(b'~') => (Stability::Testing, &s[1..]),
            _ => (Stability::Stable, s),
        };
        if arch.is_empty() {
            return Err(Error::InvalidKeyword(format!("'{s}'")));
        }
        Ok(Keyword {
            arch: arch.to_string(),
            stability,
        })
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.stability.prefix(), self.arch)
    }
}
