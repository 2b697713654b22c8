use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use winnow::ascii::digit1;
use winnow::combinator::{alt, opt, preceded, repeat, separated};
use winnow::prelude::*;
use winnow::token::one_of;

use crate::error::{Error, Result};

/// Version suffix kind, in ascending order of precedence.
///
/// See [PMS 3.2](https://projects.gentoo.org/pms/9/pms.html#version-specifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuffixKind {
    /// `_alpha`
    Alpha,
    /// `_beta`
    Beta,
    /// `_pre`
    Pre,
    /// `_rc`
    Rc,
    /// `_p`
    P,
}

/// A version suffix such as `_rc2`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Suffix {
    pub kind: SuffixKind,
    /// Digits following the suffix, verbatim.
    pub number: Option<String>,
}

/// A package version (`1.2.3b_rc1-r2`).
///
/// Numeric parts are kept as digit strings so arbitrarily long components
/// compare correctly. Equality is structural (`1.0` and `1.00` are
/// different versions of an ebuild), ordering follows the PMS algorithm
/// and falls back to the structure only to stay consistent with `Eq`.
/// Use [`Version::vercmp`] for the pure PMS comparison.
///
/// See [PMS 3.3](https://projects.gentoo.org/pms/9/pms.html#version-comparison).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub numbers: Vec<String>,
    pub letter: Option<char>,
    pub suffixes: Vec<Suffix>,
    pub revision: Option<String>,
}

impl Version {
    /// Parse a version string.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::Version;
    ///
    /// let a = Version::parse("1.0_rc1").unwrap();
    /// let b = Version::parse("1.0").unwrap();
    /// assert!(a < b);
    /// ```
    pub fn parse(input: &str) -> Result<Version> {
        parse_version
            .parse(input)
            .map_err(|e| Error::InvalidDependency(format!("invalid version '{input}': {e}")))
    }

    /// PMS version comparison.
    pub fn vercmp(&self, other: &Version) -> Ordering {
        compare_numbers(&self.numbers, &other.numbers)
            .then_with(|| self.letter.cmp(&other.letter))
            .then_with(|| compare_suffixes(&self.suffixes, &other.suffixes))
            .then_with(|| {
                compare_numeric(
                    self.revision.as_deref().unwrap_or("0"),
                    other.revision.as_deref().unwrap_or("0"),
                )
            })
    }

    /// The same version with the revision stripped.
    pub fn without_revision(&self) -> Version {
        Version {
            revision: None,
            ..self.clone()
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.vercmp(other).then_with(|| {
            (&self.numbers, self.letter, &self.suffixes, &self.revision).cmp(&(
                &other.numbers,
                other.letter,
                &other.suffixes,
                &other.revision,
            ))
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl fmt::Display for SuffixKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            SuffixKind::Alpha => "alpha",
            SuffixKind::Beta => "beta",
            SuffixKind::Pre => "pre",
            SuffixKind::Rc => "rc",
            SuffixKind::P => "p",
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.numbers.join("."))?;
        if let Some(letter) = self.letter {
            write!(f, "{letter}")?;
        }
        for suffix in &self.suffixes {
            write!(f, "_{}", suffix.kind)?;
            if let Some(ref n) = suffix.number {
                write!(f, "{n}")?;
            }
        }
        if let Some(ref rev) = self.revision {
            write!(f, "-r{rev}")?;
        }
        Ok(())
    }
}

/// Compare two digit strings as unbounded integers.
fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_numbers(a: &[String], b: &[String]) -> Ordering {
    let first = match (a.first(), b.first()) {
        (Some(x), Some(y)) => compare_numeric(x, y),
        _ => a.len().cmp(&b.len()),
    };
    if first != Ordering::Equal {
        return first;
    }
    for (x, y) in a.iter().zip(b.iter()).skip(1) {
        // Components with a leading zero compare as decimal fractions.
        let ord = if x.starts_with('0') || y.starts_with('0') {
            x.trim_end_matches('0').cmp(y.trim_end_matches('0'))
        } else {
            compare_numeric(x, y)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_suffixes(a: &[Suffix], b: &[Suffix]) -> Ordering {
    for i in 0..a.len().max(b.len()) {
        let ord = match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) => x.kind.cmp(&y.kind).then_with(|| {
                compare_numeric(
                    x.number.as_deref().unwrap_or("0"),
                    y.number.as_deref().unwrap_or("0"),
                )
            }),
            (Some(x), None) if x.kind == SuffixKind::P => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (None, Some(y)) if y.kind == SuffixKind::P => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Return the highest version among `items`.
pub fn best<'a, T, F>(items: &'a [T], version: F) -> Option<&'a T>
where
    F: Fn(&T) -> &Version,
{
    items
        .iter()
        .reduce(|acc, item| match version(item).vercmp(version(acc)) {
            Ordering::Greater => item,
            _ => acc,
        })
}

// Winnow parsers

fn parse_digits(input: &mut &str) -> ModalResult<String> {
    digit1.map(|s: &str| s.to_string()).parse_next(input)
}

fn parse_suffix(input: &mut &str) -> ModalResult<Suffix> {
    preceded(
        '_',
        (
            alt((
                "alpha".value(SuffixKind::Alpha),
                "beta".value(SuffixKind::Beta),
                "pre".value(SuffixKind::Pre),
                "rc".value(SuffixKind::Rc),
                "p".value(SuffixKind::P),
            )),
            opt(parse_digits),
        ),
    )
    .map(|(kind, number)| Suffix { kind, number })
    .parse_next(input)
}

pub(crate) fn parse_version(input: &mut &str) -> ModalResult<Version> {
    let numbers: Vec<String> = separated(1.., parse_digits, '.').parse_next(input)?;
    let letter = opt(one_of(|c: char| c.is_ascii_lowercase())).parse_next(input)?;
    let suffixes: Vec<Suffix> = repeat(0.., parse_suffix).parse_next(input)?;
    let revision = opt(preceded("-r", parse_digits)).parse_next(input)?;
    Ok(Version {
        numbers,
        letter,
        suffixes,
        revision,
    })
}
