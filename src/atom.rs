use std::fmt;
use std::str::FromStr;

use portage_atom::Slot;
use winnow::combinator::{alt, delimited, opt, preceded};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take_while;

use crate::cpv::{is_valid_category, is_valid_package, split_package_version, Cpv};
use crate::error::{Error, Result};
use crate::version::Version;

/// Version comparison operator of an atom.
///
/// See [PMS 8.3.1](https://projects.gentoo.org/pms/9/pms.html#operators).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `<`
    Less,
    /// `<=`
    LessOrEqual,
    /// `=` (optionally with a trailing `*` glob)
    Equal,
    /// `~` — any revision of the version.
    Approximate,
    /// `>=`
    GreaterOrEqual,
    /// `>`
    Greater,
}

/// Slot operator (EAPI 5+). Accepted but irrelevant for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotOperator {
    /// `:=`
    Equal,
    /// `:*`
    Star,
}

/// A package dependency atom such as `>=dev-libs/foo-1.2:0/3::gentoo[ssl]`.
///
/// See [PMS 8.3](https://projects.gentoo.org/pms/9/pms.html#package-dependency-specifications).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub operator: Option<Operator>,
    pub category: String,
    pub package: String,
    pub version: Option<Version>,
    /// `=cat/pkg-1.2*`
    pub glob: bool,
    pub slot: Option<Slot>,
    pub slot_operator: Option<SlotOperator>,
    /// Restricts matches to the repository with this name.
    pub repository: Option<String>,
    /// USE dependencies, verbatim. Not evaluated when matching.
    pub use_deps: Vec<String>,
}

impl Atom {
    /// Parse an atom.
    ///
    /// Blockers (`!atom`) are not package matches and are rejected.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::{Atom, Cpv};
    ///
    /// let atom = Atom::parse(">=dev-libs/foo-1.2:0").unwrap();
    /// assert_eq!(atom.key(), "dev-libs/foo");
    /// assert!(atom.matches(&Cpv::parse("dev-libs/foo-1.3").unwrap()));
    /// assert!(!atom.matches(&Cpv::parse("dev-libs/foo-1.1").unwrap()));
    /// ```
    pub fn parse(input: &str) -> Result<Atom> {
        if input.starts_with('!') {
            return Err(Error::InvalidDependency(format!(
                "blockers are not supported here: {input}"
            )));
        }
        let raw = parse_atom()
            .parse(input)
            .map_err(|e| Error::InvalidDependency(format!("{e}")))?;
        raw.into_atom(input)
    }

    /// A version-less atom for `category/package`.
    pub fn for_package(category: &str, package: &str) -> Atom {
        Atom {
            operator: None,
            category: category.to_string(),
            package: package.to_string(),
            version: None,
            glob: false,
            slot: None,
            slot_operator: None,
            repository: None,
            use_deps: Vec::new(),
        }
    }

    /// The `category/package` key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.package)
    }

    /// Whether `cpv` has this atom's name and satisfies its version constraint.
    ///
    /// Slot, repository and USE restrictions need metadata and are checked
    /// by the callers that have it.
    pub fn matches(&self, cpv: &Cpv) -> bool {
        cpv.category == self.category
            && cpv.package == self.package
            && self.matches_version(&cpv.version)
    }

    fn matches_version(&self, candidate: &Version) -> bool {
        let (op, wanted) = match (self.operator, &self.version) {
            (Some(op), Some(wanted)) => (op, wanted),
            _ => return true,
        };
        let ord = candidate.vercmp(wanted);
        match op {
            Operator::Equal if self.glob => {
                glob_matches(&wanted.to_string(), &candidate.to_string())
            }
            Operator::Equal => ord.is_eq(),
            Operator::Approximate => candidate
                .without_revision()
                .vercmp(&wanted.without_revision())
                .is_eq(),
            Operator::Less => ord.is_lt(),
            Operator::LessOrEqual => ord.is_le(),
            Operator::Greater => ord.is_gt(),
            Operator::GreaterOrEqual => ord.is_ge(),
        }
    }

    /// Whether a package `SLOT` value satisfies this atom's slot restriction.
    pub fn matches_slot(&self, slot: &Slot) -> bool {
        match self.slot {
            None => true,
            Some(ref wanted) => {
                wanted.slot == slot.slot
                    && (wanted.subslot.is_none() || wanted.subslot == slot.subslot)
            }
        }
    }

    /// Filter `candidates` down to the ones this atom matches, order preserved.
    pub fn filter(&self, candidates: &[Cpv]) -> Vec<Cpv> {
        candidates
            .iter()
            .filter(|cpv| self.matches(cpv))
            .cloned()
            .collect()
    }
}

/// Component-aware prefix match used by `=cat/pkg-1.2*`.
fn glob_matches(prefix: &str, candidate: &str) -> bool {
    if !candidate.starts_with(prefix) {
        return false;
    }
    let ends_in_digit = prefix.ends_with(|c: char| c.is_ascii_digit());
    let next_is_digit = candidate[prefix.len()..].starts_with(|c: char| c.is_ascii_digit());
    !(ends_in_digit && next_is_digit)
}

/// Parse a `SLOT` metadata value (`0`, `2/2.1`).
pub(crate) fn parse_slot(s: &str) -> Option<Slot> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    Some(match s.split_once('/') {
        Some((slot, subslot)) => Slot::with_subslot(slot, subslot),
        None => Slot::new(s),
    })
}

impl FromStr for Atom {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Atom::parse(s)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Equal => "=",
            Operator::Approximate => "~",
            Operator::GreaterOrEqual => ">=",
            Operator::Greater => ">",
        })
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(op) = self.operator {
            write!(f, "{op}")?;
        }
        write!(f, "{}/{}", self.category, self.package)?;
        if let Some(ref version) = self.version {
            write!(f, "-{version}")?;
        }
        if self.glob {
            write!(f, "*")?;
        }
        match (&self.slot, self.slot_operator) {
            (Some(slot), op) => {
                write!(f, ":{}", slot.slot)?;
                if let Some(ref sub) = slot.subslot {
                    write!(f, "/{sub}")?;
                }
                if op == Some(SlotOperator::Equal) {
                    write!(f, "=")?;
                }
            }
            (None, Some(SlotOperator::Equal)) => write!(f, ":=")?,
            (None, Some(SlotOperator::Star)) => write!(f, ":*")?,
            (None, None) => {}
        }
        if let Some(ref repo) = self.repository {
            write!(f, "::{repo}")?;
        }
        if !self.use_deps.is_empty() {
            write!(f, "[{}]", self.use_deps.join(","))?;
        }
        Ok(())
    }
}

/// Atom pieces before name/version validation.
struct RawAtom<'s> {
    operator: Option<Operator>,
    category: &'s str,
    pf: &'s str,
    glob: bool,
    slot: Option<(Option<Slot>, Option<SlotOperator>)>,
    repository: Option<&'s str>,
    use_deps: Option<&'s str>,
}

impl RawAtom<'_> {
    fn into_atom(self, input: &str) -> Result<Atom> {
        let invalid = |why: &str| Error::InvalidDependency(format!("{why}: {input}"));
        if !is_valid_category(self.category) {
            return Err(invalid("invalid category"));
        }
        let (package, version) = match self.operator {
            Some(_) => {
                let (name, version) =
                    split_package_version(self.pf).ok_or_else(|| invalid("missing version"))?;
                (name.to_string(), Some(version))
            }
            None if is_valid_package(self.pf) => (self.pf.to_string(), None),
            None => return Err(invalid("invalid package name")),
        };
        if self.glob && self.operator != Some(Operator::Equal) {
            return Err(invalid("'*' suffix requires the '=' operator"));
        }
        let (slot, slot_operator) = self.slot.unwrap_or((None, None));
        let use_deps = self
            .use_deps
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Atom {
            operator: self.operator,
            category: self.category.to_string(),
            package,
            version,
            glob: self.glob,
            slot,
            slot_operator,
            repository: self.repository.map(str::to_string),
            use_deps,
        })
    }
}

// Winnow parsers

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+')
}

fn is_slot_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+')
}

fn parse_operator(input: &mut &str) -> ModalResult<Operator> {
    alt((
        "<=".value(Operator::LessOrEqual),
        ">=".value(Operator::GreaterOrEqual),
        "<".value(Operator::Less),
        ">".value(Operator::Greater),
        "=".value(Operator::Equal),
        "~".value(Operator::Approximate),
    ))
    .parse_next(input)
}

/// `*`, `=`, or `slot[/subslot][=]`.
fn parse_slot_spec(input: &mut &str) -> ModalResult<(Option<Slot>, Option<SlotOperator>)> {
    alt((
        '*'.value((None, Some(SlotOperator::Star))),
        '='.value((None, Some(SlotOperator::Equal))),
        (
            take_while(1.., is_slot_char),
            opt(preceded('/', take_while(1.., is_slot_char))),
            opt('='),
        )
            .map(|(slot, subslot, op): (&str, Option<&str>, Option<char>)| {
                let slot = match subslot {
                    Some(sub) => Slot::with_subslot(slot, sub),
                    None => Slot::new(slot),
                };
                (Some(slot), op.map(|_| SlotOperator::Equal))
            }),
    ))
    .parse_next(input)
}

fn parse_atom<'s>() -> impl Parser<&'s str, RawAtom<'s>, ErrMode<ContextError>> {
    move |input: &mut &'s str| {
        let operator = opt(parse_operator).parse_next(input)?;
        let category = take_while(1.., is_name_char).parse_next(input)?;
        '/'.parse_next(input)?;
        let pf = take_while(1.., is_name_char).parse_next(input)?;
        let glob = opt('*').parse_next(input)?.is_some();
        let slot = opt(preceded(':', parse_slot_spec)).parse_next(input)?;
        let repository = opt(preceded("::", take_while(1.., is_name_char))).parse_next(input)?;
        let use_deps = opt(delimited('[', take_while(0.., |c: char| c != ']'), ']'))
            .parse_next(input)?;
        Ok(RawAtom {
            operator,
            category,
            pf,
            glob,
            slot,
            repository,
            use_deps,
        })
    }
}
