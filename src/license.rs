use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::warn;
use winnow::ascii::multispace0;
use winnow::combinator::{cut_err, peek, preceded, repeat, terminated};
use winnow::error::StrContext;
use winnow::prelude::*;

use crate::depspec::{end_of_group, exactly, parenthesized, use_conditional, word};
use crate::error::{Error, Result};

/// A node of a `LICENSE` value.
///
/// See [PMS 7.3](https://projects.gentoo.org/pms/9/pms.html#optional-ebuilddefined-variables).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseExpr {
    License(String),
    /// `|| ( ... )`: one alternative has to be accepted.
    AnyOf(Vec<LicenseExpr>),
    /// `[!]flag? ( ... )`
    UseConditional {
        flag: String,
        negated: bool,
        entries: Vec<LicenseExpr>,
    },
    /// Every entry applies. The whole value, or a bare `( ... )`.
    All(Vec<LicenseExpr>),
}

impl LicenseExpr {
    /// Parse a `LICENSE` value. An empty value requires nothing.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::LicenseExpr;
    ///
    /// let expr = LicenseExpr::parse("|| ( MIT Apache-2.0 )").unwrap();
    /// assert!(matches!(expr, LicenseExpr::AnyOf(_)));
    ///
    /// let expr = LicenseExpr::parse("GPL-2+").unwrap();
    /// assert!(matches!(expr, LicenseExpr::License(_)));
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let mut entries = terminated(entries, multispace0)
            .parse(input)
            .map_err(|e| Error::InvalidLicense(format!("{e}")))?;
        Ok(if entries.len() == 1 {
            entries.remove(0)
        } else {
            LicenseExpr::All(entries)
        })
    }

    /// Whether evaluating this expression depends on USE flags.
    pub fn is_conditional(&self) -> bool {
        match self {
            LicenseExpr::License(_) => false,
            LicenseExpr::UseConditional { .. } => true,
            LicenseExpr::AnyOf(entries) | LicenseExpr::All(entries) => {
                entries.iter().any(LicenseExpr::is_conditional)
            }
        }
    }

    /// Licenses this expression requires that `accepted` does not allow.
    ///
    /// USE-conditional groups are reduced against `use_flags`. An `||`
    /// group is satisfied when any alternative is fully accepted; otherwise
    /// the missing licenses of every alternative are reported.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashSet;
    /// use portage_repo::{LicenseAcceptance, LicenseExpr};
    ///
    /// let accepted = LicenseAcceptance::new(["MIT"]);
    /// let expr = LicenseExpr::parse("MIT ssl? ( OpenSSL )").unwrap();
    /// assert!(expr.missing(&accepted, &HashSet::new()).is_empty());
    ///
    /// let ssl: HashSet<String> = ["ssl".to_string()].into();
    /// assert_eq!(expr.missing(&accepted, &ssl), vec!["OpenSSL"]);
    /// ```
    pub fn missing(&self, accepted: &LicenseAcceptance, use_flags: &HashSet<String>) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_missing(accepted, use_flags, &mut out);
        out
    }

    fn collect_missing(
        &self,
        accepted: &LicenseAcceptance,
        use_flags: &HashSet<String>,
        out: &mut Vec<String>,
    ) {
        match self {
            LicenseExpr::License(name) => {
                if !accepted.accepts(name) && !out.contains(name) {
                    out.push(name.clone());
                }
            }
            LicenseExpr::UseConditional { flag, negated, .. }
                if use_flags.contains(flag) == *negated => {}
            LicenseExpr::All(entries) | LicenseExpr::UseConditional { entries, .. } => {
                for entry in entries {
                    entry.collect_missing(accepted, use_flags, out);
                }
            }
            LicenseExpr::AnyOf(entries) => {
                let alternatives: Vec<Vec<String>> = entries
                    .iter()
                    .map(|entry| entry.missing(accepted, use_flags))
                    .collect();
                if alternatives.iter().any(Vec::is_empty) {
                    return;
                }
                for name in alternatives.into_iter().flatten() {
                    if !out.contains(&name) {
                        out.push(name);
                    }
                }
            }
        }
    }
}

fn write_entries(f: &mut fmt::Formatter, entries: &[LicenseExpr]) -> fmt::Result {
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        match entry {
            LicenseExpr::All(nested) => {
                f.write_str("( ")?;
                write_entries(f, nested)?;
                f.write_str(" )")?;
            }
            _ => write!(f, "{entry}")?,
        }
    }
    Ok(())
}

impl fmt::Display for LicenseExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LicenseExpr::License(name) => f.write_str(name),
            LicenseExpr::AnyOf(entries) => {
                f.write_str("|| ( ")?;
                write_entries(f, entries)?;
                f.write_str(" )")
            }
            LicenseExpr::UseConditional {
                flag,
                negated,
                entries,
            } => {
                let bang = if *negated { "!" } else { "" };
                write!(f, "{bang}{flag}? ( ")?;
                write_entries(f, entries)?;
                f.write_str(" )")
            }
            LicenseExpr::All(entries) => write_entries(f, entries),
        }
    }
}

/// Named license sets from `profiles/license_groups`, referenced as
/// `@GROUP` in `ACCEPT_LICENSE` and `package.license`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseGroups {
    groups: HashMap<String, Vec<String>>,
}

impl LicenseGroups {
    /// Parse `GROUP member...` lines. Members may be `@OTHER` groups.
    /// A group defined twice is extended.
    pub fn parse(text: &str) -> Self {
        let mut groups = LicenseGroups::default();
        groups.extend(text);
        groups
    }

    pub fn extend(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut tokens = line.split_whitespace();
            let Some(name) = tokens.next() else {
                continue;
            };
            self.groups
                .entry(name.to_string())
                .or_default()
                .extend(tokens.map(str::to_string));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Every license in `group`, nested groups resolved. Unknown groups
    /// and cycles are reported and contribute nothing.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::LicenseGroups;
    ///
    /// let groups = LicenseGroups::parse("GPL-COMPATIBLE MIT GPL-2\nFREE @GPL-COMPATIBLE Apache-2.0\n");
    /// assert_eq!(groups.expand("FREE"), vec!["MIT", "GPL-2", "Apache-2.0"]);
    /// ```
    pub fn expand(&self, group: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.expand_into(group, &mut Vec::new(), &mut out);
        out
    }

    fn expand_into<'a>(&'a self, group: &'a str, stack: &mut Vec<&'a str>, out: &mut Vec<String>) {
        if stack.contains(&group) {
            warn!(group, "license group includes itself");
            return;
        }
        let Some(members) = self.groups.get(group) else {
            warn!(group, "undefined license group");
            return;
        };
        stack.push(group);
        for member in members {
            match member.strip_prefix('@') {
                Some(nested) => self.expand_into(nested, stack, out),
                None if !out.contains(member) => out.push(member.clone()),
                None => {}
            }
        }
        stack.pop();
    }
}

/// The licenses a deployment accepts (`ACCEPT_LICENSE`).
///
/// Tokens are applied in order: `*` accepts everything, `-*` resets,
/// `-NAME` rejects one license (even after `*`), `NAME` accepts it.
/// `@GROUP` and `-@GROUP` apply to every member of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseAcceptance {
    all: bool,
    allowed: HashSet<String>,
    denied: HashSet<String>,
}

impl LicenseAcceptance {
    /// Acceptance from tokens that do not reference groups.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_groups(tokens, &LicenseGroups::default())
    }

    pub fn with_groups<I, S>(tokens: I, groups: &LicenseGroups) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut acceptance = LicenseAcceptance::default();
        acceptance.extend(tokens, groups);
        acceptance
    }

    /// Stack more tokens on top of the current state.
    pub fn extend<I, S>(&mut self, tokens: I, groups: &LicenseGroups)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            let token = token.as_ref();
            let (deny, name) = match token.strip_prefix('-') {
                Some(name) => (true, name),
                None => (false, token),
            };
            match (deny, name) {
                (false, "*") => {
                    self.all = true;
                    self.denied.clear();
                }
                (true, "*") => *self = LicenseAcceptance::default(),
                (_, name) => match name.strip_prefix('@') {
                    Some(group) => {
                        for member in groups.expand(group) {
                            self.set(&member, deny);
                        }
                    }
                    None => self.set(name, deny),
                },
            }
        }
    }

    fn set(&mut self, license: &str, deny: bool) {
        if deny {
            self.allowed.remove(license);
            self.denied.insert(license.to_string());
        } else {
            self.denied.remove(license);
            self.allowed.insert(license.to_string());
        }
    }

    pub fn accepts(&self, license: &str) -> bool {
        !self.denied.contains(license) && (self.all || self.allowed.contains(license))
    }
}

// Winnow parsers

/// PMS 3.1.6: alphanumerics and `+ _ . -`, not starting with `+ . -`.
fn is_license_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'))
}

fn entries(input: &mut &str) -> ModalResult<Vec<LicenseExpr>> {
    repeat(0.., entry).parse_next(input)
}

fn entry(input: &mut &str) -> ModalResult<LicenseExpr> {
    match peek(word).parse_next(input)? {
        ")" => end_of_group(),
        "(" => parenthesized(entries).map(LicenseExpr::All).parse_next(input),
        "||" => preceded(
            exactly("||"),
            cut_err(parenthesized(entries)).context(StrContext::Label("'||' group")),
        )
        .map(LicenseExpr::AnyOf)
        .parse_next(input),
        w if w.ends_with('?') => use_conditional(entries)
            .map(|(flag, negated, entries)| LicenseExpr::UseConditional {
                flag,
                negated,
                entries,
            })
            .parse_next(input),
        _ => cut_err(word.verify(is_license_name))
            .context(StrContext::Label("license name"))
            .map(|name: &str| LicenseExpr::License(name.to_string()))
            .parse_next(input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn license(name: &str) -> LicenseExpr {
        LicenseExpr::License(name.to_string())
    }

    #[test]
    fn parse_nested() {
        let expr =
            LicenseExpr::parse("GPL-2+ || ( MIT ( BSD ZLIB ) )\n!bindist? ( EULA )").unwrap();
        assert_eq!(
            expr,
            LicenseExpr::All(vec![
                license("GPL-2+"),
                LicenseExpr::AnyOf(vec![
                    license("MIT"),
                    LicenseExpr::All(vec![license("BSD"), license("ZLIB")]),
                ]),
                LicenseExpr::UseConditional {
                    flag: "bindist".to_string(),
                    negated: true,
                    entries: vec![license("EULA")],
                },
            ])
        );
        assert!(expr.is_conditional());
        assert_eq!(
            expr.to_string(),
            "GPL-2+ || ( MIT ( BSD ZLIB ) ) !bindist? ( EULA )"
        );
        assert_eq!(LicenseExpr::parse("").unwrap(), LicenseExpr::All(Vec::new()));
        assert!(!LicenseExpr::parse("MIT BSD").unwrap().is_conditional());
    }

    #[test]
    fn malformed() {
        for input in [".license", "-GPL", "+MIT", "|| MIT", "|| ( MIT", "MIT )", "ssl? MIT", "a/b"] {
            assert!(
                matches!(LicenseExpr::parse(input), Err(Error::InvalidLicense(_))),
                "{input}"
            );
        }
        assert!(LicenseExpr::parse("_underscored free-1.0+").is_ok());
    }

    #[test]
    fn acceptance_tokens() {
        let acc = LicenseAcceptance::new(["*", "-EULA"]);
        assert!(acc.accepts("GPL-2"));
        assert!(!acc.accepts("EULA"));

        let acc = LicenseAcceptance::new(["MIT", "-*", "BSD"]);
        assert!(!acc.accepts("MIT"));
        assert!(acc.accepts("BSD"));
    }

    #[test]
    fn acceptance_groups() {
        let groups = LicenseGroups::parse(
            "# comment\nOSI MIT BSD\nFREE @OSI GPL-2 # trailing\nLOOP @LOOP MIT\n",
        );
        let acc = LicenseAcceptance::with_groups(["@FREE", "-@OSI", "BSD"], &groups);
        assert!(acc.accepts("GPL-2"));
        assert!(acc.accepts("BSD"));
        assert!(!acc.accepts("MIT"));

        let acc = LicenseAcceptance::with_groups(["*", "-@MISSING"], &groups);
        assert!(acc.accepts("MIT"));
        assert_eq!(groups.expand("LOOP"), vec!["MIT"]);
    }

    #[test]
    fn missing_licenses() {
        let acc = LicenseAcceptance::new(["MIT"]);
        let expr = LicenseExpr::parse("MIT GPL-2 GPL-2").unwrap();
        assert_eq!(expr.missing(&acc, &flags(&[])), vec!["GPL-2"]);

        let expr = LicenseExpr::parse("|| ( BSD Apache-2.0 ) || ( MIT EULA )").unwrap();
        assert_eq!(expr.missing(&acc, &flags(&[])), vec!["BSD", "Apache-2.0"]);

        let expr = LicenseExpr::parse("!bindist? ( EULA ) MIT").unwrap();
        assert_eq!(expr.missing(&acc, &flags(&[])), vec!["EULA"]);
        assert!(expr.missing(&acc, &flags(&["bindist"])).is_empty());
    }
}
