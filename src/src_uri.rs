use std::collections::HashSet;
use std::fmt;

use winnow::ascii::multispace0;
use winnow::combinator::{cut_err, opt, peek, preceded, repeat, terminated};
use winnow::error::StrContext;
use winnow::prelude::*;

use crate::depspec::{end_of_group, exactly, parenthesized, use_conditional, word};
use crate::eapi::Eapi;
use crate::error::{Error, Result};

/// `fetch+` / `mirror+` URI prefixes (EAPI 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UriRestriction {
    Fetch,
    Mirror,
}

impl fmt::Display for UriRestriction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            UriRestriction::Fetch => "fetch",
            UriRestriction::Mirror => "mirror",
        })
    }
}

/// One URI of a `SRC_URI`, optionally renamed with `-> filename`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriSpec {
    pub url: String,
    pub rename: Option<String>,
    pub restriction: Option<UriRestriction>,
}

impl UriSpec {
    /// The name the file is stored under in `DISTDIR`: the rename target,
    /// or the last path component of the URI. Empty for URIs ending in `/`.
    pub fn filename(&self) -> &str {
        match &self.rename {
            Some(target) => target,
            None => self.url.rsplit('/').next().unwrap_or(&self.url),
        }
    }

    fn from_word(word: &str) -> UriSpec {
        let (restriction, url) = if let Some(url) = word.strip_prefix("fetch+") {
            (Some(UriRestriction::Fetch), url)
        } else if let Some(url) = word.strip_prefix("mirror+") {
            (Some(UriRestriction::Mirror), url)
        } else {
            (None, word)
        };
        UriSpec {
            url: url.to_string(),
            rename: None,
            restriction,
        }
    }
}

/// A node of a `SRC_URI` value.
///
/// See [PMS 7.3.2](https://projects.gentoo.org/pms/9/pms.html#srcuri).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrcUriEntry {
    Uri(UriSpec),
    /// `[!]flag? ( ... )`
    Conditional {
        flag: String,
        negated: bool,
        entries: Vec<SrcUriEntry>,
    },
    /// `( ... )`
    Group(Vec<SrcUriEntry>),
}

/// One file to download, after USE reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub url: String,
    /// Local filename in `DISTDIR`.
    pub filename: String,
}

impl SrcUriEntry {
    /// Parse a `SRC_URI` value.
    ///
    /// Tokens are whitespace separated, parentheses included. Malformed
    /// groups and conditionals are `InvalidDependency` errors.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::SrcUriEntry;
    ///
    /// let entries = SrcUriEntry::parse(
    ///     "https://example.com/foo-1.0.tar.gz ssl? ( https://example.com/ssl.patch )"
    /// ).unwrap();
    /// assert_eq!(entries.len(), 2);
    /// assert!(SrcUriEntry::parse("ssl? https://example.com/ssl.patch").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Vec<SrcUriEntry>> {
        terminated(entries, multispace0)
            .parse(input)
            .map_err(|e| Error::InvalidDependency(format!("SRC_URI: {e}")))
    }

    /// Reduce USE-conditional groups and flatten to downloads, in order.
    ///
    /// With `use_flags == None` every conditional branch is taken, which
    /// yields every file the package could ever need.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashSet;
    /// use portage_repo::SrcUriEntry;
    ///
    /// let entries = SrcUriEntry::parse(
    ///     "https://example.com/a.tar.gz doc? ( https://example.com/doc.tar.gz )"
    /// ).unwrap();
    /// assert_eq!(SrcUriEntry::reduce(&entries, Some(&HashSet::new())).unwrap().len(), 1);
    /// assert_eq!(SrcUriEntry::reduce(&entries, None).unwrap().len(), 2);
    /// ```
    pub fn reduce(
        entries: &[SrcUriEntry],
        use_flags: Option<&HashSet<String>>,
    ) -> Result<Vec<Download>> {
        let mut out = Vec::new();
        reduce_into(entries, use_flags, &mut out)?;
        Ok(out)
    }

    /// Reject syntax the package's EAPI does not allow.
    pub fn check_eapi(entries: &[SrcUriEntry], eapi: Eapi) -> Result<()> {
        for entry in entries {
            match entry {
                SrcUriEntry::Uri(spec) => {
                    if spec.restriction.is_some() && !eapi.has_selective_uri_restrictions() {
                        return Err(Error::InvalidSrcUri(format!(
                            "'{entry}': URI restrictions need EAPI 8, package uses EAPI {eapi}"
                        )));
                    }
                    if spec.rename.is_some() && !eapi.has_src_uri_arrows() {
                        return Err(Error::InvalidSrcUri(format!(
                            "'{entry}': arrows need EAPI 2, package uses EAPI {eapi}"
                        )));
                    }
                }
                SrcUriEntry::Conditional { entries, .. } | SrcUriEntry::Group(entries) => {
                    Self::check_eapi(entries, eapi)?;
                }
            }
        }
        Ok(())
    }
}

fn reduce_into(
    entries: &[SrcUriEntry],
    use_flags: Option<&HashSet<String>>,
    out: &mut Vec<Download>,
) -> Result<()> {
    for entry in entries {
        match entry {
            SrcUriEntry::Uri(spec) => {
                let filename = spec.filename();
                if filename.is_empty() {
                    return Err(Error::InvalidDependency(format!(
                        "URI has no basename: '{}'",
                        spec.url
                    )));
                }
                out.push(Download {
                    url: spec.url.clone(),
                    filename: filename.to_string(),
                });
            }
            SrcUriEntry::Conditional {
                flag,
                negated,
                entries,
            } => {
                let taken = use_flags.map_or(true, |flags| flags.contains(flag) != *negated);
                if taken {
                    reduce_into(entries, use_flags, out)?;
                }
            }
            SrcUriEntry::Group(entries) => reduce_into(entries, use_flags, out)?,
        }
    }
    Ok(())
}

fn write_group(f: &mut fmt::Formatter, entries: &[SrcUriEntry]) -> fmt::Result {
    f.write_str("(")?;
    for entry in entries {
        write!(f, " {entry}")?;
    }
    f.write_str(" )")
}

impl fmt::Display for SrcUriEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SrcUriEntry::Uri(spec) => {
                if let Some(restriction) = spec.restriction {
                    write!(f, "{restriction}+")?;
                }
                f.write_str(&spec.url)?;
                if let Some(target) = &spec.rename {
                    write!(f, " -> {target}")?;
                }
                Ok(())
            }
            SrcUriEntry::Conditional { flag, negated, entries } => {
                if *negated {
                    f.write_str("!")?;
                }
                write!(f, "{flag}? ")?;
                write_group(f, entries)
            }
            SrcUriEntry::Group(entries) => write_group(f, entries),
        }
    }
}

// Winnow parsers

fn entries(input: &mut &str) -> ModalResult<Vec<SrcUriEntry>> {
    repeat(0.., entry).parse_next(input)
}

fn entry(input: &mut &str) -> ModalResult<SrcUriEntry> {
    match peek(word).parse_next(input)? {
        ")" => end_of_group(),
        "(" => parenthesized(entries).map(SrcUriEntry::Group).parse_next(input),
        w if w.ends_with('?') => use_conditional(entries)
            .map(|(flag, negated, entries)| SrcUriEntry::Conditional {
                flag,
                negated,
                entries,
            })
            .parse_next(input),
        _ => uri(input),
    }
}

fn uri(input: &mut &str) -> ModalResult<SrcUriEntry> {
    let mut spec = word
        .verify(|w: &str| w != "->")
        .map(UriSpec::from_word)
        .parse_next(input)?;
    let target = opt(preceded(
        exactly("->"),
        cut_err(word.verify(|w: &str| !w.contains('/') && w != "(" && w != ")"))
            .context(StrContext::Label("filename after '->'")),
    ))
    .parse_next(input)?;
    spec.rename = target.map(str::to_string);
    Ok(SrcUriEntry::Uri(spec))
}
