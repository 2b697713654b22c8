use std::fmt;
use std::str::FromStr;

use crate::eapi::Eapi;
use crate::error::{Error, Result};

/// Default state of an IUSE flag: `+flag` or `-flag`.
///
/// See [PMS 7.2](https://projects.gentoo.org/pms/9/pms.html#mandatory-ebuilddefined-variables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IUseDefault {
    Enabled,
    Disabled,
}

/// One entry of a package's `IUSE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IUse {
    pub name: String,
    pub default: Option<IUseDefault>,
}

impl IUse {
    /// Parse a whitespace-separated `IUSE` value.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::{IUse, IUseDefault};
    ///
    /// let flags = IUse::parse_line("+ssl -debug python_targets_python3_12").unwrap();
    /// assert_eq!(flags[0].default, Some(IUseDefault::Enabled));
    /// assert_eq!(flags[1].name, "debug");
    /// assert_eq!(flags[2].default, None);
    /// ```
    pub fn parse_line(input: &str) -> Result<Vec<IUse>> {
        input.split_whitespace().map(str::parse).collect()
    }

    /// The incremental USE token this entry contributes before any
    /// configuration is applied: `flag`, `-flag`, or nothing.
    pub fn default_token(&self) -> Option<String> {
        match self.default? {
            IUseDefault::Enabled => Some(self.name.clone()),
            IUseDefault::Disabled => Some(format!("-{}", self.name)),
        }
    }

    /// Reject IUSE defaults in EAPI 0, which predates them.
    pub fn check_eapi(flags: &[IUse], eapi: Eapi) -> Result<()> {
        if eapi >= Eapi::One {
            return Ok(());
        }
        match flags.iter().find(|flag| flag.default.is_some()) {
            Some(flag) => Err(Error::InvalidIUse(format!(
                "'{flag}': IUSE defaults need EAPI 1, package uses EAPI {eapi}"
            ))),
            None => Ok(()),
        }
    }
}

/// PMS 3.1.4: alphanumerics, `+ _ @ -`, not starting with one of the
/// punctuation characters.
pub(crate) fn is_valid_flag_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '@' | '-'))
}

impl FromStr for IUse {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, default) = match s.as_bytes().first() {
            Some(b'+') => (&s[1..], Some(IUseDefault::Enabled)),
            Some(b'-') => (&s[1..], Some(IUseDefault::Disabled)),
            _ => (s, None),
        };
        if !is_valid_flag_name(name) {
            return Err(Error::InvalidIUse(s.to_string()));
        }
        Ok(IUse {
            name: name.to_string(),
            default,
        })
    }
}

impl fmt::Display for IUse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.default {
            Some(IUseDefault::Enabled) => write!(f, "+{}", self.name),
            Some(IUseDefault::Disabled) => write!(f, "-{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_become_tokens() {
        let flags = IUse::parse_line("+ssl -debug\ttest").unwrap();
        let tokens: Vec<_> = flags.iter().filter_map(IUse::default_token).collect();
        assert_eq!(tokens, vec!["ssl", "-debug"]);
        assert_eq!(flags[2].to_string(), "test");
    }

    #[test]
    fn flag_names() {
        for ok in ["a", "python_targets_python3_11", "l10n_pt-BR", "gtk+", "x@y", "3dnow"] {
            assert!(ok.parse::<IUse>().is_ok(), "{ok}");
        }
        for bad in ["", "+", "-", "_foo", "+@foo", "foo?", "b!r"] {
            assert!(matches!(bad.parse::<IUse>(), Err(Error::InvalidIUse(_))), "{bad}");
        }
        assert!(IUse::parse_line("").unwrap().is_empty());
        assert!(IUse::parse_line("ok +-bad").is_err());
    }

    #[test]
    fn eapi_gating() {
        let flags = IUse::parse_line("ssl +doc").unwrap();
        assert!(IUse::check_eapi(&flags, Eapi::Zero).is_err());
        assert!(IUse::check_eapi(&flags, Eapi::One).is_ok());
        assert!(IUse::check_eapi(&flags[..1], Eapi::Zero).is_ok());
    }
}
