use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// An EAPI this crate can evaluate metadata for.
///
/// Only the differences that show up in metadata values are modelled:
/// what `SRC_URI` and `IUSE` may contain.
///
/// See [PMS 2](https://projects.gentoo.org/pms/latest/pms.html#eapis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Eapi {
    Zero,
    /// IUSE defaults.
    One,
    /// SRC_URI arrows.
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    /// Selective URI restrictions.
    Eight,
    Nine,
}

impl Eapi {
    /// Every supported EAPI, oldest first.
    pub const ALL: [Eapi; 10] = [
        Eapi::Zero,
        Eapi::One,
        Eapi::Two,
        Eapi::Three,
        Eapi::Four,
        Eapi::Five,
        Eapi::Six,
        Eapi::Seven,
        Eapi::Eight,
        Eapi::Nine,
    ];

    /// Whether an EAPI string from extracted metadata is one this crate
    /// understands.
    ///
    /// A blank value means EAPI 0. Negated values (`-9`) are how the
    /// metadata cache records an EAPI that was too new at extraction time
    /// and are never supported.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::Eapi;
    ///
    /// assert!(Eapi::is_supported("8"));
    /// assert!(Eapi::is_supported(" "));
    /// assert!(!Eapi::is_supported("99"));
    /// assert!(!Eapi::is_supported("-99"));
    /// ```
    pub fn is_supported(eapi: &str) -> bool {
        Eapi::from_metadata(eapi).is_ok()
    }

    /// The EAPI named by a metadata value, blank meaning EAPI 0.
    pub fn from_metadata(value: &str) -> Result<Eapi> {
        match value.trim() {
            "" => Ok(Eapi::Zero),
            eapi => eapi.parse(),
        }
    }

    pub fn has_src_uri_arrows(&self) -> bool {
        *self >= Eapi::Two
    }

    pub fn has_selective_uri_restrictions(&self) -> bool {
        *self >= Eapi::Eight
    }

    fn number(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Eapi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl FromStr for Eapi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Eapi::ALL
            .into_iter()
            .find(|eapi| eapi.to_string() == s)
            .ok_or_else(|| Error::InvalidEapi(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        for (n, eapi) in Eapi::ALL.into_iter().enumerate() {
            assert_eq!(eapi.to_string(), n.to_string());
            assert_eq!(n.to_string().parse::<Eapi>(), Ok(eapi));
        }
        for bad in ["10", "", "foo", "07", "+7", "8 "] {
            assert_eq!(bad.parse::<Eapi>(), Err(Error::InvalidEapi(bad.to_string())));
        }
    }

    #[test]
    fn supported_strings() {
        for s in ["0", "5", "9", "", "  "] {
            assert!(Eapi::is_supported(s), "{s:?}");
        }
        for s in ["10", "99", "-7", "prefix", "1.0"] {
            assert!(!Eapi::is_supported(s), "{s:?}");
        }
    }

    #[test]
    fn metadata_values() {
        assert_eq!(Eapi::from_metadata(""), Ok(Eapi::Zero));
        assert_eq!(Eapi::from_metadata(" 7\n"), Ok(Eapi::Seven));
        assert_eq!(Eapi::from_metadata("-9"), Err(Error::InvalidEapi("-9".to_string())));
    }

    #[test]
    fn feature_queries() {
        assert!(!Eapi::One.has_src_uri_arrows());
        assert!(Eapi::Two.has_src_uri_arrows());
        assert!(!Eapi::Seven.has_selective_uri_restrictions());
        assert!(Eapi::Nine.has_selective_uri_restrictions());
    }
}
