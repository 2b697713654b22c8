//! Manifest signature verification.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::{Result, SignatureError};

const SIGNED_MESSAGE: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";

/// How much a Manifest signature has to prove, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VerifyPolicy {
    /// A signature block has to be present. Problems only warn.
    PresenceOnly,
    /// Marginal trust. Bad signatures are errors.
    Strict,
    /// Full trust from a signed keyring. Missing signatures are errors too.
    Severe,
}

impl VerifyPolicy {
    pub fn minimum_trust(self) -> TrustLevel {
        match self {
            VerifyPolicy::PresenceOnly => TrustLevel::Never,
            VerifyPolicy::Strict => TrustLevel::Marginal,
            VerifyPolicy::Severe => TrustLevel::Full,
        }
    }
}

/// Owner trust of the signing key, as reported by gpg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrustLevel {
    Never,
    Undefined,
    Marginal,
    Full,
    Ultimate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Signed {
        trust: TrustLevel,
        /// Whether the keyring the key came from is itself signed.
        keyring_signed: bool,
    },
    Missing,
    Invalid(String),
}

/// Checks the signature of one Manifest file.
pub trait SignatureChecker {
    fn check(&mut self, manifest: &Path) -> Result<SignatureStatus>;
}

/// Only looks for a complete clear-sign armor block. Never establishes
/// any trust.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmorChecker;

impl SignatureChecker for ArmorChecker {
    fn check(&mut self, manifest: &Path) -> Result<SignatureStatus> {
        let text = fs::read_to_string(manifest).map_err(|e| {
            SignatureError::Unverifiable(format!("{}: {e}", manifest.display()))
        })?;
        Ok(armor_status(&text))
    }
}

fn armor_status(text: &str) -> SignatureStatus {
    let mut lines = text.lines().map(str::trim_end);
    if !lines.any(|l| l == SIGNED_MESSAGE) {
        return SignatureStatus::Missing;
    }
    if !lines.any(|l| l == SIGNATURE_BEGIN) || !lines.any(|l| l == SIGNATURE_END) {
        return SignatureStatus::Invalid("truncated signature block".to_string());
    }
    SignatureStatus::Signed {
        trust: TrustLevel::Undefined,
        keyring_signed: false,
    }
}

/// Runs `gpg --verify` against a dedicated keyring.
///
/// The keyring counts as signed when `<keyring>.sig`, a detached signature
/// over the keyring file, verifies.
#[derive(Debug, Clone)]
pub struct GpgChecker {
    program: PathBuf,
    homedir: PathBuf,
    keyring: PathBuf,
    keyring_signed: Option<bool>,
}

impl GpgChecker {
    /// Checker using `gentoo.gpg` in `homedir`.
    pub fn new(homedir: &Path) -> Self {
        GpgChecker {
            program: PathBuf::from("gpg"),
            homedir: homedir.to_path_buf(),
            keyring: homedir.join("gentoo.gpg"),
            keyring_signed: None,
        }
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn keyring(mut self, keyring: impl Into<PathBuf>) -> Self {
        self.keyring = keyring.into();
        self.keyring_signed = None;
        self
    }

    fn run(&self, args: &[&OsStr]) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--homedir")
            .arg(&self.homedir)
            .arg("--no-default-keyring")
            .arg("--keyring")
            .arg(&self.keyring)
            .args(["--batch", "--status-fd", "1", "--verify"])
            .args(args)
            .output()
            .map_err(|e| {
                SignatureError::Unverifiable(format!("{}: {e}", self.program.display()))
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn keyring_signed(&mut self) -> Result<bool> {
        if let Some(signed) = self.keyring_signed {
            return Ok(signed);
        }
        let mut sig = self.keyring.clone().into_os_string();
        sig.push(".sig");
        let sig = PathBuf::from(sig);
        let signed = sig.is_file()
            && matches!(
                parse_status(&self.run(&[sig.as_os_str(), self.keyring.as_os_str()])?),
                SignatureStatus::Signed { .. }
            );
        debug!(keyring = %self.keyring.display(), signed, "checked keyring signature");
        self.keyring_signed = Some(signed);
        Ok(signed)
    }
}

impl SignatureChecker for GpgChecker {
    fn check(&mut self, manifest: &Path) -> Result<SignatureStatus> {
        match parse_status(&self.run(&[manifest.as_os_str()])?) {
            SignatureStatus::Signed { trust, .. } => Ok(SignatureStatus::Signed {
                trust,
                keyring_signed: self.keyring_signed()?,
            }),
            other => Ok(other),
        }
    }
}

/// Interpret `gpg --status-fd` output.
///
/// # Examples
///
/// ```
/// use portage_repo::{parse_status, SignatureStatus, TrustLevel};
///
/// let status = parse_status("[GNUPG:] GOODSIG 0123 Dev <dev@example.org>\n[GNUPG:] TRUST_FULLY 0 pgp\n");
/// assert_eq!(status, SignatureStatus::Signed { trust: TrustLevel::Full, keyring_signed: false });
/// assert_eq!(parse_status("[GNUPG:] NODATA 1\n"), SignatureStatus::Missing);
/// ```
pub fn parse_status(output: &str) -> SignatureStatus {
    let mut good = false;
    let mut trust = TrustLevel::Undefined;
    let mut nodata = false;
    for line in output.lines() {
        let Some(status) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let keyword = status.split_whitespace().next().unwrap_or_default();
        match keyword {
            "BADSIG" => return SignatureStatus::Invalid("bad signature".to_string()),
            "ERRSIG" => {
                return SignatureStatus::Invalid("signature could not be checked".to_string())
            }
            "GOODSIG" => good = true,
            "NODATA" => nodata = true,
            "TRUST_UNDEFINED" => trust = TrustLevel::Undefined,
            "TRUST_NEVER" => trust = TrustLevel::Never,
            "TRUST_MARGINAL" => trust = TrustLevel::Marginal,
            "TRUST_FULLY" => trust = TrustLevel::Full,
            "TRUST_ULTIMATE" => trust = TrustLevel::Ultimate,
            _ => {}
        }
    }
    match (good, nodata) {
        (true, _) => SignatureStatus::Signed {
            trust,
            keyring_signed: false,
        },
        (false, true) => SignatureStatus::Missing,
        (false, false) => SignatureStatus::Invalid("no signature status reported".to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStat {
    len: u64,
    mtime: SystemTime,
}

fn file_stat(path: &Path) -> std::io::Result<FileStat> {
    let meta = fs::metadata(path)?;
    Ok(FileStat {
        len: meta.len(),
        mtime: meta.modified()?,
    })
}

/// Applies a [`VerifyPolicy`] to the Manifests it is asked about.
///
/// A Manifest that verified is not checked again until its size or mtime
/// changes.
pub struct ManifestVerifier {
    policy: VerifyPolicy,
    checker: Box<dyn SignatureChecker>,
    verified: HashMap<PathBuf, FileStat>,
    missing_warned: HashSet<PathBuf>,
}

impl ManifestVerifier {
    pub fn new(policy: VerifyPolicy, checker: Box<dyn SignatureChecker>) -> Self {
        ManifestVerifier {
            policy,
            checker,
            verified: HashMap::new(),
            missing_warned: HashSet::new(),
        }
    }

    pub fn policy(&self) -> VerifyPolicy {
        self.policy
    }

    #[cfg(test)]
    pub(crate) fn missing_warnings(&self) -> usize {
        self.missing_warned.len()
    }

    /// Verify `manifest` under the policy.
    ///
    /// `Ok(true)` means the signature was checked and is good enough.
    /// `Ok(false)` means it was not, but the policy tolerates that.
    pub fn verify(&mut self, manifest: &Path) -> Result<bool> {
        let before = match file_stat(manifest) {
            Ok(stat) => stat,
            Err(err) => return self.unreadable(manifest, &err.to_string()),
        };
        if self.verified.get(manifest) == Some(&before) {
            return Ok(true);
        }

        let status = match self.checker.check(manifest) {
            Ok(status) => status,
            Err(err) => return self.unreadable(manifest, &err.to_string()),
        };

        let verified = match status {
            SignatureStatus::Signed {
                trust,
                keyring_signed,
            } => {
                let keyring_ok = self.policy < VerifyPolicy::Severe || keyring_signed;
                if trust < self.policy.minimum_trust() || !keyring_ok {
                    return Err(SignatureError::Untrusted(manifest.to_path_buf()).into());
                }
                true
            }
            SignatureStatus::Missing => {
                if self.policy == VerifyPolicy::Severe {
                    return Err(SignatureError::Missing(manifest.to_path_buf()).into());
                }
                if self.missing_warned.insert(manifest.to_path_buf()) {
                    warn!(manifest = %manifest.display(), "missing signature");
                }
                false
            }
            SignatureStatus::Invalid(reason) => {
                if self.policy >= VerifyPolicy::Strict {
                    return Err(SignatureError::Invalid {
                        path: manifest.to_path_buf(),
                        reason,
                    }
                    .into());
                }
                warn!(manifest = %manifest.display(), %reason, "invalid manifest signature");
                false
            }
        };

        if self.policy == VerifyPolicy::Severe && file_stat(manifest).ok() != Some(before) {
            return Err(SignatureError::Tampered(manifest.to_path_buf()).into());
        }
        if verified {
            self.verified.insert(manifest.to_path_buf(), before);
        }
        Ok(verified)
    }

    fn unreadable(&self, manifest: &Path, reason: &str) -> Result<bool> {
        if self.policy >= VerifyPolicy::Strict {
            return Err(SignatureError::Unverifiable(format!(
                "{}: {reason}",
                manifest.display()
            ))
            .into());
        }
        warn!(manifest = %manifest.display(), %reason, "manifest is missing or inaccessible");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::error::Error;

    /// Returns a fixed status and optionally rewrites the file while
    /// "checking" it.
    struct Fixed {
        status: SignatureStatus,
        calls: Rc<Cell<usize>>,
        tamper: bool,
    }

    impl Fixed {
        fn new(status: SignatureStatus) -> (Self, Rc<Cell<usize>>) {
            let calls = Rc::new(Cell::new(0));
            let checker = Fixed {
                status,
                calls: calls.clone(),
                tamper: false,
            };
            (checker, calls)
        }
    }

    impl SignatureChecker for Fixed {
        fn check(&mut self, manifest: &Path) -> Result<SignatureStatus> {
            self.calls.set(self.calls.get() + 1);
            if self.tamper {
                fs::write(manifest, "DIST evil 1 SHA256 00\nand more\n").unwrap();
            }
            Ok(self.status.clone())
        }
    }

    fn signed(trust: TrustLevel, keyring_signed: bool) -> SignatureStatus {
        SignatureStatus::Signed {
            trust,
            keyring_signed,
        }
    }

    fn manifest() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Manifest");
        fs::write(&path, "DIST foo-1.0.tar.gz 3 SHA256 00\n").unwrap();
        (dir, path)
    }

    fn verify(policy: VerifyPolicy, status: SignatureStatus) -> Result<bool> {
        let (_dir, path) = manifest();
        let (checker, _) = Fixed::new(status);
        ManifestVerifier::new(policy, Box::new(checker)).verify(&path)
    }

    #[test]
    fn trust_thresholds() {
        use TrustLevel::*;
        use VerifyPolicy::*;

        assert_eq!(verify(PresenceOnly, signed(Undefined, false)), Ok(true));
        assert!(matches!(
            verify(Strict, signed(Undefined, false)),
            Err(Error::Signature(SignatureError::Untrusted(_)))
        ));
        assert_eq!(verify(Strict, signed(Marginal, false)), Ok(true));
        assert!(matches!(
            verify(Severe, signed(Marginal, true)),
            Err(Error::Signature(SignatureError::Untrusted(_)))
        ));
        assert!(matches!(
            verify(Severe, signed(Ultimate, false)),
            Err(Error::Signature(SignatureError::Untrusted(_)))
        ));
        assert_eq!(verify(Severe, signed(Full, true)), Ok(true));
    }

    #[test]
    fn missing_and_invalid() {
        use VerifyPolicy::*;

        assert_eq!(verify(PresenceOnly, SignatureStatus::Missing), Ok(false));
        assert_eq!(verify(Strict, SignatureStatus::Missing), Ok(false));
        assert!(matches!(
            verify(Severe, SignatureStatus::Missing),
            Err(Error::Signature(SignatureError::Missing(_)))
        ));

        let invalid = SignatureStatus::Invalid("bad".to_string());
        assert_eq!(verify(PresenceOnly, invalid.clone()), Ok(false));
        assert!(matches!(
            verify(Strict, invalid.clone()),
            Err(Error::Signature(SignatureError::Invalid { .. }))
        ));
        assert!(matches!(
            verify(Severe, invalid),
            Err(Error::Signature(SignatureError::Invalid { .. }))
        ));
    }

    #[test]
    fn missing_warns_once() {
        let (_dir, path) = manifest();
        let (checker, calls) = Fixed::new(SignatureStatus::Missing);
        let mut verifier = ManifestVerifier::new(VerifyPolicy::Strict, Box::new(checker));
        assert_eq!(verifier.verify(&path), Ok(false));
        assert_eq!(verifier.verify(&path), Ok(false));
        assert_eq!(verifier.missing_warned.len(), 1);
        // unsigned manifests are checked every time
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn verified_stat_is_cached() {
        let (_dir, path) = manifest();
        let (checker, calls) = Fixed::new(signed(TrustLevel::Full, true));
        let mut verifier = ManifestVerifier::new(VerifyPolicy::Severe, Box::new(checker));
        assert_eq!(verifier.verify(&path), Ok(true));
        assert_eq!(verifier.verify(&path), Ok(true));
        assert_eq!(calls.get(), 1);

        fs::write(&path, "DIST foo-1.0.tar.gz 30 SHA256 00\n").unwrap();
        assert_eq!(verifier.verify(&path), Ok(true));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn severe_detects_tampering() {
        let (_dir, path) = manifest();
        let (mut checker, _) = Fixed::new(signed(TrustLevel::Full, true));
        checker.tamper = true;
        let mut verifier = ManifestVerifier::new(VerifyPolicy::Severe, Box::new(checker));
        assert!(matches!(
            verifier.verify(&path),
            Err(Error::Signature(SignatureError::Tampered(_)))
        ));
    }

    #[test]
    fn unreadable_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Manifest");
        let mut lenient = ManifestVerifier::new(VerifyPolicy::PresenceOnly, Box::new(ArmorChecker));
        assert_eq!(lenient.verify(&path), Ok(false));
        let mut strict = ManifestVerifier::new(VerifyPolicy::Strict, Box::new(ArmorChecker));
        assert!(matches!(
            strict.verify(&path),
            Err(Error::Signature(SignatureError::Unverifiable(_)))
        ));
    }

    #[test]
    fn armor_detection() {
        assert_eq!(armor_status("DIST a 1 SHA256 00\n"), SignatureStatus::Missing);
        assert!(matches!(
            armor_status(&format!("{SIGNED_MESSAGE}\nHash: SHA512\n\nDIST a 1\n")),
            SignatureStatus::Invalid(_)
        ));
        let full = format!(
            "{SIGNED_MESSAGE}\nHash: SHA512\n\nDIST a 1\n{SIGNATURE_BEGIN}\n\nabc\n{SIGNATURE_END}\n"
        );
        assert_eq!(armor_status(&full), signed(TrustLevel::Undefined, false));
    }

    #[test]
    fn gpg_status_lines() {
        assert_eq!(
            parse_status("[GNUPG:] NEWSIG\n[GNUPG:] BADSIG 0123 Dev\n"),
            SignatureStatus::Invalid("bad signature".to_string())
        );
        assert!(matches!(
            parse_status("[GNUPG:] ERRSIG 0123 1 8 01 1700000000 9\n"),
            SignatureStatus::Invalid(_)
        ));
        assert_eq!(
            parse_status("[GNUPG:] GOODSIG 0123 Dev\n[GNUPG:] TRUST_MARGINAL 0 pgp\n"),
            signed(TrustLevel::Marginal, false)
        );
        assert_eq!(
            parse_status("[GNUPG:] GOODSIG 0123 Dev\n"),
            signed(TrustLevel::Undefined, false)
        );
        assert!(matches!(parse_status(""), SignatureStatus::Invalid(_)));
    }

    #[test]
    fn gpg_not_installed() {
        let (_dir, path) = manifest();
        let mut checker = GpgChecker::new(Path::new("/nonexistent")).program("/nonexistent/gpg");
        assert!(matches!(
            checker.check(&path),
            Err(Error::Signature(SignatureError::Unverifiable(_)))
        ));
    }
}
