use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

use crate::error::{Error, Result};

/// Type of a Manifest2 entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A distfile from `SRC_URI`.
    Dist,
    Ebuild,
    /// A file under `files/`.
    Aux,
    Misc,
}

impl FromStr for EntryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DIST" => Ok(EntryKind::Dist),
            "EBUILD" => Ok(EntryKind::Ebuild),
            "AUX" => Ok(EntryKind::Aux),
            "MISC" => Ok(EntryKind::Misc),
            _ => Err(Error::InvalidManifest(format!("unknown entry type: {s}"))),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            EntryKind::Dist => "DIST",
            EntryKind::Ebuild => "EBUILD",
            EntryKind::Aux => "AUX",
            EntryKind::Misc => "MISC",
        })
    }
}

/// One Manifest line: `<TYPE> <name> <size> (<HASH> <hex>)*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub kind: EntryKind,
    pub name: String,
    pub size: u64,
    /// Hash name to lowercase hex digest.
    pub hashes: BTreeMap<String, String>,
}

impl ManifestEntry {
    /// Whether the file at `path` has the declared size and every
    /// supported digest. A missing file does not verify.
    ///
    /// Hashes other than `SHA256` and `SHA512` are not checked. The file
    /// is only read when its size is right, and then in a single pass.
    pub fn verify_file(&self, path: &Path) -> Result<bool> {
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(Error::io(path, err)),
        };
        if len != self.size {
            debug!(file = %self.name, expected = self.size, actual = len, "size mismatch");
            return Ok(false);
        }

        let mut names = Vec::new();
        let mut hashers = Vec::new();
        for name in self.hashes.keys() {
            match FileHasher::named(name) {
                Some(hasher) => {
                    names.push(name);
                    hashers.push(hasher);
                }
                None => debug!(file = %self.name, hash = %name, "skipping unsupported hash"),
            }
        }
        if hashers.is_empty() {
            return Ok(true);
        }

        let digests = hash_file(path, hashers).map_err(|e| Error::io(path, e))?;
        for (name, actual) in names.into_iter().zip(digests) {
            if actual != self.hashes[name] {
                debug!(file = %self.name, hash = %name, "digest mismatch");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A running digest of one of the supported Manifest hashes.
pub(crate) enum FileHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl FileHasher {
    /// The hasher for a Manifest hash name, if supported.
    pub(crate) fn named(name: &str) -> Option<FileHasher> {
        match name {
            "SHA256" => Some(FileHasher::Sha256(Sha256::new())),
            "SHA512" => Some(FileHasher::Sha512(Sha512::new())),
            _ => None,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            FileHasher::Sha256(hasher) => hasher.update(data),
            FileHasher::Sha512(hasher) => hasher.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            FileHasher::Sha256(hasher) => hex::encode(hasher.finalize()),
            FileHasher::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Stream `path` through every hasher in 64 KiB chunks and return the hex
/// digests in the same order.
pub(crate) fn hash_file(path: &Path, mut hashers: Vec<FileHasher>) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        for hasher in &mut hashers {
            hasher.update(&buffer[..read]);
        }
    }
    Ok(hashers.into_iter().map(FileHasher::finish).collect())
}

pub(crate) fn sha256_file(path: &Path) -> io::Result<String> {
    let digests = hash_file(path, vec![FileHasher::Sha256(Sha256::new())])?;
    Ok(digests.concat())
}

/// A parsed Manifest2 file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse Manifest text. A PGP clear-sign wrapper is stripped first.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::Manifest;
    ///
    /// let manifest = Manifest::parse(
    ///     "DIST foo-1.0.tar.gz 1000 BLAKE2B 00ff SHA512 abcd\nEBUILD foo-1.0.ebuild 512 SHA512 1234\n",
    /// ).unwrap();
    /// assert_eq!(manifest.dist("foo-1.0.tar.gz").unwrap().size, 1000);
    /// assert_eq!(manifest.dist_digests().count(), 1);
    /// ```
    pub fn parse(text: &str) -> Result<Manifest> {
        let mut entries = Vec::new();
        for line in strip_armor(text) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            entries.push(parse_line(line)?);
        }
        Ok(Manifest { entries })
    }

    pub fn load(path: &Path) -> Result<Manifest> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Manifest::parse(&text)
    }

    /// `DIST` entries: the distfile digests.
    pub fn dist_digests(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Dist)
    }

    pub fn dist(&self, name: &str) -> Option<&ManifestEntry> {
        self.dist_digests().find(|e| e.name == name)
    }
}

fn parse_line(line: &str) -> Result<ManifestEntry> {
    let invalid = || Error::InvalidManifest(line.to_string());
    let mut tokens = line.split_whitespace();
    let kind: EntryKind = tokens.next().ok_or_else(invalid)?.parse()?;
    let name = tokens.next().ok_or_else(invalid)?.to_string();
    let size = tokens
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(invalid)?;
    let rest: Vec<&str> = tokens.collect();
    if rest.len() % 2 != 0 {
        return Err(invalid());
    }
    let hashes = rest
        .chunks(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_ascii_lowercase()))
        .collect();
    Ok(ManifestEntry {
        kind,
        name,
        size,
        hashes,
    })
}

/// Lines of the signed body, or every line when the text is not signed.
fn strip_armor(text: &str) -> Vec<&str> {
    let mut lines = text.lines().skip_while(|l| l.trim().is_empty()).peekable();
    if lines.peek().map(|l| l.trim_end()) != Some("-----BEGIN PGP SIGNED MESSAGE-----") {
        return text.lines().collect();
    }
    // armor headers end at the first blank line
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
    }
    lines
        .take_while(|l| l.trim_end() != "-----BEGIN PGP SIGNATURE-----")
        .map(|l| l.strip_prefix("- ").unwrap_or(l))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNED: &str = "\
-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA512

DIST foo-1.0.tar.gz 3 SHA256 BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD
- EBUILD foo-1.0.ebuild 10 SHA256 00
-----BEGIN PGP SIGNATURE-----

iQIzBAEBCgAdFiEE
-----END PGP SIGNATURE-----
";

    #[test]
    fn signed_manifest() {
        let manifest = Manifest::parse(SIGNED).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[1].kind, EntryKind::Ebuild);
        let dist = manifest.dist("foo-1.0.tar.gz").unwrap();
        assert_eq!(dist.size, 3);
        assert!(dist.hashes["SHA256"].starts_with("ba7816bf"));
    }

    #[test]
    fn malformed_lines() {
        for line in [
            "DIST foo",
            "DIST foo big SHA256 00",
            "DIST foo 1 SHA256",
            "CHECKSUM foo 1",
        ] {
            assert!(matches!(Manifest::parse(line), Err(Error::InvalidManifest(_))), "{line}");
        }
    }

    #[test]
    fn verify_files() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::parse(SIGNED).unwrap();
        let dist = manifest.dist("foo-1.0.tar.gz").unwrap();
        let path = dir.path().join("foo-1.0.tar.gz");

        assert_eq!(dist.verify_file(&path), Ok(false));
        fs::write(&path, "abc").unwrap();
        assert_eq!(dist.verify_file(&path), Ok(true));
        fs::write(&path, "abd").unwrap();
        assert_eq!(dist.verify_file(&path), Ok(false));
        fs::write(&path, "abcd").unwrap();
        assert_eq!(dist.verify_file(&path), Ok(false));
    }

    #[test]
    fn large_files_are_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.tar");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        let text = format!(
            "DIST big.tar {} SHA256 {} SHA512 {} BLAKE2B 00\n",
            content.len(),
            hex::encode(Sha256::digest(&content)),
            hex::encode(Sha512::digest(&content)),
        );
        let manifest = Manifest::parse(&text).unwrap();
        assert_eq!(manifest.dist("big.tar").unwrap().verify_file(&path), Ok(true));

        let mut changed = content.clone();
        changed[150_000] ^= 1;
        fs::write(&path, &changed).unwrap();
        assert_eq!(manifest.dist("big.tar").unwrap().verify_file(&path), Ok(false));

        let digests = hash_file(&path, vec![FileHasher::Sha256(Sha256::new())]).unwrap();
        assert_eq!(digests, vec![hex::encode(Sha256::digest(&changed))]);
    }

    #[test]
    fn unsupported_hashes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        fs::write(&path, "abc").unwrap();
        let manifest = Manifest::parse("DIST a 3 BLAKE2B 0000\n").unwrap();
        assert_eq!(manifest.dist("a").unwrap().verify_file(&path), Ok(true));
    }
}
