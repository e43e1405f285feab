//! Subresource Integrity (SRI) strings: parsing, canonical formatting,
//! and digest verification.
//!
//! An SRI string is a whitespace-separated list of
//! `algorithm-base64digest[?option…]` tokens.  An [`Integrity`] is the
//! parsed set of those tokens for one underlying byte sequence, possibly
//! covering several algorithms; verification picks the strongest
//! algorithm both sides understand and compares digests under it.
//!
//! Parsing is lenient by default: malformed tokens are dropped and
//! unrecognized algorithms are retained.  Strict mode additionally
//! restricts tokens to the W3C SRI grammar (sha256/sha384/sha512,
//! RFC 4648 base64, VCHAR options).
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::Md5;
use sha1::Sha1;
use sha2::digest::DynDigest;
use sha2::Digest;
use sha2::Sha224;
use sha2::Sha256;
use sha2::Sha384;
use sha2::Sha512;

use crate::errors::Error;
use crate::errors::Result;

/// The algorithm used when a caller does not ask for anything specific.
pub const DEFAULT_ALGORITHM: &str = "sha512";

/// Known algorithms from weakest to strongest.  `pick_algorithm` scores
/// an algorithm by its position in this list; anything unknown scores
/// below everything known.
const PRIORITY: [&str; 7] = [
    "md5", "whirlpool", "sha1", "sha224", "sha256", "sha384", "sha512",
];

/// Read files in chunks of this size when verifying without buffering.
const CHUNK_SIZE: usize = 64 * 1024;

fn priority_of(algorithm: &str) -> i32 {
    PRIORITY
        .iter()
        .position(|known| *known == algorithm)
        .map_or(-1, |index| index as i32)
}

/// Returns a running hasher for `algorithm`, or `NoSuchAlgorithm` when
/// this build cannot compute it.  `whirlpool` is deliberately absent:
/// it can be parsed and ranked, but not produced.
fn hasher_for(algorithm: &str) -> Result<Box<dyn DynDigest>> {
    match algorithm {
        "md5" => Ok(Box::new(Md5::new())),
        "sha1" => Ok(Box::new(Sha1::new())),
        "sha224" => Ok(Box::new(Sha224::new())),
        "sha256" => Ok(Box::new(Sha256::new())),
        "sha384" => Ok(Box::new(Sha384::new())),
        "sha512" => Ok(Box::new(Sha512::new())),
        other => Err(Error::NoSuchAlgorithm(other.to_string())),
    }
}

/// A single parsed `algorithm-digest[?option…]` token.
#[derive(Clone, Debug)]
pub struct Hash {
    /// The token this hash was parsed from, or the canonical form for
    /// computed hashes.  Kept for error reporting.
    pub source: String,
    /// The algorithm identifier.  Free-form unless parsed strictly.
    pub algorithm: String,
    /// The digest in base64, exactly as it appears in the SRI string.
    pub digest: String,
    /// Any `?`-separated options attached to the token.
    pub options: Vec<String>,
}

impl Hash {
    /// Parses the first whitespace-separated token of `input` as a
    /// single hash.  Returns `None` when no token survives parsing.
    pub fn parse(input: &str, strict: bool) -> Option<Hash> {
        input
            .split_whitespace()
            .find_map(|token| Hash::parse_token(token, strict))
    }

    /// Parses one token.  The base grammar is
    /// `algorithm "-" digest ["?" options]`; strict mode further
    /// constrains each part.
    fn parse_token(token: &str, strict: bool) -> Option<Hash> {
        let (algorithm, rest) = token.split_once('-')?;
        if algorithm.is_empty() || rest.is_empty() {
            return None;
        }

        let (digest, options) = match rest.split_once('?') {
            Some((digest, tail)) => (digest, tail.split('?').map(String::from).collect()),
            None => (rest, Vec::new()),
        };
        if digest.is_empty() {
            return None;
        }

        if strict && !Hash::strict_token_ok(algorithm, digest, &options) {
            return None;
        }

        Some(Hash {
            source: token.to_string(),
            algorithm: algorithm.to_string(),
            digest: digest.to_string(),
            options,
        })
    }

    fn strict_token_ok(algorithm: &str, digest: &str, options: &[String]) -> bool {
        let known = matches!(algorithm, "sha256" | "sha384" | "sha512");
        let base64_ok = digest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=');
        let options_ok = options
            .iter()
            .all(|option| option.bytes().all(|b| (0x21..=0x7e).contains(&b)));

        known && base64_ok && options_ok
    }

    /// Returns the digest as lowercase hex.
    pub fn hexdigest(&self) -> Result<String> {
        let raw = BASE64.decode(&self.digest).map_err(|_| {
            Error::BadArgument(format!("`{}` is not a base64 digest", self.source))
        })?;
        Ok(hex::encode(raw))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, self.digest)?;
        for option in &self.options {
            write!(f, "?{}", option)?;
        }
        Ok(())
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Hash) -> bool {
        self.algorithm == other.algorithm
            && self.digest == other.digest
            && self.options == other.options
    }
}

impl Eq for Hash {}

/// A parsed SRI value: an ordered set of [`Hash`]es for the same bytes.
#[derive(Clone, Debug, Default)]
pub struct Integrity {
    /// The hashes in the order they were parsed or computed.
    pub hashes: Vec<Hash>,
}

impl Integrity {
    /// Parses a whole SRI string.  Tokens that fail to parse are
    /// dropped; the result may be empty.
    pub fn parse(input: &str, strict: bool) -> Integrity {
        let hashes = input
            .split_whitespace()
            .filter_map(|token| Hash::parse_token(token, strict))
            .collect();
        Integrity { hashes }
    }

    /// Digests `data` under each of `algorithms` (default
    /// [`DEFAULT_ALGORITHM`] when empty), attaching `options` to every
    /// resulting hash.
    pub fn from_data(data: &[u8], algorithms: &[&str], options: &[&str]) -> Result<Integrity> {
        let default = [DEFAULT_ALGORITHM];
        let algorithms: &[&str] = if algorithms.is_empty() {
            &default
        } else {
            algorithms
        };

        let mut hashes = Vec::with_capacity(algorithms.len());
        for algorithm in algorithms {
            let mut hasher = hasher_for(algorithm)?;
            hasher.update(data);
            let digest = BASE64.encode(hasher.finalize());
            hashes.push(Integrity::computed_hash(algorithm, digest, options));
        }

        Ok(Integrity { hashes })
    }

    /// Builds a single-hash `Integrity` from a hex digest, re-encoding
    /// it into the base64 the SRI form requires.
    pub fn from_hex(hex_digest: &str, algorithm: &str, options: &[&str]) -> Result<Integrity> {
        let raw = hex::decode(hex_digest)
            .map_err(|_| Error::BadArgument(format!("`{}` is not a hex digest", hex_digest)))?;
        let digest = BASE64.encode(raw);
        Ok(Integrity {
            hashes: vec![Integrity::computed_hash(algorithm, digest, options)],
        })
    }

    fn computed_hash(algorithm: &str, digest: String, options: &[&str]) -> Hash {
        let mut hash = Hash {
            source: String::new(),
            algorithm: algorithm.to_string(),
            digest,
            options: options.iter().map(|option| option.to_string()).collect(),
        };
        hash.source = hash.to_string();
        hash
    }

    /// True when no token survived parsing.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Picks the strongest algorithm in this set under the default
    /// priority ordering.
    pub fn pick_algorithm(&self) -> Result<&str> {
        self.pick_algorithm_with(priority_of)
    }

    /// Picks the algorithm maximizing `priority`.  Ties are broken by
    /// the insertion order of the first hash of each algorithm.
    pub fn pick_algorithm_with(&self, priority: impl Fn(&str) -> i32) -> Result<&str> {
        let mut best: Option<(&str, i32)> = None;
        for hash in &self.hashes {
            let score = priority(&hash.algorithm);
            // Strict comparison keeps the earliest algorithm on ties.
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((&hash.algorithm, score));
            }
        }

        best.map(|(algorithm, _)| algorithm)
            .ok_or_else(|| Error::BadArgument("cannot pick an algorithm: empty integrity".into()))
    }

    /// Checks `data` against this integrity, returning the matching
    /// hash.  When `size` is given, the byte count is checked first.
    pub fn check_data(&self, data: &[u8], size: Option<u64>) -> Result<&Hash> {
        if let Some(expected) = size {
            if data.len() as u64 != expected {
                return Err(Error::SizeMismatch {
                    expected,
                    found: data.len() as u64,
                });
            }
        }

        let algorithm = self.pick_algorithm()?;
        let mut hasher = hasher_for(algorithm)?;
        hasher.update(data);
        let digest = BASE64.encode(hasher.finalize());
        self.find_match(algorithm, &digest)
    }

    /// Streaming variant of [`Integrity::check_data`]: reads the file at
    /// `path` chunk by chunk instead of buffering it.
    pub fn check_file(&self, path: &Path, size: Option<u64>) -> Result<&Hash> {
        let algorithm = self.pick_algorithm()?;
        let mut hasher = hasher_for(algorithm)?;

        let mut file = File::open(path)?;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let count = file.read(&mut chunk)?;
            if count == 0 {
                break;
            }

            hasher.update(&chunk[..count]);
            total += count as u64;
        }

        if let Some(expected) = size {
            if total != expected {
                return Err(Error::SizeMismatch {
                    expected,
                    found: total,
                });
            }
        }

        let digest = BASE64.encode(hasher.finalize());
        self.find_match(algorithm, &digest)
    }

    /// Infallible form of [`Integrity::check_data`].
    pub fn check(&self, data: &[u8]) -> bool {
        self.check_data(data, None).is_ok()
    }

    fn find_match(&self, algorithm: &str, digest: &str) -> Result<&Hash> {
        self.hashes
            .iter()
            .find(|hash| hash.algorithm == algorithm && hash.digest == digest)
            .ok_or_else(|| Error::IntegrityMismatch {
                expected: self
                    .hashes
                    .iter()
                    .filter(|hash| hash.algorithm == algorithm)
                    .map(Hash::to_string)
                    .collect::<Vec<_>>()
                    .join(" "),
                found: format!("{}-{}", algorithm, digest),
            })
    }

    /// Returns the first hash's algorithm and hex digest; this pair
    /// addresses the blob in the content store.
    pub fn to_hex(&self) -> Result<(&str, String)> {
        let hash = self
            .hashes
            .first()
            .ok_or_else(|| Error::BadArgument("empty integrity has no digest".into()))?;
        Ok((&hash.algorithm, hash.hexdigest()?))
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for hash in &self.hashes {
            let formatted = hash.to_string();
            if formatted.is_empty() {
                continue;
            }

            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", formatted)?;
            first = false;
        }
        Ok(())
    }
}

/// Two integrities are equal iff their canonical string forms are.
impl PartialEq for Integrity {
    fn eq(&self, other: &Integrity) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Integrity {}

impl FromStr for Integrity {
    type Err = Error;

    fn from_str(input: &str) -> Result<Integrity> {
        let parsed = Integrity::parse(input, false);
        if parsed.is_empty() {
            return Err(Error::BadArgument(format!(
                "`{}` contains no parseable integrity token",
                input
            )));
        }
        Ok(parsed)
    }
}

impl serde::Serialize for Integrity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Integrity {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Integrity, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Integrity::parse(&raw, false))
    }
}

/// sha512 of "hello world" in base64, computed with coreutils.
#[cfg(test)]
const HELLO_SHA512: &str = "MJ7MSJwS1utMxA9QyQLytNDtd+5RGnx6m808qG1M2G+YndNbxf9JlnDaNCVbRbDP2DDoH2Bdz33FVC6TrpzXbw==";

/// from_data produces the canonical single-hash form by default.
#[test]
fn test_from_data_default() {
    let sri = Integrity::from_data(b"hello world", &[], &[]).expect("sha512 is supported");
    assert_eq!(sri.to_string(), format!("sha512-{}", HELLO_SHA512));
}

/// Multi-algorithm digests come back in the requested order.
#[test]
fn test_from_data_multiple() {
    let sri =
        Integrity::from_data(b"foobarbaz", &["sha256", "sha512"], &[]).expect("both supported");
    assert_eq!(sri.hashes.len(), 2);
    assert_eq!(sri.hashes[0].algorithm, "sha256");
    assert_eq!(sri.hashes[1].algorithm, "sha512");
    assert!(sri.check(b"foobarbaz"));
    assert!(!sri.check(b"foobarbaz!"));
}

/// whirlpool can be ranked but not computed.
#[test]
fn test_whirlpool_is_not_computable() {
    assert!(matches!(
        Integrity::from_data(b"x", &["whirlpool"], &[]),
        Err(crate::errors::Error::NoSuchAlgorithm(name)) if name == "whirlpool"
    ));
}

/// Parsing drops malformed tokens and keeps the rest, in order.
#[test]
fn test_parse_lenient() {
    let sri = Integrity::parse("sha512-foo not-even-close sha256-bar", false);
    // "not-even-close" still matches `algorithm-digest` leniently; only
    // tokens without a dash or with empty parts are dropped.
    assert_eq!(sri.hashes.len(), 3);
    assert_eq!(Integrity::parse("garbage -nope trailing-", false).hashes.len(), 0);
}

/// Unknown algorithms survive a lenient parse.
#[test]
fn test_parse_retains_unknown_algorithms() {
    let sri = Integrity::parse("blake3-abc123", false);
    assert_eq!(sri.hashes.len(), 1);
    assert_eq!(sri.hashes[0].algorithm, "blake3");
}

/// Strict parsing keeps only well-formed tokens under the W3C grammar.
#[test]
fn test_parse_strict() {
    let valid = format!("sha512-{}", HELLO_SHA512);
    let input = format!(
        "sha1-deadbeef sha512-{}@#$ sha512-{}?\u{1} {}",
        HELLO_SHA512, HELLO_SHA512, valid
    );

    let sri = Integrity::parse(&input, true);
    assert_eq!(sri.to_string(), valid);
}

/// The single-hash parse takes the first token that survives.
#[test]
fn test_single_hash_parse() {
    let hash = Hash::parse("sha512-abc sha256-def", false).expect("first token parses");
    assert_eq!(hash.algorithm, "sha512");
    assert_eq!(hash.digest, "abc");

    assert!(Hash::parse("garbage", false).is_none());
    assert!(Hash::parse("", false).is_none());
}

/// Options round-trip through parse and Display.
#[test]
fn test_options_round_trip() {
    let sri = Integrity::parse("sha512-abc?foo?bar", false);
    assert_eq!(sri.hashes[0].options, vec!["foo", "bar"]);
    assert_eq!(sri.to_string(), "sha512-abc?foo?bar");
}

/// The default priority prefers the strongest known algorithm and
/// scores unknown ones below md5.
#[test]
fn test_pick_algorithm() {
    let sri = Integrity::parse("sha1-a md5-b sha512-c sha256-d", false);
    assert_eq!(sri.pick_algorithm().expect("non-empty"), "sha512");

    let unknown = Integrity::parse("blake3-a md5-b", false);
    assert_eq!(unknown.pick_algorithm().expect("non-empty"), "md5");

    // Ties (same algorithm twice) resolve to the first insertion.
    let tied = Integrity::parse("sha256-first sha256-second", false);
    assert_eq!(tied.pick_algorithm().expect("non-empty"), "sha256");

    assert!(Integrity::default().pick_algorithm().is_err());
}

/// A custom priority function inverts the choice.
#[test]
fn test_pick_algorithm_with_custom_priority() {
    let sri = Integrity::parse("sha1-a sha512-c", false);
    let picked = sri
        .pick_algorithm_with(|algorithm| if algorithm == "sha1" { 10 } else { 0 })
        .expect("non-empty");
    assert_eq!(picked, "sha1");
}

/// check_data returns the matching hash, and reports size mismatches
/// before doing any hashing.
#[test]
fn test_check_data() {
    let sri = Integrity::from_data(b"foobarbaz", &["sha512"], &[]).expect("supported");

    let hash = sri.check_data(b"foobarbaz", Some(9)).expect("must match");
    assert_eq!(hash.algorithm, "sha512");

    assert!(matches!(
        sri.check_data(b"foobarbaz", Some(8)),
        Err(crate::errors::Error::SizeMismatch { expected: 8, found: 9 })
    ));
    assert!(matches!(
        sri.check_data(b"foobarbup", None),
        Err(crate::errors::Error::IntegrityMismatch { .. })
    ));
}

/// The streaming check agrees with the buffered one.
#[test]
fn test_check_file() {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let mut file = NamedTempFile::new().expect("new temp file must succeed");
    // Larger than one chunk so the loop actually iterates.
    let payload = vec![42u8; CHUNK_SIZE + 17];
    file.write_all(&payload).expect("write must succeed");
    file.flush().expect("flush must succeed");

    let sri = Integrity::from_data(&payload, &["sha256"], &[]).expect("supported");
    sri.check_file(file.path(), Some(payload.len() as u64))
        .expect("must match");

    assert!(matches!(
        sri.check_file(file.path(), Some(3)),
        Err(crate::errors::Error::SizeMismatch { .. })
    ));

    let other = Integrity::from_data(b"different", &["sha256"], &[]).expect("supported");
    assert!(matches!(
        other.check_file(file.path(), None),
        Err(crate::errors::Error::IntegrityMismatch { .. })
    ));
}

/// from_hex and hexdigest are inverses.
#[test]
fn test_hex_round_trip() {
    let sri = Integrity::from_data(b"hello world", &["sha256"], &[]).expect("supported");
    let (algorithm, hex_digest) = sri.to_hex().expect("non-empty");
    assert_eq!(algorithm, "sha256");
    assert_eq!(
        hex_digest,
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );

    let rebuilt = Integrity::from_hex(&hex_digest, "sha256", &[]).expect("valid hex");
    assert_eq!(rebuilt, sri);

    assert!(Integrity::from_hex("not hex", "sha256", &[]).is_err());
}

/// Equality is defined by the canonical string form.
#[test]
fn test_equality_is_canonical() {
    let a = Integrity::parse("sha512-abc  \t sha256-def", false);
    let b = Integrity::parse("sha512-abc sha256-def", false);
    assert_eq!(a, b);

    let c = Integrity::parse("sha256-def sha512-abc", false);
    assert_ne!(a, c);
}

/// Integrity serializes as its canonical string inside JSON documents.
#[test]
fn test_serde_as_string() {
    let sri = Integrity::from_data(b"x", &["sha256"], &[]).expect("supported");
    let json = serde_json::to_string(&sri).expect("serialize must succeed");
    assert_eq!(json, format!("\"{}\"", sri));

    let back: Integrity = serde_json::from_str(&json).expect("deserialize must succeed");
    assert_eq!(back, sri);
}

#[cfg(test)]
mod properties {
    use crate::integrity::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    proptest! {
        /// Any canonical string form parses back to an equal Integrity.
        #[test]
        fn parse_round_trips(data in vec(any::<u8>(), 0..256usize)) {
            let sri = Integrity::from_data(&data, &["sha1", "sha256", "sha512"], &[])
                .expect("all supported");
            let reparsed = Integrity::parse(&sri.to_string(), false);
            prop_assert_eq!(reparsed, sri);
        }
    }
}
