// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The flag surface and its validation.
//!
//! Flags are parsed once in `main` and validated into immutable values the
//! rest of the server takes as parameters, so tests can construct
//! configurations directly without touching the CLI.

use clap::Parser;
use p256::{ecdsa::SigningKey, pkcs8::DecodePrivateKey};
use static_ct::{parse_ext_key_usages, parse_oids, CertPool, ChainPolicy, StaticCTError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tlog::UnixTimestamp;

/// TesseraCT: a static-CT-API Certificate Transparency log server.
#[derive(Parser, Debug, Clone)]
#[command(name = "tesseract", version, about)]
pub struct Flags {
    /// Endpoint for HTTP (host:port).
    #[arg(long, default_value = "localhost:6962")]
    pub http_endpoint: String,

    /// Deadline for HTTP requests.
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub http_deadline: Duration,

    /// Prefix on endpoint URL paths: HOST:PATH_PREFIX/ct/v1/ENDPOINT.
    #[arg(long, default_value = "")]
    pub path_prefix: String,

    /// Don't return error strings with Internal Server Error responses.
    #[arg(long, default_value_t = false)]
    pub mask_internal_errors: bool,

    /// Origin of the log, for checkpoints.
    #[arg(long, default_value = "")]
    pub origin: String,

    /// Path to the PKCS#8 PEM private key used to sign checkpoints and
    /// SCTs. Only NIST P-256 keys are accepted.
    #[arg(long)]
    pub signing_key_file: PathBuf,

    /// Directory backing the log's object store; its layout is the
    /// static-CT read path.
    #[arg(long)]
    pub storage_dir: PathBuf,

    /// Path to the file containing root certificates that are acceptable to
    /// the log. The certs are served through the get-roots endpoint.
    #[arg(long, default_value = "")]
    pub roots_pem_file: String,

    /// If true, expired certificates are rejected at submission time.
    #[arg(long, default_value_t = false)]
    pub reject_expired: bool,

    /// If true, certificates that are currently valid or not yet valid are
    /// rejected.
    #[arg(long, default_value_t = false)]
    pub reject_unexpired: bool,

    /// If set, restricts the extended key usages the log accepts on leaves.
    /// Comma-separated names known to the x509 package.
    #[arg(long, default_value = "")]
    pub ext_key_usages: String,

    /// X.509 extension OIDs, in dotted form, whose presence causes
    /// submissions to be rejected.
    #[arg(long = "reject_extension", default_value = "")]
    pub reject_extensions: String,

    /// Start of the range of acceptable NotAfter values, inclusive.
    /// RFC3339 UTC format, e.g. 2024-01-02T15:04:05Z.
    #[arg(long, default_value = "")]
    pub not_after_start: String,

    /// Cut-off point of NotAfter dates: only dates strictly before the
    /// limit are accepted. RFC3339 UTC format.
    #[arg(long, default_value = "")]
    pub not_after_limit: String,

    /// If true, the certificate is integrated into the log before the
    /// response is returned.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_publication_awaiter: bool,

    /// Maximum interval between checkpoint publications.
    #[arg(long, value_parser = parse_duration, default_value = "1500ms")]
    pub checkpoint_interval: Duration,

    /// Maximum number of entries in a single sequencing batch.
    #[arg(long, default_value_t = 256)]
    pub batch_max_size: usize,

    /// Maximum age of entries in a single sequencing batch.
    #[arg(long, value_parser = parse_duration, default_value = "250ms")]
    pub batch_max_age: Duration,

    /// Maximum number of in-flight add requests: entries with sequence
    /// numbers assigned but not yet integrated into the log.
    #[arg(long, default_value_t = 4096)]
    pub pushback_max_outstanding: u64,

    /// Maximum number of in-flight duplicate add requests. When 0,
    /// duplicate entries are always pushed back.
    #[arg(long, default_value_t = 100)]
    pub pushback_max_dedupe_in_flight: u64,

    /// Maximum permitted lag for the antispam follower, in entries, before
    /// the log starts returning pushback.
    #[arg(long, default_value_t = 1 << 20)]
    pub pushback_max_antispam_lag: u64,

    /// Maximum number of entries in the in-memory antispam cache. Unitless
    /// with SI metric suffixes, such as '256k'.
    #[arg(long, default_value = "256k")]
    pub inmemory_antispam_cache_size: String,
}

/// An error raised while validating the configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("empty origin")]
    EmptyOrigin,
    #[error("empty rootsPemFile")]
    EmptyRootsPemFile,
    #[error("failed to read trusted roots: {0}")]
    BadRoots(String),
    #[error("configuration would reject all certificates")]
    RejectingAll,
    #[error("limit before start")]
    LimitBeforeStart,
    #[error(transparent)]
    InvalidPolicy(#[from] StaticCTError),
    #[error("can't parse {0:?} as RFC3339 timestamp")]
    BadTimestamp(String),
    #[error("timestamps MUST be in UTC, got {0}")]
    TimestampNotUtc(String),
    #[error("invalid antispam cache size: {0}")]
    BadCacheSize(String),
    #[error("unsupported key type: {0}")]
    UnsupportedKey(String),
}

/// The certificate chain validation knobs, as strings straight from flags.
#[derive(Default, Debug, Clone)]
pub struct ChainValidationConfig {
    pub roots_pem_file: String,
    pub reject_expired: bool,
    pub reject_unexpired: bool,
    pub ext_key_usages: String,
    pub reject_extensions: String,
    pub not_after_start: Option<UnixTimestamp>,
    pub not_after_limit: Option<UnixTimestamp>,
}

impl ChainValidationConfig {
    /// Checks the configuration, loads the trust store, and builds the leaf
    /// policy with its precomputed lookup tables.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<(CertPool, ChainPolicy), ConfigError> {
        if self.roots_pem_file.is_empty() {
            return Err(ConfigError::EmptyRootsPemFile);
        }
        let pem = std::fs::read(&self.roots_pem_file)
            .map_err(|e| ConfigError::BadRoots(e.to_string()))?;
        let mut roots = CertPool::default();
        roots
            .append_certs_from_pem(&pem)
            .map_err(|e| ConfigError::BadRoots(e.to_string()))?;
        if roots.certs.is_empty() {
            return Err(ConfigError::BadRoots("no certificates found".to_string()));
        }

        if self.reject_expired && self.reject_unexpired {
            return Err(ConfigError::RejectingAll);
        }
        if let (Some(start), Some(limit)) = (self.not_after_start, self.not_after_limit) {
            if limit < start {
                return Err(ConfigError::LimitBeforeStart);
            }
        }

        let policy = ChainPolicy::new(
            self.reject_expired,
            self.reject_unexpired,
            self.not_after_start,
            self.not_after_limit,
            parse_ext_key_usages(&self.ext_key_usages)?,
            parse_oids(&self.reject_extensions)?,
        );

        Ok((roots, policy))
    }
}

/// Validates the whole flag surface into the pieces the server is built
/// from.
pub struct ValidatedConfig {
    pub roots: CertPool,
    pub policy: ChainPolicy,
    pub signing_key: SigningKey,
    pub antispam_cache_size: usize,
}

impl Flags {
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        if self.origin.is_empty() {
            return Err(ConfigError::EmptyOrigin);
        }
        let signing_key = load_signing_key(&self.signing_key_file)?;
        let cv = ChainValidationConfig {
            roots_pem_file: self.roots_pem_file.clone(),
            reject_expired: self.reject_expired,
            reject_unexpired: self.reject_unexpired,
            ext_key_usages: self.ext_key_usages.clone(),
            reject_extensions: self.reject_extensions.clone(),
            not_after_start: parse_timestamp(&self.not_after_start)?,
            not_after_limit: parse_timestamp(&self.not_after_limit)?,
        };
        let (roots, policy) = cv.validate()?;
        let antispam_cache_size = parse_si(&self.inmemory_antispam_cache_size)
            .map_err(ConfigError::BadCacheSize)?;
        Ok(ValidatedConfig {
            roots,
            policy,
            signing_key,
            antispam_cache_size: usize::try_from(antispam_cache_size)
                .map_err(|e| ConfigError::BadCacheSize(e.to_string()))?,
        })
    }
}

/// Loads the log's P-256 signing key from a PKCS#8 PEM file. Any other key
/// type is a startup error, per the log's signature policy.
///
/// # Errors
///
/// Returns [`ConfigError::UnsupportedKey`] if the file does not contain a
/// P-256 private key.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, ConfigError> {
    SigningKey::read_pkcs8_pem_file(path).map_err(|e| ConfigError::UnsupportedKey(e.to_string()))
}

/// Parses an RFC 3339 UTC timestamp into Unix milliseconds. Empty means
/// unset.
fn parse_timestamp(s: &str) -> Result<Option<UnixTimestamp>, ConfigError> {
    if s.is_empty() {
        return Ok(None);
    }
    if !s.ends_with('Z') {
        return Err(ConfigError::TimestampNotUtc(s.to_string()));
    }
    let parsed = chrono::DateTime::parse_from_rfc3339(s)
        .map_err(|_| ConfigError::BadTimestamp(s.to_string()))?;
    let millis = u64::try_from(parsed.timestamp_millis())
        .map_err(|_| ConfigError::BadTimestamp(s.to_string()))?;
    Ok(Some(millis))
}

/// Parses a duration flag: a non-negative integer with a `ms`, `s`, `m`, or
/// `h` suffix.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let (value, unit) = s
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| s.split_at(i))
        .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("unknown unit in duration {s:?}")),
    }
}

/// Parses an unsigned integer with an optional SI metric suffix (`k`, `M`,
/// `G`, `T`).
fn parse_si(s: &str) -> Result<u64, String> {
    if s.is_empty() {
        return Err("empty value".to_string());
    }
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let value: u64 = value.parse().map_err(|_| format!("invalid number {s:?}"))?;
    let multiplier = match unit {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        _ => return Err(format!("used unit {unit:?}, want an SI metric prefix")),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("value {s:?} overflows"))
}
