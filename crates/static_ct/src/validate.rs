// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Submission chain validation.
//!
//! RFC 6962 §3.1 requires a log to verify that a submitted (pre)certificate
//! has a valid signature chain leading back to an accepted root, using the
//! intermediates provided by the submitter. The checks here are deliberately
//! not a full web-PKI path validation: the log's job is to reject obviously
//! bad chains and record everything else.

use crate::{is_pre_issuer, is_precert, StaticCTError};
use der::oid::ObjectIdentifier;
use sha2::{Digest, Sha256};
use std::collections::{hash_map::Entry as MapEntry, HashMap, HashSet};
use tlog::UnixTimestamp;
use x509_cert::{
    der::{Decode, Encode},
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, SubjectKeyIdentifier,
    },
    Certificate,
};
use x509_verify::VerifyingKey;

/// The anyExtendedKeyUsage OID, `2.5.29.37.0`.
pub const ANY_EXT_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37.0");

const ID_KP_SERVER_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");
const ID_KP_CLIENT_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");
const ID_KP_CODE_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");
const ID_KP_EMAIL_PROTECTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.4");
const ID_KP_IPSEC_END_SYSTEM: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.5");
const ID_KP_IPSEC_TUNNEL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.6");
const ID_KP_IPSEC_USER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.7");
const ID_KP_TIME_STAMPING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.8");
const ID_KP_OCSP_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.9");
const ID_KP_MS_SGC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.10.3.3");
const ID_KP_NS_SGC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.113730.4.1");

/// Parses a comma-separated list of extended key usage names into OIDs. The
/// accepted names match the upstream x509 package.
///
/// # Errors
///
/// Returns [`StaticCTError::UnknownExtKeyUsage`] for any unrecognized name.
pub fn parse_ext_key_usages(s: &str) -> Result<Vec<ObjectIdentifier>, StaticCTError> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|name| match name {
            "Any" => Ok(ANY_EXT_KEY_USAGE),
            "ServerAuth" => Ok(ID_KP_SERVER_AUTH),
            "ClientAuth" => Ok(ID_KP_CLIENT_AUTH),
            "CodeSigning" => Ok(ID_KP_CODE_SIGNING),
            "EmailProtection" => Ok(ID_KP_EMAIL_PROTECTION),
            "IPSECEndSystem" => Ok(ID_KP_IPSEC_END_SYSTEM),
            "IPSECTunnel" => Ok(ID_KP_IPSEC_TUNNEL),
            "IPSECUser" => Ok(ID_KP_IPSEC_USER),
            "TimeStamping" => Ok(ID_KP_TIME_STAMPING),
            "OCSPSigning" => Ok(ID_KP_OCSP_SIGNING),
            "MicrosoftServerGatedCrypto" => Ok(ID_KP_MS_SGC),
            "NetscapeServerGatedCrypto" => Ok(ID_KP_NS_SGC),
            _ => Err(StaticCTError::UnknownExtKeyUsage(name.to_string())),
        })
        .collect()
}

/// Parses a comma-separated list of dotted OIDs.
///
/// # Errors
///
/// Returns [`StaticCTError::InvalidOid`] for any component that is not a
/// valid object identifier.
pub fn parse_oids(s: &str) -> Result<Vec<ObjectIdentifier>, StaticCTError> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|oid| ObjectIdentifier::new(oid).map_err(|_| StaticCTError::InvalidOid(oid.to_string())))
        .collect()
}

/// A set of certificates indexed for issuer lookup.
#[derive(Debug, Default)]
pub struct CertPool {
    // Map from SHA-256 fingerprint to index in `certs`.
    by_fingerprint: HashMap<[u8; 32], usize>,
    // Map from subject name to indexes of certs with that name.
    by_name: HashMap<String, Vec<usize>>,
    // Map from DER-encoded SKI to indexes of certs with that SKI.
    by_subject_key_id: HashMap<Vec<u8>, Vec<usize>>,
    pub certs: Vec<Certificate>,
}

impl CertPool {
    /// Constructs a pool from the given certificates, dropping duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate or its extensions fail to
    /// DER-encode.
    pub fn new(certs: Vec<Certificate>) -> Result<Self, der::Error> {
        let mut pool = Self::default();
        for cert in certs {
            pool.add_cert(cert)?;
        }
        Ok(pool)
    }

    /// Adds certificates from PEM data, skipping non-certificate blocks.
    ///
    /// # Errors
    ///
    /// Returns an error on DER or PEM decoding issues.
    pub fn append_certs_from_pem(&mut self, input: &[u8]) -> Result<(), der::Error> {
        for cert in Certificate::load_pem_chain(input)? {
            self.add_cert(cert)?;
        }
        Ok(())
    }

    /// Adds a certificate if it is not already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate or its extensions fail to
    /// DER-encode.
    pub fn add_cert(&mut self, cert: Certificate) -> Result<(), der::Error> {
        let fingerprint: [u8; 32] = Sha256::digest(cert.to_der()?).into();
        if let MapEntry::Vacant(e) = self.by_fingerprint.entry(fingerprint) {
            let idx = self.certs.len();
            e.insert(idx);
            self.by_name
                .entry(cert.tbs_certificate.subject.to_string())
                .or_default()
                .push(idx);
            if let Some((_, ski)) = cert.tbs_certificate.get::<SubjectKeyIdentifier>()? {
                self.by_subject_key_id
                    .entry(ski.to_der()?)
                    .or_default()
                    .push(idx);
            }
            self.certs.push(cert);
        }
        Ok(())
    }

    /// Reports whether the pool contains this exact certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate fails to DER-encode.
    pub fn includes(&self, cert: &Certificate) -> Result<bool, der::Error> {
        Ok(self
            .by_fingerprint
            .contains_key::<[u8; 32]>(&Sha256::digest(cert.to_der()?).into()))
    }

    /// Returns indexes of pool certificates that could have issued `cert`,
    /// matching by AKI when present and by issuer name otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error on extension decoding issues.
    pub fn find_potential_parents(&self, cert: &Certificate) -> Result<&[usize], der::Error> {
        if let Some((_, aki)) = cert.tbs_certificate.get::<AuthorityKeyIdentifier>()? {
            if let Some(key_id) = aki.key_identifier {
                if let Some(indexes) = self
                    .by_subject_key_id
                    .get(&SubjectKeyIdentifier(key_id).to_der()?)
                {
                    return Ok(indexes);
                }
            }
        }
        if let Some(indexes) = self.by_name.get(&cert.tbs_certificate.issuer.to_string()) {
            return Ok(indexes);
        }
        Ok(&[])
    }
}

/// Policy applied to the leaf of a validated chain.
///
/// Built once at startup; the lookup sets are precomputed so the per-request
/// path does no allocation. A policy assembled without
/// [`ChainPolicy::with_lookup_tables`] (as some tests do) falls back to
/// scanning the slices and returns the same verdicts.
#[derive(Debug, Default)]
pub struct ChainPolicy {
    pub reject_expired: bool,
    pub reject_unexpired: bool,
    /// Inclusive lower bound on the leaf NotAfter, milliseconds.
    pub not_after_start: Option<UnixTimestamp>,
    /// Exclusive upper bound on the leaf NotAfter, milliseconds.
    pub not_after_limit: Option<UnixTimestamp>,
    /// Accepted leaf EKUs. Empty, or containing anyExtendedKeyUsage,
    /// accepts everything.
    pub allowed_ext_key_usages: Vec<ObjectIdentifier>,
    /// Extension OIDs whose presence on the leaf rejects the submission.
    pub rejected_extensions: Vec<ObjectIdentifier>,

    allowed_eku_set: Option<HashSet<ObjectIdentifier>>,
    rejected_ext_set: Option<HashSet<ObjectIdentifier>>,
}

impl ChainPolicy {
    /// Builds a policy with its lookup tables precomputed.
    pub fn new(
        reject_expired: bool,
        reject_unexpired: bool,
        not_after_start: Option<UnixTimestamp>,
        not_after_limit: Option<UnixTimestamp>,
        allowed_ext_key_usages: Vec<ObjectIdentifier>,
        rejected_extensions: Vec<ObjectIdentifier>,
    ) -> Self {
        Self {
            reject_expired,
            reject_unexpired,
            not_after_start,
            not_after_limit,
            allowed_ext_key_usages,
            rejected_extensions,
            allowed_eku_set: None,
            rejected_ext_set: None,
        }
        .with_lookup_tables()
    }

    /// Precomputes the hash-set lookups for the hot path.
    #[must_use]
    pub fn with_lookup_tables(mut self) -> Self {
        self.allowed_eku_set = Some(self.allowed_ext_key_usages.iter().copied().collect());
        self.rejected_ext_set = Some(self.rejected_extensions.iter().copied().collect());
        self
    }

    fn eku_checking_disabled(&self) -> bool {
        self.allowed_ext_key_usages.is_empty()
            || self.allowed_ext_key_usages.contains(&ANY_EXT_KEY_USAGE)
    }

    fn eku_allowed(&self, oid: ObjectIdentifier) -> bool {
        match &self.allowed_eku_set {
            Some(set) => set.contains(&oid),
            None => self.allowed_ext_key_usages.contains(&oid),
        }
    }

    fn ext_rejected(&self, oid: ObjectIdentifier) -> bool {
        match &self.rejected_ext_set {
            Some(set) => set.contains(&oid),
            None => self.rejected_extensions.contains(&oid),
        }
    }

    /// Applies the policy to a leaf certificate.
    fn check_leaf(&self, leaf: &Certificate, now: UnixTimestamp) -> Result<(), StaticCTError> {
        let not_after = u64::try_from(
            leaf.tbs_certificate
                .validity
                .not_after
                .to_unix_duration()
                .as_millis(),
        )
        .map_err(|_| StaticCTError::InvalidLeaf)?;

        if self.reject_expired && now >= not_after {
            return Err(StaticCTError::Expired);
        }
        if self.reject_unexpired && now < not_after {
            return Err(StaticCTError::Unexpired);
        }
        if self.not_after_start.is_some_and(|start| not_after < start)
            || self.not_after_limit.is_some_and(|limit| not_after >= limit)
        {
            return Err(StaticCTError::NotAfterOutsideWindow);
        }

        if let Some(exts) = &leaf.tbs_certificate.extensions {
            for ext in exts {
                if self.ext_rejected(ext.extn_id) {
                    return Err(StaticCTError::RejectedExtension(ext.extn_id));
                }
            }
        }

        if !self.eku_checking_disabled() {
            if let Some((_, eku)) = leaf.tbs_certificate.get::<ExtendedKeyUsage>()? {
                for usage in &eku.0 {
                    if !self.eku_allowed(*usage) {
                        return Err(StaticCTError::DisallowedExtKeyUsage);
                    }
                }
            }
        }

        Ok(())
    }
}

/// The outcome of successful chain validation: the parsed leaf, the issuing
/// chain up to (and including) a trusted root, and the position of a CT
/// pre-issuer if one signed the leaf.
pub struct ValidatedChain {
    pub leaf: Certificate,
    /// Issuers of the leaf in order, ending at a trusted root. If the
    /// submitter omitted the root it is appended from the trust store.
    pub issuers: Vec<Certificate>,
    pub is_precert: bool,
    /// Index into `issuers` of the precertificate signing certificate
    /// directly above the leaf. Always `Some(0)` when present.
    pub pre_issuer_idx: Option<usize>,
}

/// Validates a submitted chain against the trust store and policy.
///
/// The chain must be ordered leaf-first, each certificate signed by the
/// next. The last element is either a trusted root or a certificate issued
/// by one, in which case the trusted root is appended to the output.
///
/// # Errors
///
/// Returns a parse, structural, trust, or policy error; see
/// [`StaticCTError`].
pub fn validate_chain(
    raw_chain: &[Vec<u8>],
    roots: &CertPool,
    policy: &ChainPolicy,
    expect_precert: bool,
    now: UnixTimestamp,
) -> Result<ValidatedChain, StaticCTError> {
    let (leaf_der, rest) = raw_chain.split_first().ok_or(StaticCTError::EmptyChain)?;
    let leaf = Certificate::from_der(leaf_der)?;
    let mut issuers: Vec<Certificate> = rest
        .iter()
        .map(|der| Certificate::from_der(der))
        .collect::<Result<_, _>>()?;

    // Reject mismatched signature algorithms:
    // https://github.com/google/certificate-transparency-go/pull/702
    for cert in std::iter::once(&leaf).chain(issuers.iter()) {
        if cert.signature_algorithm != cert.tbs_certificate.signature {
            return Err(StaticCTError::MismatchedSigAlg);
        }
    }

    policy.check_leaf(&leaf, now)?;

    // The poison extension must be present on precerts, absent on certs, and
    // consistent with the endpoint the submission arrived on.
    let leaf_is_precert = is_precert(&leaf)?;
    if leaf_is_precert != expect_precert {
        return Err(StaticCTError::EndpointMismatch {
            is_precert: leaf_is_precert,
        });
    }

    // Walk up the chain, checking that each certificate signs the previous
    // one and that intermediates are CAs.
    let mut to_verify = &leaf;
    for issuer in &issuers {
        if !is_link_valid(to_verify, issuer) {
            return Err(StaticCTError::InvalidLinkInChain);
        }
        if issuer
            .tbs_certificate
            .get::<BasicConstraints>()?
            .is_none_or(|(_, bc)| !bc.ca)
        {
            return Err(StaticCTError::IntermediateMissingCaBasicConstraint);
        }
        to_verify = issuer;
    }

    // The last certificate is either in the trust store itself, or directly
    // issued by a trust store entry, which then completes the chain.
    if !roots.includes(to_verify)? {
        let Some(&root_idx) = roots
            .find_potential_parents(to_verify)?
            .iter()
            .find(|&&idx| is_link_valid(to_verify, &roots.certs[idx]))
        else {
            return Err(StaticCTError::UntrustedRoot(
                to_verify.tbs_certificate.issuer.to_string(),
            ));
        };
        issuers.push(roots.certs[root_idx].clone());
    }

    // A precertificate signing certificate is only meaningful directly above
    // the leaf.
    let pre_issuer_idx = if leaf_is_precert
        && issuers.first().map(is_pre_issuer).transpose()?.unwrap_or(false)
    {
        Some(0)
    } else {
        None
    };

    Ok(ValidatedChain {
        leaf,
        issuers,
        is_precert: leaf_is_precert,
        pre_issuer_idx,
    })
}

/// Reports whether `issuer` signed `child`.
fn is_link_valid(child: &Certificate, issuer: &Certificate) -> bool {
    if let Ok(key) = VerifyingKey::try_from(issuer) {
        key.verify_strict(child).is_ok()
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn raw(chain: &[&Certificate]) -> Vec<Vec<u8>> {
        chain.iter().map(|c| c.to_der().unwrap()).collect()
    }

    #[test]
    fn test_parse_ext_key_usages() {
        assert!(parse_ext_key_usages("").unwrap().is_empty());
        assert_eq!(
            parse_ext_key_usages("ServerAuth,ClientAuth,OCSPSigning").unwrap(),
            vec![ID_KP_SERVER_AUTH, ID_KP_CLIENT_AUTH, ID_KP_OCSP_SIGNING]
        );
        assert!(parse_ext_key_usages("Any").unwrap().contains(&ANY_EXT_KEY_USAGE));
        let err = parse_ext_key_usages("ClientAuth,TimeStomping").unwrap_err();
        assert!(err.to_string().contains("unknown extended key usage"));
        // Stray whitespace is not trimmed, matching the upstream behavior.
        assert!(parse_ext_key_usages("Any ").is_err());
    }

    #[test]
    fn test_parse_oids() {
        assert_eq!(
            parse_oids("1.2.3.4,5.6.7.8").unwrap(),
            vec![
                ObjectIdentifier::new_unwrap("1.2.3.4"),
                ObjectIdentifier::new_unwrap("5.6.7.8")
            ]
        );
        assert!(parse_oids("1.2.3.4,one.banana.two.bananas").is_err());
    }

    #[test]
    fn test_validate_chain_ok() {
        let chain = TestChain::without_pre_issuer();
        let roots = chain.root_pool();
        let policy = ChainPolicy::default().with_lookup_tables();

        // Full chain, including the root.
        let validated = validate_chain(
            &raw(&[&chain.leaf, &chain.intermediate, &chain.root]),
            &roots,
            &policy,
            false,
            chain.now_millis(),
        )
        .unwrap();
        assert_eq!(validated.issuers.len(), 2);
        assert!(!validated.is_precert);
        assert!(validated.pre_issuer_idx.is_none());

        // Omitting the root infers it from the trust store.
        let validated = validate_chain(
            &raw(&[&chain.leaf, &chain.intermediate]),
            &roots,
            &policy,
            false,
            chain.now_millis(),
        )
        .unwrap();
        assert_eq!(validated.issuers.len(), 2);
        assert!(roots.includes(validated.issuers.last().unwrap()).unwrap());
    }

    #[test]
    fn test_validate_chain_untrusted_root() {
        let chain = TestChain::without_pre_issuer();
        let other = TestChain::without_pre_issuer();
        let policy = ChainPolicy::default().with_lookup_tables();
        let res = validate_chain(
            &raw(&[&chain.leaf, &chain.intermediate]),
            &other.root_pool(),
            &policy,
            false,
            chain.now_millis(),
        );
        assert!(matches!(res, Err(StaticCTError::UntrustedRoot(_))));
    }

    #[test]
    fn test_validate_chain_broken_link() {
        let chain = TestChain::without_pre_issuer();
        let other = TestChain::without_pre_issuer();
        let policy = ChainPolicy::default().with_lookup_tables();
        // The intermediate from an unrelated hierarchy did not sign the leaf.
        let res = validate_chain(
            &raw(&[&chain.leaf, &other.intermediate, &other.root]),
            &other.root_pool(),
            &policy,
            false,
            chain.now_millis(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_chain_endpoint_mismatch() {
        let chain = TestChain::without_pre_issuer();
        let roots = chain.root_pool();
        let policy = ChainPolicy::default().with_lookup_tables();
        let res = validate_chain(
            &raw(&[&chain.leaf, &chain.intermediate]),
            &roots,
            &policy,
            true,
            chain.now_millis(),
        );
        assert!(matches!(
            res,
            Err(StaticCTError::EndpointMismatch { is_precert: false })
        ));
        let res = validate_chain(
            &raw(&[&chain.precert, &chain.intermediate]),
            &roots,
            &policy,
            false,
            chain.now_millis(),
        );
        assert!(matches!(
            res,
            Err(StaticCTError::EndpointMismatch { is_precert: true })
        ));
    }

    #[test]
    fn test_validate_chain_expiry_policy() {
        let chain = TestChain::without_pre_issuer();
        let roots = chain.root_pool();
        let now = chain.now_millis();
        let chain_der = raw(&[&chain.leaf, &chain.intermediate]);

        let reject_expired = ChainPolicy {
            reject_expired: true,
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        // The leaf is currently valid, so it passes...
        validate_chain(&chain_der, &roots, &reject_expired, false, now).unwrap();
        // ...but the same leaf an hour after NotAfter is rejected.
        let after_expiry = chain.leaf_not_after_millis() + 3_600_000;
        assert!(matches!(
            validate_chain(&chain_der, &roots, &reject_expired, false, after_expiry),
            Err(StaticCTError::Expired)
        ));

        let reject_unexpired = ChainPolicy {
            reject_unexpired: true,
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        assert!(matches!(
            validate_chain(&chain_der, &roots, &reject_unexpired, false, now),
            Err(StaticCTError::Unexpired)
        ));
    }

    #[test]
    fn test_validate_chain_not_after_window() {
        let chain = TestChain::without_pre_issuer();
        let roots = chain.root_pool();
        let now = chain.now_millis();
        let not_after = chain.leaf_not_after_millis();
        let chain_der = raw(&[&chain.leaf, &chain.intermediate]);

        let in_window = ChainPolicy {
            not_after_start: Some(not_after - 1000),
            not_after_limit: Some(not_after + 1000),
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        validate_chain(&chain_der, &roots, &in_window, false, now).unwrap();

        let before_start = ChainPolicy {
            not_after_start: Some(not_after + 1),
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        assert!(matches!(
            validate_chain(&chain_der, &roots, &before_start, false, now),
            Err(StaticCTError::NotAfterOutsideWindow)
        ));

        // The limit is exclusive.
        let at_limit = ChainPolicy {
            not_after_limit: Some(not_after),
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        assert!(matches!(
            validate_chain(&chain_der, &roots, &at_limit, false, now),
            Err(StaticCTError::NotAfterOutsideWindow)
        ));
    }

    #[test]
    fn test_validate_chain_eku_policy() {
        let chain = TestChain::without_pre_issuer();
        let roots = chain.root_pool();
        let now = chain.now_millis();
        let chain_der = raw(&[&chain.leaf, &chain.intermediate]);

        // The test leaf carries ServerAuth.
        let allow_server_auth = ChainPolicy {
            allowed_ext_key_usages: parse_ext_key_usages("ServerAuth").unwrap(),
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        validate_chain(&chain_der, &roots, &allow_server_auth, false, now).unwrap();

        let allow_other = ChainPolicy {
            allowed_ext_key_usages: parse_ext_key_usages("OCSPSigning").unwrap(),
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        assert!(matches!(
            validate_chain(&chain_der, &roots, &allow_other, false, now),
            Err(StaticCTError::DisallowedExtKeyUsage)
        ));

        // "Any" disables the check entirely.
        let allow_any = ChainPolicy {
            allowed_ext_key_usages: parse_ext_key_usages("Any,OCSPSigning").unwrap(),
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        validate_chain(&chain_der, &roots, &allow_any, false, now).unwrap();

        // The slice-scan fallback returns the same verdicts.
        let no_tables = ChainPolicy {
            allowed_ext_key_usages: parse_ext_key_usages("OCSPSigning").unwrap(),
            ..ChainPolicy::default()
        };
        assert!(matches!(
            validate_chain(&chain_der, &roots, &no_tables, false, now),
            Err(StaticCTError::DisallowedExtKeyUsage)
        ));
    }

    #[test]
    fn test_validate_chain_rejected_extension() {
        let chain = TestChain::without_pre_issuer();
        let roots = chain.root_pool();
        let now = chain.now_millis();
        let chain_der = raw(&[&chain.leaf, &chain.intermediate]);

        // The leaf always carries an EKU extension; rejecting that OID
        // rejects the submission.
        let policy = ChainPolicy {
            rejected_extensions: parse_oids("2.5.29.37").unwrap(),
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        assert!(matches!(
            validate_chain(&chain_der, &roots, &policy, false, now),
            Err(StaticCTError::RejectedExtension(_))
        ));

        let unrelated = ChainPolicy {
            rejected_extensions: parse_oids("1.2.3.4").unwrap(),
            ..ChainPolicy::default()
        }
        .with_lookup_tables();
        validate_chain(&chain_der, &roots, &unrelated, false, now).unwrap();
    }

    #[test]
    fn test_validate_pre_issuer_chain() {
        let chain = TestChain::with_pre_issuer();
        let roots = chain.root_pool();
        let policy = ChainPolicy::default().with_lookup_tables();
        let validated = validate_chain(
            &raw(&[
                &chain.precert,
                chain.pre_issuer.as_ref().unwrap(),
                &chain.intermediate,
                &chain.root,
            ]),
            &roots,
            &policy,
            true,
            chain.now_millis(),
        )
        .unwrap();
        assert!(validated.is_precert);
        assert_eq!(validated.pre_issuer_idx, Some(0));
        assert_eq!(validated.issuers.len(), 3);
    }

    #[test]
    fn test_cert_pool() {
        let chain = TestChain::without_pre_issuer();
        let mut pool = CertPool::new(vec![chain.root.clone()]).unwrap();
        assert!(pool.includes(&chain.root).unwrap());
        assert!(!pool.includes(&chain.intermediate).unwrap());

        // Duplicates are dropped.
        pool.add_cert(chain.root.clone()).unwrap();
        assert_eq!(pool.certs.len(), 1);

        // The intermediate's parent is found by SKI/name.
        let parents = pool.find_potential_parents(&chain.intermediate).unwrap();
        assert_eq!(parents, &[0]);
    }
}
