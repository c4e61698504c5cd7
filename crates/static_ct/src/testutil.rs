// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Programmatically built P-256 certificate hierarchies for tests.
//!
//! Each [`TestChain`] is a fresh hierarchy with its own random keys:
//! a self-signed root, an intermediate CA, a server-auth leaf, and a
//! poisoned precertificate signed either by the intermediate or by a
//! dedicated precertificate signing certificate.

use crate::CertPool;
use der::{
    asn1::Null,
    oid::{
        db::rfc6962::{CT_PRECERT_POISON, CT_PRECERT_SIGNING_CERT},
        AssociatedOid, ObjectIdentifier,
    },
};
use p256::ecdsa::{DerSignature, SigningKey};
use rand::rngs::OsRng;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::Encode,
    ext::{pkix::ExtendedKeyUsage, AsExtension, Extension},
    impl_newtype,
    name::Name,
    serial_number::SerialNumber,
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
    time::Validity,
    Certificate,
};

/// One year, the validity period of every test certificate.
const VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The CT poison, buildable as an extension.
struct PoisonExt(Null);

impl AssociatedOid for PoisonExt {
    const OID: ObjectIdentifier = CT_PRECERT_POISON;
}
impl_newtype!(PoisonExt, Null);

impl AsExtension for PoisonExt {
    fn critical(&self, _subject: &Name, _extensions: &[Extension]) -> bool {
        true
    }
}

/// A complete test hierarchy.
pub struct TestChain {
    pub root: Certificate,
    pub intermediate: Certificate,
    /// A final certificate issued by `intermediate`, with a ServerAuth EKU.
    pub leaf: Certificate,
    /// A poisoned precertificate, issued by `pre_issuer` when present and by
    /// `intermediate` otherwise.
    pub precert: Certificate,
    /// The precertificate signing certificate, when this chain has one.
    pub pre_issuer: Option<Certificate>,
}

impl TestChain {
    /// Builds root -> intermediate -> {leaf, precert}.
    pub fn without_pre_issuer() -> Self {
        Self::build(false)
    }

    /// Builds root -> intermediate -> pre-issuer -> precert (the leaf is
    /// still issued by the intermediate).
    pub fn with_pre_issuer() -> Self {
        Self::build(true)
    }

    fn build(with_pre_issuer: bool) -> Self {
        let root_key = SigningKey::random(&mut OsRng);
        let intermediate_key = SigningKey::random(&mut OsRng);
        let pre_issuer_key = SigningKey::random(&mut OsRng);
        let leaf_key = SigningKey::random(&mut OsRng);

        let root_name = name("CN=Test Root CA,O=TesseraCT,C=US");
        let intermediate_name = name("CN=Test Intermediate CA,O=TesseraCT,C=US");
        let pre_issuer_name = name("CN=Test Precert Signing CA,O=TesseraCT,C=US");

        let root = build_cert(Profile::Root, 1, &root_name, &root_key, &root_key, None, false);
        let intermediate = build_cert(
            Profile::SubCA {
                issuer: root_name.clone(),
                path_len_constraint: None,
            },
            2,
            &intermediate_name,
            &intermediate_key,
            &root_key,
            None,
            false,
        );

        let server_auth = ExtendedKeyUsage(vec![ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1")]);
        let leaf = build_cert(
            Profile::Leaf {
                issuer: intermediate_name.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            3,
            &name("CN=leaf.example.com"),
            &leaf_key,
            &intermediate_key,
            Some(&server_auth),
            false,
        );

        let pre_issuer = with_pre_issuer.then(|| {
            build_cert(
                Profile::SubCA {
                    issuer: intermediate_name.clone(),
                    path_len_constraint: None,
                },
                4,
                &pre_issuer_name,
                &pre_issuer_key,
                &intermediate_key,
                Some(&ExtendedKeyUsage(vec![CT_PRECERT_SIGNING_CERT])),
                false,
            )
        });

        let (precert_issuer_name, precert_issuer_key) = if with_pre_issuer {
            (&pre_issuer_name, &pre_issuer_key)
        } else {
            (&intermediate_name, &intermediate_key)
        };
        let precert = build_cert(
            Profile::Leaf {
                issuer: precert_issuer_name.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            5,
            &name("CN=leaf.example.com"),
            &leaf_key,
            precert_issuer_key,
            Some(&server_auth),
            true,
        );

        Self {
            root,
            intermediate,
            leaf,
            precert,
            pre_issuer,
        }
    }

    /// A trust store containing only this chain's root.
    pub fn root_pool(&self) -> CertPool {
        CertPool::new(vec![self.root.clone()]).unwrap()
    }

    /// A submission chain `[leaf, intermediate]` in DER.
    pub fn cert_chain(&self) -> Vec<Vec<u8>> {
        chain_der(&[&self.leaf, &self.intermediate])
    }

    /// A submission chain for the precertificate in DER, including the
    /// pre-issuer when this hierarchy has one.
    pub fn precert_chain(&self) -> Vec<Vec<u8>> {
        match &self.pre_issuer {
            Some(pre_issuer) => chain_der(&[&self.precert, pre_issuer, &self.intermediate]),
            None => chain_der(&[&self.precert, &self.intermediate]),
        }
    }

    /// A timestamp inside every certificate's validity period.
    pub fn now_millis(&self) -> u64 {
        u64::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_millis(),
        )
        .unwrap()
    }

    /// The leaf's NotAfter in milliseconds.
    pub fn leaf_not_after_millis(&self) -> u64 {
        u64::try_from(
            self.leaf
                .tbs_certificate
                .validity
                .not_after
                .to_unix_duration()
                .as_millis(),
        )
        .unwrap()
    }
}

/// DER-encodes a chain of certificates.
pub fn chain_der(certs: &[&Certificate]) -> Vec<Vec<u8>> {
    certs.iter().map(|c| c.to_der().unwrap()).collect()
}

fn name(s: &str) -> Name {
    Name::from_str(s).unwrap()
}

fn build_cert(
    profile: Profile,
    serial: u32,
    subject: &Name,
    subject_key: &SigningKey,
    issuer_key: &SigningKey,
    eku: Option<&ExtendedKeyUsage>,
    poisoned: bool,
) -> Certificate {
    let spki_der = subject_key.verifying_key().to_public_key_der().unwrap();
    let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).unwrap();
    let mut builder = CertificateBuilder::new(
        profile,
        SerialNumber::from(serial),
        Validity::from_now(VALIDITY).unwrap(),
        subject.clone(),
        spki,
        issuer_key,
    )
    .unwrap();
    if let Some(eku) = eku {
        builder.add_extension(eku).unwrap();
    }
    if poisoned {
        builder.add_extension(&PoisonExt(Null)).unwrap();
    }
    builder.build::<DerSignature>().unwrap()
}
