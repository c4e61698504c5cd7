// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Precertificate handling: poison detection, pre-issuer detection, and
//! reconstruction of the defanged `TBSCertificate` that gets committed to
//! the log (RFC 6962 §3.1).

use crate::StaticCTError;
use der::{
    asn1::{Null, OctetString},
    oid::{
        db::rfc5280::ID_CE_AUTHORITY_KEY_IDENTIFIER,
        db::rfc6962::{CT_PRECERT_POISON, CT_PRECERT_SIGNING_CERT},
        AssociatedOid, ObjectIdentifier,
    },
};
use x509_cert::{
    der::Encode,
    ext::pkix::{AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage},
    impl_newtype, Certificate, TbsCertificate,
};

/// Precertificate poison extension, decodable with [`TbsCertificate::get`].
#[derive(Debug)]
struct CTPrecertPoison(Null);

impl AssociatedOid for CTPrecertPoison {
    const OID: ObjectIdentifier = CT_PRECERT_POISON;
}
impl_newtype!(CTPrecertPoison, Null);

/// Reports whether the certificate carries the CT poison extension.
///
/// # Errors
///
/// Returns [`StaticCTError::InvalidCTPoison`] if the poison is present but
/// not critical, or its value is not an ASN.1 NULL.
pub fn is_precert(cert: &Certificate) -> Result<bool, StaticCTError> {
    match cert.tbs_certificate.get::<CTPrecertPoison>()? {
        Some((true, _)) => Ok(true),
        Some((false, _)) => Err(StaticCTError::InvalidCTPoison),
        None => Ok(false),
    }
}

/// Reports whether the certificate is a precertificate signing certificate:
/// a CA certificate carrying the CT extended key usage.
///
/// # Errors
///
/// Returns an error if the relevant extensions fail to decode.
pub fn is_pre_issuer(cert: &Certificate) -> Result<bool, StaticCTError> {
    let has_ct_eku = match cert.tbs_certificate.get::<ExtendedKeyUsage>()? {
        Some((_, eku)) => eku.0.iter().any(|usage| *usage == CT_PRECERT_SIGNING_CERT),
        None => false,
    };
    if !has_ct_eku {
        return Ok(false);
    }
    Ok(cert
        .tbs_certificate
        .get::<BasicConstraints>()?
        .is_some_and(|(_, bc)| bc.ca))
}

/// Builds the defanged `TBSCertificate` committed for a precertificate,
/// returning its DER encoding.
///
/// The CT poison extension is removed (there must be exactly one),
/// preserving the order of the surviving extensions. If `pre_issuer` is the
/// precertificate signing certificate that signed this precert, the
/// issuance information is rewritten to reflect the next issuer in the
/// chain: the TBS `Issuer` becomes the pre-issuer's issuer, and when both
/// certificates carry an AKI extension it is replaced with the
/// pre-issuer's. When either side lacks an AKI, the extension is left
/// untouched.
///
/// This is a pure function of its inputs: identical inputs yield
/// byte-identical output.
///
/// # Errors
///
/// Returns [`StaticCTError::MissingPoison`] if no poison extension is
/// present (which also makes the function idempotence-safe: re-applying it
/// to its own output fails), [`StaticCTError::DuplicatePoison`] if more
/// than one is, and DER errors from re-encoding.
pub fn build_precert_tbs(
    tbs: &TbsCertificate,
    pre_issuer: Option<&TbsCertificate>,
) -> Result<Vec<u8>, StaticCTError> {
    let mut tbs = tbs.clone();

    let exts = tbs
        .extensions
        .as_mut()
        .ok_or(StaticCTError::MissingPoison)?;

    let mut poison_indexes = exts
        .iter()
        .enumerate()
        .filter(|(_, ext)| ext.extn_id == CT_PRECERT_POISON)
        .map(|(i, _)| i);
    let poison_idx = poison_indexes.next().ok_or(StaticCTError::MissingPoison)?;
    if poison_indexes.next().is_some() {
        return Err(StaticCTError::DuplicatePoison);
    }
    exts.remove(poison_idx);

    if let Some(issuer) = pre_issuer {
        tbs.issuer = issuer.issuer.clone();

        let issuer_aki = match issuer.get::<AuthorityKeyIdentifier>()? {
            Some((_, aki)) => Some(OctetString::new(aki.to_der()?)?),
            None => None,
        };
        let precert_aki_idx = exts
            .iter()
            .position(|ext| ext.extn_id == ID_CE_AUTHORITY_KEY_IDENTIFIER);
        if let (Some(idx), Some(aki)) = (precert_aki_idx, issuer_aki) {
            exts[idx].extn_value = aki;
        }
    }

    Ok(tbs.to_der()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use der::Decode;
    use x509_cert::ext::Extension;

    #[test]
    fn test_is_precert() {
        let chain = TestChain::with_pre_issuer();
        assert!(is_precert(&chain.precert).unwrap());
        assert!(!is_precert(&chain.root).unwrap());

        // A non-critical poison is rejected outright.
        let mut cert = chain.precert.clone();
        for ext in cert.tbs_certificate.extensions.as_mut().unwrap() {
            if ext.extn_id == CT_PRECERT_POISON {
                ext.critical = false;
            }
        }
        assert!(is_precert(&cert).is_err());

        // So is a poison with a non-NULL value.
        let mut cert = chain.precert.clone();
        for ext in cert.tbs_certificate.extensions.as_mut().unwrap() {
            if ext.extn_id == CT_PRECERT_POISON {
                ext.extn_value = OctetString::new([]).unwrap();
            }
        }
        assert!(is_precert(&cert).is_err());
    }

    #[test]
    fn test_is_pre_issuer() {
        let chain = TestChain::with_pre_issuer();
        assert!(is_pre_issuer(&chain.pre_issuer.clone().unwrap()).unwrap());
        assert!(!is_pre_issuer(&chain.intermediate).unwrap());
        assert!(!is_pre_issuer(&chain.precert).unwrap());
    }

    #[test]
    fn test_build_precert_tbs() {
        let chain = TestChain::with_pre_issuer();
        let precert = &chain.precert.tbs_certificate;
        let pre_issuer = &chain.pre_issuer.as_ref().unwrap().tbs_certificate;

        let der = build_precert_tbs(precert, Some(pre_issuer)).unwrap();
        let tbs = TbsCertificate::from_der(&der).unwrap();

        // Poison is gone.
        assert!(precert.get::<CTPrecertPoison>().unwrap().is_some());
        assert!(tbs.get::<CTPrecertPoison>().unwrap().is_none());

        // Issuer now points at the pre-issuer's issuer.
        assert_ne!(tbs.issuer, precert.issuer);
        assert_eq!(tbs.issuer, pre_issuer.issuer);

        // AKI was replaced with the pre-issuer's.
        let old_aki = precert.get::<AuthorityKeyIdentifier>().unwrap().unwrap();
        let new_aki = tbs.get::<AuthorityKeyIdentifier>().unwrap().unwrap();
        let pre_issuer_aki = pre_issuer.get::<AuthorityKeyIdentifier>().unwrap().unwrap();
        assert_ne!(new_aki, old_aki);
        assert_eq!(new_aki, pre_issuer_aki);

        // Determinism.
        assert_eq!(der, build_precert_tbs(precert, Some(pre_issuer)).unwrap());
    }

    #[test]
    fn test_build_precert_tbs_no_pre_issuer() {
        let chain = TestChain::without_pre_issuer();
        let precert = &chain.precert.tbs_certificate;

        let der = build_precert_tbs(precert, None).unwrap();
        let tbs = TbsCertificate::from_der(&der).unwrap();

        // Only the poison is removed; issuance information is untouched.
        assert!(tbs.get::<CTPrecertPoison>().unwrap().is_none());
        assert_eq!(tbs.issuer, precert.issuer);
        assert_eq!(
            tbs.extensions.as_ref().unwrap().len(),
            precert.extensions.as_ref().unwrap().len() - 1
        );
    }

    #[test]
    fn test_build_precert_tbs_idempotence_fails() {
        let chain = TestChain::without_pre_issuer();
        let der = build_precert_tbs(&chain.precert.tbs_certificate, None).unwrap();
        let tbs = TbsCertificate::from_der(&der).unwrap();
        assert!(matches!(
            build_precert_tbs(&tbs, None),
            Err(StaticCTError::MissingPoison)
        ));
    }

    #[test]
    fn test_build_precert_tbs_duplicate_poison() {
        let chain = TestChain::without_pre_issuer();
        let mut tbs = chain.precert.tbs_certificate.clone();
        let poison = tbs
            .extensions
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.extn_id == CT_PRECERT_POISON)
            .cloned()
            .unwrap();
        tbs.extensions.as_mut().unwrap().push(Extension {
            extn_id: poison.extn_id,
            critical: poison.critical,
            extn_value: poison.extn_value,
        });
        assert!(matches!(
            build_precert_tbs(&tbs, None),
            Err(StaticCTError::DuplicatePoison)
        ));
    }
}
