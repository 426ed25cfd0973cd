use const_oid::ObjectIdentifier;
use der::asn1::{PrintableStringRef, Utf8StringRef};
use der::{Decode, DecodePem, Tag, Tagged};
use serde::{Deserialize, Serialize};
use x509_cert::attr::AttributeValue;
use x509_cert::name::Name;
use x509_cert::Certificate;

use crate::error::{Error, Result};

const OID_SURNAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.4");
const OID_SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");
const OID_COUNTRY_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_GIVEN_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.42");

/// Identity fields extracted from a signer certificate's subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalInfo {
    pub first_name: String,
    pub last_name: String,
    pub national_id: String,
    pub country_code: String,
}

/// Extract the signer's identity from a DER-encoded certificate.
pub fn from_der(cert: &[u8]) -> Result<PersonalInfo> {
    let cert =
        Certificate::from_der(cert).map_err(|e| Error::MalformedCertificate(e.to_string()))?;
    personal_info(&cert.tbs_certificate.subject)
}

/// Extract the signer's identity from a PEM-encoded certificate.
pub fn from_pem(cert: &[u8]) -> Result<PersonalInfo> {
    let cert =
        Certificate::from_pem(cert).map_err(|e| Error::MalformedCertificate(e.to_string()))?;
    personal_info(&cert.tbs_certificate.subject)
}

/// Extract identity fields from a certificate subject by OID lookup.
pub fn personal_info(subject: &Name) -> Result<PersonalInfo> {
    let first_name = attribute(subject, OID_GIVEN_NAME)
        .ok_or_else(|| Error::MalformedCertificate("subject has no given name".to_string()))?;
    let last_name = attribute(subject, OID_SURNAME)
        .ok_or_else(|| Error::MalformedCertificate("subject has no surname".to_string()))?;
    let serial = attribute(subject, OID_SERIAL_NUMBER)
        .ok_or_else(|| Error::MalformedCertificate("subject has no serial number".to_string()))?;
    let country_code = attribute(subject, OID_COUNTRY_NAME)
        .ok_or_else(|| Error::MalformedCertificate("subject has no country".to_string()))?;

    Ok(PersonalInfo {
        first_name,
        last_name,
        national_id: strip_semantics_prefix(&serial).to_string(),
        country_code,
    })
}

/// Parse the legacy comma-delimited common name form
/// `surname,givenname,nationalId`, used when the full certificate is not
/// available (the phone-challenge status response only carries the CN).
pub fn from_common_name(common_name: &str) -> Result<PersonalInfo> {
    let parts: Vec<&str> = common_name.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [last_name, first_name, national_id]
            if !last_name.is_empty() && !first_name.is_empty() && !national_id.is_empty() =>
        {
            Ok(PersonalInfo {
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
                national_id: strip_semantics_prefix(national_id).to_string(),
                // The phone-challenge provider issues domestic certificates.
                country_code: "EE".to_string(),
            })
        }
        _ => Err(Error::InvalidCommonName(common_name.to_string())),
    }
}

/// Serial numbers may carry an ETSI natural-person semantics identifier
/// (`PNO<country>-<id>`); callers want the bare national id.
fn strip_semantics_prefix(serial: &str) -> &str {
    match serial.split_once('-') {
        Some((prefix, id)) if prefix.starts_with("PNO") => id,
        _ => serial,
    }
}

fn attribute(subject: &Name, oid: ObjectIdentifier) -> Option<String> {
    subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == oid)
        .and_then(|atv| decode_string(&atv.value))
}

fn decode_string(value: &AttributeValue) -> Option<String> {
    match value.tag() {
        Tag::Utf8String => Utf8StringRef::try_from(value)
            .ok()
            .map(|s| s.as_str().to_string()),
        Tag::PrintableString => PrintableStringRef::try_from(value)
            .ok()
            .map(|s| s.as_str().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use der::asn1::SetOfVec;
    use der::{Any, AnyRef};
    use x509_cert::attr::AttributeTypeAndValue;
    use x509_cert::name::{RdnSequence, RelativeDistinguishedName};

    use super::*;

    fn utf8_atv(oid: ObjectIdentifier, value: &str) -> AttributeTypeAndValue {
        AttributeTypeAndValue {
            oid,
            value: Any::from(AnyRef::from(Utf8StringRef::new(value).unwrap())),
        }
    }

    fn printable_atv(oid: ObjectIdentifier, value: &str) -> AttributeTypeAndValue {
        AttributeTypeAndValue {
            oid,
            value: Any::from(AnyRef::from(PrintableStringRef::new(value).unwrap())),
        }
    }

    fn rdn(atv: AttributeTypeAndValue) -> RelativeDistinguishedName {
        RelativeDistinguishedName(SetOfVec::try_from(vec![atv]).unwrap())
    }

    fn example_subject() -> Name {
        RdnSequence(vec![
            rdn(printable_atv(OID_COUNTRY_NAME, "EE")),
            rdn(utf8_atv(OID_SURNAME, "SMITH")),
            rdn(utf8_atv(OID_GIVEN_NAME, "JOHN")),
            rdn(utf8_atv(OID_SERIAL_NUMBER, "PNOEE-38001085718")),
        ])
    }

    #[test]
    fn subject_yields_expected_identity() {
        let info = personal_info(&example_subject()).unwrap();
        assert_eq!(
            info,
            PersonalInfo {
                first_name: "JOHN".to_string(),
                last_name: "SMITH".to_string(),
                national_id: "38001085718".to_string(),
                country_code: "EE".to_string(),
            }
        );
    }

    #[test]
    fn missing_attribute_is_malformed() {
        let subject = RdnSequence(vec![
            rdn(utf8_atv(OID_SURNAME, "SMITH")),
            rdn(utf8_atv(OID_GIVEN_NAME, "JOHN")),
        ]);
        assert!(matches!(
            personal_info(&subject),
            Err(Error::MalformedCertificate(_))
        ));
    }

    #[test]
    fn garbage_der_is_malformed() {
        assert!(matches!(
            from_der(b"not a certificate"),
            Err(Error::MalformedCertificate(_))
        ));
    }

    #[test]
    fn garbage_pem_is_malformed() {
        assert!(matches!(
            from_pem(b"-----BEGIN NONSENSE-----"),
            Err(Error::MalformedCertificate(_))
        ));
    }

    #[test]
    fn common_name_fallback_parses_three_parts() {
        let info = from_common_name("SMITH,JOHN,38001085718").unwrap();
        assert_eq!(info.first_name, "JOHN");
        assert_eq!(info.last_name, "SMITH");
        assert_eq!(info.national_id, "38001085718");
    }

    #[test]
    fn common_name_fallback_rejects_wrong_arity() {
        assert!(matches!(
            from_common_name("JOHN SMITH"),
            Err(Error::InvalidCommonName(_))
        ));
        assert!(matches!(
            from_common_name("SMITH,JOHN,123,EXTRA"),
            Err(Error::InvalidCommonName(_))
        ));
        assert!(matches!(
            from_common_name("SMITH,,123"),
            Err(Error::InvalidCommonName(_))
        ));
    }

    #[test]
    fn semantics_prefix_is_stripped_only_when_present() {
        assert_eq!(strip_semantics_prefix("PNOEE-38001085718"), "38001085718");
        assert_eq!(strip_semantics_prefix("38001085718"), "38001085718");
        assert_eq!(strip_semantics_prefix("AB-123"), "AB-123");
    }
}
