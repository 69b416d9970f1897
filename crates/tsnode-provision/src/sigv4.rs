//! AWS Signature Version 4 for form-encoded POST requests.

use chrono::{DateTime, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "content-type;host;x-amz-date";

/// Headers a signed request must carry besides `Host` and `Content-Type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignedHeaders {
    pub amz_date: String,
    pub authorization: String,
}

pub(crate) struct Signer<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

impl Signer<'_> {
    pub fn sign(
        &self,
        host: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<SignedHeaders, InvalidLength> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_request = format!(
            "POST\n/\n\ncontent-type:{FORM_CONTENT_TYPE}\nhost:{host}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{}",
            hex::encode(Sha256::digest(body.as_bytes()))
        );

        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(self.secret_access_key, &date, self.region, self.service)?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(SignedHeaders {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
                self.access_key_id
            ),
            amz_date,
        })
    }
}

pub(crate) fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<[u8; 32], InvalidLength> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_signing_key_matches_published_vector() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .expect("signing key");
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_authorization_header_shape() {
        let signer = Signer {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "secret",
            region: "eu-west-1",
            service: "ec2",
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).single().expect("time");
        let signed = signer
            .sign("ec2.eu-west-1.amazonaws.com", "Action=DescribeRegions", now)
            .expect("sign");

        assert_eq!(signed.amz_date, "20240309T140507Z");
        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240309/eu-west-1/ec2/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date, Signature="
        ));
        let signature = signed.authorization.rsplit('=').next().expect("signature");
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_signature_depends_on_body() {
        let signer = Signer {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "secret",
            region: "eu-west-1",
            service: "ec2",
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).single().expect("time");
        let a = signer
            .sign("ec2.eu-west-1.amazonaws.com", "Action=DescribeRegions", now)
            .expect("sign");
        let b = signer
            .sign("ec2.eu-west-1.amazonaws.com", "Action=DescribeImages", now)
            .expect("sign");
        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn test_empty_secret_signs() {
        let signer = Signer {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "",
            region: "eu-west-1",
            service: "ec2",
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).single().expect("time");
        assert!(signer.sign("ec2.eu-west-1.amazonaws.com", "", now).is_ok());
    }
}
