//! TSIG request signing (RFC 8945).
//!
//! Requests are signed only; the measurement loop never verifies response
//! signatures, it only extracts the RCODE.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use domain::base::Rtype;
use domain::base::iana::Class;
use domain::base::name::Name;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

use crate::{EncodeError, parse_name};

/// How far the server's clock may drift from the time-signed field.
const TSIG_FUDGE_SECS: u16 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigAlgorithm {
    HmacSha1,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl TsigAlgorithm {
    /// The algorithm's name as it appears on the wire.
    fn wire_name(self) -> &'static str {
        match self {
            TsigAlgorithm::HmacSha1 => "hmac-sha1",
            TsigAlgorithm::HmacSha256 => "hmac-sha256",
            TsigAlgorithm::HmacSha384 => "hmac-sha384",
            TsigAlgorithm::HmacSha512 => "hmac-sha512",
        }
    }

    fn parse(text: &str) -> Result<Self, EncodeError> {
        match text.to_ascii_lowercase().as_str() {
            "hmac-sha1" => Ok(TsigAlgorithm::HmacSha1),
            "hmac-sha256" => Ok(TsigAlgorithm::HmacSha256),
            "hmac-sha384" => Ok(TsigAlgorithm::HmacSha384),
            "hmac-sha512" => Ok(TsigAlgorithm::HmacSha512),
            other => Err(EncodeError::Unsupported(format!(
                "TSIG algorithm `{other}`"
            ))),
        }
    }
}

/// A shared secret for signing requests, from `[alg:]name:base64-secret`.
#[derive(Debug)]
pub struct TsigKey {
    name: Name<Vec<u8>>,
    algorithm: TsigAlgorithm,
    secret: Vec<u8>,
}

impl TsigKey {
    pub fn parse(spec: &str) -> Result<Self, EncodeError> {
        let parts = spec.split(':').collect::<Vec<_>>();
        let (algorithm, name, secret) = match parts.as_slice() {
            [name, secret] => (TsigAlgorithm::HmacSha256, *name, *secret),
            [alg, name, secret] => (TsigAlgorithm::parse(alg)?, *name, *secret),
            _ => {
                return Err(EncodeError::Malformed(format!(
                    "expected [alg:]name:secret, got `{spec}`"
                )));
            }
        };

        let secret = BASE64
            .decode(secret)
            .map_err(|_| EncodeError::Malformed("TSIG secret is not valid base64".to_string()))?;

        Ok(Self {
            name: parse_name(name)?,
            algorithm,
            secret,
        })
    }

    fn compute_mac(&self, chunks: &[&[u8]]) -> Result<Vec<u8>, EncodeError> {
        match self.algorithm {
            TsigAlgorithm::HmacSha1 => mac_over::<Hmac<Sha1>>(&self.secret, chunks),
            TsigAlgorithm::HmacSha256 => mac_over::<Hmac<Sha256>>(&self.secret, chunks),
            TsigAlgorithm::HmacSha384 => mac_over::<Hmac<Sha384>>(&self.secret, chunks),
            TsigAlgorithm::HmacSha512 => mac_over::<Hmac<Sha512>>(&self.secret, chunks),
        }
    }
}

fn mac_over<M: Mac + KeyInit>(secret: &[u8], chunks: &[&[u8]]) -> Result<Vec<u8>, EncodeError> {
    let mut mac = <M as Mac>::new_from_slice(secret)
        .map_err(|e| EncodeError::Build(format!("bad TSIG secret: {e}")))?;
    for chunk in chunks {
        mac.update(chunk);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Appends a TSIG record to a complete unsigned message.
pub(crate) fn sign(mut message: Vec<u8>, key: &TsigKey) -> Result<Vec<u8>, EncodeError> {
    let original_id = [message[0], message[1]];
    let algorithm = parse_name(key.algorithm.wire_name())?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let time_signed = time48(now);
    let fudge = TSIG_FUDGE_SECS.to_be_bytes();

    // The MAC covers the unsigned message followed by the TSIG variables
    // (RFC 8945 §4.3.3): key name, class, TTL, algorithm, time, fudge,
    // error and other-data length.
    let mac = key.compute_mac(&[
        &message,
        key.name.as_slice(),
        &Class::ANY.to_int().to_be_bytes(),
        &0u32.to_be_bytes(),
        algorithm.as_slice(),
        &time_signed,
        &fudge,
        &0u16.to_be_bytes(),
        &0u16.to_be_bytes(),
    ])?;

    let mut rdata = Vec::with_capacity(algorithm.len() + mac.len() + 16);
    rdata.extend_from_slice(algorithm.as_slice());
    rdata.extend_from_slice(&time_signed);
    rdata.extend_from_slice(&fudge);
    rdata.extend_from_slice(&(mac.len() as u16).to_be_bytes());
    rdata.extend_from_slice(&mac);
    rdata.extend_from_slice(&original_id);
    rdata.extend_from_slice(&0u16.to_be_bytes());
    rdata.extend_from_slice(&0u16.to_be_bytes());

    message.extend_from_slice(key.name.as_slice());
    message.extend_from_slice(&Rtype::TSIG.to_int().to_be_bytes());
    message.extend_from_slice(&Class::ANY.to_int().to_be_bytes());
    message.extend_from_slice(&0u32.to_be_bytes());
    message.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    message.extend_from_slice(&rdata);

    let arcount = u16::from_be_bytes([message[10], message[11]]).wrapping_add(1);
    message[10..12].copy_from_slice(&arcount.to_be_bytes());

    Ok(message)
}

fn time48(secs: u64) -> [u8; 6] {
    let bytes = secs.to_be_bytes();
    [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_part_spec_with_default_algorithm() {
        let key = TsigKey::parse("mykey:c2VjcmV0c2VjcmV0").unwrap();

        assert_eq!(key.algorithm, TsigAlgorithm::HmacSha256);
        assert_eq!(key.secret, b"secretsecret");
    }

    #[test]
    fn parses_explicit_algorithm() {
        let key = TsigKey::parse("hmac-sha512:mykey:c2VjcmV0c2VjcmV0").unwrap();

        assert_eq!(key.algorithm, TsigAlgorithm::HmacSha512);
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(matches!(
            TsigKey::parse("hmac-md4:mykey:c2VjcmV0c2VjcmV0"),
            Err(EncodeError::Unsupported(_))
        ));
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(TsigKey::parse("mykey:!!!").is_err());
    }

    #[test]
    fn mac_length_matches_algorithm() {
        let key = TsigKey::parse("mykey:c2VjcmV0c2VjcmV0").unwrap();
        let mac = key.compute_mac(&[b"payload"]).unwrap();

        assert_eq!(mac.len(), 32);
    }
}
