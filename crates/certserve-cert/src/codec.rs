//! PEM armor for certificates and private keys
//!
//! Certificates are stored as DER inside a `CERTIFICATE` block, private keys as
//! PKCS#8 inside a `PRIVATE KEY` block.

use pem::{EncodeConfig, LineEnding, Pem};
use thiserror::Error;

/// Label of a PEM block holding a DER encoded X.509 certificate
pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Label of a PEM block holding a PKCS#8 encoded private key
pub const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed PEM: {0}")]
    Decode(String),

    #[error("Unexpected PEM label: expected {expected}, found {found}")]
    LabelMismatch { expected: String, found: String },

    #[error("No {0} block found")]
    Empty(String),
}

/// Wrap raw bytes in a PEM block with the given label
pub fn encode(label: &str, bytes: &[u8]) -> String {
    let block = Pem::new(label, bytes.to_vec());
    pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Decode the first PEM block in `text`, requiring its label to be `expected_label`
pub fn decode(text: &str, expected_label: &str) -> Result<(String, Vec<u8>), CodecError> {
    let block = pem::parse(text).map_err(|e| CodecError::Decode(e.to_string()))?;

    if block.tag() != expected_label {
        return Err(CodecError::LabelMismatch {
            expected: expected_label.to_string(),
            found: block.tag().to_string(),
        });
    }

    Ok((block.tag().to_string(), block.into_contents()))
}

pub fn encode_certificate(der: &[u8]) -> String {
    encode(CERTIFICATE_LABEL, der)
}

pub fn encode_private_key(pkcs8: &[u8]) -> String {
    encode(PRIVATE_KEY_LABEL, pkcs8)
}

pub fn decode_certificate(text: &str) -> Result<Vec<u8>, CodecError> {
    decode(text, CERTIFICATE_LABEL).map(|(_, der)| der)
}

pub fn decode_private_key(text: &str) -> Result<Vec<u8>, CodecError> {
    decode(text, PRIVATE_KEY_LABEL).map(|(_, der)| der)
}

/// Decode every `CERTIFICATE` block in order, skipping blocks with other labels
///
/// Used for chains (leaf first) as delivered by ACME servers.
pub fn decode_certificate_chain(text: &str) -> Result<Vec<Vec<u8>>, CodecError> {
    let blocks = pem::parse_many(text).map_err(|e| CodecError::Decode(e.to_string()))?;

    let chain: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == CERTIFICATE_LABEL)
        .map(Pem::into_contents)
        .collect();

    if chain.is_empty() {
        return Err(CodecError::Empty(CERTIFICATE_LABEL.to_string()));
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_arbitrary_bytes() {
        let payloads: [&[u8]; 3] = [b"abc", &[0u8, 255, 1, 254, 127], &[0x5a; 300]];

        for payload in payloads {
            let text = encode("OPAQUE DATA", payload);
            let (label, bytes) = decode(&text, "OPAQUE DATA").unwrap();
            assert_eq!(label, "OPAQUE DATA");
            assert_eq!(bytes, payload);
        }
    }

    #[test]
    fn test_encode_format() {
        let text = encode_certificate(&[1, 2, 3]);
        assert!(text.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(text.trim_end().ends_with("-----END CERTIFICATE-----"));
        assert!(!text.contains('\r'));
    }

    #[test]
    fn test_label_mismatch() {
        let text = encode_private_key(b"key");
        let err = decode_certificate(&text).unwrap_err();
        match err {
            CodecError::LabelMismatch { expected, found } => {
                assert_eq!(expected, "CERTIFICATE");
                assert_eq!(found, "PRIVATE KEY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_armor() {
        assert!(matches!(
            decode("not pem at all", CERTIFICATE_LABEL),
            Err(CodecError::Decode(_))
        ));
        assert!(matches!(
            decode(
                "-----BEGIN CERTIFICATE-----\n!!!!\n-----END CERTIFICATE-----\n",
                CERTIFICATE_LABEL
            ),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_chain_keeps_order() {
        let text = format!(
            "{}{}{}",
            encode_certificate(b"leaf"),
            encode_private_key(b"ignored"),
            encode_certificate(b"issuer")
        );

        let chain = decode_certificate_chain(&text).unwrap();
        assert_eq!(chain, vec![b"leaf".to_vec(), b"issuer".to_vec()]);
    }

    #[test]
    fn test_decode_chain_without_certificates() {
        let text = encode_private_key(b"key");
        assert!(matches!(
            decode_certificate_chain(&text),
            Err(CodecError::Empty(_))
        ));
    }
}
