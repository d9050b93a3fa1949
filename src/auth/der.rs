//! Pure JWK ↔ public-key PEM conversion.
//!
//! External identity providers publish RSA keys as JWK members (`n`/`e`,
//! base64url); the signing plumbing wants SubjectPublicKeyInfo PEM. The DER
//! construction is small enough to do by hand:
//!
//! ```text
//! SubjectPublicKeyInfo ::= SEQUENCE {
//!   algorithm        SEQUENCE { OID rsaEncryption, NULL },
//!   subjectPublicKey BIT STRING {
//!     RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }
//!   }
//! }
//! ```
//!
//! Both directions live here, with no I/O, so the bit-level encoding is
//! testable in isolation.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use thiserror::Error;

/// DER tag bytes used in SubjectPublicKeyInfo.
const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;

/// DER encoding of the rsaEncryption OID (1.2.840.113549.1.1.1) plus NULL
/// parameters, i.e. the complete AlgorithmIdentifier body.
const RSA_ALGORITHM_IDENTIFIER: [u8; 13] = [
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// Errors from JWK/PEM conversion.
#[derive(Debug, Error)]
pub enum DerError {
    /// Missing armor lines or non-base64 body.
    #[error("Invalid PEM structure")]
    InvalidPem,

    /// Base64url component failed to decode.
    #[error("Invalid base64url component: {0}")]
    InvalidComponent(String),

    /// A DER element had an unexpected tag.
    #[error("Unexpected DER tag: expected {expected:#04x}, found {found:#04x}")]
    UnexpectedTag {
        /// Tag that was required at this position.
        expected: u8,
        /// Tag actually present.
        found: u8,
    },

    /// The DER structure ended early.
    #[error("Truncated DER structure")]
    Truncated,

    /// The key is not an rsaEncryption key.
    #[error("Not an RSA public key")]
    NotRsa,
}

/// Build a SubjectPublicKeyInfo PEM from base64url JWK components.
///
/// The modulus and exponent are treated as unsigned big-endian integers; a
/// leading zero byte is added where the DER INTEGER sign rule requires it.
/// The base64 body is wrapped at 64 characters per line.
pub fn jwk_to_public_key_pem(n: &str, e: &str) -> Result<String, DerError> {
    let modulus = URL_SAFE_NO_PAD
        .decode(n)
        .map_err(|_| DerError::InvalidComponent("n".to_string()))?;
    let exponent = URL_SAFE_NO_PAD
        .decode(e)
        .map_err(|_| DerError::InvalidComponent("e".to_string()))?;

    let rsa_public_key = der_sequence(&[der_integer(&modulus), der_integer(&exponent)].concat());

    let mut algorithm = Vec::with_capacity(RSA_ALGORITHM_IDENTIFIER.len() + 4);
    algorithm.push(TAG_SEQUENCE);
    algorithm.extend_from_slice(&der_length(RSA_ALGORITHM_IDENTIFIER.len()));
    algorithm.extend_from_slice(&RSA_ALGORITHM_IDENTIFIER);

    let spki = der_sequence(&[algorithm, der_bit_string(&rsa_public_key)].concat());

    Ok(wrap_pem("PUBLIC KEY", &spki))
}

/// Parse a SubjectPublicKeyInfo PEM back into base64url JWK components.
pub fn public_key_pem_to_jwk(pem: &str) -> Result<RsaComponents, DerError> {
    let der = unwrap_pem(pem, "PUBLIC KEY")?;
    spki_to_jwk(&der)
}

/// Parse SubjectPublicKeyInfo DER into base64url JWK components.
pub fn spki_to_jwk(der: &[u8]) -> Result<RsaComponents, DerError> {
    let mut outer = Reader::new(der);
    let mut spki = Reader::new(outer.read(TAG_SEQUENCE)?);

    let algorithm = spki.read(TAG_SEQUENCE)?;
    if algorithm != RSA_ALGORITHM_IDENTIFIER {
        return Err(DerError::NotRsa);
    }

    let bit_string = spki.read(TAG_BIT_STRING)?;
    // First content byte of a BIT STRING is the unused-bit count.
    let key_der = match bit_string.split_first() {
        Some((0, rest)) => rest,
        _ => return Err(DerError::Truncated),
    };

    let mut key = Reader::new(Reader::new(key_der).read(TAG_SEQUENCE)?);
    let modulus = strip_leading_zeros(key.read(TAG_INTEGER)?);
    let exponent = strip_leading_zeros(key.read(TAG_INTEGER)?);

    Ok(RsaComponents {
        n: URL_SAFE_NO_PAD.encode(modulus),
        e: URL_SAFE_NO_PAD.encode(exponent),
    })
}

/// RSA public key components in JWK form (base64url, unsigned big-endian).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaComponents {
    /// Modulus.
    pub n: String,
    /// Public exponent.
    pub e: String,
}

/// Wrap DER bytes in PEM armor, base64 at 64-character line width.
pub(crate) fn wrap_pem(label: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {label}-----\n");
    for chunk in body.as_bytes().chunks(64) {
        // base64 output is always ASCII
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}

/// Strip PEM armor and decode the base64 body.
pub(crate) fn unwrap_pem(pem: &str, label: &str) -> Result<Vec<u8>, DerError> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let body: String = pem
        .lines()
        .map(str::trim)
        .skip_while(|l| *l != begin)
        .skip(1)
        .take_while(|l| *l != end)
        .collect();
    if body.is_empty() {
        return Err(DerError::InvalidPem);
    }
    STANDARD.decode(body).map_err(|_| DerError::InvalidPem)
}

// ── DER primitives ────────────────────────────────────────────────────────

/// Encode a DER length (short form under 128, long form above).
fn der_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![u8::try_from(len).unwrap_or_default()];
    }
    let bytes: Vec<u8> = len
        .to_be_bytes()
        .into_iter()
        .skip_while(|b| *b == 0)
        .collect();
    let mut out = vec![0x80 | u8::try_from(bytes.len()).unwrap_or_default()];
    out.extend_from_slice(&bytes);
    out
}

/// Encode an unsigned big-endian magnitude as a DER INTEGER.
///
/// Leading zeros are stripped, then one is re-added if the high bit would
/// make the value read as negative.
fn der_integer(magnitude: &[u8]) -> Vec<u8> {
    let stripped = strip_leading_zeros(magnitude);
    let needs_sign_byte = stripped.first().is_none_or(|b| b & 0x80 != 0);
    let content_len = stripped.len() + usize::from(needs_sign_byte);

    let mut out = vec![TAG_INTEGER];
    out.extend_from_slice(&der_length(content_len));
    if needs_sign_byte {
        out.push(0x00);
    }
    out.extend_from_slice(stripped);
    out
}

fn der_sequence(content: &[u8]) -> Vec<u8> {
    let mut out = vec![TAG_SEQUENCE];
    out.extend_from_slice(&der_length(content.len()));
    out.extend_from_slice(content);
    out
}

fn der_bit_string(content: &[u8]) -> Vec<u8> {
    let mut out = vec![TAG_BIT_STRING];
    out.extend_from_slice(&der_length(content.len() + 1));
    out.push(0x00); // no unused bits
    out.extend_from_slice(content);
    out
}

/// Remove leading zero bytes, keeping at least one byte.
fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first_nonzero = bytes.iter().position(|b| *b != 0);
    match first_nonzero {
        Some(idx) => &bytes[idx..],
        None if bytes.is_empty() => bytes,
        None => &bytes[bytes.len() - 1..],
    }
}

/// Minimal DER reader over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read one TLV element, requiring `tag`, returning its content.
    fn read(&mut self, tag: u8) -> Result<&'a [u8], DerError> {
        let found = *self.data.get(self.pos).ok_or(DerError::Truncated)?;
        if found != tag {
            return Err(DerError::UnexpectedTag {
                expected: tag,
                found,
            });
        }
        self.pos += 1;

        let first = *self.data.get(self.pos).ok_or(DerError::Truncated)?;
        self.pos += 1;
        let len = if first < 0x80 {
            usize::from(first)
        } else {
            let num_bytes = usize::from(first & 0x7f);
            if num_bytes == 0 || num_bytes > std::mem::size_of::<usize>() {
                return Err(DerError::Truncated);
            }
            let mut len = 0usize;
            for _ in 0..num_bytes {
                let byte = *self.data.get(self.pos).ok_or(DerError::Truncated)?;
                self.pos += 1;
                len = (len << 8) | usize::from(byte);
            }
            len
        };

        let start = self.pos;
        let end = start.checked_add(len).ok_or(DerError::Truncated)?;
        if end > self.data.len() {
            return Err(DerError::Truncated);
        }
        self.pos = end;
        Ok(&self.data[start..end])
    }
}
