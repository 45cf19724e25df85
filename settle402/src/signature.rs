//! Decomposition of 65-byte wallet signatures for on-chain verification.
//!
//! Wallets return `r ‖ s ‖ v` as one opaque blob. The (v, r, s) overload of
//! `transferWithAuthorization` wants the three parts separately, with `v` in
//! the legacy `{27, 28}` encoding.

use alloy_primitives::{Address, B256, Signature};

/// Byte length of an ECDSA signature as produced by wallets.
pub const SIGNATURE_LENGTH: usize = 65;

/// Errors from decomposing or recovering a signature.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The signature is not exactly 65 bytes.
    #[error("signature must be {SIGNATURE_LENGTH} bytes, got {0}")]
    InvalidLength(usize),
    /// The trailing recovery byte is not one of `0`, `1`, `27`, `28`.
    #[error("signature has an invalid recovery id")]
    InvalidRecoveryId,
    /// Public key recovery failed.
    #[error("signer recovery failed: {0}")]
    Recovery(String),
}

/// A signature split into the components consumed by the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureParts {
    /// Recovery id in `{27, 28}`.
    pub v: u8,
    /// First 32 bytes.
    pub r: B256,
    /// Second 32 bytes, normalized to the lower half of the curve order.
    pub s: B256,
}

impl SignatureParts {
    /// Splits a 65-byte signature.
    ///
    /// High-`s` signatures are normalized (flipping the parity), since token
    /// contracts following EIP-2 reject the upper half of the curve order.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError`] if the length or recovery byte is invalid.
    pub fn decompose(bytes: &[u8]) -> Result<Self, SignatureError> {
        let signature = parse(bytes)?;
        Ok(Self::from(signature))
    }
}

impl From<Signature> for SignatureParts {
    fn from(signature: Signature) -> Self {
        let signature = signature.normalized_s();
        Self {
            v: 27 + u8::from(signature.v()),
            r: B256::from(signature.r()),
            s: B256::from(signature.s()),
        }
    }
}

/// Parses a 65-byte signature.
///
/// # Errors
///
/// Returns [`SignatureError`] if the length or recovery byte is invalid.
pub fn parse(bytes: &[u8]) -> Result<Signature, SignatureError> {
    if bytes.len() != SIGNATURE_LENGTH {
        return Err(SignatureError::InvalidLength(bytes.len()));
    }
    Signature::from_raw(bytes).map_err(|_| SignatureError::InvalidRecoveryId)
}

/// Recovers the address that signed `prehash`.
///
/// # Errors
///
/// Returns [`SignatureError`] if the signature is malformed or recovery fails.
pub fn recover(bytes: &[u8], prehash: &B256) -> Result<Address, SignatureError> {
    parse(bytes)?
        .recover_address_from_prehash(prehash)
        .map_err(|e| SignatureError::Recovery(e.to_string()))
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{U256, b256};

    use super::*;

    fn raw(r: B256, s: B256, v: u8) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SIGNATURE_LENGTH);
        bytes.extend_from_slice(r.as_slice());
        bytes.extend_from_slice(s.as_slice());
        bytes.push(v);
        bytes
    }

    #[test]
    fn test_decompose_accepts_both_v_encodings() {
        let r = b256!("1111111111111111111111111111111111111111111111111111111111111111");
        let s = b256!("2222222222222222222222222222222222222222222222222222222222222222");
        for (raw_v, expected) in [(27u8, 27u8), (28, 28), (0, 27), (1, 28)] {
            let parts = SignatureParts::decompose(&raw(r, s, raw_v)).unwrap();
            assert_eq!(parts.v, expected);
            assert_eq!(parts.r, r);
            assert_eq!(parts.s, s);
        }
    }

    #[test]
    fn test_decompose_normalizes_high_s() {
        let r = b256!("1111111111111111111111111111111111111111111111111111111111111111");
        // secp256k1 order n minus one is in the upper half.
        let high_s = b256!("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364140");
        let parts = SignatureParts::decompose(&raw(r, high_s, 27)).unwrap();
        assert_eq!(U256::from_be_bytes(parts.s.0), U256::from(1u8));
        assert_eq!(parts.v, 28);
    }

    #[test]
    fn test_decompose_rejects_wrong_length() {
        assert_eq!(
            SignatureParts::decompose(&[0u8; 64]),
            Err(SignatureError::InvalidLength(64))
        );
        assert_eq!(
            SignatureParts::decompose(&[]),
            Err(SignatureError::InvalidLength(0))
        );
    }

    #[test]
    fn test_decompose_rejects_bad_recovery_byte() {
        let mut bytes = vec![1u8; SIGNATURE_LENGTH];
        bytes[64] = 5;
        assert_eq!(
            SignatureParts::decompose(&bytes),
            Err(SignatureError::InvalidRecoveryId)
        );
    }
}
