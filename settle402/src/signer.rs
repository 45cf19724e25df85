//! Wallet signing capability for authorization typed data.

use std::future::Future;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes};
use alloy_signer_local::PrivateKeySigner;

use crate::authorization::{SignedAuthorization, TransferAuthorization, TypedData};

/// Errors from a signing attempt.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// The wallet holder refused the prompt.
    #[error("user declined to sign")]
    UserDeclined,
    /// The signer's address is not the authorization's `from`.
    #[error("signer {signer} cannot sign for {from}")]
    SignerMismatch {
        /// Signer address.
        signer: Address,
        /// Authorization payer.
        from: Address,
    },
    /// The typed data does not use the ERC-3009 schema.
    #[error("typed data does not use the TransferWithAuthorization schema")]
    NonCanonicalSchema,
    /// The underlying signer failed.
    #[error(transparent)]
    Signer(#[from] alloy_signer::Error),
}

/// Something that can sign authorization typed data on behalf of one address.
///
/// Implementations must hash exactly the domain, schema and message given;
/// any deviation produces a signature the token contract rejects.
pub trait AuthorizationSigner: Send + Sync {
    /// Address whose key produces signatures.
    fn address(&self) -> Address;

    /// Signs `typed_data`, returning the 65-byte `r ‖ s ‖ v` signature.
    fn sign_typed_data(
        &self,
        typed_data: &TypedData,
    ) -> impl Future<Output = Result<Bytes, SignError>> + Send;
}

impl AuthorizationSigner for PrivateKeySigner {
    fn address(&self) -> Address {
        Self::address(self)
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Bytes, SignError> {
        if !typed_data.has_canonical_schema() {
            return Err(SignError::NonCanonicalSchema);
        }
        let hash = typed_data.signing_hash();
        let signature = alloy_signer::Signer::sign_hash(self, &hash).await?;
        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }
}

impl<T: AuthorizationSigner> AuthorizationSigner for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    fn sign_typed_data(
        &self,
        typed_data: &TypedData,
    ) -> impl Future<Output = Result<Bytes, SignError>> + Send {
        (**self).sign_typed_data(typed_data)
    }
}

/// Signs `typed_data` and pairs the signature with its message.
///
/// # Errors
///
/// Returns [`SignError::SignerMismatch`] if the signer is not the payer, or
/// whatever the signer reports.
pub async fn sign_authorization<S: AuthorizationSigner>(
    signer: &S,
    typed_data: &TypedData,
) -> Result<SignedAuthorization, SignError> {
    let authorization: TransferAuthorization = typed_data.message;
    if signer.address() != authorization.from {
        return Err(SignError::SignerMismatch {
            signer: signer.address(),
            from: authorization.from,
        });
    }
    let signature = signer.sign_typed_data(typed_data).await?;
    Ok(SignedAuthorization {
        authorization,
        signature,
    })
}
