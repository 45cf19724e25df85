//! Solidity interface of ERC-3009 tokens.

use alloy_sol_types::{SolCall, sol};

use crate::authorization::TransferAuthorization;
use crate::signature::SignatureParts;

sol! {
    /// Minimal ERC-3009 + ERC-20 interface for USDC-style tokens.
    ///
    /// Overload order matters: the bytes-signature variant is `_0`, the
    /// (v, r, s) variant is `_1`.
    ///
    /// Reference: <https://eips.ethereum.org/EIPS/eip-3009>
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    interface IEIP3009 {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function balanceOf(address account) external view returns (uint256);
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes signature
        ) external;
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

/// Encodes the (v, r, s) `transferWithAuthorization` call.
#[must_use]
pub fn transfer_with_authorization_calldata(
    authorization: &TransferAuthorization,
    signature: &SignatureParts,
) -> Vec<u8> {
    IEIP3009::transferWithAuthorization_1Call {
        from: authorization.from,
        to: authorization.to,
        value: authorization.value.into(),
        validAfter: authorization.valid_after.into(),
        validBefore: authorization.valid_before.into(),
        nonce: authorization.nonce,
        v: signature.v,
        r: signature.r,
        s: signature.s,
    }
    .abi_encode()
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{B256, U256, address};

    use super::*;
    use crate::amount::TokenAmount;
    use crate::timestamp::UnixTimestamp;

    #[test]
    fn test_calldata_uses_vrs_overload() {
        let auth = TransferAuthorization {
            from: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            to: address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            value: TokenAmount(U256::from(2_500_000u64)),
            valid_after: UnixTimestamp::from_secs(1),
            valid_before: UnixTimestamp::from_secs(2),
            nonce: B256::repeat_byte(9),
        };
        let parts = SignatureParts {
            v: 28,
            r: B256::repeat_byte(1),
            s: B256::repeat_byte(2),
        };
        let calldata = transfer_with_authorization_calldata(&auth, &parts);
        assert_eq!(
            calldata[..4],
            IEIP3009::transferWithAuthorization_1Call::SELECTOR
        );
        let decoded = IEIP3009::transferWithAuthorization_1Call::abi_decode(&calldata).unwrap();
        assert_eq!(decoded.value, U256::from(2_500_000u64));
        assert_eq!(decoded.v, 28);
        assert_eq!(decoded.nonce, auth.nonce);
    }
}
