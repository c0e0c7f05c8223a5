//! Contract bindings used by redemption.

use alloy::sol;

sol! {
    /// Gnosis conditional tokens framework.
    #[sol(rpc)]
    interface IConditionalTokens {
        function redeemPositions(
            address collateralToken,
            bytes32 parentCollectionId,
            bytes32 conditionId,
            uint256[] indexSets
        ) external;
    }

    /// Gnosis Safe, the subset needed to execute a signed transaction.
    #[sol(rpc)]
    interface IGnosisSafe {
        function nonce() external view returns (uint256);

        function execTransaction(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes signatures
        ) external payable returns (bool success);
    }
}
