//! Bridge contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the Ethereum
//! bridge and the source-chain unlock event.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Bridge-out entry as stored and attested by the Ethereum bridge
    #[derive(Debug, PartialEq, Eq)]
    struct UnlockEntry {
        uint256 unlockSequenceNumber;
        bytes recipient;
        address token;
        uint256 amount;
        uint8 chain;
    }

    /// Main UTXO of the Bitcoin wallet servicing a withdrawal
    #[derive(Debug, PartialEq, Eq)]
    struct BitcoinUtxo {
        bytes32 txHash;
        uint32 txOutputIndex;
        uint64 txOutputValue;
    }

    /// Ethereum-side bridge contract
    #[sol(rpc)]
    contract BitcoinBridge {
        /// Whether the unlock reached the attestation threshold
        function confirmedUnlocks(uint256 unlockSequenceNumber) external view returns (bool);

        /// Signature bitmap for an attestation key (bit i = validator i attested)
        function attestations(bytes32 attestationKey) external view returns (uint256);

        /// Validator ID for an address (0 if not a validator)
        function validatorIDs(address validator) external view returns (uint8);

        function bridgeValidatorsCount() external view returns (uint256);

        function attestationThreshold() external view returns (uint256);

        /// Whether a BTC withdrawal for the entry hash is still outstanding
        function pendingBTCWithdrawals(bytes32 entryHash) external view returns (bool);

        /// Attest a bridge-out entry as the calling validator
        function attestBridgeOut(UnlockEntry entry) external;

        /// Attest a bridge-out entry with concatenated 65-byte validator signatures
        function attestBridgeOutWithSignatures(UnlockEntry entry, bytes signatures) external;

        /// Request the BTC withdrawal of a confirmed entry
        function withdrawBTC(UnlockEntry entry, bytes20 walletPubKeyHash, BitcoinUtxo mainUtxo) external;
    }

    /// Source-chain contract emitting unlock events
    #[sol(rpc)]
    contract AssetsBridge {
        event AssetsUnlocked(
            uint256 indexed unlockSequenceNumber,
            bytes recipient,
            address indexed token,
            uint256 amount,
            uint8 chain
        );
    }
}
