//! Attestation encoding
//!
//! Canonical ABI encoding of a bridge-out entry, matching the bridge
//! contract's `abi.encode(unlockSequenceNumber, recipient, token, amount, chain)`.
//! The same encoding, prefixed with the chain ID, is what validators sign
//! off-chain so that signatures cannot be replayed on another network.
//!
//! All static values are encoded as 32-byte big-endian words; the dynamic
//! `bytes recipient` is encoded as an offset in the head and a
//! length-prefixed, zero-padded tail.

use alloy::primitives::{Address, PrimitiveSignature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use tiny_keccak::{Hasher, Keccak};

use crate::error::{BridgeOutError, Result};
use crate::types::{UnlockEvent, SIGNATURE_LENGTH};

const WORD: usize = 32;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Encode an unlock as `(uint256, bytes, address, uint256, uint8)`, optionally
/// prefixed with a `uint256` chain ID.
pub fn encode_attestation(event: &UnlockEvent, chain_id: Option<u64>) -> Vec<u8> {
    let prefix_words = usize::from(chain_id.is_some());
    let head_words = prefix_words + 5;
    let recipient = event.recipient.as_ref();
    let padded_len = recipient.len().div_ceil(WORD) * WORD;

    let mut data = vec![0u8; (head_words + 1) * WORD + padded_len];
    let mut word = 0;

    if let Some(id) = chain_id {
        data[WORD - 8..WORD].copy_from_slice(&id.to_be_bytes());
        word += 1;
    }

    // uint256 unlockSequenceNumber
    data[word * WORD..(word + 1) * WORD]
        .copy_from_slice(&event.sequence_number.to_be_bytes::<32>());
    word += 1;

    // bytes recipient: offset to the tail, measured from the start of the tuple
    let offset = (head_words * WORD) as u64;
    data[(word + 1) * WORD - 8..(word + 1) * WORD].copy_from_slice(&offset.to_be_bytes());
    word += 1;

    // address token, left-padded
    data[word * WORD + 12..(word + 1) * WORD].copy_from_slice(event.token.as_slice());
    word += 1;

    // uint256 amount
    data[word * WORD..(word + 1) * WORD].copy_from_slice(&event.amount.to_be_bytes::<32>());
    word += 1;

    // uint8 chain
    data[(word + 1) * WORD - 1] = event.chain.as_u8();
    word += 1;

    // tail: length word followed by the padded bytes
    data[(word + 1) * WORD - 8..(word + 1) * WORD]
        .copy_from_slice(&(recipient.len() as u64).to_be_bytes());
    word += 1;
    data[word * WORD..word * WORD + recipient.len()].copy_from_slice(recipient);

    data
}

/// On-chain key of an attestation: keccak256 of the unprefixed encoding
pub fn attestation_key(event: &UnlockEvent) -> B256 {
    B256::from(keccak256(&encode_attestation(event, None)))
}

/// Digest validators sign (before the EIP-191 prefix is applied)
pub fn signing_digest(event: &UnlockEvent, chain_id: u64) -> B256 {
    B256::from(keccak256(&encode_attestation(event, Some(chain_id))))
}

/// EIP-191 "personal message" hash:
/// keccak256("\x19Ethereum Signed Message:\n" || len(message) || message)
pub fn eth_signed_message_hash(message: &[u8]) -> B256 {
    let mut data = Vec::with_capacity(28 + 20 + message.len());
    data.extend_from_slice(b"\x19Ethereum Signed Message:\n");
    data.extend_from_slice(message.len().to_string().as_bytes());
    data.extend_from_slice(message);
    B256::from(keccak256(&data))
}

/// Sign the EIP-191 hash of the chain-bound encoding, returning 65 bytes (r, s, v)
pub fn sign_attestation(
    signer: &PrivateKeySigner,
    event: &UnlockEvent,
    chain_id: u64,
) -> Result<Vec<u8>> {
    let hash = eth_signed_message_hash(signing_digest(event, chain_id).as_slice());
    let signature = signer
        .sign_hash_sync(&hash)
        .map_err(|e| BridgeOutError::Signing(e.to_string()))?;
    Ok(signature.as_bytes().to_vec())
}

/// Recover the address that produced `signature` over an unlock
pub fn recover_signer(event: &UnlockEvent, chain_id: u64, signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(BridgeOutError::SignatureLength {
            expected: SIGNATURE_LENGTH,
            got: signature.len(),
        });
    }
    let signature = PrimitiveSignature::try_from(signature)
        .map_err(|e| BridgeOutError::InvalidRequest(format!("malformed signature: {}", e)))?;
    let hash = eth_signed_message_hash(signing_digest(event, chain_id).as_slice());
    signature
        .recover_address_from_prehash(&hash)
        .map_err(|e| BridgeOutError::InvalidRequest(format!("signature recovery failed: {}", e)))
}
