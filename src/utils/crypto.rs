use crate::types::{AtnError, BalanceProof, Channel, ChannelId, Result};
use ethers::{
    signers::LocalWallet,
    types::{Address, RecoveryMessage, Signature, U256},
    utils::hash_message,
};

/// contract ‖ receiver ‖ open block ‖ balance ‖ nonce
pub const BALANCE_MESSAGE_LEN: usize = 20 + 20 + 4 + 32 + 32;

/// sender ‖ open block ‖ balance ‖ contract
pub const CLOSING_MESSAGE_LEN: usize = 20 + 4 + 32 + 20;

pub trait U256Ext {
    fn to_be_bytes_vec(&self) -> Vec<u8>;
}

impl U256Ext for U256 {
    fn to_be_bytes_vec(&self) -> Vec<u8> {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes.to_vec()
    }
}

/// Canonical byte layout signed by the sender. The DBot verifier rebuilds
/// exactly these bytes, so any change here is a wire-format change.
pub fn create_message(
    contract: Address,
    receiver: Address,
    open_block_number: u32,
    balance: U256,
    nonce: u64,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(BALANCE_MESSAGE_LEN);
    message.extend_from_slice(contract.as_bytes());
    message.extend_from_slice(receiver.as_bytes());
    message.extend_from_slice(&open_block_number.to_be_bytes());
    message.extend_from_slice(&balance.to_be_bytes_vec());
    message.extend_from_slice(&U256::from(nonce).to_be_bytes_vec());
    message
}

pub fn build_message(channel: &Channel, new_balance: U256, nonce: u64) -> Vec<u8> {
    create_message(
        channel.contract,
        channel.receiver,
        channel.open_block_number,
        new_balance,
        nonce,
    )
}

/// Signs the EIP-191 digest of `message`. Deterministic (RFC6979).
pub fn sign(message: &[u8], wallet: &LocalWallet) -> Result<Signature> {
    Ok(wallet.sign_hash(hash_message(message))?)
}

pub fn recover_signer(message: &[u8], signature: &Signature) -> Result<Address> {
    signature
        .recover(RecoveryMessage::Data(message.to_vec()))
        .map_err(|e| AtnError::invalid_proof(format!("signature recovery failed: {}", e)))
}

pub fn sign_balance_proof(
    channel: &Channel,
    new_balance: U256,
    nonce: u64,
    wallet: &LocalWallet,
) -> Result<BalanceProof> {
    let message = build_message(channel, new_balance, nonce);
    let signature = sign(&message, wallet)?;
    Ok(BalanceProof {
        channel: channel.id(),
        contract: channel.contract,
        balance: new_balance,
        nonce,
        signature,
    })
}

/// Returns the address that signed `proof`.
pub fn verify_balance_proof(proof: &BalanceProof) -> Result<Address> {
    let message = create_message(
        proof.contract,
        proof.channel.receiver,
        proof.channel.open_block_number,
        proof.balance,
        proof.nonce,
    );
    recover_signer(&message, &proof.signature)
}

/// Bytes the DBot signs to agree that `channel` closes at `balance`.
pub fn create_closing_message(contract: Address, channel: &ChannelId, balance: U256) -> Vec<u8> {
    let mut message = Vec::with_capacity(CLOSING_MESSAGE_LEN);
    message.extend_from_slice(channel.sender.as_bytes());
    message.extend_from_slice(&channel.open_block_number.to_be_bytes());
    message.extend_from_slice(&balance.to_be_bytes_vec());
    message.extend_from_slice(contract.as_bytes());
    message
}

pub fn sign_closing(
    contract: Address,
    channel: &ChannelId,
    balance: U256,
    wallet: &LocalWallet,
) -> Result<Signature> {
    sign(&create_closing_message(contract, channel, balance), wallet)
}

pub fn recover_closing_signer(
    contract: Address,
    channel: &ChannelId,
    balance: U256,
    signature: &Signature,
) -> Result<Address> {
    recover_signer(&create_closing_message(contract, channel, balance), signature)
}
