//! Signing and authentication utilities for Polymarket.
//!
//! This module provides utilities for:
//! - Converting config signature types to SDK types
//! - Creating signers from private keys
//! - HMAC request signing for CLOB and relayer builder credentials
//! - The [`SigningAuthority`], the single gate through which nonces are
//!   acquired and meta-transactions are signed

pub mod authority;

use std::fmt;

use alloy::signers::local::PrivateKeySigner;
use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use polymarket_client_sdk::clob::types::SignatureType;
use sha2::Sha256;

use crate::error::SigningError;

pub use authority::{
    ContractCall, NonceSource, NonceUse, SignedMetaTransaction, SigningAuthority, SigningSession,
};

/// Convert a u8 signature type from config to SDK SignatureType.
///
/// Signature types:
/// - 0: EOA (Externally Owned Account) - standard wallet
/// - 1: Magic.link - proxy wallet
/// - 2: Gnosis Safe - multi-sig
pub fn signature_type_from_u8(sig_type: u8) -> SignatureType {
    match sig_type {
        1 => SignatureType::Proxy,
        2 => SignatureType::GnosisSafe,
        _ => SignatureType::Eoa,
    }
}

/// Create a LocalSigner from a hex-encoded private key.
///
/// The private key can be with or without the "0x" prefix.
pub fn create_signer(private_key: &str) -> Result<PrivateKeySigner, SigningError> {
    let key = private_key.strip_prefix("0x").unwrap_or(private_key);
    let bytes = hex::decode(key)
        .map_err(|e| SigningError::InvalidKey(format!("invalid hex: {}", e)))?;

    if bytes.len() != 32 {
        return Err(SigningError::InvalidKey(format!(
            "private key must be 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&bytes);

    PrivateKeySigner::from_bytes(&key_bytes.into())
        .map_err(|e| SigningError::InvalidKey(format!("failed to create signer: {}", e)))
}

/// Get the wallet address from a private key.
pub fn address_from_private_key(private_key: &str) -> Result<String, SigningError> {
    let signer = create_signer(private_key)?;
    Ok(format!("{:?}", signer.address()))
}

/// API key triple used for HMAC-authenticated requests.
#[derive(Clone)]
pub struct ApiCredentials {
    /// API key.
    pub key: String,
    /// Base64 secret.
    pub secret: String,
    /// Passphrase.
    pub passphrase: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("key", &crate::config::redact(&self.key))
            .field("secret", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

impl ApiCredentials {
    /// Build the four authentication headers for one request.
    ///
    /// `prefix` is `POLY` for CLOB L2 auth and `POLY_BUILDER` for the relayer.
    pub fn headers(
        &self,
        prefix: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(String, String)>, SigningError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = hmac_signature(&self.secret, &timestamp, method, path, body)?;

        Ok(vec![
            (format!("{}_API_KEY", prefix), self.key.clone()),
            (format!("{}_TIMESTAMP", prefix), timestamp),
            (format!("{}_PASSPHRASE", prefix), self.passphrase.clone()),
            (format!("{}_SIGNATURE", prefix), signature),
        ])
    }
}

/// HMAC-SHA256 over `timestamp + method + path + body`, URL-safe base64 encoded.
///
/// The secret is decoded as URL-safe base64, then standard base64, and
/// used as raw bytes if neither decodes.
pub fn hmac_signature(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, SigningError> {
    let message = format!("{}{}{}{}", timestamp, method, path, body);

    let secret_bytes = if let Ok(bytes) = general_purpose::URL_SAFE.decode(secret) {
        bytes
    } else if let Ok(bytes) = general_purpose::STANDARD.decode(secret) {
        bytes
    } else {
        secret.as_bytes().to_vec()
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(&secret_bytes)
        .map_err(|e| SigningError::Signing(format!("invalid HMAC key: {}", e)))?;
    mac.update(message.as_bytes());

    Ok(general_purpose::URL_SAFE.encode(mac.finalize().into_bytes()))
}
