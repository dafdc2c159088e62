use sp_io::crypto::secp256k1_ecdsa_recover;
use sp_io::hashing::keccak_256;

use crate::error::ServiceError;

/// Verify a `personal_sign` signature over `message` for `address`.
///
/// The recovery id accepts both the raw {0, 1} and the legacy {27, 28}
/// encodings. Address comparison is case-insensitive; checksummed input is
/// fine.
pub fn verify_evm(message: &str, signature: &str, address: &str) -> Result<(), ServiceError> {
    if !is_evm_address(address) {
        return Err(ServiceError::Auth);
    }
    let sig_hex = signature.trim().trim_start_matches("0x");
    let bytes = hex::decode(sig_hex).map_err(|_| ServiceError::Auth)?;
    if bytes.len() != 65 {
        return Err(ServiceError::Auth);
    }
    let mut sig = [0u8; 65];
    sig.copy_from_slice(&bytes);
    if sig[64] >= 27 {
        sig[64] -= 27;
    }
    if sig[64] > 1 {
        return Err(ServiceError::Auth);
    }

    let digest = personal_message_hash(message);
    let pubkey = secp256k1_ecdsa_recover(&sig, &digest).map_err(|_| ServiceError::Auth)?;
    let recovered = eth_address_from_pubkey(&pubkey);
    if recovered.eq_ignore_ascii_case(address) {
        Ok(())
    } else {
        Err(ServiceError::Auth)
    }
}

/// digest = keccak256("\x19Ethereum Signed Message:\n" ++ len ++ message)
fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut data = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    data.extend_from_slice(message.as_bytes());
    keccak_256(&data)
}

/// Ethereum address = last 20 bytes of keccak256 of the 64-byte pubkey.
fn eth_address_from_pubkey(pubkey: &[u8; 64]) -> String {
    let hash = keccak_256(pubkey);
    format!("0x{}", hex::encode(&hash[12..]))
}

pub fn is_evm_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit())
}
