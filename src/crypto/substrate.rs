use sp_core::crypto::{Ss58AddressFormat, Ss58Codec};
use sp_core::{sr25519, Pair};

use crate::error::ServiceError;

/// Marker prefix some wallets put in front of a raw-bytes signature.
const RAW_MARKER: &str = "0101";
const SS58_PREFIX: u16 = 42;

/// Verify an sr25519 signature over `message` against an SS58 address.
///
/// Two signature framings are accepted, each with a single verification
/// target. A signature whose hex starts with the `0x01 0x01` marker has
/// those four hex characters stripped and the remaining payload must decode
/// to exactly 64 bytes, verified over the raw bytes of the message. A plain
/// signature must decode to exactly 64 bytes and is verified over the
/// message string's bytes.
pub fn verify_substrate(
    message: &str,
    signature: &str,
    address: &str,
) -> Result<(), ServiceError> {
    let public = decode_address(address)?;
    let sig_hex = signature.trim().trim_start_matches("0x");

    let payload_hex = match sig_hex.strip_prefix(RAW_MARKER) {
        Some(stripped) => stripped,
        None => sig_hex,
    };
    let payload = hex::decode(payload_hex).map_err(|_| ServiceError::Auth)?;
    if payload.len() != 64 {
        return Err(ServiceError::Auth);
    }

    let mut raw = [0u8; 64];
    raw.copy_from_slice(&payload);
    let sig = sr25519::Signature::from_raw(raw);

    if sr25519::Pair::verify(&sig, message.as_bytes(), &public) {
        Ok(())
    } else {
        Err(ServiceError::Auth)
    }
}

fn decode_address(address: &str) -> Result<sr25519::Public, ServiceError> {
    let public = sr25519::Public::from_ss58check(address).map_err(|_| ServiceError::Auth)?;
    // Canonical form: re-encoding with the generic prefix must reproduce
    // the submitted address exactly.
    let reencoded = public.to_ss58check_with_version(Ss58AddressFormat::custom(SS58_PREFIX));
    if reencoded != address {
        return Err(ServiceError::Auth);
    }
    Ok(public)
}
