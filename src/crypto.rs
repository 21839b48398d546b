//! AES-128, AES-CMAC and bcrypt primitives.
//!
//! Everything the frame codec needs sits here: single-block AES in both
//! directions, the RFC 4493 CMAC used for MICs and key derivation, raw ECB
//! over block-aligned buffers (the Join-Accept encryption runs the cipher
//! backwards, see `lorawan::security`), and bcrypt wrappers for hashing
//! provisioning secrets at rest.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::error::NsError;
use crate::lorawan::keys::Aes128Key;

/// Encrypt a single 16-byte block in place.
pub fn aes128_encrypt_block(key: &Aes128Key, block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

/// Decrypt a single 16-byte block in place.
pub fn aes128_decrypt_block(key: &Aes128Key, block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}

/// AES-CMAC-PRF-128 (RFC 4493): full 16-byte tag over `data`.
pub fn aes_cmac_prf128(key: &Aes128Key, data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

/// AES-128 ECB encrypt over a block-aligned buffer.
pub fn aes_ecb_encrypt(key: &Aes128Key, data: &[u8]) -> Result<Vec<u8>, NsError> {
    if data.len() % 16 != 0 {
        return Err(NsError::MalformedFrame(format!(
            "ECB input must be block-aligned, got {} bytes",
            data.len()
        )));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// AES-128 ECB decrypt over a block-aligned buffer.
pub fn aes_ecb_decrypt(key: &Aes128Key, data: &[u8]) -> Result<Vec<u8>, NsError> {
    if data.len() % 16 != 0 {
        return Err(NsError::MalformedFrame(format!(
            "ECB input must be block-aligned, got {} bytes",
            data.len()
        )));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Hash a provisioning secret with bcrypt.
pub fn hash_secret(secret: &str) -> Result<String, NsError> {
    bcrypt::hash(secret, bcrypt::DEFAULT_COST)
        .map_err(|e| NsError::Internal(format!("bcrypt hash: {e}")))
}

/// Verify a provisioning secret against its bcrypt hash.
pub fn verify_secret(secret: &str, hash: &str) -> Result<bool, NsError> {
    bcrypt::verify(secret, hash).map_err(|e| NsError::Internal(format!("bcrypt verify: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hex_str: &str) -> Aes128Key {
        hex_str.parse().unwrap()
    }

    #[test]
    fn test_aes128_fips197_vector() {
        let k = key("000102030405060708090a0b0c0d0e0f");
        let mut block: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        aes128_encrypt_block(&k, &mut block);
        assert_eq!(hex::encode(block), "69c4e0d86a7b0430d8cdb78070b4c55a");
        aes128_decrypt_block(&k, &mut block);
        assert_eq!(hex::encode(block), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_cmac_rfc4493_vectors() {
        let k = key("2b7e151628aed2a6abf7158809cf4f3c");

        // Example 1: empty message.
        assert_eq!(
            hex::encode(aes_cmac_prf128(&k, &[])),
            "bb1d6929e95937287fa37d129b756746"
        );

        // Example 2: one full block.
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        assert_eq!(
            hex::encode(aes_cmac_prf128(&k, &msg)),
            "070a16b46b4d4144f79bdd9dd04a287c"
        );
    }

    #[test]
    fn test_ecb_roundtrip_and_alignment() {
        let k = key("00112233445566778899aabbccddeeff");
        let data = vec![0xABu8; 32];
        let enc = aes_ecb_encrypt(&k, &data).unwrap();
        assert_ne!(enc, data);
        // ECB: identical plaintext blocks produce identical ciphertext blocks.
        assert_eq!(enc[..16], enc[16..]);
        assert_eq!(aes_ecb_decrypt(&k, &enc).unwrap(), data);

        assert!(aes_ecb_encrypt(&k, &[0u8; 15]).is_err());
        assert!(aes_ecb_decrypt(&k, &[0u8; 17]).is_err());
    }

    #[test]
    fn test_bcrypt_roundtrip() {
        let hash = hash_secret("gateway-secret").unwrap();
        assert!(verify_secret("gateway-secret", &hash).unwrap());
        assert!(!verify_secret("wrong", &hash).unwrap());
    }
}
