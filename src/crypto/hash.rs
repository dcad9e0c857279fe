//! Cryptographic hashing utilities
//!
//! Provides the SHA-512 based digests used for inventory vectors, proof of
//! work, frame checksums and address derivation.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

/// Computes SHA-512 hash of the input data
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// Computes SHA-512 over the concatenation of several slices
pub fn sha512_concat(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Computes double SHA-512 hash (SHA-512 of SHA-512)
/// Used for inventory vectors, proof-of-work trial values and address checksums
pub fn double_sha512(data: &[u8]) -> [u8; 64] {
    sha512(&sha512(data))
}

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Computes RIPEMD-160 of SHA-512, the "ripe" identifying an address
pub fn ripemd160_sha512(data: &[u8]) -> [u8; 20] {
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha512(data));
    ripemd.finalize().into()
}

/// Frame checksum: the first four bytes of SHA-512 of the payload
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha512(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha512() {
        let hash = sha512(b"hello world");
        assert_eq!(
            hex::encode(&hash[..8]),
            "309ecc489c12d6eb"
        );
    }

    #[test]
    fn test_sha512_concat_matches_single_buffer() {
        assert_eq!(sha512_concat(&[&b"hello "[..], &b"world"[..]]), sha512(b"hello world"));
    }

    #[test]
    fn test_double_sha512() {
        let data = b"hello world";
        assert_eq!(double_sha512(data), sha512(&sha512(data)));
    }

    #[test]
    fn test_checksum_of_empty_payload() {
        // SHA-512("") starts with cf83e135
        assert_eq!(checksum(&[]), [0xcf, 0x83, 0xe1, 0x35]);
    }
}
