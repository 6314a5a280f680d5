//! AES payload encryption selected by wire cipher-suite id.
//!
//! The wire dialect reserves suite ids 0..=15 but only 0..=6 are operational
//! (NONE, three CBC widths, three CFB widths). Everything else is rejected,
//! including the reserved ECB/OFB/CTR ids — peers that negotiate them are
//! speaking a dialect we do not implement.

use aes::{
    Aes128, Aes192, Aes256,
    cipher::{AsyncStreamCipher, BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7},
};
use thiserror::Error;

/// Errors from the cipher layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Key or IV is not the required 32 bytes.
    #[error("key/iv must both be 32 bytes (key: {key}, iv: {iv})")]
    KeyIvLength {
        /// Length of the key that was supplied.
        key: usize,
        /// Length of the IV that was supplied.
        iv: usize,
    },

    /// Cipher-suite id outside the operational range 0..=6.
    #[error("cipher suite {0} is not supported")]
    SuiteUnsupported(u8),

    /// CBC ciphertext failed PKCS#7 unpadding (wrong key or corrupt data).
    #[error("ciphertext has invalid PKCS#7 padding")]
    Padding,
}

/// Payload cipher suite carried in packet headers.
///
/// CBC suites pad the payload to a 16-byte multiple; CFB suites keep the
/// ciphertext the same length as the plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CipherSuite {
    /// No encryption, payload passes through untouched.
    None = 0,
    /// AES-128 in CBC mode.
    Aes128Cbc = 1,
    /// AES-192 in CBC mode.
    Aes192Cbc = 2,
    /// AES-256 in CBC mode.
    Aes256Cbc = 3,
    /// AES-128 in CFB mode.
    Aes128Cfb = 4,
    /// AES-192 in CFB mode.
    Aes192Cfb = 5,
    /// AES-256 in CFB mode.
    Aes256Cfb = 6,
}

impl CipherSuite {
    /// Parse a wire cipher-suite id.
    ///
    /// Ids 7..=15 are recognised by the dialect but not operational; they are
    /// rejected the same way as garbage values.
    pub fn from_u8(value: u8) -> Result<Self, CryptoError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Aes128Cbc),
            2 => Ok(Self::Aes192Cbc),
            3 => Ok(Self::Aes256Cbc),
            4 => Ok(Self::Aes128Cfb),
            5 => Ok(Self::Aes192Cfb),
            6 => Ok(Self::Aes256Cfb),
            other => Err(CryptoError::SuiteUnsupported(other)),
        }
    }

    /// Wire id of this suite.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

fn check_key_iv(key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
    if key.len() != 32 || iv.len() != 32 {
        return Err(CryptoError::KeyIvLength { key: key.len(), iv: iv.len() });
    }
    Ok(())
}

fn key_iv_len(key: &[u8], iv: &[u8]) -> CryptoError {
    CryptoError::KeyIvLength { key: key.len(), iv: iv.len() }
}

/// Encrypt `payload` under `suite`.
///
/// `key` and `iv` must both be 32 bytes (see [`crate::command_key`]); the
/// suite consumes only the key prefix it needs and the first 16 IV bytes.
/// `CipherSuite::None` returns the payload unchanged.
pub fn encrypt(
    suite: CipherSuite,
    key: &[u8],
    iv: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_key_iv(key, iv)?;

    let iv16 = &iv[..16];
    match suite {
        CipherSuite::None => Ok(payload.to_vec()),
        CipherSuite::Aes128Cbc => {
            let enc = cbc::Encryptor::<Aes128>::new_from_slices(&key[..16], iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(payload))
        }
        CipherSuite::Aes192Cbc => {
            let enc = cbc::Encryptor::<Aes192>::new_from_slices(&key[..24], iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(payload))
        }
        CipherSuite::Aes256Cbc => {
            let enc = cbc::Encryptor::<Aes256>::new_from_slices(key, iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(payload))
        }
        CipherSuite::Aes128Cfb => {
            let enc = cfb_mode::Encryptor::<Aes128>::new_from_slices(&key[..16], iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            let mut out = payload.to_vec();
            enc.encrypt(&mut out);
            Ok(out)
        }
        CipherSuite::Aes192Cfb => {
            let enc = cfb_mode::Encryptor::<Aes192>::new_from_slices(&key[..24], iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            let mut out = payload.to_vec();
            enc.encrypt(&mut out);
            Ok(out)
        }
        CipherSuite::Aes256Cfb => {
            let enc = cfb_mode::Encryptor::<Aes256>::new_from_slices(key, iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            let mut out = payload.to_vec();
            enc.encrypt(&mut out);
            Ok(out)
        }
    }
}

/// Decrypt `payload` under `suite`. Mirror of [`encrypt`].
pub fn decrypt(
    suite: CipherSuite,
    key: &[u8],
    iv: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_key_iv(key, iv)?;

    let iv16 = &iv[..16];
    match suite {
        CipherSuite::None => Ok(payload.to_vec()),
        CipherSuite::Aes128Cbc => {
            let dec = cbc::Decryptor::<Aes128>::new_from_slices(&key[..16], iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(payload).map_err(|_| CryptoError::Padding)
        }
        CipherSuite::Aes192Cbc => {
            let dec = cbc::Decryptor::<Aes192>::new_from_slices(&key[..24], iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(payload).map_err(|_| CryptoError::Padding)
        }
        CipherSuite::Aes256Cbc => {
            let dec = cbc::Decryptor::<Aes256>::new_from_slices(key, iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(payload).map_err(|_| CryptoError::Padding)
        }
        CipherSuite::Aes128Cfb => {
            let dec = cfb_mode::Decryptor::<Aes128>::new_from_slices(&key[..16], iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            let mut out = payload.to_vec();
            dec.decrypt(&mut out);
            Ok(out)
        }
        CipherSuite::Aes192Cfb => {
            let dec = cfb_mode::Decryptor::<Aes192>::new_from_slices(&key[..24], iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            let mut out = payload.to_vec();
            dec.decrypt(&mut out);
            Ok(out)
        }
        CipherSuite::Aes256Cfb => {
            let dec = cfb_mode::Decryptor::<Aes256>::new_from_slices(key, iv16)
                .map_err(|_| key_iv_len(key, iv))?;
            let mut out = payload.to_vec();
            dec.decrypt(&mut out);
            Ok(out)
        }
    }
}
