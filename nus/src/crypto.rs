//! AES-128 primitives used by the content readers.
//!
//! All functions operate in place on whole 16-byte blocks. Without the `decryption`
//! feature they fail with [`Error::Unsupported`].

use crate::{Error, KeyBytes, Result};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// All-zero initialization vector.
pub const ZERO_IV: KeyBytes = [0; 16];

/// Whether this build can decrypt.
#[inline]
pub const fn is_supported() -> bool { cfg!(feature = "decryption") }

#[inline]
fn check_blocks(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Error::InvalidArgument(format!(
            "data length {:#X} is not a multiple of the AES block size",
            data.len()
        )));
    }
    Ok(())
}

#[cfg(not(feature = "decryption"))]
#[inline]
fn unsupported() -> Error {
    Error::Unsupported("built without the `decryption` feature".to_string())
}

/// Decrypts data in-place using AES-128-CBC with the given key and IV.
#[inline]
pub fn decrypt_cbc(key: &KeyBytes, iv: KeyBytes, data: &mut [u8]) -> Result<()> {
    check_blocks(data)?;
    #[cfg(feature = "decryption")]
    {
        use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
        <cbc::Decryptor<aes::Aes128>>::new(key.into(), &aes::Block::from(iv))
            .decrypt_padded_mut::<NoPadding>(data)
            .map_err(|_| Error::Crypto("AES-CBC decryption failed".to_string()))?;
        Ok(())
    }
    #[cfg(not(feature = "decryption"))]
    {
        let _ = (key, iv);
        Err(unsupported())
    }
}

/// Encrypts data in-place using AES-128-CBC with the given key and IV.
#[inline]
pub fn encrypt_cbc(key: &KeyBytes, iv: KeyBytes, data: &mut [u8]) -> Result<()> {
    check_blocks(data)?;
    #[cfg(feature = "decryption")]
    {
        use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
        let len = data.len();
        <cbc::Encryptor<aes::Aes128>>::new(key.into(), &aes::Block::from(iv))
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map_err(|_| Error::Crypto("AES-CBC encryption failed".to_string()))?;
        Ok(())
    }
    #[cfg(not(feature = "decryption"))]
    {
        let _ = (key, iv);
        Err(unsupported())
    }
}

/// Decrypts data in-place using AES-128-ECB with the given key.
#[inline]
pub fn decrypt_ecb(key: &KeyBytes, data: &mut [u8]) -> Result<()> {
    check_blocks(data)?;
    #[cfg(feature = "decryption")]
    {
        use aes::cipher::{BlockDecrypt, KeyInit};
        let cipher = aes::Aes128::new(key.into());
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block(aes::Block::from_mut_slice(block));
        }
        Ok(())
    }
    #[cfg(not(feature = "decryption"))]
    {
        let _ = key;
        Err(unsupported())
    }
}

/// Encrypts data in-place using AES-128-ECB with the given key.
#[inline]
pub fn encrypt_ecb(key: &KeyBytes, data: &mut [u8]) -> Result<()> {
    check_blocks(data)?;
    #[cfg(feature = "decryption")]
    {
        use aes::cipher::{BlockEncrypt, KeyInit};
        let cipher = aes::Aes128::new(key.into());
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(aes::Block::from_mut_slice(block));
        }
        Ok(())
    }
    #[cfg(not(feature = "decryption"))]
    {
        let _ = key;
        Err(unsupported())
    }
}
