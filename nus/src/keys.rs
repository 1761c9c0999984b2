//! Common keys and the key store.

use std::{collections::HashMap, fmt, fs, path::Path};

use crate::{crypto, KeyBytes, Result, ResultContext};

/// Plaintext of every key verification block.
const VERIFY_PLAINTEXT: &[u8; 16] = b"AES-128-ECB-TEST";

/// Console common keys used to decrypt title keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommonKey {
    /// Wii retail common key.
    RvlCommon,
    /// Wii retail Korean key.
    RvlKorean,
    /// vWii retail common key.
    WupVWiiCommon,
    /// Wii debug common key.
    RvtDebug,
    /// Wii debug Korean key.
    RvtKorean,
    /// vWii debug common key.
    CatVWiiCommon,
    /// Wii U retail common key.
    WupWiiUCommon,
    /// Wii U debug common key.
    CatWiiUCommon,
}

impl CommonKey {
    /// Name of the key in `keys.conf`.
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            CommonKey::RvlCommon => "rvl-common",
            CommonKey::RvlKorean => "rvl-korean",
            CommonKey::WupVWiiCommon => "wup-starbuck-vwii-common",
            CommonKey::RvtDebug => "rvt-debug",
            CommonKey::RvtKorean => "rvt-korean",
            CommonKey::CatVWiiCommon => "cat-starbuck-vwii-common",
            CommonKey::WupWiiUCommon => "wup-starbuck-wiiu-common",
            CommonKey::CatWiiUCommon => "cat-starbuck-wiiu-common",
        }
    }

    /// Every known common key.
    #[inline]
    pub fn all() -> &'static [CommonKey] {
        &[
            CommonKey::RvlCommon,
            CommonKey::RvlKorean,
            CommonKey::WupVWiiCommon,
            CommonKey::RvtDebug,
            CommonKey::RvtKorean,
            CommonKey::CatVWiiCommon,
            CommonKey::WupWiiUCommon,
            CommonKey::CatWiiUCommon,
        ]
    }

    /// Selects the common key for a ticket from its issuer CA/XS numbers and common key index.
    ///
    /// Out-of-range indexes fall back to index 0.
    #[inline]
    pub fn from_issuer(ca: u32, xs: u32, index: u8) -> Option<CommonKey> {
        let index = if index > 2 { 0 } else { index };
        Some(match (ca, xs) {
            (1, 3) => [CommonKey::RvlCommon, CommonKey::RvlKorean, CommonKey::WupVWiiCommon]
                [index as usize],
            (2, 6) => [CommonKey::RvtDebug, CommonKey::RvtKorean, CommonKey::CatVWiiCommon]
                [index as usize],
            (3, 0xC) => CommonKey::WupWiiUCommon,
            (4, 0xF) | (4, 9) => CommonKey::CatWiiUCommon,
            _ => return None,
        })
    }

    /// Known ciphertext of `"AES-128-ECB-TEST"` under this key.
    #[rustfmt::skip]
    #[inline]
    pub fn verify_data(self) -> &'static KeyBytes {
        match self {
            CommonKey::RvlCommon =>
                &[0xCF, 0xB7, 0xFF, 0xA0, 0x64, 0x0C, 0x7A, 0x7D, 0xA7, 0x22, 0xDC, 0x16, 0x40, 0xFA, 0x04, 0x58],
            CommonKey::RvlKorean =>
                &[0x98, 0x1C, 0xD4, 0x51, 0x17, 0xF2, 0x23, 0xB6, 0xC8, 0x84, 0x4A, 0x97, 0xA6, 0x93, 0xF2, 0xE3],
            CommonKey::WupVWiiCommon =>
                &[0x04, 0xF1, 0x33, 0x3F, 0xF8, 0x05, 0x7B, 0x8F, 0xA7, 0xF1, 0xED, 0x6E, 0xAC, 0x23, 0x33, 0xFA],
            CommonKey::RvtDebug =>
                &[0x22, 0xC4, 0x2C, 0x5B, 0xCB, 0xFE, 0x75, 0xAC, 0xEB, 0xC3, 0x6B, 0xAF, 0x90, 0xB3, 0xB4, 0xF5],
            CommonKey::RvtKorean =>
                &[0x31, 0x81, 0xF2, 0xCA, 0xFE, 0x70, 0x58, 0xCB, 0x3C, 0x0F, 0xB9, 0x9D, 0x2D, 0x45, 0x74, 0xDA],
            CommonKey::CatVWiiCommon =>
                &[0x0B, 0xFB, 0x83, 0x83, 0x38, 0xCB, 0x1A, 0x83, 0x5E, 0x1C, 0xEC, 0xCA, 0xDC, 0x5D, 0xF1, 0xFA],
            CommonKey::WupWiiUCommon =>
                &[0x05, 0xBA, 0x63, 0x98, 0x8A, 0x50, 0x90, 0x4D, 0xEC, 0x93, 0xAC, 0xF3, 0x07, 0x8F, 0x3E, 0x90],
            CommonKey::CatWiiUCommon =>
                &[0xF3, 0xE2, 0xED, 0xF4, 0x8D, 0x99, 0x2A, 0x5B, 0xD8, 0xE1, 0x3F, 0xA2, 0x9B, 0x89, 0x73, 0xAA],
        }
    }
}

impl fmt::Display for CommonKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Errors from key lookup and verification.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key is not present.
    #[error("key {0} was not found")]
    Missing(String),
    /// The key entry could not be parsed.
    #[error("key {0} is not a valid key")]
    Invalid(String),
    /// The key does not decrypt its verification block.
    #[error("key {0} is incorrect")]
    WrongKey(String),
    /// The ticket issuer does not name a supported common key.
    #[error("unsupported ticket issuer {0:?}")]
    UnknownIssuer(String),
    /// Keys cannot be verified without decryption support.
    #[error("decryption is not supported in this build")]
    NoSupport,
}

/// Source of console common keys.
///
/// Implementations are passed to [`Package::new`](crate::Package::new) rather than
/// looked up globally.
pub trait KeyProvider {
    /// Returns the verified common key.
    fn common_key(&self, key: CommonKey) -> Result<KeyBytes, KeyError>;
}

/// A set of named AES keys, usually loaded from `keys.conf`.
///
/// Keys are verified against their known verification block when requested.
#[derive(Debug, Default, Clone)]
pub struct KeyStore {
    keys: HashMap<String, KeyBytes>,
    invalid: HashMap<String, KeyError>,
}

impl KeyStore {
    /// Creates an empty key store.
    #[inline]
    pub fn new() -> Self { Self::default() }

    /// Loads a key store from a `keys.conf` file.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Reading key store {}", path.display()))?;
        let store = Self::parse(&text);
        log::debug!(
            "Loaded {} keys from {} ({} invalid)",
            store.keys.len(),
            path.display(),
            store.invalid.len()
        );
        Ok(store)
    }

    /// Parses the `[Keys]` section of a `keys.conf` file.
    ///
    /// Malformed entries are remembered and reported when the key is requested.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn parse(text: &str) -> Self {
        let mut store = Self::new();
        let mut in_keys = false;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                in_keys = section.trim().eq_ignore_ascii_case("keys");
                continue;
            }
            if !in_keys {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let mut key: KeyBytes = [0; 16];
            let valid =
                matches!(base16ct::mixed::decode(value.trim(), &mut key), Ok(d) if d.len() == 16);
            if valid {
                store.insert(name, key);
            } else {
                store.keys.remove(name);
                store.invalid.insert(name.to_string(), KeyError::Invalid(name.to_string()));
            }
        }
        store
    }

    /// Adds or replaces a key.
    #[inline]
    pub fn insert(&mut self, name: &str, key: KeyBytes) {
        self.invalid.remove(name);
        self.keys.insert(name.to_string(), key);
    }

    /// Returns the raw key without verification.
    #[inline]
    pub fn get(&self, name: &str) -> Result<KeyBytes, KeyError> {
        if let Some(key) = self.keys.get(name) {
            return Ok(*key);
        }
        Err(self.invalid.get(name).cloned().unwrap_or_else(|| KeyError::Missing(name.to_string())))
    }

    /// Number of valid entries.
    #[inline]
    pub fn len(&self) -> usize { self.keys.len() }

    /// Whether the store holds no valid entries.
    #[inline]
    pub fn is_empty(&self) -> bool { self.keys.is_empty() }
}

impl KeyProvider for KeyStore {
    #[inline]
    fn common_key(&self, key: CommonKey) -> Result<KeyBytes, KeyError> {
        let bytes = self.get(key.name())?;
        verify_key(key.name(), &bytes, key.verify_data())?;
        Ok(bytes)
    }
}

/// Checks that `bytes` decrypts `verify_data` to the verification plaintext.
fn verify_key(name: &str, bytes: &KeyBytes, verify_data: &KeyBytes) -> Result<(), KeyError> {
    if !crypto::is_supported() {
        return Err(KeyError::NoSupport);
    }
    let mut block = *verify_data;
    crypto::decrypt_ecb(bytes, &mut block).map_err(|_| KeyError::NoSupport)?;
    if &block != VERIFY_PLAINTEXT {
        return Err(KeyError::WrongKey(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_issuer() {
        assert_eq!(CommonKey::from_issuer(3, 0xC, 0), Some(CommonKey::WupWiiUCommon));
        assert_eq!(CommonKey::from_issuer(4, 9, 0), Some(CommonKey::CatWiiUCommon));
        assert_eq!(CommonKey::from_issuer(1, 3, 2), Some(CommonKey::WupVWiiCommon));
        assert_eq!(CommonKey::from_issuer(1, 3, 7), Some(CommonKey::RvlCommon));
        assert_eq!(CommonKey::from_issuer(5, 5, 0), None);
    }

    #[test]
    fn test_parse() {
        let store = KeyStore::parse(
            "; comment\n\
             [Other]\n\
             rvl-common=00000000000000000000000000000000\n\
             [Keys]\n\
             wup-starbuck-wiiu-common = 00112233445566778899AABBCCDDEEFF\n\
             cat-starbuck-wiiu-common=0011\n",
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("wup-starbuck-wiiu-common").unwrap(), [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF
        ]);
        assert_eq!(
            store.get("cat-starbuck-wiiu-common"),
            Err(KeyError::Invalid("cat-starbuck-wiiu-common".to_string()))
        );
        assert_eq!(store.get("rvl-common"), Err(KeyError::Missing("rvl-common".to_string())));
    }

    #[cfg(feature = "decryption")]
    #[test]
    fn test_wrong_key_rejected() {
        let mut store = KeyStore::new();
        store.insert(CommonKey::WupWiiUCommon.name(), [0x42; 16]);
        assert_eq!(
            store.common_key(CommonKey::WupWiiUCommon),
            Err(KeyError::WrongKey("wup-starbuck-wiiu-common".to_string()))
        );
        assert_eq!(
            store.common_key(CommonKey::RvlCommon),
            Err(KeyError::Missing("rvl-common".to_string()))
        );
    }

    #[cfg(feature = "decryption")]
    #[test]
    fn test_verify_key() {
        let key = [0x5A; 16];
        let mut verify_data = *VERIFY_PLAINTEXT;
        crypto::encrypt_ecb(&key, &mut verify_data).unwrap();
        assert_eq!(verify_key("test", &key, &verify_data), Ok(()));
        assert_eq!(
            verify_key("test", &[0x5B; 16], &verify_data),
            Err(KeyError::WrongKey("test".to_string()))
        );
    }
}
