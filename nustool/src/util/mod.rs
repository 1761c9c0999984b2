pub mod meta;

use std::{
    env, fmt,
    fmt::Write,
    path::{Path, PathBuf, MAIN_SEPARATOR},
};

use nus::{CommonKey, KeyProvider, KeyStore};

/// Environment variable naming the default keys file.
pub const KEYS_ENV: &str = "NUS_KEYS";

pub fn display(path: &Path) -> PathDisplay<'_> { PathDisplay { path } }

pub struct PathDisplay<'a> {
    path: &'a Path,
}

impl fmt::Display for PathDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in self.path.iter() {
            let segment_str = segment.to_string_lossy();
            if segment_str == "." {
                continue;
            }
            if first {
                first = false;
            } else {
                f.write_char(MAIN_SEPARATOR)?;
            }
            f.write_str(&segment_str)?;
        }
        Ok(())
    }
}

/// Loads keys from `path`, or from the file named by `NUS_KEYS`.
///
/// Without either, an empty key store is returned and only unencrypted data can be read.
pub fn load_keys(path: Option<&Path>) -> nus::Result<KeyStore> {
    let path = path.map(Path::to_path_buf).or_else(|| env::var_os(KEYS_ENV).map(PathBuf::from));
    let Some(path) = path else {
        log::warn!("No keys file given (-k or {}); encrypted contents are unreadable", KEYS_ENV);
        return Ok(KeyStore::new());
    };
    let keys = KeyStore::load(&path)?;
    log::info!("Loaded {} keys from {}", keys.len(), display(&path));
    for &key in CommonKey::all() {
        match keys.common_key(key) {
            Ok(_) => log::debug!("Common key {}: OK", key),
            Err(e) => log::debug!("Common key {}: {}", key, e),
        }
    }
    Ok(keys)
}

/// Formats a byte count for display.
pub fn format_size(bytes: u64) -> String {
    size::Size::from_bytes(bytes).format().with_base(size::Base::Base10).to_string()
}
