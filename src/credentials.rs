//! Client credentials for the authenticated handshake.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{Arc, RwLock},
};

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 30;
const MIN_KEY_LEN: usize = 32;
const MAX_KEY_LEN: usize = 128;

/// An immutable set of `(name, key)` bindings used to authenticate connections.
///
/// Keys never appear in `Debug` output.
#[derive(Clone, Default)]
pub struct Credentials {
    entries: HashMap<String, Vec<u8>>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding. Names are limited to 30 visible ASCII characters without `:`; keys
    /// must be between 32 and 128 bytes.
    pub fn insert(&mut self, name: impl Into<String>, key: Vec<u8>) -> Result<()> {
        let name = name.into();
        validate_name(&name)?;
        validate_key(&key)?;
        self.entries.insert(name, key);
        Ok(())
    }

    /// Loads credentials from a file of `name:hex_key` lines. Blank lines and lines starting
    /// with `#` are ignored.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    pub(crate) fn parse(contents: &str) -> Result<Self> {
        let mut credentials = Self::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, hex_key) = line.split_once(':').ok_or_else(|| {
                Error::invalid_argument(format!("credentials line {}: missing ':'", lineno + 1))
            })?;
            let key = hex::decode(hex_key.trim()).map_err(|e| {
                Error::invalid_argument(format!("credentials line {}: {}", lineno + 1, e))
            })?;
            credentials.insert(name.trim(), key)?;
        }
        Ok(credentials)
    }

    pub(crate) fn key(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "credential name must be 1..={} bytes",
            MAX_NAME_LEN
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_graphic() && b != b':')
    {
        return Err(Error::invalid_argument(
            "credential name must be visible ASCII without ':'",
        ));
    }
    Ok(())
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
        return Err(Error::invalid_argument(format!(
            "credential key must be {}..={} bytes",
            MIN_KEY_LEN, MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Holds the credentials currently in effect and allows them to be swapped atomically.
///
/// Connections capture the current `Arc` when they handshake, so a swap only affects
/// connections established afterwards.
#[derive(Debug)]
pub(crate) struct CredentialStore {
    current: RwLock<Arc<Credentials>>,
}

impl CredentialStore {
    pub(crate) fn new(credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(Arc::new(credentials)),
        }
    }

    pub(crate) fn current(&self) -> Arc<Credentials> {
        self.current.read().unwrap().clone()
    }

    pub(crate) fn replace(&self, credentials: Credentials) {
        *self.current.write().unwrap() = Arc::new(credentials);
    }

    pub(crate) fn reload_from(&self, path: impl AsRef<Path>) -> Result<()> {
        let credentials = Credentials::from_file(path)?;
        self.replace(credentials);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_credential_lines() {
        let contents = "\
# test credentials
alpha:000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f

beta: ffeeddccbbaa9988776655443322110000112233445566778899aabbccddeeff
";
        let credentials = Credentials::parse(contents).unwrap();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials.key("alpha").unwrap()[0], 0x00);
        assert_eq!(credentials.key("beta").unwrap()[0], 0xff);
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(Credentials::parse("missing-separator").is_err());
        assert!(Credentials::parse("name:zz").is_err());
        // Key too short.
        assert!(Credentials::parse("name:0011").is_err());
        let long_name = "x".repeat(31);
        assert!(Credentials::parse(&format!("{}:{}", long_name, "00".repeat(32))).is_err());
    }

    #[test]
    fn store_swap_is_visible_to_new_readers_only() {
        let store = CredentialStore::new(Credentials::new());
        let before = store.current();
        let mut next = Credentials::new();
        next.insert("fresh", vec![7u8; 32]).unwrap();
        store.replace(next);
        // The captured Arc is unchanged; a new read sees the swap.
        assert!(before.key("fresh").is_none());
        assert!(store.current().key("fresh").is_some());
    }
}
