//! Keytab and credential cache files
//!
//! The server holds a keytab mapping principal names to shared keys.
//! The client holds a credential cache: its own principal and key.
//! Both are TOML files with hex-encoded 32-byte keys, written with
//! owner-only permissions on Unix.
//!
//! The client credential cache is resolved in order: an explicit path
//! (`Remctl::set_ccache`), the `REMCTL_CCACHE` environment variable,
//! then `<config dir>/remctl/ccache.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a shared key in bytes (before hex encoding)
pub const KEY_BYTES: usize = 32;

/// Environment variable naming the client credential cache file
pub const CCACHE_ENV: &str = "REMCTL_CCACHE";

/// A shared authentication key
pub type SessionKey = [u8; KEY_BYTES];

/// Errors from keytab and credential cache handling
#[derive(Error, Debug)]
pub enum KeytabError {
    /// File does not exist
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// File could not be read or written
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File is not valid TOML
    #[error("invalid format: {0}")]
    Parse(#[from] toml::de::Error),

    /// Key is not 64 hex characters
    #[error("invalid key for {0}: expected {KEY_BYTES} hex-encoded bytes")]
    InvalidKey(String),

    /// No credential cache could be located
    #[error("no credential cache found (set {CCACHE_ENV} or call set_ccache)")]
    NoCredentials,
}

/// On-disk keytab format
#[derive(Debug, Serialize, Deserialize)]
struct KeytabFile {
    /// principal name -> hex-encoded key
    keys: BTreeMap<String, String>,
}

/// Server-side key table: principal name to shared key
#[derive(Debug, Clone, Default)]
pub struct Keytab {
    keys: BTreeMap<String, SessionKey>,
}

impl Keytab {
    /// Create an empty keytab
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a keytab from a TOML file
    pub fn load(path: &Path) -> Result<Self, KeytabError> {
        let contents = read_file(path)?;
        let file: KeytabFile = toml::from_str(&contents)?;
        let mut keytab = Self::new();
        for (principal, hex_key) in file.keys {
            let key = decode_key(&principal, &hex_key)?;
            keytab.keys.insert(principal, key);
        }
        Ok(keytab)
    }

    /// Save the keytab to a TOML file with restricted permissions
    pub fn save(&self, path: &Path) -> Result<(), KeytabError> {
        let file = KeytabFile {
            keys: self
                .keys
                .iter()
                .map(|(principal, key)| (principal.clone(), hex::encode(key)))
                .collect(),
        };
        let contents = toml::to_string_pretty(&file).expect("keytab serialization cannot fail");
        write_private(path, &contents)
    }

    /// Add or replace a key for a principal
    pub fn insert(&mut self, principal: impl Into<String>, key: SessionKey) {
        self.keys.insert(principal.into(), key);
    }

    /// Look up a principal's key
    pub fn lookup(&self, principal: &str) -> Option<&SessionKey> {
        self.keys.get(principal)
    }
}

/// On-disk credential cache format
#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    principal: String,
    key: String,
}

/// Client-side credential: the caller's principal and shared key
#[derive(Debug, Clone)]
pub struct Credential {
    /// Principal this credential authenticates as
    pub principal: String,
    /// Shared key
    pub key: SessionKey,
}

impl Credential {
    /// Create a credential from parts
    pub fn new(principal: impl Into<String>, key: SessionKey) -> Self {
        Self {
            principal: principal.into(),
            key,
        }
    }

    /// Load a credential cache from a TOML file
    pub fn load(path: &Path) -> Result<Self, KeytabError> {
        let contents = read_file(path)?;
        let file: CredentialFile = toml::from_str(&contents)?;
        let key = decode_key(&file.principal, &file.key)?;
        Ok(Self {
            principal: file.principal,
            key,
        })
    }

    /// Save the credential cache to a TOML file with restricted permissions
    pub fn save(&self, path: &Path) -> Result<(), KeytabError> {
        let file = CredentialFile {
            principal: self.principal.clone(),
            key: hex::encode(self.key),
        };
        let contents = toml::to_string_pretty(&file).expect("credential serialization cannot fail");
        write_private(path, &contents)
    }

    /// Resolve the credential cache: explicit path, environment
    /// variable, then the default location
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, KeytabError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(env_path) = std::env::var(CCACHE_ENV) {
            return Self::load(Path::new(&env_path));
        }
        let default = default_ccache_path().ok_or(KeytabError::NoCredentials)?;
        if !default.exists() {
            return Err(KeytabError::NoCredentials);
        }
        Self::load(&default)
    }
}

/// Default credential cache location under the user config dir
pub fn default_ccache_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("remctl").join("ccache.toml"))
}

/// Generate a new random shared key
pub fn generate_key() -> SessionKey {
    use rand::Rng;
    let mut key = [0u8; KEY_BYTES];
    rand::thread_rng().fill(&mut key);
    key
}

fn decode_key(principal: &str, hex_key: &str) -> Result<SessionKey, KeytabError> {
    let bytes =
        hex::decode(hex_key).map_err(|_| KeytabError::InvalidKey(principal.to_string()))?;
    SessionKey::try_from(bytes.as_slice())
        .map_err(|_| KeytabError::InvalidKey(principal.to_string()))
}

fn read_file(path: &Path) -> Result<String, KeytabError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(KeytabError::NotFound(path.to_path_buf()))
        }
        Err(e) => Err(KeytabError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn write_private(path: &Path, contents: &str) -> Result<(), KeytabError> {
    let io_err = |source| KeytabError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, contents).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_key_unique() {
        assert_ne!(generate_key(), generate_key());
    }

    #[test]
    fn test_keytab_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("keytab.toml");

        let mut keytab = Keytab::new();
        let key = generate_key();
        keytab.insert("user@EXAMPLE.ORG", key);
        keytab.insert("host/server.example.org", generate_key());
        keytab.save(&path).expect("save");

        let loaded = Keytab::load(&path).expect("load");
        assert_eq!(loaded.lookup("user@EXAMPLE.ORG"), Some(&key));
        assert!(loaded.lookup("nobody@EXAMPLE.ORG").is_none());
    }

    #[test]
    fn test_credential_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ccache.toml");

        let credential = Credential::new("user@EXAMPLE.ORG", generate_key());
        credential.save(&path).expect("save");

        let loaded = Credential::load(&path).expect("load");
        assert_eq!(loaded.principal, credential.principal);
        assert_eq!(loaded.key, credential.key);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().expect("tempdir");
        let result = Keytab::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(KeytabError::NotFound(_))));
    }

    #[test]
    fn test_bad_key_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("keytab.toml");
        fs::write(&path, "[keys]\n\"user@EXAMPLE.ORG\" = \"deadbeef\"\n").expect("write");
        let result = Keytab::load(&path);
        assert!(matches!(result, Err(KeytabError::InvalidKey(_))));
    }

    #[test]
    fn test_resolve_explicit_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ccache.toml");
        Credential::new("user@EXAMPLE.ORG", generate_key())
            .save(&path)
            .expect("save");
        let loaded = Credential::resolve(Some(&path)).expect("resolve");
        assert_eq!(loaded.principal, "user@EXAMPLE.ORG");
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ccache.toml");
        Credential::new("user@EXAMPLE.ORG", generate_key())
            .save(&path)
            .expect("save");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
