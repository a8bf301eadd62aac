// Environment block built from credential providers

use pidone_core::{CredentialSet, EnvironmentBlock, PidoneError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default location of mounted secrets in a container
pub const DEFAULT_SECRETS_DIR: &str = "/run/secrets";

/// Source of the credential set consulted once at startup
pub trait CredentialProvider {
    fn load(&self) -> Result<CredentialSet>;
}

/// Reads one credential per regular file in a secrets directory.
///
/// The file name is the key and the file content, byte-for-byte, is the value.
pub struct SecretsDirProvider {
    dir: PathBuf,
}

impl SecretsDirProvider {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl Default for SecretsDirProvider {
    fn default() -> Self {
        Self::new(DEFAULT_SECRETS_DIR)
    }
}

impl CredentialProvider for SecretsDirProvider {
    fn load(&self) -> Result<CredentialSet> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            PidoneError::CredentialError(format!(
                "cannot read secrets directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut credentials = HashMap::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable secrets entry");
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_file() {
                debug!(path = %path.display(), "Skipping non-file secrets entry");
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!(path = %path.display(), "Skipping secret with non UTF-8 name");
                continue;
            };

            match fs::read_to_string(&path) {
                Ok(value) => {
                    credentials.insert(name, value);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable secret");
                }
            }
        }

        Ok(CredentialSet::new(credentials))
    }
}

/// Normalize a credential key into an environment variable name
pub fn env_key(key: &str) -> String {
    key.trim().replace([' ', '-'], "_").to_uppercase()
}

/// Convert a credential set into environment assignments
pub fn build_environment(credentials: &CredentialSet) -> EnvironmentBlock {
    let mut block = EnvironmentBlock::new();
    for (key, value) in credentials.iter() {
        block.push(env_key(key), value.clone());
    }
    block
}

/// Load credentials and build the environment block.
///
/// Provider failure is not fatal: it is logged and an empty block is returned.
pub fn load_environment(provider: &dyn CredentialProvider) -> EnvironmentBlock {
    match provider.load() {
        Ok(credentials) => {
            debug!(count = credentials.len(), "Loaded credentials");
            build_environment(&credentials)
        }
        Err(e) => {
            warn!(error = %e, "Error loading credentials, continuing without them");
            EnvironmentBlock::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProvider;

    impl CredentialProvider for FailingProvider {
        fn load(&self) -> Result<CredentialSet> {
            Err(PidoneError::CredentialError("store unavailable".to_string()))
        }
    }

    #[test]
    fn test_env_key_trims_and_replaces() {
        assert_eq!(env_key(" api key "), "API_KEY");
        assert_eq!(env_key("db-password"), "DB_PASSWORD");
        assert_eq!(env_key("mixed - key name"), "MIXED___KEY_NAME");
        assert_eq!(env_key("already_OK"), "ALREADY_OK");
    }

    #[test]
    fn test_env_key_trims_before_replacing() {
        assert_eq!(env_key("\t token-id\n"), "TOKEN_ID");
    }

    #[test]
    fn test_build_environment_normalizes_every_key() {
        let mut map = HashMap::new();
        map.insert("api key".to_string(), "abc".to_string());
        map.insert("db-user".to_string(), "root".to_string());
        let block = build_environment(&CredentialSet::new(map));

        let mut entries = block.entries();
        entries.sort();
        assert_eq!(entries, vec!["API_KEY=abc".to_string(), "DB_USER=root".to_string()]);
    }

    #[test]
    fn test_failing_provider_yields_empty_block() {
        let block = load_environment(&FailingProvider);
        assert!(block.is_empty());
    }

    #[test]
    fn test_secrets_dir_provider_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("api-key"), "s3cr3t\n").unwrap();
        fs::write(dir.path().join("db password"), "hunter2").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let block = load_environment(&SecretsDirProvider::new(dir.path()));

        let mut entries = block.entries();
        entries.sort();
        assert_eq!(
            entries,
            vec!["API_KEY=s3cr3t\n".to_string(), "DB_PASSWORD=hunter2".to_string()]
        );
    }

    #[test]
    fn test_secrets_dir_provider_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SecretsDirProvider::new(dir.path().join("absent"));
        let err = provider.load().unwrap_err();
        assert!(!err.is_fatal());
        assert!(load_environment(&provider).is_empty());
    }
}
