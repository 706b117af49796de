//! Credential resolution.
//!
//! Profiles store an opaque credential reference such as
//! `ssh-key:~/.ssh/platform_bastion_key`. The resolver turns it into something
//! the launcher can hand to `ssh` for the lifetime of one invocation; the
//! resolved value is never written back to the store.

use std::path::{Path, PathBuf};

use crate::error::CredentialError;

/// A resolved credential, valid for the current invocation only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Private key file passed to `ssh -i`.
    IdentityFile(PathBuf),
    /// Keys held by the running SSH agent at this socket.
    Agent(PathBuf),
}

/// Resolves opaque credential references.
pub trait CredentialResolver: Send + Sync {
    /// Resolve a reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is unknown or the credential is missing.
    fn resolve(&self, credentials_ref: &str) -> Result<Credential, CredentialError>;
}

/// Resolver for credentials available on the local machine.
///
/// Supported references:
/// - `ssh-key:<path>`: a private key file; a leading `~/` is the home directory
/// - `env:<VAR>`: a private key file whose path is in `VAR`
/// - `agent`: the SSH agent at `SSH_AUTH_SOCK`
#[derive(Debug, Clone)]
pub struct LocalCredentialResolver {
    home: PathBuf,
}

impl LocalCredentialResolver {
    /// Create a resolver that expands `~` to `home`.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Create a resolver that expands `~` to `$HOME`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("HOME").map_or_else(|| PathBuf::from("/"), PathBuf::from))
    }

    fn expand(&self, path: &str) -> PathBuf {
        if path == "~" {
            self.home.clone()
        } else if let Some(rest) = path.strip_prefix("~/") {
            self.home.join(rest)
        } else {
            PathBuf::from(path)
        }
    }

    fn key_file(path: PathBuf) -> Result<Credential, CredentialError> {
        if Path::new(&path).is_file() {
            Ok(Credential::IdentityFile(path))
        } else {
            Err(CredentialError::MissingKeyFile(path))
        }
    }
}

impl CredentialResolver for LocalCredentialResolver {
    fn resolve(&self, credentials_ref: &str) -> Result<Credential, CredentialError> {
        if let Some(path) = credentials_ref.strip_prefix("ssh-key:") {
            return Self::key_file(self.expand(path));
        }
        if let Some(var) = credentials_ref.strip_prefix("env:") {
            let value = std::env::var(var)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CredentialError::MissingEnv(var.to_string()))?;
            return Self::key_file(self.expand(&value));
        }
        if credentials_ref == "agent" {
            return std::env::var_os("SSH_AUTH_SOCK")
                .filter(|v| !v.is_empty())
                .map(|sock| Credential::Agent(PathBuf::from(sock)))
                .ok_or(CredentialError::NoAgent);
        }
        Err(CredentialError::UnsupportedScheme(credentials_ref.to_string()))
    }
}

/// Resolver that returns a fixed credential, for tests.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone)]
pub struct MockCredentialResolver {
    result: Result<Credential, CredentialError>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockCredentialResolver {
    /// Resolve every reference to `credential`.
    #[must_use]
    pub const fn returning(credential: Credential) -> Self {
        Self {
            result: Ok(credential),
        }
    }

    /// Fail every resolution with `error`.
    #[must_use]
    pub const fn failing(error: CredentialError) -> Self {
        Self { result: Err(error) }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for MockCredentialResolver {
    fn default() -> Self {
        Self::returning(Credential::IdentityFile(PathBuf::from("/dev/null")))
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl CredentialResolver for MockCredentialResolver {
    fn resolve(&self, _credentials_ref: &str) -> Result<Credential, CredentialError> {
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ssh_key_expands_home() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(home.path().join(".ssh")).unwrap();
        let key = home.path().join(".ssh/platform_bastion_key");
        std::fs::write(&key, "key").unwrap();

        let resolver = LocalCredentialResolver::new(home.path());
        assert_eq!(
            resolver.resolve("ssh-key:~/.ssh/platform_bastion_key"),
            Ok(Credential::IdentityFile(key))
        );
    }

    #[test]
    fn missing_key_is_reported() {
        let home = TempDir::new().unwrap();
        let resolver = LocalCredentialResolver::new(home.path());
        assert!(matches!(
            resolver.resolve("ssh-key:~/.ssh/absent"),
            Err(CredentialError::MissingKeyFile(_))
        ));
    }

    #[test]
    fn unknown_scheme_rejected() {
        let resolver = LocalCredentialResolver::new("/home/nobody");
        assert_eq!(
            resolver.resolve("vault:secret/bastion"),
            Err(CredentialError::UnsupportedScheme("vault:secret/bastion".into()))
        );
    }

    #[test]
    fn missing_env_var() {
        let resolver = LocalCredentialResolver::new("/home/nobody");
        assert_eq!(
            resolver.resolve("env:DEVBOX_TEST_UNSET_KEY_PATH_VAR"),
            Err(CredentialError::MissingEnv(
                "DEVBOX_TEST_UNSET_KEY_PATH_VAR".into()
            ))
        );
    }
}
