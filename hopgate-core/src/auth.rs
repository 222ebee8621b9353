//! C2 — turns a hop's declared authentication into a credential usable by
//! the SSH client library.
//!
//! `~` expansion follows the same idiom as `ggagosh-openmango`'s
//! `resolve_identity_file_path` (`dirs::home_dir()` + prefix strip), the
//! closest in-pack precedent for loading an SSH identity file. Resolved
//! credentials are never cached: every connect reparses, per the spec.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::AuthMethod;

/// An opaque, ready-to-use credential. Callers never branch on the
/// original auth variant again once this is produced.
#[derive(Clone)]
pub enum Credential {
    PrivateKey(Arc<russh::keys::PrivateKey>),
    Password(String),
}

/// Expands a leading `~` or `~/` to the user's home directory. Paths that
/// don't start with `~` are returned unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path_str.as_ref() == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// Resolves a hop's declared auth into a usable credential. Every call
/// re-reads and re-parses; nothing is cached across sessions.
pub async fn resolve(auth: &AuthMethod) -> Result<Credential> {
    match auth {
        AuthMethod::Password { secret } => {
            if secret.is_empty() {
                return Err(Error::AuthPasswordMissing);
            }
            Ok(Credential::Password(secret.clone()))
        }
        AuthMethod::PrivateKey { path, passphrase } => {
            let expanded = expand_tilde(path);
            let data = tokio::fs::read_to_string(&expanded).await.map_err(|e| {
                Error::AuthKeyUnreadable(format!("{}: {e}", expanded.display()))
            })?;

            let parsed = russh::keys::decode_secret_key(&data, passphrase.as_deref());
            match parsed {
                Ok(key) => Ok(Credential::PrivateKey(Arc::new(key))),
                Err(err) => {
                    if passphrase.is_none() && looks_encrypted(&data) {
                        Err(Error::AuthPassphraseRequired)
                    } else {
                        Err(Error::AuthKeyParseFailed(err.to_string()))
                    }
                }
            }
        }
    }
}

fn looks_encrypted(pem: &str) -> bool {
    pem.contains("ENCRYPTED") || pem.contains("Proc-Type: 4,ENCRYPTED")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tilde_only_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            let expanded = expand_tilde(Path::new("~"));
            assert_eq!(expanded, home);
        }
    }

    #[test]
    fn non_tilde_paths_are_unchanged() {
        let p = Path::new("/etc/ssh/id_rsa");
        assert_eq!(expand_tilde(p), p.to_path_buf());
    }

    #[tokio::test]
    async fn empty_password_is_rejected() {
        let auth = AuthMethod::Password { secret: String::new() };
        let err = resolve(&auth).await.unwrap_err();
        assert_eq!(err.kind(), "auth.password_missing");
    }

    #[tokio::test]
    async fn non_empty_password_resolves() {
        let auth = AuthMethod::Password {
            secret: "hunter2".into(),
        };
        let cred = resolve(&auth).await.unwrap();
        assert!(matches!(cred, Credential::Password(s) if s == "hunter2"));
    }

    #[tokio::test]
    async fn missing_key_file_is_key_unreadable() {
        let auth = AuthMethod::PrivateKey {
            path: PathBuf::from("/nonexistent/path/id_rsa"),
            passphrase: None,
        };
        let err = resolve(&auth).await.unwrap_err();
        assert_eq!(err.kind(), "auth.key_unreadable");
    }

    #[tokio::test]
    async fn garbage_key_contents_is_parse_failed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a real key").unwrap();
        let auth = AuthMethod::PrivateKey {
            path: file.path().to_path_buf(),
            passphrase: None,
        };
        let err = resolve(&auth).await.unwrap_err();
        assert_eq!(err.kind(), "auth.key_parse_failed");
    }
}
