use std::env;

use rootline_common::Provider;

/// Decrypted login secrets for one provider.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// Source of stored provider credentials for auto-login.
pub trait CredentialStore: Send + Sync {
    fn credentials_for(&self, provider: Provider) -> Option<Credentials>;
}

/// Reads `ROOTLINE_<PROVIDER>_USERNAME` and `ROOTLINE_<PROVIDER>_PASSWORD`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn credentials_for(&self, provider: Provider) -> Option<Credentials> {
        let key = provider.env_key();
        let username = env::var(format!("ROOTLINE_{key}_USERNAME")).ok()?;
        let secret = env::var(format!("ROOTLINE_{key}_PASSWORD")).ok()?;
        if username.trim().is_empty() || secret.is_empty() {
            return None;
        }
        Some(Credentials {
            username: username.trim().to_string(),
            secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secret() {
        let creds = Credentials {
            username: "ada".into(),
            secret: "hunter2".into(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("ada"));
        assert!(!shown.contains("hunter2"));
    }
}
