//! Provider session upkeep: login checks and stored-credential sign-in.

use std::sync::Arc;

use tracing::{info, warn};

use rootline_common::RootlineError;

use crate::credentials::CredentialStore;
use crate::providers::ProviderScraper;

/// Keeps a provider session alive between fetches, signing in with stored
/// credentials when the session has expired.
pub struct SessionKeeper {
    credentials: Arc<dyn CredentialStore>,
    auto_login: bool,
}

impl SessionKeeper {
    pub fn new(credentials: Arc<dyn CredentialStore>, auto_login: bool) -> Self {
        Self {
            credentials,
            auto_login,
        }
    }

    /// Verify the session; attempt one stored-credential login if it lapsed.
    pub async fn ensure_logged_in(&self, scraper: &dyn ProviderScraper) -> Result<(), RootlineError> {
        let provider = scraper.provider();
        if scraper.check_login_status().await? {
            return Ok(());
        }

        let expired = |message: &str| RootlineError::Authentication {
            provider,
            message: message.to_string(),
        };

        if !self.auto_login {
            return Err(expired("session expired and auto-login is disabled"));
        }
        let Some(creds) = self.credentials.credentials_for(provider) else {
            return Err(expired("session expired and no stored credentials are available"));
        };

        info!(provider = %provider, "Session expired, signing in with stored credentials");
        scraper.perform_login(&creds.username, &creds.secret).await?;

        if scraper.check_login_status().await? {
            Ok(())
        } else {
            warn!(provider = %provider, "Login completed but session is still signed out");
            Err(expired("still signed out after login"))
        }
    }
}
