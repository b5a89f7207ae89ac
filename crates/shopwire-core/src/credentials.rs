//! Provider credential lookup.

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};

use crate::data_source::SourceError;
use crate::ProviderId;

/// Secret value handed to an adapter. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl Display for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// Looks up the secret for a provider.
pub trait CredentialSource: Send + Sync {
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` when no credential is available.
    fn credential(&self, provider: &ProviderId) -> Result<Credential, SourceError>;
}

/// Reads `SHOPWIRE_<PROVIDER>_API_KEY`, then `<PROVIDER>_API_KEY`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialSource;

impl EnvCredentialSource {
    pub fn variable_names(provider: &ProviderId) -> [String; 2] {
        let key = provider.env_key();
        [format!("SHOPWIRE_{key}_API_KEY"), format!("{key}_API_KEY")]
    }
}

impl CredentialSource for EnvCredentialSource {
    fn credential(&self, provider: &ProviderId) -> Result<Credential, SourceError> {
        let names = Self::variable_names(provider);
        names
            .iter()
            .find_map(|name| {
                std::env::var(name)
                    .ok()
                    .map(|value| value.trim().to_owned())
                    .filter(|value| !value.is_empty())
            })
            .map(Credential::new)
            .ok_or_else(|| {
                SourceError::authentication(format!(
                    "no credential for '{provider}'; set {} or {}",
                    names[0], names[1]
                ))
                .with_provider(provider.clone())
            })
    }
}

/// Fixed credentials, for tests and embedding applications.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialSource {
    credentials: HashMap<ProviderId, Credential>,
}

impl StaticCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(mut self, provider: ProviderId, secret: impl Into<String>) -> Self {
        self.credentials.insert(provider, Credential::new(secret));
        self
    }
}

impl CredentialSource for StaticCredentialSource {
    fn credential(&self, provider: &ProviderId) -> Result<Credential, SourceError> {
        self.credentials.get(provider).cloned().ok_or_else(|| {
            SourceError::authentication(format!("no credential configured for '{provider}'"))
                .with_provider(provider.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceErrorKind;

    fn provider(name: &str) -> ProviderId {
        ProviderId::parse(name).expect("valid provider")
    }

    #[test]
    fn credential_is_redacted_in_output() {
        let credential = Credential::new("super-secret");
        assert_eq!(format!("{credential}"), "***");
        assert!(!format!("{credential:?}").contains("super-secret"));
        assert_eq!(credential.expose(), "super-secret");
    }

    #[test]
    fn static_source_fails_with_authentication_error() {
        let source = StaticCredentialSource::new().with_credential(provider("shopapi"), "k1");

        assert_eq!(
            source
                .credential(&provider("shopapi"))
                .expect("configured")
                .expose(),
            "k1"
        );
        let error = source
            .credential(&provider("scraper"))
            .expect_err("missing credential");
        assert_eq!(error.kind(), SourceErrorKind::AuthenticationFailed);
    }

    #[test]
    fn env_source_uses_prefixed_then_bare_variable() {
        let id = provider("env-probe-one");
        assert_eq!(
            EnvCredentialSource::variable_names(&id),
            [
                String::from("SHOPWIRE_ENV_PROBE_ONE_API_KEY"),
                String::from("ENV_PROBE_ONE_API_KEY"),
            ]
        );

        std::env::set_var("ENV_PROBE_ONE_API_KEY", "bare");
        assert_eq!(
            EnvCredentialSource
                .credential(&id)
                .expect("bare variable")
                .expose(),
            "bare"
        );

        std::env::set_var("SHOPWIRE_ENV_PROBE_ONE_API_KEY", "prefixed");
        assert_eq!(
            EnvCredentialSource
                .credential(&id)
                .expect("prefixed variable")
                .expose(),
            "prefixed"
        );

        std::env::remove_var("ENV_PROBE_ONE_API_KEY");
        std::env::remove_var("SHOPWIRE_ENV_PROBE_ONE_API_KEY");
    }

    #[test]
    fn env_source_reports_missing_variables() {
        let error = EnvCredentialSource
            .credential(&provider("env-probe-missing"))
            .expect_err("no variables set");
        assert!(error.message().contains("SHOPWIRE_ENV_PROBE_MISSING_API_KEY"));
    }
}
