use crate::RegistryError;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

/// Username sent with a bearer token used as a password.
pub const TOKEN_USERNAME: &str = "ignored";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authentication and TLS policy for talking to one registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryContext {
    pub credentials: Option<Credentials>,
    pub insecure_skip_tls_verify: bool,
    pub accept_legacy_manifests: bool,
    /// Speak HTTP without TLS instead of probing https first.
    pub plain_http: bool,
    /// Global timeout applied to every HTTP request.
    pub request_timeout: Option<Duration>,
}

impl RegistryContext {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Source of the bearer token for the cluster-internal registry.
pub trait CredentialProvider: Send + Sync {
    /// The token, or `None` when none is available.
    fn bearer_token(&self) -> Result<Option<String>, RegistryError>;
}

/// Reads the token from a mounted service-account token file.
#[derive(Debug, Clone)]
pub struct ServiceAccountToken {
    path: PathBuf,
}

impl ServiceAccountToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for ServiceAccountToken {
    fn bearer_token(&self) -> Result<Option<String>, RegistryError> {
        match fs::read_to_string(&self.path) {
            Ok(token) => Ok(Some(token.trim().to_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("no token file at {}", self.path.display());
                Ok(None)
            }
            Err(e) => Err(RegistryError::Io(e)),
        }
    }
}

/// A token fixed at construction.
#[derive(Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.as_ref().map(|_| "<redacted>");
        f.debug_tuple("StaticToken").field(&shown).finish()
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Result<Option<String>, RegistryError> {
        Ok(self.0.clone())
    }
}

/// Context for the cluster-internal registry: bearer token as password.
///
/// Fails with a configuration error when no non-empty token is available.
pub fn internal_context(provider: &dyn CredentialProvider) -> Result<RegistryContext, RegistryError> {
    let token = provider
        .bearer_token()?
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            RegistryError::Config("no bearer token available for the internal registry".to_owned())
        })?;
    Ok(RegistryContext {
        credentials: Some(Credentials {
            username: TOKEN_USERNAME.to_owned(),
            password: token,
        }),
        insecure_skip_tls_verify: true,
        accept_legacy_manifests: false,
        plain_http: false,
        request_timeout: None,
    })
}

/// Context for the intermediate migration registry: anonymous.
pub fn migration_context() -> RegistryContext {
    RegistryContext {
        credentials: None,
        insecure_skip_tls_verify: true,
        accept_legacy_manifests: false,
        plain_http: false,
        request_timeout: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_context_uses_token_as_password() {
        let ctx = internal_context(&StaticToken::new("s3cret")).unwrap();
        let creds = ctx.credentials.unwrap();
        assert_eq!(creds.username, TOKEN_USERNAME);
        assert_eq!(creds.password, "s3cret");
        assert!(ctx.insecure_skip_tls_verify);
        assert!(!ctx.accept_legacy_manifests);
    }

    #[test]
    fn internal_context_fails_closed() {
        for provider in [StaticToken::none(), StaticToken::new(""), StaticToken::new("  ")] {
            let err = internal_context(&provider).unwrap_err();
            assert!(matches!(err, RegistryError::Config(_)), "{provider:?}");
        }
    }

    #[test]
    fn migration_context_is_anonymous() {
        let ctx = migration_context();
        assert!(ctx.credentials.is_none());
        assert!(ctx.insecure_skip_tls_verify);
        assert!(!ctx.accept_legacy_manifests);
    }

    #[test]
    fn token_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "abc\n").unwrap();
        let token = ServiceAccountToken::new(&path).bearer_token().unwrap();
        assert_eq!(token.as_deref(), Some("abc"));
    }

    #[test]
    fn missing_token_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ServiceAccountToken::new(dir.path().join("absent"));
        assert_eq!(provider.bearer_token().unwrap(), None);
        assert!(internal_context(&provider).is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let ctx = internal_context(&StaticToken::new("s3cret")).unwrap();
        assert!(!format!("{ctx:?}").contains("s3cret"));
        assert!(!format!("{:?}", StaticToken::new("s3cret")).contains("s3cret"));
    }
}
