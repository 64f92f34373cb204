//! ABOUTME: Translates credential references into username/password pairs
//! ABOUTME: One Vault round-trip per Pulp session, cached with a bounded TTL

use pm_config::CredentialsSpec;
use pm_core::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Resolved credentials for one Pulp session
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct VaultSecretResponse {
    data: VaultSecretData,
}

/// Vault KV payloads come in v1 (flat) and v2 (nested under `data`) shapes
#[derive(Debug, Deserialize)]
struct VaultSecretData {
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    data: Option<InnerSecretData>,
}

#[derive(Debug, Deserialize)]
struct InnerSecretData {
    #[serde(default)]
    password: Option<String>,
}

struct CachedEntry {
    credentials: Credentials,
    fetched_at: Instant,
}

/// Resolver translating a credentials reference into a concrete secret.
///
/// Failures are not retried within a job; the caller fails fast with
/// `CredentialsUnavailable` semantics.
pub struct CredentialsResolver {
    http: reqwest::Client,
    vault_addr: String,
    token: Option<String>,
    cache: RwLock<HashMap<String, CachedEntry>>,
    ttl: Duration,
}

impl CredentialsResolver {
    /// Default cache TTL; long enough to cover a burst of jobs, short enough
    /// that rotated secrets take effect promptly
    pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

    pub fn new(vault_addr: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("pulp-manager/0.1")
            .build()
            .map_err(|e| Error::Config(format!("Failed to build Vault client: {}", e)))?;

        Ok(Self {
            http,
            vault_addr: vault_addr.trim_end_matches('/').to_string(),
            token: std::env::var("VAULT_TOKEN").ok(),
            cache: RwLock::new(HashMap::new()),
            ttl: Self::DEFAULT_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolve a credentials reference to a username/password pair
    pub async fn resolve(&self, spec: &CredentialsSpec) -> Result<Credentials> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&spec.name) {
                if entry.fetched_at.elapsed() < self.ttl {
                    debug!(credentials = %spec.name, "Credentials served from cache");
                    return Ok(entry.credentials.clone());
                }
            }
        }

        let credentials = self.fetch(spec).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            spec.name.clone(),
            CachedEntry {
                credentials: credentials.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(credentials)
    }

    async fn fetch(&self, spec: &CredentialsSpec) -> Result<Credentials> {
        let url = format!(
            "{}/v1/{}",
            self.vault_addr,
            spec.vault_service_account_mount.trim_start_matches('/')
        );
        debug!(credentials = %spec.name, "Fetching secret from Vault");

        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.header("X-Vault-Token", token);
        }

        let response = request.send().await.map_err(|e| {
            Error::Credentials(format!("Vault request for '{}' failed: {}", spec.name, e))
        })?;

        if !response.status().is_success() {
            warn!(
                credentials = %spec.name,
                status = %response.status(),
                "Vault returned an error status"
            );
            return Err(Error::Credentials(format!(
                "Vault returned {} for '{}'",
                response.status(),
                spec.name
            )));
        }

        let secret: VaultSecretResponse = response.json().await.map_err(|e| {
            Error::Credentials(format!("Invalid Vault payload for '{}': {}", spec.name, e))
        })?;

        let password = secret
            .data
            .password
            .or(secret.data.data.and_then(|inner| inner.password))
            .ok_or_else(|| {
                Error::Credentials(format!(
                    "Secret for '{}' has no password field",
                    spec.name
                ))
            })?;

        Ok(Credentials {
            username: spec.username.clone(),
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec() -> CredentialsSpec {
        CredentialsSpec {
            name: "pulp_admin".to_string(),
            username: "admin".to_string(),
            vault_service_account_mount: "secret/pulp/admin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_resolve_kv_v1_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/pulp/admin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"password": "hunter2"}})),
            )
            .mount(&server)
            .await;

        let resolver = CredentialsResolver::new(&server.uri()).unwrap();
        let creds = resolver.resolve(&spec()).await.unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "hunter2");
    }

    #[tokio::test]
    async fn test_resolve_kv_v2_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/pulp/admin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"data": {"password": "hunter3"}}
            })))
            .mount(&server)
            .await;

        let resolver = CredentialsResolver::new(&server.uri()).unwrap();
        let creds = resolver.resolve(&spec()).await.unwrap();
        assert_eq!(creds.password, "hunter3");
    }

    #[tokio::test]
    async fn test_cache_avoids_second_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/pulp/admin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"password": "hunter2"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver = CredentialsResolver::new(&server.uri()).unwrap();
        resolver.resolve(&spec()).await.unwrap();
        resolver.resolve(&spec()).await.unwrap();
        // Mock expectation of exactly one request is verified on drop
    }

    #[tokio::test]
    async fn test_expired_cache_refetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/pulp/admin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"password": "hunter2"}})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let resolver = CredentialsResolver::new(&server.uri())
            .unwrap()
            .with_ttl(Duration::from_millis(10));
        resolver.resolve(&spec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.resolve(&spec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_secret_is_credentials_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/pulp/admin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver = CredentialsResolver::new(&server.uri()).unwrap();
        let err = resolver.resolve(&spec()).await.unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
    }

    #[tokio::test]
    async fn test_secret_without_password_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/pulp/admin"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"token": "abc"}})),
            )
            .mount(&server)
            .await;

        let resolver = CredentialsResolver::new(&server.uri()).unwrap();
        let err = resolver.resolve(&spec()).await.unwrap_err();
        assert!(err.to_string().contains("no password"));
    }
}
