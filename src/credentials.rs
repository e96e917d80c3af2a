//! Google service-account credentials.
//!
//! Hosting platforms hand us the key as a base64 environment variable. It is
//! decoded into a temporary file, loaded back and checked before the bot
//! starts, then used to mint OAuth2 access tokens for Dialogflow.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::assistant::intent::IntentError;

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Refresh this long before the token actually expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Upper bound on how long a token is trusted, whatever the server says.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug)]
pub enum CredentialError {
    Decode(base64::DecodeError),
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    InvalidKey(jsonwebtoken::errors::Error),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "credentials are not valid base64: {e}"),
            Self::Io { path, source } => {
                write!(f, "failed to write credentials file '{}': {}", path.display(), source)
            }
            Self::Parse(e) => write!(f, "credentials are not a service-account key: {e}"),
            Self::InvalidKey(e) => write!(f, "service-account private key is unusable: {e}"),
        }
    }
}

impl std::error::Error for CredentialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Io { source, .. } => Some(source),
            Self::Parse(e) => Some(e),
            Self::InvalidKey(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// A verified service-account key backed by a temporary file.
pub struct Credentials {
    file: NamedTempFile,
    key: ServiceAccountKey,
    signing_key: EncodingKey,
}

impl Credentials {
    pub fn bootstrap(encoded: &str) -> Result<Self, CredentialError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(CredentialError::Decode)?;

        let mut file = NamedTempFile::new().map_err(|e| CredentialError::Io {
            path: std::env::temp_dir(),
            source: e,
        })?;
        if let Err(e) = file.write_all(&bytes).and_then(|_| file.flush()) {
            return Err(CredentialError::Io {
                path: file.path().to_path_buf(),
                source: e,
            });
        }

        let (key, signing_key) = load_key(file.path())?;
        Ok(Self { file, key, signing_key })
    }

    /// Location of the decoded key; removed when `self` is dropped.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn key(&self) -> &ServiceAccountKey {
        &self.key
    }
}

/// Reads and checks a service-account key file.
pub fn load_key(path: &Path) -> Result<(ServiceAccountKey, EncodingKey), CredentialError> {
    let content = std::fs::read_to_string(path).map_err(|e| CredentialError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let key: ServiceAccountKey = serde_json::from_str(&content).map_err(CredentialError::Parse)?;
    let signing_key =
        EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(CredentialError::InvalidKey)?;
    Ok((key, signing_key))
}

/// Supplies bearer tokens for Google APIs.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, IntentError>;
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

impl CachedToken {
    fn new(token: String, expires_in: Duration, now: Instant) -> Self {
        let lifetime = expires_in.saturating_sub(REFRESH_MARGIN).min(MAX_TOKEN_LIFETIME);
        Self {
            token,
            refresh_at: now.checked_add(lifetime).unwrap_or(now),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

/// OAuth2 JWT-bearer flow for a service account, with token caching.
pub struct ServiceAccountAuth {
    credentials: Credentials,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountAuth {
    pub fn new(credentials: Credentials, timeout: Duration) -> Result<Self, IntentError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IntentError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            credentials,
            http,
            cached: Mutex::new(None),
        })
    }

    fn assertion(&self) -> Result<String, IntentError> {
        let key = self.credentials.key();
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = key.private_key_id.clone();
        jsonwebtoken::encode(&header, &claims, &self.credentials.signing_key)
            .map_err(|e| IntentError::Authentication(format!("failed to sign assertion: {e}")))
    }

    async fn fetch(&self) -> Result<CachedToken, IntentError> {
        let assertion = self.assertion()?;
        let response = self
            .http
            .post(&self.credentials.key().token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| IntentError::Transport(format!("token exchange: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IntentError::Transport(format!("token exchange: {e}")))?;
        if !status.is_success() {
            return Err(IntentError::Authentication(format!("token exchange {status}: {body}")));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| IntentError::MalformedResponse(format!("token response: {e}")))?;
        debug!("Fetched access token valid for {}s", parsed.expires_in);
        Ok(CachedToken::new(
            parsed.access_token,
            Duration::from_secs(parsed.expires_in),
            Instant::now(),
        ))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountAuth {
    async fn access_token(&self) -> Result<String, IntentError> {
        let mut cached = self.cached.lock().await;
        if let Some(ref token) = *cached
            && token.is_fresh(Instant::now())
        {
            return Ok(token.token.clone());
        }
        let token = self.fetch().await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Form, Router};
    use jsonwebtoken::{DecodingKey, Validation};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};

    const TEST_KEY_PEM: &str = include_str!("testdata/service_account_key.pem");
    const TEST_PUBLIC_PEM: &str = include_str!("testdata/service_account_key.pub.pem");
    const CLIENT_EMAIL: &str = "vaultbot@makers-vault.iam.gserviceaccount.com";

    type Forms = Arc<StdMutex<Vec<HashMap<String, String>>>>;

    #[derive(Debug, Deserialize)]
    struct DecodedClaims {
        iss: String,
        scope: String,
        aud: String,
        iat: i64,
        exp: i64,
    }

    fn key_json(token_uri: &str) -> String {
        serde_json::json!({
            "type": "service_account",
            "project_id": "makers-vault",
            "private_key_id": "kid-1",
            "private_key": TEST_KEY_PEM,
            "client_email": CLIENT_EMAIL,
            "token_uri": token_uri,
        })
        .to_string()
    }

    /// Token endpoint answering every exchange with the same response.
    async fn fake_token_server(status: StatusCode, reply: &'static str) -> (String, Forms) {
        let forms: Forms = Arc::new(StdMutex::new(Vec::new()));
        let sink = forms.clone();
        let app = Router::new().route(
            "/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(form);
                    (status, reply)
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/token"), forms)
    }

    fn auth_for(token_uri: &str) -> ServiceAccountAuth {
        let credentials = Credentials::bootstrap(&encode(&key_json(token_uri))).unwrap();
        ServiceAccountAuth::new(credentials, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_bootstrap_valid_key() {
        let json = key_json(DEFAULT_TOKEN_URI);
        let credentials = Credentials::bootstrap(&format!("{}\n", encode(&json))).unwrap();
        assert_eq!(credentials.key().client_email, CLIENT_EMAIL);
        assert_eq!(credentials.key().project_id.as_deref(), Some("makers-vault"));
        assert_eq!(credentials.key().private_key_id.as_deref(), Some("kid-1"));
        assert_eq!(std::fs::read_to_string(credentials.path()).unwrap(), json);

        let path = credentials.path().to_path_buf();
        drop(credentials);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_token_exchange_posts_signed_assertion() {
        let (token_uri, forms) = fake_token_server(
            StatusCode::OK,
            r#"{"access_token": "ya29.first", "expires_in": 3600, "token_type": "Bearer"}"#,
        )
        .await;
        let auth = auth_for(&token_uri);
        assert_eq!(auth.access_token().await.unwrap(), "ya29.first");

        let forms = forms.lock().unwrap().clone();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0]["grant_type"], JWT_BEARER_GRANT);

        let assertion = &forms[0]["assertion"];
        let header = jsonwebtoken::decode_header(assertion).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some("kid-1"));

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[token_uri.as_str()]);
        let decoding_key = DecodingKey::from_rsa_pem(TEST_PUBLIC_PEM.as_bytes()).unwrap();
        let claims = jsonwebtoken::decode::<DecodedClaims>(assertion, &decoding_key, &validation)
            .unwrap()
            .claims;
        assert_eq!(claims.iss, CLIENT_EMAIL);
        assert_eq!(claims.scope, CLOUD_PLATFORM_SCOPE);
        assert_eq!(claims.aud, token_uri);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[tokio::test]
    async fn test_access_token_reused_while_fresh() {
        let (token_uri, forms) =
            fake_token_server(StatusCode::OK, r#"{"access_token": "ya29.cached", "expires_in": 3600}"#).await;
        let auth = auth_for(&token_uri);
        assert_eq!(auth.access_token().await.unwrap(), "ya29.cached");
        assert_eq!(auth.access_token().await.unwrap(), "ya29.cached");
        assert_eq!(forms.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_expires_in_defaults_to_an_hour() {
        let (token_uri, _) = fake_token_server(StatusCode::OK, r#"{"access_token": "ya29.x"}"#).await;
        let auth = auth_for(&token_uri);
        auth.access_token().await.unwrap();

        let cached = auth.cached.lock().await.clone().unwrap();
        let now = Instant::now();
        assert!(cached.is_fresh(now + Duration::from_secs(3000)));
        assert!(!cached.is_fresh(now + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_rejected_exchange_is_authentication_error() {
        let (token_uri, forms) =
            fake_token_server(StatusCode::BAD_REQUEST, r#"{"error": "invalid_grant"}"#).await;
        let auth = auth_for(&token_uri);
        let err = auth.access_token().await.unwrap_err();
        assert!(matches!(err, IntentError::Authentication(ref msg) if msg.contains("invalid_grant")), "{err:?}");
        assert!(auth.cached.lock().await.is_none());

        // Failures are not cached.
        assert!(auth.access_token().await.is_err());
        assert_eq!(forms.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_garbage_token_response_is_malformed() {
        let (token_uri, _) = fake_token_server(StatusCode::OK, "<html>").await;
        let err = auth_for(&token_uri).access_token().await.unwrap_err();
        assert!(matches!(err, IntentError::MalformedResponse(_)), "{err:?}");
    }

    fn encode(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    fn assert_err<T>(result: Result<T, CredentialError>) -> CredentialError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_not_base64() {
        let err = assert_err(Credentials::bootstrap("not base64 at all!!"));
        assert!(matches!(err, CredentialError::Decode(_)));
    }

    #[test]
    fn test_not_json() {
        let err = assert_err(Credentials::bootstrap(&encode("hello")));
        assert!(matches!(err, CredentialError::Parse(_)));
    }

    #[test]
    fn test_missing_private_key() {
        let err = assert_err(Credentials::bootstrap(&encode(r#"{"client_email": "bot@x.iam"}"#)));
        assert!(matches!(err, CredentialError::Parse(_)));
        assert!(err.to_string().contains("private_key"));
    }

    #[test]
    fn test_garbage_private_key() {
        let json = r#"{"client_email": "bot@x.iam", "private_key": "not a pem"}"#;
        let err = assert_err(Credentials::bootstrap(&format!("  {}\n", encode(json))));
        assert!(matches!(err, CredentialError::InvalidKey(_)));
    }

    #[test]
    fn test_key_defaults() {
        let key: ServiceAccountKey =
            serde_json::from_str(r#"{"client_email": "bot@x.iam", "private_key": "k"}"#).unwrap();
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
        assert!(key.project_id.is_none());
    }

    #[test]
    fn test_load_key_missing_file() {
        let err = assert_err(load_key(Path::new("/nonexistent/credentials.json")));
        assert!(matches!(err, CredentialError::Io { .. }));
    }

    #[test]
    fn test_cached_token_refreshes_before_expiry() {
        let now = Instant::now();
        let token = CachedToken::new("t".into(), Duration::from_secs(3600), now);
        assert!(token.is_fresh(now + Duration::from_secs(3000)));
        assert!(!token.is_fresh(now + Duration::from_secs(3541)));

        let short = CachedToken::new("t".into(), Duration::from_secs(30), now);
        assert!(!short.is_fresh(now));
    }

    #[test]
    fn test_cached_token_caps_huge_lifetime() {
        let now = Instant::now();
        let token = CachedToken::new("t".into(), Duration::from_secs(u64::MAX), now);
        assert!(token.is_fresh(now + Duration::from_secs(3600)));
        assert!(!token.is_fresh(now + MAX_TOKEN_LIFETIME));
    }
}
