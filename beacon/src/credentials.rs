//! OAuth2 service-account credentials for the Firestore sink.
//!
//! A short-lived RS256 JWT assertion is exchanged at the token endpoint for a
//! bearer token. The token is cached and reused until shortly before it
//! expires; expiry is only noticed lazily when a caller asks for a token.

use crate::metrics_defs::CREDENTIAL_REFRESH;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use http::StatusCode;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

/// Scope allowing writes to Firestore documents.
pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

const ASSERTION_LIFETIME: TimeDelta = TimeDelta::minutes(10);

/// Subtracted from the provider-reported lifetime so a token is never used
/// right at the edge of its validity.
pub const EXPIRY_MARGIN: TimeDelta = TimeDelta::minutes(5);

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("invalid service account key: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),

    #[error("failed to sign assertion: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("token request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("token endpoint responded with status {0}")]
    UnexpectedStatus(StatusCode),
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Claims of the assertion presented to the token endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

pub trait AssertionSigner: Send + Sync {
    fn sign(&self, claims: &AssertionClaims) -> Result<String, CredentialError>;
}

/// Signs assertions with the service account's RSA private key.
pub struct Rs256Signer {
    key: EncodingKey,
}

impl Rs256Signer {
    pub fn from_pem(pem: &str) -> Result<Self, CredentialError> {
        // Keys pasted into environment values often carry escaped newlines
        let pem = pem.replace("\\n", "\n");
        let key = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(CredentialError::InvalidKey)?;
        Ok(Rs256Signer { key })
    }
}

impl AssertionSigner for Rs256Signer {
    fn sign(&self, claims: &AssertionClaims) -> Result<String, CredentialError> {
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), claims, &self.key)
            .map_err(CredentialError::Signing)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Lifetime of the token in seconds
    pub expires_in: i64,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange(&self, assertion: &str) -> Result<TokenResponse, CredentialError>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    assertion: &'a str,
}

pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    url: Url,
}

impl HttpTokenEndpoint {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        HttpTokenEndpoint { client, url }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange(&self, assertion: &str) -> Result<TokenResponse, CredentialError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&TokenRequest {
                grant_type: JWT_BEARER_GRANT_TYPE,
                assertion,
            })
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<TokenResponse>().await?),
            status => Err(CredentialError::UnexpectedStatus(status)),
        }
    }
}

/// A bearer token and the instant after which it must not be reused.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(secret: String, expires_at: DateTime<Utc>) -> Self {
        AccessToken { secret, expires_at }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Process-wide token cache for one service account.
///
/// Refreshes are serialized: callers that find the token expired while a
/// refresh is running wait for it and reuse its result.
pub struct AccessCredentials {
    issuer: String,
    audience: String,
    clock: Arc<dyn Clock>,
    signer: Box<dyn AssertionSigner>,
    endpoint: Box<dyn TokenEndpoint>,
    cached: Mutex<Option<AccessToken>>,
}

impl AccessCredentials {
    /// `issuer` is the service account email, `audience` the token endpoint URL.
    pub fn new(
        issuer: String,
        audience: String,
        clock: Arc<dyn Clock>,
        signer: Box<dyn AssertionSigner>,
        endpoint: Box<dyn TokenEndpoint>,
    ) -> Self {
        AccessCredentials {
            issuer,
            audience,
            clock,
            signer,
            endpoint,
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached token, refreshing it first if it is missing or expired.
    pub async fn get(&self) -> Result<AccessToken, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_valid_at(self.clock.now())
        {
            return Ok(token.clone());
        }

        let token = self.fetch().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Unconditionally replaces the cached token with a new one.
    pub async fn refresh(&self) -> Result<AccessToken, CredentialError> {
        let mut cached = self.cached.lock().await;
        let token = self.fetch().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn fetch(&self) -> Result<AccessToken, CredentialError> {
        let issued_at = self.clock.now();
        let claims = AssertionClaims {
            iss: self.issuer.clone(),
            scope: DATASTORE_SCOPE.to_string(),
            aud: self.audience.clone(),
            iat: issued_at.timestamp(),
            exp: (issued_at + ASSERTION_LIFETIME).timestamp(),
        };

        let result = async {
            let assertion = self.signer.sign(&claims)?;
            self.endpoint.exchange(&assertion).await
        }
        .await;

        let status = if result.is_ok() { "ok" } else { "error" };
        shared::counter!(CREDENTIAL_REFRESH, "status" => status).increment(1);

        let response = result?;
        // An unrepresentable lifetime expires the token immediately
        let expires_at = TimeDelta::try_seconds(response.expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .and_then(|t| t.checked_sub_signed(EXPIRY_MARGIN))
            .unwrap_or(issued_at);
        tracing::debug!(issuer = %self.issuer, %expires_at, "Refreshed access token");

        Ok(AccessToken::new(response.access_token, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::start_test_server;
    use chrono::TimeZone;
    use jsonwebtoken::{DecodingKey, Validation};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEST_KEY: &str = include_str!("../test_resources/service_account_key.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("../test_resources/service_account_key.pub.pem");

    struct FakeClock(std::sync::Mutex<DateTime<Utc>>);

    impl FakeClock {
        fn at(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(FakeClock(std::sync::Mutex::new(now)))
        }

        fn advance(&self, by: TimeDelta) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct FakeSigner;

    impl AssertionSigner for FakeSigner {
        fn sign(&self, claims: &AssertionClaims) -> Result<String, CredentialError> {
            Ok(format!("assertion-for-{}", claims.iss))
        }
    }

    #[derive(Clone, Default)]
    struct FakeEndpoint {
        calls: Arc<AtomicUsize>,
        assertions: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        async fn exchange(&self, assertion: &str) -> Result<TokenResponse, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.assertions.lock().unwrap().push(assertion.to_string());
            Ok(TokenResponse {
                access_token: format!("tok{n}"),
                expires_in: 3600,
            })
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn credentials(clock: Arc<FakeClock>, endpoint: FakeEndpoint) -> AccessCredentials {
        AccessCredentials::new(
            "relay@analytics.iam.gserviceaccount.com".into(),
            "https://oauth2.googleapis.com/token".into(),
            clock,
            Box::new(FakeSigner),
            Box::new(endpoint),
        )
    }

    async fn prime(credentials: &AccessCredentials, token: AccessToken) {
        *credentials.cached.lock().await = Some(token);
    }

    #[tokio::test]
    async fn test_first_get_fetches_token() {
        let endpoint = FakeEndpoint::default();
        let credentials = credentials(FakeClock::at(t0()), endpoint.clone());

        let token = credentials.get().await.unwrap();
        assert_eq!(token.secret(), "tok1");
        assert_eq!(
            token.expires_at(),
            t0() + TimeDelta::seconds(3600) - TimeDelta::seconds(300)
        );
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            endpoint.assertions.lock().unwrap().as_slice(),
            ["assertion-for-relay@analytics.iam.gserviceaccount.com"]
        );
    }

    #[tokio::test]
    async fn test_valid_token_is_reused() {
        let endpoint = FakeEndpoint::default();
        let credentials = credentials(FakeClock::at(t0()), endpoint.clone());
        prime(
            &credentials,
            AccessToken::new("cached".into(), t0() + TimeDelta::minutes(10)),
        )
        .await;

        let token = credentials.get().await.unwrap();
        assert_eq!(token.secret(), "cached");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_once() {
        let endpoint = FakeEndpoint::default();
        let credentials = credentials(FakeClock::at(t0()), endpoint.clone());
        prime(
            &credentials,
            AccessToken::new("stale".into(), t0() - TimeDelta::minutes(1)),
        )
        .await;

        let token = credentials.get().await.unwrap();
        assert_eq!(token.secret(), "tok1");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

        // The new token is cached
        let again = credentials.get().await.unwrap();
        assert_eq!(again.secret(), "tok1");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiry_is_detected_lazily() {
        let clock = FakeClock::at(t0());
        let endpoint = FakeEndpoint::default();
        let credentials = credentials(clock.clone(), endpoint.clone());

        assert_eq!(credentials.get().await.unwrap().secret(), "tok1");

        // Still inside the effective lifetime of 55 minutes
        clock.advance(TimeDelta::minutes(54));
        assert_eq!(credentials.get().await.unwrap().secret(), "tok1");

        clock.advance(TimeDelta::minutes(1));
        assert_eq!(credentials.get().await.unwrap().secret(), "tok2");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_refresh() {
        let endpoint = FakeEndpoint::default();
        let credentials = Arc::new(credentials(FakeClock::at(t0()), endpoint.clone()));

        let (a, b) = tokio::join!(credentials.get(), credentials.get());
        assert_eq!(a.unwrap().secret(), "tok1");
        assert_eq!(b.unwrap().secret(), "tok1");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    struct FixedLifetimeEndpoint(i64);

    #[async_trait]
    impl TokenEndpoint for FixedLifetimeEndpoint {
        async fn exchange(&self, _assertion: &str) -> Result<TokenResponse, CredentialError> {
            Ok(TokenResponse {
                access_token: "tok".into(),
                expires_in: self.0,
            })
        }
    }

    #[tokio::test]
    async fn test_unrepresentable_lifetime_expires_immediately() {
        for expires_in in [9_000_000_000_000, i64::MAX] {
            let credentials = AccessCredentials::new(
                "relay@analytics.iam.gserviceaccount.com".into(),
                "https://oauth2.googleapis.com/token".into(),
                FakeClock::at(t0()),
                Box::new(FakeSigner),
                Box::new(FixedLifetimeEndpoint(expires_in)),
            );

            let token = credentials.get().await.unwrap();
            assert_eq!(token.secret(), "tok");
            assert_eq!(token.expires_at(), t0());
            // Not reusable, so the next caller refreshes instead of panicking
            assert!(credentials.get().await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_explicit_refresh() {
        let endpoint = FakeEndpoint::default();
        let credentials = credentials(FakeClock::at(t0()), endpoint.clone());

        assert_eq!(credentials.get().await.unwrap().secret(), "tok1");
        assert_eq!(credentials.refresh().await.unwrap().secret(), "tok2");
        assert_eq!(credentials.get().await.unwrap().secret(), "tok2");
    }

    #[test]
    fn test_rs256_signer() {
        let signer = Rs256Signer::from_pem(TEST_KEY).unwrap();
        let claims = AssertionClaims {
            iss: "relay@analytics.iam.gserviceaccount.com".into(),
            scope: DATASTORE_SCOPE.into(),
            aud: "https://oauth2.googleapis.com/token".into(),
            iat: Utc::now().timestamp(),
            exp: (Utc::now() + ASSERTION_LIFETIME).timestamp(),
        };

        let jwt = signer.sign(&claims).unwrap();
        assert_eq!(jwt.split('.').count(), 3);

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["https://oauth2.googleapis.com/token"]);
        let decoded = jsonwebtoken::decode::<AssertionClaims>(
            &jwt,
            &DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims, claims);
    }

    #[test]
    fn test_rs256_signer_accepts_escaped_newlines() {
        let escaped = TEST_KEY.replace('\n', "\\n");
        assert!(Rs256Signer::from_pem(&escaped).is_ok());
    }

    #[test]
    fn test_rs256_signer_rejects_garbage() {
        assert!(matches!(
            Rs256Signer::from_pem("not a key"),
            Err(CredentialError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_http_token_endpoint() {
        let server = start_test_server(
            StatusCode::OK,
            r#"{"access_token":"tok123","expires_in":3600,"token_type":"Bearer"}"#,
        )
        .await;
        let endpoint =
            HttpTokenEndpoint::new(reqwest::Client::new(), server.url.join("token").unwrap());

        let response = endpoint.exchange("signed-assertion").await.unwrap();
        assert_eq!(
            response,
            TokenResponse {
                access_token: "tok123".into(),
                expires_in: 3600,
            }
        );

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, http::Method::POST);
        assert_eq!(requests[0].uri.path(), "/token");
        assert_eq!(
            requests[0].json(),
            serde_json::json!({
                "grant_type": "urn:ietf:params:oauth:grant-type:jwt-bearer",
                "assertion": "signed-assertion",
            })
        );
    }

    #[tokio::test]
    async fn test_http_token_endpoint_error_status() {
        let server = start_test_server(StatusCode::UNAUTHORIZED, "{}").await;
        let endpoint = HttpTokenEndpoint::new(reqwest::Client::new(), server.url.clone());

        assert!(matches!(
            endpoint.exchange("signed-assertion").await,
            Err(CredentialError::UnexpectedStatus(StatusCode::UNAUTHORIZED))
        ));
    }

    #[tokio::test]
    async fn test_refresh_through_http_endpoint() {
        let server = start_test_server(
            StatusCode::OK,
            r#"{"access_token":"tok123","expires_in":3600}"#,
        )
        .await;
        let credentials = AccessCredentials::new(
            "relay@analytics.iam.gserviceaccount.com".into(),
            server.url.to_string(),
            FakeClock::at(t0()),
            Box::new(Rs256Signer::from_pem(TEST_KEY).unwrap()),
            Box::new(HttpTokenEndpoint::new(
                reqwest::Client::new(),
                server.url.clone(),
            )),
        );

        let token = credentials.get().await.unwrap();
        assert_eq!(token.secret(), "tok123");
        assert_eq!(
            token.expires_at(),
            t0() + TimeDelta::seconds(3600 - 300)
        );
    }
}
