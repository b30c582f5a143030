//! Multi-provider request authentication: JWT verification, API keys,
//! Google IAP claim checks, and OAuth2 token introspection behind one
//! pluggable [`AuthProvider`] trait.
//!
//! Token *issuance* and framework-specific role/permission decorators are
//! out of scope here — this module verifies credentials a caller already
//! holds and hands back an [`AuthUser`]; wiring that into a particular web
//! framework's request/response types is left to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::clock::SharedClock;
use crate::error::{Error, Result};

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthResult {
    Success,
    Failed,
    Expired,
    Invalid,
    Missing,
}

/// Authenticated caller identity, normalized across providers.
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub permissions: HashSet<String>,
    pub provider: String,
    pub metadata: HashMap<String, Value>,
    pub authenticated_at: f64,
}

impl AuthUser {
    pub fn new(user_id: impl Into<String>, provider: impl Into<String>, authenticated_at: f64) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            roles: Vec::new(),
            permissions: HashSet::new(),
            provider: provider.into(),
            metadata: HashMap::new(),
            authenticated_at,
        }
    }

    pub fn anonymous(authenticated_at: f64) -> Self {
        Self::new("anonymous", "none", authenticated_at)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Result of an [`AuthMiddleware::authenticate`] call.
#[derive(Debug, Clone)]
pub struct AuthResponse {
    pub result: AuthResult,
    pub user: Option<AuthUser>,
    pub error: Option<String>,
}

impl AuthResponse {
    fn success(user: AuthUser) -> Self {
        Self { result: AuthResult::Success, user: Some(user), error: None }
    }

    fn failure(result: AuthResult, error: impl Into<String>) -> Self {
        Self { result, user: None, error: Some(error.into()) }
    }
}

/// Minimal request facade a provider needs: header lookup by name. Callers
/// adapt their framework's request type into this once, at the edge.
pub trait CredentialSource {
    fn header(&self, name: &str) -> Option<&str>;
    fn path(&self) -> &str;
}

fn bearer_token(source: &dyn CredentialSource) -> Option<String> {
    let value = source.header("Authorization")?;
    value.strip_prefix("Bearer ").map(|s| s.to_string())
}

/// A pluggable credential verifier.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn authenticate(&self, credentials: &str) -> AuthResponse;
    fn extract_credentials(&self, source: &dyn CredentialSource) -> Option<String> {
        bearer_token(source)
    }
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    permissions: HashSet<String>,
    iss: Option<String>,
    aud: Option<String>,
    exp: Option<i64>,
    iat: Option<i64>,
}

/// JWT authentication provider. Verification only — token issuance belongs
/// to whatever identity provider mints the tokens, not the request-path
/// middleware that checks them.
pub struct JwtProvider {
    decoding_key: jsonwebtoken::DecodingKey,
    validation: jsonwebtoken::Validation,
}

impl JwtProvider {
    pub fn new(secret_key: &str, issuer: Option<&str>, audience: Option<&str>, leeway_seconds: u64) -> Self {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.leeway = leeway_seconds;
        validation.validate_exp = true;
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }
        Self { decoding_key: jsonwebtoken::DecodingKey::from_secret(secret_key.as_bytes()), validation }
    }
}

#[async_trait]
impl AuthProvider for JwtProvider {
    fn name(&self) -> &str {
        "jwt"
    }

    async fn authenticate(&self, credentials: &str) -> AuthResponse {
        match jsonwebtoken::decode::<JwtClaims>(credentials, &self.decoding_key, &self.validation) {
            Ok(token_data) => {
                let claims = token_data.claims;
                let mut metadata = HashMap::new();
                metadata.insert("iss".to_string(), serde_json::json!(claims.iss));
                metadata.insert("aud".to_string(), serde_json::json!(claims.aud));
                metadata.insert("exp".to_string(), serde_json::json!(claims.exp));
                metadata.insert("iat".to_string(), serde_json::json!(claims.iat));

                let user = AuthUser {
                    user_id: claims.sub,
                    email: claims.email,
                    roles: claims.roles,
                    permissions: claims.permissions,
                    provider: self.name().to_string(),
                    metadata,
                    authenticated_at: claims.iat.unwrap_or(0) as f64,
                };
                AuthResponse::success(user)
            }
            Err(err) => match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AuthResponse::failure(AuthResult::Expired, "token has expired")
                }
                _ => AuthResponse::failure(AuthResult::Invalid, err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyUserInfo {
    pub user_id: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub permissions: HashSet<String>,
    pub metadata: HashMap<String, Value>,
}

/// API-key authentication provider. Keys are stored hashed so a leaked
/// backing store never reveals raw keys.
pub struct ApiKeyProvider {
    header_name: String,
    valid_keys: Mutex<HashMap<String, ApiKeyUserInfo>>,
}

impl ApiKeyProvider {
    pub fn new(header_name: impl Into<String>) -> Self {
        Self { header_name: header_name.into(), valid_keys: Mutex::new(HashMap::new()) }
    }

    fn hash_key(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }

    pub fn add_key(&self, key: &str, user_info: ApiKeyUserInfo) {
        self.valid_keys.lock().insert(Self::hash_key(key), user_info);
    }

    pub fn revoke_key(&self, key: &str) {
        self.valid_keys.lock().remove(&Self::hash_key(key));
    }
}

#[async_trait]
impl AuthProvider for ApiKeyProvider {
    fn name(&self) -> &str {
        "api_key"
    }

    fn extract_credentials(&self, source: &dyn CredentialSource) -> Option<String> {
        source.header(&self.header_name).map(|s| s.to_string())
    }

    async fn authenticate(&self, credentials: &str) -> AuthResponse {
        let key_hash = Self::hash_key(credentials);
        let keys = self.valid_keys.lock();
        match keys.get(&key_hash) {
            Some(info) => {
                let mut roles = info.roles.clone();
                if roles.is_empty() {
                    roles.push("api_access".to_string());
                }
                let user = AuthUser {
                    user_id: info.user_id.clone(),
                    email: info.email.clone(),
                    roles,
                    permissions: info.permissions.clone(),
                    provider: self.name().to_string(),
                    metadata: info.metadata.clone(),
                    authenticated_at: 0.0,
                };
                AuthResponse::success(user)
            }
            None => AuthResponse::failure(AuthResult::Invalid, "invalid API key"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IapClaims {
    sub: Option<String>,
    email: Option<String>,
    iss: Option<String>,
    aud: Option<String>,
    exp: Option<i64>,
    email_verified: Option<bool>,
    hd: Option<String>,
}

/// Google IAP provider. Performs local claim checks only (audience,
/// issuer, expiry) — verifying the JWT signature against Google's signing
/// keys requires a network-fetched JWKS and is left to the caller's own
/// verification layer.
pub struct GoogleIapProvider {
    expected_audience: String,
    clock: SharedClock,
}

impl GoogleIapProvider {
    pub fn new(expected_audience: impl Into<String>, clock: SharedClock) -> Self {
        Self { expected_audience: expected_audience.into(), clock }
    }
}

#[async_trait]
impl AuthProvider for GoogleIapProvider {
    fn name(&self) -> &str {
        "google_iap"
    }

    fn extract_credentials(&self, source: &dyn CredentialSource) -> Option<String> {
        source.header("X-Goog-IAP-JWT-Assertion").map(|s| s.to_string())
    }

    async fn authenticate(&self, credentials: &str) -> AuthResponse {
        let parts: Vec<&str> = credentials.split('.').collect();
        if parts.len() != 3 {
            return AuthResponse::failure(AuthResult::Invalid, "invalid JWT format");
        }

        let payload_bytes = match base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            parts[1].trim_end_matches('='),
        ) {
            Ok(bytes) => bytes,
            Err(_) => return AuthResponse::failure(AuthResult::Invalid, "invalid JWT payload encoding"),
        };
        let claims: IapClaims = match serde_json::from_slice(&payload_bytes) {
            Ok(claims) => claims,
            Err(_) => return AuthResponse::failure(AuthResult::Invalid, "invalid JWT payload"),
        };

        if claims.aud.as_deref() != Some(self.expected_audience.as_str()) {
            return AuthResponse::failure(AuthResult::Invalid, "invalid audience");
        }
        if !matches!(claims.iss.as_deref(), Some("https://cloud.google.com/iap") | Some("accounts.google.com")) {
            return AuthResponse::failure(AuthResult::Invalid, "invalid issuer");
        }
        if claims.exp.unwrap_or(0) < self.clock.now() as i64 {
            return AuthResponse::failure(AuthResult::Expired, "token expired");
        }

        let mut metadata = HashMap::new();
        metadata.insert("iss".to_string(), serde_json::json!(claims.iss));
        metadata.insert("email_verified".to_string(), serde_json::json!(claims.email_verified));
        metadata.insert("hd".to_string(), serde_json::json!(claims.hd));

        let user = AuthUser {
            user_id: claims.sub.unwrap_or_else(|| "unknown".to_string()),
            email: claims.email,
            roles: vec!["iap_user".to_string()],
            permissions: HashSet::new(),
            provider: self.name().to_string(),
            metadata,
            authenticated_at: self.clock.now(),
        };
        AuthResponse::success(user)
    }
}

struct CachedOAuth2User {
    user: AuthUser,
    cached_at: f64,
}

/// OAuth2 bearer-token provider, validated via RFC 7662 token
/// introspection and cached for `token_cache_ttl_seconds` to avoid
/// round-tripping to the authorization server on every request.
pub struct OAuth2Provider {
    introspection_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_cache_ttl_seconds: f64,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CachedOAuth2User>>,
    clock: SharedClock,
}

impl OAuth2Provider {
    pub fn new(
        introspection_url: impl Into<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
        token_cache_ttl_seconds: f64,
        clock: SharedClock,
    ) -> Self {
        Self {
            introspection_url: introspection_url.into(),
            client_id,
            client_secret,
            token_cache_ttl_seconds,
            client: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn token_hash(token: &str) -> String {
        format!("{:x}", Sha256::digest(token.as_bytes()))
    }
}

#[async_trait]
impl AuthProvider for OAuth2Provider {
    fn name(&self) -> &str {
        "oauth2"
    }

    async fn authenticate(&self, credentials: &str) -> AuthResponse {
        let token_hash = Self::token_hash(credentials);
        let now = self.clock.now();
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(&token_hash) {
                if now - cached.cached_at < self.token_cache_ttl_seconds {
                    return AuthResponse::success(cached.user.clone());
                }
            }
        }

        let mut request = self.client.post(&self.introspection_url).form(&[("token", credentials)]);
        if let Some(client_id) = &self.client_id {
            request = request.basic_auth(client_id, self.client_secret.as_deref());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return AuthResponse::failure(AuthResult::Failed, err.to_string()),
        };
        if !response.status().is_success() {
            return AuthResponse::failure(AuthResult::Failed, "introspection failed");
        }

        let data: Value = match response.json().await {
            Ok(data) => data,
            Err(err) => return AuthResponse::failure(AuthResult::Failed, err.to_string()),
        };

        if !data.get("active").and_then(Value::as_bool).unwrap_or(false) {
            return AuthResponse::failure(AuthResult::Invalid, "token inactive");
        }

        let scopes: HashSet<String> = data
            .get("scope")
            .and_then(Value::as_str)
            .map(|scope| scope.split_whitespace().map(String::from).collect())
            .unwrap_or_default();
        let roles = data
            .get("roles")
            .and_then(Value::as_array)
            .map(|roles| roles.iter().filter_map(|r| r.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let metadata = data.as_object().map(|obj| obj.clone().into_iter().collect()).unwrap_or_default();

        let user = AuthUser {
            user_id: data.get("sub").and_then(Value::as_str).unwrap_or("unknown").to_string(),
            email: data.get("email").and_then(Value::as_str).map(String::from),
            roles,
            permissions: scopes,
            provider: self.name().to_string(),
            metadata,
            authenticated_at: now,
        };

        self.cache.lock().insert(token_hash, CachedOAuth2User { user: user.clone(), cached_at: now });
        AuthResponse::success(user)
    }
}

/// Tries each configured [`AuthProvider`] in order, short-circuiting on
/// the first success.
pub struct AuthMiddleware {
    providers: Vec<Arc<dyn AuthProvider>>,
    require_auth: bool,
    excluded_paths: HashSet<String>,
    clock: SharedClock,
}

impl AuthMiddleware {
    pub fn new(providers: Vec<Arc<dyn AuthProvider>>, require_auth: bool, clock: SharedClock) -> Self {
        Self {
            providers,
            require_auth,
            excluded_paths: ["/health", "/ready", "/metrics"].into_iter().map(String::from).collect(),
            clock,
        }
    }

    pub fn with_excluded_paths(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.excluded_paths = paths.into_iter().collect();
        self
    }

    pub async fn authenticate(&self, source: &dyn CredentialSource) -> AuthResponse {
        if self.excluded_paths.contains(source.path()) {
            return AuthResponse::success(AuthUser::anonymous(self.clock.now()));
        }

        let mut errors = Vec::new();
        for provider in &self.providers {
            if let Some(credentials) = provider.extract_credentials(source) {
                let result = provider.authenticate(&credentials).await;
                if result.result == AuthResult::Success {
                    return result;
                }
                errors.push(format!("{}: {}", provider.name(), result.error.unwrap_or_default()));
            }
        }

        if errors.is_empty() {
            if !self.require_auth {
                return AuthResponse::success(AuthUser::anonymous(self.clock.now()));
            }
            tracing::warn!("authentication failed: no credentials provided");
            return AuthResponse::failure(AuthResult::Missing, "no authentication credentials provided");
        }

        let error = errors.join("; ");
        tracing::warn!(error = %error, "authentication failed");
        AuthResponse::failure(AuthResult::Failed, error)
    }
}

/// Thin guard helpers a caller applies after [`AuthMiddleware::authenticate`]
/// succeeds, usable from any handler regardless of which web framework
/// invoked it.
pub fn require_roles(user: &AuthUser, required: &[&str]) -> Result<()> {
    if required.iter().any(|role| user.has_role(role)) {
        Ok(())
    } else {
        Err(Error::other("insufficient role"))
    }
}

pub fn require_permissions(user: &AuthUser, required: &[&str]) -> Result<()> {
    if required.iter().all(|permission| user.has_permission(permission)) {
        Ok(())
    } else {
        Err(Error::other("insufficient permissions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    struct FakeRequest {
        headers: HashMap<String, String>,
        path: String,
    }

    impl CredentialSource for FakeRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers.get(name).map(|s| s.as_str())
        }
        fn path(&self) -> &str {
            &self.path
        }
    }

    fn request_with_bearer(token: &str) -> FakeRequest {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        FakeRequest { headers, path: "/chat".to_string() }
    }

    fn make_jwt(secret: &str, sub: &str, exp_offset_secs: i64) -> String {
        #[derive(Serialize)]
        struct Claims {
            sub: String,
            iat: i64,
            exp: i64,
        }
        let claims = Claims { sub: sub.to_string(), iat: 0, exp: exp_offset_secs };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_jwt_provider_accepts_valid_token() {
        let token = make_jwt("secret", "alice", 9_999_999_999);
        let provider = JwtProvider::new("secret", None, None, 0);
        let response = provider.authenticate(&token).await;
        assert_eq!(response.result, AuthResult::Success);
        assert_eq!(response.user.unwrap().user_id, "alice");
    }

    #[tokio::test]
    async fn test_jwt_provider_rejects_expired_token() {
        let token = make_jwt("secret", "alice", 1);
        let provider = JwtProvider::new("secret", None, None, 0);
        let response = provider.authenticate(&token).await;
        assert_eq!(response.result, AuthResult::Expired);
    }

    #[tokio::test]
    async fn test_jwt_provider_rejects_wrong_secret() {
        let token = make_jwt("secret", "alice", 9_999_999_999);
        let provider = JwtProvider::new("wrong-secret", None, None, 0);
        let response = provider.authenticate(&token).await;
        assert_eq!(response.result, AuthResult::Invalid);
    }

    #[tokio::test]
    async fn test_api_key_provider_hashes_before_lookup() {
        let provider = ApiKeyProvider::new("X-API-Key");
        provider.add_key("secret-key", ApiKeyUserInfo { user_id: "svc1".into(), ..Default::default() });
        let response = provider.authenticate("secret-key").await;
        assert_eq!(response.result, AuthResult::Success);
        assert_eq!(response.user.unwrap().roles, vec!["api_access".to_string()]);
    }

    #[tokio::test]
    async fn test_api_key_provider_rejects_unknown_key() {
        let provider = ApiKeyProvider::new("X-API-Key");
        let response = provider.authenticate("nope").await;
        assert_eq!(response.result, AuthResult::Invalid);
    }

    #[tokio::test]
    async fn test_api_key_revoke_removes_access() {
        let provider = ApiKeyProvider::new("X-API-Key");
        provider.add_key("k", ApiKeyUserInfo { user_id: "u".into(), ..Default::default() });
        provider.revoke_key("k");
        let response = provider.authenticate("k").await;
        assert_eq!(response.result, AuthResult::Invalid);
    }

    #[tokio::test]
    async fn test_middleware_bypasses_excluded_paths() {
        let clock: SharedClock = Arc::new(FixedClock::new(100.0));
        let middleware = AuthMiddleware::new(vec![], true, clock);
        let request = FakeRequest { headers: HashMap::new(), path: "/health".to_string() };
        let response = middleware.authenticate(&request).await;
        assert_eq!(response.result, AuthResult::Success);
        assert_eq!(response.user.unwrap().user_id, "anonymous");
    }

    #[tokio::test]
    async fn test_middleware_tries_next_provider_on_failure() {
        let clock: SharedClock = Arc::new(FixedClock::new(100.0));
        let api_key_provider = Arc::new(ApiKeyProvider::new("X-API-Key"));
        api_key_provider.add_key("good-key", ApiKeyUserInfo { user_id: "u1".into(), ..Default::default() });
        let middleware = AuthMiddleware::new(vec![api_key_provider], true, clock);

        let mut headers = HashMap::new();
        headers.insert("X-API-Key".to_string(), "good-key".to_string());
        let request = FakeRequest { headers, path: "/chat".to_string() };
        let response = middleware.authenticate(&request).await;
        assert_eq!(response.result, AuthResult::Success);
    }

    #[tokio::test]
    async fn test_middleware_missing_credentials_without_require_auth_is_anonymous() {
        let clock: SharedClock = Arc::new(FixedClock::new(100.0));
        let middleware = AuthMiddleware::new(vec![], false, clock);
        let request = FakeRequest { headers: HashMap::new(), path: "/chat".to_string() };
        let response = middleware.authenticate(&request).await;
        assert_eq!(response.result, AuthResult::Success);
        assert_eq!(response.user.unwrap().user_id, "anonymous");
    }

    #[tokio::test]
    async fn test_middleware_missing_credentials_with_require_auth_fails() {
        let clock: SharedClock = Arc::new(FixedClock::new(100.0));
        let middleware = AuthMiddleware::new(vec![], true, clock);
        let request = FakeRequest { headers: HashMap::new(), path: "/chat".to_string() };
        let response = middleware.authenticate(&request).await;
        assert_eq!(response.result, AuthResult::Missing);
    }

    #[test]
    fn test_require_roles_and_permissions() {
        let mut user = AuthUser::new("u1", "jwt", 0.0);
        user.roles.push("admin".to_string());
        user.permissions.insert("write:data".to_string());
        assert!(require_roles(&user, &["admin"]).is_ok());
        assert!(require_roles(&user, &["superadmin"]).is_err());
        assert!(require_permissions(&user, &["write:data"]).is_ok());
        assert!(require_permissions(&user, &["write:data", "delete:data"]).is_err());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let request = request_with_bearer("abc123");
        assert_eq!(bearer_token(&request), Some("abc123".to_string()));
    }
}
