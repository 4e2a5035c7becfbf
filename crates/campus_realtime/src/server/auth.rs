#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use campus_domain::{SecretString, UserId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::util::time::unix_secs_now;

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing bearer credential")]
	MissingCredential,

	#[error("malformed authorization header")]
	MalformedCredential,

	#[error("invalid token: {0}")]
	Malformed(String),

	#[error("invalid token signature")]
	BadSignature,

	#[error("token expired")]
	Expired,

	#[error("token revoked")]
	Revoked,

	#[error("auth backend error: {0}")]
	Backend(String),
}

/// Claims carried by a `v1` access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: i64,
	#[serde(default)]
	pub is_teacher: bool,
	#[serde(default)]
	pub email: String,
	#[serde(default)]
	pub full_name: String,
	pub exp: u64,

	/// Token id used for revocation; tokens without one are revoked by their full text.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub jti: Option<String>,
}

/// Identity resolved from a valid token. Fixed for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
	pub user_id: UserId,
	pub is_teacher: bool,
	pub email: String,
	pub full_name: String,
}

impl From<AuthClaims> for AuthenticatedUser {
	fn from(claims: AuthClaims) -> Self {
		Self {
			user_id: UserId(claims.sub),
			is_teacher: claims.is_teacher,
			email: claims.email,
			full_name: claims.full_name,
		}
	}
}

/// Resolves a bearer token to a user.
#[async_trait]
pub trait Authenticator: Send + Sync {
	async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Revoked-token lookup (logout, password change).
#[async_trait]
pub trait RevocationStore: Send + Sync {
	async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError>;
}

/// Process-local revocation list.
#[derive(Debug, Default)]
pub struct InMemoryRevocationList {
	/// token id -> token expiry (unix seconds)
	revoked: RwLock<HashMap<String, u64>>,
}

impl InMemoryRevocationList {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn revoke(&self, token_id: impl Into<String>, expires_at: u64) {
		self.revoked.write().await.insert(token_id.into(), expires_at);
	}

	/// Forget revocations for tokens that have expired anyway. Returns how many were dropped.
	pub async fn prune_expired(&self, now: u64) -> usize {
		let mut revoked = self.revoked.write().await;
		let before = revoked.len();
		revoked.retain(|_, exp| *exp > now);
		before - revoked.len()
	}

	pub async fn len(&self) -> usize {
		self.revoked.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.revoked.read().await.is_empty()
	}
}

#[async_trait]
impl RevocationStore for InMemoryRevocationList {
	async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError> {
		Ok(self.revoked.read().await.contains_key(token_id))
	}
}

/// Stateless HMAC-SHA256 token verification followed by a revocation check.
pub struct HmacAuthenticator {
	secret: SecretString,
	revocations: Arc<dyn RevocationStore>,
}

impl HmacAuthenticator {
	pub fn new(secret: SecretString, revocations: Arc<dyn RevocationStore>) -> Self {
		Self { secret, revocations }
	}
}

#[async_trait]
impl Authenticator for HmacAuthenticator {
	async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
		let claims = verify_hmac_token(token, self.secret.expose())?;

		let token_id = claims.jti.as_deref().unwrap_or(token);
		if self.revocations.is_revoked(token_id).await? {
			return Err(AuthError::Revoked);
		}

		Ok(claims.into())
	}
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, AuthError> {
	let header = header.map(str::trim).filter(|h| !h.is_empty());
	let Some(header) = header else {
		return Err(AuthError::MissingCredential);
	};

	let (scheme, token) = header.split_once(' ').ok_or(AuthError::MalformedCredential)?;
	if !scheme.eq_ignore_ascii_case("bearer") {
		return Err(AuthError::MalformedCredential);
	}

	let token = token.trim();
	if token.is_empty() || token.contains(char::is_whitespace) {
		return Err(AuthError::MalformedCredential);
	}

	Ok(token)
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != TOKEN_VERSION {
		return Err(AuthError::Malformed("invalid token format".to_string()));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|e| AuthError::Malformed(format!("decode token payload: {e}")))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|e| AuthError::Malformed(format!("decode token signature: {e}")))?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::BadSignature);
	}

	let claims: AuthClaims =
		serde_json::from_slice(&payload).map_err(|e| AuthError::Malformed(format!("parse token claims: {e}")))?;
	if claims.exp <= unix_secs_now() {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Sign `claims` into a `v1` token.
pub fn issue_token(claims: &AuthClaims, secret: &str) -> Result<String, AuthError> {
	let payload = serde_json::to_vec(claims).map_err(|e| AuthError::Backend(format!("encode claims: {e}")))?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| AuthError::Backend(format!("hmac key: {e}")))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
