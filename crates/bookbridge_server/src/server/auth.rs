#![forbid(unsafe_code)]

use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bookbridge_domain::{ChatError, Role, UserId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_secs_now;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by marketplace access tokens (HS256 JWT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub user_id: UserId,
	pub username: String,
	pub role: Role,
	pub exp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iat: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nbf: Option<u64>,
}

impl AuthClaims {
	/// Fresh claims valid for `ttl_secs` from now.
	pub fn new(user_id: UserId, username: impl Into<String>, role: Role, ttl_secs: u64) -> Self {
		let now = unix_secs_now();
		Self {
			user_id,
			username: username.into(),
			role,
			exp: now.saturating_add(ttl_secs),
			iat: Some(now),
			nbf: Some(now),
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
	alg: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	typ: Option<String>,
}

/// Verifies a bearer credential and returns its claims.
///
/// A missing or blank credential is [`ChatError::Unauthenticated`]; anything
/// else that fails is [`ChatError::InvalidCredential`].
pub fn verify_bearer(token: Option<&str>, secret: &str) -> Result<AuthClaims, ChatError> {
	let token = match token.map(str::trim) {
		Some(t) if !t.is_empty() => t,
		_ => return Err(ChatError::Unauthenticated),
	};
	verify_jwt(token, secret, unix_secs_now())
}

/// Extracts the credential from an `Authorization: Bearer <token>` header value.
pub fn bearer_from_header(value: &str) -> Result<&str, ChatError> {
	let value = value.trim();
	match value.split_once(' ') {
		Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => Ok(token.trim()),
		_ => Err(ChatError::InvalidCredential(
			"authorization header must use the Bearer scheme".to_string(),
		)),
	}
}

pub(crate) fn verify_jwt(token: &str, secret: &str, now_secs: u64) -> Result<AuthClaims, ChatError> {
	let invalid = |reason: &str| ChatError::InvalidCredential(reason.to_string());

	let mut parts = token.split('.');
	let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(invalid("malformed token"));
	};

	let header = URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| invalid("malformed token header"))?;
	let header: JwtHeader = serde_json::from_slice(&header).map_err(|_| invalid("malformed token header"))?;
	if header.alg != "HS256" {
		return Err(invalid("unsupported signing algorithm"));
	}

	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| invalid("malformed token signature"))?;
	let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| invalid("unusable signing key"))?;
	mac.update(header_b64.as_bytes());
	mac.update(b".");
	mac.update(payload_b64.as_bytes());
	mac.verify_slice(&provided_sig).map_err(|_| invalid("invalid token signature"))?;

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| invalid("malformed token payload"))?;
	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| invalid("malformed token claims"))?;

	if claims.exp <= now_secs {
		return Err(invalid("token expired"));
	}
	if let Some(nbf) = claims.nbf
		&& nbf > now_secs
	{
		return Err(invalid("token not yet valid"));
	}
	if claims.username.trim().is_empty() {
		return Err(invalid("token carries no username"));
	}

	Ok(claims)
}

/// Signs claims into a compact HS256 token.
pub fn issue_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let header = JwtHeader {
		alg: "HS256".to_string(),
		typ: Some("JWT".to_string()),
	};
	let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).context("encode token header")?);
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).context("encode token claims")?);

	let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("hmac key")?;
	mac.update(header_b64.as_bytes());
	mac.update(b".");
	mac.update(payload_b64.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

	Ok(format!("{header_b64}.{payload_b64}.{sig_b64}"))
}
