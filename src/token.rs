//! Signed session tokens.
//!
//! [`HmacTokenIssuer`] produces compact HS256 JWTs carrying the identity,
//! the full role set and the session id. The gateway verifies the same
//! tokens to authenticate handoff delegation and confirmation.
//!
//! ## Security
//! - Signatures are checked with `Mac::verify_slice` (constant time)
//! - Only `HS256` headers are accepted; `alg: none` is rejected
//! - `iss`, `aud` and `exp` are enforced on every verify

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Failures minting or verifying a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token signing key must not be empty")]
    EmptySecret,
    #[error("malformed token")]
    Malformed,
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token claim mismatch: {0}")]
    ClaimMismatch(&'static str),
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Mints the opaque token returned alongside a new session.
pub trait TokenIssuer: Send + Sync {
    fn mint(&self, identity: &str, roles: &[String], session_id: &str)
        -> Result<String, TokenError>;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Claims {
    /// Identity the session authenticates as.
    pub sub: String,
    pub roles: Vec<String>,
    /// Session id the token was minted for.
    pub sid: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

pub struct HmacTokenIssuer {
    key: Vec<u8>,
    issuer: String,
    audience: String,
    ttl: chrono::Duration,
}

impl std::fmt::Debug for HmacTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacTokenIssuer")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl HmacTokenIssuer {
    pub fn new(
        secret: &str,
        issuer: &str,
        audience: &str,
        ttl_minutes: i64,
    ) -> Result<Self, TokenError> {
        if secret.is_empty() {
            return Err(TokenError::EmptySecret);
        }
        Ok(Self {
            key: secret.as_bytes().to_vec(),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            ttl: chrono::Duration::minutes(ttl_minutes.max(1)),
        })
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| TokenError::Encoding(e.to_string()))
    }

    /// Check signature, algorithm and registered claims.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != "HS256" {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = decode_segment(claims_b64)?;
        if claims.iss != self.issuer {
            return Err(TokenError::ClaimMismatch("iss"));
        }
        if claims.aud != self.audience {
            return Err(TokenError::ClaimMismatch("aud"));
        }
        if Utc::now().timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let header = Header {
            alg: "HS256".into(),
            typ: "JWT".into(),
        };
        let header_b64 = encode_segment(&header)?;
        let claims_b64 = encode_segment(claims)?;

        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{header_b64}.{claims_b64}.{sig_b64}"))
    }
}

impl TokenIssuer for HmacTokenIssuer {
    fn mint(
        &self,
        identity: &str,
        roles: &[String],
        session_id: &str,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = Claims {
            sub: identity.to_string(),
            roles: roles.to_vec(),
            sid: session_id.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: uuid::Uuid::new_v4().simple().to_string(),
        };
        self.sign(&claims)
    }
}

fn encode_segment<T: serde::Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|e| TokenError::Encoding(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
}
