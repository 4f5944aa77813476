use anyhow::{anyhow, Result};
use jsonwebtoken::{decode, encode, get_current_timestamp, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ADMIN_ROLE: &str = "ADMIN";
/// Role of every playback token, whoever asked for it.
pub const PLAYBACK_ROLE: &str = "VIEWER";

/// Claims of every bearer token the API accepts. Account tokens come from
/// the identity service; playback tokens are minted here and additionally
/// carry the device they were issued to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: Uuid,
    pub role: String,
    pub exp: usize,
    pub iat: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl TokenClaims {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

/// HMAC signing keys derived once from the configured secret.
#[derive(Clone)]
pub struct JwtCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, sub: Uuid, role: &str, device_id: Option<&str>, ttl_secs: u64) -> Result<(String, TokenClaims)> {
        let now = get_current_timestamp();
        let claims = TokenClaims {
            sub,
            role: role.to_string(),
            exp: (now + ttl_secs) as usize,
            iat: now as usize,
            device_id: device_id.map(str::to_string),
        };

        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| anyhow!("Failed to sign token: {}", e))?;
        Ok((token, claims))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        decode::<TokenClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| anyhow!("Invalid token: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_token_carries_device() {
        let codec = JwtCodec::new("test-secret");
        let account = Uuid::new_v4();
        let (token, _) = codec.issue(account, "USER", Some("tv-livingroom"), 60).unwrap();

        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.sub, account);
        assert_eq!(claims.device_id.as_deref(), Some("tv-livingroom"));
        assert!(!claims.is_admin());
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let (token, _) = JwtCodec::new("a").issue(Uuid::new_v4(), "ADMIN", None, 60).unwrap();
        assert!(JwtCodec::new("b").verify(&token).is_err());
    }
}
