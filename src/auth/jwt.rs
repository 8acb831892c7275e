//! JWT encoding and validation.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::auth::{Claims, Role};

pub struct JwtHandler {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtHandler {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token for a caller; used by the ops tooling and tests.
    pub fn generate_token(&self, user_id: Uuid, yacht_id: Uuid, role: Role) -> Result<String> {
        let claims = Claims {
            sub: user_id,
            yacht_id,
            role,
            exp: (Utc::now() + Duration::hours(24)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key).context("failed to sign token")
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .context("invalid or expired token")?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let handler = JwtHandler::new("test-secret");
        let user = Uuid::new_v4();
        let yacht = Uuid::new_v4();
        let token = handler.generate_token(user, yacht, Role::Hod).unwrap();

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.yacht_id, yacht);
        assert!(claims.role.is_privileged());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtHandler::new("secret-a");
        let validator = JwtHandler::new("secret-b");
        let token = issuer
            .generate_token(Uuid::new_v4(), Uuid::new_v4(), Role::Crew)
            .unwrap();
        assert!(validator.validate_token(&token).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let handler = JwtHandler::new("test-secret");
        assert!(handler.validate_token("not.a.token").is_err());
    }
}
