use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};

use parley_types::api::Claims;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("token has an empty subject")]
    EmptySubject,
}

/// HS256 bearer tokens shared by the websocket handshake and the HTTP routes.
#[derive(Clone)]
pub struct Identity {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl Identity {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Check signature and expiry. The returned `sub` is an account id.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::EmptySubject);
        }
        Ok(data.claims)
    }

    pub fn issue(&self, account_id: &str, ttl: chrono::Duration) -> Result<String, AuthError> {
        let now = chrono::Utc::now();
        let claims = Claims {
            sub: account_id.to_string(),
            exp: (now + ttl).timestamp() as usize,
            iat: Some(now.timestamp() as usize),
            jti: Some(uuid::Uuid::new_v4().to_string()),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates() {
        let identity = Identity::new("test-secret");
        let token = identity.issue("acc-1", chrono::Duration::minutes(5)).unwrap();
        let claims = identity.validate(&token).unwrap();
        assert_eq!(claims.sub, "acc-1");
        assert!(claims.jti.is_some());
    }

    #[test]
    fn rejects_wrong_secret_and_expired() {
        let identity = Identity::new("test-secret");
        let other = Identity::new("other-secret");
        let token = other.issue("acc-1", chrono::Duration::minutes(5)).unwrap();
        assert!(identity.validate(&token).is_err());

        let expired = identity.issue("acc-1", chrono::Duration::hours(-2)).unwrap();
        assert!(matches!(identity.validate(&expired), Err(AuthError::Invalid(_))));
        assert!(identity.validate("garbage").is_err());
    }
}
