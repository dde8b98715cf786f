//! Password login and bearer tokens

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{TrafficError, TrafficResult};

const SUBJECT: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// HS256 keys derived from the shared dashboard password
pub struct JwtKeys {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    password: String,
    ttl: TimeDelta,
}

impl JwtKeys {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.password.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.password.as_bytes()),
            password: config.password.clone(),
            ttl: TimeDelta::hours(config.token_ttl_hours),
        }
    }

    pub fn check_password(&self, candidate: &str) -> bool {
        !candidate.is_empty() && candidate == self.password
    }

    pub fn issue(&self, now: DateTime<Utc>) -> TrafficResult<String> {
        let claims = Claims {
            sub: SUBJECT.to_string(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| TrafficError::Internal(format!("token generation failed: {}", e)))
    }

    pub fn verify(&self, token: &str) -> TrafficResult<Claims> {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| TrafficError::Unauthorized("invalid or expired token".to_string()))
    }
}

/// Token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ").or_else(|| header.strip_prefix("bearer "))?.trim();
    (!token.is_empty()).then_some(token)
}
