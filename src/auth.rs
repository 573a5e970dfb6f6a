//! Caller identity carried as HS256-signed JWT claims.

use crate::{
    error::{EscrowError, Result},
    model::Role,
    UserId,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Chat user id of the caller.
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated caller. Engine operations check permissions against this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    pub fn is_banned(&self) -> bool {
        self.role == Role::Banned
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<String>, ttl_hours: i64) -> Result<Self> {
        let secret = secret.into();
        if secret.len() < 16 {
            return Err(EscrowError::Config(
                "JWT secret must be at least 16 characters".to_string(),
            ));
        }

        Ok(Self {
            secret,
            ttl: Duration::hours(ttl_hours),
        })
    }

    pub fn issue(&self, actor: Actor) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: actor.user_id.to_string(),
            role: actor.role.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }

    pub fn verify(&self, token: &str) -> Result<Actor> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )?;

        let user_id = data
            .claims
            .sub
            .parse::<UserId>()
            .map_err(|_| EscrowError::Auth(format!("Invalid subject: {}", data.claims.sub)))?;
        let role = Role::from_str(&data.claims.role)
            .map_err(|_| EscrowError::Auth(format!("Invalid role: {}", data.claims.role)))?;

        Ok(Actor { user_id, role })
    }
}

/// Strip the `Bearer ` prefix from an Authorization header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-with-enough-length";

    #[test]
    fn test_issue_and_verify() {
        let issuer = TokenIssuer::new(SECRET, 1).unwrap();
        let token = issuer.issue(Actor::new(42, Role::Guarantor)).unwrap();

        let actor = issuer.verify(&token).unwrap();
        assert_eq!(actor.user_id, 42);
        assert_eq!(actor.role, Role::Guarantor);
        assert!(actor.is_staff());
        assert!(!actor.is_admin());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = TokenIssuer::new(SECRET, 1).unwrap();
        let other = TokenIssuer::new("another-secret-of-enough-length", 1).unwrap();
        let token = issuer.issue(Actor::new(1, Role::User)).unwrap();

        assert!(matches!(other.verify(&token), Err(EscrowError::Auth(_))));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(TokenIssuer::new("short", 1).is_err());
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
