//! Identity provider collaborator.
//!
//! The core only needs one thing from authentication: turn a bearer token into
//! a [`LogicalUser`]. [`JwtAuth`] does that with HS256 tokens whose `sub` is the
//! durable user id and whose `name` is the display name.
//!
//! ## Example Usage
//! ```
//! use huddle::auth::{IdentityProvider, JwtAuth};
//! use huddle::identity::LogicalUser;
//!
//! let auth = JwtAuth::new("super-secret-key");
//! let token = auth.sign_access(&LogicalUser::new("user42", "Ada"), 3600).unwrap();
//! let claims = auth.verify_access(&token).unwrap();
//! assert_eq!(claims.sub, "user42");
//! assert_eq!(claims.name, "Ada");
//! ```
use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::identity::LogicalUser;

/// Validates bearer tokens presented on connect.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
  async fn validate(&self, token: &str) -> Result<LogicalUser>;
}

/// Payload of an access token.
///
/// ## Fields
/// - `sub`: Subject, the durable user id.
/// - `name`: Display name shown to other room members.
/// - `exp`: UNIX timestamp when the token expires.
/// - `iss`: Optional issuer.
/// - `aud`: Optional audience.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
  pub sub: String,
  pub name: String,
  pub exp: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub iss: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub aud: Option<String>,
}

/// Configuration options for JWT validation.
///
/// ## Fields
/// - `leeway`: Allowed clock skew in seconds.
/// - `issuer`: Optional expected issuer string.
/// - `audience`: Optional expected audience string.
#[derive(Clone, Default)]
pub struct JwtAuthOptions {
  pub leeway: u64,
  pub issuer: Option<String>,
  pub audience: Option<String>,
}

/// JWT identity provider.
#[derive(Clone)]
pub struct JwtAuth {
  secret: String,
  options: JwtAuthOptions,
}

impl JwtAuth {
  pub fn new(secret: &str) -> Self {
    Self::with_options(secret, JwtAuthOptions::default())
  }

  pub fn with_options(secret: &str, options: JwtAuthOptions) -> Self {
    Self {
      secret: secret.into(),
      options,
    }
  }

  /// Signs an access token for `user` valid for `ttl_secs` seconds.
  pub fn sign_access(&self, user: &LogicalUser, ttl_secs: i64) -> Result<String> {
    let exp = chrono::Utc::now().timestamp().saturating_add(ttl_secs).max(0) as usize;

    let claims = AccessClaims {
      sub: user.user_id.to_string(),
      name: user.display_name.clone(),
      exp,
      iss: self.options.issuer.clone(),
      aud: self.options.audience.clone(),
    };
    encode(
      &Header::default(),
      &claims,
      &EncodingKey::from_secret(self.secret.as_ref()),
    )
    .context("Failed to encode access token.")
  }

  /// Verifies an access token and returns its claims if valid.
  pub fn verify_access(&self, token: &str) -> Result<AccessClaims> {
    let mut validation = Validation::default();
    validation.leeway = self.options.leeway;
    if let Some(ref iss) = self.options.issuer {
      validation.set_issuer(&[iss]);
    }
    if let Some(ref aud) = self.options.audience {
      validation.set_audience(&[aud]);
    }
    let data = decode::<AccessClaims>(
      token,
      &DecodingKey::from_secret(self.secret.as_ref()),
      &validation,
    )
    .context("Failed to decode access token")?;
    Ok(data.claims)
  }
}

#[async_trait]
impl IdentityProvider for JwtAuth {
  async fn validate(&self, token: &str) -> Result<LogicalUser> {
    let claims = self.verify_access(token)?;
    let name = if claims.name.trim().is_empty() {
      claims.sub.clone()
    } else {
      claims.name
    };
    Ok(LogicalUser::new(claims.sub, name))
  }
}

/// ######################################## TESTS ########################################

#[cfg(test)]
mod tests {
  use super::*;

  fn auth() -> JwtAuth {
    JwtAuth::new("test-secret")
  }

  #[tokio::test]
  async fn token_validates_to_logical_user() {
    let auth = auth();
    let token = auth.sign_access(&LogicalUser::new("user1", "Ada"), 60).unwrap();
    let user = auth.validate(&token).await.unwrap();
    assert_eq!(user, LogicalUser::new("user1", "Ada"));
  }

  #[tokio::test]
  async fn blank_name_falls_back_to_user_id() {
    let auth = auth();
    let token = auth.sign_access(&LogicalUser::new("user2", " "), 60).unwrap();
    assert_eq!(auth.validate(&token).await.unwrap().display_name, "user2");
  }

  #[test]
  fn expired_token_fails() {
    let auth = auth();
    let token = auth.sign_access(&LogicalUser::new("user3", "Bo"), -120).unwrap();
    assert!(auth.verify_access(&token).is_err());
  }

  #[test]
  fn wrong_secret_fails() {
    let token = auth().sign_access(&LogicalUser::new("user4", "Cy"), 60).unwrap();
    assert!(JwtAuth::new("other-secret").verify_access(&token).is_err());
  }

  #[test]
  fn issuer_and_audience_are_enforced() {
    let options = JwtAuthOptions {
      leeway: 0,
      issuer: Some("huddle".into()),
      audience: Some("web".into()),
    };
    let strict = JwtAuth::with_options("test-secret", options.clone());
    let token = strict.sign_access(&LogicalUser::new("user5", "Di"), 60).unwrap();
    assert!(strict.verify_access(&token).is_ok());

    let other = JwtAuth::with_options(
      "test-secret",
      JwtAuthOptions {
        audience: Some("mobile".into()),
        ..options
      },
    );
    assert!(other.verify_access(&token).is_err());
  }
}
