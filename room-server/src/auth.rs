//! The authentication seam of the hub.
//!
//! Identity storage and password handling live outside this service; the
//! hub only needs a way to turn an opaque handshake token into a user. The
//! default implementation accepts pre-issued API keys of the form
//! `<key>:<user_id>:<user_name>` and enforces the configured minimum key
//! length.

use async_trait::async_trait;

/// An authenticated user as the hub sees it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the identity behind `token`, or `None` to reject the
    /// connection.
    async fn authenticate(&self, token: &str) -> Option<Identity>;
}

pub struct ApiKeyAuthenticator {
    minimum_key_length: usize,
}

impl ApiKeyAuthenticator {
    pub fn new(minimum_key_length: usize) -> Self {
        ApiKeyAuthenticator { minimum_key_length }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<Identity> {
        let mut parts = token.splitn(3, ':');
        let key = parts.next()?;
        let user_id = parts.next()?;
        let user_name = parts.next()?;

        if key.len() < self.minimum_key_length {
            tracing::warn!("rejected connection with an undersized api key");
            return None;
        }
        if user_id.is_empty() || !user_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        if user_name.is_empty() || user_name.len() > 64 {
            return None;
        }
        Some(Identity {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_well_formed_tokens() {
        let auth = ApiKeyAuthenticator::new(16);
        let identity = auth
            .authenticate("0123456789abcdef:user42:Ada Lovelace")
            .await
            .unwrap();
        assert_eq!(identity.user_id, "user42");
        assert_eq!(identity.user_name, "Ada Lovelace");
    }

    #[tokio::test]
    async fn rejects_short_keys_and_bad_ids() {
        let auth = ApiKeyAuthenticator::new(16);
        assert!(auth.authenticate("short:user42:Ada").await.is_none());
        assert!(
            auth.authenticate("0123456789abcdef:user 42:Ada")
                .await
                .is_none()
        );
        assert!(auth.authenticate("0123456789abcdef:user42").await.is_none());
        assert!(auth.authenticate("").await.is_none());
    }
}
