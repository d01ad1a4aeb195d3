//! SASL style authentication performed during the connection handshake.
//!
//! When STARTUP is answered with AUTHENTICATE, the connection asks the
//! configured [`AuthenticatorProvider`] for an initial token and a session,
//! then keeps answering AUTH_CHALLENGE frames through the session until the
//! server replies with AUTH_SUCCESS or an error.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

pub use cassandra_cql::frame::response::authenticate::Authenticator;

/// Type to represent an authentication error message.
pub type AuthError = String;

/// One authentication exchange on one connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Produces the answer to a server challenge. The token may be empty or absent.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called with the AUTH_SUCCESS token once the server accepted the credentials.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Creates an [`AuthenticatorSession`] for every connection that needs one.
///
/// Set through `ClientBuilder::authenticator_provider`, or implicitly by
/// `ClientBuilder::user`, which installs a [`PlainTextAuthenticator`].
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial AUTH_RESPONSE token and the session that handles
    /// the following challenges.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username and password authentication, as used by `PasswordAuthenticator`.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    // \0username\0password
    fn initial_token(&self) -> Vec<u8> {
        let mut response = BytesMut::new();
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());
        response.to_vec()
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .field("password", &"<hidden>")
            .finish()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_token()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_token() {
        let auth = PlainTextAuthenticator::new("cassandra", "secret");
        let (token, mut session) = auth
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();
        assert_eq!(token.unwrap(), b"\0cassandra\0secret".to_vec());
        assert!(session.evaluate_challenge(None).await.is_err());
        assert!(session.success(None).await.is_ok());
    }

    #[test]
    fn debug_hides_password() {
        let rendered = format!("{:?}", PlainTextAuthenticator::new("user", "hunter2"));
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }
}
