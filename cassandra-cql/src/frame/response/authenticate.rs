use crate::frame::frame_errors::ParseError;
use crate::frame::types;

// Authenticators known to be used by Cassandra
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Authenticator {
    AllowAllAuthenticator,
    PasswordAuthenticator,
    Other(String),
}

impl From<&str> for Authenticator {
    fn from(name: &str) -> Self {
        match name {
            "org.apache.cassandra.auth.AllowAllAuthenticator" => {
                Authenticator::AllowAllAuthenticator
            }
            "org.apache.cassandra.auth.PasswordAuthenticator" => {
                Authenticator::PasswordAuthenticator
            }
            other => Authenticator::Other(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticator_name = types::read_string(buf)?.to_string();

        Ok(Authenticate { authenticator_name })
    }

    pub fn authenticator(&self) -> Authenticator {
        Authenticator::from(self.authenticator_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSuccess {
    pub success_message: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let success_message = types::read_bytes_opt(buf)?.map(ToOwned::to_owned);

        Ok(AuthSuccess { success_message })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub authenticate_message: Option<Vec<u8>>,
}

impl AuthChallenge {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticate_message = types::read_bytes_opt(buf)?.map(|b| b.to_owned());

        Ok(AuthChallenge {
            authenticate_message,
        })
    }
}
