use crate::error::{Error, Result};
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use std::collections::HashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, warn};

/// CredentialStore holds the username/password pairs accepted by the
/// server. Read-only once built; lookups are exact and case-sensitive.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

/// CredentialStore implementation block
impl CredentialStore {
    /// new is a CredentialStore constructor
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// single builds a store holding one credential pair
    pub fn single(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut users = HashMap::new();
        users.insert(username.into(), password.into());
        Self { users }
    }

    /// verify checks a username/password pair against the store
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.users.get(username).is_some_and(|p| p == password)
    }

    /// is_empty reports whether the store holds no credentials
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Authenticator is the set of supported authentication methods.
/// New methods are added as new variants.
#[derive(Debug, Clone)]
pub enum Authenticator {
    NoAuth,
    UserPass(CredentialStore),
}

/// Authenticator implementation block
impl Authenticator {
    /// method returns the wire identifier this authenticator negotiates
    pub fn method(&self) -> AuthMethod {
        match self {
            Authenticator::NoAuth => AuthMethod::NoAuth,
            Authenticator::UserPass(_) => AuthMethod::UserPass,
        }
    }

    /// authenticate runs the method's sub-negotiation on the stream.
    /// NoAuth exchanges no bytes; UserPass runs the RFC 1929 exchange
    /// and fails the session on a credential mismatch.
    pub async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        match self {
            Authenticator::NoAuth => Ok(()),
            Authenticator::UserPass(store) => authenticate_userpass(stream, store).await,
        }
    }
}

/// negotiate handles method negotiation between the SOCKS server and
/// client: it reads the client hello and selects the first
/// authenticator, in the server's configured preference order, whose
/// method the client offered
pub async fn negotiate<'a>(
    stream: &mut TcpStream,
    authenticators: &'a [Authenticator],
) -> Result<&'a Authenticator> {
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    // Instantiate handshake buffer & read
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    // Parse version and method count from handshake
    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(Error::Protocol(format!("not SOCKS5: version {version}")));
    }

    // A hello offering no methods is malformed
    if n_methods == 0 {
        return Err(Error::Protocol("no authentication methods offered".into()));
    }

    // Read the offered methods
    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    // Retrieve desired method
    let Some(selected) = select_authenticator(authenticators, &methods) else {
        // ServerChoice reply with 0xFF: no acceptable method.
        // The connection closes once the reply is flushed.
        stream
            .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAcceptable as u8])
            .await?;
        stream.flush().await?;
        return Err(Error::NoAcceptableMethod);
    };

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+

    // Write response to client with selected method
    stream
        .write_all(&[Version::SOCKS5 as u8, selected.method() as u8])
        .await?;

    debug!(method = ?selected.method(), "negotiated authentication method");
    Ok(selected)
}

/// select_authenticator walks the server's preference order and returns
/// the first authenticator whose method appears in the client's offer
fn select_authenticator<'a>(
    authenticators: &'a [Authenticator],
    client_methods: &[u8],
) -> Option<&'a Authenticator> {
    authenticators
        .iter()
        .find(|a| client_methods.contains(&(a.method() as u8)))
}

/// authenticate_userpass handles username/password authentication
/// according to RFC 1929
async fn authenticate_userpass(stream: &mut TcpStream, store: &CredentialStore) -> Result<()> {
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    // Get sub-negotiation version -> 0x01 expected
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;

    // Check version number
    if ver[0] != USERPASS_VERSION {
        return Err(Error::Protocol(format!(
            "invalid username/password sub-negotiation version: {}",
            ver[0]
        )));
    }

    // Read username length, then username
    let mut username_len = [0u8; 1];
    stream.read_exact(&mut username_len).await?;
    let mut username = vec![0u8; username_len[0] as usize];
    stream.read_exact(&mut username).await?;

    // Read password length, then password
    let mut password_len = [0u8; 1];
    stream.read_exact(&mut password_len).await?;
    let mut password = vec![0u8; password_len[0] as usize];
    stream.read_exact(&mut password).await?;

    // Convert username/password to str for comparison
    let user_string = String::from_utf8(username)
        .map_err(|e| Error::Protocol(format!("invalid username: {e}")))?;
    let pass_string = String::from_utf8(password)
        .map_err(|e| Error::Protocol(format!("invalid password: {e}")))?;

    // Validate credentials
    let status = if store.verify(&user_string, &pass_string) {
        AuthStatus::Success
    } else {
        AuthStatus::Failure
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+

    // Write the status byte; on failure the session closes right after,
    // no retry within the same connection
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;

    match status {
        AuthStatus::Success => {
            debug!(user = %user_string, "authentication succeeded");
            Ok(())
        }
        AuthStatus::Failure => {
            stream.flush().await?;
            warn!(user = %user_string, "authentication failed");
            Err(Error::Auth)
        }
    }
}
