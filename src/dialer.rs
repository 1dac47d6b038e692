use crate::address::TargetAddr;
use crate::error::DialError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Dialer resolves and connects to destination addresses under a
/// bounded timeout. Only direct dialing is supported.
#[derive(Debug, Clone)]
pub struct Dialer {
    connect_timeout: Duration,
}

/// Dialer implementation block
impl Dialer {
    /// new is a Dialer constructor
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// resolve turns a target address into a SocketAddr, performing a
    /// DNS lookup for domain names and taking the first result
    pub async fn resolve(&self, target: &TargetAddr) -> Result<SocketAddr, DialError> {
        if let Some(addr) = target.socket_addr() {
            return Ok(addr);
        }

        let host = target.to_string();
        let addr = tokio::net::lookup_host(&host)
            .await
            .map_err(|_| DialError::Resolution(host.clone()))?
            .next()
            .ok_or_else(|| DialError::Resolution(host.clone()))?;

        debug!(%host, %addr, "resolved destination");
        Ok(addr)
    }

    /// dial resolves the target and opens a TCP connection to it,
    /// bounded by the configured connect timeout
    pub async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, DialError> {
        let addr = self.resolve(target).await?;

        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(DialError::classify(e)),
            Err(_) => Err(DialError::Timeout(self.connect_timeout)),
        }
    }
}
