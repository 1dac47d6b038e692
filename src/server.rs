use crate::auth::{self, Authenticator};
use crate::commands::{self, Established};
use crate::config::Config;
use crate::dialer::Dialer;
use crate::relay;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

/// Socks5Server represents a SOCKS5 server and houses its immutable
/// startup configuration
pub struct Socks5Server {
    config: Arc<Config>,
    authenticators: Arc<Vec<Authenticator>>,
    dialer: Dialer,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(config: Config) -> Self {
        let authenticators = Arc::new(config.authenticators());
        let dialer = Dialer::new(config.connect_timeout());
        Self {
            config: Arc::new(config),
            authenticators,
            dialer,
            listener: None,
        }
    }

    /// bind to the listen address, panics when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            panic!("bind can only be called once");
        }

        // A listen socket that cannot bind is a fatal startup error
        let listener = TcpListener::bind(self.config.listen).await?;
        let addr = listener.local_addr()?;

        info!("SOCKS5 proxy listening on {addr}");

        self.listener = Some(listener);
        Ok(addr)
    }

    /// local_addr returns the bound listen address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// run handles server spinup and listens for incoming connections.
    /// The accept loop only accepts and dispatches; all protocol work
    /// happens in per-session tasks.
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("listener missing after bind"))?;

        loop {
            // Accept incoming connection
            let (inbound, peer_addr) = listener.accept().await?;

            // Clone shared read-only state for this session
            let authenticators = Arc::clone(&self.authenticators);
            let config = Arc::clone(&self.config);
            let dialer = self.dialer.clone();

            // Spawn one independent task per session; a session's
            // failure never affects other sessions or the listener
            tokio::spawn(async move {
                info!(%peer_addr, "client connected");

                if let Err(e) = handle_session(inbound, authenticators, dialer, config).await {
                    error!(%peer_addr, error = %e, "session ended with error");
                }
            });
        }
    }
}

/// handle_session drives the full per-connection protocol flow:
/// negotiation, authentication, command dispatch, relay. Any step
/// failure closes the session; both sockets are released on every
/// exit path since the streams are owned here.
async fn handle_session(
    mut stream: TcpStream,
    authenticators: Arc<Vec<Authenticator>>,
    dialer: Dialer,
    config: Arc<Config>,
) -> crate::Result<()> {
    // Negotiate the authentication method with the client
    let authenticator = auth::negotiate(&mut stream, &authenticators).await?;

    // Run the method's sub-negotiation
    authenticator.authenticate(&mut stream).await?;

    // Handle the command request from the client
    match commands::handle_request(&mut stream, &dialer, &config).await? {
        Established::Tcp(outbound) => {
            // Relay until both directions terminate
            relay::run(stream, outbound).await?;
        }
        Established::Udp(association) => {
            // Relay datagrams until the control connection closes
            association.run(&mut stream).await?;
        }
    }

    Ok(())
}
