use crate::address::{TargetAddr, encode_socket_addr};
use crate::error::{Error, Result};
use crate::protocol::MAX_DGRAM;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::{
    net::{TcpStream, UdpSocket},
    select,
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// AssociationKey identifies one client-target datagram flow
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct AssociationKey {
    client_addr: SocketAddr,
    target_addr: SocketAddr,
}

/// Flow is one client-target pair: its dedicated outbound socket, the
/// task watching that socket for responses, and its activity stamp
struct Flow {
    socket: Arc<UdpSocket>,
    monitor: JoinHandle<()>,
    last_activity: Instant,
}

/// RelayState tracks the live flows of an association
struct RelayState {
    /// Maps (client_addr, target_addr) -> flow
    flows: HashMap<AssociationKey, Flow>,
}

/// RelayState implementation block
impl RelayState {
    /// new is a RelayState constructor
    fn new() -> Self {
        Self {
            flows: HashMap::new(),
        }
    }
}

/// UdpAssociation owns the relay socket of one UDP ASSOCIATE session.
/// It forwards headered datagrams from the negotiated client to
/// arbitrary targets and re-wraps responses on the way back. The
/// association and every outbound socket die the moment the
/// controlling TCP connection closes.
pub struct UdpAssociation {
    socket: UdpSocket,
    server_addr: SocketAddr,
    peer_addr: SocketAddr,
    idle_timeout: Duration,
}

/// UdpAssociation implementation block
impl UdpAssociation {
    /// new is a UdpAssociation constructor
    pub fn new(
        socket: UdpSocket,
        server_addr: SocketAddr,
        peer_addr: SocketAddr,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            server_addr,
            peer_addr,
            idle_timeout,
        }
    }

    /// run drives the association until the controlling TCP connection
    /// closes or the relay socket fails; every flow's monitor task and
    /// outbound socket is released before returning
    pub async fn run(self, stream: &mut TcpStream) -> Result<()> {
        // Extract values before self move
        let peer_addr = self.peer_addr;

        // Wrap the relay socket in Arc to share across tasks
        let server_socket = Arc::new(self.socket);

        // Instantiate UDP relay buffer
        let mut buffer = [0u8; MAX_DGRAM];

        // Initialize relay state
        let relay_state = Arc::new(RwLock::new(RelayState::new()));

        // Create channel for coordinating outbound socket responses
        let (response_tx, mut response_rx) = mpsc::unbounded_channel();

        // Idle sweep on a fixed cadence, independent of traffic
        let sweep_period = Duration::from_secs(30).min(self.idle_timeout);
        let mut sweep = tokio::time::interval(sweep_period);

        info!(relay = %self.server_addr, "UDP association started");

        loop {
            select! {
                // Monitor the controlling TCP connection: the
                // association is torn down the moment it closes,
                // even if datagrams are still in flight
                tcp_check = stream.readable() => {
                    if tcp_check.is_err() {
                        info!("TCP connection error: terminating UDP association");
                        break;
                    }

                    let mut test_buf = [0u8; 1];
                    match stream.try_read(&mut test_buf) {
                        Ok(0) => {
                            info!("client disconnected: terminating UDP association");
                            break;
                        },
                        Ok(_) => {
                            debug!("unexpected data on TCP connection during UDP association");
                        },
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            // No data on TCP, totally fine
                        },
                        Err(e) => {
                            error!("TCP read error: {e}");
                            break;
                        }
                    }
                }

                // Client -> target
                incoming_udp = server_socket.recv_from(&mut buffer) => {
                    match incoming_udp {
                        Ok((len, client_addr)) => {
                            // The datagram source IP must match the IP
                            // of the controlling TCP connection
                            if !is_client_allowed(&client_addr, &peer_addr) {
                                error!("rejected UDP from unauthorized client: {client_addr}");
                                continue;
                            }

                            // Clone relay_state and response_tx
                            let relay_state_clone = Arc::clone(&relay_state);
                            let response_tx = response_tx.clone();

                            // Grab packet from buffer
                            let packet = buffer[..len].to_vec();

                            // Spawn task to handle datagram
                            tokio::spawn(async move {
                                if let Err(e) = handle_client_datagram(
                                    relay_state_clone,
                                    packet,
                                    client_addr,
                                    response_tx,
                                ).await {
                                    error!("failed to handle client datagram from {client_addr}: {e}");
                                }
                            });
                        },
                        Err(e) => {
                            error!("UDP receive error: {e}");
                            break;
                        }
                    }
                }

                // Target -> server -> client
                Some((data, target_addr, client_addr)) = response_rx.recv() => {
                    // Update last activity
                    {
                        let mut state = relay_state.write().await;
                        let key = AssociationKey { client_addr, target_addr };
                        if let Some(flow) = state.flows.get_mut(&key) {
                            flow.last_activity = Instant::now();
                        }
                    }

                    // Re-wrap and send to the client
                    if let Err(e) = send_response_to_client(
                        &server_socket,
                        &data,
                        target_addr,
                        client_addr,
                    ).await {
                        error!("error sending response to client {client_addr}: {e}");
                    }
                }

                // Clean up expired flows
                _ = sweep.tick() => {
                    cleanup_expired(&relay_state, self.idle_timeout).await;
                }
            }
        }

        // Tear down every flow with the association: abort the monitor
        // tasks and drop their outbound sockets
        let mut state = relay_state.write().await;
        for (_, flow) in state.flows.drain() {
            flow.monitor.abort();
        }

        info!(relay = %self.server_addr, "UDP association closed");
        Ok(())
    }
}

/// handle_client_datagram parses and forwards an incoming UDP datagram
/// from the SOCKS5 client
async fn handle_client_datagram(
    relay_state: Arc<RwLock<RelayState>>,
    packet: Vec<u8>,
    client_addr: SocketAddr,
    response_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr, SocketAddr)>,
) -> Result<()> {
    // SOCKS5 UDP Request Header
    // +----+------+------+----------+----------+----------+
    // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    // +----+------+------+----------+----------+----------+
    // | 2  |  1   |  1   | Variable |    2     | Variable |
    // +----+------+------+----------+----------+----------+

    // Ensure we receive a valid packet
    if packet.len() < 4 {
        return Err(Error::Protocol("UDP packet too short".into()));
    }

    // Check for fragmentation
    if packet[2] != 0x00 {
        return Err(Error::Protocol("UDP fragmentation not supported".into()));
    }

    // Parse target address from the header, starting at ATYP
    let (target, addr_len) = TargetAddr::decode(&packet[3..])?;
    let offset = 3 + addr_len;

    // Ensure there is data in the packet
    if offset >= packet.len() {
        return Err(Error::Protocol("no data in UDP packet".into()));
    }

    // Resolve domain targets; IP targets convert directly
    let target_addr = match target.socket_addr() {
        Some(addr) => addr,
        None => {
            let host = target.to_string();
            tokio::net::lookup_host(&host)
                .await
                .map_err(|e| Error::Protocol(format!("failed to resolve host '{host}': {e}")))?
                .next()
                .ok_or_else(|| Error::Protocol(format!("no IP address found for '{host}'")))?
        }
    };

    // Pull out data for forwarding
    let data = packet[offset..].to_vec();

    // Create association key
    let key = AssociationKey {
        client_addr,
        target_addr,
    };

    // Get existing flow or create a new one for this client-target
    // pair; a dedicated socket per pair minimizes NAT confusion
    let outbound_socket = {
        let mut state = relay_state.write().await;

        match state.flows.entry(key) {
            Entry::Occupied(mut entry) => {
                let flow = entry.get_mut();
                flow.last_activity = Instant::now();
                Arc::clone(&flow.socket)
            }
            Entry::Vacant(entry) => {
                let new_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
                let socket_addr = new_socket.local_addr()?;

                info!("new UDP relay: {client_addr} -> {target_addr} (via {socket_addr})");

                // Spawn task to monitor the socket for responses; the
                // handle is kept so teardown and expiry can abort it
                let monitor = tokio::spawn(monitor_outbound_socket(
                    Arc::clone(&new_socket),
                    target_addr,
                    client_addr,
                    response_tx.clone(),
                ));

                entry.insert(Flow {
                    socket: Arc::clone(&new_socket),
                    monitor,
                    last_activity: Instant::now(),
                });

                new_socket
            }
        }
    };

    // Forward to target
    outbound_socket.send_to(&data, target_addr).await?;

    debug!(
        "forwarded {} bytes: {client_addr} -> {target_addr}",
        data.len()
    );

    Ok(())
}

/// monitor_outbound_socket watches an outbound socket for responses
/// from the target; it runs until aborted by teardown or idle expiry
async fn monitor_outbound_socket(
    socket: Arc<UdpSocket>,
    target_addr: SocketAddr,
    client_addr: SocketAddr,
    response_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr, SocketAddr)>,
) {
    // Instantiate buffer
    let mut buffer = [0u8; MAX_DGRAM];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from_addr)) => {
                // Verify the response is from the expected target
                if from_addr != target_addr {
                    error!("unexpected response from {from_addr} (expected {target_addr})");
                    continue;
                }

                // Grab data
                let data = buffer[..len].to_vec();

                // Send through channel to the association loop
                if response_tx.send((data, from_addr, client_addr)).is_err() {
                    // Channel closed, exit monitor
                    break;
                }

                debug!("received {len} bytes from {from_addr}");
            }
            Err(e) => {
                error!("error receiving from outbound socket: {e}");
                break;
            }
        }
    }

    debug!("stopped monitoring socket for {client_addr} -> {target_addr}");
}

/// cleanup_expired removes idle flows from the association table,
/// aborting their monitors and dropping their outbound sockets
async fn cleanup_expired(relay_state: &RwLock<RelayState>, timeout: Duration) {
    let now = Instant::now();

    let mut state = relay_state.write().await;

    // Find expired flows
    let expired: Vec<AssociationKey> = state
        .flows
        .iter()
        .filter(|(_, flow)| now.duration_since(flow.last_activity) > timeout)
        .map(|(key, _)| key.clone())
        .collect();

    // Remove expired flows
    for key in expired {
        if let Some(flow) = state.flows.remove(&key) {
            flow.monitor.abort();

            info!(
                "removed expired UDP relay: {} -> {}",
                key.client_addr, key.target_addr
            );
        }
    }
}

/// build_response_packet wraps response data in the SOCKS5 UDP header
/// naming the remote sender
fn build_response_packet(data: &[u8], from_addr: SocketAddr) -> Vec<u8> {
    //  +----+------+------+----------+----------+----------+
    //  |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    //  +----+------+------+----------+----------+----------+
    //  | 2  |  1   |  1   | Variable |    2     | Variable |
    //  +----+------+------+----------+----------+----------+

    let mut packet = Vec::with_capacity(data.len() + 22);

    // RSV -> 2 bytes
    packet.extend_from_slice(&[0x00, 0x00]);

    // FRAG -> single byte
    packet.push(0x00);

    // ATYP, address, and port of the remote sender
    encode_socket_addr(&mut packet, from_addr);

    // Push data onto packet
    packet.extend_from_slice(data);

    packet
}

/// send_response_to_client sends a headered response datagram back to
/// the client
async fn send_response_to_client(
    server_socket: &UdpSocket,
    data: &[u8],
    target_addr: SocketAddr,
    client_addr: SocketAddr,
) -> Result<()> {
    // Build SOCKS5 UDP response packet
    let response = build_response_packet(data, target_addr);

    // Send to client
    server_socket.send_to(&response, client_addr).await?;

    debug!(
        "sent {} bytes from {target_addr} to client {client_addr}",
        data.len()
    );

    Ok(())
}

// Checks if the client is permitted to send UDP data to the allotted
// socket. Per the SOCKS5 protocol, the IP address must match the IP
// address of the controlling TCP connection.
fn is_client_allowed(client_addr: &SocketAddr, peer_addr: &SocketAddr) -> bool {
    client_addr.ip() == peer_addr.ip()
}
