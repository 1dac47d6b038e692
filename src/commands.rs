use crate::address::{TargetAddr, encode_socket_addr};
use crate::config::Config;
use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::protocol::{AddressType, Command, RSV, ReplyCode, Version};
use crate::udp::UdpAssociation;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time::timeout,
};
use tracing::{debug, info, warn};

/// Established is the outcome of a successfully dispatched command:
/// either a connected TCP stream to relay (CONNECT, BIND) or a UDP
/// association to run
pub enum Established {
    Tcp(TcpStream),
    Udp(UdpAssociation),
}

/// handle_request reads the command request from the client, validates
/// its header, and routes to the appropriate command handler
pub async fn handle_request(
    stream: &mut TcpStream,
    dialer: &Dialer,
    config: &Config,
) -> Result<Established> {
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Instantiate a request buffer & read the fixed header
    let mut reqbuf = [0u8; 4];
    stream.read_exact(&mut reqbuf).await?;

    // Parse
    let version = reqbuf[0];
    let command = reqbuf[1];
    let reserved = reqbuf[2];
    let atyp = reqbuf[3];

    // Validate the address type before reading the address bytes
    let Some(addr_type) = AddressType::from_byte(atyp) else {
        send_reply(stream, ReplyCode::AddrTypeUnsupported, unspecified_addr()).await?;
        return Err(Error::Protocol(format!("unknown address type: {atyp}")));
    };

    // Drain the full request frame before any failure reply so the
    // reply is not raced by unread request bytes on close
    let target = TargetAddr::read_body(stream, addr_type).await?;

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        send_reply(stream, ReplyCode::ServerFailure, unspecified_addr()).await?;
        return Err(Error::Protocol(format!("not SOCKS5: version {version}")));
    }

    // Reserved byte must be 0x00
    if reserved != RSV {
        send_reply(stream, ReplyCode::ServerFailure, unspecified_addr()).await?;
        return Err(Error::Protocol(format!("non-zero reserved byte: {reserved}")));
    }

    // Check command and route
    match Command::from_byte(command) {
        Some(Command::Connect) => {
            let outbound = handle_connect_cmd(stream, dialer, &target).await?;
            Ok(Established::Tcp(outbound))
        }
        Some(Command::Bind) => {
            let inbound = handle_bind_cmd(stream, config, &target).await?;
            Ok(Established::Tcp(inbound))
        }
        Some(Command::UdpAssociate) => {
            let association = handle_udpassociate_cmd(stream, config, &target).await?;
            Ok(Established::Udp(association))
        }
        None => {
            send_reply(stream, ReplyCode::CommandNotSupported, unspecified_addr()).await?;
            Err(Error::Protocol(format!("unknown command: {command}")))
        }
    }
}

// ================
// CONNECT COMMAND
// ================

/// handle_connect_cmd dials the requested target and, on success,
/// replies with the local address of the outbound socket and returns
/// the stream for relaying
async fn handle_connect_cmd(
    stream: &mut TcpStream,
    dialer: &Dialer,
    target: &TargetAddr,
) -> Result<TcpStream> {
    // Race the dial against the client going away so an abandoned
    // session does not hold the dial for the full connect timeout
    let dial = dialer.dial(target);
    tokio::pin!(dial);

    let dialed = tokio::select! {
        res = &mut dial => res,
        closed = async {
            let mut peek_buf = [0u8; 1];
            matches!(stream.peek(&mut peek_buf).await, Ok(0) | Err(_))
        } => {
            if closed {
                debug!(%target, "client closed before connect completed");
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "client closed before connect completed",
                )));
            }
            // The client spoke early; its bytes stay queued for the
            // relay while the dial finishes
            dial.await
        }
    };

    match dialed {
        Ok(outbound) => {
            // Send OK reply with the bound address of the outbound socket
            send_reply(stream, ReplyCode::Succeeded, outbound.local_addr()?).await?;
            info!(%target, "connected to target");
            Ok(outbound)
        }
        Err(e) => {
            // Map the dial failure onto the reply-code vocabulary,
            // reply, and close without retry
            warn!(%target, error = %e, "dial failed");
            send_reply(stream, e.reply_code(), unspecified_addr()).await?;
            Err(e.into())
        }
    }
}

// =============
// BIND COMMAND
// =============

/// handle_bind_cmd opens an ephemeral listener, announces it to the
/// client, and waits (bounded by the configured timeout) for exactly
/// one inbound connection; the second reply carries the peer address
async fn handle_bind_cmd(
    stream: &mut TcpStream,
    config: &Config,
    target: &TargetAddr,
) -> Result<TcpStream> {
    debug!(expected_peer = %target, "BIND requested");

    // Bind on the control connection's local IP so the advertised
    // BND.ADDR is one the remote peer can actually reach
    let bind_ip = stream.local_addr()?.ip();
    let listener = match TcpListener::bind((bind_ip, 0)).await {
        Ok(l) => l,
        Err(e) => {
            send_reply(stream, ReplyCode::ServerFailure, unspecified_addr()).await?;
            return Err(e.into());
        }
    };

    // First reply: the address the client's peer should connect to
    send_reply(stream, ReplyCode::Succeeded, listener.local_addr()?).await?;

    // Wait for exactly one inbound connection
    match timeout(config.bind_timeout(), listener.accept()).await {
        Ok(Ok((inbound, peer_addr))) => {
            // The listener is released as soon as the one connection
            // has arrived
            drop(listener);

            // Second reply: the connecting peer's address
            send_reply(stream, ReplyCode::Succeeded, peer_addr).await?;
            info!(%peer_addr, "BIND peer connected");
            Ok(inbound)
        }
        Ok(Err(e)) => {
            send_reply(stream, ReplyCode::ServerFailure, unspecified_addr()).await?;
            Err(e.into())
        }
        Err(_) => {
            warn!("BIND timed out waiting for peer");
            send_reply(stream, ReplyCode::ServerFailure, unspecified_addr()).await?;
            Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "BIND accept timed out",
            )))
        }
    }
}

// ===============
// UDP ASSOCIATE
// ===============

/// handle_udpassociate_cmd binds the relay UDP socket, announces it to
/// the client, and returns the association ready to run. The request's
/// DST.ADDR is the client's announced source (commonly 0.0.0.0:0) and
/// is not used to restrict targets; datagram sources are filtered by
/// the control connection's client IP instead.
async fn handle_udpassociate_cmd(
    stream: &mut TcpStream,
    config: &Config,
    target: &TargetAddr,
) -> Result<UdpAssociation> {
    debug!(announced = %target, "UDP ASSOCIATE requested");

    // Bind the relay socket on the control connection's local IP so
    // the advertised BND.ADDR is reachable from the client
    let bind_ip = stream.local_addr()?.ip();
    let socket = match UdpSocket::bind((bind_ip, 0)).await {
        Ok(sock) => sock,
        Err(e) => {
            // If there's an issue, it's with binding the UDP socket
            // server side
            send_reply(stream, ReplyCode::ServerFailure, unspecified_addr()).await?;
            return Err(e.into());
        }
    };

    let server_addr = socket.local_addr()?;
    let peer_addr = stream.peer_addr()?;

    // Announce the relay socket to the client
    send_reply(stream, ReplyCode::Succeeded, server_addr).await?;

    Ok(UdpAssociation::new(
        socket,
        server_addr,
        peer_addr,
        config.udp_idle_timeout(),
    ))
}

// =========
// HELPERS
// =========

/// send_reply handles logic for sending replies from the SOCKS server
/// to the client
pub(crate) async fn send_reply(
    stream: &mut TcpStream,
    reply_code: ReplyCode,
    bound_addr: SocketAddr,
) -> Result<()> {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Build initial reply vec
    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];

    // Append ATYP, BND.ADDR, and BND.PORT
    encode_socket_addr(&mut reply, bound_addr);

    // Write reply
    stream.write_all(&reply).await?;
    Ok(())
}

/// unspecified_addr is the 0.0.0.0:0 bound address used in failure
/// replies where no socket was bound
fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}
