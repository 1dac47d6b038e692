//! End-to-end tests for UDP ASSOCIATE

use socksd::{Config, Socks5Server};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Duration, timeout};

/// Start a server on an ephemeral port and return its address
async fn spawn_server(mut config: Config) -> SocketAddr {
    config.listen = "127.0.0.1:0".parse().unwrap();
    let mut server = Socks5Server::new(config);
    let addr = server.bind().await.unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

/// Start a UDP echo server and return its address
async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], from).await;
        }
    });
    addr
}

/// Start a UDP echo that also reports the source address of the first
/// datagram it receives
async fn spawn_recording_echo() -> (SocketAddr, tokio::sync::oneshot::Receiver<SocketAddr>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (from_tx, from_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        let _ = socket.send_to(&buf[..len], from).await;
        let _ = from_tx.send(from);
    });
    (addr, from_rx)
}

/// Negotiate no-auth and send UDP ASSOCIATE; return (control stream,
/// relay port)
async fn associate(server: SocketAddr) -> (TcpStream, u16) {
    let mut stream = TcpStream::connect(server).await.unwrap();

    // No-auth greeting
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    // UDP ASSOCIATE with the conventional unspecified source
    stream
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    // Reply carries the relay socket's address
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[1], 0x00);
    assert_eq!(header[3], 0x01);
    let mut addr = [0u8; 4];
    stream.read_exact(&mut addr).await.unwrap();
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await.unwrap();

    (stream, u16::from_be_bytes(port))
}

/// Build a headered datagram for an IPv4 destination
fn datagram(dest: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let SocketAddr::V4(dest) = dest else {
        panic!("test destinations are IPv4");
    };
    let mut packet = vec![0x00, 0x00, 0x00, 0x01];
    packet.extend_from_slice(&dest.ip().octets());
    packet.extend_from_slice(&dest.port().to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

#[tokio::test]
async fn associate_relays_headered_datagrams() {
    let echo = spawn_udp_echo().await;
    let server = spawn_server(Config::default()).await;
    let (_control, relay_port) = associate(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&datagram(echo, b"ping"), ("127.0.0.1", relay_port))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no response datagram")
        .unwrap();

    // Response header: RSV FRAG ATYP=IPv4, then the echo's address
    assert!(len > 10);
    assert_eq!(&buf[..4], &[0x00, 0x00, 0x00, 0x01]);
    let SocketAddr::V4(echo_v4) = echo else { unreachable!() };
    assert_eq!(&buf[4..8], &echo_v4.ip().octets());
    assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), echo_v4.port());
    assert_eq!(&buf[10..len], b"ping");
}

#[tokio::test]
async fn fragmented_datagrams_are_dropped() {
    let echo = spawn_udp_echo().await;
    let server = spawn_server(Config::default()).await;
    let (_control, relay_port) = associate(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // FRAG != 0 must be discarded
    let mut packet = datagram(echo, b"frag");
    packet[2] = 0x01;
    client
        .send_to(&packet, ("127.0.0.1", relay_port))
        .await
        .unwrap();

    let mut buf = [0u8; 256];
    let result = timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await;
    assert!(result.is_err(), "fragmented datagram was relayed");
}

#[tokio::test]
async fn association_dies_with_control_connection() {
    let echo = spawn_udp_echo().await;
    let server = spawn_server(Config::default()).await;
    let (control, relay_port) = associate(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Sanity: the relay works while the control connection lives
    client
        .send_to(&datagram(echo, b"alive"), ("127.0.0.1", relay_port))
        .await
        .unwrap();
    let mut buf = [0u8; 256];
    timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("relay not working before teardown")
        .unwrap();

    // Closing the TCP connection tears the association down
    drop(control);
    tokio::time::sleep(Duration::from_millis(300)).await;

    client
        .send_to(&datagram(echo, b"dead"), ("127.0.0.1", relay_port))
        .await
        .unwrap();
    let result = timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await;
    assert!(result.is_err(), "association outlived its control connection");
}

#[tokio::test]
async fn teardown_releases_outbound_sockets() {
    let (echo, from_rx) = spawn_recording_echo().await;
    let server = spawn_server(Config::default()).await;
    let (control, relay_port) = associate(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&datagram(echo, b"ping"), ("127.0.0.1", relay_port))
        .await
        .unwrap();

    let mut buf = [0u8; 256];
    timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no response through relay")
        .unwrap();

    // The address the per-target outbound socket sent from
    let outbound_addr = timeout(Duration::from_secs(2), from_rx)
        .await
        .expect("echo never saw the relay")
        .unwrap();

    drop(control);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The outbound socket must be gone with the association; its port
    // is bindable again
    UdpSocket::bind(outbound_addr)
        .await
        .expect("outbound socket still bound after teardown");
}

#[tokio::test]
async fn idle_flows_expire_and_release_sockets() {
    let (echo, from_rx) = spawn_recording_echo().await;
    let config = Config {
        udp_idle_timeout_secs: 1,
        ..Config::default()
    };
    let server = spawn_server(config).await;
    let (_control, relay_port) = associate(server).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&datagram(echo, b"ping"), ("127.0.0.1", relay_port))
        .await
        .unwrap();

    let mut buf = [0u8; 256];
    timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no response through relay")
        .unwrap();

    let outbound_addr = timeout(Duration::from_secs(2), from_rx)
        .await
        .expect("echo never saw the relay")
        .unwrap();

    // The flow goes quiet; the sweep must reap it even though the
    // association itself stays up
    tokio::time::sleep(Duration::from_secs(3)).await;

    UdpSocket::bind(outbound_addr)
        .await
        .expect("idle outbound socket was not reaped");
}
