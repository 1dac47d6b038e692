use std::io;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::info;

/// run relays bytes bidirectionally between the client and target
/// streams until both directions have terminated. copy_bidirectional
/// half-closes the opposite write side on EOF and keeps draining the
/// remaining direction; both streams are owned here and dropped on
/// every exit path.
pub async fn run(mut client: TcpStream, mut target: TcpStream) -> io::Result<(u64, u64)> {
    let (from_client, from_target) = copy_bidirectional(&mut client, &mut target).await?;

    info!(
        bytes_out = from_client,
        bytes_in = from_target,
        "connection closed"
    );

    Ok((from_client, from_target))
}
