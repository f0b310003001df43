use std::time::Duration;

use tokio::net::TcpStream;

use crate::{addr::NodeAddr, error::Result, runtime};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// Opens a TCP connection to `address` with `TCP_NODELAY` and keepalive configured.
///
/// A `connect_timeout` of zero disables the timeout entirely.
pub(crate) async fn connect(
    address: &NodeAddr,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let stream_future = TcpStream::connect(address.to_socket_addr());
    let stream = if timeout == Duration::from_secs(0) {
        stream_future.await?
    } else {
        runtime::timeout(timeout, stream_future).await??
    };

    stream.set_nodelay(true)?;

    let socket = socket2::Socket::from(stream.into_std()?);
    let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket.set_tcp_keepalive(&conf)?;
    let std_stream = std::net::TcpStream::from(socket);
    Ok(TcpStream::from_std(std_stream)?)
}
