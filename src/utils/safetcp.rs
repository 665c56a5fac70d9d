//! Safe TCP bind/connect helper functions with socket options applied.

use std::io;
use std::net::SocketAddr;

use crate::utils::GridError;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Socket options applied to every ring socket, both listening and
/// connected ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub(crate) nodelay: bool,

    /// Set `SO_LINGER` to zero so that closing resets the connection
    /// immediately instead of lingering in `TIME_WAIT`.
    pub(crate) linger_zero: bool,
}

impl SocketOptions {
    fn linger(&self) -> Option<Duration> {
        if self.linger_zero {
            Some(Duration::ZERO)
        } else {
            None
        }
    }

    /// Applies options to a not-yet-connected socket.
    pub(crate) fn apply_socket(&self, socket: &TcpSocket) -> io::Result<()> {
        socket.set_linger(self.linger())?;
        socket.set_nodelay(self.nodelay)?;
        Ok(())
    }

    /// Applies options to an accepted stream.
    pub(crate) fn apply_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_linger(self.linger())?;
        stream.set_nodelay(self.nodelay)?;
        Ok(())
    }
}

/// Creates a fresh TCP socket of the address family matching `addr`, with
/// options applied.
pub(crate) fn tcp_socket_for(
    addr: &SocketAddr,
    opts: &SocketOptions,
) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    opts.apply_socket(&socket)?;
    Ok(socket)
}

/// Connects to `addr` with a bounded wait. An elapsed wait surfaces as an
/// `io::ErrorKind::TimedOut` error so that callers can classify it.
pub(crate) async fn tcp_connect_with_timeout(
    addr: SocketAddr,
    opts: SocketOptions,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = tcp_socket_for(&addr, &opts)?;
    match time::timeout(timeout, socket.connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "Connection timed out",
        )),
    }
}

/// Wrapper over tokio `TcpSocket::listen()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    backlog: u32,
    opts: SocketOptions,
    mut retries: u8,
) -> Result<TcpListener, GridError> {
    loop {
        let socket = tcp_socket_for(&bind_addr, &opts)?;
        socket.set_reuseaddr(true)?;

        let result = socket
            .bind(bind_addr)
            .and_then(|_| socket.listen(backlog));
        match result {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return logged_err!(
                        "binding ring listener {} failed: {}",
                        bind_addr,
                        err
                    );
                }
                retries -= 1;
                time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
