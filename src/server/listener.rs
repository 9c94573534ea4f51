// Shared listener module
// The supervisor binds the address once; every worker process joins it with
// SO_REUSEPORT so all of them accept on the same port

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::error::BindError;

/// Address reservation held by the supervisor for the lifetime of the pool.
///
/// The socket is bound with `SO_REUSEPORT` but never listens, so the kernel
/// routes no connections to it; it only keeps the port owned by this pool
/// while workers come and go.
#[derive(Debug)]
pub struct SharedSocket {
    _socket: Socket,
    local_addr: SocketAddr,
}

impl SharedSocket {
    /// Concrete address workers must join (port 0 resolved)
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Bind `addr` for a worker pool.
///
/// A probe bind without `SO_REUSEPORT` runs first, so an address somebody
/// is listening on (including another pool's workers) fails with `BindError`
/// instead of silently joining their `SO_REUSEPORT` group.
pub fn bind(addr: SocketAddr) -> Result<SharedSocket, BindError> {
    let reserve = || -> io::Result<SharedSocket> {
        let probe = Socket::new(domain_of(addr), Type::STREAM, Some(Protocol::TCP))?;
        // TIME_WAIT leftovers are fine, listeners are not
        probe.set_reuse_address(true)?;
        probe.bind(&addr.into())?;
        let local_addr = socket_addr_of(&probe)?;
        drop(probe);

        let socket = reusable_socket(local_addr)?;
        socket.bind(&local_addr.into())?;
        Ok(SharedSocket {
            _socket: socket,
            local_addr,
        })
    };
    reserve().map_err(|source| BindError { addr, source })
}

/// Create this worker's accept socket on the pool address.
///
/// Must be called from within a tokio runtime.
pub fn join(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = reusable_socket(addr)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    // Convert socket2::Socket to std::net::TcpListener, then to tokio::net::TcpListener
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Socket with `SO_REUSEPORT` and `SO_REUSEADDR` enabled, non-blocking
fn reusable_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(domain_of(addr), Type::STREAM, Some(Protocol::TCP))?;

    // Lets every worker bind the same address:port
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    // Allows binding to a port in TIME_WAIT state
    socket.set_reuse_address(true)?;

    socket.set_nonblocking(true)?;
    Ok(socket)
}

const fn domain_of(addr: SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn socket_addr_of(socket: &Socket) -> io::Result<SocketAddr> {
    socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"))
}
