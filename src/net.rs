//! Outbound TCP connection helper.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpSocket, TcpStream};

/// Connect to `address` (`host:port`), binding to `source_ip` when given.
///
/// Every resolved address is tried in turn; resolved addresses of the other
/// IP family than `source_ip` are skipped.
pub(crate) async fn connect_from(address: &str, source_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let mut last_error = None;

    for peer in tokio::net::lookup_host(address).await? {
        if let Some(ip) = source_ip
            && ip.is_ipv6() != peer.is_ipv6()
        {
            continue;
        }

        match connect_one(peer, source_ip).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::trace!(address, peer = %peer, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for '{address}'"),
        )
    }))
}

async fn connect_one(peer: SocketAddr, source_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let socket = if peer.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    if let Some(ip) = source_ip {
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    let stream = socket.connect(peer).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
