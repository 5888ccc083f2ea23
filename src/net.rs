use anyhow::{anyhow, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::fs;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::Path;
use std::time::Duration;

/// Checks whether `addr` is assigned to one of the local interfaces.
pub fn is_local_address(addr: IpAddr) -> Result<bool> {
    let interfaces = if_addrs::get_if_addrs().context("Cannot list network interfaces")?;
    Ok(interfaces.iter().any(|iface| iface.ip() == addr))
}

/// Bound UDP socket for incoming probe streams.
pub fn create_probe_socket(addr: SocketAddr, read_timeout: Duration) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // Bursts arrive faster than one recv per packet at high rates.
    socket.set_recv_buffer_size(4 * 1024 * 1024)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind probe socket to {}", addr))?;
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket.into())
}

/// Listening socket for the control channel. Where the platform honors the
/// receive timeout on listening sockets, accept gives up after `accept_timeout`.
pub fn create_control_listener(
    addr: SocketAddr,
    backlog: i32,
    accept_timeout: Duration,
) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind control socket to {}", addr))?;
    socket.listen(backlog)?;
    socket.set_read_timeout(Some(accept_timeout))?;
    Ok(socket.into())
}

/// Connects to `dest` from `local`, so the peer sees our own address as source.
pub fn connect_from(
    local: IpAddr,
    dest: SocketAddr,
    timeout: Duration,
) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(dest), Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&SocketAddr::new(local, 0).into())?;
    socket.connect_timeout(&dest.into(), timeout)?;
    socket.set_write_timeout(Some(timeout))?;
    Ok(socket.into())
}

/// Parses a peers file: one address per line, blank lines skipped, anything
/// after the first token ignored. Returns the addresses and the index of `own`.
pub fn parse_peers(content: &str, own: IpAddr) -> Result<(Vec<IpAddr>, usize)> {
    let mut peers = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        let addr: IpAddr = token
            .parse()
            .with_context(|| format!("Invalid address '{}' on line {}", token, line_no + 1))?;
        peers.push(addr);
    }

    let index = peers
        .iter()
        .position(|p| *p == own)
        .ok_or_else(|| anyhow!("{} is not listed in the peers file", own))?;
    Ok((peers, index))
}

pub fn load_peers(path: &Path, own: IpAddr) -> Result<(Vec<IpAddr>, usize)> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Cannot open {}", path.display()))?;
    parse_peers(&content, own)
}
