//! Datagram socket context: the capability-set transport trait with its
//! unreliable (UDP) and reliable (TCP, length-prefixed) implementations,
//! the endpoint-resolution collaborator (direct dial or STUN-assisted),
//! and the mutual proof-of-key-possession handshake that runs over
//! either one.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use rand::RngCore;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use castcore_crypto::{sign_peer_iv, verify_own_signature, HandshakeMessage};
use castcore_protocol::codec::try_decode_frame;
use castcore_protocol::CoreError;

/// The capability set both transport kinds expose to the sync loops and
/// the handshake. Two concrete, monomorphized implementations exist
/// below; callers generic over `Transport` never need a trait object.
pub trait Transport: Send {
    async fn send_datagram(&mut self, data: &[u8]) -> io::Result<()>;

    /// Reads one logical datagram into `buf`, returning the byte count.
    /// Returns `Ok(0)` on a read that timed out rather than erroring,
    /// so callers can treat "nothing arrived this tick" as the common
    /// case it is.
    async fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn set_timeout(&mut self, timeout: Duration);

    async fn shutdown(&mut self);
}

/// UDP-backed transport: media, input, and pings. No framing beyond the
/// OS datagram boundary.
pub struct Unreliable {
    socket: UdpSocket,
    timeout: Duration,
}

impl Unreliable {
    pub async fn connect(local_port_hint: u16, remote: SocketAddr) -> io::Result<Self> {
        let domain = if remote.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        let _ = socket.set_recv_buffer_size(1 << 20);
        let _ = socket.set_send_buffer_size(1 << 20);

        let bind_addr: SocketAddr = if remote.is_ipv6() {
            format!("[::]:{local_port_hint}").parse().expect("valid ipv6 bind addr")
        } else {
            format!("0.0.0.0:{local_port_hint}").parse().expect("valid ipv4 bind addr")
        };
        socket.bind(&bind_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        socket.connect(remote).await?;

        Ok(Self { socket, timeout: Duration::from_secs(1) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }
}

impl Transport for Unreliable {
    async fn send_datagram(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send(data).await.map(|_| ())
    }

    async fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match tokio::time::timeout(self.timeout, self.socket.recv(buf)).await {
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn shutdown(&mut self) {}
}

/// TCP-backed transport: bulk async data (clipboard, file transfer) and
/// control messages that must not be dropped. Each logical message is
/// framed with a 4-byte big-endian length prefix ahead of the already-
/// encrypted datagram bytes.
pub struct Reliable {
    stream: TcpStream,
    timeout: Duration,
    recv_buf: BytesMut,
}

impl Reliable {
    pub async fn connect(remote: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, timeout: Duration::from_secs(1), recv_buf: BytesMut::with_capacity(4096) })
    }
}

impl Transport for Reliable {
    async fn send_datagram(&mut self, data: &[u8]) -> io::Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large to frame"))?;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(payload) = take_buffered_frame(&mut self.recv_buf)? {
            return Ok(copy_into(&payload, buf));
        }

        let mut chunk = [0u8; 4096];
        loop {
            let read = tokio::time::timeout(self.timeout, self.stream.read(&mut chunk)).await;
            let n = match read {
                Ok(Ok(0)) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "reliable stream closed")),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(0),
            };
            self.recv_buf.extend_from_slice(&chunk[..n]);
            if let Some(payload) = take_buffered_frame(&mut self.recv_buf)? {
                return Ok(copy_into(&payload, buf));
            }
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

fn take_buffered_frame(recv_buf: &mut BytesMut) -> io::Result<Option<Vec<u8>>> {
    try_decode_frame(recv_buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn copy_into(payload: &[u8], buf: &mut [u8]) -> usize {
    let n = payload.len().min(buf.len());
    buf[..n].copy_from_slice(&payload[..n]);
    n
}

/// Resolves the address this session dials, optionally discovering this
/// host's own public mapping first. Injected so the sync-loop setup
/// doesn't hard-depend on a STUN client.
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, udp_socket: &UdpSocket, server_addr: SocketAddr) -> io::Result<SocketAddr>;
}

pub struct DirectResolver;

impl EndpointResolver for DirectResolver {
    async fn resolve(&self, _udp_socket: &UdpSocket, server_addr: SocketAddr) -> io::Result<SocketAddr> {
        Ok(server_addr)
    }
}

const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// A minimal RFC 5389 STUN binding-request resolver. The dial target is
/// still the configured server address; this only logs the discovered
/// public mapping, which is enough to diagnose NAT/firewall issues from
/// client-side logs without a full ICE implementation.
pub struct StunResolver {
    pub stun_server: SocketAddr,
}

impl EndpointResolver for StunResolver {
    async fn resolve(&self, udp_socket: &UdpSocket, server_addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);

        let mut request = Vec::with_capacity(20);
        request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
        request.extend_from_slice(&0u16.to_be_bytes());
        request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        request.extend_from_slice(&transaction_id);

        udp_socket.send_to(&request, self.stun_server).await?;

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), udp_socket.recv_from(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "STUN binding request timed out"))??;

        match parse_xor_mapped_address(&buf[..n], &transaction_id) {
            Some(mapped) => debug!(%mapped, "discovered public endpoint via STUN"),
            None => warn!("STUN response carried no usable XOR-MAPPED-ADDRESS"),
        }

        Ok(server_addr)
    }
}

fn parse_xor_mapped_address(resp: &[u8], expected_txn: &[u8; 12]) -> Option<SocketAddr> {
    if resp.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([resp[0], resp[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return None;
    }
    let msg_len = u16::from_be_bytes([resp[2], resp[3]]) as usize;
    if resp[4..8] != STUN_MAGIC_COOKIE.to_be_bytes() {
        return None;
    }
    if resp[8..20] != *expected_txn {
        return None;
    }

    let mut offset = 20;
    let end = (20 + msg_len).min(resp.len());
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([resp[offset], resp[offset + 1]]);
        let attr_len = u16::from_be_bytes([resp[offset + 2], resp[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }
        if attr_type == STUN_ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 {
            let family = resp[value_start + 1];
            let xport = u16::from_be_bytes([resp[value_start + 2], resp[value_start + 3]])
                ^ (STUN_MAGIC_COOKIE >> 16) as u16;
            if family == 0x01 {
                if let Ok(octets) = <[u8; 4]>::try_from(&resp[value_start + 4..value_start + 8]) {
                    let xaddr = u32::from_be_bytes(octets) ^ STUN_MAGIC_COOKIE;
                    let ip = std::net::Ipv4Addr::from(xaddr);
                    return Some(SocketAddr::new(ip.into(), xport));
                }
            }
        }
        offset = value_end + (4 - attr_len % 4) % 4;
    }
    None
}

/// Runs the mutual proof-of-key-possession handshake over an already
/// connected transport: each side proves it holds `key` by signing the
/// peer's freshly generated IV, without ever putting the key itself on
/// the wire.
pub async fn perform_handshake<T: Transport>(transport: &mut T, key: &[u8; 16]) -> Result<(), CoreError> {
    transport.set_timeout(Duration::from_secs(1));

    let mine = HandshakeMessage::fresh();
    transport
        .send_datagram(&mine.to_bytes())
        .await
        .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?;

    let theirs = recv_handshake_message(transport).await?;

    let signature_of_theirs = sign_peer_iv(key, &theirs.iv);
    let response = HandshakeMessage { iv: mine.iv, signature: signature_of_theirs };
    transport
        .send_datagram(&response.to_bytes())
        .await
        .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?;

    let their_response = recv_handshake_message(transport).await?;
    verify_own_signature(key, &mine.iv, &their_response.signature)?;

    Ok(())
}

async fn recv_handshake_message<T: Transport>(transport: &mut T) -> Result<HandshakeMessage, CoreError> {
    let mut buf = [0u8; 48];
    let n = transport
        .recv_datagram(&mut buf)
        .await
        .map_err(|e| CoreError::HandshakeFailed(e.to_string()))?;
    if n == 0 {
        return Err(CoreError::HandshakeFailed("handshake round timed out".into()));
    }
    HandshakeMessage::from_bytes(&buf[..n])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_mapped_address_roundtrip() {
        let txn = [7u8; 12];
        let ip = std::net::Ipv4Addr::new(203, 0, 113, 9);
        let port: u16 = 54321;

        let xport = port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        let xaddr = u32::from(ip) ^ STUN_MAGIC_COOKIE;

        let mut attr = Vec::new();
        attr.extend_from_slice(&STUN_ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        attr.extend_from_slice(&8u16.to_be_bytes());
        attr.push(0);
        attr.push(0x01);
        attr.extend_from_slice(&xport.to_be_bytes());
        attr.extend_from_slice(&xaddr.to_be_bytes());

        let mut resp = Vec::new();
        resp.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        resp.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        resp.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(&txn);
        resp.extend_from_slice(&attr);

        let resolved = parse_xor_mapped_address(&resp, &txn).expect("attribute parsed");
        assert_eq!(resolved, SocketAddr::new(ip.into(), port));
    }

    #[test]
    fn xor_mapped_address_rejects_wrong_transaction() {
        let txn = [1u8; 12];
        let mut resp = Vec::new();
        resp.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());
        resp.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(&[2u8; 12]);

        assert!(parse_xor_mapped_address(&resp, &txn).is_none());
    }

    #[test]
    fn copy_into_truncates_to_dest_len() {
        let payload = [1u8, 2, 3, 4, 5];
        let mut small = [0u8; 3];
        let n = copy_into(&payload, &mut small);
        assert_eq!(n, 3);
        assert_eq!(small, [1, 2, 3]);
    }
}
