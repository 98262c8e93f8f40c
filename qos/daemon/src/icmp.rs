//! ICMP echo transport
//!
//! [`EchoTransport`] opens an [`EchoSession`] against one target. The socket
//! implementation uses a raw (privileged) or datagram ICMP socket driven by
//! tokio's readiness API.

use crate::config::{IcmpQosProbe, IpProtocol, MAX_PACKET_SIZE};
use async_trait::async_trait;
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::Instant;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMP_HEADER_LEN: usize = 8;
const IPV4_MIN_HEADER_LEN: usize = 20;
const RECV_BUFFER_LEN: usize = 65_536;

/// Echo reply matched to a request of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub seq: u16,
    pub rtt: Duration,
}

/// Socket options applied before the first request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Payload bytes per request
    pub packet_size: usize,
    pub ttl: u32,
    /// Use a raw socket instead of an unprivileged datagram socket
    pub privileged: bool,
    pub ip_protocol: IpProtocol,
}

impl From<&IcmpQosProbe> for SessionOptions {
    fn from(params: &IcmpQosProbe) -> Self {
        Self {
            packet_size: params.packet_size,
            ttl: params.ttl,
            privileged: params.privileged,
            ip_protocol: params.preferred_ip_protocol,
        }
    }
}

/// Opens echo sessions
#[async_trait]
pub trait EchoTransport: Send + Sync {
    /// Resolve `target` and open a session
    ///
    /// Fails if the target cannot be resolved or the socket cannot be
    /// created, e.g. for lack of privilege.
    async fn open(&self, target: &str, options: &SessionOptions) -> io::Result<Box<dyn EchoSession>>;
}

/// One echo conversation with a resolved target
#[async_trait]
pub trait EchoSession: Send {
    /// Resolved address of the target
    fn remote(&self) -> IpAddr;

    /// Send an echo request carrying `seq`
    async fn send(&mut self, seq: u16) -> io::Result<()>;

    /// Wait for the next reply to one of this session's requests
    ///
    /// Must be cancel-safe: dropping the future loses no reply. Repeated
    /// replies for the same sequence are returned again.
    async fn recv(&mut self) -> io::Result<EchoReply>;
}

/// Socket-backed ICMP transport
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpTransport;

impl IcmpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EchoTransport for IcmpTransport {
    async fn open(&self, target: &str, options: &SessionOptions) -> io::Result<Box<dyn EchoSession>> {
        if options.packet_size > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "payload of {} bytes exceeds the {} byte limit",
                    options.packet_size, MAX_PACKET_SIZE
                ),
            ));
        }
        let remote = resolve(target, options.ip_protocol).await?;
        let session = IcmpSession::open(remote, options)?;
        Ok(Box::new(session))
    }
}

/// Resolve a host name or literal address, preferring `protocol`
pub async fn resolve(target: &str, protocol: IpProtocol) -> io::Result<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host((target, 0))
        .await?
        .map(|addr| addr.ip())
        .collect();

    let preferred = addrs.iter().copied().find(|ip| match protocol {
        IpProtocol::Ip4 => ip.is_ipv4(),
        IpProtocol::Ip6 => ip.is_ipv6(),
    });

    preferred
        .or_else(|| addrs.first().copied())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unable to resolve {:?}", target)))
}

/// Echo session over an ICMP socket
struct IcmpSession {
    fd: AsyncFd<Socket>,
    remote: IpAddr,
    raw: bool,
    identifier: u16,
    payload: Vec<u8>,
    sent_at: HashMap<u16, Instant>,
    buf: Vec<u8>,
}

impl IcmpSession {
    fn open(remote: IpAddr, options: &SessionOptions) -> io::Result<Self> {
        let (domain, protocol) = match remote {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };
        let ty = if options.privileged { Type::RAW } else { Type::DGRAM };

        let socket = Socket::new(domain, ty, Some(protocol))?;
        socket.set_nonblocking(true)?;
        match remote {
            IpAddr::V4(_) => socket.set_ttl(options.ttl)?,
            IpAddr::V6(_) => socket.set_unicast_hops_v6(options.ttl)?,
        }
        socket.connect(&SocketAddr::new(remote, 0).into())?;

        debug!(
            "Opened {} ICMP socket to {} (ttl {}, payload {} bytes)",
            if options.privileged { "raw" } else { "datagram" },
            remote,
            options.ttl,
            options.packet_size
        );

        Ok(Self {
            fd: register(socket)?,
            remote,
            raw: options.privileged,
            identifier: rand::random(),
            payload: payload(options.packet_size),
            sent_at: HashMap::new(),
            buf: vec![0; RECV_BUFFER_LEN],
        })
    }
}

#[async_trait]
impl EchoSession for IcmpSession {
    fn remote(&self) -> IpAddr {
        self.remote
    }

    async fn send(&mut self, seq: u16) -> io::Result<()> {
        let packet = encode_echo_request(self.remote.is_ipv6(), self.identifier, seq, &self.payload);

        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(&packet)) {
                Ok(result) => {
                    result?;
                    self.sent_at.insert(seq, Instant::now());
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&mut self) -> io::Result<EchoReply> {
        let ipv6 = self.remote.is_ipv6();

        loop {
            let mut guard = self.fd.readable().await?;
            let buf = &mut self.buf;
            let len = match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            let received_at = Instant::now();

            let Some((identifier, seq)) = parse_echo_reply(&self.buf[..len], ipv6, self.raw) else {
                continue;
            };
            // Datagram sockets have their identifier rewritten by the kernel.
            if self.raw && identifier != self.identifier {
                continue;
            }
            if let Some(sent_at) = self.sent_at.get(&seq) {
                return Ok(EchoReply {
                    seq,
                    rtt: received_at.saturating_duration_since(*sent_at),
                });
            }
        }
    }
}

/// Hand a non-blocking socket to the reactor for both directions
fn register(socket: Socket) -> io::Result<AsyncFd<Socket>> {
    AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)
}

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Build an echo request
///
/// The IPv4 checksum is filled in; ICMPv6 checksums are computed by the
/// kernel.
pub fn encode_echo_request(ipv6: bool, identifier: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    packet.push(if ipv6 { ICMPV6_ECHO_REQUEST } else { ICMP_ECHO_REQUEST });
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(payload);

    if !ipv6 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Extract `(identifier, seq)` from an echo reply
///
/// Raw IPv4 sockets deliver the IP header in front of the ICMP message.
pub fn parse_echo_reply(data: &[u8], ipv6: bool, raw: bool) -> Option<(u16, u16)> {
    let icmp = if !ipv6 && raw {
        if data.len() < IPV4_MIN_HEADER_LEN {
            return None;
        }
        let header_len = usize::from(data[0] & 0x0f) * 4;
        data.get(header_len..)?
    } else {
        data
    };

    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }
    let expected = if ipv6 { ICMPV6_ECHO_REPLY } else { ICMP_ECHO_REPLY };
    if icmp[0] != expected || icmp[1] != 0 {
        return None;
    }

    let identifier = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((identifier, seq))
}

/// Internet checksum (RFC 1071)
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|chunk| match *chunk {
            [hi, lo] => u32::from(u16::from_be_bytes([hi, lo])),
            [hi] => u32::from(u16::from_be_bytes([hi, 0])),
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
