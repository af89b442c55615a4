//! Reply construction and addressing (RFC 2131 §4.1, §4.3).
//!
//! Every reply echoes the request's transaction id, hardware fields, flags
//! and relay address, carries the message type and server identifier as its
//! first two options, and is serialized as header + options + End byte with
//! no trailing padding.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::request::{
    BOOTREPLY, CHADDR_OFFSET, CHADDR_SIZE, CIADDR_OFFSET, DHCP_FIXED_HEADER_SIZE,
    DHCP_MAGIC_COOKIE, FLAGS_OFFSET, GIADDR_OFFSET, HLEN_OFFSET, HTYPE_OFFSET,
    MAGIC_COOKIE_OFFSET, OP_OFFSET, RequestView, SIADDR_OFFSET, XID_OFFSET, YIADDR_OFFSET,
};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Where a reply must be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Unicast to the relay agent that forwarded the request.
    Relay(Ipv4Addr),
    /// Limited broadcast on the local segment.
    Broadcast,
    /// Unicast to the client's current address.
    Unicast(Ipv4Addr),
}

impl Destination {
    /// Chooses the destination for a reply of `message_type` to `request`.
    ///
    /// A non-zero `giaddr` always wins. Otherwise OFFER and NAK are
    /// broadcast, and ACK goes to `ciaddr` when the client filled it in.
    pub fn for_reply(request: &RequestView<'_>, message_type: MessageType) -> Self {
        let giaddr = request.giaddr();
        if !giaddr.is_unspecified() {
            return Self::Relay(giaddr);
        }

        let ciaddr = request.ciaddr();
        match message_type {
            MessageType::Ack if !ciaddr.is_unspecified() => Self::Unicast(ciaddr),
            _ => Self::Broadcast,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        match self {
            Self::Relay(ip) | Self::Unicast(ip) => *ip,
            Self::Broadcast => Ipv4Addr::BROADCAST,
        }
    }

    /// Relay agents listen on the server port, clients on the client port.
    pub fn socket_addr(&self) -> SocketAddrV4 {
        let port = match self {
            Self::Relay(_) => DHCP_SERVER_PORT,
            Self::Unicast(_) | Self::Broadcast => DHCP_CLIENT_PORT,
        };
        SocketAddrV4::new(self.address(), port)
    }
}

/// An outbound reply, built fresh for each request.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message_type: MessageType,
    pub htype: u8,
    pub hlen: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; CHADDR_SIZE],
    /// Message type first, server identifier second, then the rest.
    pub options: Vec<DhcpOption>,
    pub destination: Destination,
}

impl Reply {
    /// Exact number of bytes the serialized reply occupies.
    pub fn encoded_len(&self) -> usize {
        DHCP_FIXED_HEADER_SIZE
            + self
                .options
                .iter()
                .map(DhcpOption::encoded_len)
                .sum::<usize>()
            + 1
    }

    /// Serializes into `buffer`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooSmall`] without touching `buffer` if it
    /// cannot hold [`encoded_len`](Self::encoded_len) bytes.
    pub fn write_to(&self, buffer: &mut [u8]) -> Result<usize> {
        let required = self.encoded_len();
        if buffer.len() < required {
            return Err(Error::BufferTooSmall {
                required,
                available: buffer.len(),
            });
        }
        self.write_unchecked(&mut buffer[..required]);
        Ok(required)
    }

    /// Serializes into a freshly allocated, exactly sized buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.encoded_len()];
        self.write_unchecked(&mut buffer);
        buffer
    }

    fn write_unchecked(&self, packet: &mut [u8]) {
        packet.fill(0);

        packet[OP_OFFSET] = BOOTREPLY;
        packet[HTYPE_OFFSET] = self.htype;
        packet[HLEN_OFFSET] = self.hlen;
        packet[XID_OFFSET..XID_OFFSET + 4].copy_from_slice(&self.xid.to_be_bytes());
        packet[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&self.flags.to_be_bytes());
        packet[CIADDR_OFFSET..CIADDR_OFFSET + 4].copy_from_slice(&self.ciaddr.octets());
        packet[YIADDR_OFFSET..YIADDR_OFFSET + 4].copy_from_slice(&self.yiaddr.octets());
        packet[SIADDR_OFFSET..SIADDR_OFFSET + 4].copy_from_slice(&self.siaddr.octets());
        packet[GIADDR_OFFSET..GIADDR_OFFSET + 4].copy_from_slice(&self.giaddr.octets());
        packet[CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_SIZE].copy_from_slice(&self.chaddr);
        packet[MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE].copy_from_slice(&DHCP_MAGIC_COOKIE);

        let mut index = DHCP_FIXED_HEADER_SIZE;
        for option in &self.options {
            let encoded = option.encode();
            packet[index..index + encoded.len()].copy_from_slice(&encoded);
            index += encoded.len();
        }
        packet[index] = OptionCode::End as u8;
    }
}

/// Builds a [`Reply`] to one request.
///
/// # Example
///
/// ```
/// use std::net::Ipv4Addr;
/// use dhcpcore::{DhcpOption, MessageType, ReplyBuilder, RequestView};
///
/// let mut datagram = vec![0u8; 244];
/// datagram[0] = 1;
/// datagram[236..240].copy_from_slice(&[99, 130, 83, 99]);
/// datagram[240..243].copy_from_slice(&[53, 1, 1]);
/// datagram[243] = 255;
///
/// let request = RequestView::parse(&datagram).unwrap();
/// let offer = ReplyBuilder::new(&request, MessageType::Offer, Ipv4Addr::new(10, 0, 0, 1))
///     .your_ip(Ipv4Addr::new(10, 0, 0, 50))
///     .option(DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
///     .build();
/// assert_eq!(offer.encode().len(), 240 + 3 + 6 + 6 + 1);
/// ```
#[derive(Debug, Clone)]
pub struct ReplyBuilder {
    reply: Reply,
}

impl ReplyBuilder {
    pub fn new(request: &RequestView<'_>, message_type: MessageType, server_ip: Ipv4Addr) -> Self {
        Self {
            reply: Reply {
                message_type,
                htype: request.htype(),
                hlen: request.hlen(),
                xid: request.xid(),
                flags: request.flags(),
                ciaddr: Ipv4Addr::UNSPECIFIED,
                yiaddr: Ipv4Addr::UNSPECIFIED,
                siaddr: server_ip,
                giaddr: request.giaddr(),
                chaddr: request.chaddr(),
                options: vec![
                    DhcpOption::MessageType(message_type),
                    DhcpOption::ServerIdentifier(server_ip),
                ],
                destination: Destination::for_reply(request, message_type),
            },
        }
    }

    /// Sets `yiaddr`, the address being handed to the client.
    pub fn your_ip(mut self, ip: Ipv4Addr) -> Self {
        self.reply.yiaddr = ip;
        self
    }

    /// Sets `ciaddr`.
    pub fn client_ip(mut self, ip: Ipv4Addr) -> Self {
        self.reply.ciaddr = ip;
        self
    }

    pub fn option(mut self, option: DhcpOption) -> Self {
        self.reply.options.push(option);
        self
    }

    pub fn build(self) -> Reply {
        self.reply
    }
}
