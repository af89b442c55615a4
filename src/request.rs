//! Zero-copy view over an inbound DHCP datagram (RFC 2131 §2).
//!
//! The first 236 bytes are the BOOTP header, then the magic cookie, then
//! options. [`RequestView`] validates the header and walks the options once
//! to capture the four values the server acts on. Header fields are read on
//! demand from the borrowed buffer.
//!
//! ```text
//! offset  field    size
//!      0  op          1   BOOTREQUEST = 1
//!      1  htype       1
//!      2  hlen        1
//!      3  hops        1   > 16 is dropped
//!      4  xid         4
//!      8  secs        2
//!     10  flags       2
//!     12  ciaddr      4
//!     16  yiaddr      4
//!     20  siaddr      4
//!     24  giaddr      4
//!     28  chaddr     16
//!     44  sname      64
//!    108  file      128
//!    236  cookie      4   99.130.83.99
//!    240  options     *
//! ```

use std::fmt::Write;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::client_id::ClientIdentifier;
use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode, RawOptions};

pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

pub(crate) const OP_OFFSET: usize = 0;
pub(crate) const HTYPE_OFFSET: usize = 1;
pub(crate) const HLEN_OFFSET: usize = 2;
pub(crate) const HOPS_OFFSET: usize = 3;
pub(crate) const XID_OFFSET: usize = 4;
pub(crate) const FLAGS_OFFSET: usize = 10;
pub(crate) const CIADDR_OFFSET: usize = 12;
pub(crate) const YIADDR_OFFSET: usize = 16;
pub(crate) const SIADDR_OFFSET: usize = 20;
pub(crate) const GIADDR_OFFSET: usize = 24;
pub(crate) const CHADDR_OFFSET: usize = 28;
pub(crate) const CHADDR_SIZE: usize = 16;
pub(crate) const SNAME_SIZE: usize = 64;
pub(crate) const FILE_SIZE: usize = 128;

pub(crate) const MAGIC_COOKIE_OFFSET: usize = CHADDR_OFFSET + CHADDR_SIZE + SNAME_SIZE + FILE_SIZE;

/// Header plus cookie; the smallest datagram accepted.
pub const DHCP_FIXED_HEADER_SIZE: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Relay loop limit (RFC 1542 §4.1.1).
const MAX_HOPS: u8 = 16;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn read_address(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::from(read_u32(data, offset))
}

/// A classified client request borrowing the datagram it was parsed from.
///
/// Lives only as long as the handling of that one datagram.
#[derive(Debug, Clone)]
pub struct RequestView<'a> {
    data: &'a [u8],
    message_type: MessageType,
    client_id: &'a [u8],
    requested_ip: Ipv4Addr,
    server_identifier: Ipv4Addr,
}

impl<'a> RequestView<'a> {
    /// Parses and classifies a raw datagram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when the datagram is shorter than
    /// [`DHCP_FIXED_HEADER_SIZE`], lacks the magic cookie, is not a
    /// BOOTREQUEST, or has travelled more than 16 relay hops.
    ///
    /// A malformed option is not an error: the scan stops there and the
    /// values found before it are kept.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        if data[MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket(format!(
                "bad magic cookie {:?}",
                &data[MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE]
            )));
        }

        if data[OP_OFFSET] != BOOTREQUEST {
            return Err(Error::InvalidPacket(format!(
                "op {} is not a client request",
                data[OP_OFFSET]
            )));
        }

        if data[HOPS_OFFSET] > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "relayed {} times",
                data[HOPS_OFFSET]
            )));
        }

        let mut message_type = None;
        let mut client_id = None;
        let mut requested_ip = None;
        let mut server_identifier = None;

        let mut options = RawOptions::new(&data[DHCP_FIXED_HEADER_SIZE..]);
        for (code, value) in options.by_ref() {
            let wanted = matches!(
                OptionCode::try_from(code),
                Ok(OptionCode::MessageType
                    | OptionCode::RequestedIpAddress
                    | OptionCode::ServerIdentifier)
            );

            if code == OptionCode::ClientIdentifier as u8 {
                if client_id.is_none() && !value.is_empty() {
                    client_id = Some(value);
                }
            } else if wanted {
                match DhcpOption::parse(code, value) {
                    Ok(DhcpOption::MessageType(kind)) => {
                        message_type.get_or_insert(kind);
                    }
                    Ok(DhcpOption::RequestedIpAddress(ip)) => {
                        requested_ip.get_or_insert(ip);
                    }
                    Ok(DhcpOption::ServerIdentifier(ip)) => {
                        server_identifier.get_or_insert(ip);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!("Stopping option scan at code {}: {}", code, error);
                        break;
                    }
                }
            }
        }

        if options.is_truncated() {
            debug!("Truncated option area from {:02x?}", &data[CHADDR_OFFSET..CHADDR_OFFSET + 6]);
        }

        Ok(Self {
            data,
            message_type: message_type.unwrap_or(MessageType::Invalid),
            client_id: client_id
                .unwrap_or(&data[CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_SIZE]),
            requested_ip: requested_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            server_identifier: server_identifier.unwrap_or(Ipv4Addr::UNSPECIFIED),
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Option 61 if present and non-empty, else all 16 bytes of `chaddr`.
    pub fn client_id_bytes(&self) -> &'a [u8] {
        self.client_id
    }

    pub fn client_id(&self) -> ClientIdentifier {
        ClientIdentifier::new(self.client_id)
    }

    /// Option 50, `0.0.0.0` if absent.
    pub fn requested_ip(&self) -> Ipv4Addr {
        self.requested_ip
    }

    /// Option 54, `0.0.0.0` if absent.
    pub fn server_identifier(&self) -> Ipv4Addr {
        self.server_identifier
    }

    pub fn htype(&self) -> u8 {
        self.data[HTYPE_OFFSET]
    }

    pub fn hlen(&self) -> u8 {
        self.data[HLEN_OFFSET]
    }

    pub fn xid(&self) -> u32 {
        read_u32(self.data, XID_OFFSET)
    }

    pub fn flags(&self) -> u16 {
        read_u16(self.data, FLAGS_OFFSET)
    }

    pub fn ciaddr(&self) -> Ipv4Addr {
        read_address(self.data, CIADDR_OFFSET)
    }

    pub fn giaddr(&self) -> Ipv4Addr {
        read_address(self.data, GIADDR_OFFSET)
    }

    pub fn chaddr(&self) -> [u8; CHADDR_SIZE] {
        let mut chaddr = [0u8; CHADDR_SIZE];
        chaddr.copy_from_slice(&self.data[CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_SIZE]);
        chaddr
    }

    /// First `hlen` bytes of `chaddr` in `aa:bb:cc` form, for logging.
    pub fn format_mac(&self) -> String {
        let hardware = &self.data[CHADDR_OFFSET..CHADDR_OFFSET + (self.hlen() as usize).min(CHADDR_SIZE)];
        hardware.iter().fold(String::with_capacity(hardware.len() * 3), |mut text, byte| {
            if !text.is_empty() {
                text.push(':');
            }
            let _ = write!(text, "{:02x}", byte);
            text
        })
    }
}
