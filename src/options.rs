//! Option codes and the typed option values this server reads and writes.
//!
//! Options follow the fixed header as `code(1) length(1) data(length)`
//! triples (RFC 2132 §2). Pad (0) and End (255) are single bytes.
//!
//! Two layers live here: [`RawOptions`] walks the options area of a datagram
//! without copying, and [`DhcpOption`] is the typed form used to decode the
//! few fixed-size options a request carries and to encode reply options.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Longest data field a single option can carry.
const MAX_OPTION_DATA: usize = u8::MAX as usize;

/// 255 data bytes hold at most 63 whole IPv4 addresses.
const MAX_ADDRESSES_PER_OPTION: usize = MAX_OPTION_DATA / 4;

/// Option codes understood by this server. Anything else decodes to
/// [`DhcpOption::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Single filler byte, no length.
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ClientIdentifier = 61,
    /// Terminates the options area, no length.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Pad,
            1 => Self::SubnetMask,
            3 => Self::Router,
            6 => Self::DnsServer,
            50 => Self::RequestedIpAddress,
            51 => Self::LeaseTime,
            53 => Self::MessageType,
            54 => Self::ServerIdentifier,
            61 => Self::ClientIdentifier,
            255 => Self::End,
            other => return Err(other),
        })
    }
}

/// Classification carried in option 53.
///
/// A request whose message type is missing, malformed or outside 1..=8 is
/// classified as [`Invalid`](Self::Invalid).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0,
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => Self::Invalid,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// Default gateway first.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ClientIdentifier(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn invalid_length(name: &str, length: usize) -> Error {
    Error::InvalidPacket(format!("{} option has invalid length {}", name, length))
}

fn fixed<const N: usize>(data: &[u8], name: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| invalid_length(name, data.len()))
}

fn address_list(data: &[u8], name: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(invalid_length(name, data.len()));
    }
    Ok(data
        .chunks_exact(4)
        .map(|octets| Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
        .collect())
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Decodes the data field of option `code`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when `data` has the wrong length for
    /// a known option, or when `code` is Pad or End (they carry no data).
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let code = match OptionCode::try_from(code) {
            Ok(code) => code,
            Err(unknown) => return Ok(Self::Unknown(unknown, data.to_vec())),
        };

        Ok(match code {
            OptionCode::SubnetMask => Self::SubnetMask(fixed::<4>(data, "subnet mask")?.into()),
            OptionCode::Router => Self::Router(address_list(data, "router")?),
            OptionCode::DnsServer => Self::DnsServer(address_list(data, "DNS server")?),
            OptionCode::RequestedIpAddress => {
                Self::RequestedIpAddress(fixed::<4>(data, "requested address")?.into())
            }
            OptionCode::LeaseTime => {
                Self::LeaseTime(u32::from_be_bytes(fixed::<4>(data, "lease time")?))
            }
            OptionCode::MessageType => {
                let [value] = fixed::<1>(data, "message type")?;
                Self::MessageType(MessageType::from(value))
            }
            OptionCode::ServerIdentifier => {
                Self::ServerIdentifier(fixed::<4>(data, "server identifier")?.into())
            }
            OptionCode::ClientIdentifier => Self::ClientIdentifier(data.to_vec()),
            OptionCode::Pad | OptionCode::End => {
                return Err(Error::InvalidPacket(format!(
                    "option code {} carries no data",
                    code as u8
                )));
            }
        })
    }

    /// Data field as it appears on the wire, clamped to what one option holds.
    fn payload(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(ip) | Self::RequestedIpAddress(ip) | Self::ServerIdentifier(ip) => {
                ip.octets().to_vec()
            }
            Self::Router(ips) | Self::DnsServer(ips) => ips
                .iter()
                .take(MAX_ADDRESSES_PER_OPTION)
                .flat_map(|ip| ip.octets())
                .collect(),
            Self::LeaseTime(seconds) => seconds.to_be_bytes().to_vec(),
            Self::MessageType(kind) => vec![*kind as u8],
            Self::ClientIdentifier(bytes) | Self::Unknown(_, bytes) => {
                bytes[..bytes.len().min(MAX_OPTION_DATA)].to_vec()
            }
        }
    }

    /// Encodes as `code, length, data`.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut encoded = Vec::with_capacity(2 + payload.len());
        encoded.push(self.option_code());
        encoded.push(payload.len() as u8);
        encoded.extend_from_slice(&payload);
        encoded
    }

    /// Number of bytes [`encode`](Self::encode) produces.
    pub fn encoded_len(&self) -> usize {
        let data = match self {
            Self::MessageType(_) => 1,
            Self::SubnetMask(_)
            | Self::RequestedIpAddress(_)
            | Self::ServerIdentifier(_)
            | Self::LeaseTime(_) => 4,
            Self::Router(ips) | Self::DnsServer(ips) => {
                4 * ips.len().min(MAX_ADDRESSES_PER_OPTION)
            }
            Self::ClientIdentifier(bytes) | Self::Unknown(_, bytes) => {
                bytes.len().min(MAX_OPTION_DATA)
            }
        };
        2 + data
    }
}

/// Zero-copy walk over an options area, yielding `(code, data)` pairs.
///
/// Pad bytes are skipped, the End tag stops the walk, and an option whose
/// length byte or data would run past the slice stops it too and marks the
/// walk as truncated. Nothing outside the slice is ever read.
#[derive(Debug, Clone)]
pub struct RawOptions<'a> {
    data: &'a [u8],
    index: usize,
    truncated: bool,
}

impl<'a> RawOptions<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            index: 0,
            truncated: false,
        }
    }

    /// True once the walk stopped on a malformed option.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn stop(&mut self, truncated: bool) -> Option<(u8, &'a [u8])> {
        self.index = self.data.len();
        self.truncated = truncated;
        None
    }
}

impl<'a> Iterator for RawOptions<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.data.len() {
            let code = self.data[self.index];

            if code == OptionCode::Pad as u8 {
                self.index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                return self.stop(false);
            }

            if self.index + 1 >= self.data.len() {
                return self.stop(true);
            }

            let length = self.data[self.index + 1] as usize;
            let start = self.index + 2;
            if start + length > self.data.len() {
                return self.stop(true);
            }

            self.index = start + length;
            return Some((code, &self.data[start..start + length]));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_byte() {
        let known: Vec<MessageType> = (1..=8u8).map(MessageType::from).collect();
        assert!(known.iter().zip(1..=8u8).all(|(kind, value)| *kind as u8 == value));
        for value in [0u8, 9, 42, 255] {
            assert_eq!(MessageType::from(value), MessageType::Invalid);
        }
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::Discover.to_string(), "DISCOVER");
        assert_eq!(MessageType::Nak.to_string(), "NAK");
        assert_eq!(MessageType::Invalid.as_str(), "INVALID");
    }

    #[test]
    fn test_reply_options_decode_to_same_value() {
        let cases = [
            DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 252, 0)),
            DhcpOption::Router(vec![Ipv4Addr::new(10, 0, 0, 254)]),
            DhcpOption::DnsServer(vec![Ipv4Addr::new(9, 9, 9, 9), Ipv4Addr::new(1, 0, 0, 1)]),
            DhcpOption::LeaseTime(7200),
            DhcpOption::MessageType(MessageType::Offer),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
        ];

        for option in cases {
            let wire = option.encode();
            assert_eq!(wire[0], option.option_code());
            assert_eq!(wire[1] as usize, wire.len() - 2);
            assert_eq!(wire.len(), option.encoded_len());
            assert_eq!(DhcpOption::parse(wire[0], &wire[2..]).unwrap(), option);
        }
    }

    #[test]
    fn test_lease_time_is_big_endian() {
        assert_eq!(DhcpOption::LeaseTime(0x0102_0304).encode(), vec![51, 4, 1, 2, 3, 4]);
        assert_eq!(
            DhcpOption::parse(51, &[0, 1, 81, 128]).unwrap(),
            DhcpOption::LeaseTime(86400)
        );
    }

    #[test]
    fn test_wrong_lengths_rejected() {
        let cases: [(u8, &[u8]); 7] = [
            (1, &[255, 255, 255]),
            (3, &[]),
            (6, &[8, 8, 8, 8, 8]),
            (50, &[10, 0, 0]),
            (51, &[0, 0, 0, 0, 0]),
            (53, &[]),
            (54, &[1, 2, 3, 4, 5]),
        ];
        for (code, data) in cases {
            assert!(
                matches!(DhcpOption::parse(code, data), Err(Error::InvalidPacket(_))),
                "code {} accepted {:?}",
                code,
                data
            );
        }
        assert!(DhcpOption::parse(0, &[]).is_err());
        assert!(DhcpOption::parse(255, &[]).is_err());
    }

    #[test]
    fn test_out_of_range_message_type_decodes_as_invalid() {
        assert_eq!(
            DhcpOption::parse(53, &[42]).unwrap(),
            DhcpOption::MessageType(MessageType::Invalid)
        );
    }

    #[test]
    fn test_unrecognised_code_kept_raw() {
        let option = DhcpOption::parse(82, &[1, 2, 3]).unwrap();
        assert_eq!(option, DhcpOption::Unknown(82, vec![1, 2, 3]));
        assert_eq!(option.encode(), vec![82, 3, 1, 2, 3]);
    }

    #[test]
    fn test_long_values_clamped() {
        let dns = DhcpOption::DnsServer(vec![Ipv4Addr::LOCALHOST; 64]);
        assert_eq!(dns.encode().len(), 2 + 252);
        assert_eq!(dns.encoded_len(), 2 + 252);

        let id = DhcpOption::ClientIdentifier(vec![7; 300]);
        assert_eq!(id.encode()[1], 255);
        assert_eq!(id.encoded_len(), 257);
    }

    #[test]
    fn test_raw_options_skip_pad_and_stop_at_end() {
        let data = [0, 0, 53, 1, 1, 0, 51, 4, 0, 0, 0, 60, 255, 54, 4, 1, 2, 3, 4];
        let mut raw = RawOptions::new(&data);
        assert_eq!(raw.next(), Some((53, &[1u8][..])));
        assert_eq!(raw.next(), Some((51, &[0u8, 0, 0, 60][..])));
        assert_eq!(raw.next(), None);
        assert!(!raw.is_truncated());
    }

    #[test]
    fn test_raw_options_truncated_data() {
        let data = [53, 1, 1, 61, 7, 1, 2];
        let mut raw = RawOptions::new(&data);
        assert_eq!(raw.next(), Some((53, &[1u8][..])));
        assert_eq!(raw.next(), None);
        assert!(raw.is_truncated());
        assert_eq!(raw.next(), None);
    }

    #[test]
    fn test_raw_options_missing_length() {
        let mut raw = RawOptions::new(&[51]);
        assert_eq!(raw.next(), None);
        assert!(raw.is_truncated());
    }

    #[test]
    fn test_raw_options_without_end_tag() {
        let collected: Vec<_> = RawOptions::new(&[53, 1, 3]).collect();
        assert_eq!(collected, vec![(53, &[3u8][..])]);
    }
}
