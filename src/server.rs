//! UDP transport feeding datagrams to the [`DhcpEngine`].
//!
//! Datagrams are handled one at a time: each is parsed, answered and sent
//! before the next `recv_from`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::DhcpEngine;
use crate::error::{Error, Result};
use crate::reply::{DHCP_SERVER_PORT, Reply};

const RECV_BUFFER_SIZE: usize = 1500;
const SEND_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    engine: DhcpEngine,
    socket: UdpSocket,
}

impl DhcpServer {
    /// Builds the engine and binds the server socket.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a bad configuration and
    /// [`Error::Socket`] if the socket cannot be set up.
    pub fn new(config: Config) -> Result<Self> {
        let engine = DhcpEngine::new(config)?;
        let socket = Self::create_socket(engine.config())?;

        let pool = engine.pool();
        info!(
            "DHCP server starting on {}:{}",
            engine.config().server_ip,
            DHCP_SERVER_PORT
        );
        info!(
            "IP pool: {} - {} ({} addresses)",
            pool.min_address(),
            pool.max_address(),
            pool.size()
        );

        Ok(Self { engine, socket })
    }

    fn create_socket(config: &Config) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        if let Some(interface) = config.interface.as_deref() {
            bind_to_interface(&socket, interface)?;
        }

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => match self.handle_datagram(&buffer[..size]).await {
                    Ok(()) => {}
                    Err(Error::InvalidPacket(reason)) => {
                        debug!("Dropped datagram from {}: {}", source, reason);
                    }
                    Err(error) => {
                        warn!("Error handling packet from {}: {}", source, error);
                    }
                },
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8]) -> Result<()> {
        if let Some(reply) = self.engine.handle(data)? {
            self.send_reply(&reply).await?;
        }
        Ok(())
    }

    async fn send_reply(&self, reply: &Reply) -> Result<()> {
        let mut buffer = [0u8; SEND_BUFFER_SIZE];
        let size = reply.write_to(&mut buffer)?;

        let destination = SocketAddr::V4(reply.destination.socket_addr());
        self.socket.send_to(&buffer[..size], destination).await?;

        debug!(
            "Sent {} ({} bytes) to {}",
            reply.message_type, size, destination
        );

        Ok(())
    }

    pub fn engine(&self) -> &DhcpEngine {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        self.engine.config()
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_to_interface(socket: &Socket, interface: &str) -> Result<()> {
    socket.bind_device(Some(interface.as_bytes())).map_err(|error| {
        Error::Socket(format!("Failed to bind to device {}: {}", interface, error))
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_to_interface(_socket: &Socket, interface: &str) -> Result<()> {
    warn!(
        "interface ({}) is only supported on Linux and will be ignored",
        interface
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_id::ClientIdentifier;
    use crate::options::{DhcpOption, MessageType, OptionCode};
    use crate::request::{BOOTREQUEST, DHCP_MAGIC_COOKIE, HLEN_ETHERNET, HTYPE_ETHERNET};

    #[test]
    fn test_constants() {
        assert_eq!(DHCP_SERVER_PORT, 67);
        assert_eq!(RECV_BUFFER_SIZE, 1500);
        assert_eq!(SEND_BUFFER_SIZE, 1500);
    }

    fn test_config() -> Config {
        Config {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: 100,
            pool_size: 101,
            router: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
            lease_duration_seconds: 3600,
            interface: None,
        }
    }

    fn create_dhcp_packet(
        message_type: MessageType,
        mac: [u8; 6],
        xid: u32,
        giaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Vec<u8> {
        let mut packet = vec![0u8; 300];

        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet[24..28].copy_from_slice(&giaddr.octets());
        packet[28..34].copy_from_slice(&mac);
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        let mut index = 240;
        packet[index] = OptionCode::MessageType as u8;
        packet[index + 1] = 1;
        packet[index + 2] = message_type as u8;
        index += 3;

        for option in options {
            let encoded = option.encode();
            packet[index..index + encoded.len()].copy_from_slice(&encoded);
            index += encoded.len();
        }

        packet[index] = OptionCode::End as u8;
        packet
    }

    async fn create_test_server() -> DhcpServer {
        let engine = DhcpEngine::new(test_config()).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        DhcpServer { engine, socket }
    }

    fn is_network_error(err: &Error) -> bool {
        matches!(err, Error::Io(_))
    }

    #[tokio::test]
    async fn test_relayed_discover_is_answered() {
        let server = create_test_server().await;
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

        let packet = create_dhcp_packet(
            MessageType::Discover,
            mac,
            0x12345678,
            Ipv4Addr::LOCALHOST,
            vec![],
        );
        let result = server.handle_datagram(&packet).await;
        assert!(result.is_ok() || result.as_ref().err().map(is_network_error).unwrap_or(false));

        let mut client_id = mac.to_vec();
        client_id.resize(16, 0);
        let mut leases = server.engine().leases().lock();
        let lease = leases.find_by_id(&ClientIdentifier::new(&client_id)).unwrap();
        assert!(server.config().ip_in_pool(lease.address));
    }

    #[tokio::test]
    async fn test_broadcast_reply_send_errors_are_reported() {
        let server = create_test_server().await;
        let packet = create_dhcp_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02],
            1,
            Ipv4Addr::UNSPECIFIED,
            vec![],
        );

        // A loopback socket without SO_BROADCAST may refuse the send.
        let result = server.handle_datagram(&packet).await;
        assert!(result.is_ok() || result.as_ref().err().map(is_network_error).unwrap_or(false));
        assert_eq!(server.engine().leases().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_datagram_rejected() {
        let server = create_test_server().await;

        let result = server.handle_datagram(&[0u8; 10]).await;
        assert!(matches!(result, Err(Error::InvalidPacket(_))));
        assert!(server.engine().leases().is_empty());
    }

    #[tokio::test]
    async fn test_request_for_other_server_sends_nothing() {
        let server = create_test_server().await;
        let packet = create_dhcp_packet(
            MessageType::Request,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x03],
            1,
            Ipv4Addr::UNSPECIFIED,
            vec![DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 1, 2))],
        );

        assert!(server.handle_datagram(&packet).await.is_ok());
        assert!(server.engine().leases().is_empty());
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_an_error() {
        let config = Config {
            pool_size: 1,
            ..test_config()
        };
        let server = DhcpServer {
            engine: DhcpEngine::new(config).unwrap(),
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        };

        for (index, last) in [0x10u8, 0x11].into_iter().enumerate() {
            let packet = create_dhcp_packet(
                MessageType::Discover,
                [0xaa, 0xbb, 0xcc, 0xdd, 0xee, last],
                index as u32,
                Ipv4Addr::LOCALHOST,
                vec![],
            );
            let result = server.handle_datagram(&packet).await;
            if index == 0 {
                assert!(result.is_ok() || result.as_ref().err().map(is_network_error).unwrap_or(false));
            } else {
                assert!(matches!(result, Err(Error::PoolExhausted)));
            }
        }
    }
}
