//! Request classification and allocation (RFC 2131 §4.3).
//!
//! [`DhcpEngine::handle`] takes one raw datagram and returns the reply to
//! send, if any. It performs no I/O and never blocks beyond the lease table
//! lock, which is held across the whole lookup-or-allocate sequence of one
//! request.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{info, warn};

use crate::client_id::ClientIdentifier;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{Clock, Lease, LeaseTable, LeaseTableGuard, SystemClock};
use crate::options::{DhcpOption, MessageType};
use crate::reply::{Reply, ReplyBuilder};
use crate::request::RequestView;

/// The contiguous address range `[min_address, max_address)` handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    first: u32,
    size: u32,
}

impl Pool {
    /// Derives the pool from a validated configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            first: u32::from(config.pool_first()),
            size: config.pool_size,
        }
    }

    pub fn min_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.first)
    }

    /// One past the last pool address.
    pub fn max_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.first.wrapping_add(self.size))
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= self.first && u64::from(addr - self.first) < u64::from(self.size)
    }

    /// Address at `index`, wrapping modulo the pool size.
    pub fn address_at(&self, index: u64) -> Ipv4Addr {
        let offset = (index % u64::from(self.size)) as u32;
        Ipv4Addr::from(self.first + offset)
    }
}

/// The DHCP server core: pool bounds, lease table and allocation cursor.
pub struct DhcpEngine<C: Clock = SystemClock> {
    config: Config,
    pool: Pool,
    leases: LeaseTable,
    /// Next pool index the scan starts from. Only touched under the table lock.
    cursor: AtomicU32,
    clock: C,
}

impl DhcpEngine<SystemClock> {
    /// Creates an engine driven by the wall clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration fails validation.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> DhcpEngine<C> {
    /// Creates an engine that reads time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration fails validation.
    pub fn with_clock(config: Config, clock: C) -> Result<Self> {
        config.validate()?;
        let pool = Pool::from_config(&config);
        Ok(Self {
            config,
            pool,
            leases: LeaseTable::new(),
            cursor: AtomicU32::new(0),
            clock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Loads saved leases, discarding any outside the current pool.
    ///
    /// Each identifier keeps only its latest-expiring lease. Returns the
    /// number of leases kept.
    pub fn restore_leases(&self, leases: Vec<Lease>) -> usize {
        let total = leases.len();
        let in_pool: Vec<Lease> = leases
            .into_iter()
            .filter(|lease| self.pool.contains(lease.address))
            .collect();
        if in_pool.len() < total {
            warn!(
                "Discarded {} saved leases outside pool {} - {}",
                total - in_pool.len(),
                self.pool.min_address(),
                self.pool.max_address()
            );
        }

        let mut latest: HashMap<&ClientIdentifier, u64> = HashMap::new();
        for lease in &in_pool {
            let expiration = latest.entry(&lease.id).or_insert(lease.expiration);
            *expiration = (*expiration).max(lease.expiration);
        }

        let mut seen: HashSet<ClientIdentifier> = HashSet::new();
        let mut kept = Vec::with_capacity(latest.len());
        for lease in &in_pool {
            if latest.get(&lease.id) == Some(&lease.expiration) && seen.insert(lease.id.clone()) {
                kept.push(lease.clone());
            }
        }
        if kept.len() < in_pool.len() {
            warn!(
                "Discarded {} superseded saved leases",
                in_pool.len() - kept.len()
            );
        }

        self.leases.restore(kept)
    }

    /// Handles one inbound datagram.
    ///
    /// Returns `Ok(Some(reply))` when a reply must be sent and `Ok(None)` for
    /// requests that are accepted silently.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPacket`] if the datagram is malformed
    /// - [`Error::PoolExhausted`] if a DISCOVER finds no free address
    ///
    /// Neither leaves a trace in the lease table.
    pub fn handle(&self, datagram: &[u8]) -> Result<Option<Reply>> {
        let request = RequestView::parse(datagram)?;
        let message_type = request.message_type();

        info!("{} from {}", message_type, request.format_mac());

        match message_type {
            MessageType::Discover => self.handle_discover(&request).map(Some),
            MessageType::Request => Ok(self.handle_request(&request)),
            MessageType::Decline => {
                warn!(
                    "DECLINE from {} for {}",
                    request.format_mac(),
                    request.requested_ip()
                );
                Ok(None)
            }
            MessageType::Release => {
                info!("RELEASE from {} for {}", request.format_mac(), request.ciaddr());
                Ok(None)
            }
            MessageType::Inform => Ok(None),
            _ => {
                warn!("Ignoring {} message", message_type);
                Ok(None)
            }
        }
    }

    fn handle_discover(&self, request: &RequestView<'_>) -> Result<Reply> {
        let mac = request.format_mac();
        let client_id = request.client_id();
        let now = self.clock.now();

        let offered_ip = {
            let mut leases = self.leases.lock();
            match self.allocate(&mut leases, &client_id, request.requested_ip(), now) {
                Ok(ip) => ip,
                Err(error) => {
                    warn!("Pool exhausted, cannot offer IP to {}", mac);
                    return Err(error);
                }
            }
        };

        let offer = ReplyBuilder::new(request, MessageType::Offer, self.config.server_ip)
            .your_ip(offered_ip);
        let offer = self.with_network_options(offer).build();

        info!("OFFER {} to {}", offered_ip, mac);

        Ok(offer)
    }

    /// Picks an address for `client_id`, in priority order: its current
    /// lease, the address it asked for, then the next free pool address.
    fn allocate(
        &self,
        leases: &mut LeaseTableGuard<'_>,
        client_id: &ClientIdentifier,
        requested_ip: Ipv4Addr,
        now: u64,
    ) -> Result<Ipv4Addr> {
        let expiration = self.expiration_from(now);

        if let Some(lease) = leases.find_by_id(client_id)
            && !lease.is_expired(now)
        {
            return Ok(lease.address);
        }

        if !requested_ip.is_unspecified()
            && self.pool.contains(requested_ip)
            && claim(leases, client_id, requested_ip, expiration, now)
        {
            return Ok(requested_ip);
        }

        let start = u64::from(self.cursor.load(Ordering::Relaxed));
        let size = u64::from(self.pool.size());
        for step in 0..size {
            let index = (start + step) % size;
            let candidate = self.pool.address_at(index);

            if claim(leases, client_id, candidate, expiration, now) {
                self.cursor
                    .store(((index + 1) % size) as u32, Ordering::Relaxed);
                return Ok(candidate);
            }
        }

        Err(Error::PoolExhausted)
    }

    fn handle_request(&self, request: &RequestView<'_>) -> Option<Reply> {
        let mac = request.format_mac();
        let server_id = request.server_identifier();

        if !server_id.is_unspecified() && server_id != self.config.server_ip {
            info!("REQUEST from {} is for different server {}", mac, server_id);
            return None;
        }

        let client_id = request.client_id();
        let now = self.clock.now();
        let expiration = self.expiration_from(now);

        // A requested address must match the lease; without one (RENEWING,
        // REBINDING) the lease address is confirmed.
        let requested_ip = request.requested_ip();
        let outcome = if server_id.is_unspecified() {
            Err("no server identifier")
        } else {
            let mut leases = self.leases.lock();
            match leases.find_by_id(&client_id) {
                None => Err("no lease for client"),
                Some(lease) if !requested_ip.is_unspecified() && requested_ip != lease.address => {
                    Err("requested address not leased to client")
                }
                Some(lease) => {
                    lease.expiration = expiration;
                    Ok(lease.address)
                }
            }
        };

        let acked_ip = match outcome {
            Ok(ip) => ip,
            Err(reason) => {
                warn!("NAK to {}: {}", mac, reason);
                return Some(
                    ReplyBuilder::new(request, MessageType::Nak, self.config.server_ip).build(),
                );
            }
        };

        let ack = ReplyBuilder::new(request, MessageType::Ack, self.config.server_ip)
            .client_ip(acked_ip)
            .your_ip(acked_ip);
        let ack = self.with_network_options(ack).build();

        info!(
            "ACK {} to {} (lease: {} seconds)",
            acked_ip, mac, self.config.lease_duration_seconds
        );

        Some(ack)
    }

    fn with_network_options(&self, builder: ReplyBuilder) -> ReplyBuilder {
        let mut builder = builder
            .option(DhcpOption::SubnetMask(self.config.subnet_mask))
            .option(DhcpOption::LeaseTime(self.config.lease_duration_seconds));

        if let Some(router) = self.config.router {
            builder = builder.option(DhcpOption::Router(vec![router]));
        }

        if !self.config.dns_servers.is_empty() {
            builder = builder.option(DhcpOption::DnsServer(self.config.dns_servers.clone()));
        }

        builder
    }

    fn expiration_from(&self, now: u64) -> u64 {
        now.saturating_add(u64::from(self.config.lease_duration_seconds))
    }
}

/// Binds `address` to `client_id` if no unexpired lease holds it. An expired
/// lease at the address is rebound in place.
fn claim(
    leases: &mut LeaseTableGuard<'_>,
    client_id: &ClientIdentifier,
    address: Ipv4Addr,
    expiration: u64,
    now: u64,
) -> bool {
    if !leases.is_free(address, now) {
        return false;
    }

    match leases.find_by_address(address) {
        Some(lease) => {
            lease.id = client_id.clone();
            lease.expiration = expiration;
        }
        None => {
            leases.create(client_id.clone(), address, expiration);
        }
    }
    true
}
