use anyhow::bail;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Configuration of a single receiver instance.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// The address the stream is received from. If this is an IP V4 multicast address, the
    ///  receiver joins the multicast group and listens on its port. Otherwise this is the
    ///  transmitter's command-and-control address, and the receiver registers itself as a
    ///  unicast target there.
    pub source_addr: SocketAddr,

    /// local address for the receive socket if the source is a unicast address
    pub unicast_bind_addr: SocketAddr,
    /// interface for joining the multicast group
    pub multicast_interface: Ipv4Addr,

    /// number of slots in the receive ring buffer; must be a power of two
    pub ring_buffer_capacity: usize,
    /// size of the receive buffer for a single datagram
    pub max_datagram_len: usize,

    /// time to wait for a retransmission before re-requesting a gap, or giving up on it if a
    ///  decoder is about to run dry
    pub gap_retry_timeout: Duration,
    /// a fast start burst is considered complete if the fast start gap did not change for
    ///  this long
    pub fast_start_settle_timeout: Duration,
    /// upper bound for the entire fast start phase
    pub fast_start_timeout: Duration,

    /// the receive pipeline is reset if no datagrams arrive for this long
    pub inactivity_timeout: Duration,
    /// a flow that did not receive data for this long is removed unless the transmitter
    ///  reports its program as active
    pub flow_expiry_timeout: Duration,
    /// interval for renewing unicast group membership with the transmitter
    pub membership_report_interval: Duration,
}

impl ReceiverConfig {
    pub fn new(source_addr: SocketAddr) -> ReceiverConfig {
        ReceiverConfig {
            source_addr,
            unicast_bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            ring_buffer_capacity: 1024,
            max_datagram_len: 1472,
            gap_retry_timeout: Duration::from_millis(75),
            fast_start_settle_timeout: Duration::from_millis(100),
            fast_start_timeout: Duration::from_millis(1000),
            inactivity_timeout: Duration::from_secs(10),
            flow_expiry_timeout: Duration::from_secs(5),
            membership_report_interval: Duration::from_secs(1),
        }
    }

    pub fn is_multicast(&self) -> bool {
        self.source_addr.ip().is_multicast()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.ring_buffer_capacity.is_power_of_two() {
            bail!("ring buffer capacity must be a power of two, was {}", self.ring_buffer_capacity);
        }
        if self.ring_buffer_capacity < 4 || self.ring_buffer_capacity > 0x8000 {
            bail!("ring buffer capacity must be between 4 and 32768, was {}", self.ring_buffer_capacity);
        }
        if let SocketAddr::V6(addr) = self.source_addr {
            bail!("only IP V4 sources are supported, was {}", addr);
        }
        if self.max_datagram_len < 100 {
            bail!("maximum datagram length is too small");
        }
        if self.gap_retry_timeout.is_zero() || self.fast_start_settle_timeout.is_zero() {
            bail!("gap timeouts must be positive");
        }
        if self.fast_start_timeout < self.fast_start_settle_timeout {
            bail!("fast start timeout must not be shorter than the fast start settle timeout");
        }
        Ok(())
    }
}

/// Configuration of the transmitter side: transmit groups, the command-and-control server and
///  the endpoint sender.
#[derive(Debug, Clone)]
pub struct TransmitterConfig {
    /// maximum size of the UDP payload. Packets are fragmented to fit, and the receivers must
    ///  support datagrams of this size.
    pub max_datagram_len: usize,

    pub retry_buffer_capacity: usize,
    /// sent datagrams are available for retransmission for this long
    pub retransmit_packet_ttl: Duration,
    pub retry_trim_interval: Duration,
    pub heartbeat_interval: Duration,

    /// groups without player clients are removed after this period
    pub group_linger_timeout: Duration,
    /// unicast targets must renew their membership within this period
    pub unicast_target_timeout: Duration,

    pub max_groups: usize,
    pub max_player_clients_per_group: usize,
    pub max_unicast_targets_per_group: usize,
    pub max_endpoints: usize,
}

impl TransmitterConfig {
    /// Largest number of programs (and therefore clients) a group or endpoint can serve: program
    ///  ids are 5 bit, and 0 is reserved for group-wide control packets
    pub const MAX_PROGRAM_ID: u8 = 31;

    /// Default configuration for IP V4 with end-to-end full Ethernet MTU and no optional headers
    pub fn default_ipv4() -> TransmitterConfig {
        TransmitterConfig {
            max_datagram_len: 1472,
            retry_buffer_capacity: 1024,
            retransmit_packet_ttl: Duration::from_secs(2),
            retry_trim_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            group_linger_timeout: Duration::from_secs(10),
            unicast_target_timeout: Duration::from_secs(10),
            max_groups: 16,
            max_player_clients_per_group: 8,
            max_unicast_targets_per_group: 16,
            max_endpoints: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_len < 100 {
            bail!("maximum datagram length is too small");
        }
        if self.retry_buffer_capacity == 0 || self.retry_buffer_capacity >= 0x8000 {
            bail!("retry buffer capacity must be between 1 and 32767, was {}", self.retry_buffer_capacity);
        }
        if self.max_player_clients_per_group == 0 || self.max_player_clients_per_group > Self::MAX_PROGRAM_ID as usize {
            bail!("a group can have between 1 and {} player clients", Self::MAX_PROGRAM_ID);
        }
        if self.heartbeat_interval.is_zero() || self.retry_trim_interval.is_zero() {
            bail!("maintenance intervals must be positive");
        }
        Ok(())
    }
}

/// Identifies a transmit group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// a unicast-only group that is reached through a fixed command-and-control port; 0 binds
    ///  an ephemeral port
    CncPort(u16),
    /// a group that sends to a multicast address, with an ephemeral command-and-control port
    Multicast(SocketAddrV4),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_receiver_default_is_valid() {
        ReceiverConfig::new(SocketAddr::from(([239, 0, 0, 1], 5000))).validate().unwrap();
    }

    #[rstest]
    #[case::not_power_of_two(|c: &mut ReceiverConfig| c.ring_buffer_capacity = 1000)]
    #[case::too_small(|c: &mut ReceiverConfig| c.ring_buffer_capacity = 2)]
    #[case::too_big(|c: &mut ReceiverConfig| c.ring_buffer_capacity = 0x10000)]
    #[case::ipv6(|c: &mut ReceiverConfig| c.source_addr = "[::1]:5000".parse().unwrap())]
    #[case::zero_gap_timeout(|c: &mut ReceiverConfig| c.gap_retry_timeout = Duration::ZERO)]
    #[case::fast_start(|c: &mut ReceiverConfig| c.fast_start_timeout = Duration::from_millis(1))]
    fn test_receiver_invalid(#[case] modify: fn(&mut ReceiverConfig)) {
        let mut config = ReceiverConfig::new(SocketAddr::from(([10, 0, 0, 1], 5000)));
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_multicast() {
        assert!(ReceiverConfig::new(SocketAddr::from(([239, 0, 0, 1], 5000))).is_multicast());
        assert!(!ReceiverConfig::new(SocketAddr::from(([10, 0, 0, 1], 5000))).is_multicast());
    }

    #[test]
    fn test_transmitter_default_is_valid() {
        TransmitterConfig::default_ipv4().validate().unwrap();
    }

    #[rstest]
    #[case::datagram(|c: &mut TransmitterConfig| c.max_datagram_len = 20)]
    #[case::retry_buffer(|c: &mut TransmitterConfig| c.retry_buffer_capacity = 0)]
    #[case::clients(|c: &mut TransmitterConfig| c.max_player_clients_per_group = 32)]
    #[case::heartbeat(|c: &mut TransmitterConfig| c.heartbeat_interval = Duration::ZERO)]
    fn test_transmitter_invalid(#[case] modify: fn(&mut TransmitterConfig)) {
        let mut config = TransmitterConfig::default_ipv4();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
