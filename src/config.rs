use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

pub struct RpcConfig {
    /// The address the service's UDP socket binds to. Port 0 picks an ephemeral port, which is
    ///  what a pure client wants.
    pub self_addr: SocketAddr,

    /// MTU handed to the ARQ engine. The engine segments everything it sends to fit into
    ///  datagrams of this size (including its own segment header).
    ///
    /// This is deliberately small: it has to survive tunnels and mobile networks without
    ///  IP-level fragmentation, and there is no path MTU discovery.
    pub mtu: usize,

    /// Interval between SYN retries while a connection attempt is pending. Retries are not
    ///  bounded - a connection attempt that never gets an ACK retries until it is closed.
    pub handshake_retry_interval: Duration,

    /// A connected channel that did not receive any datagram for longer than this is considered
    ///  dead. There is no keepalive ping, so the application has to keep traffic flowing.
    pub inactivity_timeout: Duration,

    /// Serialized payloads longer than this are compressed if that makes them strictly smaller
    pub compression_threshold: usize,

    /// Responses with an error code above this value are reported to the caller as failures
    pub rpc_error_threshold: u32,

    /// Incoming connection requests beyond this number of live sessions are dropped
    pub max_sessions: usize,

    /// Granularity of the service's update sweep
    pub tick_interval: Duration,

    /// Send and receive window of the ARQ engine, in segments
    pub kcp_window_size: u16,
}

impl RpcConfig {
    pub fn default_ipv4() -> RpcConfig {
        RpcConfig {
            self_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            mtu: 512,
            handshake_retry_interval: Duration::from_millis(200),
            inactivity_timeout: Duration::from_millis(20_000),
            compression_threshold: 100,
            rpc_error_threshold: 100,
            max_sessions: 10_000,
            tick_interval: Duration::from_millis(10),
            kcp_window_size: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 50 {
            bail!("MTU is too small");
        }
        if self.mtu > 1472 {
            bail!("MTU {} exceeds the UDP payload of a regular Ethernet frame", self.mtu);
        }
        if self.handshake_retry_interval.is_zero() {
            bail!("handshake retry interval must be positive");
        }
        if self.inactivity_timeout <= self.handshake_retry_interval {
            bail!("inactivity timeout must be longer than the handshake retry interval");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.kcp_window_size == 0 {
            bail!("window size must be positive");
        }
        Ok(())
    }

    pub fn effective_channel_config(&self) -> EffectiveChannelConfig {
        EffectiveChannelConfig {
            mtu: self.mtu,
            handshake_retry_millis: self.handshake_retry_interval.as_millis() as u64,
            inactivity_timeout_millis: self.inactivity_timeout.as_millis() as u64,
        }
    }
}

/// The part of the configuration a single channel needs, converted to the millisecond clock
///  channels run on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveChannelConfig {
    pub mtu: usize,
    pub handshake_retry_millis: u64,
    pub inactivity_timeout_millis: u64,
}

impl Default for EffectiveChannelConfig {
    fn default() -> Self {
        RpcConfig::default_ipv4().effective_channel_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        RpcConfig::default_ipv4().validate().unwrap();
    }

    #[test]
    fn test_effective_channel_config() {
        let effective = RpcConfig::default_ipv4().effective_channel_config();
        assert_eq!(effective, EffectiveChannelConfig {
            mtu: 512,
            handshake_retry_millis: 200,
            inactivity_timeout_millis: 20_000,
        });
    }

    #[rstest]
    #[case::mtu_too_small(|c: &mut RpcConfig| c.mtu = 20)]
    #[case::mtu_too_big(|c: &mut RpcConfig| c.mtu = 9000)]
    #[case::zero_retry(|c: &mut RpcConfig| c.handshake_retry_interval = Duration::ZERO)]
    #[case::timeout_below_retry(|c: &mut RpcConfig| c.inactivity_timeout = Duration::from_millis(100))]
    #[case::zero_tick(|c: &mut RpcConfig| c.tick_interval = Duration::ZERO)]
    #[case::zero_window(|c: &mut RpcConfig| c.kcp_window_size = 0)]
    fn test_validate_rejects(#[case] modify: fn(&mut RpcConfig)) {
        let mut config = RpcConfig::default_ipv4();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
