//! Transport configuration
//!
//! Everything tunable about connections lives in one immutable
//! [`TransportConfig`], built and validated through [`TransportConfigBuilder`].

use super::{Error, Result};
use crate::http::h2::settings::{MAX_FRAME_SIZE_LIMIT, MAX_WINDOW_SIZE};
use crate::http::h2::{ConnectionConfig, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use super::proxy::ProxyConfig;
use super::Destination;
use crate::http::tls::TlsConfig;
use std::time::Duration;

/// Which HTTP version a connection may speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersionPolicy {
    /// HTTP/2 when ALPN selects `h2`, HTTP/1.1 otherwise; cleartext
    /// connections use HTTP/1.1
    #[default]
    Negotiate,
    /// Never offer HTTP/2
    Http1Only,
    /// Speak HTTP/2 without negotiation, cleartext included
    Http2PriorKnowledge,
}

impl HttpVersionPolicy {
    /// Protocols to offer through ALPN, in preference order
    pub fn alpn_protocols(&self) -> &'static [&'static str] {
        match self {
            HttpVersionPolicy::Negotiate => &["h2", "http/1.1"],
            HttpVersionPolicy::Http1Only => &["http/1.1"],
            HttpVersionPolicy::Http2PriorKnowledge => &["h2"],
        }
    }
}

/// Connection and protocol settings shared by every connection of a
/// transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    ping_interval: Option<Duration>,
    ping_timeout: Duration,
    settings_timeout: Duration,
    acquire_timeout: Duration,
    stream_window: u32,
    connection_window: u32,
    max_frame_size: u32,
    header_table_size: u32,
    max_header_list_size: u32,
    max_concurrent_streams: u32,
    version_policy: HttpVersionPolicy,
    tls: Option<TlsConfig>,
    proxy: Option<ProxyConfig>,
    max_connections_per_route: usize,
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Bound on socket writes and on the TLS handshake
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    /// Bound on each wait for response headers or a body chunk
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    pub fn settings_timeout(&self) -> Duration {
        self.settings_timeout
    }

    /// How long to wait for a stream slot or a pooled connection
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn stream_window(&self) -> u32 {
        self.stream_window
    }

    pub fn connection_window(&self) -> u32 {
        self.connection_window
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn header_table_size(&self) -> u32 {
        self.header_table_size
    }

    pub fn max_header_list_size(&self) -> u32 {
        self.max_header_list_size
    }

    pub fn max_concurrent_streams(&self) -> u32 {
        self.max_concurrent_streams
    }

    pub fn version_policy(&self) -> HttpVersionPolicy {
        self.version_policy
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn max_connections_per_route(&self) -> usize {
        self.max_connections_per_route
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// The proxy connections to `destination` go through, if any
    pub fn proxy_for(&self, destination: &Destination) -> Option<&ProxyConfig> {
        self.proxy
            .as_ref()
            .filter(|proxy| !proxy.bypasses(destination.host()))
    }

    /// The HTTP/2 connection settings derived from this configuration
    pub fn h2_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            stream_window: self.stream_window,
            connection_window: self.connection_window,
            max_frame_size: self.max_frame_size,
            header_table_size: self.header_table_size,
            max_header_list_size: self.max_header_list_size,
            max_concurrent_streams: self.max_concurrent_streams,
            settings_timeout: self.settings_timeout,
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
            idle_timeout: self.idle_timeout,
            stream_acquire_timeout: self.acquire_timeout,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.stream_window > MAX_WINDOW_SIZE {
            return Err(Error::InvalidConfig(format!(
                "stream window {} exceeds {}",
                self.stream_window, MAX_WINDOW_SIZE
            )));
        }
        if !(DEFAULT_INITIAL_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.connection_window) {
            return Err(Error::InvalidConfig(format!(
                "connection window {} outside {}..={}",
                self.connection_window, DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE
            )));
        }
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&self.max_frame_size) {
            return Err(Error::InvalidConfig(format!(
                "max frame size {} outside {}..={}",
                self.max_frame_size, DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT
            )));
        }
        if self.max_concurrent_streams == 0 {
            return Err(Error::InvalidConfig(
                "max concurrent streams must be at least 1".to_string(),
            ));
        }
        if self.max_connections_per_route == 0 {
            return Err(Error::InvalidConfig(
                "max connections per route must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("connect timeout must not be zero".to_string()));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidConfig("request timeout must not be zero".to_string()));
        }
        if self.tls.as_ref().is_some_and(|tls| tls.is_server) {
            return Err(Error::InvalidConfig(
                "a server TLS configuration cannot open connections".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let h2 = ConnectionConfig::default();
        TransportConfig {
            connect_timeout: Duration::from_secs(10),
            io_timeout: Some(Duration::from_secs(30)),
            request_timeout: None,
            idle_timeout: h2.idle_timeout,
            ping_interval: h2.ping_interval,
            ping_timeout: h2.ping_timeout,
            settings_timeout: h2.settings_timeout,
            acquire_timeout: h2.stream_acquire_timeout,
            stream_window: h2.stream_window,
            connection_window: h2.connection_window,
            max_frame_size: h2.max_frame_size,
            header_table_size: h2.header_table_size,
            max_header_list_size: h2.max_header_list_size,
            max_concurrent_streams: h2.max_concurrent_streams,
            version_policy: HttpVersionPolicy::Negotiate,
            tls: None,
            proxy: None,
            max_connections_per_route: 8,
        }
    }
}

/// Builder for [`TransportConfig`]
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        TransportConfigBuilder::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Send a PING after this much read silence; `None` disables keepalive
    pub fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.ping_interval = interval;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    pub fn settings_timeout(mut self, timeout: Duration) -> Self {
        self.config.settings_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    pub fn stream_window(mut self, size: u32) -> Self {
        self.config.stream_window = size;
        self
    }

    pub fn connection_window(mut self, size: u32) -> Self {
        self.config.connection_window = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config.header_table_size = size;
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.max_header_list_size = size;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    pub fn version_policy(mut self, policy: HttpVersionPolicy) -> Self {
        self.config.version_policy = policy;
        self
    }

    /// TLS settings for `https` destinations; system trust roots otherwise
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Route connections through an HTTP proxy
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    pub fn max_connections_per_route(mut self, max: usize) -> Self {
        self.config.max_connections_per_route = max;
        self
    }

    pub fn build(self) -> Result<TransportConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
