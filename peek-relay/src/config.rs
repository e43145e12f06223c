use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub upstream: SocketAddr,
    pub peek_bytes: usize,
    pub peek_timeout: Duration,
    pub connect_timeout: Duration,
    pub cnx_max_duration: Duration,
    pub proxy_protocol: bool,
}

pub fn parse_duration(arg: &str) -> Result<Duration, String> {
    duration_str::parse(arg).map_err(|err| err.to_string())
}
