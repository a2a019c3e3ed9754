//! Server configuration from the command line and environment.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use clap::Parser;

use crate::constants::{DEFAULT_BIND, DEFAULT_DATABASE};

#[derive(Debug, Clone, Parser)]
#[command(name = "todolog-server", version, about = "Todo server with a replicated change log")]
pub struct ServerConfig {
    /// SQLite database path (`:memory:` for a throwaway store).
    #[arg(long, env = "TODOLOG_DATABASE", default_value = DEFAULT_DATABASE)]
    pub database: String,

    /// Address to listen on.
    #[arg(long, env = "TODOLOG_BIND", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// Base URL of the upstream shape log service. Defaults to this server's
    /// own embedded service.
    #[arg(long, env = "TODOLOG_LOG_SERVICE_URL")]
    pub log_service_url: Option<String>,
}

impl ServerConfig {
    /// Upstream base URL, given the address the server actually bound.
    pub fn resolve_log_service_url(&self, local: SocketAddr) -> String {
        match &self.log_service_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => self_url(local),
        }
    }
}

/// A URL that reaches this process. Wildcard binds are reached over loopback.
fn self_url(local: SocketAddr) -> String {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(ip, local.port()))
}
