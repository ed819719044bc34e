//! Process entrypoint: argument parsing and the composition root that wires
//! configuration, shared state, and the DNS/relay tasks together.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::address_map::AddressMap;
use crate::affinity::{self, ClientAffinityCache};
use crate::config::Config;
use crate::dns::DnsResponder;
use crate::policy::InterceptPolicy;
use crate::relay::MitmRelay;

#[derive(Debug, Parser)]
#[command(version, about = "Selective transparent interception appliance")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long = "config", default_value = "config.json")]
    pub config_path: PathBuf,

    /// Force debug-level logging regardless of the config file's DEBUG flag.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    pub async fn run(self) -> std::io::Result<()> {
        let config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!(
                    "warning: failed to load {}: {} (falling back to defaults)",
                    self.config_path.display(),
                    err
                );
                Config::default()
            }
        };

        init_logging(self.verbose || config.debug);

        let policy = Arc::new(InterceptPolicy::new(config.intercepts.clone()));
        let address_map = Arc::new(AddressMap::new());
        let affinity = Arc::new(ClientAffinityCache::new());

        let dns_listen: SocketAddr = normalize_bind_addr(&config.dns_port)
            .parse()
            .map_err(|_| invalid_data("DNS_PORT is not a valid bind address"))?;
        let upstream: SocketAddr = config
            .upstream_dns
            .parse()
            .map_err(|_| invalid_data("UPSTREAM_DNS is not a valid address"))?;
        let external_address = config.external_ipv4().unwrap_or_else(|| {
            log::error!(
                "EXTERNAL_ADDRESS {:?} is not a valid IPv4 address, falling back to 0.0.0.0",
                config.external_address
            );
            Ipv4Addr::UNSPECIFIED
        });

        let dns = Arc::new(DnsResponder::new(
            upstream,
            external_address,
            Arc::clone(&policy),
            Arc::clone(&address_map),
        ));
        let relay = Arc::new(MitmRelay::new(
            Arc::clone(&policy),
            Arc::clone(&address_map),
            Arc::clone(&affinity),
            Arc::clone(&dns),
        ));

        let reaper_affinity = Arc::clone(&affinity);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(affinity::REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = reaper_affinity.reap();
                if removed > 0 {
                    log::info!("affinity reaper removed {} expired entries", removed);
                }
            }
        });

        let mut relay_handles = Vec::new();
        for port in &config.relay_ports {
            let relay = Arc::clone(&relay);
            let port = *port;
            relay_handles.push(tokio::spawn(async move {
                if let Err(err) = relay.serve(port).await {
                    log::error!("relay on :{} exited: {}", port, err);
                }
            }));
        }

        log::info!("tvwarden starting: dns on {}, relay ports {:?}", dns_listen, config.relay_ports);

        let result = tokio::select! {
            result = dns.serve(dns_listen) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("received shutdown signal");
                Ok(())
            }
        };

        for handle in relay_handles {
            handle.abort();
        }

        result
    }
}

fn invalid_data(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

/// Accept the config file's historical `":53"` shorthand for "bind all
/// interfaces" alongside a fully qualified `host:port` address.
fn normalize_bind_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}
