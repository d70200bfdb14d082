//! DNS-based peer discovery for the Bitcoin network

use std::net::{IpAddr, SocketAddr};

use futures::future::join_all;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;

use crate::params::NetworkParams;

/// DNS discovery for finding initial peers
pub struct DnsDiscovery {
    resolver: TokioResolver,
}

impl DnsDiscovery {
    pub fn new() -> Self {
        let resolver = hickory_resolver::Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .with_options(ResolverOpts::default())
        .build();

        Self {
            resolver,
        }
    }

    /// Resolve the DNS seeds of `params` concurrently, on the default port.
    pub async fn discover_peers(&self, params: &NetworkParams) -> Vec<SocketAddr> {
        if params.dns_seeds.is_empty() {
            tracing::debug!("No DNS seeds for {:?} network", params.network);
            return vec![];
        }

        let lookups = params.dns_seeds.iter().map(|seed| async move {
            tracing::debug!("Querying DNS seed: {}", seed);
            (seed, self.resolver.lookup_ip(seed.as_str()).await)
        });

        let mut addresses = Vec::new();
        for (seed, result) in join_all(lookups).await {
            match result {
                Ok(lookup) => {
                    let ips: Vec<IpAddr> = lookup.iter().collect();
                    tracing::info!("DNS seed {} returned {} addresses", seed, ips.len());
                    addresses.extend(ips.into_iter().map(|ip| SocketAddr::new(ip, params.default_port)));
                }
                Err(e) => {
                    tracing::warn!("Failed to resolve DNS seed {}: {}", seed, e);
                }
            }
        }

        addresses.sort();
        addresses.dedup();

        tracing::info!("Discovered {} unique peer addresses from DNS seeds", addresses.len());
        addresses
    }
}

impl Default for DnsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}
