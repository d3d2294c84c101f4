//! DNS resolution with the `DnsResolver` type.

use std::io;
use std::net::IpAddr;

use hickory_resolver::error::ResolveError;
use hickory_resolver::lookup_ip::LookupIp;

/// A DNS resolver backed by [hickory-dns](https://github.com/hickory-dns/hickory-dns).
pub struct DnsResolver {
    dns_resolver: hickory_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    async fn lookup(&self, host: &str) -> std::result::Result<LookupIp, ResolveError> {
        self.dns_resolver.lookup_ip(host).await
    }

    /// Resolves a name to its first address.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, io::Error> {
        self.resolve_all(host)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::other(format!("No address found for {}", host)))
    }

    /// Resolves a name to all of its addresses.
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>, io::Error> {
        let result = self
            .lookup(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup DNS: {}", err)))?;

        Ok(result.iter().collect())
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self {
            dns_resolver: hickory_resolver::AsyncResolver::tokio_from_system_conf()
                .expect("Failed to get DNS resolver"),
        }
    }
}
