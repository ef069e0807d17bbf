//! GeoIP country resolution for the firewall stage.
//!
//! Wraps a MaxMind GeoLite2-Country database with an in-memory result
//! cache. Private and loopback addresses resolve to the configured server
//! country so LAN traffic is judged against the operator's own location.

use dashmap::DashMap;
use maxminddb::geoip2;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

/// Maps client IPs to ISO country codes
pub struct GeoIpResolver {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    cache: DashMap<IpAddr, String>,
    /// Country reported for private/loopback addresses and when no
    /// database is loaded
    server_country: String,
}

impl GeoIpResolver {
    /// Open the database at `path`, or run without one (every lookup then
    /// falls back to the server country)
    pub fn new(path: Option<&Path>, server_country: &str) -> Self {
        let reader = match path {
            Some(path) => match maxminddb::Reader::open_readfile(path) {
                Ok(reader) => {
                    debug!(path = %path.display(), "GeoIP database loaded");
                    Some(reader)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to open GeoIP database, lookups disabled");
                    None
                }
            },
            None => None,
        };

        Self {
            reader,
            cache: DashMap::new(),
            server_country: server_country.to_uppercase(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.reader.is_some()
    }

    /// Resolve an IP to an ISO 3166-1 alpha-2 country code
    pub fn lookup_country_iso(&self, ip: IpAddr) -> String {
        if is_local(ip) {
            return self.server_country.clone();
        }

        if let Some(code) = self.cache.get(&ip) {
            return code.clone();
        }

        let code = self
            .reader
            .as_ref()
            .and_then(|reader| reader.lookup::<geoip2::Country>(ip).ok())
            .and_then(|record| record.country.and_then(|c| c.iso_code))
            .map(|code| code.to_string())
            .unwrap_or_else(|| self.server_country.clone());

        self.cache.insert(ip, code.clone());
        code
    }
}

/// Addresses that never appear in a public GeoIP database
fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}
