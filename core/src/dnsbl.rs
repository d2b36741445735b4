/*
 * dnsbl.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a self-hostable mail server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! DNS blocklist lookups: reverse the client IPv4 octets under each
//! configured zone and treat any successful A resolution as a listing.
//! Lookups run in the session worker; verdicts are cached per IP for a short
//! TTL so a reconnecting client does not hammer the zones.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_resolver::TokioResolver;
use tracing::{debug, warn};

/// Cached verdict lifetime.
const CACHE_TTL: Duration = Duration::from_secs(300);
/// Expired cache entries are pruned when the map grows past this.
const CACHE_PRUNE_LEN: usize = 1024;

/// Synthesize the query name for `ip` in `zone`: octets reversed, zone
/// appended, trailing dot so resolver search lists never apply.
fn reversed_query(ip: Ipv4Addr, zone: &str) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}.{}.", o[3], o[2], o[1], o[0], zone)
}

pub struct DnsblChecker {
    zones: Vec<String>,
    resolver: Option<TokioResolver>,
    cache: Mutex<HashMap<IpAddr, (bool, Instant)>>,
}

impl DnsblChecker {
    /// Build a checker for the configured zones. A resolver that cannot be
    /// constructed (unreadable system config) disables lookups rather than
    /// blocking startup; DNS trouble is never fatal to mail flow.
    pub fn new(zones: Vec<String>) -> Self {
        let resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => Some(builder.build()),
            Err(e) => {
                warn!(error = %e, "cannot build DNS resolver; DNSBL checks disabled");
                None
            }
        };
        Self {
            zones,
            resolver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_get(&self, ip: IpAddr) -> Option<bool> {
        let cache = self.cache.lock().expect("dnsbl cache lock");
        cache
            .get(&ip)
            .filter(|(_, at)| at.elapsed() < CACHE_TTL)
            .map(|(listed, _)| *listed)
    }

    fn cache_put(&self, ip: IpAddr, listed: bool) {
        let mut cache = self.cache.lock().expect("dnsbl cache lock");
        if cache.len() >= CACHE_PRUNE_LEN {
            cache.retain(|_, (_, at)| at.elapsed() < CACHE_TTL);
        }
        cache.insert(ip, (listed, Instant::now()));
    }

    /// True when any configured zone lists the address. IPv6 clients are out
    /// of scope and never count as listed; resolver errors are logged and
    /// count as not listed.
    pub async fn is_blacklisted(&self, ip: IpAddr) -> bool {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return false,
        };
        if self.zones.is_empty() {
            return false;
        }
        if let Some(listed) = self.cache_get(ip) {
            return listed;
        }
        let resolver = match &self.resolver {
            Some(r) => r,
            None => return false,
        };

        let mut listed = false;
        for zone in &self.zones {
            let name = reversed_query(v4, zone);
            match resolver.lookup_ip(name.as_str()).await {
                Ok(lookup) => {
                    if lookup.iter().next().is_some() {
                        debug!(ip = %ip, zone = %zone, "client listed on DNSBL");
                        listed = true;
                        break;
                    }
                }
                Err(e) => {
                    // NXDOMAIN is the common not-listed answer; anything else
                    // is logged the same way and treated as not listed.
                    debug!(ip = %ip, zone = %zone, error = %e, "DNSBL lookup negative or failed");
                }
            }
        }
        self.cache_put(ip, listed);
        listed
    }
}
