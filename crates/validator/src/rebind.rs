//! DNS-rebinding guard — the runtime companion to the SSRF pass.
//!
//! A hostname that validated clean can start resolving to a blocked address
//! mid-run. Callers feed every fresh resolution through
//! [`DnsRebindGuard::validate_resolved_ips`] before connecting.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::RwLock;

use drill_domain::config::SystemPolicy;

use crate::ssrf;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RebindError {
    #[error("host {host} resolves to blocked address {ip}")]
    Blocked { host: String, ip: IpAddr },

    #[error("host {host} changed resolution to blocked address {ip} (possible DNS rebinding)")]
    Rebinding { host: String, ip: IpAddr },
}

pub struct DnsRebindGuard {
    allow: Vec<IpNet>,
    cache: RwLock<HashMap<String, Vec<IpAddr>>>,
}

impl DnsRebindGuard {
    pub fn new(policy: &SystemPolicy) -> Self {
        Self {
            allow: ssrf::parse_allow_networks(policy),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Check a fresh resolution for `host` and record it.
    ///
    /// Any blocked IP rejects the set. When a prior resolution exists, a
    /// *changed* set containing a blocked IP is classified as rebinding
    /// rather than a plain block.
    pub fn validate_resolved_ips(&self, host: &str, ips: &[IpAddr]) -> Result<(), RebindError> {
        let blocked = ips.iter().find(|ip| ssrf::is_blocked(**ip, &self.allow));

        if let Some(&ip) = blocked {
            let changed = {
                let cache = self.cache.read();
                cache.get(host).map(|prior| prior.as_slice() != ips)
            };
            return Err(match changed {
                Some(true) => RebindError::Rebinding {
                    host: host.to_owned(),
                    ip,
                },
                _ => RebindError::Blocked {
                    host: host.to_owned(),
                    ip,
                },
            });
        }

        // Store a defensive copy; callers keep ownership of their slice.
        self.cache.write().insert(host.to_owned(), ips.to_vec());
        Ok(())
    }

    /// The last accepted resolution for `host`, as a defensive copy.
    pub fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.cache.read().get(host).cloned()
    }
}
