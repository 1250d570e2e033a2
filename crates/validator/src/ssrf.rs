//! SSRF pass: keep load generation pointed at the open internet (or at
//! explicitly allowed private ranges) and nowhere else.

use std::net::IpAddr;
use std::sync::OnceLock;

use ipnet::IpNet;
use url::{Host, Url};

use drill_domain::config::{RunConfig, SystemPolicy};

use crate::report::ValidationReport;

/// Exact hostnames that always resolve to the local machine.
const LOCAL_HOSTNAMES: &[&str] = &["localhost", "localhost.localdomain", "local"];

/// Hostname suffixes that conventionally point inside a private network.
/// These produce warnings, not errors.
const SUSPICIOUS_SUFFIXES: &[&str] = &[".internal", ".local", ".localhost"];

const BLOCKED_CIDRS: &[&str] = &[
    // IPv4
    "127.0.0.0/8",        // loopback
    "169.254.0.0/16",     // link-local
    "169.254.169.254/32", // cloud metadata
    "100.100.100.200/32", // cloud metadata (alibaba)
    "0.0.0.0/8",
    "192.0.0.0/24",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    // IPv6
    "::1/128",
    "::/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
    "::ffff:0:0/96",
    "64:ff9b::/96",
    "2001:db8::/32",
];

/// The closed block list, compiled once.
pub fn blocked_networks() -> &'static [IpNet] {
    static NETS: OnceLock<Vec<IpNet>> = OnceLock::new();
    NETS.get_or_init(|| {
        BLOCKED_CIDRS
            .iter()
            .map(|cidr| cidr.parse().expect("static block list CIDR"))
            .collect()
    })
}

/// Parse the policy's exception CIDRs, skipping malformed entries.
pub fn parse_allow_networks(policy: &SystemPolicy) -> Vec<IpNet> {
    policy
        .allow_private_networks
        .iter()
        .filter_map(|cidr| match cidr.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(err) => {
                tracing::warn!(cidr = %cidr, error = %err, "ignoring malformed allow_private_networks entry");
                None
            }
        })
        .collect()
}

/// Whether the IP is on the block list and not exempted.
///
/// IPv4-mapped IPv6 addresses are unwrapped and re-checked against the IPv4
/// rules, so `::ffff:10.0.0.1` cannot smuggle a private address past the
/// checks — and conversely an allow entry for `10.0.0.0/8` also admits its
/// mapped form.
pub fn is_blocked(ip: IpAddr, allow: &[IpNet]) -> bool {
    if allow.iter().any(|net| net.contains(&ip)) {
        return false;
    }
    if let IpAddr::V6(v6) = ip {
        if let Some(v4) = v6.to_ipv4_mapped() {
            return is_blocked(IpAddr::V4(v4), allow);
        }
    }
    blocked_networks().iter().any(|net| net.contains(&ip))
}

/// Whether the policy admits the literal hostname `localhost`. Requires an
/// exception CIDR covering `127.0.0.1` — nothing else does it.
pub fn localhost_allowed(allow: &[IpNet]) -> bool {
    let loopback: IpAddr = [127, 0, 0, 1].into();
    allow.iter().any(|net| net.contains(&loopback))
}

pub fn check(config: &RunConfig, policy: &SystemPolicy) -> ValidationReport {
    let mut report = ValidationReport::default();
    let allow = parse_allow_networks(policy);

    let url = match Url::parse(&config.target.url) {
        Ok(url) => url,
        Err(err) => {
            report.error(
                "URL_PARSE",
                format!("target.url is not a valid URL: {err}"),
                Some("/target/url".into()),
            );
            return report;
        }
    };

    if !matches!(url.scheme(), "http" | "https") {
        report.error(
            "SCHEME_BLOCKED",
            format!("target.url scheme {:?} is not allowed (http/https only)", url.scheme()),
            Some("/target/url".into()),
        );
    }

    if !url.username().is_empty() || url.password().is_some() {
        report.error(
            "USERINFO_BLOCKED",
            "target.url must not carry userinfo",
            Some("/target/url".into()),
        );
    }

    match url.host() {
        None => {
            report.error(
                "HOST_MISSING",
                "target.url has no host",
                Some("/target/url".into()),
            );
        }
        Some(Host::Domain(domain)) => {
            check_hostname(&mut report, &domain.to_ascii_lowercase(), &allow);
        }
        Some(Host::Ipv4(ip)) => {
            if is_blocked(IpAddr::V4(ip), &allow) {
                report.error(
                    "PRIVATE_IP_BLOCKED",
                    format!("target host {ip} is in a blocked address range"),
                    Some("/target/url".into()),
                );
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_blocked(IpAddr::V6(ip), &allow) {
                report.error(
                    "PRIVATE_IP_BLOCKED",
                    format!("target host {ip} is in a blocked address range"),
                    Some("/target/url".into()),
                );
            }
        }
    }

    match &config.target.redirect_policy {
        None => {
            report.error_with_remediation(
                "REDIRECT_POLICY_MISSING",
                "target.redirect_policy must be present",
                Some("/target/redirect_policy".into()),
                "set mode to one of deny, same_origin, allowlist_only",
            );
        }
        Some(policy) => {
            if policy.max_redirects > 3 {
                report.error(
                    "REDIRECT_LIMIT_EXCEEDED",
                    format!(
                        "redirect_policy.max_redirects {} exceeds the maximum of 3",
                        policy.max_redirects
                    ),
                    Some("/target/redirect_policy/max_redirects".into()),
                );
            }
        }
    }

    report
}

fn check_hostname(report: &mut ValidationReport, host: &str, allow: &[IpNet]) {
    if LOCAL_HOSTNAMES.contains(&host) {
        // `localhost` alone can be admitted, and only via a loopback CIDR.
        if host == "localhost" && localhost_allowed(allow) {
            return;
        }
        report.error_with_remediation(
            "LOCALHOST_BLOCKED",
            format!("target host {host:?} points at the local machine"),
            Some("/target/url".into()),
            "add 127.0.0.0/8 to system_policy.allow_private_networks to test a local target",
        );
        return;
    }
    for suffix in SUSPICIOUS_SUFFIXES {
        if host.ends_with(suffix) {
            report.warning(
                "INTERNAL_HOSTNAME",
                format!("target host {host:?} has an internal-looking suffix ({suffix})"),
                Some("/target/url".into()),
            );
            return;
        }
    }
}
