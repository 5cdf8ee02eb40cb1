//! Public address resolution for the basic-info payload.
//!
//! Each family is probed through an HTTP client locked to that family so a
//! dual-stack host cannot answer a v4 probe over v6. Providers are tried in
//! order until one response contains a well-formed address.

use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use sysinfo::Networks;
use tracing::{debug, info};

use crate::metrics::{parse_nics, should_include_nic};
use crate::state::AgentState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "curl/8.0.1";

const PROBES_V4: [&str; 4] = [
    "https://api.ipify.org",
    "https://ipv4.icanhazip.com",
    "https://checkip.amazonaws.com",
    "http://ipv4.ip.sb",
];

const PROBES_V6: [&str; 4] = [
    "https://api6.ipify.org",
    "https://ipv6.icanhazip.com",
    "https://v6.ident.me",
    "https://api-ipv6.ip.sb/ip",
];

fn v4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").expect("ipv4 regex"))
}

fn v6_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(([0-9A-Fa-f]{1,4}:){7})([0-9A-Fa-f]{1,4})|(([0-9A-Fa-f]{1,4}:){1,6}:)(([0-9A-Fa-f]{1,4}:){0,4})([0-9A-Fa-f]{0,4})",
        )
        .expect("ipv6 regex")
    })
}

async fn probe(client: &reqwest::Client, urls: &[&str], re: &Regex) -> Option<String> {
    for url in urls {
        let response = match client
            .get(*url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!("ip probe {url} failed: {e}");
                continue;
            }
        };
        let body = match response.text().await {
            Ok(b) => b,
            Err(_) => continue,
        };
        if let Some(m) = re.find(&body) {
            return Some(m.as_str().to_string());
        }
    }
    None
}

/// Public (IPv4, IPv6) addresses, either read from the monitored interfaces
/// or probed through external providers.
pub async fn public_addresses(state: &AgentState) -> (Option<String>, Option<String>) {
    if state.cfg.get_ip_from_nic {
        let (v4, v6) = from_interfaces(state);
        if v4.is_some() || v6.is_some() {
            info!(ipv4 = ?v4, ipv6 = ?v6, "addresses read from interfaces");
            return (v4, v6);
        }
    }

    let v4_client = state.dialer.http_client_family(PROBE_TIMEOUT, true);
    let v6_client = state.dialer.http_client_family(PROBE_TIMEOUT, false);

    let v4 = probe(&v4_client, &PROBES_V4, v4_regex()).await;
    let v6 = probe(&v6_client, &PROBES_V6, v6_regex()).await;
    if let Some(ip) = &v4 {
        info!("public IPv4: {ip}");
    }
    if let Some(ip) = &v6 {
        info!("public IPv6: {ip}");
    }
    (v4, v6)
}

fn is_link_local_v6(ip: &std::net::Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// First non-loopback, non-link-local address per family on the allowed
/// interfaces.
fn from_interfaces(state: &AgentState) -> (Option<String>, Option<String>) {
    let include = parse_nics(&state.cfg.include_nics);
    let exclude = parse_nics(&state.cfg.exclude_nics);
    let networks = Networks::new_with_refreshed_list();

    let mut v4: Option<String> = None;
    let mut v6: Option<String> = None;
    for (name, data) in networks.iter() {
        if !should_include_nic(name, &include, &exclude) {
            continue;
        }
        for ip_network in data.ip_networks() {
            match ip_network.addr {
                IpAddr::V4(ip) => {
                    if v4.is_none() && !ip.is_loopback() && !ip.is_link_local() {
                        v4 = Some(ip.to_string());
                    }
                }
                IpAddr::V6(ip) => {
                    if v6.is_none() && !ip.is_loopback() && !is_link_local_v6(&ip) {
                        v6 = Some(ip.to_string());
                    }
                }
            }
            if v4.is_some() && v6.is_some() {
                return (v4, v6);
            }
        }
    }
    (v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_regex_extracts_first_address() {
        let body = "ip=203.0.113.9\nloc=XX\n";
        assert_eq!(v4_regex().find(body).unwrap().as_str(), "203.0.113.9");
        assert!(v4_regex().find("no address here").is_none());
    }

    #[test]
    fn v6_regex_extracts_addresses() {
        let full = "2001:db8:0:1:1:1:1:1";
        assert_eq!(v6_regex().find(full).unwrap().as_str(), full);
        let compressed = "addr: 2001:db8::5 end";
        assert!(v6_regex().find(compressed).is_some());
    }

    #[test]
    fn link_local_v6_detection() {
        assert!(is_link_local_v6(&"fe80::1".parse().unwrap()));
        assert!(!is_link_local_v6(&"2001:db8::1".parse().unwrap()));
    }
}
