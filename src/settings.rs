//! Node settings, as delivered by the coordinator's `client_settings`
//! action and hot-reloaded by `refresh_settings`.
//!
//! Settings are stored behind an [`arc_swap::ArcSwap`] so in-flight request
//! handlers keep using a consistent snapshot across a reload (spec.md §9).

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::static_range::StaticRanges;

/// Local-user proxy access policy for the `/p` route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Disabled = 1,
    LocalProtected = 2,
    LocalOpen = 3,
    AllProtected = 4,
    AllOpen = 5,
}

impl ProxyMode {
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => ProxyMode::Disabled,
            2 => ProxyMode::LocalProtected,
            3 => ProxyMode::LocalOpen,
            5 => ProxyMode::AllOpen,
            _ => ProxyMode::AllProtected,
        }
    }

    #[must_use]
    pub fn requires_local(self) -> bool {
        matches!(self, ProxyMode::LocalProtected | ProxyMode::LocalOpen)
    }

    #[must_use]
    pub fn requires_passkey(self) -> bool {
        matches!(self, ProxyMode::LocalProtected | ProxyMode::AllProtected)
    }
}

/// Mutable node configuration, refreshed wholesale by `client_settings`/
/// `refresh_settings`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub static_ranges: StaticRanges,
    pub port: u16,
    pub host: String,
    pub throttle_bytes: i64,
    pub disklimit_bytes: i64,
    pub request_server: String,
    pub image_server: String,
    pub proxy_mode: ProxyMode,
    pub rpc_server_ip: HashSet<IpAddr>,
    pub name: String,
    /// Shared client key used to verify keystamp/passkey/servercmd signatures.
    pub client_key: String,
    pub client_id: i64,
    /// Debug escape hatches; never set outside test/dev runs.
    pub check_timestamps: bool,
    pub check_sha1: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            static_ranges: StaticRanges::new(),
            port: 0,
            host: String::new(),
            throttle_bytes: 0,
            disklimit_bytes: 0,
            request_server: String::new(),
            image_server: String::new(),
            proxy_mode: ProxyMode::Disabled,
            rpc_server_ip: HashSet::new(),
            name: String::new(),
            client_key: String::new(),
            client_id: 0,
            check_timestamps: true,
            check_sha1: true,
        }
    }
}

impl Settings {
    /// Applies the vars returned by `Coord::client_settings`/`refresh_settings`
    /// on top of the current settings, keeping the client identity fields and
    /// debug flags untouched (spec.md §4.3's `client_settings` row).
    #[must_use]
    pub fn apply_vars(&self, vars: &HashMap<String, String>) -> Self {
        let mut next = self.clone();
        if let Some(v) = vars.get("static_ranges") {
            if let Ok(ranges) = crate::coord::parse_static_ranges(v) {
                next.static_ranges = ranges;
            }
        }
        if let Some(v) = vars.get("port").and_then(|v| v.parse().ok()) {
            next.port = v;
        }
        if let Some(v) = vars.get("host") {
            next.host = v.clone();
        }
        if let Some(v) = vars.get("throttle_bytes").and_then(|v| v.parse().ok()) {
            next.throttle_bytes = v;
        }
        if let Some(v) = vars.get("disklimit_bytes").and_then(|v| v.parse().ok()) {
            next.disklimit_bytes = v;
        }
        if let Some(v) = vars.get("request_server") {
            next.request_server = v.clone();
        }
        if let Some(v) = vars.get("image_server") {
            next.image_server = v.clone();
        }
        if let Some(v) = vars.get("request_proxy_mode").and_then(|v| v.parse().ok()) {
            next.proxy_mode = ProxyMode::from_i64(v);
        }
        if let Some(v) = vars.get("rpc_server_ip") {
            next.rpc_server_ip = v
                .split(';')
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.parse().ok())
                .collect();
        }
        if let Some(v) = vars.get("name") {
            next.name = v.clone();
        }
        next
    }
}

/// Local-network ranges the `/p` route treats as "local" under
/// `ProxyMode::Local*` (spec.md §4.4).
#[must_use]
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || o[0] == 127
        }
        IpAddr::V6(v6) => {
            // fc00::/7
            v6.segments()[0] & 0xfe00 == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_mode_from_i64_round_trips_known_values() {
        assert_eq!(ProxyMode::from_i64(1), ProxyMode::Disabled);
        assert_eq!(ProxyMode::from_i64(2), ProxyMode::LocalProtected);
        assert_eq!(ProxyMode::from_i64(3), ProxyMode::LocalOpen);
        assert_eq!(ProxyMode::from_i64(5), ProxyMode::AllOpen);
    }

    #[test]
    fn is_local_address_recognizes_private_ranges() {
        assert!(is_local_address("10.1.2.3".parse().unwrap()));
        assert!(is_local_address("172.16.0.1".parse().unwrap()));
        assert!(is_local_address("192.168.1.1".parse().unwrap()));
        assert!(is_local_address("127.0.0.1".parse().unwrap()));
        assert!(!is_local_address("8.8.8.8".parse().unwrap()));
        assert!(is_local_address("fc00::1".parse().unwrap()));
        assert!(!is_local_address("2001:4860::1".parse().unwrap()));
    }

    #[test]
    fn apply_vars_updates_fields_and_preserves_client_identity() {
        let base = Settings {
            client_key: "secret".to_string(),
            client_id: 42,
            ..Settings::default()
        };
        let mut vars = HashMap::new();
        vars.insert("port".to_string(), "8080".to_string());
        vars.insert("host".to_string(), "203.0.113.5".to_string());
        vars.insert("request_proxy_mode".to_string(), "3".to_string());
        vars.insert("static_ranges".to_string(), "0010".to_string());

        let next = base.apply_vars(&vars);
        assert_eq!(next.port, 8080);
        assert_eq!(next.host, "203.0.113.5");
        assert_eq!(next.proxy_mode, ProxyMode::LocalOpen);
        assert_eq!(next.client_key, "secret");
        assert_eq!(next.client_id, 42);
        assert!(next.static_ranges.contains_key(0x0010));
    }
}
