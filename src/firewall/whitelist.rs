//! Per-service port whitelist: the static catalog ports plus any ports
//! learned at runtime by on-demand or periodic discovery.

use crate::config::ServiceDef;
use std::collections::HashSet;
use std::sync::RwLock;

pub struct Whitelist {
    ports: RwLock<HashSet<u16>>,
}

impl Whitelist {
    pub fn from_service_def(def: &ServiceDef) -> Self {
        let mut ports: HashSet<u16> = def.ports.iter().copied().collect();
        if let Some(port) = target_port(&def.target) {
            ports.insert(port);
        }
        Self {
            ports: RwLock::new(ports),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.read().expect("whitelist lock poisoned").contains(&port)
    }

    /// Adds `port`; returns `true` if it was not already present.
    pub fn insert(&self, port: u16) -> bool {
        self.ports.write().expect("whitelist lock poisoned").insert(port)
    }

    pub fn snapshot(&self) -> Vec<u16> {
        let mut v: Vec<u16> = self.ports.read().expect("whitelist lock poisoned").iter().copied().collect();
        v.sort_unstable();
        v
    }
}

/// Parse the port out of a `scheme://host[:port]` target URL, defaulting by scheme.
pub fn target_port(target: &str) -> Option<u16> {
    let url = reqwest::Url::parse(target).ok()?;
    url.port_or_known_default()
}

/// Parse the port out of an arbitrary outgoing request URL the same way,
/// used both for validation and for realigning a service's target after
/// discovery moves it.
pub fn request_port(url: &str) -> Option<(String, u16)> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default()?;
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(target: &str, ports: Vec<u16>) -> ServiceDef {
        ServiceDef {
            name: "svc".into(),
            target: target.into(),
            aliases: vec![],
            ports,
            log_file: None,
            default_stream: false,
        }
    }

    #[test]
    fn static_ports_and_target_port_are_both_present() {
        let wl = Whitelist::from_service_def(&def("http://127.0.0.1:5000", vec![5001, 5002]));
        assert!(wl.contains(5000));
        assert!(wl.contains(5001));
        assert!(!wl.contains(9999));
    }

    #[test]
    fn insert_reports_novelty() {
        let wl = Whitelist::from_service_def(&def("http://127.0.0.1:5000", vec![]));
        assert!(wl.insert(5002));
        assert!(!wl.insert(5002));
        assert!(wl.contains(5002));
    }

    #[test]
    fn request_port_defaults_by_scheme() {
        let (host, port) = request_port("https://example.internal/path").unwrap();
        assert_eq!(host, "example.internal");
        assert_eq!(port, 443);
    }
}
