//! Dynamic port discovery: log-tail regex scanning plus a TCP probe,
//! used both for on-demand whitelisting (a rejected request triggers one
//! attempt inline) and for the Router's periodic sweep.

use super::whitelist::Whitelist;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpStream;

const TAIL_LINES: usize = 100;
const PROBE_TIMEOUT: Duration = Duration::from_millis(350);

fn patterns() -> &'static [regex::Regex] {
    static PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)running on\s+\S*?:(\d{2,5})",
            r"(?i)listening on\s+\S*?:(\d{2,5})",
            r"(?i)listening on port\s+(\d{2,5})",
            r"https?://[^\s:/]+:(\d{2,5})",
        ]
        .iter()
        .map(|p| regex::Regex::new(p).expect("static discovery pattern is valid"))
        .collect()
    })
}

fn plausible(port: u16) -> bool {
    (1024..=65535).contains(&port)
}

/// Scan the trailing `TAIL_LINES` of `log_path` for a port mention, most
/// recent match last in the file taking priority (a service that moved port
/// twice logs both lines; the latest one reflects where it is now).
async fn tail_port_candidate(log_path: &Path) -> Option<u16> {
    let content = tokio::fs::read_to_string(log_path).await.ok()?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    let mut found = None;
    for line in &lines[start..] {
        for re in patterns() {
            if let Some(cap) = re.captures(line) {
                if let Ok(port) = cap[1].parse::<u16>() {
                    if plausible(port) {
                        found = Some(port);
                    }
                }
            }
        }
    }
    found
}

async fn probe(host: &str, port: u16) -> bool {
    let addr = format!("{host}:{port}");
    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

fn loopback_equivalent(a: &str, b: &str) -> bool {
    let is_loopback = |h: &str| h == "127.0.0.1" || h == "localhost" || h == "::1";
    a == b || (is_loopback(a) && is_loopback(b))
}

/// Result of a successful discovery attempt: the newly-whitelisted port and
/// where it came from, so the caller can log and realign the target URL.
pub struct Discovered {
    pub port: u16,
    pub source: &'static str,
}

/// One on-demand whitelisting attempt, triggered by a single
/// rejected request. `requested_host`/`requested_port` come from the URL the
/// worker actually tried to call; `configured_host` is the service's current
/// target host.
pub async fn on_demand(
    log_file: Option<&Path>,
    configured_host: &str,
    requested_host: &str,
    requested_port: u16,
    whitelist: &Whitelist,
) -> Option<Discovered> {
    if let Some(log_path) = log_file {
        if let Some(port) = tail_port_candidate(log_path).await {
            if probe(configured_host, port).await {
                whitelist.insert(port);
                return Some(Discovered { port, source: "log" });
            }
        }
    }

    if loopback_equivalent(configured_host, requested_host) && probe(requested_host, requested_port).await {
        whitelist.insert(requested_port);
        return Some(Discovered {
            port: requested_port,
            source: "probe",
        });
    }

    None
}

/// One periodic sweep for a single service with a
/// log file: log-detect then probe, same as the on-demand path's first step.
pub async fn periodic_sweep(log_file: &Path, configured_host: &str, whitelist: &Whitelist) -> Option<Discovered> {
    let port = tail_port_candidate(log_file).await?;
    if whitelist.contains(port) {
        return None;
    }
    if probe(configured_host, port).await {
        whitelist.insert(port);
        Some(Discovered { port, source: "log" })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plausible_range_excludes_reserved_and_overflow() {
        assert!(!plausible(80));
        assert!(plausible(8126));
        assert!(plausible(65535));
    }

    #[tokio::test]
    async fn tail_detects_running_on_pattern() {
        let mut file = tempfile_with_lines(&["starting up", "Running on http://127.0.0.1:5002 (Press CTRL+C to quit)"]);
        let port = tail_port_candidate(file.path()).await;
        assert_eq!(port, Some(5002));
        let _ = file.flush();
    }

    #[tokio::test]
    async fn tail_prefers_the_latest_mention() {
        let file = tempfile_with_lines(&[
            "Running on http://127.0.0.1:5000",
            "restarting",
            "Running on http://127.0.0.1:5002",
        ]);
        let port = tail_port_candidate(file.path()).await;
        assert_eq!(port, Some(5002));
    }

    #[test]
    fn loopback_hosts_are_equivalent() {
        assert!(loopback_equivalent("127.0.0.1", "localhost"));
        assert!(!loopback_equivalent("127.0.0.1", "example.internal"));
    }

    fn tempfile_with_lines(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f
    }
}
