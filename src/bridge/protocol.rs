//! The child-bridge line protocol: every line on the child's stdout
//! and stdin is a single self-contained JSON record. The supervisor knows
//! nothing about the overlay transport beyond these record shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Records the child bridge process emits on stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ChildOutboundRecord {
    #[serde(rename = "ready")]
    Ready { address: String },
    #[serde(rename = "status")]
    Status {
        state: String,
        #[serde(default)]
        detail: Option<String>,
    },
    #[serde(rename = "inbound")]
    Inbound { src: String, msg: Value },
    #[serde(rename = "error")]
    Error { msg: String },
}

/// The one record the supervisor writes to the child's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "dm")]
pub struct DmRecord {
    pub to: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opts: Option<Value>,
}

/// Parse a single line of the child's stdout into a record. Malformed or
/// blank lines are not a protocol violation worth surfacing to the client —
/// they're logged and skipped by the caller.
pub fn parse_line(line: &str) -> Result<ChildOutboundRecord, serde_json::Error> {
    serde_json::from_str(line.trim())
}

pub fn encode_dm(record: &DmRecord) -> Result<String, serde_json::Error> {
    serde_json::to_string(record)
}

/// A status state meaning the liveness self-probe (configured via
/// `self_probe_ms`/`self_probe_fails`, run inside the child itself) gave up.
/// The supervisor treats this exactly like any other child exit.
pub const STATE_PROBE_EXIT: &str = "probe_exit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready() {
        let rec = parse_line(r#"{"type":"ready","address":"abc123"}"#).unwrap();
        assert!(matches!(rec, ChildOutboundRecord::Ready { address } if address == "abc123"));
    }

    #[test]
    fn parses_status_probe_exit() {
        let rec = parse_line(r#"{"type":"status","state":"probe_exit","detail":"3 failures"}"#).unwrap();
        match rec {
            ChildOutboundRecord::Status { state, detail } => {
                assert_eq!(state, STATE_PROBE_EXIT);
                assert_eq!(detail.as_deref(), Some("3 failures"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_inbound() {
        let rec = parse_line(r#"{"type":"inbound","src":"peer1","msg":{"type":"ping"}}"#).unwrap();
        assert!(matches!(rec, ChildOutboundRecord::Inbound { .. }));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn dm_round_trips() {
        let dm = DmRecord {
            to: "peer1".into(),
            data: serde_json::json!({"type": "relay.pong"}),
            opts: None,
        };
        let encoded = encode_dm(&dm).unwrap();
        assert!(encoded.contains(r#""type":"dm""#));
        assert!(encoded.contains("peer1"));
    }
}
