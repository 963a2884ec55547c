//! Overlay message schema: the structured records exchanged between a
//! remote client and a Relay Node, addressed by overlay identity rather than
//! by host/port.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The canonical HTTP request shape every inbound event classifies down to.
/// Service-specific event shapes (ASR session lifecycle, browser lifecycle)
/// carry their own typed fields on the wire but are normalized into this
/// descriptor before a Job is enqueued; see `relay::job::normalize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequestDescriptor {
    pub service: Option<String>,
    pub target: Option<String>,
    pub path: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    pub timeout_ms: Option<u64>,
    pub body_b64: Option<String>,
    pub json: Option<Value>,
    pub data: Option<String>,
    pub body_chunks_b64: Option<Vec<String>>,
    pub json_chunks_b64: Option<Vec<String>>,
    pub verify: Option<bool>,
    pub insecure_tls: Option<bool>,
    pub stream: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "http.request")]
    HttpRequest { id: String, req: HttpRequestDescriptor },
    #[serde(rename = "relay.http")]
    RelayHttp { id: String, req: HttpRequestDescriptor },
    #[serde(rename = "relay.fetch")]
    RelayFetch { id: String, req: HttpRequestDescriptor },
    #[serde(rename = "http.upload.begin")]
    UploadBegin {
        id: String,
        upload_id: String,
        req: Option<HttpRequestDescriptor>,
        total: usize,
        content_type: Option<String>,
    },
    #[serde(rename = "http.upload.chunk")]
    UploadChunk {
        id: String,
        upload_id: String,
        seq: i64,
        b64: String,
        req: Option<HttpRequestDescriptor>,
        total: Option<usize>,
        content_type: Option<String>,
    },
    #[serde(rename = "http.upload.end")]
    UploadEnd { id: String, upload_id: String },
    #[serde(rename = "relay.response.missing")]
    ResponseMissing {
        id: String,
        upload_id: Option<String>,
        missing: Vec<u64>,
    },
    /// Service-specific request shapes (`asr.*`, `browser.*`, …) whose exact
    /// fields vary by service but which all carry an `opts` bag used to
    /// resolve the target service and HTTP options. Normalized alongside the
    /// generic shapes in `relay::job::normalize`.
    #[serde(other)]
    ServiceSpecific,
}

/// Fallback decode for the service-specific shapes above: re-parsed from the
/// raw JSON value when `InboundEvent::ServiceSpecific` matches, since its
/// exact field set is service-dependent.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpecificEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Option<String>,
    #[serde(default)]
    pub opts: ServiceOpts,
    #[serde(flatten)]
    pub fields: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceOpts {
    pub service: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    pub timeout_ms: Option<u64>,
    pub verify: Option<bool>,
    pub insecure_tls: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "relay.pong")]
    Pong { addr: String, ts: u64 },
    #[serde(rename = "relay.info")]
    Info {
        services: Vec<String>,
        workers: usize,
        max_body_b: u64,
        assignments: HashMap<String, String>,
    },
    #[serde(rename = "relay.response")]
    Response {
        id: String,
        ok: bool,
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        json: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_b64: Option<String>,
        truncated: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "relay.response.begin")]
    ResponseBegin {
        id: String,
        ok: bool,
        status: u16,
        headers: HashMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_length: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        ts: u64,
    },
    #[serde(rename = "relay.response.chunk")]
    ResponseChunk { id: String, seq: u64, b64: String },
    #[serde(rename = "relay.response.lines")]
    ResponseLines { id: String, lines: Vec<ResponseLine> },
    #[serde(rename = "relay.response.keepalive")]
    ResponseKeepalive { id: String, ts: u64 },
    #[serde(rename = "relay.response.end")]
    ResponseEnd {
        id: String,
        ok: bool,
        bytes: u64,
        last_seq: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        lines: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        done_seen: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        truncated: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "relay.redirect")]
    Redirect {
        service: String,
        id: Option<String>,
        node: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        addr: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "http.upload.missing")]
    UploadMissing {
        id: String,
        upload_id: String,
        missing: Vec<u64>,
        total: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseLine {
    pub seq: u64,
    pub ts: u64,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_decodes() {
        let v: InboundEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(v, InboundEvent::Ping));
    }

    #[test]
    fn http_request_decodes_with_descriptor() {
        let raw = r#"{"type":"http.request","id":"r1","req":{"service":"ollama_farm","path":"/api/tags","method":"GET"}}"#;
        let v: InboundEvent = serde_json::from_str(raw).unwrap();
        match v {
            InboundEvent::HttpRequest { id, req } => {
                assert_eq!(id, "r1");
                assert_eq!(req.service.as_deref(), Some("ollama_farm"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_falls_back_to_service_specific() {
        let v: InboundEvent = serde_json::from_str(r#"{"type":"asr.start"}"#).unwrap();
        assert!(matches!(v, InboundEvent::ServiceSpecific));
    }

    #[test]
    fn response_serializes_with_type_tag() {
        let msg = OutboundMessage::Pong {
            addr: "addr123".into(),
            ts: 42,
        };
        let s = serde_json::to_string(&msg).unwrap();
        assert!(s.contains(r#""type":"relay.pong""#));
    }
}
