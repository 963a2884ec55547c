//! The three response framings: single embedded response, a batched
//! line/event stream, or a chunked binary stream backed by the replay cache.

use crate::bridge::BridgeSupervisor;
use crate::config::HttpConfig;
use crate::relay::job::{Job, RequestedStreaming};
use crate::relay::replay::ReplayCache;
use crate::overlay::{OutboundMessage, ResponseLine};
use base64::Engine;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

/// Structural sniff for an Ollama-style `/api/show` payload: a `license`
/// field anywhere near the top, or a `modelfile`/`modelfile_sha` sibling.
/// Depth-limited so a deeply nested unrelated document doesn't false-positive.
fn looks_like_show_payload(value: &Value, depth: u8) -> bool {
    if depth > 3 {
        return false;
    }
    match value {
        Value::Object(map) => {
            if map.keys().any(|k| k.eq_ignore_ascii_case("license")) {
                return true;
            }
            if map.contains_key("modelfile") || map.contains_key("modelfile_sha") {
                return true;
            }
            map.values().any(|v| looks_like_show_payload(v, depth + 1))
        }
        Value::Array(items) => items.iter().any(|v| looks_like_show_payload(v, depth + 1)),
        _ => false,
    }
}

/// Whether `redact_license` should run at all for this job's response:
/// either the job names an ollama/llm target and a `/show`-style path, or
/// the body itself structurally looks like a model-show payload.
fn should_redact_license(job: &Job, body: &Value) -> bool {
    let target = job.service.to_lowercase();
    let path = job.path.as_deref().unwrap_or("").to_lowercase();
    let url = job.url.as_deref().unwrap_or("").to_lowercase();

    let targets_ollama = ["ollama", "llm"].iter().any(|seg| target.contains(seg));
    let hits_show_path = ["/show", "/api/show"]
        .iter()
        .any(|seg| path.contains(seg) || url.contains(seg));

    (targets_ollama && hits_show_path) || looks_like_show_payload(body, 0)
}

/// Redact any field literally named `license`, anywhere in the structure —
/// the LLM-describe endpoint nests it at varying depth depending on model.
fn redact_license(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                if k == "license" {
                    *v = Value::String("[omitted]".to_string());
                } else {
                    redact_license(v);
                }
            }
        }
        Value::Array(items) => {
            for v in items {
                redact_license(v);
            }
        }
        _ => {}
    }
}

enum ResolvedFraming {
    Single,
    Lines,
    Chunks,
}

fn resolve_framing(requested: RequestedStreaming, content_type: &str, default_stream: bool) -> ResolvedFraming {
    match requested {
        RequestedStreaming::Lines => ResolvedFraming::Lines,
        RequestedStreaming::Chunks => ResolvedFraming::Chunks,
        RequestedStreaming::Auto => {
            if content_type.starts_with("text/event-stream") || content_type.starts_with("application/x-ndjson") {
                ResolvedFraming::Lines
            } else if default_stream {
                ResolvedFraming::Chunks
            } else {
                ResolvedFraming::Single
            }
        }
    }
}

/// A terminal marker inside a parsed line's own structure — e.g. an SSE
/// `[DONE]` sentinel or an ndjson `{"done": true}` object.
fn line_is_terminal(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed == "[DONE]" || trimmed == "data: [DONE]" {
        return true;
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        if let Some(Value::Bool(true)) = map.get("done") {
            return true;
        }
    }
    false
}

/// Send the assembled HTTP response for `job` back through `bridge` in the
/// appropriate framing. `send_error` is used uniformly for resolving and
/// transport failures so every exit path funnels through one terminal
/// `relay.response`/`relay.response.end` emission.
pub async fn emit(
    job: &Job,
    result: Result<reqwest::Response, reqwest::Error>,
    cfg: &HttpConfig,
    default_stream: bool,
    replay: &Arc<ReplayCache>,
    bridge: &BridgeSupervisor,
) {
    let resp = match result {
        Ok(r) => r,
        Err(e) => {
            send_single_error(job, bridge, e.to_string()).await;
            return;
        }
    };

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    match resolve_framing(job.streaming, &content_type, default_stream) {
        ResolvedFraming::Single => emit_single(job, resp, cfg, bridge).await,
        ResolvedFraming::Lines => emit_lines(job, resp, cfg, bridge).await,
        ResolvedFraming::Chunks => emit_chunks(job, resp, cfg, replay, bridge).await,
    }
}

/// Emit a terminal protocol/policy error directly, with no upstream
/// response to frame — used by the node's classification and port-isolation
/// paths, which never reach an actual HTTP call.
pub async fn emit_error(src: &str, request_id: &str, status: u16, message: impl Into<String>, bridge: &BridgeSupervisor) {
    let msg = OutboundMessage::Response {
        id: request_id.to_string(),
        ok: false,
        status,
        headers: None,
        json: None,
        body_b64: None,
        truncated: false,
        error: Some(message.into()),
    };
    bridge.send(src, serde_json::to_value(&msg).unwrap(), None).await;
}

async fn send_single_error(job: &Job, bridge: &BridgeSupervisor, error: String) {
    let msg = OutboundMessage::Response {
        id: job.request_id.clone(),
        ok: false,
        status: 0,
        headers: None,
        json: None,
        body_b64: None,
        truncated: false,
        error: Some(error),
    };
    bridge.send(&job.src, serde_json::to_value(&msg).unwrap(), None).await;
}

async fn emit_single(job: &Job, resp: reqwest::Response, cfg: &HttpConfig, bridge: &BridgeSupervisor) {
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let headers = collect_headers(resp.headers());

    let body = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            send_single_error(job, bridge, e.to_string()).await;
            return;
        }
    };

    let max_body = cfg.max_body_b as usize;
    let truncated = body.len() > max_body;
    let body_slice = if truncated { &body[..max_body] } else { &body[..] };

    let (json, body_b64) = if content_type.starts_with("application/json") {
        match serde_json::from_slice::<Value>(body_slice) {
            Ok(mut v) => {
                if should_redact_license(job, &v) {
                    redact_license(&mut v);
                }
                (Some(v), None)
            }
            Err(_) => (None, Some(base64::engine::general_purpose::STANDARD.encode(body_slice))),
        }
    } else {
        (None, Some(base64::engine::general_purpose::STANDARD.encode(body_slice)))
    };

    let msg = OutboundMessage::Response {
        id: job.request_id.clone(),
        ok: (200..300).contains(&status),
        status,
        headers: Some(headers),
        json,
        body_b64,
        truncated,
        error: None,
    };
    bridge.send(&job.src, serde_json::to_value(&msg).unwrap(), None).await;
}

async fn flush_lines(id: &str, batch: &mut Vec<ResponseLine>, bridge: &BridgeSupervisor, src: &str) {
    if batch.is_empty() {
        return;
    }
    let lines = std::mem::take(batch);
    let msg = OutboundMessage::ResponseLines {
        id: id.to_string(),
        lines,
    };
    bridge.send(src, serde_json::to_value(&msg).unwrap(), None).await;
}

async fn emit_lines(job: &Job, resp: reqwest::Response, cfg: &HttpConfig, bridge: &BridgeSupervisor) {
    let id = job.request_id.clone();
    let status = resp.status().as_u16();
    let headers = collect_headers(resp.headers());

    let begin = OutboundMessage::ResponseBegin {
        id: id.clone(),
        ok: (200..300).contains(&status),
        status,
        headers,
        content_length: resp.content_length(),
        filename: None,
        ts: now_ts(),
    };
    bridge.send(&job.src, serde_json::to_value(&begin).unwrap(), None).await;

    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut batch: Vec<ResponseLine> = Vec::new();
    let mut seq: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut done_seen = false;
    let mut error: Option<String> = None;

    let batch_period = Duration::from_secs_f64(cfg.batch_latency.max(0.001));
    let heartbeat_period = Duration::from_secs_f64(cfg.heartbeat_s.max(0.001));
    let mut batch_ticker = tokio::time::interval(batch_period);
    let mut heartbeat_ticker = tokio::time::interval(heartbeat_period);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            next = stream.next() => {
                match next {
                    Some(Ok(bytes)) => {
                        total_bytes += bytes.len() as u64;
                        buf.extend_from_slice(&bytes);
                        last_activity = Instant::now();
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line_bytes).trim_end().to_string();
                            if line.is_empty() {
                                continue;
                            }
                            seq += 1;
                            if line_is_terminal(&line) {
                                done_seen = true;
                            }
                            batch.push(ResponseLine { seq, ts: now_ts(), line });
                            if batch.len() >= cfg.batch_lines {
                                flush_lines(&id, &mut batch, bridge, &job.src).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
            _ = batch_ticker.tick() => {
                flush_lines(&id, &mut batch, bridge, &job.src).await;
            }
            _ = heartbeat_ticker.tick() => {
                if last_activity.elapsed() >= heartbeat_period {
                    let keepalive = OutboundMessage::ResponseKeepalive { id: id.clone(), ts: now_ts() };
                    bridge.send(&job.src, serde_json::to_value(&keepalive).unwrap(), None).await;
                    last_activity = Instant::now();
                }
            }
        }
    }
    flush_lines(&id, &mut batch, bridge, &job.src).await;

    let end = OutboundMessage::ResponseEnd {
        id,
        ok: error.is_none(),
        bytes: total_bytes,
        last_seq: seq,
        lines: Some(seq),
        done_seen: Some(done_seen),
        truncated: None,
        error,
    };
    bridge.send(&job.src, serde_json::to_value(&end).unwrap(), None).await;
}

async fn emit_chunks(
    job: &Job,
    resp: reqwest::Response,
    cfg: &HttpConfig,
    replay: &Arc<ReplayCache>,
    bridge: &BridgeSupervisor,
) {
    let id = job.request_id.clone();
    let status = resp.status().as_u16();
    let headers = collect_headers(resp.headers());

    let begin = OutboundMessage::ResponseBegin {
        id: id.clone(),
        ok: (200..300).contains(&status),
        status,
        headers,
        content_length: resp.content_length(),
        filename: None,
        ts: now_ts(),
    };
    bridge.send(&job.src, serde_json::to_value(&begin).unwrap(), None).await;

    let mut stream = resp.bytes_stream();
    let mut seq: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut error: Option<String> = None;

    let heartbeat_period = Duration::from_secs_f64(cfg.heartbeat_s.max(0.001));
    let mut heartbeat_ticker = tokio::time::interval(heartbeat_period);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            next = stream.next() => {
                match next {
                    Some(Ok(bytes)) => {
                        seq += 1;
                        total_bytes += bytes.len() as u64;
                        last_activity = Instant::now();
                        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                        replay.record(&id, seq, b64.clone());
                        let chunk = OutboundMessage::ResponseChunk { id: id.clone(), seq, b64 };
                        bridge.send(&job.src, serde_json::to_value(&chunk).unwrap(), None).await;
                    }
                    Some(Err(e)) => {
                        error = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
            _ = heartbeat_ticker.tick() => {
                if last_activity.elapsed() >= heartbeat_period {
                    let keepalive = OutboundMessage::ResponseKeepalive { id: id.clone(), ts: now_ts() };
                    bridge.send(&job.src, serde_json::to_value(&keepalive).unwrap(), None).await;
                    last_activity = Instant::now();
                }
            }
        }
    }

    replay.mark_ended(&id);
    let end = OutboundMessage::ResponseEnd {
        id,
        ok: error.is_none(),
        bytes: total_bytes,
        last_seq: seq,
        lines: None,
        done_seen: None,
        truncated: None,
        error,
    };
    bridge.send(&job.src, serde_json::to_value(&end).unwrap(), None).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_license_replaces_nested_field() {
        let mut v = serde_json::json!({"details": {"license": "MIT", "name": "llama"}});
        redact_license(&mut v);
        assert_eq!(v["details"]["license"], "[omitted]");
        assert_eq!(v["details"]["name"], "llama");
    }

    #[test]
    fn redact_license_is_a_no_op_without_the_field() {
        let mut v = serde_json::json!({"name": "llama"});
        let before = v.clone();
        redact_license(&mut v);
        assert_eq!(v, before);
    }

    fn test_job(service: &str, path: Option<&str>) -> Job {
        Job {
            src: "peer1".into(),
            request_id: "r1".into(),
            service: service.to_string(),
            path: path.map(|p| p.to_string()),
            url: None,
            method: "GET".into(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            body: crate::relay::job::JobBody::Empty,
            verify_tls: true,
            streaming: RequestedStreaming::Auto,
        }
    }

    #[test]
    fn show_gate_fires_on_ollama_target_and_show_path() {
        let job = test_job("ollama_farm", Some("/api/show"));
        let body = serde_json::json!({"size": 4});
        assert!(should_redact_license(&job, &body));
    }

    #[test]
    fn show_gate_skips_unrelated_target_and_path() {
        let job = test_job("web_scrape", Some("/fetch"));
        let body = serde_json::json!({"license": "MIT"});
        assert!(!should_redact_license(&job, &body));
    }

    #[test]
    fn show_gate_fires_on_structural_sniff_regardless_of_target() {
        let job = test_job("web_scrape", Some("/fetch"));
        let body = serde_json::json!({"details": {"modelfile_sha": "abc"}});
        assert!(should_redact_license(&job, &body));
    }

    #[test]
    fn terminal_marker_detection() {
        assert!(line_is_terminal("data: [DONE]"));
        assert!(line_is_terminal(r#"{"done": true}"#));
        assert!(!line_is_terminal(r#"{"done": false}"#));
        assert!(!line_is_terminal("just a line"));
    }

    #[test]
    fn resolve_framing_prefers_explicit_request_over_content_type() {
        assert!(matches!(resolve_framing(RequestedStreaming::Lines, "application/octet-stream", false), ResolvedFraming::Lines));
        assert!(matches!(resolve_framing(RequestedStreaming::Auto, "text/event-stream", false), ResolvedFraming::Lines));
        assert!(matches!(resolve_framing(RequestedStreaming::Auto, "application/json", false), ResolvedFraming::Single));
    }

    #[test]
    fn resolve_framing_falls_back_to_service_default_stream() {
        assert!(matches!(resolve_framing(RequestedStreaming::Auto, "application/json", true), ResolvedFraming::Chunks));
        assert!(matches!(resolve_framing(RequestedStreaming::Lines, "application/json", true), ResolvedFraming::Lines));
    }
}
