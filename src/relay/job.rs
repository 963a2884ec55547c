//! The canonical HTTP request descriptor a Job carries, and the
//! normalization step that turns any inbound event shape into one.

use crate::error::RouterError;
use crate::overlay::HttpRequestDescriptor;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum JobBody {
    Empty,
    Bytes(Vec<u8>),
    Json(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedStreaming {
    /// No explicit request; the response's own content-type decides.
    Auto,
    Lines,
    Chunks,
}

/// A request unit created on inbound classification. Destroyed after its
/// response is fully emitted or a terminal error is produced.
#[derive(Debug, Clone)]
pub struct Job {
    pub src: String,
    pub request_id: String,
    pub service: String,
    pub path: Option<String>,
    pub url: Option<String>,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    pub body: JobBody,
    pub verify_tls: bool,
    pub streaming: RequestedStreaming,
}

fn parse_streaming(raw: Option<&str>) -> RequestedStreaming {
    match raw {
        Some("lines") | Some("sse") | Some("events") | Some("ndjson") => RequestedStreaming::Lines,
        Some("chunks") | Some("true") => RequestedStreaming::Chunks,
        _ => RequestedStreaming::Auto,
    }
}

fn decode_body(desc: &HttpRequestDescriptor) -> Result<JobBody, RouterError> {
    if let Some(json) = &desc.json {
        return Ok(JobBody::Json(json.clone()));
    }
    if let Some(b64) = &desc.body_b64 {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| RouterError::Protocol(format!("invalid body_b64: {e}")))?;
        return Ok(JobBody::Bytes(bytes));
    }
    if let Some(data) = &desc.data {
        return Ok(JobBody::Bytes(data.clone().into_bytes()));
    }
    if let Some(chunks) = &desc.body_chunks_b64 {
        let mut out = Vec::new();
        for c in chunks {
            let mut decoded = base64::engine::general_purpose::STANDARD
                .decode(c)
                .map_err(|e| RouterError::Protocol(format!("invalid body_chunks_b64 entry: {e}")))?;
            out.append(&mut decoded);
        }
        return Ok(JobBody::Bytes(out));
    }
    if let Some(chunks) = &desc.json_chunks_b64 {
        let mut out = Vec::new();
        for c in chunks {
            let mut decoded = base64::engine::general_purpose::STANDARD
                .decode(c)
                .map_err(|e| RouterError::Protocol(format!("invalid json_chunks_b64 entry: {e}")))?;
            out.append(&mut decoded);
        }
        let v: Value = serde_json::from_slice(&out)
            .map_err(|e| RouterError::Protocol(format!("json_chunks_b64 did not decode to JSON: {e}")))?;
        return Ok(JobBody::Json(v));
    }
    Ok(JobBody::Empty)
}

/// Normalize a generic HTTP request descriptor (the `req` sub-record shared
/// by `http.request`/`relay.http`/`relay.fetch` and the upload-finalize path)
/// into a Job. `default_service` is used when the descriptor names neither
/// `service` nor an absolute `url` but the caller already knows the target
/// (e.g. a service-specific event whose `opts.service` was already resolved).
pub fn normalize(
    src: impl Into<String>,
    request_id: impl Into<String>,
    desc: &HttpRequestDescriptor,
    default_service: Option<&str>,
    default_timeout: Duration,
    verify_default: bool,
) -> Result<Job, RouterError> {
    let service = desc
        .service
        .clone()
        .or_else(|| desc.target.clone())
        .or_else(|| default_service.map(|s| s.to_string()))
        .ok_or_else(|| RouterError::Protocol("request names no service or url".into()))?;

    let method = desc
        .method
        .clone()
        .unwrap_or_else(|| "GET".to_string())
        .to_uppercase();

    let timeout = desc
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);

    Ok(Job {
        src: src.into(),
        request_id: request_id.into(),
        service,
        path: desc.path.clone(),
        url: desc.url.clone(),
        method,
        headers: desc.headers.clone().unwrap_or_default(),
        timeout,
        body: decode_body(desc)?,
        verify_tls: desc.verify.unwrap_or(verify_default) && !desc.insecure_tls.unwrap_or(false),
        streaming: parse_streaming(desc.stream.as_deref()),
    })
}

#[cfg(test)]
impl Job {
    pub fn body_as_bytes_for_test(&self) -> Vec<u8> {
        match &self.body {
            JobBody::Bytes(b) => b.clone(),
            JobBody::Json(v) => serde_json::to_vec(v).unwrap(),
            JobBody::Empty => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(service: &str) -> HttpRequestDescriptor {
        HttpRequestDescriptor {
            service: Some(service.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn normalize_defaults_method_to_get() {
        let job = normalize("peer1", "r1", &desc("ollama_farm"), None, Duration::from_secs(30), true).unwrap();
        assert_eq!(job.method, "GET");
    }

    #[test]
    fn normalize_rejects_request_with_no_service_or_target() {
        let empty = HttpRequestDescriptor::default();
        let err = normalize("peer1", "r1", &empty, None, Duration::from_secs(30), true);
        assert!(err.is_err());
    }

    #[test]
    fn insecure_tls_overrides_verify() {
        let mut d = desc("ollama_farm");
        d.verify = Some(true);
        d.insecure_tls = Some(true);
        let job = normalize("peer1", "r1", &d, None, Duration::from_secs(30), true).unwrap();
        assert!(!job.verify_tls);
    }

    #[test]
    fn stream_field_selects_lines_mode() {
        let mut d = desc("ollama_farm");
        d.stream = Some("sse".to_string());
        let job = normalize("peer1", "r1", &d, None, Duration::from_secs(30), true).unwrap();
        assert_eq!(job.streaming, RequestedStreaming::Lines);
    }
}
