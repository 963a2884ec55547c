//! Chunked upload reassembler: accepts out-of-order request-body
//! chunks, tolerates loss, requests resends after a grace period, and
//! promotes the assembled body into a normal job.

use crate::error::RouterError;
use crate::overlay::HttpRequestDescriptor;
use crate::relay::job::{normalize, Job};
use base64::Engine;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const GRACE_AFTER_END: Duration = Duration::from_secs(2);
const RESEND_MIN_INTERVAL: Duration = Duration::from_secs(1);
const SWEEP_PERIOD: Duration = Duration::from_secs(2);
const NO_DATA_TIMEOUT: Duration = Duration::from_secs(20);
const GIVE_UP_AFTER_RESEND: Duration = Duration::from_secs(10);

struct UploadSession {
    src: String,
    request_id: String,
    req: Option<HttpRequestDescriptor>,
    total: usize,
    chunks: Vec<Option<Vec<u8>>>,
    got: usize,
    content_type: Option<String>,
    ended: bool,
    created_at: Instant,
    last_chunk_at: Instant,
    end_received_at: Option<Instant>,
    missing_requested_at: Option<Instant>,
}

impl UploadSession {
    fn new(src: String, request_id: String, req: Option<HttpRequestDescriptor>, total: usize, content_type: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            src,
            request_id,
            req,
            total,
            chunks: vec![None; total],
            got: 0,
            content_type,
            ended: false,
            created_at: now,
            last_chunk_at: now,
            end_received_at: None,
            missing_requested_at: None,
        }
    }

    fn missing_seqs(&self) -> Vec<u64> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| if c.is_none() { Some((i + 1) as u64) } else { None })
            .collect()
    }

    fn assembled_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            if let Some(bytes) = chunk {
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    fn into_job(self) -> Result<Job, (u16, String)> {
        let body_bytes = self.assembled_body();
        let is_json = self
            .content_type
            .as_deref()
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);

        let mut desc = self.req.clone().unwrap_or_default();
        if is_json {
            match serde_json::from_slice(&body_bytes) {
                Ok(v) => desc.json = Some(v),
                Err(e) => return Err((400, format!("upload body is not valid JSON: {e}"))),
            }
        } else {
            desc.body_b64 = Some(base64::engine::general_purpose::STANDARD.encode(&body_bytes));
        }

        normalize(self.src, self.request_id, &desc, None, Duration::from_secs(30), true)
            .map_err(|e| (400, e.to_string()))
    }
}

pub enum UploadOutcome {
    /// Nothing to do yet — still waiting on chunks or inside a grace window.
    Pending,
    /// A resend request should be emitted for these sequence numbers.
    RequestMissing(Vec<u64>),
    /// The upload is complete (or given up on): enqueue this job.
    Finalize(Job),
    /// A terminal error should be returned to the client; the session is gone.
    Error { status: u16, message: String },
}

pub struct UploadReassembler {
    sessions: DashMap<String, Mutex<UploadSession>>,
    chunk_upload_b: usize,
}

impl UploadReassembler {
    pub fn new(chunk_upload_b: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            chunk_upload_b,
        }
    }

    pub async fn begin(
        &self,
        upload_id: &str,
        src: &str,
        request_id: &str,
        req: Option<HttpRequestDescriptor>,
        total: usize,
        content_type: Option<String>,
    ) -> UploadOutcome {
        if let Some(entry) = self.sessions.get(upload_id) {
            // A session was created implicitly by chunks arriving first; merge.
            let mut session = entry.lock().await;
            if session.req.is_none() {
                session.req = req;
            }
            if session.content_type.is_none() {
                session.content_type = content_type;
            }
            return UploadOutcome::Pending;
        }
        self.sessions.insert(
            upload_id.to_string(),
            Mutex::new(UploadSession::new(src.to_string(), request_id.to_string(), req, total, content_type)),
        );
        UploadOutcome::Pending
    }

    pub async fn chunk(
        &self,
        upload_id: &str,
        seq: i64,
        b64: &str,
        req: Option<HttpRequestDescriptor>,
        total: Option<usize>,
        content_type: Option<String>,
        src: &str,
        request_id: &str,
    ) -> UploadOutcome {
        let bytes = match base64::engine::general_purpose::STANDARD.decode(b64) {
            Ok(b) => b,
            Err(e) => return UploadOutcome::Error { status: 400, message: format!("invalid chunk b64: {e}") },
        };
        if bytes.len() > self.chunk_upload_b {
            self.sessions.remove(upload_id);
            return UploadOutcome::Error {
                status: 413,
                message: format!("chunk too large ({} > {})", bytes.len(), self.chunk_upload_b),
            };
        }

        if !self.sessions.contains_key(upload_id) {
            let Some(total) = total else {
                // No session, and not enough information to create one implicitly: drop
                // silently — this is expected for retransmissions after completion.
                return UploadOutcome::Pending;
            };
            if req.is_none() {
                return UploadOutcome::Pending;
            }
            self.sessions.insert(
                upload_id.to_string(),
                Mutex::new(UploadSession::new(src.to_string(), request_id.to_string(), req.clone(), total, content_type.clone())),
            );
        }

        let Some(entry) = self.sessions.get(upload_id) else {
            return UploadOutcome::Pending;
        };
        let mut session = entry.lock().await;

        if seq < 1 || seq as usize > session.total {
            drop(session);
            self.sessions.remove(upload_id);
            return UploadOutcome::Error {
                status: 400,
                message: format!("chunk seq {seq} out of range 1..={}", total.unwrap_or(0)),
            };
        }
        let idx = (seq - 1) as usize;
        if session.chunks[idx].is_none() {
            session.got += 1;
        }
        session.chunks[idx] = Some(bytes);
        session.last_chunk_at = Instant::now();
        if session.req.is_none() {
            session.req = req;
        }
        if session.content_type.is_none() {
            session.content_type = content_type;
        }

        self.try_finalize_locked(upload_id, &mut session)
    }

    pub async fn end(&self, upload_id: &str) -> UploadOutcome {
        let Some(entry) = self.sessions.get(upload_id) else {
            // Late `end` after finalization: the session lookup simply misses.
            return UploadOutcome::Pending;
        };
        let mut session = entry.lock().await;
        session.ended = true;
        session.end_received_at = Some(Instant::now());
        self.try_finalize_locked(upload_id, &mut session)
    }

    fn try_finalize_locked(&self, upload_id: &str, session: &mut UploadSession) -> UploadOutcome {
        if session.got == session.total {
            return self.finalize_and_remove(upload_id);
        }
        if !session.ended {
            return UploadOutcome::Pending;
        }
        let Some(end_at) = session.end_received_at else {
            return UploadOutcome::Pending;
        };
        let since_end = end_at.elapsed();
        if since_end < GRACE_AFTER_END {
            return UploadOutcome::Pending;
        }
        match session.missing_requested_at {
            None => {
                session.missing_requested_at = Some(Instant::now());
                UploadOutcome::RequestMissing(session.missing_seqs())
            }
            Some(last) if last.elapsed() < RESEND_MIN_INTERVAL => UploadOutcome::Pending,
            Some(_) => {
                session.missing_requested_at = Some(Instant::now());
                UploadOutcome::RequestMissing(session.missing_seqs())
            }
        }
    }

    fn finalize_and_remove(&self, upload_id: &str) -> UploadOutcome {
        let Some((_, session_mutex)) = self.sessions.remove(upload_id) else {
            return UploadOutcome::Pending;
        };
        let session = session_mutex.into_inner();
        match session.into_job() {
            Ok(job) => UploadOutcome::Finalize(job),
            Err((status, message)) => UploadOutcome::Error { status, message },
        }
    }

    /// Background cleanup sweep. Applies the four timeout rules and
    /// returns `(upload_id, source_address, outcome)` for anything that needs
    /// to be emitted by the caller (a 408, a partial-body finalize, or a
    /// resend) — the source address is captured from the session itself
    /// since by sweep time the original inbound message is long gone.
    pub async fn sweep(&self) -> Vec<(String, String, UploadOutcome)> {
        let mut results = Vec::new();
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some(entry) = self.sessions.get(&id) else { continue };
            let mut session = entry.value().lock().await;
            let age = session.created_at.elapsed();
            let src = session.src.clone();

            if session.got == 0 && age >= NO_DATA_TIMEOUT {
                drop(session);
                self.sessions.remove(&id);
                results.push((id, src, UploadOutcome::Error { status: 408, message: RouterError::UploadTimeout.to_string() }));
                continue;
            }
            if session.got > 0 && !session.ended && age >= NO_DATA_TIMEOUT {
                drop(session);
                let outcome = self.finalize_and_remove(&id);
                results.push((id, src, outcome));
                continue;
            }
            if session.ended {
                if let Some(req_at) = session.missing_requested_at {
                    if req_at.elapsed() >= GIVE_UP_AFTER_RESEND {
                        drop(session);
                        let outcome = self.finalize_and_remove(&id);
                        results.push((id, src, outcome));
                        continue;
                    }
                } else if let Some(end_at) = session.end_received_at {
                    if end_at.elapsed() >= GRACE_AFTER_END {
                        let outcome = self.try_finalize_locked(&id, &mut session);
                        drop(session);
                        results.push((id, src, outcome));
                        continue;
                    }
                }
            }
        }
        results
    }

    /// Current `(total, got)` for an in-flight session, used to fill in the
    /// `upload.missing` message's bookkeeping fields.
    pub async fn progress(&self, upload_id: &str) -> Option<(usize, usize)> {
        let entry = self.sessions.get(upload_id)?;
        let session = entry.value().lock().await;
        Some((session.total, session.got))
    }

    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        mut on_outcome: impl FnMut(String, String, UploadOutcome) + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            loop {
                ticker.tick().await;
                for (id, src, outcome) in self.sweep().await {
                    on_outcome(id, src, outcome);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[tokio::test]
    async fn finalizes_when_all_chunks_present_in_order() {
        let r = UploadReassembler::new(1024);
        let desc = HttpRequestDescriptor {
            service: Some("ollama_farm".into()),
            ..Default::default()
        };
        r.begin("u1", "peer1", "r1", Some(desc), 3, None).await;
        for (seq, s) in [(1, "a"), (2, "b"), (3, "c")] {
            r.chunk("u1", seq, &b64(s), None, None, None, "peer1", "r1").await;
        }
        let outcome = r.end("u1").await;
        match outcome {
            UploadOutcome::Finalize(job) => {
                assert_eq!(job.body_as_bytes_for_test(), b"abc");
            }
            _ => panic!("expected finalize"),
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble_identically() {
        let r1 = UploadReassembler::new(1024);
        let desc = HttpRequestDescriptor {
            service: Some("ollama_farm".into()),
            ..Default::default()
        };
        r1.begin("u1", "peer1", "r1", Some(desc.clone()), 3, None).await;
        for (seq, s) in [(3, "c"), (1, "a"), (2, "b")] {
            r1.chunk("u1", seq, &b64(s), None, None, None, "peer1", "r1").await;
        }
        let outcome1 = r1.end("u1").await;

        let r2 = UploadReassembler::new(1024);
        r2.begin("u1", "peer1", "r1", Some(desc), 3, None).await;
        for (seq, s) in [(1, "a"), (2, "b"), (3, "c")] {
            r2.chunk("u1", seq, &b64(s), None, None, None, "peer1", "r1").await;
        }
        let outcome2 = r2.end("u1").await;

        let (UploadOutcome::Finalize(j1), UploadOutcome::Finalize(j2)) = (outcome1, outcome2) else {
            panic!("expected both to finalize");
        };
        assert_eq!(j1.body_as_bytes_for_test(), j2.body_as_bytes_for_test());
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_and_destroys_session() {
        let r = UploadReassembler::new(4);
        let outcome = r.chunk("u1", 1, &b64("too big"), Some(HttpRequestDescriptor::default()), Some(1), None, "peer1", "r1").await;
        assert!(matches!(outcome, UploadOutcome::Error { status: 413, .. }));
    }

    #[tokio::test]
    async fn end_with_missing_chunk_is_pending_inside_grace_window() {
        let r = UploadReassembler::new(1024);
        let desc = HttpRequestDescriptor { service: Some("ollama_farm".into()), ..Default::default() };
        r.begin("u1", "peer1", "r1", Some(desc), 2, None).await;
        r.chunk("u1", 1, &b64("a"), None, None, None, "peer1", "r1").await;
        let outcome = r.end("u1").await;
        assert!(matches!(outcome, UploadOutcome::Pending));
    }

    #[tokio::test]
    async fn late_end_after_finalization_is_a_silent_no_op() {
        let r = UploadReassembler::new(1024);
        let desc = HttpRequestDescriptor { service: Some("ollama_farm".into()), ..Default::default() };
        r.begin("u1", "peer1", "r1", Some(desc), 1, None).await;
        r.chunk("u1", 1, &b64("a"), None, None, None, "peer1", "r1").await;
        let first = r.end("u1").await;
        assert!(matches!(first, UploadOutcome::Finalize(_)));
        let second = r.end("u1").await;
        assert!(matches!(second, UploadOutcome::Pending));
    }

    #[tokio::test]
    async fn seq_out_of_range_is_rejected() {
        let r = UploadReassembler::new(1024);
        let desc = HttpRequestDescriptor { service: Some("ollama_farm".into()), ..Default::default() };
        r.begin("u1", "peer1", "r1", Some(desc), 2, None).await;
        let outcome = r.chunk("u1", 5, &b64("a"), None, None, None, "peer1", "r1").await;
        assert!(matches!(outcome, UploadOutcome::Error { status: 400, .. }));
    }
}
