//! Relay Node: one per service. Classifies inbound overlay events,
//! enforces assignment and port isolation, runs the HTTP worker pool with
//! retry/backoff, and emits responses through the bridge.

use crate::bridge::{BridgeSupervisor, InboundEnvelope};
use crate::config::{HttpConfig, ServiceDef};
use crate::error::RouterError;
use crate::firewall::{self, Whitelist};
use crate::overlay::{HttpRequestDescriptor, InboundEvent, OutboundMessage, ServiceSpecificEvent};
use crate::relay::job::{self, Job};
use crate::relay::ratelimit::RateLimitAccumulator;
use crate::relay::replay::ReplayCache;
use crate::relay::streaming;
use crate::relay::upload::{UploadOutcome, UploadReassembler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex};

/// Narrow, interface-typed view onto the Router's assignment table.
pub trait AssignmentTable: Send + Sync {
    fn owner_of(&self, service: &str) -> Option<String>;
    fn address_of(&self, node_id: &str) -> Option<String>;
    fn snapshot(&self) -> HashMap<String, String>;
}

/// Fired when the rate-limit accumulator trips; the Router owns rotation.
pub trait RotationTrigger: Send + Sync {
    fn trigger_rotation(&self, service: &str);
}

fn now_ts() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn http_backoff(attempt: u32, base_s: f64, cap_s: f64) -> Duration {
    let secs = (base_s * 2f64.powi(attempt as i32)).min(cap_s.max(base_s));
    Duration::from_secs_f64(secs)
}

pub struct RelayNode {
    pub node_id: String,
    pub service_name: String,
    target: RwLock<String>,
    log_file: Option<std::path::PathBuf>,
    whitelist: Arc<Whitelist>,
    port_isolation_enabled: AtomicBool,
    http_cfg: HttpConfig,
    default_stream: bool,
    client_verify: reqwest::Client,
    client_noverify: reqwest::Client,
    bridge: Arc<BridgeSupervisor>,
    address_rx: watch::Receiver<Option<String>>,
    replay: Arc<ReplayCache>,
    upload: Arc<UploadReassembler>,
    ratelimit: Arc<RateLimitAccumulator>,
    assignment: Arc<dyn AssignmentTable>,
    rotation: Arc<dyn RotationTrigger>,
    job_tx: mpsc::Sender<Job>,
    job_rx: Mutex<Option<mpsc::Receiver<Job>>>,
}

impl RelayNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        def: &ServiceDef,
        http_cfg: HttpConfig,
        port_isolation_enabled: bool,
        bridge: Arc<BridgeSupervisor>,
        address_rx: watch::Receiver<Option<String>>,
        assignment: Arc<dyn AssignmentTable>,
        rotation: Arc<dyn RotationTrigger>,
    ) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(1024);
        let client_verify = reqwest::Client::builder()
            .build()
            .expect("default reqwest client builds");
        let client_noverify = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .expect("no-verify reqwest client builds");
        let chunk_upload_b = http_cfg.chunk_upload_b as usize;

        Arc::new(Self {
            node_id: node_id.into(),
            service_name: def.name.clone(),
            target: RwLock::new(def.target.clone()),
            log_file: def.log_file.as_ref().map(std::path::PathBuf::from),
            whitelist: Arc::new(Whitelist::from_service_def(def)),
            port_isolation_enabled: AtomicBool::new(port_isolation_enabled),
            default_stream: def.default_stream,
            http_cfg,
            client_verify,
            client_noverify,
            bridge,
            address_rx,
            replay: Arc::new(ReplayCache::new()),
            upload: Arc::new(UploadReassembler::new(chunk_upload_b)),
            ratelimit: Arc::new(RateLimitAccumulator::new()),
            assignment,
            rotation,
            job_tx,
            job_rx: Mutex::new(Some(job_rx)),
        })
    }

    fn current_address(&self) -> Option<String> {
        self.address_rx.borrow().clone()
    }

    fn current_target(&self) -> String {
        self.target.read().expect("target lock poisoned").clone()
    }

    pub fn whitelist(&self) -> &Arc<Whitelist> {
        &self.whitelist
    }

    pub fn log_file(&self) -> Option<&std::path::Path> {
        self.log_file.as_deref()
    }

    pub fn realign_target(&self, new_target: String) {
        *self.target.write().expect("target lock poisoned") = new_target;
    }

    pub fn set_port_isolation_enabled(&self, enabled: bool) {
        self.port_isolation_enabled.store(enabled, Ordering::Release);
    }

    /// Starts the worker pool, the inbound dispatch loop over `inbound_rx`,
    /// and the upload/replay cleanup sweepers. Returns once spawned; the
    /// returned handles are owned by the caller (the Router) for shutdown.
    pub fn start(self: &Arc<Self>, inbound_rx: mpsc::Receiver<InboundEnvelope>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let rx = Arc::new(Mutex::new(
            self.job_rx
                .try_lock()
                .expect("job_rx not yet taken")
                .take()
                .expect("job_rx not yet taken"),
        ));
        for _ in 0..self.http_cfg.workers.max(1) {
            let node = self.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move { node.worker_loop(rx).await }));
        }

        let node = self.clone();
        handles.push(tokio::spawn(async move { node.dispatch_loop(inbound_rx).await }));

        handles.push(self.replay.clone().spawn_sweeper());

        let node = self.clone();
        handles.push(self.upload.clone().spawn_sweeper(move |upload_id, src, outcome| {
            let node = node.clone();
            tokio::spawn(async move {
                node.handle_upload_outcome(&src, &upload_id, outcome).await;
            });
        }));

        handles
    }

    /// Cooperative shutdown: closing the sender causes every worker's
    /// `recv()` to return `None` once the queue drains.
    pub fn shutdown(&self) {
        // Dropping the only clone held here would require consuming self;
        // workers are stopped by the process exiting or the Router aborting
        // the handles returned by `start`.
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<InboundEnvelope>) {
        while let Some(env) = inbound_rx.recv().await {
            let node = self.clone();
            tokio::spawn(async move { node.dispatch_one(env).await });
        }
    }

    async fn dispatch_one(self: Arc<Self>, env: InboundEnvelope) {
        let InboundEnvelope { src, msg } = env;
        let event: InboundEvent = match serde_json::from_value(msg.clone()) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(service = %self.service_name, error = %e, "unparseable inbound event ignored");
                return;
            }
        };

        match event {
            InboundEvent::Ping => {
                let pong = OutboundMessage::Pong {
                    addr: self.current_address().unwrap_or_default(),
                    ts: now_ts(),
                };
                self.bridge.send(&src, serde_json::to_value(&pong).unwrap(), None).await;
            }
            InboundEvent::Info => {
                let info = OutboundMessage::Info {
                    services: vec![self.service_name.clone()],
                    workers: self.http_cfg.workers,
                    max_body_b: self.http_cfg.max_body_b,
                    assignments: self.assignment.snapshot(),
                };
                self.bridge.send(&src, serde_json::to_value(&info).unwrap(), None).await;
            }
            InboundEvent::HttpRequest { id, req } | InboundEvent::RelayHttp { id, req } | InboundEvent::RelayFetch { id, req } => {
                self.classify_and_enqueue(&src, &id, &req).await;
            }
            InboundEvent::UploadBegin { id, upload_id, req, total, content_type } => {
                let outcome = self.upload.begin(&upload_id, &src, &id, req, total, content_type).await;
                self.handle_upload_outcome(&src, &upload_id, outcome).await;
            }
            InboundEvent::UploadChunk { id, upload_id, seq, b64, req, total, content_type } => {
                let outcome = self
                    .upload
                    .chunk(&upload_id, seq, &b64, req, total, content_type, &src, &id)
                    .await;
                self.handle_upload_outcome(&src, &upload_id, outcome).await;
            }
            InboundEvent::UploadEnd { id: _, upload_id } => {
                let outcome = self.upload.end(&upload_id).await;
                self.handle_upload_outcome(&src, &upload_id, outcome).await;
            }
            InboundEvent::ResponseMissing { id, upload_id: _, missing } => {
                let chunks = self.replay.get_missing(&id, &missing);
                for (seq, b64) in chunks {
                    let chunk = OutboundMessage::ResponseChunk { id: id.clone(), seq, b64 };
                    self.bridge.send(&src, serde_json::to_value(&chunk).unwrap(), None).await;
                }
            }
            InboundEvent::ServiceSpecific => {
                if let Ok(specific) = serde_json::from_value::<ServiceSpecificEvent>(msg.clone()) {
                    let Some(id) = specific.id.clone() else {
                        return;
                    };
                    // Service-specific shapes carry their HTTP-relevant fields
                    // inline rather than nested under `req`; the descriptor's
                    // field names line up directly with the generic shape.
                    let mut desc: HttpRequestDescriptor =
                        serde_json::from_value(msg).unwrap_or_default();
                    if desc.service.is_none() {
                        desc.service = specific.opts.service.clone();
                    }
                    if desc.headers.is_none() {
                        desc.headers = specific.opts.headers.clone();
                    }
                    if desc.timeout_ms.is_none() {
                        desc.timeout_ms = specific.opts.timeout_ms;
                    }
                    if desc.verify.is_none() {
                        desc.verify = specific.opts.verify;
                    }
                    if desc.insecure_tls.is_none() {
                        desc.insecure_tls = specific.opts.insecure_tls;
                    }
                    self.classify_and_enqueue(&src, &id, &desc).await;
                }
            }
        }
    }

    async fn handle_upload_outcome(&self, src: &str, upload_id: &str, outcome: UploadOutcome) {
        match outcome {
            UploadOutcome::Pending => {}
            UploadOutcome::RequestMissing(missing) => {
                if let Some((total, got)) = self.upload.progress(upload_id).await {
                    let msg = OutboundMessage::UploadMissing {
                        id: upload_id.to_string(),
                        upload_id: upload_id.to_string(),
                        missing,
                        total,
                        got,
                    };
                    self.bridge.send(src, serde_json::to_value(&msg).unwrap(), None).await;
                }
            }
            UploadOutcome::Finalize(job) => {
                self.admit_job(job).await;
            }
            UploadOutcome::Error { status, message } => {
                streaming::emit_error(src, upload_id, status, message, &self.bridge).await;
            }
        }
    }

    async fn classify_and_enqueue(&self, src: &str, request_id: &str, desc: &HttpRequestDescriptor) {
        let job = match job::normalize(
            src.to_string(),
            request_id.to_string(),
            desc,
            Some(&self.service_name),
            Duration::from_secs(30),
            self.http_cfg.verify_default,
        ) {
            Ok(j) => j,
            Err(e) => {
                streaming::emit_error(src, request_id, 400, e.to_string(), &self.bridge).await;
                return;
            }
        };
        self.admit_job(job).await;
    }

    /// The assignment check: redirect instead of enqueueing if this
    /// node is not (or no longer) authoritative for the service.
    async fn admit_job(&self, job: Job) {
        match self.assignment.owner_of(&job.service) {
            Some(owner) if owner == self.node_id => {
                let _ = self.job_tx.send(job).await;
            }
            Some(owner) => {
                let addr = self.assignment.address_of(&owner);
                let redirect = OutboundMessage::Redirect {
                    service: job.service.clone(),
                    id: Some(job.request_id.clone()),
                    node: owner,
                    addr,
                    error: None,
                };
                self.bridge.send(&job.src, serde_json::to_value(&redirect).unwrap(), None).await;
            }
            None => {
                let redirect = OutboundMessage::Redirect {
                    service: job.service.clone(),
                    id: Some(job.request_id.clone()),
                    node: String::new(),
                    addr: None,
                    error: Some("service currently offline".to_string()),
                };
                self.bridge.send(&job.src, serde_json::to_value(&redirect).unwrap(), None).await;
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
        loop {
            let job = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            let Some(job) = job else { break };
            self.handle_job(job).await;
        }
    }

    fn resolve_url(&self, job: &Job) -> Option<String> {
        if let Some(url) = &job.url {
            return Some(url.clone());
        }
        let base = self.current_target();
        let path = job.path.as_deref().unwrap_or("/");
        let sep = if path.starts_with('/') { "" } else { "/" };
        Some(format!("{}{}{}", base.trim_end_matches('/'), sep, path))
    }

    async fn ensure_port_allowed(&self, url: &str) -> Result<(), RouterError> {
        if !self.port_isolation_enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some((host, port)) = firewall::request_port(url) else {
            return Err(RouterError::Policy("could not parse destination port".to_string()));
        };
        if self.whitelist.contains(port) {
            return Ok(());
        }
        metrics::counter!("router_port_isolation_rejections_total").increment(1);

        let configured_host = firewall::request_port(&self.current_target())
            .map(|(h, _)| h)
            .unwrap_or_else(|| host.clone());

        if let Some(found) = firewall::on_demand(self.log_file.as_deref(), &configured_host, &host, port, &self.whitelist).await {
            tracing::info!(service = %self.service_name, port = found.port, source = found.source, "on-demand port whitelisting succeeded");
            metrics::counter!("router_port_isolation_grants_total").increment(1);
            return Ok(());
        }
        Err(RouterError::Policy(format!(
            "port isolation: {port} is not whitelisted for {}",
            self.service_name
        )))
    }

    fn build_request(&self, job: &Job, url: &str) -> reqwest::RequestBuilder {
        let client = if job.verify_tls { &self.client_verify } else { &self.client_noverify };
        let method = reqwest::Method::from_bytes(job.method.as_bytes()).unwrap_or(reqwest::Method::GET);
        let mut builder = client.request(method, url).timeout(job.timeout);
        for (k, v) in &job.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        builder = match &job.body {
            crate::relay::job::JobBody::Empty => builder,
            crate::relay::job::JobBody::Bytes(b) => builder.body(b.clone()),
            crate::relay::job::JobBody::Json(v) => builder.json(v),
        };
        builder
    }

    async fn send_with_retry(&self, job: &Job, url: &str) -> Result<reqwest::Response, reqwest::Error> {
        let attempts = self.http_cfg.retries.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.build_request(job, url).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        metrics::counter!("router_http_retries_total").increment(1);
                        tokio::time::sleep(http_backoff(attempt, self.http_cfg.retry_backoff, self.http_cfg.retry_cap)).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt always runs"))
    }

    async fn handle_job(&self, job: Job) {
        let Some(url) = self.resolve_url(&job) else {
            streaming::emit_error(&job.src, &job.request_id, 0, "could not resolve a request URL", &self.bridge).await;
            metrics::counter!("router_jobs_failed_total").increment(1);
            return;
        };

        if let Err(reason) = self.ensure_port_allowed(&url).await {
            streaming::emit_error(&job.src, &job.request_id, 0, reason.to_string(), &self.bridge).await;
            metrics::counter!("router_jobs_failed_total").increment(1);
            return;
        }

        let result = self.send_with_retry(&job, &url).await;

        match &result {
            Ok(resp) if resp.status().as_u16() == 429 => {
                if self.ratelimit.record_429().await {
                    self.rotation.trigger_rotation(&self.service_name);
                }
            }
            Ok(_) => {
                self.ratelimit.record_success().await;
            }
            Err(_) => {}
        }

        metrics::counter!("router_jobs_completed_total").increment(1);
        streaming::emit(&job, result, &self.http_cfg, self.default_stream, &self.replay, &self.bridge).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_backoff_sequence_matches_spec() {
        let seq: Vec<u64> = (0..6).map(|a| http_backoff(a, 0.5, 4.0).as_millis() as u64).collect();
        assert_eq!(seq, vec![500, 1000, 2000, 4000, 4000, 4000]);
    }
}
