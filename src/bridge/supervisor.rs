//! Per-service bridge supervisor: owns the child overlay-transport
//! process, restarts it with exponential backoff, and mediates the
//! bidirectional line-protocol exchange with it.

use super::protocol::{encode_dm, parse_line, ChildOutboundRecord, DmRecord, STATE_PROBE_EXIT};
use crate::config::BridgeConfig;
use crate::error::RouterError;
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex, Notify};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One inbound message delivered up to the Relay Node, `(source_address, body)`.
pub struct InboundEnvelope {
    pub src: String,
    pub msg: Value,
}

/// Bounded, drop-oldest outbound queue. `send` never blocks the caller —
/// this is explicitly at-most-once delivery.
struct SendQueue {
    inner: Mutex<VecDeque<DmRecord>>,
    notify: Notify,
    cap: usize,
}

impl SendQueue {
    fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap.min(256))),
            notify: Notify::new(),
            cap,
        }
    }

    async fn push(&self, record: DmRecord) {
        let mut q = self.inner.lock().await;
        if q.len() >= self.cap {
            q.pop_front();
        }
        q.push_back(record);
        drop(q);
        self.notify.notify_one();
    }

    async fn pop(&self) -> DmRecord {
        loop {
            {
                let mut q = self.inner.lock().await;
                if let Some(rec) = q.pop_front() {
                    return rec;
                }
            }
            self.notify.notified().await;
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * 2, MAX_BACKOFF)
}

fn is_self_probe(msg: &Value) -> bool {
    msg.get("type").and_then(Value::as_str) == Some("self_probe")
}

pub struct BridgeSupervisor {
    service: String,
    bridge_exe: String,
    seed_hex: String,
    bridge_cfg: BridgeConfig,
    queue: SendQueue,
    address_tx: watch::Sender<Option<String>>,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    stopped: AtomicBool,
    running: AtomicBool,
}

impl BridgeSupervisor {
    pub fn new(
        service: impl Into<String>,
        bridge_cfg: BridgeConfig,
        seed_hex: impl Into<String>,
        inbound_tx: mpsc::Sender<InboundEnvelope>,
    ) -> (Arc<Self>, watch::Receiver<Option<String>>) {
        let (address_tx, address_rx) = watch::channel(None);
        let bridge_exe = bridge_cfg.bridge_exe.clone();
        let cap = bridge_cfg.send_queue_cap;
        let sup = Arc::new(Self {
            service: service.into(),
            bridge_exe,
            seed_hex: seed_hex.into(),
            bridge_cfg,
            queue: SendQueue::new(cap),
            address_tx,
            inbound_tx,
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
        });
        (sup, address_rx)
    }

    /// Idempotent: spawns the supervise loop once; repeat calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let sup = self.clone();
        tokio::spawn(async move { sup.supervise_loop().await });
    }

    /// Enqueue an outbound directed message. Never blocks; drops the oldest
    /// queued message when full.
    pub async fn send(&self, to: impl Into<String>, data: Value, opts: Option<Value>) {
        self.queue
            .push(DmRecord {
                to: to.into(),
                data,
                opts,
            })
            .await;
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    async fn supervise_loop(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        while !self.stopped.load(Ordering::Acquire) {
            match self.spawn_and_run().await {
                Ok(()) => {
                    tracing::info!(service = %self.service, "bridge reached ready at least once before exiting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    tracing::warn!(service = %self.service, error = %e, "bridge spawn/run failed");
                }
            }
            let _ = self.address_tx.send(None);
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            tracing::info!(service = %self.service, delay_ms = backoff.as_millis(), "scheduling bridge restart");
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn spawn_and_run(self: &Arc<Self>) -> Result<(), RouterError> {
        let mut cmd = Command::new(&self.bridge_exe);
        cmd.env("OVERLAY_SEED_HEX", &self.seed_hex)
            .env("OVERLAY_NUM_SUBCLIENTS", self.bridge_cfg.num_subclients.to_string())
            .env("OVERLAY_BRIDGE_SEED_WS", &self.bridge_cfg.seed_ws)
            .env("OVERLAY_SELF_PROBE_MS", self.bridge_cfg.self_probe_ms.to_string())
            .env("OVERLAY_SELF_PROBE_FAILS", self.bridge_cfg.self_probe_fails.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RouterError::Transport(format!("failed to spawn bridge: {e}")))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let service = self.service.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(service = %service, bridge_stderr = %line);
            }
        });

        let writer_queue = Arc::new(());
        let _ = writer_queue;
        let sup_for_writer = self.clone();
        let writer_handle = tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                let record = sup_for_writer.queue.pop().await;
                match encode_dm(&record) {
                    Ok(mut line) => {
                        line.push('\n');
                        if stdin.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode outbound dm"),
                }
            }
        });

        let mut got_ready = false;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(ChildOutboundRecord::Ready { address }) => {
                        let _ = self.address_tx.send(Some(address));
                        got_ready = true;
                    }
                    Ok(ChildOutboundRecord::Status { state, detail }) => {
                        if state == STATE_PROBE_EXIT {
                            tracing::warn!(service = %self.service, ?detail, "bridge self-probe exhausted, treating as death");
                            break;
                        }
                        tracing::info!(service = %self.service, state = %state, ?detail, "bridge status");
                    }
                    Ok(ChildOutboundRecord::Inbound { src, msg }) => {
                        if !is_self_probe(&msg) {
                            let _ = self.inbound_tx.send(InboundEnvelope { src, msg }).await;
                        }
                    }
                    Ok(ChildOutboundRecord::Error { msg }) => {
                        tracing::warn!(service = %self.service, child_error = %msg);
                    }
                    Err(e) => {
                        tracing::warn!(service = %self.service, error = %e, line = %line, "malformed child record");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(service = %self.service, error = %e, "bridge stdout read error");
                    break;
                }
            }
        }

        writer_handle.abort();
        let _ = child.start_kill();
        let _ = child.wait().await;

        if got_ready {
            Ok(())
        } else {
            Err(RouterError::Transport("bridge exited before reporting ready".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_matches_spec() {
        let mut b = INITIAL_BACKOFF;
        let expected_ms = [500, 1000, 2000, 4000, 8000, 16000, 30000, 30000];
        for want in expected_ms {
            assert_eq!(b.as_millis() as u64, want);
            b = next_backoff(b);
        }
    }

    #[tokio::test]
    async fn send_queue_drops_oldest_when_full() {
        let q = SendQueue::new(2);
        q.push(DmRecord {
            to: "a".into(),
            data: Value::Null,
            opts: None,
        })
        .await;
        q.push(DmRecord {
            to: "b".into(),
            data: Value::Null,
            opts: None,
        })
        .await;
        q.push(DmRecord {
            to: "c".into(),
            data: Value::Null,
            opts: None,
        })
        .await;

        let first = q.pop().await;
        let second = q.pop().await;
        assert_eq!(first.to, "b");
        assert_eq!(second.to, "c");
    }

    #[test]
    fn self_probe_is_detected() {
        let probe = serde_json::json!({"type": "self_probe"});
        let normal = serde_json::json!({"type": "ping"});
        assert!(is_self_probe(&probe));
        assert!(!is_self_probe(&normal));
    }
}
