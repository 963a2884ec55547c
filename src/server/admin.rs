//! Admin HTTP surface: `/healthz`, `/readyz`, `/metrics`,
//! `/status`. Mirrors the gateway's own admin server — same hyper
//! boilerplate, a different handful of routes.

use crate::router::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::Arc;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

#[derive(Clone)]
pub struct AdminState {
    pub router: Arc<Router>,
    pub metrics: crate::metrics::Metrics,
}

pub fn handle_admin(req: Request<Incoming>, state: AdminState) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let status = state.router.status_snapshot();
            let up = status.values().filter(|s| s.up).count();
            Ok(Response::builder()
                .status(200)
                .body(full_body(format!(
                    r#"{{"status":"ready","services":{},"up":{}}}"#,
                    status.len(),
                    up,
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/status" => {
            let status = state.router.status_snapshot();
            let body = serde_json::to_string_pretty(&status).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
