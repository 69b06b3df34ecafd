//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram, CounterVec,
    Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Full inventory syncs by outcome
    pub static ref SYNCS: CounterVec = register_counter_vec!(
        "dbaas_controlplane_syncs_total",
        "Total number of per-cluster inventory syncs by outcome",
        &["outcome"]
    ).unwrap();

    /// Duration of one full inventory sync over all clusters
    pub static ref SYNC_DURATION: Histogram = register_histogram!(
        "dbaas_controlplane_sync_duration_seconds",
        "Duration of full inventory syncs in seconds",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    /// Tracked database clusters by engine
    pub static ref DB_CLUSTERS: GaugeVec = register_gauge_vec!(
        "dbaas_controlplane_db_clusters",
        "Database clusters in the local inventory by engine",
        &["engine"]
    ).unwrap();

    /// Entries of the deletion watch set
    pub static ref DELETING_DB_CLUSTERS: Gauge = register_gauge!(
        "dbaas_controlplane_deleting_db_clusters",
        "Database clusters waiting for their deletion to be confirmed"
    ).unwrap();

    /// Operator installations by operator and outcome
    pub static ref OPERATOR_INSTALLS: CounterVec = register_counter_vec!(
        "dbaas_controlplane_operator_installs_total",
        "Total number of operator installations by operator and outcome",
        &["operator", "outcome"]
    ).unwrap();

    /// Version service lookups (hit, miss, error)
    pub static ref VERSION_SERVICE_REQUESTS: CounterVec = register_counter_vec!(
        "dbaas_controlplane_version_service_requests_total",
        "Version service matrix lookups by outcome",
        &["outcome"]
    ).unwrap();

    /// Control plane health (1 = healthy, 0 = unhealthy)
    pub static ref HEALTH: Gauge = register_gauge!(
        "dbaas_controlplane_health",
        "Control plane health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

static READY: AtomicBool = AtomicBool::new(false);

/// Flip the `/readyz` answer
pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::SeqCst);
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");

    HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path()))
}

fn route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" if READY.load(Ordering::SeqCst) => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
