use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use prometheus::{Encoder, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::infrastructure::fetcher::FetchCycleReport;

/// Process-wide Prometheus metrics for the fetch subsystem. Cloning is cheap;
/// every field is internally `Arc`-backed by the `prometheus` crate.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    fetch_outcomes_total: IntCounterVec,
    fetch_duration_seconds: HistogramVec,
    items_upserted_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let fetch_outcomes_total = IntCounterVec::new(
            Opts::new(
                "fetchd_fetch_outcomes_total",
                "Number of completed fetch cycles, by outcome",
            ),
            &["outcome"],
        )
        .expect("metric options are valid");

        let fetch_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "fetchd_fetch_duration_seconds",
                "Wall-clock duration of a single feed's fetch cycle",
            ),
            &["outcome"],
        )
        .expect("metric options are valid");

        let items_upserted_total = IntCounterVec::new(
            Opts::new(
                "fetchd_items_upserted_total",
                "Number of item rows written, by action",
            ),
            &["action"],
        )
        .expect("metric options are valid");

        registry
            .register(Box::new(fetch_outcomes_total.clone()))
            .expect("metric registration succeeds");
        registry
            .register(Box::new(fetch_duration_seconds.clone()))
            .expect("metric registration succeeds");
        registry
            .register(Box::new(items_upserted_total.clone()))
            .expect("metric registration succeeds");

        Self {
            registry,
            fetch_outcomes_total,
            fetch_duration_seconds,
            items_upserted_total,
        }
    }

    pub fn record(&self, report: &FetchCycleReport) {
        self.fetch_outcomes_total
            .with_label_values(&[report.outcome])
            .inc();
        self.fetch_duration_seconds
            .with_label_values(&[report.outcome])
            .observe(report.duration_ms as f64 / 1000.0);
        if report.inserted > 0 {
            self.items_upserted_total
                .with_label_values(&["inserted"])
                .inc_by(report.inserted as u64);
        }
        if report.updated > 0 {
            self.items_upserted_total
                .with_label_values(&["updated"])
                .inc_by(report.updated as u64);
        }
    }

    fn gather(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .expect("encoding the metric families never fails");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle(metrics: Arc<Metrics>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let buffer = metrics.gather();
            Ok(Response::builder()
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(Body::from(buffer))
                .unwrap())
        }
        (&Method::GET, "/healthz") => Ok(Response::new(Body::from("OK"))),
        _ => Ok(Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .unwrap()),
    }
}

/// Spawns the embedded `/metrics` + `/healthz` server. This worker is not
/// collocated with an API process in this crate's scope, so it always serves
/// its own pull endpoint rather than pushing to anything.
pub fn serve(metrics: Arc<Metrics>, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_conn| {
            let metrics = metrics.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| handle(metrics.clone(), req))) }
        });

        let server = Server::bind(&addr).serve(make_svc);
        tracing::info!(%addr, "metrics server listening");
        if let Err(e) = server.await {
            tracing::error!(error = %e, "metrics server exited");
        }
    })
}
