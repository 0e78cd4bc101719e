//! Actix Web server exposing the producer and viewer sockets plus read-only
//! status endpoints.

use std::{sync::Arc, time::Duration};

use actix_cors::Cors;
use actix_http::ws::Codec;
use actix_web::{
    App, Error, HttpRequest, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use actix_web_actors::ws;
use async_stream::stream;
use futures_util::Stream;
use ml_core::{BoundingBox, DetectionEngine};
use serde::Serialize;
use tracing::{info, warn};
use vision::{
    Broadcaster, FrameState, IngestSession, ProducerSlot, RelayConfig, SharedState,
    ViewerRegistry, broadcast::round_confidence, telemetry,
};

use crate::sessions::{ProducerSession, ViewerSession, start_with_codec};

/// Shared state backing HTTP handlers.
pub(crate) struct AppState {
    pub(crate) config: Arc<RelayConfig>,
    pub(crate) engine: Arc<dyn DetectionEngine>,
    pub(crate) broadcaster: Arc<Broadcaster>,
    pub(crate) producer_slot: Arc<ProducerSlot>,
}

impl AppState {
    pub(crate) fn new(config: RelayConfig, engine: Arc<dyn DetectionEngine>) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::new(SharedState::new()),
            Arc::new(ViewerRegistry::new()),
        ));
        Self {
            config: Arc::new(config),
            engine,
            broadcaster,
            producer_slot: Arc::new(ProducerSlot::new()),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    producer_connected: bool,
    viewers: usize,
    frames_published: u64,
}

#[derive(Serialize)]
struct DetectionView<'a> {
    class: &'a str,
    confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    bbox: Option<BoundingBox>,
}

#[derive(Serialize)]
struct DetectionsResponse<'a> {
    frame_number: u64,
    timestamp_ms: i64,
    fresh: bool,
    detections: Vec<DetectionView<'a>>,
}

/// Register every route on an `App`.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/health", web::get().to(health_route))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/stream.mjpg", web::get().to(stream_handler))
        .route("/detections", web::get().to(detections_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/ws/camera", web::get().to(camera_socket))
        .route("/ws/frontend", web::get().to(frontend_socket));
}

/// Bind and run the HTTP server until the system shuts down.
pub(crate) async fn serve(config: RelayConfig, engine: Arc<dyn DetectionEngine>) -> std::io::Result<()> {
    let bind = (config.host.clone(), config.port);
    let state = web::Data::new(AppState::new(config, engine));
    info!(host = %bind.0, port = bind.1, "relay listening");

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind(bind)?
    .run()
    .await
}

/// Fixed readiness payload.
async fn index_route() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok", "optimized": true }))
}

async fn health_route(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        producer_connected: state.producer_slot.is_active(),
        viewers: state.broadcaster.registry().len(),
        frames_published: state.broadcaster.state().published_count(),
    })
}

/// Latest annotated frame as a JPEG.
async fn frame_handler(state: web::Data<AppState>) -> HttpResponse {
    match state.broadcaster.state().read() {
        Some(frame) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .insert_header((header::CACHE_CONTROL, "no-store"))
            .insert_header(("X-Frame-Number", frame.frame_number.to_string()))
            .body(frame.annotated_jpeg.clone()),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Multipart MJPEG parts, one per newly published state.
///
/// States are compared by identity: frame numbers restart when a producer
/// reconnects.
fn mjpeg_stream(shared: Arc<SharedState>) -> impl Stream<Item = Result<Bytes, Error>> {
    stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        let mut last_sent: Option<Arc<FrameState>> = None;
        loop {
            interval.tick().await;
            let Some(frame) = shared.read() else {
                continue;
            };
            if last_sent.as_ref().is_some_and(|last| Arc::ptr_eq(last, &frame)) {
                continue;
            }
            let mut payload = Vec::with_capacity(frame.annotated_jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(format!("X-Sequence: {}\r\n", frame.frame_number).as_bytes());
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&frame.annotated_jpeg);
            payload.extend_from_slice(b"\r\n");
            last_sent = Some(frame);
            yield Ok::<Bytes, Error>(Bytes::from(payload));
        }
    }
}

/// Stream the annotated feed as multipart MJPEG.
async fn stream_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"))
        .streaming(mjpeg_stream(state.broadcaster.state().clone()))
}

/// Most recent detection snapshot as JSON.
async fn detections_handler(state: web::Data<AppState>) -> HttpResponse {
    let Some(frame) = state.broadcaster.state().read() else {
        return HttpResponse::NoContent().finish();
    };
    HttpResponse::Ok().json(DetectionsResponse {
        frame_number: frame.frame_number,
        timestamp_ms: frame.timestamp_ms,
        fresh: frame.fresh,
        detections: frame
            .detections
            .iter()
            .map(|det| DetectionView {
                class: &det.label,
                confidence: round_confidence(det.confidence),
                bbox: det.bbox,
            })
            .collect(),
    })
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

/// Producer ingress. Only one producer may be connected at a time.
async fn camera_socket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let Some(lease) = state.producer_slot.try_acquire() else {
        warn!(
            peer = ?req.peer_addr(),
            "rejecting producer: another producer is already connected"
        );
        return Ok(HttpResponse::Conflict().body("a producer is already connected"));
    };

    let config = &state.config;
    let ingest = IngestSession::new(config, state.engine.clone(), state.broadcaster.clone())
        .with_lease(lease);
    let session = ProducerSession::new(ingest, config);
    let codec = Codec::new().max_size(config.max_frame_bytes);
    start_with_codec(session, &req, stream, codec)
}

/// Viewer egress.
async fn frontend_socket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let config = &state.config;
    let session = ViewerSession::new(
        state.broadcaster.clone(),
        config.viewer_queue,
        config.heartbeat_interval,
        config.client_timeout,
    );
    ws::start(session, &req, stream)
}
