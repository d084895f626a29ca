//! HTTP surface.
//!
//! Thin request/response translation over the controller: four routes
//! under `/api/v1`, JSON in and out, with every error rendered as
//! `{code, message, details}` from the service taxonomy. TLS follows the
//! configured protocol; plain HTTP serves through axum's graceful
//! shutdown, HTTPS through a rustls accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{Config, HttpsConfig, Protocol};
use crate::controller::Controller;
use crate::error::ServiceError;
use crate::job::{JobAction, JobActionRequest, JobRequest, JobStats};

/// Server-side request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Error payload rendered for every failure.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u32,
    message: String,
    details: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            code: self.code(),
            message: error_label(&self).to_string(),
            details: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn error_label(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::JobStopped(_) => "job stopped",
        ServiceError::ReadRequestBody(_) => "read request body failed",
        ServiceError::HandleJsonData(_) => "handle json data failed",
        ServiceError::MissingBackendHandler => "missing backend handler",
        ServiceError::LaunchJob(_) => "launch job failed",
        ServiceError::UnknownJob(_) => "unknown job",
        ServiceError::InvalidParams(_) => "invalid parameters",
        ServiceError::RedisTransient(_) => "redis error",
        ServiceError::CronParse { .. } => "cron spec parse failed",
        ServiceError::JobNotFound(_) => "job not found",
    }
}

/// Envelope wrapping job stats in responses.
#[derive(Debug, Serialize)]
struct StatsEnvelope {
    stats: JobStats,
}

type AppState = Arc<Controller>;

/// Builds the API router.
pub fn router(controller: AppState) -> Router {
    Router::new()
        .route("/api/v1/jobs", post(launch_job))
        .route("/api/v1/jobs/{id}", get(get_job).post(job_action))
        .route("/api/v1/stats", get(check_status))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

async fn launch_job(
    State(controller): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<StatsEnvelope>), ServiceError> {
    let request: JobRequest = decode_body(body)?;
    let stats = controller.launch_job(request).await?;
    Ok((StatusCode::ACCEPTED, Json(StatsEnvelope { stats })))
}

async fn get_job(
    State(controller): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatsEnvelope>, ServiceError> {
    let stats = controller.get_job(&id).await?;
    Ok(Json(StatsEnvelope { stats }))
}

async fn job_action(
    State(controller): State<AppState>,
    Path(id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ServiceError> {
    let request: JobActionRequest = decode_body(body)?;
    match request.action {
        JobAction::Stop => {
            controller.stop_job(&id).await?;
            Ok(StatusCode::OK.into_response())
        }
        JobAction::Retry => {
            let stats = controller.retry_job(&id).await?;
            Ok((StatusCode::OK, Json(StatsEnvelope { stats })).into_response())
        }
    }
}

async fn check_status(
    State(controller): State<AppState>,
) -> Result<Response, ServiceError> {
    let status = controller.check_status().await?;
    Ok(Json(status).into_response())
}

fn decode_body<T: serde::de::DeserializeOwned>(
    body: Result<Bytes, BytesRejection>,
) -> Result<T, ServiceError> {
    let bytes = body.map_err(|e| ServiceError::ReadRequestBody(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ServiceError::HandleJsonData(e.to_string()))
}

/// Serves the API until the shutdown signal fires.
pub async fn serve(
    config: &Config,
    controller: Arc<Controller>,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(controller);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    match config.protocol {
        Protocol::Http => serve_http(app, addr, shutdown).await,
        Protocol::Https => {
            let https = config
                .https_config
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("https protocol without https_config"))?;
            serve_https(app, addr, https, shutdown).await
        }
    }
}

async fn serve_http(
    app: Router,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API server listening on http");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("API server stopped");
    Ok(())
}

async fn serve_https(
    app: Router,
    addr: SocketAddr,
    https: &HttpsConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    use tokio_rustls::rustls::ServerConfig;
    use tower::Service;

    let tls_config: Arc<ServerConfig> = Arc::new(load_tls_config(https)?);
    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API server listening on https");

    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.recv() => break,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(remote = %remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let hyper_service = hyper::service::service_fn(
                move |request: hyper::Request<hyper::body::Incoming>| app.clone().call(request),
            );

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(tls_stream), hyper_service)
                .await
            {
                error!(remote = %remote_addr, error = %e, "HTTPS connection error");
            }
        });
    }

    info!("API server stopped");
    Ok(())
}

fn load_tls_config(https: &HttpsConfig) -> anyhow::Result<tokio_rustls::rustls::ServerConfig> {
    use std::io::BufReader;

    let cert_file = std::fs::File::open(&https.cert)
        .map_err(|e| anyhow::anyhow!("cannot open cert file {}: {}", https.cert, e))?;
    let key_file = std::fs::File::open(&https.key)
        .map_err(|e| anyhow::anyhow!("cannot open key file {}: {}", https.key, e))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("cannot parse certs: {}", e))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| anyhow::anyhow!("cannot parse key: {}", e))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", https.key))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("cannot build TLS config: {}", e))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let err = ServiceError::UnknownJob("mystery".into());
        let body = ErrorBody {
            code: err.code(),
            message: error_label(&err).to_string(),
            details: err.to_string(),
        };

        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["code"], 10005);
        assert_eq!(json["message"], "unknown job");
        assert!(json["details"].as_str().unwrap().contains("mystery"));
    }

    #[test]
    fn test_stats_envelope_shape() {
        let stats = JobStats::new("replication", crate::job::JobKind::Generic, false);
        let envelope = StatsEnvelope { stats };

        let json = serde_json::to_value(&envelope).expect("serialize");
        assert!(json["stats"]["id"].as_str().is_some());
        assert_eq!(json["stats"]["status"], "Pending");
    }

    #[test]
    fn test_decode_body_maps_json_errors() {
        let err = decode_body::<JobRequest>(Ok(Bytes::from_static(b"{nope")))
            .expect_err("invalid json rejected");
        assert_eq!(err.code(), 10002);
    }
}
