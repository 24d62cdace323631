use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use relay_core::{
    abr::AutoBitRateConfig,
    codec::FpsFraction,
    error::RelayError,
    recoder::RecoderConfig,
    runtime::{ForwarderRuntime, RuntimeStatistics, Topology},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

type AppState = Arc<ForwarderRuntime>;
pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::warn!("control request failed: {:#}", self.error);
        (
            self.status,
            Json(ErrorBody {
                error: format!("{:#}", self.error),
            }),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let status = match error.downcast_ref::<RelayError>() {
            Some(RelayError::AudioTranscodingUnsupported(_))
            | Some(RelayError::CodecChangeUnsupported { .. }) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, error }
    }
}

fn bad_request(error: anyhow::Error) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        error,
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueTolerance {
    pub tolerance: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropOnClose {
    pub drop_on_close: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitResult {
    pub finished: bool,
    pub error: Option<String>,
}

pub(crate) fn router(runtime: AppState) -> Router {
    Router::new()
        .route("/recoder", get(get_recoder).post(set_recoder))
        .route(
            "/output/queue_tolerance",
            get(get_queue_tolerance).post(set_queue_tolerance),
        )
        .route(
            "/output/drop_on_close",
            get(get_drop_on_close).post(set_drop_on_close),
        )
        .route("/auto_bitrate", get(get_auto_bitrate).post(set_auto_bitrate))
        .route("/fps_fraction", get(get_fps_fraction).post(set_fps_fraction))
        .route("/stats", get(stats))
        .route("/pipeline", get(pipeline))
        .route("/wait", get(wait))
        .with_state(runtime)
}

pub(crate) fn start_api_server(
    addr: SocketAddr,
    runtime: AppState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("control surface cannot bind {}: {}", addr, e);
                return;
            }
        };
        log::info!("control surface listening on {}", addr);
        if let Err(e) = axum::serve(listener, router(runtime))
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("control surface: {}", e);
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down control surface");
}

async fn get_recoder(State(runtime): State<AppState>) -> Json<RecoderConfig> {
    Json(runtime.recoder_config())
}

async fn set_recoder(
    State(runtime): State<AppState>,
    Json(config): Json<RecoderConfig>,
) -> ApiJsonResult<RecoderConfig> {
    runtime.set_recoder_config(config)?;
    Ok(Json(runtime.recoder_config()))
}

async fn get_queue_tolerance(State(runtime): State<AppState>) -> Json<QueueTolerance> {
    Json(QueueTolerance {
        tolerance: runtime.queue_tolerance(),
    })
}

async fn set_queue_tolerance(
    State(runtime): State<AppState>,
    Json(request): Json<QueueTolerance>,
) -> Json<QueueTolerance> {
    runtime.set_queue_tolerance(request.tolerance);
    Json(QueueTolerance {
        tolerance: runtime.queue_tolerance(),
    })
}

async fn get_drop_on_close(State(runtime): State<AppState>) -> Json<DropOnClose> {
    Json(DropOnClose {
        drop_on_close: runtime.drop_on_close(),
    })
}

async fn set_drop_on_close(
    State(runtime): State<AppState>,
    Json(request): Json<DropOnClose>,
) -> Json<DropOnClose> {
    runtime.set_drop_on_close(request.drop_on_close);
    Json(DropOnClose {
        drop_on_close: runtime.drop_on_close(),
    })
}

async fn get_auto_bitrate(State(runtime): State<AppState>) -> Json<AutoBitRateConfig> {
    Json(runtime.auto_bitrate())
}

async fn set_auto_bitrate(
    State(runtime): State<AppState>,
    request: Result<Json<AutoBitRateConfig>, JsonRejection>,
) -> ApiJsonResult<AutoBitRateConfig> {
    let Json(config) = request.map_err(|e| bad_request(e.into()))?;
    runtime.set_auto_bitrate(config).map_err(bad_request)?;
    Ok(Json(runtime.auto_bitrate()))
}

async fn get_fps_fraction(State(runtime): State<AppState>) -> Json<FpsFraction> {
    Json(runtime.fps_fraction())
}

async fn set_fps_fraction(
    State(runtime): State<AppState>,
    Json(request): Json<FpsFraction>,
) -> ApiJsonResult<FpsFraction> {
    let fps = FpsFraction::new(request.num, request.den).map_err(bad_request)?;
    runtime.set_fps_fraction(fps);
    Ok(Json(runtime.fps_fraction()))
}

async fn stats(State(runtime): State<AppState>) -> Json<RuntimeStatistics> {
    Json(runtime.statistics())
}

async fn pipeline(State(runtime): State<AppState>) -> Json<Topology> {
    Json(runtime.topology())
}

async fn wait(State(runtime): State<AppState>) -> Json<WaitResult> {
    let error = runtime.wait().await.err();
    Json(WaitResult {
        finished: true,
        error,
    })
}

#[cfg(test)]
mod tests {
    use relay_core::{
        abr::AutoBitRateCalculator,
        recoder::CodecConfig,
        resource::Resource,
        runtime::{Backends, RuntimeConfig},
        sender::OutputTemplate,
    };
    use serde_json::{Value, json};

    use super::*;

    async fn serve() -> anyhow::Result<(String, AppState)> {
        let config = RuntimeConfig::new(
            vec![Resource::new("rtsp://cam", 0)],
            OutputTemplate::new("udp://239.0.0.1:1234"),
        );
        let runtime = Arc::new(ForwarderRuntime::new(config, Backends::ffmpeg())?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let app = router(Arc::clone(&runtime));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((base, runtime))
    }

    #[tokio::test]
    async fn test_recoder_round_trip() -> anyhow::Result<()> {
        let (base, _runtime) = serve().await?;
        let client = reqwest::Client::new();

        let config: RecoderConfig = client.get(format!("{base}/recoder")).send().await?.json().await?;
        assert!(config.video.is_copy() && config.audio.is_copy());

        let request = RecoderConfig {
            audio: CodecConfig::copy(),
            video: CodecConfig::new("libx264").with_bit_rate(2_000_000),
        };
        let response = client.post(format!("{base}/recoder")).json(&request).send().await?;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let applied: RecoderConfig = response.json().await?;
        // no key frame has committed the switch yet
        assert!(applied.video.is_copy());
        assert_eq!(applied.video.average_bit_rate, 2_000_000);

        let request = RecoderConfig {
            audio: CodecConfig::copy(),
            video: CodecConfig::new("libx265"),
        };
        let response = client.post(format!("{base}/recoder")).json(&request).send().await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: ErrorBody = response.json().await?;
        assert!(body.error.contains("libx264"));

        let response = client
            .post(format!("{base}/recoder"))
            .json(&json!({
                "audio": {"codec_name": "aac"},
                "video": {"codec_name": "copy"}
            }))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn test_runtime_knobs() -> anyhow::Result<()> {
        let (base, runtime) = serve().await?;
        let client = reqwest::Client::new();

        let set: QueueTolerance = client
            .post(format!("{base}/output/queue_tolerance"))
            .json(&QueueTolerance { tolerance: 12 })
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(set.tolerance, 12);
        assert_eq!(runtime.queue_tolerance(), 12);

        let response = client
            .post(format!("{base}/fps_fraction"))
            .json(&json!({"num": 3, "den": 2}))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let fps: FpsFraction = client
            .post(format!("{base}/fps_fraction"))
            .json(&json!({"num": 1, "den": 2}))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(fps, FpsFraction::new(1, 2)?);

        let abr: Value = client
            .post(format!("{base}/auto_bitrate"))
            .json(&json!({"calculator": {"type": "queue_thresholds", "step": 100000, "low_watermark": 1}}))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(abr["calculator"]["step"], 100000);
        let response = client
            .post(format!("{base}/auto_bitrate"))
            .json(&json!({"tiers": {"tiers": [], "best": 0}}))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: ErrorBody = response.json().await?;
        assert!(body.error.contains("out of range"));
        // the rejected table left the applied config alone
        assert_eq!(
            runtime.auto_bitrate().calculator,
            AutoBitRateCalculator::QueueThresholds {
                step: 100_000,
                low_watermark: 1
            }
        );

        let closing: DropOnClose = client
            .get(format!("{base}/output/drop_on_close"))
            .send()
            .await?
            .json()
            .await?;
        assert!(!closing.drop_on_close);
        let closing: DropOnClose = client
            .post(format!("{base}/output/drop_on_close"))
            .json(&DropOnClose { drop_on_close: true })
            .send()
            .await?
            .json()
            .await?;
        assert!(closing.drop_on_close);
        assert!(runtime.drop_on_close());

        let pipeline: Value = client.get(format!("{base}/pipeline")).send().await?.json().await?;
        assert_eq!(pipeline["state"], "idle");
        let stats: Value = client.get(format!("{base}/stats")).send().await?.json().await?;
        assert_eq!(stats["total"]["bytes_read"], 0);
        assert_eq!(stats["total"]["frames_wrote"]["total"], 0);

        runtime.stop();
        let waited: WaitResult = client.get(format!("{base}/wait")).send().await?.json().await?;
        assert_eq!(
            waited,
            WaitResult {
                finished: true,
                error: None
            }
        );
        Ok(())
    }
}
