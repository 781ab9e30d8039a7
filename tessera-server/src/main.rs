use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tessera_core::{
    lora::DEFAULT_MIN_DISK_FREE, DeviceMap, Error, Prediction, PredictionRequest, Predictor,
    PredictorConfig, RequestError,
};
use tokio::{net::TcpListener, sync::Mutex};

mod logger;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Tessera image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "TESSERA_CPU")]
    cpu: bool,

    /// Accelerator ordinal to run on
    #[arg(long, env = "TESSERA_DEVICE", default_value_t = 0)]
    device: usize,

    /// Hub repo of the base model
    #[arg(long, env = "TESSERA_MODEL", default_value = "runwayml/stable-diffusion-v1-5")]
    model: String,

    /// Load full precision weights even on accelerators
    #[arg(long, env = "TESSERA_F32")]
    f32: bool,

    /// Where downloaded LoRA weights are kept
    #[arg(long, env = "TESSERA_CACHE_DIR", default_value = "./weights-cache")]
    cache_dir: PathBuf,

    /// Bytes to keep free on the cache disk before downloading
    #[arg(long, env = "TESSERA_MIN_DISK_FREE", default_value_t = DEFAULT_MIN_DISK_FREE)]
    min_disk_free: u64,

    /// Also write every output image to this directory
    #[arg(long, env = "TESSERA_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Skip loading the safety checker
    #[arg(long, env = "TESSERA_NO_SAFETY_CHECKER")]
    no_safety_checker: bool,

    /// Host address to bind the server to
    #[arg(long, env = "TESSERA_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "TESSERA_PORT", default_value_t = 8000)]
    port: u16,

    /// Log as JSON lines
    #[arg(long, env = "TESSERA_LOG_JSON")]
    log_json: bool,

    /// Debug logging for tessera crates
    #[arg(short, long, env = "TESSERA_VERBOSE")]
    verbose: bool,
}

impl Args {
    fn predictor_config(&self) -> PredictorConfig {
        PredictorConfig {
            model: self.model.clone(),
            device: if self.cpu {
                DeviceMap::ForceCpu
            } else {
                DeviceMap::Ordinal(self.device)
            },
            use_f16: !self.f32,
            cache_dir: self.cache_dir.clone(),
            min_disk_free: self.min_disk_free,
            load_safety_checker: !self.no_safety_checker,
            output_dir: self.output_dir.clone(),
        }
    }
}

/// The request body: a prediction request whose `image` is base64, optionally
/// as a data URI.
#[derive(Deserialize)]
struct GenerationRequest {
    #[serde(flatten)]
    request: PredictionRequest,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Serialize)]
struct GeneratedImage {
    format: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationResponse {
    seed: u64,
    images: Vec<GeneratedImage>,
}

impl From<Prediction> for GenerationResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            seed: prediction.seed,
            images: prediction
                .images
                .into_iter()
                .map(|image| GeneratedImage {
                    format: image.format.to_string(),
                    data: BASE64_STANDARD.encode(&image.bytes),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::NsfwOnly => StatusCode::UNPROCESSABLE_ENTITY,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn decode_image(data: &str) -> Result<DynamicImage, RequestError> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| RequestError::Image(e.to_string()))?;
    image::load_from_memory(&bytes).map_err(|e| RequestError::Image(e.to_string()))
}

// Application state holding the single predictor; requests run one at a time.
struct AppState {
    predictor: Mutex<Predictor>,
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GenerationRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match generate_image(body, &state).await {
        Ok(prediction) => Json(GenerationResponse::from(prediction)).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                tracing::error!("Error generating image: {e:#}");
            } else {
                tracing::info!("Rejected request: {e}");
            }
            error_response(status, e.to_string())
        }
    }
}

async fn generate_image(
    body: GenerationRequest,
    state: &AppState,
) -> Result<Prediction, Error> {
    let mut request = body.request;
    if let Some(data) = body.image {
        request.image = Some(decode_image(&data)?);
    }
    state.predictor.lock().await.predict(request).await
}

async fn health() -> &'static str {
    "ok"
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/health", get(health))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logger::init_logger(args.verbose, args.log_json);

    let predictor = Predictor::setup(args.predictor_config())
        .await
        .context("failed to set up predictor")?;
    let state = Arc::new(AppState {
        predictor: Mutex::new(predictor),
    });

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, router(state).into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use tessera_core::LoraError;

    fn png_base64() -> String {
        let img = DynamicImage::ImageRgb8(RgbImage::new(4, 3));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        BASE64_STANDARD.encode(&bytes)
    }

    #[test]
    fn decodes_plain_and_data_uri_images() {
        let data = png_base64();
        let img = decode_image(&data).unwrap();
        assert_eq!((img.width(), img.height()), (4, 3));

        let uri = format!("data:image/png;base64,{data}");
        assert_eq!(decode_image(&uri).unwrap().width(), 4);

        assert!(matches!(
            decode_image("not base64!"),
            Err(RequestError::Image(_))
        ));
    }

    #[test]
    fn request_body_keeps_image_separate() {
        let body: GenerationRequest = serde_json::from_str(
            r#"{"prompt": "a fox", "image": "abc", "num_outputs": 2, "hf_loras": ["a/b"]}"#,
        )
        .unwrap();
        assert_eq!(body.image.as_deref(), Some("abc"));
        assert_eq!(body.request.num_outputs, 2);
        assert_eq!(body.request.hf_loras, vec!["a/b".to_string()]);
        assert!(body.request.image.is_none());
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(status_for(&Error::NsfwOnly), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            status_for(&Error::Request(RequestError::EmptyPrompt)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::Lora(LoraError::InvalidIdentifier("x".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::Model(anyhow::anyhow!("cuda oom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn cli_maps_to_config() {
        let args = Args::parse_from(["tessera-server", "--cpu", "--no-safety-checker"]);
        let config = args.predictor_config();
        assert_eq!(config.device, DeviceMap::ForceCpu);
        assert!(!config.load_safety_checker);
        assert!(config.use_f16);
        assert_eq!(config.min_disk_free, DEFAULT_MIN_DISK_FREE);
    }
}
