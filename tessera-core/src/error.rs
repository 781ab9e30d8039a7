use std::path::PathBuf;

use thiserror::Error;

/// Failures while resolving, downloading or applying LoRA adapters.
#[derive(Error, Debug)]
pub enum LoraError {
    #[error(
        "Invalid lora, must be either a: HuggingFace path, Replicate model.tar, CivitAI download URL, \
         URL to a .safetensors file, or a local .safetensors/.tar path: {0}"
    )]
    InvalidIdentifier(String),

    #[error("{requested} LoRAs requested but only {available} adapter slots exist")]
    SlotsExhausted { requested: usize, available: usize },

    #[error("{scales} lora scales given for {loras} LoRAs; pass none, one, or at least one per LoRA")]
    ScaleCountMismatch { loras: usize, scales: usize },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("hub download of {file} from {repo} failed: {message}")]
    Hub {
        repo: String,
        file: String,
        message: String,
    },

    #[error("failed to unpack archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no LoRA weights found under {0}")]
    MissingWeights(PathBuf),

    #[error("{path} is not a valid safetensors file: {message}")]
    InvalidWeights { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to apply adapters: {0}")]
    Apply(#[source] anyhow::Error),
}

/// A prediction request that can't be served as given.
#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("unsupported {field}: {value}")]
    Unsupported { field: &'static str, value: String },

    #[error("could not decode input image: {0}")]
    Image(String),
}

/// Top level prediction error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Lora(#[from] LoraError),

    #[error("NSFW content detected. Try running it again, or try a different prompt.")]
    NsfwOnly,

    #[error("inference failed: {0:#}")]
    Model(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller, rather than the service, is at fault.
    pub fn is_client_error(&self) -> bool {
        match self {
            Error::Request(_) => true,
            Error::Lora(e) => matches!(
                e,
                LoraError::InvalidIdentifier(_)
                    | LoraError::SlotsExhausted { .. }
                    | LoraError::ScaleCountMismatch { .. }
            ),
            Error::NsfwOnly | Error::Model(_) => false,
        }
    }
}
