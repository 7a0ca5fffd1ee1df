//! Error types for heartgpt-rs.
//!
//! Every stage of the pipeline reports failures through [`HeartGptError`].
//! Errors from collaborators (candle, tokenizers, the hub HTTP client) are
//! wrapped, not translated, so the process exits with the underlying cause.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use heartgpt_rs::{HeartGptError, PipelineConfig};
//!
//! # fn main() {
//! match PipelineConfig::from_preset("not-a-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(HeartGptError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for heartgpt-rs operations.
///
/// # Example
///
/// ```rust
/// use heartgpt_rs::{PipelineConfig, Result};
///
/// fn load_and_validate(path: &str) -> Result<PipelineConfig> {
///     let config = PipelineConfig::from_file(path)?;
///     config.validate()?;
///     Ok(config)
/// }
/// ```
pub type Result<T> = std::result::Result<T, HeartGptError>;

/// Errors that can occur in heartgpt-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HeartGptError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Model loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint or adapter persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Weight quantization error.
    #[error("quantization error: {0}")]
    Quantization(String),

    /// Text generation error.
    #[error("generation error: {0}")]
    Generation(String),

    /// Model hub error.
    #[error("hub error: {0}")]
    Hub(String),

    /// Missing or rejected credentials.
    #[error("authentication error: {0}")]
    Auth(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Parquet decoding error.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow record batch error.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),

    /// Other errors.
    #[error("{0}")]
    Other(String),
}

impl From<indicatif::style::TemplateError> for HeartGptError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        HeartGptError::Template(err.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for HeartGptError {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        HeartGptError::Hub(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for HeartGptError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        HeartGptError::Checkpoint(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_display() {
        let error = HeartGptError::Config("invalid parameter".to_string());
        assert_eq!(error.to_string(), "configuration error: invalid parameter");
    }

    #[test]
    fn test_stage_error_prefixes() {
        let errors = [
            HeartGptError::Model("model".into()),
            HeartGptError::Dataset("dataset".into()),
            HeartGptError::Training("training".into()),
            HeartGptError::Checkpoint("checkpoint".into()),
            HeartGptError::Quantization("quant".into()),
            HeartGptError::Generation("gen".into()),
            HeartGptError::Hub("hub".into()),
            HeartGptError::Auth("auth".into()),
        ];
        let prefixes = [
            "model error",
            "dataset error",
            "training error",
            "checkpoint error",
            "quantization error",
            "generation error",
            "hub error",
            "authentication error",
        ];
        for (error, prefix) in errors.iter().zip(prefixes) {
            assert!(error.to_string().starts_with(prefix), "{error}");
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: HeartGptError = io_error.into();
        assert!(matches!(error, HeartGptError::Io(_)));
        assert!(error.to_string().contains("file not found"));

        use std::error::Error;
        assert!(error.source().is_some());
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: HeartGptError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let error: HeartGptError = a.broadcast_add(&b).unwrap_err().into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: HeartGptError = json_error.into();
        assert!(matches!(error, HeartGptError::Json(_)));
    }

    #[test]
    fn test_template_error_conversion() {
        use indicatif::ProgressStyle;

        if let Err(template_error) = ProgressStyle::default_bar().template("{wide_bar:.}") {
            let error: HeartGptError = template_error.into();
            assert!(error.to_string().contains("template error"));
        }
    }

    #[test]
    fn test_other_error_is_bare() {
        let error = HeartGptError::Other("some other error".to_string());
        assert_eq!(error.to_string(), "some other error");
    }
}
