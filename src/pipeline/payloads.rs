//! Job payload shapes, as submitted by the webhook surface and stored in
//! queue metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_duration() -> u32 {
    5
}

fn default_aspect_ratio() -> String {
    "9:16".to_string()
}

fn default_category() -> String {
    "auto".to_string()
}

/// Generic video generation job (`video_generate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoJobPayload {
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub image_refs: Vec<String>,
    #[serde(default = "default_duration")]
    pub duration: u32,
    #[serde(default)]
    pub provider_metadata: Value,
}

/// Multi-stage fashion composition job (`fashion_generate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FashionJobPayload {
    pub garment_image_url: String,
    #[serde(default)]
    pub preset_id: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default)]
    pub model_options: Value,
    /// Identity whose reference images drive the render; defaults to the
    /// requesting user.
    #[serde(default)]
    pub identity_id: String,
}

impl FashionJobPayload {
    pub fn garment_category(&self) -> String {
        self.model_options
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("auto")
            .to_string()
    }

    pub fn animation_prompt(&self) -> Option<String> {
        self.model_options
            .get("animation_prompt")
            .and_then(Value::as_str)
            .map(String::from)
    }

    pub fn video_model(&self) -> Option<String> {
        self.model_options.get("model").and_then(Value::as_str).map(String::from)
    }

    pub fn tier(&self) -> String {
        self.model_options
            .get("tier")
            .and_then(Value::as_str)
            .unwrap_or("standard")
            .to_string()
    }
}

/// Single synchronous try-on (`try_on`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryOnPayload {
    pub model_image_url: String,
    pub garment_image_url: String,
    #[serde(default = "default_category")]
    pub category: String,
}

/// Re-animate an existing output with a new prompt (`extend`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendPayload {
    pub source_output_url: String,
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default = "default_duration")]
    pub duration: u32,
}

/// 4K upscale of an existing image (`upscale`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscalePayload {
    pub image_url: String,
    /// `gentle` (identity-preserving) or `fabric` (texture-preserving).
    #[serde(default)]
    pub mode: String,
}
