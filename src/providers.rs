//! Concrete gateway parameterizations and provider routing.
//!
//! Each generation role (try-on, identity swap, composition, video,
//! upscale, validation) maps to a [`ProviderGateway`] built here from the
//! configured keys. Base URLs default to the real services and can be
//! overridden, which is also how the test suite points gateways at a
//! local server.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::gateway::{PollState, ProviderConfig, ProviderGateway};
use crate::time::{Clock, Sleeper};

const FAL_QUEUE_BASE: &str = "https://queue.fal.run";
const KIE_BASE: &str = "https://api.kie.ai/api/v1";
const CLAID_BASE: &str = "https://api.claid.ai/v1";
const WAVESPEED_BASE: &str = "https://api.wavespeed.ai/v1";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Video routing tier. Production traffic prefers the pro provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Production,
    Standard,
}

impl Tier {
    pub fn parse(raw: &str) -> Self {
        if raw == "production" {
            Tier::Production
        } else {
            Tier::Standard
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Tier::Production => "seedance-2.0-pro",
            Tier::Standard => "veo-3.1-fast",
        }
    }
}

/// All gateways the pipelines can reach, built once at startup.
pub struct ProviderCatalog {
    pub tryon: ProviderGateway,
    pub identity_swap: ProviderGateway,
    pub compose: ProviderGateway,
    pub video_standard: ProviderGateway,
    pub video_pro: ProviderGateway,
    pub upscale: ProviderGateway,
    pub validate: ProviderGateway,
}

impl ProviderCatalog {
    pub fn new(
        config: &Config,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let keys = &config.providers;
        let build = |provider_config: ProviderConfig| {
            ProviderGateway::new(provider_config, http.clone(), clock.clone(), sleeper.clone())
        };
        Self {
            tryon: build(fal_queue_config(
                "tryon",
                keys.tryon_base_url.as_deref(),
                "/fal-ai/fashn/tryon/v1.6",
                &keys.fal_api_key,
            )),
            identity_swap: build(fal_queue_config(
                "identity_swap",
                keys.tryon_base_url.as_deref(),
                "/fal-ai/fashn/model-swap",
                &keys.fal_api_key,
            )),
            compose: build(compose_config(keys.compose_base_url.as_deref(), &keys.claid_api_key)),
            video_standard: build(kie_video_config(
                keys.video_base_url.as_deref(),
                &keys.kie_api_key,
            )),
            video_pro: build(wavespeed_video_config(
                keys.video_base_url.as_deref(),
                &keys.wavespeed_api_key,
            )),
            upscale: build(kie_upscale_config(
                keys.video_base_url.as_deref(),
                &keys.kie_api_key,
            )),
            validate: build(validate_config(
                keys.validate_base_url.as_deref(),
                &keys.gemini_api_key,
            )),
        }
    }

    /// Route a video job by model prefix first, tier default second.
    pub fn video_for(&self, tier: Tier, model: &str) -> &ProviderGateway {
        if ["kling", "seedance", "wan"].iter().any(|prefix| model.starts_with(prefix)) {
            return &self.video_pro;
        }
        if ["veo", "sora", "hailuo"].iter().any(|prefix| model.starts_with(prefix)) {
            return &self.video_standard;
        }
        match tier {
            Tier::Production => &self.video_pro,
            Tier::Standard => &self.video_standard,
        }
    }
}

// ── Gateway parameterizations ────────────────────────────────────────────

/// fal.ai queue protocol: POST the endpoint path, poll
/// `…/requests/{id}/status`, fetch `…/requests/{id}`.
fn fal_queue_config(
    name: &str,
    base_override: Option<&str>,
    endpoint: &str,
    api_key: &str,
) -> ProviderConfig {
    let mut config =
        ProviderConfig::new(name, base_override.unwrap_or(FAL_QUEUE_BASE));
    config.submit_path = endpoint.to_string();
    config.status_path = format!("{endpoint}/requests/{{task_id}}/status");
    config.result_path = format!("{endpoint}/requests/{{task_id}}");
    config.auth_header = ("Authorization".to_string(), format!("Key {api_key}"));
    config.task_id_keys = vec!["request_id".to_string()];
    config.status_map = vec![
        ("COMPLETED".to_string(), PollState::Succeeded),
        ("FAILED".to_string(), PollState::Failed),
        ("ERROR".to_string(), PollState::Failed),
    ];
    config.result_keys =
        vec!["images.url".to_string(), "image.url".to_string(), "output.url".to_string()];
    config.poll_interval = Duration::from_secs(3);
    config.poll_deadline = Duration::from_secs(300);
    config
}

/// Synchronous composition endpoint: the submit response carries the
/// result directly.
fn compose_config(base_override: Option<&str>, api_key: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new("compose", base_override.unwrap_or(CLAID_BASE));
    config.submit_path = "/image/ai-fashion-models".to_string();
    config.auth_header = ("Authorization".to_string(), format!("Bearer {api_key}"));
    config.task_id_keys = Vec::new();
    config.result_keys = vec![
        "data.output.url".to_string(),
        "data.output.image_url".to_string(),
        "output.url".to_string(),
        "url".to_string(),
        "image_url".to_string(),
    ];
    config.request_timeout = Duration::from_secs(120);
    config
}

/// Kie-style video generation: status and result share one record
/// endpoint.
fn kie_video_config(base_override: Option<&str>, api_key: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new("video_standard", base_override.unwrap_or(KIE_BASE));
    config.submit_path = "/veo/generate".to_string();
    config.status_path = "/veo/record-info?taskId={task_id}".to_string();
    config.result_path = config.status_path.clone();
    config.auth_header = ("Authorization".to_string(), format!("Bearer {api_key}"));
    config.task_id_keys = vec!["data.task_id".to_string(), "task_id".to_string()];
    config.status_keys = vec!["data.status".to_string(), "status".to_string()];
    config.status_map = vec![
        ("SUCCESS".to_string(), PollState::Succeeded),
        ("COMPLETED".to_string(), PollState::Succeeded),
        ("FAILED".to_string(), PollState::Failed),
        ("ERROR".to_string(), PollState::Failed),
    ];
    config.result_keys = vec![
        "data.video_url".to_string(),
        "data.videoUrl".to_string(),
        "data.resultUrl".to_string(),
        "data.works.resource.resource".to_string(),
    ];
    config.poll_interval = Duration::from_secs(10);
    config.poll_deadline = Duration::from_secs(900);
    config
}

fn wavespeed_video_config(base_override: Option<&str>, api_key: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new("video_pro", base_override.unwrap_or(WAVESPEED_BASE));
    config.submit_path = "/generate".to_string();
    config.status_path = "/tasks/{task_id}".to_string();
    config.result_path = config.status_path.clone();
    config.auth_header = ("Authorization".to_string(), format!("Bearer {api_key}"));
    config.task_id_keys = vec!["id".to_string(), "data.id".to_string()];
    config.status_map = vec![
        ("completed".to_string(), PollState::Succeeded),
        ("failed".to_string(), PollState::Failed),
    ];
    config.result_keys = vec!["output.url".to_string(), "data.output.url".to_string()];
    config.poll_interval = Duration::from_secs(5);
    config.poll_deadline = Duration::from_secs(900);
    config
}

fn kie_upscale_config(base_override: Option<&str>, api_key: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new("upscale", base_override.unwrap_or(KIE_BASE));
    config.submit_path = "/image/generate".to_string();
    config.status_path = "/image/record-info?taskId={task_id}".to_string();
    config.result_path = config.status_path.clone();
    config.auth_header = ("Authorization".to_string(), format!("Bearer {api_key}"));
    config.task_id_keys = vec!["data.task_id".to_string(), "task_id".to_string()];
    config.status_keys = vec!["data.status".to_string(), "status".to_string()];
    config.result_keys =
        vec!["data.image_url".to_string(), "data.result_url".to_string()];
    config.poll_interval = Duration::from_secs(5);
    config.poll_deadline = Duration::from_secs(600);
    config
}

/// Synchronous validation endpoint (vision model scoring a selfie).
fn validate_config(base_override: Option<&str>, api_key: &str) -> ProviderConfig {
    let mut config = ProviderConfig::new("validate", base_override.unwrap_or(GEMINI_BASE));
    config.submit_path =
        format!("/models/gemini-2.0-flash:generateContent?key={api_key}");
    config.auth_header = ("x-goog-api-client".to_string(), "atelier".to_string());
    config.task_id_keys = Vec::new();
    config.request_timeout = Duration::from_secs(60);
    config
}

// ── Request shaping ──────────────────────────────────────────────────────

/// Try-on request: bake a garment onto a model image.
pub fn tryon_payload(model_image_url: &str, garment_image_url: &str, category: &str) -> Value {
    json!({
        "model_image": model_image_url,
        "garment_image": garment_image_url,
        "category": category,
        "mode": "quality",
        "garment_photo_type": "flat-lay",
        "output_format": "png",
        "num_samples": 1,
    })
}

/// Identity-swap request: re-render a dressed image onto the user's face.
pub fn identity_swap_payload(model_image_url: &str, face_reference_url: &str) -> Value {
    json!({
        "model_image": model_image_url,
        "face_reference": face_reference_url,
        "face_reference_mode": "match_reference",
    })
}

/// Composition request: arrange garments/renders into one canvas.
pub fn compose_payload(image_urls: &[String], aspect_ratio: &str) -> Value {
    json!({
        "input": { "images": image_urls },
        "layout": { "arrangement": "triptych", "aspect_ratio": aspect_ratio },
        "output": { "format": "png" },
    })
}

/// Video synthesis request: animate a dressed render with identity
/// references as extra ingredients.
pub fn video_payload(prompt: &str, model: &str, image_urls: &[String], duration_secs: u32) -> Value {
    json!({
        "prompt": prompt,
        "model": model,
        "mode": "REFERENCE_2_VIDEO",
        "aspectRatio": "9:16",
        "imageUrls": image_urls,
        "duration": duration_secs,
    })
}

/// Upscale prompt per mode: `gentle` preserves identity, `fabric`
/// preserves garment texture and text.
pub fn upscale_payload(image_url: &str, mode: &str) -> Value {
    let prompt = match mode {
        "fabric" => {
            "Upscale this image to 4K resolution. Preserve garment weave, fabric texture, \
             labels and any printed text exactly. Only increase resolution and sharpness."
        }
        _ => {
            "Upscale this image to 4K resolution. Preserve the exact facial features, skin \
             texture, hairstyle, and body proportions. Do not alter the person's appearance. \
             Only increase resolution and sharpness."
        }
    };
    json!({
        "image_url": image_url,
        "prompt": prompt,
        "size": "4096",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{InstantSleeper, ManualClock};

    fn catalog() -> ProviderCatalog {
        let config = Config::from_lookup(|_| None).unwrap();
        ProviderCatalog::new(
            &config,
            reqwest::Client::new(),
            Arc::new(ManualClock::new(0.0)),
            Arc::new(InstantSleeper),
        )
    }

    #[test]
    fn model_prefix_beats_tier_default() {
        let catalog = catalog();
        assert_eq!(catalog.video_for(Tier::Standard, "kling-2.1").name(), "video_pro");
        assert_eq!(catalog.video_for(Tier::Production, "veo-3.1-fast").name(), "video_standard");
        assert_eq!(catalog.video_for(Tier::Production, "seedance-2.0-pro").name(), "video_pro");
    }

    #[test]
    fn unknown_model_falls_back_to_tier() {
        let catalog = catalog();
        assert_eq!(catalog.video_for(Tier::Production, "mystery-model").name(), "video_pro");
        assert_eq!(catalog.video_for(Tier::Standard, "mystery-model").name(), "video_standard");
    }

    #[test]
    fn tier_defaults_name_real_models() {
        assert_eq!(Tier::parse("production").default_model(), "seedance-2.0-pro");
        assert_eq!(Tier::parse("anything-else").default_model(), "veo-3.1-fast");
    }

    #[test]
    fn upscale_modes_pick_distinct_prompts() {
        let gentle = upscale_payload("https://cdn/x.png", "gentle");
        let fabric = upscale_payload("https://cdn/x.png", "fabric");
        assert!(gentle["prompt"].as_str().unwrap().contains("facial features"));
        assert!(fabric["prompt"].as_str().unwrap().contains("fabric texture"));
    }
}
