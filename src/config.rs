//! Engine configuration.
//!
//! An optional JSON file supplies the base values, `TRAFFIC_*` environment
//! variables override them, and `validate` rejects anything unusable before
//! a component is built.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::api::ApiConfig;
use crate::ingest::CaptureSettings;
use crate::render::RenderSettings;

const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_MAX_CONNECTIONS: usize = 64;
const DEFAULT_CAMERA_URL: &str = "stub://street";
const DEFAULT_READ_TIMEOUT_MS: u64 = 5000;
const DEFAULT_OUTPUT_WIDTH: u32 = 1280;
const DEFAULT_OUTPUT_HEIGHT: u32 = 720;
const DEFAULT_TARGET_FPS: u32 = 15;
const DEFAULT_STREAM_FPS: u32 = 12;
const DEFAULT_JPEG_QUALITY: u8 = 70;
const DEFAULT_CONTRAST: f32 = 1.1;
const DEFAULT_BRIGHTNESS: f32 = 8.0;
const DEFAULT_MODEL: &str = "stub";
const DEFAULT_CONFIDENCE: f32 = 0.35;
const DEFAULT_INFERENCE_INTERVAL_MS: u64 = 250;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HISTORY_PATH: &str = "traffic_history.json";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EngineConfigFile {
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    output: Option<OutputConfigFile>,
    detection: Option<DetectionConfigFile>,
    idle_timeout_secs: Option<u64>,
    stall_timeout_secs: Option<u64>,
    history_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    rtsp_tcp: Option<bool>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    stream_fps: Option<u32>,
    jpeg_quality: Option<u8>,
    contrast: Option<f32>,
    brightness: Option<f32>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    model_path: Option<String>,
    confidence: Option<f32>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_addr: String,
    /// Concurrent `/video_feed` viewers; stats and health are never capped.
    pub max_connections: usize,
    pub camera: CameraSettings,
    pub output: OutputSettings,
    pub detection: DetectionSettings,
    pub idle_timeout: Duration,
    pub stall_timeout: Duration,
    pub history_path: PathBuf,
}

#[derive(Clone)]
pub struct CameraSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub rtsp_tcp: bool,
    pub read_timeout: Duration,
}

// Credentials stay out of debug output.
impl std::fmt::Debug for CameraSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSettings")
            .field("url", &crate::ingest::redact_url(&self.url))
            .field("username", &self.username.as_ref().map(|_| "<set>"))
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("rtsp_tcp", &self.rtsp_tcp)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub stream_fps: u32,
    pub jpeg_quality: u8,
    pub contrast: f32,
    pub brightness: f32,
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub model_path: String,
    pub confidence: f32,
    pub interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_file(EngineConfigFile::default())
    }
}

impl EngineConfig {
    /// File (`TRAFFIC_CONFIG`), then environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = env_string("TRAFFIC_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Same as `load`, with the config file given explicitly.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_connections: api.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            camera: CameraSettings {
                url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                username: camera.username,
                password: camera.password,
                rtsp_tcp: camera.rtsp_tcp.unwrap_or(true),
                read_timeout: Duration::from_millis(
                    camera.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
                ),
            },
            output: OutputSettings {
                width: output.width.unwrap_or(DEFAULT_OUTPUT_WIDTH),
                height: output.height.unwrap_or(DEFAULT_OUTPUT_HEIGHT),
                target_fps: output.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                stream_fps: output.stream_fps.unwrap_or(DEFAULT_STREAM_FPS),
                jpeg_quality: output.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                contrast: output.contrast.unwrap_or(DEFAULT_CONTRAST),
                brightness: output.brightness.unwrap_or(DEFAULT_BRIGHTNESS),
                font_path: output.font_path,
            },
            detection: DetectionSettings {
                model_path: detection
                    .model_path
                    .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                confidence: detection.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                interval: Duration::from_millis(
                    detection.interval_ms.unwrap_or(DEFAULT_INFERENCE_INTERVAL_MS),
                ),
            },
            idle_timeout: Duration::from_secs(
                file.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
            stall_timeout: Duration::from_secs(
                file.stall_timeout_secs.unwrap_or(DEFAULT_STALL_TIMEOUT_SECS),
            ),
            history_path: file
                .history_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_PATH)),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_string("TRAFFIC_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = env_string("TRAFFIC_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(user) = env_string("TRAFFIC_CAMERA_USER") {
            self.camera.username = Some(user);
        }
        if let Some(password) = env_string("TRAFFIC_CAMERA_PASSWORD") {
            self.camera.password = Some(password);
        }
        if let Some(value) = env_string("TRAFFIC_RTSP_TCP") {
            self.camera.rtsp_tcp = parse_bool("TRAFFIC_RTSP_TCP", &value)?;
        }
        if let Some(ms) = env_parse::<u64>("TRAFFIC_READ_TIMEOUT_MS")? {
            self.camera.read_timeout = Duration::from_millis(ms);
        }
        if let Some(width) = env_parse("TRAFFIC_OUTPUT_WIDTH")? {
            self.output.width = width;
        }
        if let Some(height) = env_parse("TRAFFIC_OUTPUT_HEIGHT")? {
            self.output.height = height;
        }
        if let Some(fps) = env_parse("TRAFFIC_TARGET_FPS")? {
            self.output.target_fps = fps;
        }
        if let Some(fps) = env_parse("TRAFFIC_STREAM_FPS")? {
            self.output.stream_fps = fps;
        }
        if let Some(quality) = env_parse("TRAFFIC_JPEG_QUALITY")? {
            self.output.jpeg_quality = quality;
        }
        if let Some(ms) = env_parse::<u64>("TRAFFIC_INFERENCE_INTERVAL_MS")? {
            self.detection.interval = Duration::from_millis(ms);
        }
        if let Some(confidence) = env_parse("TRAFFIC_CONFIDENCE")? {
            self.detection.confidence = confidence;
        }
        if let Some(secs) = env_parse::<u64>("TRAFFIC_IDLE_TIMEOUT_SECS")? {
            self.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TRAFFIC_STALL_TIMEOUT_SECS")? {
            self.stall_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = env_string("TRAFFIC_HISTORY_PATH") {
            self.history_path = PathBuf::from(path);
        }
        if let Some(model) = env_string("TRAFFIC_MODEL_PATH") {
            self.detection.model_path = model;
        }
        if let Some(font) = env_string("TRAFFIC_FONT_PATH") {
            self.output.font_path = Some(PathBuf::from(font));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api address '{}' is not host:port", self.api_addr))?;
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections must be greater than zero"));
        }
        if self.output.width == 0 || self.output.height == 0 {
            return Err(anyhow!("output resolution must be nonzero"));
        }
        if self.output.target_fps == 0 || self.output.stream_fps == 0 {
            return Err(anyhow!("frame rates must be greater than zero"));
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be between 1 and 100"));
        }
        if !(self.detection.confidence > 0.0 && self.detection.confidence <= 1.0) {
            return Err(anyhow!("confidence must be in (0, 1]"));
        }
        if self.idle_timeout.is_zero() {
            return Err(anyhow!("idle timeout must be greater than zero"));
        }
        if self.stall_timeout.is_zero() {
            return Err(anyhow!("stall timeout must be greater than zero"));
        }
        if self.camera.read_timeout.is_zero() {
            return Err(anyhow!("camera read timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            url: self.camera.url.clone(),
            username: self.camera.username.clone(),
            password: self.camera.password.clone(),
            reliable_transport: self.camera.rtsp_tcp,
            read_timeout: self.camera.read_timeout,
            target_fps: self.output.target_fps,
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            width: self.output.width,
            height: self.output.height,
            jpeg_quality: self.output.jpeg_quality,
            target_fps: self.output.target_fps,
            alpha: self.output.contrast,
            beta: self.output.brightness,
            font_path: self.output.font_path.clone(),
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr.clone(),
            max_viewers: self.max_connections,
            ..ApiConfig::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Non-blank environment value.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has invalid value '{}'", key, raw)),
        None => Ok(None),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean, got '{}'", key, value)),
    }
}
