use facematch_core::{ResizePolicy, ServiceSettings};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Daemon configuration.
///
/// Layered as defaults, then an optional TOML file named by
/// `FACEMATCH_CONFIG`, then `FACEMATCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the HTTP server.
    pub bind: SocketAddr,
    /// Directory of reference images, one per identity.
    pub known_faces_dir: PathBuf,
    /// Directory for uploads, crops and gallery copies.
    pub temp_dir: PathBuf,
    /// URL prefix under which `temp_dir` is served.
    pub temp_url_prefix: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean distance accepted as a match.
    pub tolerance: f32,
    /// Age after which temp files are deleted.
    pub retention: Duration,
    /// Pause between cleanup cycles.
    pub cleanup_interval: Duration,
    /// Request body limit for uploads.
    pub max_upload_bytes: usize,
    pub resize: ResizePolicy,
    /// Cache gallery embeddings keyed by path + mtime.
    pub gallery_cache: bool,
    /// Reject registrations whose image contains no face.
    pub require_face_on_register: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            known_faces_dir: PathBuf::from("known_faces"),
            temp_dir: PathBuf::from("static/temp"),
            temp_url_prefix: "/static/temp".to_string(),
            model_dir: facematch_core::default_model_dir(),
            tolerance: facematch_core::matcher::DEFAULT_TOLERANCE,
            retention: facematch_core::sweep::DEFAULT_RETENTION,
            cleanup_interval: Duration::from_secs(60 * 60),
            max_upload_bytes: 10 * 1024 * 1024,
            resize: ResizePolicy::Original,
            gallery_cache: true,
            require_face_on_register: true,
        }
    }
}

/// On-disk TOML layer; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind: Option<SocketAddr>,
    known_faces_dir: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    temp_url_prefix: Option<String>,
    model_dir: Option<PathBuf>,
    tolerance: Option<f32>,
    retention_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    max_upload_bytes: Option<usize>,
    resize: Option<String>,
    gallery_cache: Option<bool>,
    require_face_on_register: Option<bool>,
}

impl Config {
    /// Load from `FACEMATCH_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEMATCH_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(src)?;
        let mut config = Self::default();

        if let Some(v) = file.bind {
            config.bind = v;
        }
        if let Some(v) = file.known_faces_dir {
            config.known_faces_dir = v;
        }
        if let Some(v) = file.temp_dir {
            config.temp_dir = v;
        }
        if let Some(v) = file.temp_url_prefix {
            config.temp_url_prefix = v;
        }
        if let Some(v) = file.model_dir {
            config.model_dir = v;
        }
        if let Some(v) = file.tolerance {
            config.tolerance = v;
        }
        if let Some(v) = file.retention_secs {
            config.retention = Duration::from_secs(v);
        }
        if let Some(v) = file.cleanup_interval_secs {
            config.cleanup_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.max_upload_bytes {
            config.max_upload_bytes = v;
        }
        if let Some(v) = file.resize {
            config.resize = parse_resize(&v)?;
        }
        if let Some(v) = file.gallery_cache {
            config.gallery_cache = v;
        }
        if let Some(v) = file.require_face_on_register {
            config.require_face_on_register = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `FACEMATCH_*` overrides from `lookup`.
    ///
    /// Unparseable values are logged and ignored, leaving the previous layer in effect.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env_parse(&lookup, "FACEMATCH_BIND") {
            self.bind = v;
        }
        if let Some(v) = lookup("FACEMATCH_KNOWN_FACES_DIR") {
            self.known_faces_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEMATCH_TEMP_DIR") {
            self.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEMATCH_TEMP_URL_PREFIX") {
            self.temp_url_prefix = v;
        }
        if let Some(v) = lookup("FACEMATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse(&lookup, "FACEMATCH_TOLERANCE") {
            self.tolerance = v;
        }
        if let Some(v) = env_parse(&lookup, "FACEMATCH_RETENTION_SECS") {
            self.retention = Duration::from_secs(v);
        }
        if let Some(v) = env_parse(&lookup, "FACEMATCH_CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse(&lookup, "FACEMATCH_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = v;
        }
        if let Some(v) = lookup("FACEMATCH_RESIZE") {
            self.resize = parse_resize(&v)?;
        }
        if let Some(v) = lookup("FACEMATCH_GALLERY_CACHE") {
            self.gallery_cache = v != "0";
        }
        if let Some(v) = lookup("FACEMATCH_REQUIRE_FACE_ON_REGISTER") {
            self.require_face_on_register = v != "0";
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::Invalid {
                key: "tolerance",
                message: format!("must be a positive number, got {}", self.tolerance),
            });
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "cleanup_interval_secs",
                message: "must be greater than zero".into(),
            });
        }
        if !self.temp_url_prefix.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "temp_url_prefix",
                message: format!("must start with '/', got {:?}", self.temp_url_prefix),
            });
        }
        Ok(())
    }

    /// Settings handed to the request-path service.
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            known_faces_dir: self.known_faces_dir.clone(),
            temp_dir: self.temp_dir.clone(),
            temp_url_prefix: self.temp_url_prefix.clone(),
            tolerance: self.tolerance,
            resize: self.resize,
            gallery_cache: self.gallery_cache,
            require_face_on_register: self.require_face_on_register,
        }
    }
}

fn parse_resize(value: &str) -> Result<ResizePolicy, ConfigError> {
    value
        .parse()
        .map_err(|message| ConfigError::Invalid { key: "resize", message })
}

fn env_parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
