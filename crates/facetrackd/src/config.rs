use facetrack_core::identity::ResolverConfig;
use facetrack_core::liveness::LivenessConfig;
use facetrack_core::session::SessionConfig;
use facetrack_core::tracker::TrackerConfig;
use facetrack_core::{Mode, PipelineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

/// Daemon configuration.
///
/// Built from compiled defaults, then an optional TOML file named by
/// `FACETRACK_CONFIG`, then `FACETRACK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// FaceNet-style ONNX embedding model.
    pub model_path: PathBuf,
    /// Root of the on-disk enrollment store.
    pub store_dir: PathBuf,
    /// JSON Lines frame feed; `-` reads stdin. No feed: signals only.
    pub feed_path: Option<PathBuf>,
    pub initial_mode: Mode,
    pub bus: BusKind,

    /// Track association radius in display pixels.
    pub max_match_distance: f32,
    pub lost_timeout_secs: f64,
    pub duplicate_suppression_ratio: f32,
    pub overlap_threshold: f32,
    /// Minimum detection area in processing pixels².
    pub min_face_area: f32,
    pub similarity_threshold: f32,
    pub ambiguity_margin: f32,
    pub identification_interval_secs: f64,
    pub grace_period_secs: f64,
    pub liveness_tick_secs: f64,
    pub position_interval_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facetrack");

        Self {
            model_path: data_dir.join("models/facenet.onnx"),
            store_dir: data_dir.join("faces"),
            feed_path: None,
            initial_mode: Mode::AiTracking,
            bus: BusKind::Session,
            max_match_distance: 300.0,
            lost_timeout_secs: 8.0,
            duplicate_suppression_ratio: 0.5,
            overlap_threshold: 0.3,
            min_face_area: 800.0,
            similarity_threshold: 0.3,
            ambiguity_margin: 0.05,
            identification_interval_secs: 1.0,
            grace_period_secs: 5.0,
            liveness_tick_secs: 1.0,
            position_interval_secs: 0.1,
        }
    }
}

impl Config {
    /// Load the full layered configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACETRACK_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with a TOML file. Keys absent from the file keep
    /// their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `FACETRACK_*` variables. Unparseable values are logged and
    /// ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACETRACK_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACETRACK_STORE_DIR") {
            self.store_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACETRACK_FEED_PATH") {
            self.feed_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("FACETRACK_BUS") {
            match v.as_str() {
                "session" => self.bus = BusKind::Session,
                "system" => self.bus = BusKind::System,
                other => tracing::warn!(value = other, "ignoring FACETRACK_BUS"),
            }
        }
        env_parse(&lookup, "FACETRACK_INITIAL_MODE", &mut self.initial_mode);
        env_parse(&lookup, "FACETRACK_MAX_MATCH_DISTANCE", &mut self.max_match_distance);
        env_parse(&lookup, "FACETRACK_LOST_TIMEOUT_SECS", &mut self.lost_timeout_secs);
        env_parse(
            &lookup,
            "FACETRACK_DUPLICATE_SUPPRESSION_RATIO",
            &mut self.duplicate_suppression_ratio,
        );
        env_parse(&lookup, "FACETRACK_OVERLAP_THRESHOLD", &mut self.overlap_threshold);
        env_parse(&lookup, "FACETRACK_MIN_FACE_AREA", &mut self.min_face_area);
        env_parse(&lookup, "FACETRACK_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env_parse(&lookup, "FACETRACK_AMBIGUITY_MARGIN", &mut self.ambiguity_margin);
        env_parse(
            &lookup,
            "FACETRACK_IDENTIFICATION_INTERVAL_SECS",
            &mut self.identification_interval_secs,
        );
        env_parse(&lookup, "FACETRACK_GRACE_PERIOD_SECS", &mut self.grace_period_secs);
        env_parse(&lookup, "FACETRACK_LIVENESS_TICK_SECS", &mut self.liveness_tick_secs);
        env_parse(&lookup, "FACETRACK_POSITION_INTERVAL_SECS", &mut self.position_interval_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline_config().map(|_| ())
    }

    /// Component configuration for [`facetrack_core::FacePipeline`].
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        if !(self.max_match_distance > 0.0) {
            return Err(invalid("max_match_distance", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.duplicate_suppression_ratio) {
            return Err(invalid("duplicate_suppression_ratio", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(invalid("overlap_threshold", "must be within [0, 1]"));
        }

        Ok(PipelineConfig {
            tracker: TrackerConfig {
                max_match_distance: self.max_match_distance,
                lost_timeout: secs("lost_timeout_secs", self.lost_timeout_secs)?,
                duplicate_suppression_ratio: self.duplicate_suppression_ratio,
            },
            resolver: ResolverConfig {
                similarity_threshold: self.similarity_threshold,
                ambiguity_margin: self.ambiguity_margin,
            },
            session: SessionConfig {
                grace_period: secs("grace_period_secs", self.grace_period_secs)?,
            },
            liveness: LivenessConfig {
                tick_interval: nonzero_secs("liveness_tick_secs", self.liveness_tick_secs)?,
            },
            overlap_threshold: self.overlap_threshold,
            min_face_area: self.min_face_area,
            identification_interval: secs(
                "identification_interval_secs",
                self.identification_interval_secs,
            )?,
            position_interval: secs("position_interval_secs", self.position_interval_secs)?,
            initial_mode: self.initial_mode,
        })
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.to_string() }
}

fn secs(key: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::Invalid { key, reason: e.to_string() })
}

fn nonzero_secs(key: &'static str, value: f64) -> Result<Duration, ConfigError> {
    let d = secs(key, value)?;
    if d.is_zero() {
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(d)
}
