use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("LIKENESS_COLLECTION_ID is required")]
    MissingCollection,
    #[error("set LIKENESS_BUCKET or LIKENESS_STORAGE_DIR for image storage")]
    MissingStorage,
}

/// Daemon configuration.
///
/// Loaded from `LIKENESS_*` environment variables, optionally seeded from a
/// TOML file named by `LIKENESS_CONFIG`. Environment values win over the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Recognition provider collection holding indexed faces.
    pub collection_id: String,
    /// AWS region override; otherwise the SDK's default chain decides.
    pub aws_region: Option<String>,
    /// S3 bucket for face images and videos. Takes precedence over `storage_dir`.
    pub bucket: Option<String>,
    /// Base URL objects are served from, if not the bucket endpoint.
    pub public_base_url: Option<String>,
    /// Local directory for face images and videos when no bucket is set.
    pub storage_dir: Option<PathBuf>,
    /// Path to the SQLite record store.
    pub db_path: PathBuf,
    /// Size cap on one capture recording.
    pub max_video_bytes: usize,
    /// MIME type assumed for clips received without one.
    pub video_mime_type: String,
    /// Device geolocation timeout.
    pub geolocation_timeout_secs: u64,
    /// Request timeout for geocoding HTTP calls.
    pub http_timeout_secs: u64,
    /// Fixed kiosk position, used as the device geolocation source.
    pub kiosk_latitude: Option<f64>,
    pub kiosk_longitude: Option<f64>,
    pub kiosk_accuracy_m: f64,
    /// Reverse geocoding endpoint; empty disables reverse geocoding.
    pub nominatim_url: String,
    /// IP geolocation endpoint; empty disables the IP fallback.
    pub ipapi_url: String,
    /// Attach the daemon host's fingerprint when a request carries none.
    pub host_fingerprint: bool,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
    /// Capture sessions left idle this long are closed as abandoned.
    pub session_idle_secs: u64,
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("likeness")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collection_id: String::new(),
            aws_region: None,
            bucket: None,
            public_base_url: None,
            storage_dir: None,
            db_path: default_data_dir().join("records.db"),
            max_video_bytes: likeness_capture::DEFAULT_MAX_VIDEO_BYTES,
            video_mime_type: "video/webm".to_string(),
            geolocation_timeout_secs: 10,
            http_timeout_secs: 5,
            kiosk_latitude: None,
            kiosk_longitude: None,
            kiosk_accuracy_m: 25.0,
            nominatim_url: likeness_capture::geocode::DEFAULT_NOMINATIM_URL.to_string(),
            ipapi_url: likeness_capture::geocode::DEFAULT_IPAPI_URL.to_string(),
            host_fingerprint: true,
            session_bus: false,
            session_idle_secs: 600,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let mut config = match env.string("LIKENESS_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(v) = env.string("LIKENESS_COLLECTION_ID") {
            config.collection_id = v;
        }
        env.optional("LIKENESS_AWS_REGION", &mut config.aws_region);
        env.optional("LIKENESS_BUCKET", &mut config.bucket);
        env.optional("LIKENESS_PUBLIC_BASE_URL", &mut config.public_base_url);
        if let Some(v) = env.string("LIKENESS_STORAGE_DIR") {
            config.storage_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env.string("LIKENESS_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        env.parsed("LIKENESS_MAX_VIDEO_BYTES", &mut config.max_video_bytes)?;
        if let Some(v) = env.string("LIKENESS_VIDEO_MIME_TYPE") {
            config.video_mime_type = v;
        }
        env.parsed("LIKENESS_GEOLOCATION_TIMEOUT_SECS", &mut config.geolocation_timeout_secs)?;
        env.parsed("LIKENESS_HTTP_TIMEOUT_SECS", &mut config.http_timeout_secs)?;
        env.parsed_optional("LIKENESS_KIOSK_LATITUDE", &mut config.kiosk_latitude)?;
        env.parsed_optional("LIKENESS_KIOSK_LONGITUDE", &mut config.kiosk_longitude)?;
        env.parsed("LIKENESS_KIOSK_ACCURACY_M", &mut config.kiosk_accuracy_m)?;
        if let Some(v) = lookup("LIKENESS_NOMINATIM_URL") {
            config.nominatim_url = v;
        }
        if let Some(v) = lookup("LIKENESS_IPAPI_URL") {
            config.ipapi_url = v;
        }
        env.flag("LIKENESS_HOST_FINGERPRINT", &mut config.host_fingerprint);
        env.flag("LIKENESS_SESSION_BUS", &mut config.session_bus);
        env.parsed("LIKENESS_SESSION_IDLE_SECS", &mut config.session_idle_secs)?;

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.collection_id.trim().is_empty() {
            return Err(ConfigError::MissingCollection);
        }
        if self.bucket.is_none() && self.storage_dir.is_none() {
            return Err(ConfigError::MissingStorage);
        }
        if self.session_idle_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "LIKENESS_SESSION_IDLE_SECS",
                value: "0".into(),
            });
        }
        if self.kiosk_latitude.is_some() != self.kiosk_longitude.is_some() {
            return Err(ConfigError::Invalid {
                key: "LIKENESS_KIOSK_LATITUDE/LIKENESS_KIOSK_LONGITUDE",
                value: "only one coordinate set".into(),
            });
        }
        Ok(())
    }

    pub fn kiosk_position(&self) -> Option<(f64, f64)> {
        self.kiosk_latitude.zip(self.kiosk_longitude)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-empty value of `key`.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn optional(&self, key: &str, slot: &mut Option<String>) {
        if let Some(v) = self.string(key) {
            *slot = Some(v);
        }
    }

    fn parsed<T: FromStr>(&self, key: &'static str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(v) = self.string(key) {
            *slot = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: v })?;
        }
        Ok(())
    }

    fn parsed_optional<T: FromStr>(
        &self,
        key: &'static str,
        slot: &mut Option<T>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = self.string(key) {
            *slot = Some(
                v.trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { key, value: v })?,
            );
        }
        Ok(())
    }

    fn flag(&self, key: &str, slot: &mut bool) {
        if let Some(v) = self.string(key) {
            *slot = v != "0";
        }
    }
}
