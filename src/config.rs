//! Settings for a performance.
//!
//! Settings are read once when an [`Engine`](crate::engine::Engine) is built
//! and are read-only afterwards. Files are loaded in order (later wins):
//!
//! 1. Compiled defaults
//! 2. `/etc/cadenza/config.toml`
//! 3. `~/.config/cadenza/config.toml`
//! 4. `./cadenza.toml`, or an explicit path
//! 5. Environment variables (`CADENZA_*`)
//!
//! ```toml
//! bpm = 110
//! meter = [3, 4]
//! latency = 0.2
//! scale = "minor"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 57110
//!
//! [instruments.play]
//! kind = "sampler"
//!
//! [instruments.pads]
//! attack = 0.2
//! release = 1.5
//! ```

use crate::beat::Beat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default scsynth UDP port.
pub const SCSYNTH_PORT: u16 = 57110;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

/// Whether an instrument plays pitched notes or sample buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    #[default]
    Synth,
    Sampler,
}

/// Per-instrument defaults applied when a voice is reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    pub kind: InstrumentKind,
    pub attack: f64,
    pub decay: f64,
    pub release: f64,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        InstrumentSettings {
            kind: InstrumentKind::Synth,
            attack: 0.01,
            decay: 0.01,
            release: 0.01,
        }
    }
}

/// Where OSC bundles go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: "127.0.0.1".to_string(),
            port: SCSYNTH_PORT,
        }
    }
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Complete performance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Initial tempo in beats per minute.
    pub bpm: f64,
    /// Time signature as `[beats, unit]`.
    pub meter: [u32; 2],
    /// Seconds added to every bundle timestamp so the server receives it
    /// ahead of time.
    pub latency: f64,
    /// Extra timestamp offset in seconds, for lining up with other machines.
    pub nudge: f64,
    /// Upper bound on a single driver-thread sleep, in seconds.
    pub max_wait: f64,
    pub server: ServerSettings,
    /// Default scale name for new voices.
    pub scale: String,
    /// Default root (semitone offset) for new voices.
    pub root: f64,
    pub instruments: BTreeMap<String, InstrumentSettings>,
    /// Effect parameters every voice starts with.
    pub effects: BTreeMap<String, f64>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut instruments = BTreeMap::new();
        instruments.insert(
            "play".to_string(),
            InstrumentSettings {
                kind: InstrumentKind::Sampler,
                ..InstrumentSettings::default()
            },
        );

        let effects = [
            ("hpf", 0.0),
            ("lpf", 0.0),
            ("room", 0.1),
            ("mix", 0.1),
            ("echo", 0.0),
            ("chop", 0.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Settings {
            bpm: 120.0,
            meter: [4, 4],
            latency: 0.25,
            nudge: 0.0,
            max_wait: 0.05,
            server: ServerSettings::default(),
            scale: "major".to_string(),
            root: 0.0,
            instruments,
            effects,
        }
    }
}

impl Settings {
    /// Load settings from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load settings, using `config_path` in place of `./cadenza.toml`.
    ///
    /// Every file is merged key by key over the built-in defaults, so a file
    /// naming one instrument keeps the others.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = default_table()?;
        for path in discover_config_files(config_path) {
            let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            let table = parse_table(&contents, &path)?;
            merge_tables(&mut merged, table);
        }

        let mut settings = from_table(merged, Path::new("<merged>"))?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string. Missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let path = Path::new("<string>");
        let mut merged = default_table()?;
        merge_tables(&mut merged, parse_table(contents, path)?);
        from_table(merged, path)
    }

    /// Apply `CADENZA_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(bpm) = env_number("CADENZA_BPM")? {
            self.bpm = bpm;
        }
        if let Some(latency) = env_number("CADENZA_LATENCY")? {
            self.latency = latency;
        }
        if let Ok(host) = env::var("CADENZA_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("CADENZA_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "CADENZA_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        Ok(())
    }

    /// Defaults for `name`, falling back to a plain synth.
    pub fn instrument(&self, name: &str) -> InstrumentSettings {
        self.instruments.get(name).cloned().unwrap_or_default()
    }

    /// Length of one bar in beats.
    pub fn bar_length(&self) -> Beat {
        let [beats, unit] = self.meter;
        if unit == 0 {
            return Beat::from_integer(4);
        }
        Beat::new(4 * beats as i64, unit as i64)
    }
}

/// Config files in load order. Only files that exist are returned.
pub fn discover_config_files(override_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/cadenza/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("cadenza/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = override_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("cadenza.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// The built-in settings as a TOML table.
fn default_table() -> Result<toml::Table, ConfigError> {
    match toml::Value::try_from(Settings::default()) {
        Ok(toml::Value::Table(table)) => Ok(table),
        Ok(_) => Ok(toml::Table::new()),
        Err(e) => Err(ConfigError::Parse {
            path: PathBuf::from("<defaults>"),
            message: e.to_string(),
        }),
    }
}

fn from_table(table: toml::Table, path: &Path) -> Result<Settings, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Recursively overlay `overlay` onto `base`. Tables merge, everything else
/// is replaced.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn env_number(name: &str) -> Result<Option<f64>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
