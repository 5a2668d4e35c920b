use blockeig_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Returns the ~/.blockeig directory, creating it if needed.
/// Falls back to a local `.blockeig` directory if the home directory cannot be determined.
pub fn blockeig_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(mut path) => {
            path.push(".blockeig");
            if let Err(e) = fs::create_dir_all(&path) {
                warn!(error = %e, "Could not create ~/.blockeig, falling back to local .blockeig");
                let fallback = PathBuf::from(".blockeig");
                let _ = fs::create_dir_all(&fallback);
                return fallback;
            }
            path
        }
        None => {
            warn!("Could not determine home directory, falling back to local .blockeig");
            let fallback = PathBuf::from(".blockeig");
            let _ = fs::create_dir_all(&fallback);
            fallback
        }
    }
}

/// Parameters of the synthetic matrix the daemon solves each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Matrix dimension; must be even (two rows per block)
    #[serde(default = "default_size")]
    pub size: usize,
    /// Fraction of off-diagonal entries that are non-zero
    #[serde(default = "default_density")]
    pub density: f64,
    /// Added to the leading diagonal entry to keep one eigenvalue dominant
    #[serde(default = "default_diagonal_boost")]
    pub diagonal_boost: f64,
    /// Relative perturbation applied to every entry between ticks
    #[serde(default = "default_drift")]
    pub drift: f64,
    /// Upper bound of the simulated per-block compute latency (microseconds)
    #[serde(default = "default_jitter_us")]
    pub jitter_us: u64,
    /// Rows whose density exceeds this fraction are shipped as dense payloads
    #[serde(default = "default_dense_cutoff")]
    pub dense_cutoff: f64,
}

fn default_size() -> usize {
    64
}
fn default_density() -> f64 {
    0.1
}
fn default_diagonal_boost() -> f64 {
    4.0
}
fn default_drift() -> f64 {
    0.01
}
fn default_jitter_us() -> u64 {
    200
}
fn default_dense_cutoff() -> f64 {
    0.5
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            density: default_density(),
            diagonal_boost: default_diagonal_boost(),
            drift: default_drift(),
            jitter_us: default_jitter_us(),
            dense_cutoff: default_dense_cutoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn get_config_path() -> PathBuf {
        let mut path = blockeig_data_dir();
        path.push("config.toml");
        path
    }

    /// Load the default config file, creating it on first run.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::get_config_path();

        if !path.exists() {
            let config = Config::default();
            config.save_to(&path)?;
            return Ok(config);
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml)?;
        Ok(())
    }

    /// Reject settings the synthetic source cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;
        let m = &self.matrix;
        anyhow::ensure!(
            m.size >= 2 && m.size % 2 == 0 && m.size <= 512,
            "matrix.size must be even and within 2..=512, got {}",
            m.size
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&m.density),
            "matrix.density must be within 0..=1, got {}",
            m.density
        );
        anyhow::ensure!(
            m.diagonal_boost >= 0.0 && m.drift >= 0.0,
            "matrix.diagonal_boost and matrix.drift must be non-negative"
        );
        Ok(())
    }
}
