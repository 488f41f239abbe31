//! Configuration loading and root folder resolution
//!
//! Resolution follows the priority order used across the services:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`FUELWATCH_*`)
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Policy for when an inspection record may exist.
///
/// `PerCycle` materializes one inspection per PLC cycle and attaches photos
/// best-effort afterwards; photo-less inspections are retained. `MatchFirst`
/// requires at least one staged photo to match the cycle before any
/// inspection is created; cycles without evidence are consumed silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InspectionPolicy {
    PerCycle,
    MatchFirst,
}

impl Default for InspectionPolicy {
    fn default() -> Self {
        InspectionPolicy::PerCycle
    }
}

impl FromStr for InspectionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-cycle" | "per_cycle" => Ok(InspectionPolicy::PerCycle),
            "match-first" | "match_first" => Ok(InspectionPolicy::MatchFirst),
            other => Err(Error::Config(format!(
                "Unknown inspection policy: {other} (expected per-cycle or match-first)"
            ))),
        }
    }
}

/// On-disk TOML shape; every field optional so partial files work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub feed_path: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub committed_dir: Option<PathBuf>,
    pub tick_interval_secs: Option<u64>,
    pub photo_window_slack_secs: Option<i64>,
    pub inspection_policy: Option<InspectionPolicy>,
    pub station_id: Option<String>,
}

/// Resolved service configuration
#[derive(Debug, Clone)]
pub struct FuelwatchConfig {
    /// Root folder holding the database and photo areas
    pub root_folder: PathBuf,
    /// Database file path
    pub database: PathBuf,
    /// Line-oriented telemetry feed; ingestion is skipped when unset
    pub feed_path: Option<PathBuf>,
    /// Staging area for incoming photos (read + move out, never written)
    pub staging_dir: PathBuf,
    /// Committed area for correlated photos
    pub committed_dir: PathBuf,
    /// Scheduler cadence in seconds
    pub tick_interval_secs: u64,
    /// Tolerance added on both sides of a cycle's capture window when
    /// matching photo timestamps
    pub photo_window_slack_secs: i64,
    /// When an inspection may exist (see [`InspectionPolicy`])
    pub inspection_policy: InspectionPolicy,
    /// Station whose aggregate counters this deployment maintains
    pub station_id: String,
}

impl FuelwatchConfig {
    /// Resolve configuration from CLI overrides, environment, TOML, defaults.
    pub fn resolve(
        cli_config: Option<&Path>,
        cli_root: Option<&Path>,
    ) -> Result<FuelwatchConfig> {
        let toml = load_toml_config(cli_config)?;

        let root_folder = cli_root
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FUELWATCH_ROOT").ok().map(PathBuf::from))
            .or_else(|| toml.root_folder.clone())
            .unwrap_or_else(default_root_folder);

        let database = env_path("FUELWATCH_DB")
            .or_else(|| toml.database.clone())
            .unwrap_or_else(|| root_folder.join("fuelwatch.db"));

        let feed_path = env_path("FUELWATCH_FEED").or_else(|| toml.feed_path.clone());

        let staging_dir = env_path("FUELWATCH_STAGING")
            .or_else(|| toml.staging_dir.clone())
            .unwrap_or_else(|| root_folder.join("photos").join("staging"));

        let committed_dir = env_path("FUELWATCH_COMMITTED")
            .or_else(|| toml.committed_dir.clone())
            .unwrap_or_else(|| root_folder.join("photos").join("committed"));

        let tick_interval_secs = env_parse("FUELWATCH_INTERVAL_SECS")?
            .or(toml.tick_interval_secs)
            .unwrap_or(30);

        let photo_window_slack_secs = env_parse("FUELWATCH_WINDOW_SLACK_SECS")?
            .or(toml.photo_window_slack_secs)
            .unwrap_or(120);

        let inspection_policy = match std::env::var("FUELWATCH_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => toml.inspection_policy.unwrap_or_default(),
        };

        let station_id = std::env::var("FUELWATCH_STATION")
            .ok()
            .or_else(|| toml.station_id.clone())
            .unwrap_or_else(|| "station-1".to_string());

        let config = FuelwatchConfig {
            root_folder,
            database,
            feed_path,
            staging_dir,
            committed_dir,
            tick_interval_secs,
            photo_window_slack_secs,
            inspection_policy,
            station_id,
        };
        debug!(?config, "Resolved configuration");
        Ok(config)
    }

    /// Create the root folder and both photo areas if missing.
    ///
    /// The staging area is created too so an empty deployment starts clean,
    /// but nothing is ever written into it afterwards.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        std::fs::create_dir_all(&self.staging_dir)?;
        std::fs::create_dir_all(&self.committed_dir)?;
        Ok(())
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name).ok().map(PathBuf::from)
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid value for {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}

/// Load the TOML config file, if one exists.
///
/// An explicitly named file must parse; a missing default-location file is
/// simply an empty configuration.
fn load_toml_config(cli_config: Option<&Path>) -> Result<TomlConfig> {
    let path = match cli_config {
        Some(path) => path.to_path_buf(),
        None => match default_config_file() {
            Some(path) if path.exists() => path,
            _ => return Ok(TomlConfig::default()),
        },
    };

    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("Cannot read {}: {e}", path.display())))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Cannot parse {}: {e}", path.display())))?;
    info!(path = %path.display(), "Loaded TOML configuration");
    Ok(config)
}

/// Default configuration file path for the platform
fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("fuelwatch").join("fuelwatch.toml"))
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("fuelwatch"))
        .unwrap_or_else(|| PathBuf::from("./fuelwatch_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for name in [
            "FUELWATCH_ROOT",
            "FUELWATCH_DB",
            "FUELWATCH_FEED",
            "FUELWATCH_STAGING",
            "FUELWATCH_COMMITTED",
            "FUELWATCH_INTERVAL_SECS",
            "FUELWATCH_WINDOW_SLACK_SECS",
            "FUELWATCH_POLICY",
            "FUELWATCH_STATION",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_file_or_env() {
        clear_env();
        let root = tempfile::tempdir().unwrap();
        let config =
            FuelwatchConfig::resolve(None, Some(root.path())).unwrap();

        assert_eq!(config.root_folder, root.path());
        assert_eq!(config.database, root.path().join("fuelwatch.db"));
        assert_eq!(config.tick_interval_secs, 30);
        assert_eq!(config.photo_window_slack_secs, 120);
        assert_eq!(config.inspection_policy, InspectionPolicy::PerCycle);
        assert_eq!(config.station_id, "station-1");
        assert!(config.feed_path.is_none());
        assert!(config
            .staging_dir
            .starts_with(root.path().join("photos")));
    }

    #[test]
    #[serial]
    fn toml_file_overrides_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fuelwatch.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
root_folder = "{root}"
tick_interval_secs = 5
inspection_policy = "match-first"
station_id = "line-7"
"#,
            root = dir.path().display()
        )
        .unwrap();

        let config = FuelwatchConfig::resolve(Some(&config_path), None).unwrap();
        assert_eq!(config.tick_interval_secs, 5);
        assert_eq!(config.inspection_policy, InspectionPolicy::MatchFirst);
        assert_eq!(config.station_id, "line-7");
    }

    #[test]
    #[serial]
    fn env_overrides_toml() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fuelwatch.toml");
        std::fs::write(&config_path, "station_id = \"from-toml\"\n").unwrap();

        std::env::set_var("FUELWATCH_STATION", "from-env");
        std::env::set_var("FUELWATCH_POLICY", "match-first");
        let config =
            FuelwatchConfig::resolve(Some(&config_path), Some(Path::new("/tmp/fw"))).unwrap();
        clear_env();

        assert_eq!(config.station_id, "from-env");
        assert_eq!(config.inspection_policy, InspectionPolicy::MatchFirst);
    }

    #[test]
    #[serial]
    fn invalid_policy_is_rejected() {
        clear_env();
        assert!("sometimes".parse::<InspectionPolicy>().is_err());
        assert_eq!(
            "per-cycle".parse::<InspectionPolicy>().unwrap(),
            InspectionPolicy::PerCycle
        );
    }
}
