//! Configuration Vault – reads/writes `~/.aegiscan/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use aegis_runtime::{PipelineConfig, Uplink};
use serde::{Deserialize, Serialize};

/// Persisted user configuration stored in `~/.aegiscan/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Name of the virtual CAN interface.
    #[serde(default = "default_can_channel")]
    pub can_channel: String,

    /// Producer → translator channel capacity.
    #[serde(default = "default_capacity")]
    pub channel_capacity: usize,

    /// Telemetry records kept for `/telemetry`.
    #[serde(default = "default_capacity")]
    pub telemetry_capacity: usize,

    /// Generator tick period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Send samples over UDP to this translator ingress instead of in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_target: Option<SocketAddr>,

    /// Accept samples from a separate producer process on this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_addr: Option<SocketAddr>,

    /// Length of the DoS event burst in milliseconds.
    #[serde(default = "default_flood_duration_ms")]
    pub flood_duration_ms: u64,

    /// Rate of the DoS event burst.
    #[serde(default = "default_flood_rate_hz")]
    pub flood_rate_hz: f64,
}

fn default_can_channel() -> String {
    "vcan0".to_string()
}
fn default_capacity() -> usize {
    500
}
fn default_tick_ms() -> u64 {
    20
}
fn default_flood_duration_ms() -> u64 {
    3_000
}
fn default_flood_rate_hz() -> f64 {
    80.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            can_channel: default_can_channel(),
            channel_capacity: default_capacity(),
            telemetry_capacity: default_capacity(),
            tick_ms: default_tick_ms(),
            uplink_target: None,
            ingress_addr: None,
            flood_duration_ms: default_flood_duration_ms(),
            flood_rate_hz: default_flood_rate_hz(),
        }
    }
}

impl Config {
    /// Translate the vault into the runtime's pipeline configuration.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let mut pipeline = PipelineConfig {
            channel_capacity: self.channel_capacity,
            telemetry_capacity: self.telemetry_capacity,
            ..PipelineConfig::default()
        };
        pipeline.producer.tick_ms = self.tick_ms;
        pipeline.producer.uplink = match self.uplink_target {
            Some(target) => Uplink::Datagram { target },
            None => Uplink::InProcess,
        };
        pipeline.translator.ingress = self.ingress_addr;
        pipeline.flood.duration_ms = self.flood_duration_ms;
        pipeline.flood.rate_hz = self.flood_rate_hz;
        pipeline
    }
}

/// Return the path to `~/.aegiscan/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".aegiscan").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `AEGIS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `AEGIS_TICK_MS` | `tick_ms` |
/// | `AEGIS_CHANNEL_CAPACITY` | `channel_capacity` |
/// | `AEGIS_UPLINK_TARGET` | `uplink_target` |
/// | `AEGIS_INGRESS_ADDR` | `ingress_addr` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("AEGIS_TICK_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.tick_ms = ms;
    }
    if let Some(v) = var("AEGIS_CHANNEL_CAPACITY")
        && let Ok(cap) = v.trim().parse::<usize>()
    {
        cfg.channel_capacity = cap;
    }
    if let Some(v) = var("AEGIS_UPLINK_TARGET")
        && let Ok(addr) = v.trim().parse::<SocketAddr>()
    {
        cfg.uplink_target = Some(addr);
    }
    if let Some(v) = var("AEGIS_INGRESS_ADDR")
        && let Ok(addr) = v.trim().parse::<SocketAddr>()
    {
        cfg.ingress_addr = Some(addr);
    }
}

/// Save the config to disk, creating `~/.aegiscan/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_config_with_addresses() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            uplink_target: Some("127.0.0.1:47000".parse().unwrap()),
            tick_ms: 10,
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.tick_ms, 10);
        assert_eq!(loaded.uplink_target, cfg.uplink_target);
        assert_eq!(loaded.ingress_addr, None);
        assert_eq!(loaded.can_channel, "vcan0");
    }

    #[test]
    fn config_path_points_to_aegiscan_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".aegiscan"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str("tick_ms = 5\n").expect("parse");
        assert_eq!(cfg.tick_ms, 5);
        assert_eq!(cfg.channel_capacity, 500);
        assert_eq!(cfg.flood_rate_hz, 80.0);
    }

    #[test]
    fn overrides_apply_parsed_values() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[
                ("AEGIS_TICK_MS", "5"),
                ("AEGIS_CHANNEL_CAPACITY", "64"),
                ("AEGIS_UPLINK_TARGET", "127.0.0.1:9100"),
                ("AEGIS_INGRESS_ADDR", "0.0.0.0:9100"),
            ]),
        );
        assert_eq!(cfg.tick_ms, 5);
        assert_eq!(cfg.channel_capacity, 64);
        assert_eq!(cfg.uplink_target, Some("127.0.0.1:9100".parse().unwrap()));
        assert_eq!(cfg.ingress_addr, Some("0.0.0.0:9100".parse().unwrap()));
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[("AEGIS_TICK_MS", "fast"), ("AEGIS_UPLINK_TARGET", "nowhere")]),
        );
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn pipeline_config_reflects_vault() {
        let cfg = Config {
            channel_capacity: 32,
            uplink_target: Some("127.0.0.1:9000".parse().unwrap()),
            flood_rate_hz: 10.0,
            ..Config::default()
        };
        let pipeline = cfg.to_pipeline_config();
        assert_eq!(pipeline.channel_capacity, 32);
        assert!(matches!(pipeline.producer.uplink, Uplink::Datagram { .. }));
        assert_eq!(pipeline.flood.rate_hz, 10.0);
        assert!(pipeline.validate().is_ok());
    }
}
