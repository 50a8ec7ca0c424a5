//! Host configuration – reads/writes `~/.singula/config.toml`.
//!
//! ```toml
//! [session]
//! vendor = "sim"
//! sim_axes = 4
//! control_mode = "remote"
//!
//! [driver]
//! max_rpm = 3000.0
//! gear_ratio = 1.0
//!
//! [frame_guard]
//! heartbeat_timeout_ms = 3000
//!
//! [io]
//! start = 0
//! stop = 1
//! emergency_stop = 3
//! emergency_stop_active_low = true
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use singula_kernel::{FrameGuardConfig, IoButtonMap};
use singula_runtime::SessionConfig;
use singula_types::{ControlMode, DriverOptions, SingulaError};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub frame_guard: FrameGuardSection,
    /// Panel buttons.  Absent means no panel is wired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io: Option<IoSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub vendor: String,
    /// Overrides the axis count reported by the bus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_count: Option<i32>,
    /// Axes on the simulated bus.
    pub sim_axes: i32,
    pub main_axes: usize,
    pub eject_axes: usize,
    pub control_mode: ControlMode,
    pub local_rpm: f64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            vendor: "sim".to_string(),
            axis_count: None,
            sim_axes: 4,
            main_axes: 0,
            eject_axes: 0,
            control_mode: ControlMode::Remote,
            local_rpm: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub command_min_interval_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_rpm: f64,
    pub max_accel_rpm_s: f64,
    pub max_decel_rpm_s: f64,
    pub gear_ratio: f64,
}

impl Default for DriverSection {
    fn default() -> Self {
        let d = DriverOptions::default();
        Self {
            command_min_interval_ms: d.command_min_interval.as_millis() as u64,
            max_retries: d.max_retries,
            initial_backoff_ms: d.initial_backoff.as_millis() as u64,
            max_backoff_ms: d.max_backoff.as_millis() as u64,
            max_rpm: d.max_rpm,
            max_accel_rpm_s: d.max_accel_rpm_s,
            max_decel_rpm_s: d.max_decel_rpm_s,
            gear_ratio: d.gear_ratio,
        }
    }
}

impl DriverSection {
    pub fn options(&self) -> DriverOptions {
        DriverOptions {
            command_min_interval: Duration::from_millis(self.command_min_interval_ms),
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_rpm: self.max_rpm,
            max_accel_rpm_s: self.max_accel_rpm_s,
            max_decel_rpm_s: self.max_decel_rpm_s,
            gear_ratio: self.gear_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameGuardSection {
    pub degrade_factor: f64,
    pub window: usize,
    pub heartbeat_timeout_ms: u64,
    pub watchdog_tick_ms: u64,
}

impl Default for FrameGuardSection {
    fn default() -> Self {
        let g = FrameGuardConfig::default();
        Self {
            degrade_factor: g.degrade_factor,
            window: g.window_capacity,
            heartbeat_timeout_ms: g.heartbeat_timeout.as_millis() as u64,
            watchdog_tick_ms: g.watchdog_tick.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_stop: Option<u8>,
    pub emergency_stop_active_low: bool,
    pub poll_ms: u64,
}

impl Default for IoSection {
    fn default() -> Self {
        Self {
            start: None,
            stop: None,
            reset: None,
            emergency_stop: None,
            emergency_stop_active_low: true,
            poll_ms: 20,
        }
    }
}

impl Config {
    /// Translate the file into a session configuration.
    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        let g = &self.frame_guard;
        SessionConfig {
            vendor: s.vendor.clone(),
            axis_count: s.axis_count,
            main_axes: s.main_axes,
            eject_axes: s.eject_axes,
            driver: self.driver.options(),
            control_mode: s.control_mode,
            local_rpm: s.local_rpm,
            frame_guard: FrameGuardConfig {
                degrade_factor: g.degrade_factor,
                window_capacity: g.window,
                heartbeat_timeout: Duration::from_millis(g.heartbeat_timeout_ms),
                watchdog_tick: Duration::from_millis(g.watchdog_tick_ms.max(1)),
                ..FrameGuardConfig::default()
            },
            io_buttons: self.io.as_ref().map(|io| IoButtonMap {
                start: io.start,
                stop: io.stop,
                reset: io.reset,
                emergency_stop: io.emergency_stop,
                emergency_stop_active_low: io.emergency_stop_active_low,
            }),
            io_poll: Duration::from_millis(self.io.as_ref().map_or(20, |io| io.poll_ms.max(1))),
        }
    }
}

/// Return the path to `~/.singula/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".singula").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, SingulaError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, SingulaError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| SingulaError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| SingulaError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SINGULA_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SINGULA_VENDOR` | `session.vendor` |
/// | `SINGULA_AXIS_COUNT` | `session.axis_count` |
/// | `SINGULA_SIM_AXES` | `session.sim_axes` |
/// | `SINGULA_CONTROL_MODE` | `session.control_mode` (`remote` / `local`) |
/// | `SINGULA_LOCAL_RPM` | `session.local_rpm` |
/// | `SINGULA_HEARTBEAT_TIMEOUT_MS` | `frame_guard.heartbeat_timeout_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SINGULA_VENDOR") {
        cfg.session.vendor = v;
    }
    if let Some(v) = lookup("SINGULA_AXIS_COUNT")
        && let Ok(n) = v.trim().parse::<i32>()
    {
        cfg.session.axis_count = Some(n);
    }
    if let Some(v) = lookup("SINGULA_SIM_AXES")
        && let Ok(n) = v.trim().parse::<i32>()
    {
        cfg.session.sim_axes = n;
    }
    if let Some(v) = lookup("SINGULA_CONTROL_MODE") {
        match v.trim().to_ascii_lowercase().as_str() {
            "remote" => cfg.session.control_mode = ControlMode::Remote,
            "local" => cfg.session.control_mode = ControlMode::Local,
            _ => {}
        }
    }
    if let Some(v) = lookup("SINGULA_LOCAL_RPM")
        && let Ok(rpm) = v.trim().parse::<f64>()
    {
        cfg.session.local_rpm = rpm;
    }
    if let Some(v) = lookup("SINGULA_HEARTBEAT_TIMEOUT_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.frame_guard.heartbeat_timeout_ms = ms;
    }
}

/// Save the config to disk, creating `~/.singula/` if necessary.
pub fn save(cfg: &Config) -> Result<(), SingulaError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), SingulaError> {
    let io_err = |what: &str, e: std::io::Error| SingulaError::Config(format!("{what}: {e}"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("failed to create config directory", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("failed to set config directory permissions", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| SingulaError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err(&format!("failed to write {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| io_err(&format!("failed to write {}", path.display()), e))?;
    Ok(())
}
