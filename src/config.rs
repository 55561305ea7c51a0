//! This module holds the runtime configuration of the CMUX bring-up daemon.
//!
//! Every value has a built-in default matching the gateway hardware, so the
//! daemon runs without any configuration file. A JSON file can override any
//! subset of the fields.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use directories::ProjectDirs;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CMUX_CONFIG";

const CONFIG_FILE_NAME: &str = "cmux.json";

/// Smallest and largest frame size accepted by the n_gsm line discipline.
const MIN_MTU: u32 = 8;
const MAX_MTU: u32 = 1500;

/// GSM 07.10 protocol timers handed to the kernel.
///
/// `t1`, `t2` and `t3` are in units of 10 ms, `n2` is a retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxTimers {
    pub t1: u32,
    pub t2: u32,
    pub t3: u32,
    pub n2: u32,
}

impl Default for MuxTimers {
    fn default() -> Self {
        Self { t1: 10, t2: 30, t3: 10, n2: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmuxConfig {
    /// Serial device wired to the modem.
    pub serial_port: PathBuf,
    /// Multiplexed channel carrying AT commands once CMUX is up.
    pub mux_channel_port: PathBuf,
    pub baud_rate: u32,
    /// Frame size advertised in `AT+CMUX` and programmed as MRU/MTU.
    pub mtu: u32,
    pub response_timeout_ms: u64,
    pub response_buffer_size: usize,
    pub timers: MuxTimers,
    /// Command written to the AT sub-channel during teardown.
    pub reset_command: String,
}

impl Default for CmuxConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyS4".into(),
            mux_channel_port: "/dev/gsmtty3".into(),
            baud_rate: 3_000_000,
            mtu: 1428,
            response_timeout_ms: 2000,
            response_buffer_size: 64,
            timers: MuxTimers::default(),
            reset_command: "at+cfun=15\n".to_string(),
        }
    }
}

impl CmuxConfig {
    /// Resolves and loads the configuration.
    ///
    /// The file named by `explicit` (usually the first command line argument)
    /// wins, then the `CMUX_CONFIG` variable, then `cmux.json` in the user
    /// configuration directory. Without any of them the defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be read or parsed,
    /// or if the resulting configuration is invalid.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self> {
        let explicit = explicit.or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    info!("No configuration file found, using defaults");
                    Self::default()
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from {:?}", path);
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading configuration {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("parsing configuration {:?}", path))?;
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        match ProjectDirs::from("com", "gateway", "modem-cmux") {
            Some(dirs) => Some(dirs.config_dir().join(CONFIG_FILE_NAME)),
            None => {
                warn!("Cannot resolve the configuration directory");
                None
            }
        }
    }

    /// Checks the values the kernel and the serial driver will reject anyway,
    /// before any device is opened.
    pub fn validate(&self) -> Result<()> {
        // the driver rejects rates it cannot generate when the port is opened
        if self.baud_rate == 0 {
            return Err(anyhow!("Baud rate must be non-zero"));
        }

        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(anyhow!(
                "MTU {} out of range {}..={}",
                self.mtu,
                MIN_MTU,
                MAX_MTU
            ));
        }

        if self.response_timeout_ms == 0 {
            return Err(anyhow!("Response timeout must not be zero"));
        }

        // one byte of payload plus room for the terminator
        if self.response_buffer_size < 2 {
            return Err(anyhow!(
                "Response buffer of {} bytes is too small",
                self.response_buffer_size
            ));
        }

        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CmuxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mtu, 1428);
        assert_eq!(config.response_timeout(), Duration::from_millis(2000));
        assert_eq!(config.timers, MuxTimers { t1: 10, t2: 30, t3: 10, n2: 3 });
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        init_logger();
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "serial_port": "/dev/ttyUSB2", "timers": {{ "t1": 20 }} }}"#)
            .unwrap();

        let config = CmuxConfig::load(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.serial_port, PathBuf::from("/dev/ttyUSB2"));
        assert_eq!(config.timers.t1, 20);
        assert_eq!(config.timers.n2, 3);
        assert_eq!(config.mux_channel_port, PathBuf::from("/dev/gsmtty3"));
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        init_logger();
        let result = CmuxConfig::load(Some("/nonexistent/cmux.json".into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_file_fails() {
        init_logger();
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        assert!(CmuxConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = CmuxConfig { baud_rate: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = CmuxConfig { mtu: 4, ..Default::default() };
        assert!(config.validate().is_err());

        let config = CmuxConfig { mtu: 1501, ..Default::default() };
        assert!(config.validate().is_err());

        let config = CmuxConfig { response_timeout_ms: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = CmuxConfig { response_buffer_size: 1, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
