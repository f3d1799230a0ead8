use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::consts::*;
use crate::RcError;

/// Per-process connection settings.
///
/// Passed by reference into setup and negotiation; nothing here is global.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IB device name, `None` picks the first device found
    pub dev_name: Option<String>,
    /// Server host name; `None` makes this process the listener
    pub server_name: Option<String>,
    pub tcp_port: u16,
    pub ib_port: u8,
    /// GID index used in the GRH; `None` selects LID addressing
    pub gid_idx: Option<u8>,
    /// Pre-post a receive before moving to RTR
    pub receiving_side: bool,
    pub msg_size: usize,
    pub poll_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_name: None,
            server_name: None,
            tcp_port: DEFAULT_TCP_PORT,
            ib_port: DEFAULT_IB_PORT,
            gid_idx: None,
            receiving_side: false,
            msg_size: MSG_SIZE,
            poll_timeout_ms: MAX_POLL_CQ_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, RcError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            RcError::Config(format!("read {}: {}", path.as_ref().display(), err))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, RcError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|err| RcError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RcError> {
        if self.msg_size == 0 {
            return Err(RcError::Config("msg_size must be positive".into()));
        }
        if self.msg_size > u32::MAX as usize {
            return Err(RcError::Config("msg_size does not fit a work request".into()));
        }
        if self.ib_port == 0 {
            return Err(RcError::Config("ib_port starts at 1".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.server_name.is_none()
    }

    pub fn poll_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_timeout_ms)
    }

    /// Human-readable block describing this config.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(" ------------------------------------------------\n");
        out.push_str(&format!(
            " Device name : \"{}\"\n",
            self.dev_name.as_deref().unwrap_or("NULL")
        ));
        out.push_str(&format!(" IB port : {}\n", self.ib_port));
        if let Some(server) = &self.server_name {
            out.push_str(&format!(" IP : {}\n", server));
        }
        out.push_str(&format!(" TCP port : {}\n", self.tcp_port));
        if let Some(gid_idx) = self.gid_idx {
            out.push_str(&format!(" GID index : {}\n", gid_idx));
        }
        out.push_str(" ------------------------------------------------\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.tcp_port, 19875);
        assert_eq!(config.ib_port, 1);
        assert_eq!(config.gid_idx, None);
        assert_eq!(config.msg_size, 85);
        assert!(config.is_server());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"server_name": "10.0.0.2", "gid_idx": 3}"#).unwrap();
        assert_eq!(config.server_name.as_deref(), Some("10.0.0.2"));
        assert_eq!(config.gid_idx, Some(3));
        assert_eq!(config.tcp_port, 19875);
        assert!(!config.is_server());
    }

    #[test]
    fn zero_msg_size_is_rejected() {
        assert!(Config::from_json(r#"{"msg_size": 0}"#).is_err());
        assert!(Config::from_json("not json").is_err());
    }

    #[test]
    fn summary_lists_optional_fields() {
        let mut config = Config::default();
        assert!(!config.summary().contains("GID index"));
        assert!(config.summary().contains("Device name : \"NULL\""));
        config.gid_idx = Some(1);
        config.server_name = Some("peer".into());
        let summary = config.summary();
        assert!(summary.contains(" GID index : 1\n"));
        assert!(summary.contains(" IP : peer\n"));
    }
}
