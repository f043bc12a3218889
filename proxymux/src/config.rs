//! Mux configuration.
//!
//! Loaded from a JSON file; every field has a default so an empty object is
//! a valid configuration.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dev::parse_mac;
use crate::error::ConfigError;
use crate::lower::MAX_LOWERS;
use crate::proxy::MAX_ETHTOOL_STATS;
use crate::xid::XidRange;

pub const MAX_ETHTOOL_FLAGS: usize = 32;

/// A port provisioned at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    pub name: String,
    /// Fixed xid; allocated from `port_xids` when absent.
    #[serde(default)]
    pub xid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Abstract socket name the daemon connects to.
    pub name: String,
    /// First port MAC; port N gets `base_mac + N`.
    pub base_mac: String,
    /// PCP value that marks exception frames.
    pub exception_priority: u8,
    /// Consecutive EAGAIN sends tolerated before the connection is dropped.
    pub sbtx_retry_limit: u32,
    pub dump_on_connect: bool,
    pub port_xids: XidRange,
    pub upper_xids: XidRange,
    /// Uplink interface names.
    pub lowers: Vec<String>,
    pub ports: Vec<PortEntry>,
    pub ethtool_flag_names: Vec<String>,
    pub ethtool_stat_names: Vec<String>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            name: "proxymux".to_string(),
            base_mac: "02:00:00:00:00:00".to_string(),
            exception_priority: 7,
            sbtx_retry_limit: 16,
            dump_on_connect: true,
            port_xids: XidRange::new(3000, 3999),
            upper_xids: XidRange::new(3000, 4094),
            lowers: Vec::new(),
            ports: Vec::new(),
            ethtool_flag_names: ["copper", "fec75", "fec91"]
                .into_iter()
                .map(String::from)
                .collect(),
            ethtool_stat_names: Vec::new(),
        }
    }
}

impl MuxConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: MuxConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.exception_priority > 7 {
            return Err(invalid(format!(
                "exception_priority {} is not a 3-bit PCP",
                self.exception_priority
            )));
        }
        for (label, range) in [("port_xids", self.port_xids), ("upper_xids", self.upper_xids)] {
            if !range.is_valid() {
                return Err(invalid(format!(
                    "{label} {}..={} is not a usable xid range",
                    range.first, range.last
                )));
            }
        }
        if self.lowers.len() > MAX_LOWERS {
            return Err(invalid(format!("more than {MAX_LOWERS} lowers")));
        }
        if self.ethtool_flag_names.len() > MAX_ETHTOOL_FLAGS {
            return Err(invalid(format!(
                "more than {MAX_ETHTOOL_FLAGS} ethtool flag names"
            )));
        }
        if self.ethtool_stat_names.len() > MAX_ETHTOOL_STATS {
            return Err(invalid(format!(
                "more than {MAX_ETHTOOL_STATS} ethtool stat names"
            )));
        }
        if self.base_mac().is_none() {
            return Err(invalid(format!("bad base_mac {:?}", self.base_mac)));
        }

        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.name.as_str()) {
                return Err(invalid(format!("duplicate port {}", port.name)));
            }
        }
        Ok(())
    }

    pub fn base_mac(&self) -> Option<[u8; 6]> {
        parse_mac(&self.base_mac)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_exception_priority(mut self, pcp: u8) -> Self {
        self.exception_priority = pcp;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.sbtx_retry_limit = limit;
        self
    }

    pub fn with_dump_on_connect(mut self, on: bool) -> Self {
        self.dump_on_connect = on;
        self
    }

    pub fn with_port_xids(mut self, range: XidRange) -> Self {
        self.port_xids = range;
        self
    }

    pub fn with_upper_xids(mut self, range: XidRange) -> Self {
        self.upper_xids = range;
        self
    }

    pub fn with_lower(mut self, name: impl Into<String>) -> Self {
        self.lowers.push(name.into());
        self
    }

    pub fn with_port(mut self, name: impl Into<String>, xid: Option<u32>) -> Self {
        self.ports.push(PortEntry {
            name: name.into(),
            xid,
        });
        self
    }

    pub fn with_stat_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ethtool_stat_names = names.into_iter().map(Into::into).collect();
        self
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = MuxConfig::default();
        config.validate().unwrap();
        assert_eq!(config.exception_priority, 7);
        assert_eq!(config.port_xids, XidRange::new(3000, 3999));
        assert_eq!(config.ethtool_flag_names, vec!["copper", "fec75", "fec91"]);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "mux-a",
                "lowers": ["eth1", "eth2"],
                "ports": [{{"name": "xe1"}}, {{"name": "xe2", "xid": 3990}}],
                "upper_xids": {{"first": 3100, "last": 3200}}
            }}"#
        )
        .unwrap();

        let config = MuxConfig::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.name, "mux-a");
        assert_eq!(config.lowers, vec!["eth1", "eth2"]);
        assert_eq!(config.ports[0].xid, None);
        assert_eq!(config.ports[1].xid, Some(3990));
        assert_eq!(config.upper_xids, XidRange::new(3100, 3200));
        assert!(config.dump_on_connect);
    }

    #[test]
    fn test_load_errors() {
        let err = MuxConfig::load("/nonexistent/proxymux.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = MuxConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects() {
        let bad = [
            MuxConfig::default().with_exception_priority(8),
            MuxConfig::default().with_port_xids(XidRange::new(10, 5)),
            MuxConfig::default().with_upper_xids(XidRange::new(0, 5)),
            MuxConfig::default()
                .with_port("xe1", None)
                .with_port("xe1", None),
            MuxConfig::default().with_stat_names((0..513).map(|i| format!("s{i}"))),
            MuxConfig {
                base_mac: "zz".to_string(),
                ..Default::default()
            },
            (0..17).fold(MuxConfig::default(), |c, i| c.with_lower(format!("eth{i}"))),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "accepted {config:?}"
            );
        }

        // Port and upper ranges may overlap.
        MuxConfig::default()
            .with_port_xids(XidRange::new(3000, 3999))
            .with_upper_xids(XidRange::new(3000, 4094))
            .validate()
            .unwrap();
    }
}
