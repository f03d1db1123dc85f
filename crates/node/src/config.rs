//! YAML description of a node: where it listens, which hubs it takes part in and the protocol
//! parameters.
use std::fs;
use std::io;
use std::net::SocketAddr;

use mercury_core::bootstrap::HubInitInfo;
use mercury_core::Parameters;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::util::ensure_parent_dir;
use crate::util::expand_home;

pub const DEFAULT_CONFIG_PATH: &str = "~/.mercury/config.yaml";
pub const DEFAULT_PORT: u16 = 40000;
pub const DEFAULT_HUB_NAME: &str = "x";
pub const DEFAULT_HUB_ABSMAX: u64 = 1 << 32;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Local socket address.
    pub bind: SocketAddr,
    /// Address other nodes reach this one at. Defaults to `bind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise: Option<SocketAddr>,
    /// Bootstrap server handing out hub descriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<SocketAddr>,
    /// When there is no configuration in the YAML file,
    /// its deserialization is equivalent to `vec![]` in Rust.
    #[serde(default)]
    pub hubs: Vec<HubInitInfo>,
    /// Missing fields take their defaults.
    #[serde(default)]
    pub parameters: Parameters,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], DEFAULT_PORT).into(),
            advertise: Some(([127, 0, 0, 1], DEFAULT_PORT).into()),
            bootstrap: None,
            hubs: vec![HubInitInfo::new(0, DEFAULT_HUB_NAME, 0, DEFAULT_HUB_ABSMAX)],
            parameters: Parameters::default(),
        }
    }
}

impl Config {
    /// The address this node puts in its messages.
    pub fn address(&self) -> SocketAddr {
        self.advertise.unwrap_or(self.bind)
    }

    /// Reject configurations the core would refuse later.
    pub fn validate(&self) -> Result<()> {
        self.parameters.validate()?;
        for hub in &self.hubs {
            hub.validate()?;
        }
        if self.address().ip().is_unspecified() {
            return Err(Error::InvalidAddress(format!(
                "{} cannot be reached by peers, set `advertise`",
                self.address()
            )));
        }
        Ok(())
    }

    pub fn write_fs<P>(&self, path: P) -> Result<String>
    where P: AsRef<std::path::Path> {
        let path = expand_home(path)?;
        ensure_parent_dir(&path)?;
        let f =
            fs::File::create(path.as_path()).map_err(|e| Error::CreateFileError(e.to_string()))?;
        let f_writer = io::BufWriter::new(f);
        serde_yaml::to_writer(f_writer, self)?;
        Ok(path.to_string_lossy().into_owned())
    }

    pub fn read_fs<P>(path: P) -> Result<Config>
    where P: AsRef<std::path::Path> {
        let path = expand_home(path)?;
        tracing::debug!("Read config from: {:?}", path);
        let f = fs::File::open(path).map_err(|e| Error::OpenFileError(e.to_string()))?;
        let f_rdr = io::BufReader::new(f);
        Ok(serde_yaml::from_reader(f_rdr)?)
    }
}

#[cfg(test)]
mod tests {
    use mercury_core::Value;

    use super::*;

    #[test]
    fn test_deserialization_with_missed_field() {
        let yaml = r#"
bind: 127.0.0.1:40001
bootstrap: 127.0.0.1:39000
parameters:
  fanout: false
  max_join_attempts: 5
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.hubs, vec![]);
        assert_eq!(cfg.advertise, None);
        assert_eq!(cfg.address(), "127.0.0.1:40001".parse().unwrap());
        assert!(!cfg.parameters.fanout);
        assert_eq!(cfg.parameters.max_join_attempts, 5);
        assert_eq!(
            cfg.parameters.peer_pong_timeout,
            Parameters::default().peer_pong_timeout
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn test_hub_list() {
        let yaml = r#"
bind: 0.0.0.0:40002
advertise: 10.0.0.2:40002
hubs:
  - id: 0
    name: x
    absmin: 0
    absmax: 1000
    representative: 10.0.0.1:40000
  - id: 1
    name: y
    absmin: 0
    absmax: 360
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.hubs.len(), 2);
        assert_eq!(cfg.hubs[0].absmax, Value(1000));
        assert_eq!(
            cfg.hubs[0].representative,
            Some("10.0.0.1:40000".parse().unwrap())
        );
        assert_eq!(cfg.hubs[1].representative, None);
        assert_eq!(cfg.hubs[1].static_topology, None);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_unreachable_address_is_rejected() {
        let cfg = Config {
            advertise: None,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_write_then_read() {
        let path = std::env::temp_dir()
            .join(format!("mercury-config-{}", std::process::id()))
            .join("config.yaml");
        let cfg = Config {
            bootstrap: Some("127.0.0.1:39000".parse().unwrap()),
            ..Default::default()
        };
        let written = cfg.write_fs(&path).unwrap();
        let read = Config::read_fs(&written).unwrap();
        assert_eq!(read, cfg);
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
