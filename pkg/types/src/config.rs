use serde::{Deserialize, Serialize};

use crate::node::RuntimeKind;

/// Server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 7100
/// data-dir: /var/lib/packd/data
/// token: my-secret-token
/// placement: spread
/// preemption: true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// `spread` or `binpack`.
    #[serde(default)]
    pub placement: Option<String>,
    #[serde(default)]
    pub preemption: Option<bool>,
    #[serde(default, alias = "reconcile-interval-secs")]
    pub reconcile_interval_secs: Option<u64>,
}

/// Node agent configuration file (YAML).
///
/// Example `node-config.yaml`:
/// ```yaml
/// server: ws://10.0.0.1:7100/channel
/// token: my-secret-token
/// node-name: worker-1
/// runtime: node
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigFile {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "node-name")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub runtime: Option<RuntimeKind>,
    #[serde(default)]
    pub labels: Option<std::collections::HashMap<String, String>>,
    #[serde(default, alias = "capability-tags")]
    pub capability_tags: Option<Vec<String>>,
    /// Reconnect attempts before giving up; -1 retries forever.
    #[serde(default, alias = "max-reconnect-attempts")]
    pub max_reconnect_attempts: Option<i32>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
