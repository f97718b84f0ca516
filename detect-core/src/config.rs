//! Server configuration, loaded from a JSON file at startup.
//!
//! The schema mirrors the deployment files this gateway is driven by:
//!
//! ```json
//! {
//!   "protocol": "http",
//!   "ip": "0.0.0.0",
//!   "port": "8080",
//!   "inference engines": [
//!     {
//!       "device": "intel cpu",
//!       "replicas": 4,
//!       "model": { "name": "ssd", "graph": "models/ssd.xml", "label": "models/voc.txt" }
//!     }
//!   ]
//! }
//! ```

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Wire protocol served by the front end.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
}

/// Root configuration object.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    pub protocol: Protocol,
    pub ip: String,
    pub port: String,
    #[serde(rename = "inference engines", default)]
    pub engines: Vec<EngineSpec>,
}

/// One engine entry: a device, a replica count, and the model to load.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineSpec {
    pub device: String,
    pub replicas: u32,
    /// Accelerator bitstream, required for the FPGA device class.
    #[serde(default)]
    pub bitstream: Option<String>,
    #[serde(default)]
    pub model: ModelSpec,
}

/// Model description. An empty object means the entry is ignored.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub graph: String,
    #[serde(default)]
    pub label: String,
}

impl ModelSpec {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl EngineSpec {
    /// Whether this entry names an FPGA-class device. The FPGA SDK rejects
    /// more than one host-side context per process, so these entries are
    /// validated to a single replica.
    pub fn is_fpga(&self) -> bool {
        self.device.to_lowercase().contains("fpga")
    }

    /// Entries without a model are skipped by the server.
    pub fn is_configured(&self) -> bool {
        !self.model.is_empty()
    }
}

impl ServerConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read configuration file {}: {e}", path.display()))
        })?;
        let config: ServerConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Schema-level invariants that must hold before any engine is built.
    pub fn validate(&self) -> Result<()> {
        let configured: Vec<&EngineSpec> =
            self.engines.iter().filter(|s| s.is_configured()).collect();
        if configured.is_empty() {
            return Err(Error::Config("no inference engines configured".into()));
        }

        for spec in &configured {
            if spec.replicas == 0 {
                return Err(Error::Config(format!(
                    "device \"{}\": replicas must be at least 1",
                    spec.device
                )));
            }
            if spec.model.graph.is_empty() || spec.model.label.is_empty() {
                return Err(Error::Config(format!(
                    "device \"{}\": model requires both graph and label paths",
                    spec.device
                )));
            }
        }

        // The FPGA worker must be unique process-wide and runs on the main
        // thread, so the whole device class is capped at one instance.
        let fpga_instances: u32 = configured
            .iter()
            .filter(|s| s.is_fpga())
            .map(|s| s.replicas)
            .sum();
        if fpga_instances > 1 {
            return Err(Error::Config(format!(
                "FPGA inference engine: expected 1, got {fpga_instances}"
            )));
        }
        if let Some(fpga) = configured.iter().find(|s| s.is_fpga()) {
            if fpga.bitstream.as_deref().unwrap_or("").is_empty() {
                return Err(Error::Config(format!(
                    "device \"{}\": FPGA inference engine requires a bitstream path",
                    fpga.device
                )));
            }
        }
        Ok(())
    }

    /// Bind address of the front end.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ServerConfig {
        serde_json::from_str(json).expect("valid json")
    }

    const BASE: &str = r#"{
        "protocol": "http",
        "ip": "0.0.0.0",
        "port": "8080",
        "inference engines": [
            {
                "device": "intel cpu",
                "replicas": 4,
                "model": { "name": "ssd", "graph": "m.xml", "label": "l.txt" }
            }
        ]
    }"#;

    #[test]
    fn parses_the_engines_key_with_a_space() {
        let config = parse(BASE);
        assert_eq!(config.protocol, Protocol::Http);
        assert_eq!(config.engines.len(), 1);
        assert_eq!(config.engines[0].replicas, 4);
        config.validate().unwrap();
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn empty_model_entries_are_ignored() {
        let config = parse(
            r#"{
                "protocol": "grpc", "ip": "127.0.0.1", "port": "9000",
                "inference engines": [
                    { "device": "nvidia gpu", "replicas": 2, "model": {} },
                    { "device": "intel cpu", "replicas": 1,
                      "model": { "name": "yolov3", "graph": "m.xml", "label": "l.txt" } }
                ]
            }"#,
        );
        config.validate().unwrap();
        let configured: Vec<_> = config.engines.iter().filter(|s| s.is_configured()).collect();
        assert_eq!(configured.len(), 1);
        assert_eq!(configured[0].device, "intel cpu");
    }

    #[test]
    fn fpga_replicas_are_capped_at_one() {
        let config = parse(
            r#"{
                "protocol": "http", "ip": "0.0.0.0", "port": "8080",
                "inference engines": [
                    { "device": "intel fpga", "replicas": 2, "bitstream": "a.aocx",
                      "model": { "name": "ssd", "graph": "m.xml", "label": "l.txt" } }
                ]
            }"#,
        );
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "FPGA inference engine: expected 1, got 2");
    }

    #[test]
    fn fpga_requires_a_bitstream() {
        let config = parse(
            r#"{
                "protocol": "http", "ip": "0.0.0.0", "port": "8080",
                "inference engines": [
                    { "device": "intel fpga", "replicas": 1,
                      "model": { "name": "ssd", "graph": "m.xml", "label": "l.txt" } }
                ]
            }"#,
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bitstream"), "{err}");
    }

    #[test]
    fn zero_replicas_are_rejected() {
        let config = parse(
            r#"{
                "protocol": "http", "ip": "0.0.0.0", "port": "8080",
                "inference engines": [
                    { "device": "intel cpu", "replicas": 0,
                      "model": { "name": "ssd", "graph": "m.xml", "label": "l.txt" } }
                ]
            }"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn no_engines_is_a_config_error() {
        let config = parse(
            r#"{ "protocol": "http", "ip": "0.0.0.0", "port": "8080",
                 "inference engines": [ { "device": "intel cpu", "replicas": 1, "model": {} } ] }"#,
        );
        assert!(config.validate().is_err());
    }
}
