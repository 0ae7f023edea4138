// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! YAML-loaded broker configuration, mirroring the fields the
//! reference bootstrap (`pypsmb/entry.py`, `main.py`) reads from
//! `config.yaml`: listen address/port, worker pool size, keepalive
//! interval, and an optional TLS cert/key pair.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_address() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    3880
}

fn default_max_threads() -> usize {
    32
}

fn default_keep_alive() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub connection: Connection,
    pub ssl: Option<Ssl>,
}

#[derive(Debug, Deserialize)]
pub struct Listen {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Listen {
    fn default() -> Listen {
        Listen {
            address: default_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Connection {
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: i64,
}

impl Default for Connection {
    fn default() -> Connection {
        Connection {
            max_threads: default_max_threads(),
            keep_alive: default_keep_alive(),
        }
    }
}

/// TLS termination itself is out of scope (spec.md §1); these fields
/// are parsed and validated so the rest of the config surface is
/// complete, but `psmbd` does not currently wrap the listener with them.
#[derive(Debug, Deserialize)]
pub struct Ssl {
    pub certchain: String,
    pub privatekey: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(Error::Io)?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|e| Error::InternalFault(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects `0 < keep_alive <= 3`, the pathological range spec §5
    /// calls out (too short to ever be enforced usefully against the
    /// 3-probe insensible-client threshold).
    pub fn validate(&self) -> Result<()> {
        let k = self.connection.keep_alive;
        if k > 0 && k <= 3 {
            return Err(Error::InternalFault(format!(
                "connection.keep_alive must be <= 0 (disabled) or > 3, got {}",
                k
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.listen.address, "0.0.0.0");
        assert_eq!(config.listen.port, 3880);
        assert_eq!(config.connection.max_threads, 32);
        assert_eq!(config.connection.keep_alive, -1);
        assert!(config.ssl.is_none());
    }

    #[test]
    fn pathological_keep_alive_is_rejected() {
        let config: Config = serde_yaml::from_str("connection:\n  keep_alive: 2\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_and_long_keep_alive_are_accepted() {
        let disabled: Config = serde_yaml::from_str("connection:\n  keep_alive: -1\n").unwrap();
        assert!(disabled.validate().is_ok());
        let long: Config = serde_yaml::from_str("connection:\n  keep_alive: 30\n").unwrap();
        assert!(long.validate().is_ok());
    }

    #[test]
    fn full_config_parses() {
        let yaml = "\
listen:\n  address: 127.0.0.1\n  port: 4000\n\
connection:\n  max_threads: 8\n  keep_alive: 10\n\
ssl:\n  certchain: /etc/psmb/chain.pem\n  privatekey: /etc/psmb/key.pem\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen.address, "127.0.0.1");
        assert_eq!(config.listen.port, 4000);
        assert_eq!(config.connection.max_threads, 8);
        assert!(config.ssl.is_some());
    }
}
