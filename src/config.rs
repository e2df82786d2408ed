use crate::error::{Error, Result};
use bson::Document;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Handshake autoresponse behavior for `ismaster`/`isMaster`/`hello`.
#[derive(Debug, Clone, Default)]
pub enum AutoIsMaster {
    /// The test drives handshakes itself.
    #[default]
    Off,
    /// Autorespond `{ok: 1, ismaster: true, minWireVersion, maxWireVersion}`.
    Enabled,
    /// Autorespond with the given document instead.
    Reply(Document),
}

/// Options recognized at server construction.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Listening host for TCP. Ignored when `uds_path` is set.
    pub bind_addr: String,
    /// Listening port; `None` picks an unused one.
    pub port: Option<u16>,
    /// Listen on a Unix-domain socket at this path instead of TCP.
    pub uds_path: Option<PathBuf>,
    /// Prepared server-side TLS configuration; accepted sockets are wrapped
    /// and the codec sees plaintext.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Replica set name; only affects `uri()`.
    pub replica_set: Option<String>,
    /// Default timeout for `receives`.
    pub request_timeout: Duration,
    /// Log every decoded request and reply at info level.
    pub verbose: bool,
    pub auto_ismaster: AutoIsMaster,
    /// Advertised in the default `ismaster` autoresponse; the knob that
    /// makes real drivers choose legacy opcodes or OP_MSG.
    pub min_wire_version: i32,
    pub max_wire_version: i32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: None,
            uds_path: None,
            tls: None,
            replica_set: None,
            request_timeout: Duration::from_secs(10),
            verbose: false,
            auto_ismaster: AutoIsMaster::Off,
            min_wire_version: 0,
            max_wire_version: 6,
        }
    }
}

/// TOML file configuration for the `mockmongo` binary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub bind_addr: Option<String>,
    pub verbose: Option<bool>,
    pub log_level: Option<String>,
    pub replica_set: Option<String>,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
}

impl FileConfig {
    /// Priority: explicit path → `MOCKMONGO_CONFIG` → `./mockmongo.toml` →
    /// defaults. Env vars override file values.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("MOCKMONGO_CONFIG").ok())
            .unwrap_or_else(|| "mockmongo.toml".to_string());
        let mut cfg = if let Ok(contents) = fs::read_to_string(&path) {
            toml::from_str::<FileConfig>(&contents)
                .map_err(|e| Error::Msg(format!("failed to parse {}: {}", path, e)))?
        } else {
            FileConfig::default()
        };
        if let Ok(port) = std::env::var("MOCKMONGO_PORT") {
            cfg.port = Some(
                port.parse()
                    .map_err(|_| Error::Msg(format!("invalid MOCKMONGO_PORT: {port}")))?,
            );
        }
        if let Ok(addr) = std::env::var("MOCKMONGO_BIND_ADDR") {
            cfg.bind_addr = Some(addr);
        }
        if let Ok(verbose) = std::env::var("MOCKMONGO_VERBOSE") {
            cfg.verbose = Some(
                verbose
                    .parse()
                    .map_err(|_| Error::Msg(format!("invalid MOCKMONGO_VERBOSE: {verbose}")))?,
            );
        }
        if let Ok(level) = std::env::var("MOCKMONGO_LOG_LEVEL") {
            cfg.log_level = Some(level);
        }
        if let Ok(name) = std::env::var("MOCKMONGO_REPLICA_SET") {
            cfg.replica_set = Some(name);
        }
        if let Ok(cert) = std::env::var("MOCKMONGO_TLS_CERT_FILE") {
            cfg.tls_cert_file = Some(cert);
        }
        if let Ok(key) = std::env::var("MOCKMONGO_TLS_KEY_FILE") {
            cfg.tls_key_file = Some(key);
        }
        Ok(cfg)
    }

    pub fn into_options(self) -> Result<ServerOptions> {
        let mut options = ServerOptions {
            port: self.port,
            replica_set: self.replica_set,
            verbose: self.verbose.unwrap_or(false),
            ..ServerOptions::default()
        };
        if let Some(addr) = self.bind_addr {
            options.bind_addr = addr;
        }
        match (self.tls_cert_file, self.tls_key_file) {
            (Some(cert), Some(key)) => {
                options.tls = Some(crate::tls::build_server_config(cert.as_ref(), key.as_ref())?);
            }
            (None, None) => {}
            _ => {
                return Err(Error::Msg(
                    "tls_cert_file and tls_key_file must be set together".into(),
                ));
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.bind_addr, "127.0.0.1");
        assert_eq!(options.port, None);
        assert_eq!(options.request_timeout, Duration::from_secs(10));
        assert_eq!(options.min_wire_version, 0);
        assert_eq!(options.max_wire_version, 6);
        assert!(matches!(options.auto_ismaster, AutoIsMaster::Off));
    }

    #[test]
    fn file_config_parses_toml() {
        let cfg: FileConfig = toml::from_str(
            r#"
            port = 27017
            verbose = true
            replica_set = "rs0"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, Some(27017));
        assert_eq!(cfg.verbose, Some(true));
        let options = cfg.into_options().unwrap();
        assert_eq!(options.port, Some(27017));
        assert_eq!(options.replica_set.as_deref(), Some("rs0"));
        assert!(options.verbose);
    }

    #[test]
    fn tls_paths_must_come_in_pairs() {
        let cfg = FileConfig {
            tls_cert_file: Some("cert.pem".into()),
            ..FileConfig::default()
        };
        assert!(cfg.into_options().is_err());
    }
}
