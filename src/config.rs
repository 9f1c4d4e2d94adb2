// Copyright 2026 Tunnel Server Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration loader (§3, §6, §7): an external collaborator that
//! supplies a `ServerConfig` record. Validated eagerly at load time so
//! every other module can treat a `ServerConfig` as already-correct.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cipher::{self, CipherMethod};
use crate::error::ConfigError;

fn default_session_idle_timeout() -> u64 {
    1800
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_dial_timeout() -> u64 {
    10
}

/// Read-only-after-init server configuration (§3). Deserialized
/// straight off a TOML file by `serde`; defaults match §9's guidance
/// for the ambient timeout fields the distilled spec's source lacks.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub key_path: PathBuf,
    pub user_db_path: PathBuf,
    pub link_encrypt_methods: Vec<String>,
    #[serde(default)]
    pub global_encrypt_method: Option<String>,
    #[serde(default)]
    pub global_encrypt_password: Option<String>,

    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl ServerConfig {
    /// Loads and validates a config from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        let config: ServerConfig = toml::from_str(&text)
            .map_err(|e| ConfigError::Parse(path.display().to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.link_encrypt_methods.is_empty() {
            return Err(ConfigError::NoEncryptMethods);
        }
        for name in &self.link_encrypt_methods {
            if cipher::lookup(name).is_none() {
                return Err(ConfigError::UnknownCipherMethod(name.clone()));
            }
        }
        if self.global_encrypt_method.is_some() && self.global_encrypt_password.is_none() {
            return Err(ConfigError::MissingGlobalPassword);
        }
        Ok(())
    }

    /// Resolves `link_encrypt_methods` against the cipher registry, in
    /// server-preference order, for use by the handshake engine.
    pub fn offered_methods(&self) -> Vec<&'static CipherMethod> {
        self.link_encrypt_methods
            .iter()
            .filter_map(|name| cipher::lookup(name))
            .collect()
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("tunnelsrv-test-config-{}.toml", uniq()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn uniq() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        std::process::id() as u64 * 1_000_000 + COUNTER.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn loads_minimal_valid_config() {
        let path = write_temp(
            r#"
            listen_addr = "0.0.0.0:9000"
            key_path = "/tmp/does-not-need-to-exist.pem"
            user_db_path = "/tmp/does-not-need-to-exist.db"
            link_encrypt_methods = ["aes-128-cfb", "aes-256-cfb"]
            "#,
        );
        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.offered_methods().len(), 2);
        assert_eq!(cfg.session_idle_timeout(), Duration::from_secs(1800));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_empty_methods() {
        let path = write_temp(
            r#"
            listen_addr = "0.0.0.0:9000"
            key_path = "/tmp/x.pem"
            user_db_path = "/tmp/x.db"
            link_encrypt_methods = []
            "#,
        );
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NoEncryptMethods));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_global_method_without_password() {
        let path = write_temp(
            r#"
            listen_addr = "0.0.0.0:9000"
            key_path = "/tmp/x.pem"
            user_db_path = "/tmp/x.db"
            link_encrypt_methods = ["aes-128-cfb"]
            global_encrypt_method = "aes-128-cfb"
            "#,
        );
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingGlobalPassword));
        let _ = std::fs::remove_file(&path);
    }
}
