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

//! Global outer cipher (§4.2): if configured, wraps every connection's
//! raw byte stream immediately after accept, before any protocol magic
//! is read. Not a substitute for the inner KEX — it only hides
//! handshake metadata from an on-path observer.

use crate::cipher::{self, StreamTransform};
use crate::error::{ConfigError, CryptoError};
use crate::kdf;

/// A password-derived (encrypt, decrypt) pair for the outer wrap, or
/// `None` when the server config doesn't enable one.
pub struct GlobalCipher {
    method_name: &'static str,
}

impl GlobalCipher {
    pub fn from_config(
        method: &Option<String>,
        password: &Option<String>,
    ) -> Result<Option<GlobalCipher>, ConfigError> {
        match (method, password) {
            (None, _) => Ok(None),
            (Some(_), None) => Err(ConfigError::MissingGlobalPassword),
            (Some(name), Some(_)) => {
                let method = cipher::lookup(name)
                    .ok_or_else(|| ConfigError::UnknownCipherMethod(name.clone()))?;
                Ok(Some(GlobalCipher {
                    method_name: method.name,
                }))
            }
        }
    }

    /// Builds the (encryptor, decryptor) transforms for this connection.
    /// Called once per accepted socket so every client gets independent
    /// `Crypter` state even though they all share one derived key/iv.
    pub fn build(
        &self,
        password: &str,
    ) -> Result<(Box<dyn StreamTransform>, Box<dyn StreamTransform>), CryptoError> {
        let method = cipher::lookup(self.method_name).expect("validated at construction");
        let (key, iv) = kdf::derive_key_iv(password.as_bytes(), method.key_size, method.iv_size);
        method.construct(&key, &iv)
    }
}
