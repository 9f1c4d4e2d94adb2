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

//! Cipher registry: maps a method name negotiated on the wire to
//! {key size, IV size, stream-cipher constructor}. Both sides of a
//! [`crate::pipe::StreamPipe`] must install matching encryptor/decryptor
//! pairs at the same byte offset — `CipherMethod::construct` always
//! returns a `(encryptor, decryptor)` pair built from the same key/iv so
//! that invariant holds by construction.

mod stream;
pub mod global;

use crate::error::CryptoError;
pub use stream::StreamTransform;

/// A symmetric stream cipher method offered to clients. `construct`
/// yields independent encrypt and decrypt transforms sharing one key/iv;
/// a pipe installs one as its write-side transform and the other
/// (constructed identically on the peer) as its read-side transform.
pub struct CipherMethod {
    pub name: &'static str,
    pub key_size: usize,
    pub iv_size: usize,
    constructor: fn(&[u8], &[u8]) -> Result<(Box<dyn StreamTransform>, Box<dyn StreamTransform>), CryptoError>,
}

impl CipherMethod {
    pub fn construct(
        &self,
        key: &[u8],
        iv: &[u8],
    ) -> Result<(Box<dyn StreamTransform>, Box<dyn StreamTransform>), CryptoError> {
        if key.len() != self.key_size {
            return Err(CryptoError::SizeMismatch {
                wanted: self.key_size,
                derived: key.len(),
            });
        }
        if iv.len() != self.iv_size {
            return Err(CryptoError::SizeMismatch {
                wanted: self.iv_size,
                derived: iv.len(),
            });
        }
        (self.constructor)(key, iv)
    }
}

static REGISTRY: &[CipherMethod] = &[
    CipherMethod {
        name: "aes-128-cfb",
        key_size: 16,
        iv_size: 16,
        constructor: stream::aes_128_cfb,
    },
    CipherMethod {
        name: "aes-192-cfb",
        key_size: 24,
        iv_size: 16,
        constructor: stream::aes_192_cfb,
    },
    CipherMethod {
        name: "aes-256-cfb",
        key_size: 32,
        iv_size: 16,
        constructor: stream::aes_256_cfb,
    },
    CipherMethod {
        name: "rc4",
        key_size: 16,
        iv_size: 0,
        constructor: stream::rc4,
    },
];

/// Looks up a cipher method by its wire name.
pub fn lookup(name: &str) -> Option<&'static CipherMethod> {
    REGISTRY.iter().find(|m| m.name == name)
}

/// All method names in server-preference order, for validating a
/// server's `link_encrypt_methods` config list against the registry.
pub fn all_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|m| m.name).collect()
}
