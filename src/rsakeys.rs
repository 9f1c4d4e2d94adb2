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

//! RSA key store (§3, §6): load-or-generate a 2048-bit key at a path,
//! export its SubjectPublicKeyInfo DER for the hello frame, and sign the
//! `P || G || f` range with SHA-256 + RSA PKCS#1 v1.5.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};

use crate::error::CryptoError;

const RSA_BITS: u32 = 2048;

/// Owns the server's long-lived RSA keypair.
pub struct KeyStore {
    pkey: PKey<Private>,
}

impl KeyStore {
    /// Loads a PEM-encoded PKCS#1 private key from `path`, generating and
    /// persisting a fresh 2048-bit key if the file doesn't exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let pem = fs::read(path)?;
            let rsa = Rsa::private_key_from_pem(&pem)?;
            let pkey = PKey::from_rsa(rsa)?;
            Ok(KeyStore { pkey })
        } else {
            let rsa = Rsa::generate(RSA_BITS)?;
            let pem = rsa.private_key_to_pem()?;
            fs::write(path, &pem)?;
            #[cfg(unix)]
            {
                if let Ok(meta) = fs::metadata(path) {
                    let mut perms = meta.permissions();
                    perms.set_mode(0o600);
                    let _ = fs::set_permissions(path, perms);
                }
            }
            let pkey = PKey::from_rsa(rsa)?;
            Ok(KeyStore { pkey })
        }
    }

    /// SubjectPublicKeyInfo DER encoding of the public half, sent to the
    /// client as `pub_der` in the hello frame.
    pub fn public_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self.pkey.public_key_to_der()?)
    }

    /// Signs `message` (the `P || G || f` range) with SHA-256 + RSA
    /// PKCS#1 v1.5.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        signer.update(message)?;
        Ok(signer.sign_to_vec()?)
    }
}

/// Verifies a signature against a SubjectPublicKeyInfo DER public key.
/// Used by tests standing in for the (out-of-scope) client.
pub fn verify(public_der: &[u8], message: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    let pkey = PKey::public_key_from_der(public_der)?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey)?;
    verifier.update(message)?;
    Ok(verifier.verify(signature)?)
}
