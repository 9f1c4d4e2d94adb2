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

//! The deterministic key/IV derivation shared by the DH cipher context
//! (§3) and the global outer cipher (§4.2): SHA-256 over the secret's
//! big-endian bytes, repeating `SHA256(prev_digest || secret)` for as
//! many digests as needed, then slicing the concatenation for key || iv.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sha::Sha256;
use openssl::sign::Signer;

use crate::error::CryptoError;

/// HMAC-SHA256(key, data), used to verify a resume attempt's challenge
/// response (§4.3).
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
}

/// Derives `key_size + iv_size` bytes from `secret`, returning
/// `(key, iv)`. Deterministic: the same `secret` and sizes always
/// produce the same output, which is what makes KEX reproducible
/// between client and server without exchanging the derived bytes.
pub fn derive_key_iv(secret: &[u8], key_size: usize, iv_size: usize) -> (Vec<u8>, Vec<u8>) {
    let total = key_size + iv_size;
    let mut out = Vec::with_capacity(total + 32);
    let mut prev: Vec<u8> = Vec::new();
    while out.len() < total {
        let mut hasher = Sha256::new();
        hasher.update(&prev);
        hasher.update(secret);
        let digest = hasher.finish();
        out.extend_from_slice(&digest);
        prev = digest.to_vec();
    }
    out.truncate(total);
    let iv = out.split_off(key_size);
    (out, iv)
}
