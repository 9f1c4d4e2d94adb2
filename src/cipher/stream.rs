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

//! Concrete stream transforms backed by `openssl::symm`. Every
//! constructor here returns an already-keyed `(encryptor, decryptor)`
//! pair; callers never see the underlying `Crypter`.

use openssl::symm::{Cipher, Crypter, Mode};

use crate::error::CryptoError;

/// A position-stateful, single-direction stream transform. Implementors
/// must process `data` in place, consuming exactly as many keystream
/// bytes as `data.len()` — this is what lets a [`crate::pipe::StreamPipe`]
/// call `apply` on arbitrary-sized chunks without losing stream sync.
pub trait StreamTransform: Send {
    fn apply(&mut self, data: &mut [u8]) -> Result<(), CryptoError>;
}

struct OpenSslStream {
    crypter: Crypter,
}

impl OpenSslStream {
    fn new(cipher: Cipher, mode: Mode, key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let iv_opt = if iv.is_empty() { None } else { Some(iv) };
        let mut crypter = Crypter::new(cipher, mode, key, iv_opt)?;
        crypter.pad(false);
        Ok(OpenSslStream { crypter })
    }
}

impl StreamTransform for OpenSslStream {
    fn apply(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.is_empty() {
            return Ok(());
        }
        // openssl requires the output buffer to have room for one extra
        // block beyond the input; stream ciphers never actually use it,
        // but `Crypter::update` panics if the buffer is undersized.
        let mut out = vec![0u8; data.len() + 32];
        let n = self.crypter.update(data, &mut out)?;
        debug_assert_eq!(n, data.len(), "stream cipher must be 1:1 on bytes");
        data.copy_from_slice(&out[..data.len()]);
        Ok(())
    }
}

fn pair(
    cipher: Cipher,
    key: &[u8],
    iv: &[u8],
) -> Result<(Box<dyn StreamTransform>, Box<dyn StreamTransform>), CryptoError> {
    let enc = OpenSslStream::new(cipher, Mode::Encrypt, key, iv)?;
    let dec = OpenSslStream::new(cipher, Mode::Decrypt, key, iv)?;
    Ok((Box::new(enc), Box::new(dec)))
}

pub fn aes_128_cfb(
    key: &[u8],
    iv: &[u8],
) -> Result<(Box<dyn StreamTransform>, Box<dyn StreamTransform>), CryptoError> {
    pair(Cipher::aes_128_cfb128(), key, iv)
}

pub fn aes_192_cfb(
    key: &[u8],
    iv: &[u8],
) -> Result<(Box<dyn StreamTransform>, Box<dyn StreamTransform>), CryptoError> {
    pair(Cipher::aes_192_cfb128(), key, iv)
}

pub fn aes_256_cfb(
    key: &[u8],
    iv: &[u8],
) -> Result<(Box<dyn StreamTransform>, Box<dyn StreamTransform>), CryptoError> {
    pair(Cipher::aes_256_cfb128(), key, iv)
}

pub fn rc4(
    key: &[u8],
    iv: &[u8],
) -> Result<(Box<dyn StreamTransform>, Box<dyn StreamTransform>), CryptoError> {
    pair(Cipher::rc4(), key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_cfb_round_trips() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let (mut enc, _) = aes_128_cfb(&key, &iv).unwrap();
        let (_, mut dec) = aes_128_cfb(&key, &iv).unwrap();

        let mut data = b"hello, tunnel world!".to_vec();
        let plaintext = data.clone();
        enc.apply(&mut data).unwrap();
        assert_ne!(data, plaintext);
        dec.apply(&mut data).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn aes_cfb_is_a_stream_across_calls() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 16];
        let (mut enc_whole, _) = aes_256_cfb(&key, &iv).unwrap();
        let (mut enc_split, _) = aes_256_cfb(&key, &iv).unwrap();

        let mut whole = b"some longer message split across chunks".to_vec();
        enc_whole.apply(&mut whole).unwrap();

        let mut part1 = b"some longer mess".to_vec();
        let mut part2 = b"age split across chunks".to_vec();
        enc_split.apply(&mut part1).unwrap();
        enc_split.apply(&mut part2).unwrap();
        let mut split = part1;
        split.extend_from_slice(&part2);

        assert_eq!(whole, split);
    }

    #[test]
    fn rc4_round_trips() {
        let key = [0x77u8; 16];
        let (mut enc, _) = rc4(&key, &[]).unwrap();
        let (_, mut dec) = rc4(&key, &[]).unwrap();
        let mut data = b"rc4 stream data".to_vec();
        let plaintext = data.clone();
        enc.apply(&mut data).unwrap();
        dec.apply(&mut data).unwrap();
        assert_eq!(data, plaintext);
    }
}
