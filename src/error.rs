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

//! The error taxonomy from the protocol design: transport, protocol,
//! crypto, auth and config errors, each scoped to how far it propagates.

use thiserror::Error;

/// Any I/O failure on a client or remote socket. Tears down the owning
/// session worker and all of its relay tasks; never escalated to the process.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("cipher failure on established pipe: {0}")]
    Cipher(CryptoError),
    #[error("handshake phase exceeded its time budget")]
    HandshakeTimeout,
}

impl From<CryptoError> for TransportError {
    fn from(e: CryptoError) -> Self {
        TransportError::Cipher(e)
    }
}

/// MAGIC mismatch, out-of-range length, unknown method, malformed handshake.
/// Terminates the offending connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic byte: {0:#x}")]
    BadMagic(u8),
    #[error("frame length {0} exceeds maximum of {1}")]
    FrameTooLarge(usize, usize),
    #[error("unknown cipher method {0:?}")]
    UnknownMethod(String),
    #[error("malformed handshake: {0}")]
    Malformed(&'static str),
    #[error("unexpected handshake state")]
    UnexpectedState,
}

/// Signing, KDF or cipher construction failure. Fatal at startup; a
/// post-handshake occurrence is downgraded to [`TransportError`] by callers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("openssl error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("key file i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dh public value out of range")]
    DhOutOfRange,
    #[error("key/iv size mismatch: wanted {wanted}, derived {derived}")]
    SizeMismatch { wanted: usize, derived: usize },
}

/// Bad credentials or HMAC mismatch.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username/password")]
    InvalidCredentials,
    #[error("user/passwd size invalid")]
    InvalidCredentialSize,
    #[error("hmac verification failed")]
    HmacMismatch,
    #[error("unknown session")]
    UnknownSession,
}

/// Empty `link_encrypt_methods`, missing global password with method set,
/// invalid key file. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("link_encrypt_methods must not be empty")]
    NoEncryptMethods,
    #[error("global_encrypt_password is required when global_encrypt_method is set")]
    MissingGlobalPassword,
    #[error("invalid key file at {0}: {1}")]
    InvalidKeyFile(String, String),
    #[error("{0:?} is not a registered cipher method")]
    UnknownCipherMethod(String),
    #[error("failed to read config file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(String, toml::de::Error),
}

/// Umbrella error for any per-client task. Each variant keeps its own
/// scope; this just lets callers use `?` across the handshake/mux split
/// without losing the distinction.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Transport(TransportError::Io(e))
    }
}
