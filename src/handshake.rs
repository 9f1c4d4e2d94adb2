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

//! Handshake engine (§4.3): new-session key exchange, login, and
//! resume-session verification, run in that order on every accepted
//! connection until one path reaches an authenticated `Session`.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::bytes_ext::{push_u16, read_u16};
use crate::cipher::CipherMethod;
use crate::config::ServerConfig;
use crate::dh::CipherContext;
use crate::error::{AuthError, ProtocolError, SessionError};
use crate::kdf;
use crate::msg;
use crate::pipe::StreamPipe;
use crate::rsakeys::KeyStore;
use crate::session::{generate_session_id, Session, SessionCipher, SessionManager};
use crate::userdb::UserDb;

/// Upper bound on the client-finish message so a malicious `e_size`/
/// `md_size` pair can't make the server allocate an unbounded buffer
/// (§8 boundary behaviour: "frame exceeds the receive buffer").
const MAX_CLIENT_FINISH_LEN: usize = 8192;

/// Result of a successful handshake: an authenticated session, ready
/// to be handed to the mux loop.
pub struct Authenticated {
    pub session: Arc<Session>,
    /// True when this was a `RESUME_SUCCESS`, i.e. the mux loop doesn't
    /// need to do anything beyond what `run_handshake` already set up
    /// on the pipe.
    pub resumed: bool,
}

pub async fn run_handshake<S>(
    pipe: &mut StreamPipe<S>,
    config: &ServerConfig,
    keys: &KeyStore,
    user_db: &dyn UserDb,
    sessions: &SessionManager,
) -> Result<Authenticated, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered = config.offered_methods();
    let preamble = pipe.read_exact(4).await?;
    if preamble[0] != msg::PROTO_MAGIC {
        return Err(ProtocolError::BadMagic(preamble[0]).into());
    }

    let id_len = preamble[1];
    if id_len == 0 {
        let session = new_session(pipe, keys, &offered, user_db, sessions).await?;
        return Ok(Authenticated {
            session,
            resumed: false,
        });
    }

    match try_resume(pipe, preamble, sessions).await? {
        Some(session) => Ok(Authenticated {
            session,
            resumed: true,
        }),
        None => {
            let session = new_session(pipe, keys, &offered, user_db, sessions).await?;
            Ok(Authenticated {
                session,
                resumed: false,
            })
        }
    }
}

/// Attempts RESUME. Returns `Ok(Some(session))` on success (pipe cipher
/// already switched to the session's), `Ok(None)` when the HMAC didn't
/// match and the caller should fall through to NEW_SESSION on the same
/// connection, or `Err` when the preamble/session lookup itself is
/// invalid and the connection must be torn down.
async fn try_resume<S>(
    pipe: &mut StreamPipe<S>,
    preamble: Vec<u8>,
    sessions: &SessionManager,
) -> Result<Option<Arc<Session>>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id_len = preamble[1];
    let rand_len = preamble[2];
    let hmac_len = preamble[3];

    if id_len != msg::RESUME_ID_LEN
        || rand_len == 0
        || rand_len > msg::RESUME_MAX_RAND_LEN
        || hmac_len != msg::RESUME_HMAC_LEN
    {
        return Err(ProtocolError::Malformed("resume preamble field out of bounds").into());
    }

    let body_len = id_len as usize + rand_len as usize + hmac_len as usize;
    let body = pipe.read_exact(body_len).await?;

    let id_bytes = &body[0..id_len as usize];
    let rand = &body[id_len as usize..id_len as usize + rand_len as usize];
    let hmac = &body[id_len as usize + rand_len as usize..];

    let mut id = [0u8; 16];
    id.copy_from_slice(id_bytes);

    let session = sessions
        .get(&id)
        .await
        .ok_or(AuthError::UnknownSession)?;

    let expected = kdf::hmac_sha256(&session.cipher.crypto_key, rand)?;
    let matches = expected.len() == hmac.len() && openssl::memcmp::eq(&expected, hmac);

    if matches {
        pipe.write(&[msg::B_TRUE, msg::REUSE_SUCCESS]).await?;
        let (enc, dec) = session.cipher.rebuild_pair()?;
        pipe.switch_cipher(enc, dec);
        session.touch();
        Ok(Some(session))
    } else {
        let failure = (msg::ReuseFailure::HMAC_FAIL | msg::ReuseFailure::START_CIPHER_EXCHANGE).bits();
        pipe.write(&[msg::B_FALSE, failure]).await?;
        Ok(None)
    }
}

/// Runs the full NEW_SESSION key exchange followed by LOGIN.
async fn new_session<S>(
    pipe: &mut StreamPipe<S>,
    keys: &KeyStore,
    offered: &[&'static CipherMethod],
    user_db: &dyn UserDb,
    sessions: &SessionManager,
) -> Result<Arc<Session>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ctx = CipherContext::new(5)?;

    let pub_der = keys.public_der()?;
    let p_bytes = ctx.p_bytes();
    let g_byte = ctx.g_byte();
    let f_bytes = ctx.f_bytes();

    let mut signed_range = Vec::with_capacity(p_bytes.len() + 1 + f_bytes.len());
    signed_range.extend_from_slice(&p_bytes);
    signed_range.push(g_byte);
    signed_range.extend_from_slice(&f_bytes);
    let signature = keys.sign(&signed_range)?;

    let enc_methods = offered
        .iter()
        .map(|m| m.name)
        .collect::<Vec<_>>()
        .join(",");
    let enc_methods_bytes = enc_methods.as_bytes();

    let mut hello = Vec::new();
    push_u16(&mut hello, pub_der.len() as u16);
    push_u16(&mut hello, p_bytes.len() as u16);
    push_u16(&mut hello, f_bytes.len() as u16);
    push_u16(&mut hello, signature.len() as u16);
    push_u16(&mut hello, enc_methods_bytes.len() as u16);
    hello.extend_from_slice(&pub_der);
    hello.extend_from_slice(&p_bytes);
    hello.push(g_byte);
    hello.extend_from_slice(&f_bytes);
    hello.extend_from_slice(&signature);
    hello.extend_from_slice(enc_methods_bytes);
    pipe.write(&hello).await?;

    let finish_header = pipe.read_exact(4).await?;
    let e_size = read_u16(&finish_header[0..2]) as usize;
    let md_size = read_u16(&finish_header[2..4]) as usize;
    if e_size == 0 || e_size + md_size > MAX_CLIENT_FINISH_LEN {
        return Err(ProtocolError::FrameTooLarge(e_size + md_size, MAX_CLIENT_FINISH_LEN).into());
    }
    let finish_body = pipe.read_exact(e_size + md_size).await?;
    let e_bytes = &finish_body[0..e_size];
    let method_name_bytes = &finish_body[e_size..];
    let method_name = std::str::from_utf8(method_name_bytes)
        .map_err(|_| ProtocolError::Malformed("method name is not valid utf-8"))?;

    let method = offered
        .iter()
        .find(|m| m.name == method_name)
        .copied()
        .ok_or_else(|| ProtocolError::UnknownMethod(method_name.to_string()))?;

    let mut ctx = ctx;
    ctx.install_peer_public(e_bytes)?;
    let (crypto_key, crypto_iv) = ctx.derive(method.key_size, method.iv_size);
    let (enc, dec) = method.construct(&crypto_key, &crypto_iv)?;
    pipe.switch_cipher(enc, dec);

    login(pipe, method, crypto_key, crypto_iv, user_db, sessions).await
}

async fn login<S>(
    pipe: &mut StreamPipe<S>,
    method: &'static CipherMethod,
    crypto_key: Vec<u8>,
    crypto_iv: Vec<u8>,
    user_db: &dyn UserDb,
    sessions: &SessionManager,
) -> Result<Arc<Session>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header = pipe.read_exact(4).await?;
    let user_len = header[2] as usize;
    let passwd_len = header[3] as usize;

    if user_len == 0
        || user_len > msg::MAX_CREDENTIAL_LEN
        || passwd_len == 0
        || passwd_len > msg::MAX_CREDENTIAL_LEN
    {
        send_login_failure(pipe, "user/passwd size invalid").await?;
        return Err(AuthError::InvalidCredentialSize.into());
    }

    let creds = pipe.read_exact(user_len + passwd_len).await?;
    let username =
        std::str::from_utf8(&creds[..user_len]).map_err(|_| AuthError::InvalidCredentials)?;
    let password = &creds[user_len..];

    let expected = user_db.lookup(username);
    let ok = match &expected {
        Some(expected) => expected.len() == password.len() && openssl::memcmp::eq(expected, password),
        None => false,
    };

    if !ok {
        send_login_failure(pipe, "invalid username/password").await?;
        return Err(AuthError::InvalidCredentials.into());
    }

    let id = generate_session_id()?;
    let session = Session::new(
        id,
        username.to_string(),
        SessionCipher {
            method_name: method.name,
            crypto_key,
            crypto_iv,
        },
    );
    let session = sessions.insert(session).await;

    let mut response = Vec::with_capacity(4 + 16);
    push_u16(&mut response, msg::PROTO_VERSION);
    response.push(msg::B_TRUE);
    response.push(16);
    response.extend_from_slice(&session.id);
    pipe.write(&response).await?;

    Ok(session)
}

async fn send_login_failure<S>(
    pipe: &mut StreamPipe<S>,
    reason: &str,
) -> Result<(), crate::error::TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut response = Vec::new();
    push_u16(&mut response, msg::PROTO_VERSION);
    response.push(msg::B_FALSE);
    response.push(reason.len() as u8);
    response.extend_from_slice(reason.as_bytes());
    pipe.write(&response).await
}
