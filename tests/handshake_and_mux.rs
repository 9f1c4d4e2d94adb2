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

//! End-to-end coverage of the handshake engine and the mux/relay loop
//! (§8): a hand-rolled client plays the paired-client role described by
//! §6's wire constants and drives a real server task over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use tunnelsrv::bytes_ext::{push_u16, push_u32, read_u16, read_u32};
use tunnelsrv::cipher;
use tunnelsrv::config::ServerConfig;
use tunnelsrv::dh::CipherContext;
use tunnelsrv::handshake;
use tunnelsrv::kdf;
use tunnelsrv::msg;
use tunnelsrv::mux;
use tunnelsrv::pipe::StreamPipe;
use tunnelsrv::rsakeys::{self, KeyStore};
use tunnelsrv::session::SessionManager;
use tunnelsrv::userdb::{MemoryUserDb, UserDb};

fn temp_key_path(tag: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "tunnelsrv-it-{}-{}-{}.pem",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    path
}

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".into(),
        key_path: temp_key_path("key"),
        user_db_path: "unused".into(),
        link_encrypt_methods: vec!["aes-128-cfb".into(), "aes-256-cfb".into()],
        global_encrypt_method: None,
        global_encrypt_password: None,
        session_idle_timeout_secs: 1800,
        handshake_timeout_secs: 5,
        dial_timeout_secs: 2,
    }
}

/// Spawns a server accept loop (mirroring `main.rs`'s `handle_connection`,
/// minus the global cipher wrap this suite doesn't exercise) bound to an
/// ephemeral loopback port, and returns its address plus the shared
/// session registry so a test can reconnect and attempt a resume.
async fn spawn_server(
    config: ServerConfig,
    user_db: Arc<dyn UserDb>,
) -> (SocketAddr, Arc<SessionManager>) {
    let keys = Arc::new(KeyStore::load_or_generate(&config.key_path).unwrap());
    let config = Arc::new(config);
    let sessions = Arc::new(SessionManager::new());

    let listener = TcpListener::bind(&config.listen_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_config = config.clone();
    let accept_sessions = sessions.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            socket.set_nodelay(true).ok();

            let config = accept_config.clone();
            let keys = keys.clone();
            let user_db = user_db.clone();
            let sessions = accept_sessions.clone();

            tokio::spawn(async move {
                let mut pipe = StreamPipe::new(socket);
                let outcome = tokio::time::timeout(
                    config.handshake_timeout(),
                    handshake::run_handshake(&mut pipe, &config, &keys, user_db.as_ref(), &sessions),
                )
                .await;

                if let Ok(Ok(_authenticated)) = outcome {
                    let _ = mux::run_mux(pipe, config.dial_timeout()).await;
                }
            });
        }
    });

    (addr, sessions)
}

/// Runs the client side of NEW_SESSION + LOGIN over an un-split
/// `StreamPipe`, leaving the pipe's cipher installed to the negotiated
/// session cipher on return. Panics (via `unwrap`/`assert`) on any
/// protocol violation, which is the point for a test client.
async fn client_new_session_and_login(
    pipe: &mut StreamPipe<TcpStream>,
    method_name: &str,
    username: &str,
    password: &str,
) -> (bool, String, Option<[u8; 16]>, Vec<u8>, Vec<u8>) {
    // NEW_SESSION preamble: MAGIC, id_len=0 signals "no resume attempt".
    pipe.write(&[msg::PROTO_MAGIC, 0, 0, 0]).await.unwrap();

    let header = pipe.read_exact(10).await.unwrap();
    let pub_der_len = read_u16(&header[0..2]) as usize;
    let p_len = read_u16(&header[2..4]) as usize;
    let f_len = read_u16(&header[4..6]) as usize;
    let sig_len = read_u16(&header[6..8]) as usize;
    let enc_methods_len = read_u16(&header[8..10]) as usize;

    let body_len = pub_der_len + p_len + 1 + f_len + sig_len + enc_methods_len;
    let body = pipe.read_exact(body_len).await.unwrap();

    let mut off = 0;
    let pub_der = &body[off..off + pub_der_len];
    off += pub_der_len;
    let p_bytes = &body[off..off + p_len];
    off += p_len;
    let g_byte = body[off];
    off += 1;
    let f_bytes = &body[off..off + f_len];
    off += f_len;
    let signature = &body[off..off + sig_len];
    off += sig_len;
    let enc_methods = std::str::from_utf8(&body[off..off + enc_methods_len]).unwrap();

    assert!(enc_methods.split(',').any(|m| m == method_name));
    assert_eq!(g_byte, tunnelsrv::dh::GENERATOR);

    let mut signed_range = Vec::with_capacity(p_len + 1 + f_len);
    signed_range.extend_from_slice(p_bytes);
    signed_range.push(g_byte);
    signed_range.extend_from_slice(f_bytes);
    assert!(
        rsakeys::verify(pub_der, &signed_range, signature).unwrap(),
        "server hello signature must verify against its own pub_der"
    );

    // Client DH half: same built-in group table, so the prime matches.
    let mut client_ctx = CipherContext::new(5).unwrap();
    client_ctx.install_peer_public(f_bytes).unwrap();
    let client_f = client_ctx.f_bytes();

    let method = cipher::lookup(method_name).unwrap();
    let (crypto_key, crypto_iv) = client_ctx.derive(method.key_size, method.iv_size);

    let mut finish = Vec::new();
    push_u16(&mut finish, client_f.len() as u16);
    push_u16(&mut finish, method_name.len() as u16);
    finish.extend_from_slice(&client_f);
    finish.extend_from_slice(method_name.as_bytes());
    pipe.write(&finish).await.unwrap();

    let (enc, dec) = method.construct(&crypto_key, &crypto_iv).unwrap();
    pipe.switch_cipher(enc, dec);

    let mut login = Vec::new();
    login.push(0);
    login.push(0);
    login.push(username.len() as u8);
    login.push(password.len() as u8);
    login.extend_from_slice(username.as_bytes());
    login.extend_from_slice(password.as_bytes());
    pipe.write(&login).await.unwrap();

    let resp_header = pipe.read_exact(4).await.unwrap();
    let ok = resp_header[2] == msg::B_TRUE;
    let msg_len = resp_header[3] as usize;
    let resp_body = pipe.read_exact(msg_len).await.unwrap();

    if ok {
        let mut id = [0u8; 16];
        id.copy_from_slice(&resp_body);
        (true, String::new(), Some(id), crypto_key, crypto_iv)
    } else {
        let reason = String::from_utf8(resp_body).unwrap();
        (false, reason, None, crypto_key, crypto_iv)
    }
}

async fn spawn_loopback_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn build_new_conn_frame(conn_id: u32, echo_addr: SocketAddr) -> Vec<u8> {
    let ip_bytes = match echo_addr.ip() {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    let mut payload = Vec::new();
    payload.push(msg::PROTO_ADDR_IP);
    payload.push(ip_bytes.len() as u8);
    push_u16(&mut payload, echo_addr.port());
    push_u32(&mut payload, conn_id);
    payload.extend_from_slice(&ip_bytes);

    let mut frame = Vec::new();
    frame.push(msg::PROTO_MAGIC);
    frame.push(msg::PACKET_NEW_CONN);
    push_u16(&mut frame, payload.len() as u16);
    frame.extend_from_slice(&payload);
    frame
}

fn build_proxy_frame(conn_id: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    push_u32(&mut payload, conn_id);
    payload.extend_from_slice(data);

    let mut frame = Vec::new();
    frame.push(msg::PROTO_MAGIC);
    frame.push(msg::PACKET_PROXY);
    push_u16(&mut frame, payload.len() as u16);
    frame.extend_from_slice(&payload);
    frame
}

async fn read_frame(pipe: &mut StreamPipe<TcpStream>) -> (u8, Vec<u8>) {
    let header = pipe.read_exact(4).await.unwrap();
    assert_eq!(header[0], msg::PROTO_MAGIC);
    let kind = header[1];
    let len = read_u16(&header[2..4]) as usize;
    let payload = pipe.read_exact(len).await.unwrap();
    (kind, payload)
}

#[tokio::test]
async fn fresh_login_then_proxy_round_trip_then_close() {
    let user_db: Arc<dyn UserDb> = Arc::new(MemoryUserDb::new().with_user("alice", "s3cret"));
    let (addr, _sessions) = spawn_server(test_config(), user_db).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut pipe = StreamPipe::new(socket);
    let (ok, _reason, id, _key, _iv) =
        client_new_session_and_login(&mut pipe, "aes-128-cfb", "alice", "s3cret").await;
    assert!(ok);
    assert!(id.is_some());

    let echo_addr = spawn_loopback_echo().await;
    let conn_id = 7u32;
    pipe.write(&build_new_conn_frame(conn_id, echo_addr))
        .await
        .unwrap();
    pipe.write(&build_proxy_frame(conn_id, b"ping")).await.unwrap();

    let (kind, payload) = read_frame(&mut pipe).await;
    assert_eq!(kind, msg::PACKET_PROXY);
    assert_eq!(read_u32(&payload[0..4]), conn_id);
    assert_eq!(&payload[4..], b"ping");

    // Tell the relay task to close; it must emit exactly one CLOSE_CONN.
    let mut close_payload = Vec::new();
    push_u32(&mut close_payload, conn_id);
    let mut close_frame = vec![msg::PROTO_MAGIC, msg::PACKET_CLOSE_CONN];
    push_u16(&mut close_frame, close_payload.len() as u16);
    close_frame.extend_from_slice(&close_payload);
    pipe.write(&close_frame).await.unwrap();
}

#[tokio::test]
async fn fresh_login_with_wrong_password_is_rejected() {
    let user_db: Arc<dyn UserDb> = Arc::new(MemoryUserDb::new().with_user("alice", "s3cret"));
    let (addr, _sessions) = spawn_server(test_config(), user_db).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut pipe = StreamPipe::new(socket);
    let (ok, reason, id, _key, _iv) =
        client_new_session_and_login(&mut pipe, "aes-128-cfb", "alice", "wrong").await;

    assert!(!ok);
    assert!(id.is_none());
    assert_eq!(reason, "invalid username/password");
}

#[tokio::test]
async fn remote_close_emits_exactly_one_close_conn() {
    let user_db: Arc<dyn UserDb> = Arc::new(MemoryUserDb::new().with_user("alice", "s3cret"));
    let (addr, _sessions) = spawn_server(test_config(), user_db).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut pipe = StreamPipe::new(socket);
    let (ok, _, _, _, _) =
        client_new_session_and_login(&mut pipe, "aes-256-cfb", "alice", "s3cret").await;
    assert!(ok);

    // An echo server that closes the connection the moment it reads
    // anything, so the relay task observes a remote-initiated close.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let conn_id = 42u32;
    pipe.write(&build_new_conn_frame(conn_id, echo_addr))
        .await
        .unwrap();
    pipe.write(&build_proxy_frame(conn_id, b"trigger close"))
        .await
        .unwrap();

    let (kind, payload) = read_frame(&mut pipe).await;
    assert_eq!(kind, msg::PACKET_CLOSE_CONN);
    assert_eq!(read_u32(&payload[0..4]), conn_id);
}

#[tokio::test]
async fn resume_with_valid_hmac_succeeds_and_skips_new_hello() {
    let user_db: Arc<dyn UserDb> = Arc::new(MemoryUserDb::new().with_user("alice", "s3cret"));
    let (addr, _sessions) = spawn_server(test_config(), user_db).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut pipe = StreamPipe::new(socket);
    let (ok, _, id, crypto_key, crypto_iv) =
        client_new_session_and_login(&mut pipe, "aes-128-cfb", "alice", "s3cret").await;
    assert!(ok);
    let id = id.unwrap();
    drop(pipe);

    // Reconnect fresh and attempt RESUME instead of NEW_SESSION.
    let socket2 = TcpStream::connect(addr).await.unwrap();
    let mut pipe2 = StreamPipe::new(socket2);

    let rand: Vec<u8> = (0..32u8).collect();
    let hmac = kdf::hmac_sha256(&crypto_key, &rand).unwrap();

    let mut preamble = vec![msg::PROTO_MAGIC, msg::RESUME_ID_LEN, rand.len() as u8, hmac.len() as u8];
    preamble.extend_from_slice(&id);
    preamble.extend_from_slice(&rand);
    preamble.extend_from_slice(&hmac);
    pipe2.write(&preamble).await.unwrap();

    let response = pipe2.read_exact(2).await.unwrap();
    assert_eq!(response[0], msg::B_TRUE);
    assert_eq!(response[1], msg::REUSE_SUCCESS);

    // From here on traffic rides the already-known session cipher; the
    // client reinstalls it itself, exactly as the server does on its
    // side of the same resume success path.
    let method = cipher::lookup("aes-128-cfb").unwrap();
    let (enc, dec) = method.construct(&crypto_key, &crypto_iv).unwrap();
    pipe2.switch_cipher(enc, dec);

    let echo_addr = spawn_loopback_echo().await;
    let conn_id = 99u32;
    pipe2
        .write(&build_new_conn_frame(conn_id, echo_addr))
        .await
        .unwrap();
    pipe2
        .write(&build_proxy_frame(conn_id, b"resumed"))
        .await
        .unwrap();

    let (kind, payload) = read_frame(&mut pipe2).await;
    assert_eq!(kind, msg::PACKET_PROXY);
    assert_eq!(read_u32(&payload[0..4]), conn_id);
    assert_eq!(&payload[4..], b"resumed");
}

#[tokio::test]
async fn resume_with_forged_hmac_falls_back_to_new_session() {
    let user_db: Arc<dyn UserDb> = Arc::new(MemoryUserDb::new().with_user("alice", "s3cret"));
    let (addr, _sessions) = spawn_server(test_config(), user_db).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut pipe = StreamPipe::new(socket);
    let (ok, _, id, crypto_key, _crypto_iv) =
        client_new_session_and_login(&mut pipe, "aes-128-cfb", "alice", "s3cret").await;
    assert!(ok);
    let id = id.unwrap();
    drop(pipe);

    let socket2 = TcpStream::connect(addr).await.unwrap();
    let mut pipe2 = StreamPipe::new(socket2);

    let rand: Vec<u8> = (0..32u8).collect();
    let mut hmac = kdf::hmac_sha256(&crypto_key, &rand).unwrap();
    hmac[0] ^= 0x01; // flip one bit so the server's HMAC check fails

    let mut preamble = vec![msg::PROTO_MAGIC, msg::RESUME_ID_LEN, rand.len() as u8, hmac.len() as u8];
    preamble.extend_from_slice(&id);
    preamble.extend_from_slice(&rand);
    preamble.extend_from_slice(&hmac);
    pipe2.write(&preamble).await.unwrap();

    let response = pipe2.read_exact(2).await.unwrap();
    assert_eq!(response[0], msg::B_FALSE);
    let expected_failure =
        (msg::ReuseFailure::HMAC_FAIL | msg::ReuseFailure::START_CIPHER_EXCHANGE).bits();
    assert_eq!(response[1], expected_failure);

    // The server falls through into NEW_SESSION on the same connection;
    // a fresh hello must be readable right away.
    let header = pipe2.read_exact(10).await.unwrap();
    let pub_der_len = read_u16(&header[0..2]) as usize;
    assert!(pub_der_len > 0, "a fresh hello header must follow");
}

#[tokio::test]
async fn login_rejects_oversized_username() {
    let user_db: Arc<dyn UserDb> = Arc::new(MemoryUserDb::new().with_user("alice", "s3cret"));
    let (addr, _sessions) = spawn_server(test_config(), user_db).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut pipe = StreamPipe::new(socket);

    pipe.write(&[msg::PROTO_MAGIC, 0, 0, 0]).await.unwrap();
    let header = pipe.read_exact(10).await.unwrap();
    let pub_der_len = read_u16(&header[0..2]) as usize;
    let p_len = read_u16(&header[2..4]) as usize;
    let f_len = read_u16(&header[4..6]) as usize;
    let sig_len = read_u16(&header[6..8]) as usize;
    let enc_methods_len = read_u16(&header[8..10]) as usize;
    let body_len = pub_der_len + p_len + 1 + f_len + sig_len + enc_methods_len;
    let body = pipe.read_exact(body_len).await.unwrap();

    let f_bytes = &body[pub_der_len + p_len + 1..pub_der_len + p_len + 1 + f_len];
    let mut client_ctx = CipherContext::new(5).unwrap();
    client_ctx.install_peer_public(f_bytes).unwrap();
    let client_f = client_ctx.f_bytes();
    let method = cipher::lookup("aes-128-cfb").unwrap();
    let (crypto_key, crypto_iv) = client_ctx.derive(method.key_size, method.iv_size);

    let mut finish = Vec::new();
    push_u16(&mut finish, client_f.len() as u16);
    push_u16(&mut finish, "aes-128-cfb".len() as u16);
    finish.extend_from_slice(&client_f);
    finish.extend_from_slice(b"aes-128-cfb");
    pipe.write(&finish).await.unwrap();

    let (enc, dec) = method.construct(&crypto_key, &crypto_iv).unwrap();
    pipe.switch_cipher(enc, dec);

    // user_len = 0 is out of the allowed 1..=32 range.
    let login = vec![0u8, 0u8, 0u8, 5u8];
    pipe.write(&login).await.unwrap();

    let resp_header = pipe.read_exact(4).await.unwrap();
    assert_eq!(resp_header[2], msg::B_FALSE);
    let msg_len = resp_header[3] as usize;
    let resp_body = pipe.read_exact(msg_len).await.unwrap();
    assert_eq!(resp_body, b"user/passwd size invalid");
}

#[tokio::test]
async fn startup_rejects_empty_encrypt_methods() {
    use tunnelsrv::error::ConfigError;
    let mut cfg = test_config();
    cfg.link_encrypt_methods.clear();

    let path = temp_key_path("cfg");
    std::fs::write(
        &path,
        format!(
            "listen_addr = \"127.0.0.1:0\"\nkey_path = \"{}\"\nuser_db_path = \"x\"\nlink_encrypt_methods = []\n",
            path.display()
        ),
    )
    .unwrap();
    let err = ServerConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::NoEncryptMethods));
    let _ = std::fs::remove_file(&path);
}
