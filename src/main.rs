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

//! Process entry point (§6, §7): loads configuration, the RSA key store
//! and the user database, then runs the accept loop. Out of the core's
//! scope per the distilled spec, but every finished server needs one —
//! this one follows the teacher's `run`/`run_stream` split: a listener
//! loop that spawns one task per accepted socket.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use tunnelsrv::cipher::global::GlobalCipher;
use tunnelsrv::config::ServerConfig;
use tunnelsrv::error::SessionError;
use tunnelsrv::pipe::StreamPipe;
use tunnelsrv::rsakeys::KeyStore;
use tunnelsrv::session::SessionManager;
use tunnelsrv::userdb::{FileUserDb, UserDb};
use tunnelsrv::{error, handshake, mux, session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tunnelsrv.toml"));

    let config = ServerConfig::load(&config_path)?;
    let keys = KeyStore::load_or_generate(&config.key_path)?;
    let user_db = FileUserDb::load(&config.user_db_path)?;
    let global_cipher =
        GlobalCipher::from_config(&config.global_encrypt_method, &config.global_encrypt_password)?;

    let config = Arc::new(config);
    let keys = Arc::new(keys);
    let user_db: Arc<dyn UserDb> = Arc::new(user_db);
    let global_cipher = Arc::new(global_cipher);
    let sessions = Arc::new(SessionManager::new());

    tokio::spawn(session::run_idle_sweep(
        sessions.clone(),
        config.session_idle_timeout(),
    ));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    log::info!("listening on {}", config.listen_addr);

    let mut sigterm = terminate_signal()?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = socket.set_nodelay(true) {
                    log::warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
                }

                let config = config.clone();
                let keys = keys.clone();
                let user_db = user_db.clone();
                let global_cipher = global_cipher.clone();
                let sessions = sessions.clone();

                tokio::spawn(async move {
                    log::debug!("accepted connection from {}", peer);
                    if let Err(e) =
                        handle_connection(socket, &config, &keys, user_db.as_ref(), &global_cipher, &sessions)
                            .await
                    {
                        log::warn!("connection from {} terminated: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("received SIGINT, stopping accept loop");
                break;
            }
            _ = sigterm.recv() => {
                log::info!("received SIGTERM, stopping accept loop");
                break;
            }
        }
    }

    Ok(())
}

/// `SIGTERM` has no Windows equivalent; `ctrl_c()` above already covers
/// `Ctrl+C` on every target, so this server is unix-only for signals.
fn terminate_signal() -> std::io::Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
}

/// Runs the handshake (possibly under the global cipher wrap) and, on
/// success, the mux loop for one accepted socket. All errors here are
/// scoped to this connection — the accept loop never dies from them
/// (§7 propagation policy).
async fn handle_connection(
    socket: TcpStream,
    config: &ServerConfig,
    keys: &KeyStore,
    user_db: &dyn UserDb,
    global_cipher: &Option<GlobalCipher>,
    sessions: &SessionManager,
) -> Result<(), SessionError> {
    let mut pipe = StreamPipe::new(socket);

    if let Some(global_cipher) = global_cipher {
        let password = config
            .global_encrypt_password
            .as_deref()
            .expect("validated at config load: password set whenever a global method is");
        let (enc, dec) = global_cipher.build(password)?;
        pipe.switch_cipher(enc, dec);
    }

    let outcome = tokio::time::timeout(
        config.handshake_timeout(),
        handshake::run_handshake(&mut pipe, config, keys, user_db, sessions),
    )
    .await
    .map_err(|_| error::TransportError::HandshakeTimeout)??;

    log::info!(
        "session {} for user {:?} ({})",
        hex_id(&outcome.session.id),
        outcome.session.username,
        if outcome.resumed { "resumed" } else { "new" }
    );

    mux::run_mux(pipe, config.dial_timeout()).await
}

fn hex_id(id: &[u8; 16]) -> String {
    id.iter().map(|b| format!("{:02x}", b)).collect()
}
