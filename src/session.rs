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

//! Session identity and the concurrent session registry (§3, §5, §9).
//!
//! `Session` is shared between the handshake engine (which creates it on
//! successful login) and the mux loop (which reads `cipher_ctx` to
//! rebuild the pipe's cipher on resume and to check the HMAC). Once
//! created, a session's cipher material never changes, so it is safe to
//! hand out as an `Arc` without further locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::CryptoError;

/// The cipher material a session needs to resume: enough to rebuild
/// fresh encrypt/decrypt transforms (transforms themselves aren't
/// `Clone`, since they carry `Crypter` state) and to verify the resume
/// HMAC.
pub struct SessionCipher {
    pub method_name: &'static str,
    pub crypto_key: Vec<u8>,
    pub crypto_iv: Vec<u8>,
}

impl SessionCipher {
    pub fn rebuild_pair(
        &self,
    ) -> Result<
        (
            Box<dyn crate::cipher::StreamTransform>,
            Box<dyn crate::cipher::StreamTransform>,
        ),
        CryptoError,
    > {
        let method = crate::cipher::lookup(self.method_name)
            .expect("session cipher method was validated at handshake time");
        method.construct(&self.crypto_key, &self.crypto_iv)
    }
}

pub struct Session {
    pub id: [u8; 16],
    pub username: String,
    pub cipher: SessionCipher,
    pub created_at: Instant,
    last_used_at: std::sync::Mutex<Instant>,
}

impl Session {
    pub fn new(id: [u8; 16], username: String, cipher: SessionCipher) -> Self {
        let now = Instant::now();
        Session {
            id,
            username,
            cipher,
            created_at: now,
            last_used_at: std::sync::Mutex::new(now),
        }
    }

    pub fn touch(&self) {
        *self.last_used_at.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.lock().unwrap().elapsed()
    }
}

/// Generates a fresh 16-byte random session id.
pub fn generate_session_id() -> Result<[u8; 16], CryptoError> {
    let mut id = [0u8; 16];
    openssl::rand::rand_bytes(&mut id)?;
    Ok(id)
}

/// Process-global, thread-safe registry mapping session id to `Session`.
/// Lookups are common, insertions rare (§5) — a reader/writer lock is
/// adequate for the expected fanout.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<[u8; 16], std::sync::Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, session: Session) -> std::sync::Arc<Session> {
        let session = std::sync::Arc::new(session);
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        session
    }

    pub async fn get(&self, id: &[u8; 16]) -> Option<std::sync::Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    pub async fn remove(&self, id: &[u8; 16]) {
        self.sessions.write().await.remove(id);
    }

    /// Removes every session whose last use is older than `timeout`.
    /// Driven by a background sweep task started alongside the accept
    /// loop (§9: the distilled spec's source has no TTL at all).
    pub async fn sweep_idle(&self, timeout: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.idle_for() < timeout);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Runs `manager.sweep_idle` on a fixed interval until the process exits.
/// Intended to be `tokio::spawn`ed once from `main`.
pub async fn run_idle_sweep(manager: std::sync::Arc<SessionManager>, timeout: Duration) {
    let mut interval = tokio::time::interval(std::cmp::max(timeout / 4, Duration::from_secs(1)));
    loop {
        interval.tick().await;
        let reaped = manager.sweep_idle(timeout).await;
        if reaped > 0 {
            log::debug!("idle sweep reaped {} session(s)", reaped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_session(id: [u8; 16]) -> Session {
        Session::new(
            id,
            "alice".into(),
            SessionCipher {
                method_name: "aes-128-cfb",
                crypto_key: vec![0u8; 16],
                crypto_iv: vec![0u8; 16],
            },
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let mgr = SessionManager::new();
        let id = [1u8; 16];
        mgr.insert(dummy_session(id)).await;
        assert!(mgr.get(&id).await.is_some());
        assert!(mgr.get(&[2u8; 16]).await.is_none());
    }

    #[tokio::test]
    async fn remove_drops_session() {
        let mgr = SessionManager::new();
        let id = [3u8; 16];
        mgr.insert(dummy_session(id)).await;
        mgr.remove(&id).await;
        assert!(mgr.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn sweep_reaps_only_idle_sessions() {
        let mgr = SessionManager::new();
        let fresh = [4u8; 16];
        mgr.insert(dummy_session(fresh)).await;

        let reaped = mgr.sweep_idle(Duration::from_secs(3600)).await;
        assert_eq!(reaped, 0);
        assert!(mgr.get(&fresh).await.is_some());

        let reaped = mgr.sweep_idle(Duration::from_nanos(1)).await;
        assert_eq!(reaped, 1);
        assert!(mgr.get(&fresh).await.is_none());
    }

    #[test]
    fn session_ids_are_random() {
        let a = generate_session_id().unwrap();
        let b = generate_session_id().unwrap();
        assert_ne!(a, b);
    }
}
