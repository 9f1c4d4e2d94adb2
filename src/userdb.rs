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

//! User database (§3, §6): an external collaborator with a narrow
//! interface, `lookup(username) -> Option<password>`. The handshake
//! engine only ever talks to the `UserDb` trait; this module also ships
//! one concrete flat-file implementation so the binary is runnable.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

/// Looks up the expected password for a username. Implementations may
/// store a hash instead of a plaintext password as long as `lookup`
/// returns whatever the handshake engine should compare the client's
/// submitted password against byte-for-byte (in constant time).
pub trait UserDb: Send + Sync {
    fn lookup(&self, username: &str) -> Option<Vec<u8>>;
}

/// Flat file of `username:password` lines, one user per line. Loaded
/// once at startup; not hot-reloaded.
pub struct FileUserDb {
    users: HashMap<String, Vec<u8>>,
}

impl FileUserDb {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        let mut users = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((user, pass)) = line.split_once(':') {
                users.insert(user.to_string(), pass.as_bytes().to_vec());
            }
        }
        Ok(FileUserDb { users })
    }
}

impl UserDb for FileUserDb {
    fn lookup(&self, username: &str) -> Option<Vec<u8>> {
        self.users.get(username).cloned()
    }
}

/// In-memory `UserDb` used by tests and examples.
pub struct MemoryUserDb {
    users: HashMap<String, Vec<u8>>,
}

impl MemoryUserDb {
    pub fn new() -> Self {
        MemoryUserDb {
            users: HashMap::new(),
        }
    }

    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.users
            .insert(username.to_string(), password.as_bytes().to_vec());
        self
    }
}

impl Default for MemoryUserDb {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDb for MemoryUserDb {
    fn lookup(&self, username: &str) -> Option<Vec<u8>> {
        self.users.get(username).cloned()
    }
}
