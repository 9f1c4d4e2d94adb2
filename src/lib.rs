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

//! Library surface for the tunnel server's protocol engine. `main.rs` is
//! a thin binary wrapper around this crate; integration tests drive the
//! handshake and mux loop through here over real loopback sockets.

pub mod bytes_ext;
pub mod cipher;
pub mod config;
pub mod dh;
pub mod error;
pub mod handshake;
pub mod kdf;
pub mod msg;
pub mod mux;
pub mod pipe;
pub mod rsakeys;
pub mod session;
pub mod userdb;
