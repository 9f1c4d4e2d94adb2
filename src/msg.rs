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

//! Wire protocol constants. Bit-exact: a paired client must agree on
//! every value in this file.

/// Fixed magic byte prefixing every preamble and every mux frame.
pub const PROTO_MAGIC: u8 = 0xA5;

/// Protocol version sent in the LOGIN response, big-endian on the wire.
pub const PROTO_VERSION: u16 = 0x0001;

pub const B_TRUE: u8 = 0x01;
pub const B_FALSE: u8 = 0x00;

bitflags::bitflags! {
    /// Flags returned on a failed resume attempt. `REUSE_SUCCESS` is a
    /// plain byte value (not part of this set) returned on success.
    pub struct ReuseFailure: u8 {
        const HMAC_FAIL = 0x02;
        const START_CIPHER_EXCHANGE = 0x04;
    }
}

pub const REUSE_SUCCESS: u8 = 0x01;

/// Mux frame payload kinds.
pub const PACKET_NEW_CONN: u8 = 0x01;
pub const PACKET_PROXY: u8 = 0x02;
pub const PACKET_CLOSE_CONN: u8 = 0x03;

/// `conn_type` byte inside a `PACKET_NEW_CONN` payload.
pub const PROTO_ADDR_IP: u8 = 0x01;
pub const PROTO_ADDR_HOST: u8 = 0x02;

/// Maximum size of a single mux frame (`MAGIC + kind + len16 + payload`).
pub const MAX_FRAME_SIZE: usize = 65535;

/// Bounds on the resume preamble fields, enforced before any addition so
/// the combined body size cannot overflow `u8` arithmetic.
pub const RESUME_ID_LEN: u8 = 16;
pub const RESUME_MAX_RAND_LEN: u8 = 64;
pub const RESUME_HMAC_LEN: u8 = 32;

/// Maximum length of a username or password in the LOGIN phase.
pub const MAX_CREDENTIAL_LEN: usize = 32;

/// Capacity, in buffers, of a logical connection's inbound queue.
pub const CONN_QUEUE_CAPACITY: usize = 32;

/// Capacity, in frames, of the per-tunnel writer channel.
pub const WRITER_QUEUE_CAPACITY: usize = 1024;
