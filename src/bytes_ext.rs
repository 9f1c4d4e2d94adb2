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

//! Big-endian read/write helpers used throughout the handshake and mux
//! framing. Thin wrappers over `byteorder` so call sites read as plain
//! buffer pushes rather than repeated `ByteOrder::write_u16` spellouts.

use byteorder::{BigEndian, ByteOrder};

/// Appends a big-endian `u16` to `buf`.
pub fn push_u16(buf: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    buf.extend_from_slice(&b);
}

/// Appends a big-endian `u32` to `buf`.
pub fn push_u32(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

/// Reads a big-endian `u16` from the first two bytes of `buf`.
pub fn read_u16(buf: &[u8]) -> u16 {
    BigEndian::read_u16(buf)
}

/// Reads a big-endian `u32` from the first four bytes of `buf`.
pub fn read_u32(buf: &[u8]) -> u32 {
    BigEndian::read_u32(buf)
}

/// Copies `src` into a freshly allocated `Vec<u8>`. A named helper so
/// call sites documenting "copy this slice out of the shared buffer"
/// read the same way every time.
pub fn copy_bytes(src: &[u8]) -> Vec<u8> {
    src.to_vec()
}
