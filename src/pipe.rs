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

//! Framed byte pipe (§4.1): wraps a reliable byte stream and carries two
//! hot-swappable, position-stateful transforms, one per direction.
//! `switch_cipher` is atomic with respect to callers because the pipe is
//! only ever driven by one reader and one writer task (§5) — there is no
//! concurrent read/write to race against a swap.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cipher::StreamTransform;
use crate::error::TransportError;

pub struct StreamPipe<S> {
    inner: S,
    encryptor: Option<Box<dyn StreamTransform>>,
    decryptor: Option<Box<dyn StreamTransform>>,
}

impl<S> StreamPipe<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S) -> Self {
        StreamPipe {
            inner,
            encryptor: None,
            decryptor: None,
        }
    }

    /// Installs a new (encrypt, decrypt) transform pair, replacing
    /// whatever was there before (including "no cipher at all").
    pub fn switch_cipher(
        &mut self,
        encryptor: Box<dyn StreamTransform>,
        decryptor: Box<dyn StreamTransform>,
    ) {
        self.encryptor = Some(encryptor);
        self.decryptor = Some(decryptor);
    }

    /// Reads exactly `n` raw bytes and applies the current decrypt
    /// transform, if any.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf).await?;
        if let Some(dec) = self.decryptor.as_mut() {
            dec.apply(&mut buf)?;
        }
        Ok(buf)
    }

    /// Applies the current encrypt transform, if any, and writes the
    /// result to the underlying stream.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut buf = data.to_vec();
        if let Some(enc) = self.encryptor.as_mut() {
            enc.apply(&mut buf)?;
        }
        self.inner.write_all(&buf).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> StreamPipe<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Splits the pipe into independent read and write halves, each
    /// carrying only its own direction's transform. Used once a
    /// handshake authenticates, so the mux loop can run a dedicated
    /// reader task and a dedicated writer task (§5) instead of sharing
    /// one `&mut StreamPipe` between them.
    pub fn into_split(self) -> (ReadPipe<tokio::io::ReadHalf<S>>, WritePipe<tokio::io::WriteHalf<S>>) {
        let (read_half, write_half) = tokio::io::split(self.inner);
        (
            ReadPipe {
                inner: read_half,
                decryptor: self.decryptor,
            },
            WritePipe {
                inner: write_half,
                encryptor: self.encryptor,
            },
        )
    }
}

/// The read half of a split [`StreamPipe`]; owned by the mux reader task.
pub struct ReadPipe<R> {
    inner: R,
    decryptor: Option<Box<dyn StreamTransform>>,
}

impl<R: AsyncRead + Unpin> ReadPipe<R> {
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf).await?;
        if let Some(dec) = self.decryptor.as_mut() {
            dec.apply(&mut buf)?;
        }
        Ok(buf)
    }
}

/// The write half of a split [`StreamPipe`]; owned by the mux writer task,
/// which is the sole writer and therefore the sole serialization point
/// for the stateful encrypt transform.
pub struct WritePipe<W> {
    inner: W,
    encryptor: Option<Box<dyn StreamTransform>>,
}

impl<W: AsyncWrite + Unpin> WritePipe<W> {
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut buf = data.to_vec();
        if let Some(enc) = self.encryptor.as_mut() {
            enc.apply(&mut buf)?;
        }
        self.inner.write_all(&buf).await?;
        Ok(())
    }
}
