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

//! Mux / relay loop (§4.4, §5): demultiplexes frames from the encrypted
//! pipe to per-`conn_id` relay tasks, and multiplexes their output back
//! through a single writer task so writes to the stateful cipher are
//! always serialized.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::bytes_ext::{push_u32, read_u16, read_u32};
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::msg;
use crate::pipe::{ReadPipe, WritePipe};

type ConnTable = Arc<RwLock<HashMap<u32, mpsc::Sender<Vec<u8>>>>>;

struct Frame {
    kind: u8,
    payload: Vec<u8>,
}

async fn read_frame<R: AsyncRead + Unpin>(pipe: &mut ReadPipe<R>) -> Result<Frame, SessionError> {
    let header = pipe.read_exact(4).await?;
    if header[0] != msg::PROTO_MAGIC {
        return Err(ProtocolError::BadMagic(header[0]).into());
    }
    let kind = header[1];
    let len = read_u16(&header[2..4]) as usize;
    if len > msg::MAX_FRAME_SIZE - 4 {
        return Err(ProtocolError::FrameTooLarge(len, msg::MAX_FRAME_SIZE).into());
    }
    let payload = pipe.read_exact(len).await?;
    Ok(Frame { kind, payload })
}

fn build_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(msg::PROTO_MAGIC);
    frame.push(kind);
    let mut len_bytes = Vec::new();
    crate::bytes_ext::push_u16(&mut len_bytes, payload.len() as u16);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(payload);
    frame
}

/// Runs the mux loop for one authenticated tunnel until the underlying
/// connection closes. Consumes the pipe; returns once both the reader
/// and writer side have shut down.
pub async fn run_mux<S>(
    pipe: crate::pipe::StreamPipe<S>,
    dial_timeout: Duration,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_pipe, write_pipe) = pipe.into_split();
    let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(msg::WRITER_QUEUE_CAPACITY);
    let conns: ConnTable = Arc::new(RwLock::new(HashMap::new()));

    let writer_task = tokio::spawn(writer_loop(write_pipe, writer_rx));

    let result = reader_loop(read_pipe, conns.clone(), writer_tx.clone(), dial_timeout).await;

    // Tear down every live relay task: dropping each sender closes that
    // conn's inbound queue, which the relay loop observes as `recv() ==
    // None` and exits on (§5: "must propagate to close every inbound
    // queue and thus every relay task").
    conns.write().await.clear();
    drop(writer_tx);
    let _ = writer_task.await;

    result
}

async fn writer_loop<W: AsyncWrite + Unpin>(
    mut write_pipe: WritePipe<W>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(frame) = rx.recv().await {
        if write_pipe.write(&frame).await.is_err() {
            break;
        }
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(
    mut read_pipe: ReadPipe<R>,
    conns: ConnTable,
    writer_tx: mpsc::Sender<Vec<u8>>,
    dial_timeout: Duration,
) -> Result<(), SessionError> {
    loop {
        let frame = match read_frame(&mut read_pipe).await {
            Ok(f) => f,
            Err(e) => return Err(e),
        };

        match frame.kind {
            msg::PACKET_NEW_CONN => {
                if let Err(e) = handle_new_conn(&frame.payload, &conns, writer_tx.clone(), dial_timeout).await {
                    log::warn!("malformed PACKET_NEW_CONN: {}", e);
                }
            }
            msg::PACKET_PROXY => {
                handle_proxy(&frame.payload, &conns).await;
            }
            msg::PACKET_CLOSE_CONN => {
                handle_close(&frame.payload, &conns).await;
            }
            other => {
                log::debug!("ignoring unknown mux frame kind {:#x}", other);
            }
        }
    }
}

async fn handle_new_conn(
    payload: &[u8],
    conns: &ConnTable,
    writer_tx: mpsc::Sender<Vec<u8>>,
    dial_timeout: Duration,
) -> Result<(), ProtocolError> {
    if payload.len() < 8 {
        return Err(ProtocolError::Malformed("PACKET_NEW_CONN payload too short"));
    }
    let conn_type = payload[0];
    let addr_len = payload[1] as usize;
    let port = read_u16(&payload[2..4]);
    let conn_id = read_u32(&payload[4..8]);
    let addr_bytes = payload.get(8..8 + addr_len).ok_or(ProtocolError::Malformed(
        "PACKET_NEW_CONN address truncated",
    ))?;

    let target = match conn_type {
        msg::PROTO_ADDR_IP => {
            let ip = parse_ip(addr_bytes)?;
            format!("{}:{}", ip, port)
        }
        msg::PROTO_ADDR_HOST => {
            let host = std::str::from_utf8(addr_bytes)
                .map_err(|_| ProtocolError::Malformed("host address is not valid utf-8"))?;
            format!("{}:{}", host, port)
        }
        _ => return Err(ProtocolError::Malformed("unknown conn_type")),
    };

    let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(msg::CONN_QUEUE_CAPACITY);
    // Last-writer-wins on a reused conn_id (§9 Open Question: the server
    // does not enforce client-side uniqueness).
    conns.write().await.insert(conn_id, inbound_tx);

    tokio::spawn(relay_task(
        conn_id,
        target,
        conns.clone(),
        writer_tx,
        inbound_rx,
        dial_timeout,
    ));
    Ok(())
}

fn parse_ip(bytes: &[u8]) -> Result<IpAddr, ProtocolError> {
    match bytes.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(bytes);
            Ok(IpAddr::from(b))
        }
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(bytes);
            Ok(IpAddr::from(b))
        }
        _ => Err(ProtocolError::Malformed("raw IP address must be 4 or 16 bytes")),
    }
}

async fn handle_proxy(payload: &[u8], conns: &ConnTable) {
    if payload.len() < 4 {
        log::warn!("dropping undersized PACKET_PROXY frame");
        return;
    }
    let conn_id = read_u32(&payload[0..4]);
    let data = &payload[4..];

    let sender = { conns.read().await.get(&conn_id).cloned() };
    match sender {
        Some(tx) => {
            // A full queue blocks here, propagating backpressure across
            // the whole tunnel (§4.4 Backpressure) -- this is the point
            // where a slow relay task throttles every other conn_id.
            if tx.send(data.to_vec()).await.is_err() {
                log::debug!("conn {} relay task already gone", conn_id);
            }
        }
        None => {
            log::debug!("PACKET_PROXY for unknown conn_id {}, dropping", conn_id);
        }
    }
}

async fn handle_close(payload: &[u8], conns: &ConnTable) {
    if payload.len() < 4 {
        log::warn!("dropping undersized PACKET_CLOSE_CONN frame");
        return;
    }
    let conn_id = read_u32(&payload[0..4]);
    // Removing (and thus dropping) the sender closes the inbound queue;
    // the relay task's next recv() returns None and it exits on its own.
    conns.write().await.remove(&conn_id);
}

/// Owns one outbound TCP socket and both forwarding directions for one
/// logical connection. The sole emitter of `PACKET_CLOSE_CONN` for its
/// `conn_id` (§9): it emits once when the remote side closes or fails to
/// dial, and not at all when its own queue is closed because the client
/// already told the server to close this `conn_id`.
async fn relay_task(
    conn_id: u32,
    target: String,
    conns: ConnTable,
    writer_tx: mpsc::Sender<Vec<u8>>,
    mut inbound_rx: mpsc::Receiver<Vec<u8>>,
    dial_timeout: Duration,
) {
    let dial = tokio::time::timeout(dial_timeout, TcpStream::connect(&target)).await;
    let mut socket = match dial {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            log::warn!("dial {} for conn {} failed: {}", target, conn_id, e);
            emit_close(&writer_tx, conn_id).await;
            conns.write().await.remove(&conn_id);
            return;
        }
        Err(_) => {
            log::warn!("dial {} for conn {} timed out", target, conn_id);
            emit_close(&writer_tx, conn_id).await;
            conns.write().await.remove(&conn_id);
            return;
        }
    };

    let mut remote_buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            maybe_data = inbound_rx.recv() => {
                match maybe_data {
                    Some(data) => {
                        if socket.write_all(&data).await.is_err() {
                            emit_close(&writer_tx, conn_id).await;
                            break;
                        }
                    }
                    None => {
                        // Client-initiated close: the reader already
                        // removed the table entry. Nothing more to emit.
                        break;
                    }
                }
            }
            n = socket.read(&mut remote_buf) => {
                match n {
                    Ok(0) | Err(_) => {
                        emit_close(&writer_tx, conn_id).await;
                        break;
                    }
                    Ok(n) => {
                        for chunk in remote_buf[..n].chunks(msg::MAX_FRAME_SIZE - 4 - 4) {
                            let mut payload = Vec::with_capacity(4 + chunk.len());
                            push_u32(&mut payload, conn_id);
                            payload.extend_from_slice(chunk);
                            let frame = build_frame(msg::PACKET_PROXY, &payload);
                            if writer_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    conns.write().await.remove(&conn_id);
}

async fn emit_close(writer_tx: &mpsc::Sender<Vec<u8>>, conn_id: u32) {
    let mut payload = Vec::with_capacity(4);
    push_u32(&mut payload, conn_id);
    let frame = build_frame(msg::PACKET_CLOSE_CONN, &payload);
    let _ = writer_tx.send(frame).await;
}

/// Builds a `PACKET_NEW_CONN` payload, for tests driving the server as
/// a client would.
#[cfg(test)]
pub fn encode_new_conn(conn_type: u8, addr: &[u8], port: u16, conn_id: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(conn_type);
    payload.push(addr.len() as u8);
    let mut port_bytes = Vec::new();
    crate::bytes_ext::push_u16(&mut port_bytes, port);
    payload.extend_from_slice(&port_bytes);
    push_u32(&mut payload, conn_id);
    payload.extend_from_slice(addr);
    build_frame(msg::PACKET_NEW_CONN, &payload)
}

#[cfg(test)]
pub fn encode_proxy(conn_id: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + data.len());
    push_u32(&mut payload, conn_id);
    payload.extend_from_slice(data);
    build_frame(msg::PACKET_PROXY, &payload)
}

#[cfg(test)]
pub fn encode_close(conn_id: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    push_u32(&mut payload, conn_id);
    build_frame(msg::PACKET_CLOSE_CONN, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_header() {
        let frame = build_frame(msg::PACKET_PROXY, b"hello");
        assert_eq!(frame[0], msg::PROTO_MAGIC);
        assert_eq!(frame[1], msg::PACKET_PROXY);
        assert_eq!(read_u16(&frame[2..4]) as usize, 5);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn parse_ip_accepts_v4_and_v6() {
        assert!(parse_ip(&[127, 0, 0, 1]).is_ok());
        assert!(parse_ip(&[0u8; 16]).is_ok());
        assert!(parse_ip(&[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn proxy_to_unknown_conn_id_is_a_noop() {
        let conns: ConnTable = Arc::new(RwLock::new(HashMap::new()));
        let mut payload = Vec::new();
        push_u32(&mut payload, 42);
        payload.extend_from_slice(b"data");
        handle_proxy(&payload, &conns).await;
    }

    #[tokio::test]
    async fn close_removes_table_entry() {
        let conns: ConnTable = Arc::new(RwLock::new(HashMap::new()));
        let (tx, _rx) = mpsc::channel(1);
        conns.write().await.insert(7, tx);
        assert!(conns.read().await.contains_key(&7));

        let mut payload = Vec::new();
        push_u32(&mut payload, 7);
        handle_close(&payload, &conns).await;
        assert!(!conns.read().await.contains_key(&7));
    }
}
