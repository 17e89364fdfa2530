//! Per-client connection state and the async pump that turns wire messages
//! into group mailbox commands (spec §5). One [`Session`] owns one
//! `TcpStream`; [`ClientState`] is the plain, socket-free half a
//! [`crate::group::GroupState`] keeps around between messages — this split
//! is what lets the end-to-end scenarios drive `GroupState` directly
//! without a real socket.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::code_region::{CodeRegionInfo, FunctionDefinition};
use crate::profiler::PerfSample;
use crate::wire::message::{ClientEnrollBody, Message, RawSampleBody};
use crate::wire::{read_message, write_message};

pub type ClientId = u64;

/// Normalizes an address the client reported against `vma_delta` so it
/// lines up with the build-time addresses in `funcs` (spec §6).
pub fn normalize(raw: u64, vma_delta: u64) -> u64 {
    raw.wrapping_sub(vma_delta)
}

fn code_region_from_enrollment(body: &ClientEnrollBody) -> CodeRegionInfo {
    let mut cri = CodeRegionInfo::new();
    for f in &body.funcs {
        cri.add_function(FunctionDefinition {
            name: f.label.clone(),
            start: f.start,
            end: f.start + f.size,
            patchable: f.patchable,
        });
    }
    cri
}

pub fn resolve_sample(raw: RawSampleBody, vma_delta: u64) -> PerfSample {
    PerfSample {
        instr_ptr: normalize(raw.instr_ptr, vma_delta),
        time: raw.time,
        thread_id: raw.thread_id,
        call_context: raw.call_context.into_iter().map(|ip| normalize(ip, vma_delta)).collect(),
    }
}

/// Everything a group keeps about one enrolled client between ticks. No
/// socket handle lives here — outbound messages go through `outbox`, which
/// the session's write task drains.
pub struct ClientState {
    pub id: ClientId,
    pub process_triple: String,
    pub host_cpu: String,
    pub vma_delta: u64,
    pub code_region: CodeRegionInfo,
    pub bitcode: Vec<u8>,
    pub opt_level: String,
    pub sampling_enabled: bool,
    pub dead: bool,
    pub outbox: mpsc::UnboundedSender<Message>,
}

impl ClientState {
    pub fn from_enrollment(id: ClientId, body: ClientEnrollBody, outbox: mpsc::UnboundedSender<Message>) -> Self {
        let code_region = code_region_from_enrollment(&body);
        ClientState {
            id,
            process_triple: body.process_triple,
            host_cpu: body.host_cpu,
            vma_delta: body.vma_delta,
            code_region,
            bitcode: body.module.bitcode,
            opt_level: body.build_settings.opt_level,
            sampling_enabled: false,
            dead: false,
            outbox,
        }
    }

    /// Sends a message to this client, marking it dead if the outbox is
    /// already closed (its session task exited).
    pub fn send(&mut self, msg: Message) {
        if self.outbox.send(msg).is_err() {
            self.dead = true;
        }
    }

    /// True iff this client enrolled with the same build identity as
    /// `other` — the criterion a registrar uses to group clients together.
    pub fn matches_build(&self, process_triple: &str, host_cpu: &str, bitcode: &[u8]) -> bool {
        self.process_triple == process_triple && self.host_cpu == host_cpu && self.bitcode == bitcode
    }
}

/// One decoded inbound message plus which client it came from, handed to
/// the owning group's mailbox.
pub enum Inbound {
    Enrolled(ClientId, ClientEnrollBody, mpsc::UnboundedSender<Message>),
    Sample(ClientId, RawSampleBody),
    CallCount(ClientId, crate::wire::message::CallCountDataBody),
    DyLibInfo(ClientId, crate::wire::message::DyLibInfoBody),
    Disconnected(ClientId),
}

/// Drives one client connection: reads frames off `stream` and forwards
/// them to `group_tx`; writes whatever arrives on `outbox_rx` back out.
/// Runs until the peer disconnects or a transport error occurs.
pub async fn run_session<S>(
    id: ClientId,
    mut stream: S,
    group_tx: mpsc::UnboundedSender<Inbound>,
    mut outbox_rx: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            read = read_message(&mut stream) => {
                match read {
                    Ok(Message::ClientEnroll(body)) => {
                        // re-enrollment on an already-open session: ignored,
                        // the registrar only expects this on a fresh stream.
                        tracing::warn!(client = id, process = %body.process_triple, "unexpected re-enrollment, ignoring");
                    }
                    Ok(Message::RawSample(body)) => {
                        if group_tx.send(Inbound::Sample(id, body)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::CallCountData(body)) => {
                        if group_tx.send(Inbound::CallCount(id, body)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::DyLibInfo(body)) => {
                        if group_tx.send(Inbound::DyLibInfo(id, body)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Shutdown) => {
                        tracing::info!(client = id, "client requested shutdown");
                        break;
                    }
                    Ok(other) => {
                        tracing::debug!(client = id, kind = ?other.kind(), "unexpected client->server message, ignoring");
                    }
                    Err(crate::errors::TransportError::ConnectionClosed) => {
                        tracing::info!(client = id, "connection closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(client = id, error = %e, "transport error, dropping session");
                        break;
                    }
                }
            }
            outbound = outbox_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = write_message(&mut stream, &msg).await {
                            tracing::warn!(client = id, error = %e, "write failed, dropping session");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = group_tx.send(Inbound::Disconnected(id));
}
