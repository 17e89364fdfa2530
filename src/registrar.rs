//! TCP acceptor and client-to-group demultiplexing (spec §5, §7), grounded
//! in `include/halo/server/ClientRegistrar.h`: accepts connections, routes
//! each enrolling client to the [`crate::group::ClientGroup`] matching its
//! build identity (creating one if none matches), and owns the
//! `--halo-no-persist` shutdown policy for the whole process.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::cli::Cli;
use crate::config::ServerConfig;
use crate::errors::EnrollmentMismatch;
use crate::group::{ClientGroup, GroupIdentity, GroupState};
use crate::session::{run_session, Inbound};
use crate::wire::{read_message, Message};

static CLIENT_TICKET: AtomicU64 = AtomicU64::new(1);

fn next_client_id() -> u64 {
    CLIENT_TICKET.fetch_add(1, Ordering::Relaxed)
}

/// Process-wide registry of live groups, guarded by a `parking_lot::Mutex`
/// since a lookup (every enrollment) is far more common than a new group
/// actually being created.
#[derive(Clone, Default)]
pub struct ClientRegistrar {
    groups: Arc<Mutex<Vec<ClientGroup>>>,
    live_groups: Arc<AtomicUsize>,
    had_any_group: Arc<std::sync::atomic::AtomicBool>,
}

impl ClientRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the group matching `process_triple`/`host_cpu`/`bitcode`, or
    /// spawns and registers a fresh one. A mismatch against every existing
    /// group isn't an error, just the normal path for a build the registrar
    /// hasn't seen yet, so it's logged at `debug` via [`EnrollmentMismatch`]
    /// rather than propagated.
    fn group_for(
        &self,
        process_triple: &str,
        host_cpu: &str,
        bitcode: &[u8],
        config: &ServerConfig,
        cli: &Cli,
    ) -> Result<ClientGroup, crate::errors::ConfigError> {
        let mut groups = self.groups.lock();
        if let Some(g) = groups
            .iter()
            .find(|g| g.identity.process_triple == process_triple && g.identity.host_cpu == host_cpu && g.identity.bitcode == bitcode)
        {
            return Ok(g.clone());
        }
        let mismatch = EnrollmentMismatch {
            reason: format!("no existing group for {process_triple}/{host_cpu}"),
        };
        tracing::debug!(%mismatch, "starting a new client group");

        let identity = GroupIdentity {
            process_triple: process_triple.to_string(),
            host_cpu: host_cpu.to_string(),
            bitcode: bitcode.to_vec(),
        };
        let state = GroupState::new(identity, config, cli)?;
        let (handle, join) = ClientGroup::spawn(state);

        self.had_any_group.store(true, Ordering::SeqCst);
        self.live_groups.fetch_add(1, Ordering::SeqCst);
        let live = Arc::clone(&self.live_groups);
        tokio::spawn(async move {
            let _ = join.await;
            live.fetch_sub(1, Ordering::SeqCst);
        });

        groups.push(handle.clone());
        Ok(handle)
    }

    /// Runs the acceptor loop until a socket error occurs or, under
    /// `--halo-no-persist`, every group that was ever created has shut
    /// down.
    pub async fn run(&self, listener: TcpListener, config: Arc<ServerConfig>, cli: Arc<Cli>) -> anyhow::Result<()> {
        let mut drain_check = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::info!(%peer, "accepted connection");
                    let registrar = self.clone();
                    let config = Arc::clone(&config);
                    let cli = Arc::clone(&cli);
                    tokio::spawn(async move {
                        if let Err(e) = registrar.handle_connection(stream, &config, &cli).await {
                            tracing::warn!(error = %e, "connection setup failed");
                        }
                    });
                }
                _ = drain_check.tick(), if cli.no_persist => {
                    if self.had_any_group.load(Ordering::SeqCst) && self.live_groups.load(Ordering::SeqCst) == 0 {
                        tracing::info!("all client groups drained under --halo-no-persist, shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, config: &ServerConfig, cli: &Cli) -> anyhow::Result<()> {
        let first = read_message(&mut stream).await?;
        let Message::ClientEnroll(body) = first else {
            anyhow::bail!("first message on a new connection must be ClientEnroll, got {:?}", first.kind());
        };

        let group = self.group_for(&body.process_triple, &body.host_cpu, &body.module.bitcode, config, cli)?;
        let group_tx = group.inbound_sender();

        let id = next_client_id();
        let (outbox_tx, outbox_rx) = tokio::sync::mpsc::unbounded_channel();
        if group_tx.send(Inbound::Enrolled(id, body, outbox_tx)).is_err() {
            anyhow::bail!("group mailbox closed before enrollment could be delivered");
        }

        run_session(id, stream, group_tx, outbox_rx).await;
        Ok(())
    }
}
