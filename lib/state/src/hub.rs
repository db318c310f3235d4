// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Broadcast hub for connected sync streams.
//!
//! One event-loop task owns the client set, so membership changes and fan-out
//! are strictly serialized: every client alive at broadcast time either gets
//! the message or is dropped. Clients hold an id plus a sender handle; the
//! hub owns the records, which keeps the client/hub reference graph acyclic.
//!
//! Fan-out is non-blocking. A client whose outbound queue is full is slow;
//! the hub closes its queue and forgets it, trading completeness for forward
//! progress. The dropped client observes the closed queue as end-of-stream
//! and resyncs from scratch on reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::proto::SyncResponse;

/// Per-client outbound queue depth. A consumer further behind than this is
/// dropped rather than waited on.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Handle to one registered stream.
///
/// `sender` feeds the client's outbound queue directly (used for full-state
/// responses that must go to exactly one client); `closed` fires when the hub
/// drops the client, telling its sender task to exit.
#[derive(Clone)]
pub struct ClientRecord {
    pub id: u64,
    pub sender: mpsc::Sender<SyncResponse>,
    pub closed: CancellationToken,
}

enum Command {
    Register {
        reply: oneshot::Sender<(ClientRecord, mpsc::Receiver<SyncResponse>)>,
    },
    Unregister {
        id: u64,
    },
    Broadcast {
        msg: SyncResponse,
    },
}

/// Cloneable handle to the hub event loop.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    inbox: Arc<Mutex<Option<mpsc::Receiver<Command>>>>,
}

impl Hub {
    pub fn new() -> Self {
        let (commands, inbox) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Self {
            commands,
            inbox: Arc::new(Mutex::new(Some(inbox))),
        }
    }

    /// Drive the event loop until cancelled. Call exactly once.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut inbox) = self.inbox.lock().take() else {
            warn!("hub event loop already running");
            return;
        };

        let mut clients: HashMap<u64, ClientRecord> = HashMap::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = inbox.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Register { reply } => {
                            let (sender, receiver) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
                            let record = ClientRecord {
                                id: next_id,
                                sender,
                                closed: CancellationToken::new(),
                            };
                            next_id += 1;
                            clients.insert(record.id, record.clone());
                            debug!(client_id = record.id, clients = clients.len(), "client registered");
                            if reply.send((record.clone(), receiver)).is_err() {
                                clients.remove(&record.id);
                                record.closed.cancel();
                            }
                        }
                        Command::Unregister { id } => {
                            if let Some(record) = clients.remove(&id) {
                                record.closed.cancel();
                                debug!(client_id = id, clients = clients.len(), "client unregistered");
                            }
                        }
                        Command::Broadcast { msg } => {
                            clients.retain(|id, record| {
                                match record.sender.try_send(msg.clone()) {
                                    Ok(()) => true,
                                    Err(_) => {
                                        // Queue full or receiver gone: drop the
                                        // slow consumer so fan-out never stalls.
                                        warn!(client_id = *id, "dropping slow sync client");
                                        record.closed.cancel();
                                        false
                                    }
                                }
                            });
                        }
                    }
                }
            }
        }

        for record in clients.values() {
            record.closed.cancel();
        }
        debug!("hub event loop stopped");
    }

    /// Register a new stream; returns its record and outbound queue.
    pub async fn register(&self) -> Result<(ClientRecord, mpsc::Receiver<SyncResponse>)> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Register { reply })
            .await
            .map_err(|_| anyhow!("hub event loop is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("hub event loop dropped the registration"))
    }

    /// Remove a client and close its outbound queue. Safe to call once per id;
    /// unknown ids are ignored.
    pub async fn unregister(&self, id: u64) {
        let _ = self.commands.send(Command::Unregister { id }).await;
    }

    /// Offer `msg` to every connected client, dropping slow consumers.
    pub async fn broadcast(&self, msg: SyncResponse) {
        let _ = self.commands.send(Command::Broadcast { msg }).await;
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
