// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Library-side client for the state sync stream.
//!
//! The run loop walks INIT → CONNECTING → STREAMING and, on any stream
//! error, tears the connection down and retries after a fixed backoff until
//! its token is cancelled. Producers enqueue requests without blocking: the
//! local tracker must stay responsive when the fabric is slow or gone, so an
//! overflowing queue drops the offered request and logs instead of pushing
//! back. The queue itself outlives individual connections; whatever was
//! buffered while disconnected is flushed on the next established stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::proto::v1::state_sync_client::StateSyncClient;
use crate::proto::{sync_request, BucketDelta, DeltaUpdate, StateRequest, SyncRequest, SyncResponse};

/// Outbound request queue depth. Sized for bursts; overflow means the fabric
/// is far behind local traffic and dropping is the right trade.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoked for every inbound [`SyncResponse`]. Must tolerate duplicates,
/// stale seeds, and out-of-order arrivals.
pub type UpdateCallback = Arc<dyn Fn(SyncResponse) + Send + Sync>;

/// Invoked after each successful (re)connect, before any response is
/// delivered; the owner uses it to request full state for its live seeds.
pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;

pub struct StateClient {
    addr: String,
    outbound: mpsc::Sender<SyncRequest>,
    inbox: Mutex<Option<mpsc::Receiver<SyncRequest>>>,
}

impl StateClient {
    pub fn new(addr: impl Into<String>) -> Self {
        let (outbound, inbox) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        Self {
            addr: addr.into(),
            outbound,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    /// Spawn the run loop. Call exactly once; runs until `cancel` fires.
    pub fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
        on_update: UpdateCallback,
        on_connect: ConnectHook,
    ) {
        let client = self.clone();
        tokio::spawn(async move { client.run(cancel, on_update, on_connect).await });
    }

    /// Enqueue a delta update; drops and logs when the queue is full.
    pub fn send_delta_update(&self, seed: u64, deltas: Vec<BucketDelta>) {
        self.enqueue(SyncRequest {
            request: Some(sync_request::Request::DeltaUpdate(DeltaUpdate {
                seed,
                deltas,
            })),
        });
    }

    /// Enqueue a full-state request; drops and logs when the queue is full.
    pub fn request_full_state(&self, seed: u64) {
        self.enqueue(SyncRequest {
            request: Some(sync_request::Request::StateRequest(StateRequest { seed })),
        });
    }

    fn enqueue(&self, request: SyncRequest) {
        if self.outbound.try_send(request).is_err() {
            warn!(addr = %self.addr, "state sync queue full, dropping request");
        }
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        on_update: UpdateCallback,
        on_connect: ConnectHook,
    ) {
        let Some(mut inbox) = self.inbox.lock().take() else {
            warn!(addr = %self.addr, "state client already started");
            return;
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self
                .connect_and_stream(&mut inbox, &cancel, &on_update, &on_connect)
                .await
            {
                Ok(()) => break,
                Err(error) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(
                        addr = %self.addr,
                        %error,
                        backoff_secs = RECONNECT_BACKOFF.as_secs(),
                        "state sync stream failed, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
        debug!(addr = %self.addr, "state client stopped");
    }

    /// One connection lifetime: dial, open the stream, pump both directions.
    /// Returns `Ok(())` only on cancellation; any stream failure is an error
    /// so the run loop backs off and retries.
    async fn connect_and_stream(
        &self,
        inbox: &mut mpsc::Receiver<SyncRequest>,
        cancel: &CancellationToken,
        on_update: &UpdateCallback,
        on_connect: &ConnectHook,
    ) -> Result<()> {
        let endpoint = format!("http://{}", self.addr);
        let channel = Channel::from_shared(endpoint)?
            .tcp_nodelay(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;

        let mut rpc = StateSyncClient::new(channel);
        let (request_tx, request_rx) = mpsc::channel::<SyncRequest>(64);
        let mut responses = rpc
            .sync(ReceiverStream::new(request_rx))
            .await?
            .into_inner();

        info!(addr = %self.addr, "connected to state service");
        on_connect();

        // Receiver pump on its own task so inbound responses keep draining
        // even while an outbound send is waiting on transport backpressure.
        let update = on_update.clone();
        let mut receiver: tokio::task::JoinHandle<Result<()>> = tokio::spawn(async move {
            loop {
                match responses.message().await {
                    Ok(Some(response)) => update(response),
                    Ok(None) => bail!("state service closed the stream"),
                    Err(status) => bail!("state sync stream error: {status}"),
                }
            }
        });

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                joined = &mut receiver => {
                    break match joined {
                        Ok(inner) => inner,
                        Err(join_error) => Err(anyhow!("receiver task failed: {join_error}")),
                    };
                }
                request = inbox.recv() => {
                    let Some(request) = request else { break Ok(()) };
                    if request_tx.send(request).await.is_err() {
                        break Err(anyhow!("request stream closed"));
                    }
                }
            }
        };
        receiver.abort();
        result
    }
}
