// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tonic implementation of the `StateSync` service.
//!
//! Each `Sync` stream is registered with the hub, gets a sender task that
//! drains its hub queue into the response stream, and is read in a loop:
//! delta updates go to the store and the resulting aggregate is broadcast to
//! the fleet; state requests are answered on this stream's queue only.
//! Ordering within one stream is FIFO in both directions; across streams the
//! additive clamp + max-timestamp store semantics make reordering tolerable.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::hub::{ClientRecord, Hub};
use crate::proto::v1::state_sync_server::{StateSync, StateSyncServer};
use crate::proto::{sync_request, DeltaUpdate, StateRequest, SyncRequest, SyncResponse};
use crate::store::Store;

#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn Store>,
    hub: Hub,
}

impl SyncService {
    pub fn new(store: Arc<dyn Store>, hub: Hub) -> Self {
        Self { store, hub }
    }

    pub fn into_server(self) -> StateSyncServer<SyncService> {
        StateSyncServer::new(self)
    }

    async fn handle_delta_update(&self, update: DeltaUpdate) {
        for delta in update.deltas {
            let bucket = match self.store.apply_delta(
                update.seed,
                delta.row_id,
                delta.col_id,
                delta.delta_prob,
                delta.last_update_time_ms,
            ) {
                Ok(bucket) => bucket,
                Err(error) => {
                    // Per-delta failure: skip it, keep the stream alive.
                    warn!(seed = update.seed, %error, "failed to apply delta");
                    continue;
                }
            };

            self.hub
                .broadcast(SyncResponse {
                    seed: update.seed,
                    buckets: vec![bucket],
                })
                .await;
        }
    }

    /// Answer a full-state request on the requesting client's queue only,
    /// so the snapshot serializes with any broadcasts already queued.
    async fn handle_state_request(&self, record: &ClientRecord, request: StateRequest) -> bool {
        let buckets = match self.store.get_seed(request.seed) {
            Ok(buckets) => buckets,
            Err(error) => {
                warn!(seed = request.seed, %error, "failed to read seed state");
                return true;
            }
        };

        let response = SyncResponse {
            seed: request.seed,
            buckets,
        };
        tokio::select! {
            sent = record.sender.send(response) => sent.is_ok(),
            _ = record.closed.cancelled() => false,
        }
    }
}

#[tonic::async_trait]
impl StateSync for SyncService {
    type SyncStream = Pin<Box<dyn Stream<Item = Result<SyncResponse, Status>> + Send>>;

    async fn sync(
        &self,
        request: Request<Streaming<SyncRequest>>,
    ) -> Result<Response<Self::SyncStream>, Status> {
        let mut inbound = request.into_inner();
        let (record, mut queue) = self
            .hub
            .register()
            .await
            .map_err(|_| Status::unavailable("state service is shutting down"))?;

        debug!(client_id = record.id, "sync stream opened");

        // Sender task: drain the hub queue into the response stream. Exits
        // when the hub closes the queue (slow consumer / shutdown) or the
        // transport drops the response stream.
        let (out_tx, out_rx) = mpsc::channel::<Result<SyncResponse, Status>>(16);
        let sender_closed = record.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender_closed.cancelled() => break,
                    msg = queue.recv() => {
                        let Some(msg) = msg else { break };
                        if out_tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Inbound loop: FIFO dispatch of this stream's requests.
        let service = self.clone();
        let reader_record = record.clone();
        tokio::spawn(async move {
            loop {
                let request = match inbound.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(status) => {
                        debug!(client_id = reader_record.id, %status, "sync stream read error");
                        break;
                    }
                };

                match request.request {
                    Some(sync_request::Request::DeltaUpdate(update)) => {
                        service.handle_delta_update(update).await;
                    }
                    Some(sync_request::Request::StateRequest(state_request)) => {
                        if !service
                            .handle_state_request(&reader_record, state_request)
                            .await
                        {
                            break;
                        }
                    }
                    None => {
                        warn!(client_id = reader_record.id, "ignoring empty sync request");
                    }
                }
            }

            service.hub.unregister(reader_record.id).await;
            debug!(client_id = reader_record.id, "sync stream closed");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }
}

/// Serve the state sync service on `addr` until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    store: Arc<dyn Store>,
    hub: Hub,
    cancel: CancellationToken,
) -> Result<()> {
    info!(%addr, "starting state sync service");
    let observer = cancel.child_token();
    Server::builder()
        .add_service(SyncService::new(store, hub).into_server())
        .serve_with_shutdown(addr, observer.cancelled_owned())
        .await
        .inspect_err(|_| cancel.cancel())?;
    Ok(())
}

/// Serve on an already-bound listener; used by tests that bind to port 0.
pub async fn serve_with_listener(
    listener: tokio::net::TcpListener,
    store: Arc<dyn Store>,
    hub: Hub,
    cancel: CancellationToken,
) -> Result<()> {
    let observer = cancel.child_token();
    Server::builder()
        .add_service(SyncService::new(store, hub).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), observer.cancelled_owned())
        .await
        .inspect_err(|_| cancel.cancel())?;
    Ok(())
}
