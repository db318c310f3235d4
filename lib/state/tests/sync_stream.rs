// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the sync stream: an in-process service with raw
//! generated clients driving delta updates and state requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;

use fairshare_state::proto::v1::state_sync_client::StateSyncClient;
use fairshare_state::proto::{
    sync_request, BucketDelta, DeltaUpdate, StateRequest, SyncRequest, SyncResponse,
};
use fairshare_state::{service, Hub, InMemoryStore, Store};

struct TestService {
    addr: String,
    cancel: CancellationToken,
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_service() -> TestService {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(
        Duration::from_secs(300),
        Duration::from_secs(900),
        Duration::from_secs(60),
    ));
    let hub = Hub::new();
    let cancel = CancellationToken::new();

    let hub_loop = hub.clone();
    let hub_cancel = cancel.clone();
    tokio::spawn(async move { hub_loop.run(hub_cancel).await });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();

    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        service::serve_with_listener(listener, store, hub, serve_cancel)
            .await
            .expect("serve");
    });

    TestService { addr, cancel }
}

async fn open_stream(
    addr: &str,
) -> (mpsc::Sender<SyncRequest>, Streaming<SyncResponse>) {
    let mut client = StateSyncClient::connect(format!("http://{addr}"))
        .await
        .expect("connect");
    let (tx, rx) = mpsc::channel(16);
    let responses = client
        .sync(ReceiverStream::new(rx))
        .await
        .expect("open sync stream")
        .into_inner();
    (tx, responses)
}

fn delta_update(seed: u64, row_id: u64, col_id: u64, delta_prob: f64, ts: u64) -> SyncRequest {
    SyncRequest {
        request: Some(sync_request::Request::DeltaUpdate(DeltaUpdate {
            seed,
            deltas: vec![BucketDelta {
                row_id,
                col_id,
                delta_prob,
                last_update_time_ms: ts,
            }],
        })),
    }
}

fn state_request(seed: u64) -> SyncRequest {
    SyncRequest {
        request: Some(sync_request::Request::StateRequest(StateRequest { seed })),
    }
}

async fn next_response(stream: &mut Streaming<SyncResponse>) -> SyncResponse {
    tokio::time::timeout(Duration::from_secs(2), stream.message())
        .await
        .expect("timed out waiting for sync response")
        .expect("stream error")
        .expect("stream closed")
}

#[tokio::test]
async fn deltas_are_aggregated_and_broadcast_to_all_streams() {
    let svc = start_service().await;

    let (tx1, mut rx1) = open_stream(&svc.addr).await;
    let (_tx2, mut rx2) = open_stream(&svc.addr).await;

    tx1.send(delta_update(7, 1, 2, 0.5, 100)).await.unwrap();

    let update = next_response(&mut rx1).await;
    assert_eq!(update.seed, 7);
    assert_eq!(update.buckets.len(), 1);
    assert_eq!(update.buckets[0].row_id, 1);
    assert_eq!(update.buckets[0].col_id, 2);
    assert!((update.buckets[0].prob - 0.5).abs() < 1e-9);

    // The sender's own delta also fans out to the other stream.
    let update = next_response(&mut rx2).await;
    assert!((update.buckets[0].prob - 0.5).abs() < 1e-9);

    // Additive aggregation with the clamp: 0.5 + 0.7 caps at 1.0.
    tx1.send(delta_update(7, 1, 2, 0.7, 200)).await.unwrap();
    let update = next_response(&mut rx1).await;
    assert_eq!(update.buckets[0].prob, 1.0);
    assert_eq!(update.buckets[0].last_update_time_ms, 200);
    next_response(&mut rx2).await;
}

#[tokio::test]
async fn state_request_is_answered_on_the_requesting_stream_only() {
    let svc = start_service().await;

    let (tx1, mut rx1) = open_stream(&svc.addr).await;
    let (tx2, mut rx2) = open_stream(&svc.addr).await;

    tx1.send(delta_update(11, 0, 3, 0.4, 50)).await.unwrap();
    next_response(&mut rx1).await;
    next_response(&mut rx2).await;

    tx2.send(state_request(11)).await.unwrap();
    let snapshot = next_response(&mut rx2).await;
    assert_eq!(snapshot.seed, 11);
    assert_eq!(snapshot.buckets.len(), 1);
    assert!((snapshot.buckets[0].prob - 0.4).abs() < 1e-9);

    // The snapshot must not reach the other stream.
    let silent = tokio::time::timeout(Duration::from_millis(200), rx1.message()).await;
    assert!(silent.is_err(), "state snapshot leaked to another stream");
}

#[tokio::test]
async fn unknown_seed_state_request_returns_empty_snapshot() {
    let svc = start_service().await;

    let (tx, mut rx) = open_stream(&svc.addr).await;
    tx.send(state_request(42)).await.unwrap();

    let snapshot = next_response(&mut rx).await;
    assert_eq!(snapshot.seed, 42);
    assert!(snapshot.buckets.is_empty());
}
