// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generated wire types for the state sync stream.

pub mod v1 {
    tonic::include_proto!("fairshare.state.v1");
}

pub use v1::{
    sync_request, Bucket, BucketDelta, DeltaUpdate, StateRequest, SyncRequest, SyncResponse,
};
