// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Domain collectives.
//!
//! Each submodule pairs a payload type (the state that travels) with a thin
//! collective wrapper over one of the three engines in
//! [`crate::collective`]. Payloads serialize with MessagePack through the
//! helpers here; merges are unions keyed by contributor, so they stay
//! idempotent and commutative the way the engines require.

pub mod barriers;
pub mod cross_product;
pub mod fields;
pub mod futures;
pub mod mapping;
pub mod must_epoch;
pub mod sharding;
pub mod sync_tree;

use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec(value)?))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}
