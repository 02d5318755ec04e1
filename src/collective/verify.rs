// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stage-consistency sealing.
//!
//! With `LockstepConfig::verify_collectives` on, every stage payload is
//! prefixed with its [`PayloadKind`] and an xxh3 checksum before it leaves
//! the shard, and both are validated on receipt. A mismatch means two
//! shards disagree about which collective this traffic belongs to, which is
//! reported as a fatal divergence rather than fed into the wrong payload
//! decoder. Off, the seal adds zero bytes.
//!
//! The toggle is part of the operation's configuration, so every node of a
//! deployment runs with the same setting.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use xxhash_rust::xxh3::xxh3_64;

use crate::collective::PayloadKind;
use crate::manager::ReplicationError;

const SEAL_LEN: usize = 1 + 8;

/// Wraps `payload` with its kind and checksum when `enabled`.
pub fn seal(kind: PayloadKind, payload: Bytes, enabled: bool) -> Bytes {
    if !enabled {
        return payload;
    }
    let mut sealed = BytesMut::with_capacity(SEAL_LEN + payload.len());
    sealed.put_u8(kind.as_u8());
    sealed.put_u64_le(xxh3_64(&payload));
    sealed.extend_from_slice(&payload);
    sealed.freeze()
}

/// Validates and strips the seal applied by [`seal`].
pub fn open(
    expected: PayloadKind,
    sealed: Bytes,
    enabled: bool,
) -> Result<Bytes, ReplicationError> {
    if !enabled {
        return Ok(sealed);
    }
    if sealed.len() < SEAL_LEN {
        return Err(ReplicationError::SealTruncated {
            expected,
            len: sealed.len(),
        });
    }
    let mut header = &sealed[..SEAL_LEN];
    let found = header.get_u8();
    if found != expected.as_u8() {
        return Err(ReplicationError::KindDivergence { expected, found });
    }
    let recorded = header.get_u64_le();
    let payload = sealed.slice(SEAL_LEN..);
    let computed = xxh3_64(&payload);
    if recorded != computed {
        return Err(ReplicationError::ChecksumDivergence { recorded, computed });
    }
    Ok(payload)
}
