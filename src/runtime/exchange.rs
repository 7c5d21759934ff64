// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Exchange receive side: stream receivers and the process-wide registry.
//!
//! Responsibilities:
//! - Merges chunks pushed by N remote senders into one consumable stream with
//!   per-sender completion tracking and a soft byte-budget backpressure signal.
//! - Maintains the process-wide map from `ExchangeKey` to receiver so the
//!   transport layer can locate a receiver knowing only the identity key.
//! - Every operation returns promptly; consumers poll, they never park here.
//!
//! Key exported interfaces:
//! - Types: `ExchangeKey`, `StreamReceiver`, `ExchangeRecvStats`,
//!   `ExchangeReceiverSnapshot`.
//! - Functions: `get_or_create`, `lookup`, `remove`, `push_chunks`,
//!   `sender_closed`, `is_over_budget`, `cancel_fragment`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::common::config as granite_config;
use crate::common::logging::debug;
use crate::common::types::format_uuid;
use crate::exec::chunk::Chunk;
use crate::runtime::chunk_queue::ChunkQueue;

/// Identity of one exchange receiver within the process:
/// fragment instance id (as two i64 halves) plus the exchange plan node id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExchangeKey {
    pub finst_id_hi: i64,
    pub finst_id_lo: i64,
    pub node_id: i32,
}

impl ExchangeKey {
    #[inline]
    pub(crate) fn finst_uuid(&self) -> String {
        format_uuid(self.finst_id_hi, self.finst_id_lo)
    }
}

const DEFAULT_EXCHANGE_MAX_RECEIVERS: usize = 8192;
const DEFAULT_EXCHANGE_BUFFER_BYTES: usize = 10_485_760;

#[derive(Debug, Default)]
struct SenderState {
    closed: bool,
    chunks_received: u64,
    bytes_received: u64,
}

#[derive(Debug)]
struct ReceiverState {
    num_senders: usize,
    senders: HashMap<i32, SenderState>,
    closed_senders: usize,
    queue: ChunkQueue,
    closed: bool,
    recv_requests: u64,
    recv_chunks: u64,
    recv_rows: u64,
    recv_bytes: u64,
    // Chunks arriving after close(); senders may race a cancellation.
    stale_drops: u64,
    // Deliveries for sender ids beyond the expected cardinality or for
    // senders that already reported eos.
    protocol_drops: u64,
}

impl ReceiverState {
    /// Sender ids are discovered lazily on first chunk or eos. `false` once
    /// the fixed cardinality is exhausted by other ids.
    fn register_sender(&mut self, sender_id: i32) -> bool {
        if !self.senders.contains_key(&sender_id) && self.senders.len() >= self.num_senders {
            return false;
        }
        self.senders.entry(sender_id).or_default();
        true
    }
}

/// Receive side of one exchange: buffers chunks from `num_senders` remote
/// senders and hands them to pull-driven consumers.
///
/// Shared by the registry and every factory that looked it up; `close()` stops
/// data flow, destruction waits for the last `Arc` holder.
#[derive(Debug)]
pub struct StreamReceiver {
    key: ExchangeKey,
    mu: Mutex<ReceiverState>,
}

/// Cumulative receive-side counters, reported when a consumer drains the stream.
#[derive(Clone, Debug, Default)]
pub struct ExchangeRecvStats {
    pub requests_received: u64,
    pub chunks_received: u64,
    pub rows_received: u64,
    pub bytes_received: u64,
    pub stale_drops: u64,
    pub protocol_drops: u64,
}

/// Point-in-time view of one receiver, for diagnostics.
#[derive(Clone, Debug)]
pub struct ExchangeReceiverSnapshot {
    pub num_senders: usize,
    pub known_senders: usize,
    pub closed_senders: usize,
    pub queued_chunks: usize,
    pub buffered_bytes: usize,
    pub over_budget: bool,
    pub closed: bool,
}

impl StreamReceiver {
    pub fn create(key: ExchangeKey, num_senders: usize, buffer_budget_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            key,
            mu: Mutex::new(ReceiverState {
                num_senders,
                senders: HashMap::new(),
                closed_senders: 0,
                queue: ChunkQueue::new(buffer_budget_bytes),
                closed: false,
                recv_requests: 0,
                recv_chunks: 0,
                recv_rows: 0,
                recv_bytes: 0,
                stale_drops: 0,
                protocol_drops: 0,
            }),
        })
    }

    pub fn key(&self) -> ExchangeKey {
        self.key
    }

    /// One transport delivery: zero or more chunks plus an optional eos marker.
    /// No-op after close; senders may legitimately race a cancellation.
    pub fn add_chunks(&self, sender_id: i32, chunks: Vec<Chunk>, eos: bool) {
        let chunks_len = chunks.len();
        let row_count: usize = chunks.iter().map(|c| c.len()).sum();

        let mut st = self.mu.lock().expect("exchange receiver lock");
        st.recv_requests = st.recv_requests.saturating_add(1);
        if st.closed {
            st.stale_drops = st.stale_drops.saturating_add(chunks_len as u64);
            debug!(
                "add_chunks after close, dropping: finst={} node_id={} sender_id={} chunks={} rows={}",
                self.key.finst_uuid(),
                self.key.node_id,
                sender_id,
                chunks_len,
                row_count
            );
            return;
        }

        if !st.register_sender(sender_id) {
            st.protocol_drops = st.protocol_drops.saturating_add(chunks_len.max(1) as u64);
            debug!(
                "add_chunks from unknown sender, dropping: finst={} node_id={} sender_id={} expected_senders={} chunks={}",
                self.key.finst_uuid(),
                self.key.node_id,
                sender_id,
                st.num_senders,
                chunks_len
            );
            return;
        }
        if st.senders[&sender_id].closed {
            st.protocol_drops = st.protocol_drops.saturating_add(chunks_len.max(1) as u64);
            debug!(
                "add_chunks from closed sender, dropping: finst={} node_id={} sender_id={} chunks={}",
                self.key.finst_uuid(),
                self.key.node_id,
                sender_id,
                chunks_len
            );
            return;
        }

        let mut batch_bytes = 0u64;
        for chunk in &chunks {
            batch_bytes = batch_bytes.saturating_add(chunk.estimated_bytes() as u64);
        }
        {
            let sender = st
                .senders
                .get_mut(&sender_id)
                .expect("sender registered above");
            sender.chunks_received = sender.chunks_received.saturating_add(chunks_len as u64);
            sender.bytes_received = sender.bytes_received.saturating_add(batch_bytes);
        }
        st.recv_chunks = st.recv_chunks.saturating_add(chunks_len as u64);
        st.recv_rows = st.recv_rows.saturating_add(row_count as u64);
        st.recv_bytes = st.recv_bytes.saturating_add(batch_bytes);
        for chunk in chunks {
            st.queue.push(sender_id, chunk);
        }
        if eos {
            self.mark_sender_closed_locked(&mut st, sender_id);
        }
    }

    pub fn add_chunk(&self, sender_id: i32, chunk: Chunk) {
        self.add_chunks(sender_id, vec![chunk], false);
    }

    /// Idempotent: repeated eos from the same sender is absorbed.
    pub fn sender_closed(&self, sender_id: i32) {
        let mut st = self.mu.lock().expect("exchange receiver lock");
        if st.closed {
            return;
        }
        if !st.register_sender(sender_id) {
            st.protocol_drops = st.protocol_drops.saturating_add(1);
            debug!(
                "eos from unknown sender, ignoring: finst={} node_id={} sender_id={} expected_senders={}",
                self.key.finst_uuid(),
                self.key.node_id,
                sender_id,
                st.num_senders
            );
            return;
        }
        self.mark_sender_closed_locked(&mut st, sender_id);
    }

    fn mark_sender_closed_locked(&self, st: &mut ReceiverState, sender_id: i32) {
        let sender = st
            .senders
            .get_mut(&sender_id)
            .expect("sender registered before close mark");
        if sender.closed {
            return;
        }
        sender.closed = true;
        st.closed_senders += 1;
        debug!(
            "sender FINISHED: finst={} node_id={} sender_id={} finished={}/{}",
            self.key.finst_uuid(),
            self.key.node_id,
            sender_id,
            st.closed_senders,
            st.num_senders
        );
    }

    pub fn has_output(&self) -> bool {
        let st = self.mu.lock().expect("exchange receiver lock");
        !st.closed && !st.queue.is_empty()
    }

    /// Terminal completion predicate: every expected sender reported eos and
    /// the queue is drained. Independent of `has_output`; the pull operator
    /// checks both. A closed receiver is deterministically finished.
    pub fn is_finished(&self) -> bool {
        let st = self.mu.lock().expect("exchange receiver lock");
        st.closed || (st.closed_senders == st.num_senders && st.queue.is_empty())
    }

    /// Non-blocking pop. `None` means "nothing right now" regardless of
    /// completion; callers distinguish via `is_finished`.
    pub fn get_next_chunk(&self) -> Option<Chunk> {
        let mut st = self.mu.lock().expect("exchange receiver lock");
        st.queue.pop().map(|(_, chunk)| chunk)
    }

    /// Flow-control decision point read by the transport layer. How the remote
    /// sender is actually throttled is the transport's business.
    pub fn is_over_budget(&self) -> bool {
        let st = self.mu.lock().expect("exchange receiver lock");
        !st.closed && st.queue.is_over_budget()
    }

    /// Terminal transition: discard buffered chunks and stop accepting more.
    /// Idempotent under concurrent calls; returns whether this call performed
    /// the transition.
    pub fn close(&self) -> bool {
        let mut st = self.mu.lock().expect("exchange receiver lock");
        if st.closed {
            return false;
        }
        st.closed = true;
        let (dropped_chunks, dropped_bytes) = st.queue.clear();
        debug!(
            "exchange receiver CLOSED: finst={} node_id={} dropped_chunks={} dropped_bytes={} finished_senders={}/{}",
            self.key.finst_uuid(),
            self.key.node_id,
            dropped_chunks,
            dropped_bytes,
            st.closed_senders,
            st.num_senders
        );
        true
    }

    pub fn stats(&self) -> ExchangeRecvStats {
        let st = self.mu.lock().expect("exchange receiver lock");
        ExchangeRecvStats {
            requests_received: st.recv_requests,
            chunks_received: st.recv_chunks,
            rows_received: st.recv_rows,
            bytes_received: st.recv_bytes,
            stale_drops: st.stale_drops,
            protocol_drops: st.protocol_drops,
        }
    }

    pub fn snapshot(&self) -> ExchangeReceiverSnapshot {
        let st = self.mu.lock().expect("exchange receiver lock");
        ExchangeReceiverSnapshot {
            num_senders: st.num_senders,
            known_senders: st.senders.len(),
            closed_senders: st.closed_senders,
            queued_chunks: st.queue.len(),
            buffered_bytes: st.queue.buffered_bytes(),
            over_budget: st.queue.is_over_budget(),
            closed: st.closed,
        }
    }
}

static EXCHANGE: OnceLock<Mutex<HashMap<ExchangeKey, Arc<StreamReceiver>>>> = OnceLock::new();

fn exchange() -> &'static Mutex<HashMap<ExchangeKey, Arc<StreamReceiver>>> {
    EXCHANGE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn max_receivers() -> usize {
    granite_config::get()
        .map(|cfg| cfg.runtime.exchange_max_receivers)
        .unwrap_or(DEFAULT_EXCHANGE_MAX_RECEIVERS)
}

/// Per-receiver byte budget from the loaded config, or the built-in default.
/// Factories fall back to this when the plan carries no budget of its own.
pub fn default_buffer_budget() -> usize {
    granite_config::get()
        .map(|cfg| cfg.runtime.exchange_buffer_bytes)
        .unwrap_or(DEFAULT_EXCHANGE_BUFFER_BYTES)
}

/// At most one receiver is ever created per key, even under concurrent first
/// access; parameters of later callers are ignored (they are plan-fixed).
pub fn get_or_create(
    key: ExchangeKey,
    num_senders: usize,
    buffer_budget_bytes: usize,
) -> Result<Arc<StreamReceiver>, String> {
    let mut guard = exchange().lock().expect("exchange lock");
    if let Some(receiver) = guard.get(&key) {
        return Ok(Arc::clone(receiver));
    }
    let limit = max_receivers();
    if guard.len() >= limit {
        return Err(format!(
            "exchange receiver limit reached: finst={} node_id={} limit={}",
            key.finst_uuid(),
            key.node_id,
            limit
        ));
    }
    let receiver = StreamReceiver::create(key, num_senders, buffer_budget_bytes);
    guard.insert(key, Arc::clone(&receiver));
    debug!(
        "exchange receiver CREATED: finst={} node_id={} num_senders={} budget_bytes={}",
        key.finst_uuid(),
        key.node_id,
        num_senders,
        buffer_budget_bytes
    );
    Ok(receiver)
}

pub fn lookup(key: ExchangeKey) -> Option<Arc<StreamReceiver>> {
    let guard = exchange().lock().expect("exchange lock");
    guard.get(&key).cloned()
}

/// Releases the registry's strong reference. Lingering factory/operator
/// holders keep the receiver alive; a later `get_or_create` with the same key
/// builds a fresh one.
pub fn remove(key: ExchangeKey) -> bool {
    let mut guard = exchange().lock().expect("exchange lock");
    let removed = guard.remove(&key).is_some();
    if removed {
        debug!(
            "exchange receiver REMOVED: finst={} node_id={}",
            key.finst_uuid(),
            key.node_id
        );
    }
    removed
}

pub fn receiver_count() -> usize {
    exchange().lock().expect("exchange lock").len()
}

/// Closes and retires every receiver belonging to one fragment instance.
/// Whole-fragment cancellation path; safe to race in-flight deliveries.
pub fn cancel_fragment(finst_id_hi: i64, finst_id_lo: i64) {
    let mut guard = exchange().lock().expect("exchange lock");
    let keys: Vec<ExchangeKey> = guard
        .keys()
        .copied()
        .filter(|k| k.finst_id_hi == finst_id_hi && k.finst_id_lo == finst_id_lo)
        .collect();
    for key in keys {
        if let Some(receiver) = guard.remove(&key) {
            receiver.close();
        }
    }
}

/// Transport-facing delivery. Deliveries for keys not (or no longer) in the
/// registry are dropped; senders may race receiver creation or teardown.
pub fn push_chunks(key: ExchangeKey, sender_id: i32, chunks: Vec<Chunk>, eos: bool) {
    match lookup(key) {
        Some(receiver) => receiver.add_chunks(sender_id, chunks, eos),
        None => debug!(
            "push_chunks without receiver, dropping: finst={} node_id={} sender_id={} chunks={} eos={}",
            key.finst_uuid(),
            key.node_id,
            sender_id,
            chunks.len(),
            eos
        ),
    }
}

pub fn push_chunk(key: ExchangeKey, sender_id: i32, chunk: Chunk) {
    push_chunks(key, sender_id, vec![chunk], false);
}

pub fn sender_closed(key: ExchangeKey, sender_id: i32) {
    match lookup(key) {
        Some(receiver) => receiver.sender_closed(sender_id),
        None => debug!(
            "eos without receiver, ignoring: finst={} node_id={} sender_id={}",
            key.finst_uuid(),
            key.node_id,
            sender_id
        ),
    }
}

/// `false` when the key is unknown: absent receiver, nothing to throttle for.
pub fn is_over_budget(key: ExchangeKey) -> bool {
    lookup(key).map(|r| r.is_over_budget()).unwrap_or(false)
}
