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
//! Byte-budgeted FIFO buffer of received chunks.
//!
//! Responsibilities:
//! - Buffers inbound chunks in arrival order, bounded by total bytes, not count.
//! - The budget is soft: pushes always succeed and `is_over_budget` is the
//!   flow-control decision point read by the transport layer.
//!
//! Key exported interfaces:
//! - Types: `ChunkQueue`.

use std::collections::VecDeque;

use crate::exec::chunk::Chunk;

/// FIFO buffer of `(sender_id, chunk)` entries with a soft byte budget.
///
/// Not internally synchronized. The owning receiver keeps the queue and its
/// fill level under one mutex so a push and its byte increment are observed
/// atomically relative to `is_over_budget` reads.
#[derive(Debug)]
pub struct ChunkQueue {
    entries: VecDeque<(i32, Chunk)>,
    buffered_bytes: usize,
    budget_bytes: usize,
    peak_bytes: usize,
    peak_chunks: usize,
}

impl ChunkQueue {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            buffered_bytes: 0,
            budget_bytes,
            peak_bytes: 0,
            peak_chunks: 0,
        }
    }

    /// Accepts the chunk unconditionally; the budget only drives the
    /// backpressure signal, it never rejects locally-arrived data.
    pub fn push(&mut self, sender_id: i32, chunk: Chunk) {
        self.buffered_bytes = self.buffered_bytes.saturating_add(chunk.estimated_bytes());
        self.entries.push_back((sender_id, chunk));
        self.peak_bytes = self.peak_bytes.max(self.buffered_bytes);
        self.peak_chunks = self.peak_chunks.max(self.entries.len());
    }

    /// Oldest buffered entry, or `None` immediately. Never blocks.
    pub fn pop(&mut self) -> Option<(i32, Chunk)> {
        let (sender_id, chunk) = self.entries.pop_front()?;
        self.buffered_bytes = self.buffered_bytes.saturating_sub(chunk.estimated_bytes());
        Some((sender_id, chunk))
    }

    pub fn is_over_budget(&self) -> bool {
        self.buffered_bytes > self.budget_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    pub fn peak_chunks(&self) -> usize {
        self.peak_chunks
    }

    /// Drops everything and resets the fill level.
    /// Returns `(chunks_dropped, bytes_dropped)`.
    pub fn clear(&mut self) -> (usize, usize) {
        let dropped_chunks = self.entries.len();
        let dropped_bytes = self.buffered_bytes;
        self.entries.clear();
        self.buffered_bytes = 0;
        (dropped_chunks, dropped_bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    use super::ChunkQueue;
    use crate::exec::chunk::Chunk;

    fn chunk_with_rows(rows: usize) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let values: Vec<i64> = (0..rows as i64).collect();
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch");
        Chunk::new(batch)
    }

    #[test]
    fn pop_returns_entries_in_push_order() {
        let mut queue = ChunkQueue::new(1 << 20);
        queue.push(1, chunk_with_rows(1));
        queue.push(2, chunk_with_rows(2));
        queue.push(1, chunk_with_rows(3));

        assert_eq!(queue.len(), 3);
        let (sender, chunk) = queue.pop().expect("first");
        assert_eq!((sender, chunk.len()), (1, 1));
        let (sender, chunk) = queue.pop().expect("second");
        assert_eq!((sender, chunk.len()), (2, 2));
        let (sender, chunk) = queue.pop().expect("third");
        assert_eq!((sender, chunk.len()), (1, 3));
        assert!(queue.pop().is_none());
        assert_eq!(queue.buffered_bytes(), 0);
    }

    #[test]
    fn budget_signal_follows_fill_level() {
        let probe = chunk_with_rows(16).estimated_bytes();
        // Budget below two chunks: the second push crosses the line.
        let mut queue = ChunkQueue::new(probe * 2 - 1);
        queue.push(0, chunk_with_rows(16));
        assert!(!queue.is_over_budget());
        queue.push(0, chunk_with_rows(16));
        assert!(queue.is_over_budget());
        queue.pop().expect("pop");
        assert!(!queue.is_over_budget());
    }

    #[test]
    fn push_over_budget_still_accepts() {
        let mut queue = ChunkQueue::new(0);
        queue.push(0, chunk_with_rows(4));
        queue.push(0, chunk_with_rows(4));
        assert!(queue.is_over_budget());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn clear_reports_dropped_and_resets() {
        let mut queue = ChunkQueue::new(1 << 20);
        queue.push(0, chunk_with_rows(8));
        queue.push(1, chunk_with_rows(8));
        let bytes_before = queue.buffered_bytes();
        let (chunks, bytes) = queue.clear();
        assert_eq!(chunks, 2);
        assert_eq!(bytes, bytes_before);
        assert!(queue.is_empty());
        assert_eq!(queue.buffered_bytes(), 0);
        // Peaks survive the clear for diagnostics.
        assert_eq!(queue.peak_chunks(), 2);
        assert!(queue.peak_bytes() >= bytes_before);
    }
}
