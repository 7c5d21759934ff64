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
//! Exchange source for receiving distributed upstream data.
//!
//! Responsibilities:
//! - Adapts a shared stream receiver to the pull-operator contract.
//! - Arbitrates the shared-close protocol among parallel driver instances
//!   reading the same exchange: the receiver is closed exactly once, by the
//!   last instance to report finishing.
//! - Applies the post-receive chunk filter before handing chunks downstream.
//!
//! Key exported interfaces:
//! - Types: `ExchangeSourceFactory`, `ChunkFilter`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::logging::debug;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::runtime::exchange::{self, ExchangeKey, StreamReceiver};
use crate::runtime::runtime_state::RuntimeState;

/// Post-receive filter hook applied to every pulled chunk, e.g. a runtime
/// bloom-filter evaluator. Pure over one chunk, no shared state with the
/// receiver. `Ok(None)` means the chunk was filtered away entirely.
pub trait ChunkFilter: Send + Sync {
    fn filter(&self, chunk: Chunk) -> Result<Option<Chunk>, String>;
}

/// State shared between the factory and every operator instance it creates.
///
/// Close arbitration is an explicit counter pair: `expected_closers` grows by
/// one per operator instance handed the receiver, `finished_closers` grows by
/// one per `notify_finishing`. The call that makes the two equal performs the
/// close. Never inferred from `Arc::strong_count`; transient references must
/// not delay or skip teardown.
struct ExchangeSourceShared {
    key: ExchangeKey,
    num_senders: usize,
    // Plan-supplied budget; `None` takes the configured exchange_buffer_bytes.
    buffer_budget_bytes: Option<usize>,
    receiver: Mutex<Option<Arc<StreamReceiver>>>,
    expected_closers: AtomicUsize,
    finished_closers: AtomicUsize,
    filter: Option<Arc<dyn ChunkFilter>>,
}

impl ExchangeSourceShared {
    /// Memoized: the first caller constructs through the registry, siblings
    /// get the cached receiver. Parameters are plan-fixed, so later callers
    /// never pass different ones.
    fn get_or_create_receiver(&self) -> Result<Arc<StreamReceiver>, String> {
        let mut slot = self.receiver.lock().expect("exchange receiver slot lock");
        if let Some(receiver) = slot.as_ref() {
            return Ok(Arc::clone(receiver));
        }
        let budget = self
            .buffer_budget_bytes
            .unwrap_or_else(exchange::default_buffer_budget);
        let receiver = exchange::get_or_create(self.key, self.num_senders, budget)?;
        *slot = Some(Arc::clone(&receiver));
        Ok(receiver)
    }

    fn notify_finishing(&self) {
        let finished = self.finished_closers.fetch_add(1, Ordering::AcqRel) + 1;
        let expected = self.expected_closers.load(Ordering::Acquire);
        if finished != expected {
            return;
        }
        // Last closer among the siblings; fetch_add serializes the callers so
        // exactly one observes equality.
        let receiver = self
            .receiver
            .lock()
            .expect("exchange receiver slot lock")
            .clone();
        if let Some(receiver) = receiver {
            receiver.close();
            exchange::remove(self.key);
            debug!(
                "exchange source retired receiver: finst={} node_id={} closers={}",
                self.key.finst_uuid(),
                self.key.node_id,
                finished
            );
        }
    }
}

/// Factory for exchange source operators. One per exchange node per fragment
/// instance, shared by all parallel drivers reading that exchange.
pub struct ExchangeSourceFactory {
    name: String,
    shared: Arc<ExchangeSourceShared>,
}

impl ExchangeSourceFactory {
    pub fn new(
        key: ExchangeKey,
        num_senders: usize,
        buffer_budget_bytes: Option<usize>,
        filter: Option<Arc<dyn ChunkFilter>>,
    ) -> Self {
        let name = format!("EXCHANGE_SOURCE (id={})", key.node_id);
        Self {
            name,
            shared: Arc::new(ExchangeSourceShared {
                key,
                num_senders,
                buffer_budget_bytes,
                receiver: Mutex::new(None),
                expected_closers: AtomicUsize::new(0),
                finished_closers: AtomicUsize::new(0),
                filter,
            }),
        }
    }
}

impl OperatorFactory for ExchangeSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, driver_id: i32) -> Box<dyn Operator> {
        // Every created instance is an expected closer; the driver contract
        // guarantees set_finishing is called once per instance, even on
        // cancellation.
        self.shared.expected_closers.fetch_add(1, Ordering::AcqRel);
        Box::new(ExchangeSourceOperator {
            name: self.name.clone(),
            driver_id,
            shared: Arc::clone(&self.shared),
            receiver: None,
            finishing: false,
            finished: false,
            logged_first_none: false,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct ExchangeSourceOperator {
    name: String,
    driver_id: i32,
    shared: Arc<ExchangeSourceShared>,
    receiver: Option<Arc<StreamReceiver>>,
    finishing: bool,
    finished: bool,
    logged_first_none: bool,
}

impl Operator for ExchangeSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<(), String> {
        if self.receiver.is_some() {
            return Ok(());
        }
        let receiver = self.shared.get_or_create_receiver()?;
        debug!(
            "ExchangeSource prepared: finst={} node_id={} driver_id={} num_senders={}",
            self.shared.key.finst_uuid(),
            self.shared.key.node_id,
            self.driver_id,
            self.shared.num_senders
        );
        self.receiver = Some(receiver);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        if self.finished || self.finishing {
            return true;
        }
        self.receiver
            .as_ref()
            .map(|r| r.is_finished())
            .unwrap_or(false)
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for ExchangeSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        if self.finished || self.finishing {
            return false;
        }
        self.receiver
            .as_ref()
            .map(|r| r.has_output())
            .unwrap_or(false)
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<(), String> {
        Err("exchange source operator does not accept input".to_string())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>, String> {
        if self.finished {
            return Ok(None);
        }
        let Some(receiver) = self.receiver.as_ref() else {
            return Err("exchange source operator not prepared".to_string());
        };
        let receiver = Arc::clone(receiver);

        loop {
            match receiver.get_next_chunk() {
                Some(chunk) => {
                    let input_rows = chunk.len();
                    let Some(chunk) = self.apply_filter(chunk)? else {
                        debug!(
                            "ExchangeSource filtered out chunk: node_id={} driver_id={} input_rows={}",
                            self.shared.key.node_id, self.driver_id, input_rows
                        );
                        continue;
                    };
                    return Ok(Some(chunk));
                }
                None => {
                    if receiver.is_finished() {
                        self.finished = true;
                        let stats = receiver.stats();
                        debug!(
                            "ExchangeSource finished: finst={} node_id={} driver_id={} requests={} chunks={} rows={} bytes={} stale_drops={} protocol_drops={}",
                            self.shared.key.finst_uuid(),
                            self.shared.key.node_id,
                            self.driver_id,
                            stats.requests_received,
                            stats.chunks_received,
                            stats.rows_received,
                            stats.bytes_received,
                            stats.stale_drops,
                            stats.protocol_drops
                        );
                    } else if !self.logged_first_none {
                        self.logged_first_none = true;
                        debug!(
                            "ExchangeSource no output yet: node_id={} driver_id={}",
                            self.shared.key.node_id, self.driver_id
                        );
                    }
                    // Queue momentarily empty or terminally drained; the
                    // driver tells the two apart via is_finished.
                    return Ok(None);
                }
            }
        }
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<(), String> {
        if self.finishing {
            return Ok(());
        }
        self.finishing = true;
        self.shared.notify_finishing();
        Ok(())
    }
}

impl ExchangeSourceOperator {
    fn apply_filter(&self, chunk: Chunk) -> Result<Option<Chunk>, String> {
        let Some(filter) = self.shared.filter.as_ref() else {
            return Ok(Some(chunk));
        };
        let filtered = filter.filter(chunk)?;
        Ok(filtered.filter(|c| !c.is_empty()))
    }
}
