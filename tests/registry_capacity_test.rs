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
//! Config-driven runtime limits. Isolated in its own test binary because the
//! process-wide config can only be initialized once, and kept as a single
//! test so concurrent cases cannot fight over the tiny receiver limit.

use granite::exec::operators::ExchangeSourceFactory;
use granite::exec::pipeline::operator::Operator;
use granite::exec::pipeline::operator_factory::OperatorFactory;
use granite::granite_config;
use granite::runtime::exchange;

use crate::common::{TestConfig, chunk_with_rows, exchange_key};

mod common;

#[test]
fn config_limits_drive_registry_and_budget() {
    let test_config = TestConfig::with_runtime(1024, 2).expect("test config");
    let cfg = granite_config::init_from_path(&test_config.config_path).expect("init config");
    assert_eq!(cfg.runtime.exchange_max_receivers, 2);
    assert_eq!(exchange::default_buffer_budget(), 1024);

    let key_a = exchange_key(3001, 1);
    let key_b = exchange_key(3001, 2);
    let key_c = exchange_key(3001, 3);

    exchange::get_or_create(key_a, 1, 1024).expect("first");
    exchange::get_or_create(key_b, 1, 1024).expect("second");

    let err = exchange::get_or_create(key_c, 1, 1024).expect_err("limit");
    assert!(err.contains("limit"), "unexpected error: {err}");

    // Existing keys are still served from the map.
    exchange::get_or_create(key_a, 1, 1024).expect("existing key unaffected");

    // The failure surfaces as an operator initialization error.
    let factory = ExchangeSourceFactory::new(key_c, 1, Some(1024), None);
    let mut op = factory.create(1, 0);
    assert!(op.prepare().is_err());

    // Retiring a receiver frees capacity.
    exchange::remove(key_a);
    exchange::get_or_create(key_c, 1, 1024).expect("freed capacity");
    exchange::remove(key_b);
    exchange::remove(key_c);

    // A factory with no plan-supplied budget takes exchange_buffer_bytes
    // from the config; the signal trips once the queue buffers past it.
    let key_d = exchange_key(3001, 4);
    let factory = ExchangeSourceFactory::new(key_d, 1, None, None);
    let mut op = factory.create(1, 0);
    op.prepare().expect("prepare");
    let receiver = exchange::lookup(key_d).expect("registered");
    assert!(!receiver.is_over_budget());
    while receiver.snapshot().buffered_bytes <= 1024 {
        receiver.add_chunk(0, chunk_with_rows(64));
    }
    assert!(receiver.is_over_budget());
    assert!(exchange::is_over_budget(key_d));
    exchange::remove(key_d);
}
