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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tempfile::TempDir;

use granite::exec::chunk::Chunk;
use granite::runtime::exchange::ExchangeKey;

/// Single-column Int64 chunk; the first value doubles as a marker in
/// ordering tests.
pub fn int64_chunk(values: &[i64]) -> Chunk {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
        .expect("record batch");
    Chunk::new(batch)
}

pub fn chunk_with_rows(rows: usize) -> Chunk {
    let values: Vec<i64> = (0..rows as i64).collect();
    int64_chunk(&values)
}

pub fn chunk_marker(chunk: &Chunk) -> i64 {
    chunk
        .batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column")
        .value(0)
}

/// Tests in one binary run in parallel and share the process-wide registry,
/// so every test uses its own fragment instance id.
pub fn exchange_key(finst: i64, node_id: i32) -> ExchangeKey {
    ExchangeKey {
        finst_id_hi: finst,
        finst_id_lo: finst.wrapping_mul(31),
        node_id,
    }
}

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Write a minimal config file with the given runtime limits.
    pub fn with_runtime(
        exchange_buffer_bytes: usize,
        exchange_max_receivers: usize,
    ) -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_granite.toml");

        let config_content = format!(
            r#"
log_level = "info"

[runtime]
exchange_buffer_bytes = {exchange_buffer_bytes}
exchange_max_receivers = {exchange_max_receivers}
"#
        );

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }
}
