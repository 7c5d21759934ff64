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
//! Columnar chunk wrapper and the Arrow IPC seam used by exchange transport.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;

/// A chunk of data, consisting of multiple rows.
/// Wrapper around an Arrow RecordBatch.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
        }
    }

    /// Retained memory of the underlying Arrow buffers. This is what the
    /// receiver queue charges against its byte budget.
    pub fn estimated_bytes(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            batch: RecordBatch::new_empty(Arc::new(Schema::empty())),
        }
    }
}

/// Encode chunks to Arrow IPC stream format.
pub fn encode_chunks(chunks: &[Chunk]) -> Result<Vec<u8>, String> {
    if chunks.is_empty() {
        return Ok(vec![]);
    }

    let mut buffer = Vec::new();

    // Use the schema from the first chunk.
    let schema = chunks[0].schema();
    for (i, c) in chunks.iter().enumerate().skip(1) {
        if c.schema().as_ref() != schema.as_ref() {
            return Err(format!(
                "exchange encode schema mismatch at chunk index {}: expected={:?} actual={:?}",
                i,
                schema,
                c.schema()
            ));
        }
    }
    let mut writer = StreamWriter::try_new(&mut buffer, &schema)
        .map_err(|e| format!("failed to create Arrow IPC writer: {e}"))?;

    for chunk in chunks {
        writer
            .write(&chunk.batch)
            .map_err(|e| format!("failed to write batch: {e}"))?;
    }

    writer
        .finish()
        .map_err(|e| format!("failed to finish Arrow IPC writer: {e}"))?;

    Ok(buffer)
}

/// Decode chunks from Arrow IPC stream format.
pub fn decode_chunks(bytes: &[u8]) -> Result<Vec<Chunk>, String> {
    if bytes.is_empty() {
        return Ok(vec![]);
    }

    let mut cursor = Cursor::new(bytes);
    let reader = StreamReader::try_new(&mut cursor, None)
        .map_err(|e| format!("failed to create Arrow IPC reader: {e}"))?;

    let mut chunks = Vec::new();
    let mut expected_schema: Option<SchemaRef> = None;
    for batch_result in reader {
        let batch = batch_result.map_err(|e| format!("failed to read batch: {e}"))?;
        if let Some(s) = expected_schema.as_ref() {
            if batch.schema().as_ref() != s.as_ref() {
                return Err(format!(
                    "exchange decode schema mismatch: expected={:?} actual={:?}",
                    s,
                    batch.schema()
                ));
            }
        } else {
            expected_schema = Some(batch.schema());
        }
        chunks.push(Chunk::new(batch));
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    use super::{Chunk, decode_chunks, encode_chunks};

    fn int64_chunk(values: &[i64]) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(values.to_vec()))],
        )
        .expect("record batch");
        Chunk::new(batch)
    }

    #[test]
    fn chunk_reports_rows_and_bytes() {
        let chunk = int64_chunk(&[1, 2, 3]);
        assert_eq!(chunk.len(), 3);
        assert!(!chunk.is_empty());
        assert!(chunk.estimated_bytes() > 0);
    }

    #[test]
    fn default_chunk_is_empty() {
        let chunk = Chunk::default();
        assert_eq!(chunk.len(), 0);
        assert!(chunk.is_empty());
    }

    #[test]
    fn ipc_roundtrip_preserves_rows() {
        let chunks = vec![int64_chunk(&[1, 2]), int64_chunk(&[3])];
        let bytes = encode_chunks(&chunks).expect("encode");
        let decoded = decode_chunks(&bytes).expect("decode");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].len(), 2);
        assert_eq!(decoded[1].len(), 1);
    }

    #[test]
    fn encode_rejects_schema_mismatch() {
        let schema = Arc::new(Schema::new(vec![Field::new("w", DataType::Int64, true)]));
        let other = Chunk::new(RecordBatch::new_empty(schema));
        let err = encode_chunks(&[int64_chunk(&[1]), other]).expect_err("mismatch");
        assert!(err.contains("schema mismatch"));
    }
}
