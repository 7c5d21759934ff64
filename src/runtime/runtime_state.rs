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
//! Per-fragment-instance execution context.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::types::UniqueId;

/// RuntimeState is a per-fragment-instance execution context handed to
/// operators by the driver. More execution-time parameters can be migrated
/// here over time.
#[derive(Debug)]
pub struct RuntimeState {
    query_id: Option<UniqueId>,
    fragment_instance_id: Option<UniqueId>,
    canceled: AtomicBool,
    error_state: Mutex<Option<String>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            query_id: None,
            fragment_instance_id: None,
            canceled: AtomicBool::new(false),
            error_state: Mutex::new(None),
        }
    }
}

impl RuntimeState {
    pub fn new(query_id: UniqueId, fragment_instance_id: UniqueId) -> Self {
        Self {
            query_id: Some(query_id),
            fragment_instance_id: Some(fragment_instance_id),
            canceled: AtomicBool::new(false),
            error_state: Mutex::new(None),
        }
    }

    pub fn query_id(&self) -> Option<UniqueId> {
        self.query_id
    }

    pub fn fragment_instance_id(&self) -> Option<UniqueId> {
        self.fragment_instance_id
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn set_canceled(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// First error wins; later errors are dropped.
    pub fn set_error(&self, err: String) {
        let mut guard = self.error_state.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error_state.lock().expect("runtime error lock").clone()
    }
}
