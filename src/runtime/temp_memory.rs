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
//! Best-effort reservations for temporary (intermediate) query memory.
//!
//! Responsibilities:
//! - Hands out `TempMemoryState` handles that carve reservations out of a shared budget.
//! - Grants are best-effort: a request is clamped to what the budget can still cover,
//!   but a state's minimum reservation is always honored.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared budget that temporary-memory reservations are carved from.
#[derive(Debug)]
pub struct TempMemoryManager {
    budget: usize,
    total_reserved: Mutex<usize>,
}

impl TempMemoryManager {
    pub fn new(budget: usize) -> Arc<Self> {
        Arc::new(Self {
            budget,
            total_reserved: Mutex::new(0),
        })
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Register a new reservation handle with a zero reservation.
    pub fn register(self: &Arc<Self>) -> Arc<TempMemoryState> {
        Arc::new(TempMemoryState {
            manager: Arc::clone(self),
            minimum_reservation: AtomicUsize::new(0),
            remaining_size: AtomicUsize::new(0),
            reservation: AtomicUsize::new(0),
        })
    }

    /// Re-reserve `requested` bytes for a state currently holding `held` bytes.
    /// Returns the granted amount.
    fn grant(&self, held: usize, requested: usize, minimum: usize) -> usize {
        let mut total = self.total_reserved.lock().unwrap_or_else(|e| e.into_inner());
        let others = total.saturating_sub(held);
        let available = self.budget.saturating_sub(others);
        // The minimum is a promise; it is granted even when the budget is
        // oversubscribed.
        let granted = requested.max(minimum).min(available).max(minimum);
        *total = others + granted;
        granted
    }
}

/// One consumer's reservation against a [`TempMemoryManager`].
#[derive(Debug)]
pub struct TempMemoryState {
    manager: Arc<TempMemoryManager>,
    minimum_reservation: AtomicUsize,
    remaining_size: AtomicUsize,
    reservation: AtomicUsize,
}

impl TempMemoryState {
    /// Set the floor below which this state's reservation never drops
    /// (except for an explicit release to zero).
    pub fn set_minimum_reservation(&self, bytes: usize) {
        self.minimum_reservation.store(bytes, Ordering::Release);
        if self.reservation.load(Ordering::Acquire) < bytes {
            self.set_remaining_size(bytes);
        }
    }

    /// Request that `bytes` of temporary memory remain reserved for this state.
    /// The grant is best-effort; read back [`TempMemoryState::reservation`] for
    /// the actual value. Requesting zero releases the reservation entirely.
    pub fn set_remaining_size(&self, bytes: usize) {
        self.remaining_size.store(bytes, Ordering::Release);
        let held = self.reservation.load(Ordering::Acquire);
        let minimum = if bytes == 0 {
            0
        } else {
            self.minimum_reservation.load(Ordering::Acquire)
        };
        let granted = self.manager.grant(held, bytes, minimum);
        self.reservation.store(granted, Ordering::Release);
    }

    /// The reservation actually granted.
    pub fn reservation(&self) -> usize {
        self.reservation.load(Ordering::Acquire)
    }

    /// The last requested remaining size.
    pub fn remaining_size(&self) -> usize {
        self.remaining_size.load(Ordering::Acquire)
    }
}

impl Drop for TempMemoryState {
    fn drop(&mut self) {
        let held = self.reservation.load(Ordering::Acquire);
        if held != 0 {
            let mut total = self
                .manager
                .total_reserved
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *total = total.saturating_sub(held);
        }
    }
}
