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
//! One-shot wakeup handles for blocked source tasks.
//!
//! Responsibilities:
//! - Lets a worker that was told to wait register how it wants to be woken.
//! - Whoever completes the blocking work fires the handle; firing is idempotent.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

struct InterruptInner {
    fired: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

/// Wakeup handle a blocked worker leaves behind. The callback runs at most once,
/// on the thread that fires the handle.
#[derive(Clone)]
pub struct InterruptHandle {
    inner: Arc<InterruptInner>,
}

impl InterruptHandle {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(InterruptInner {
                fired: AtomicBool::new(false),
                callback: Box::new(callback),
            }),
        }
    }

    /// Handle that wakes nobody. Useful for single-threaded drivers that retry
    /// on their own.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn fire(&self) {
        if !self.inner.fired.swap(true, Ordering::AcqRel) {
            (self.inner.callback)();
        }
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("fired", &self.has_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_at_most_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = InterruptHandle::new(move || {
            fired_clone.fetch_add(1, Ordering::AcqRel);
        });
        let clone = handle.clone();
        handle.fire();
        clone.fire();
        handle.fire();
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert!(handle.has_fired());
    }
}
