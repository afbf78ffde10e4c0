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

//! One-shot completion signal with registered continuations.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A cloneable signal that completes exactly once.
///
/// Continuations registered with [`CompletionSignal::on_complete`] run on the
/// thread that completes the signal, after the signal's own state has been
/// updated. Async callers can [`wait`](CompletionSignal::wait) for it.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    /// `None` once the signal has completed.
    callbacks: Mutex<Option<Vec<Callback>>>,
    completed: watch::Sender<bool>,
}

impl CompletionSignal {
    /// Creates a new signal that has not completed yet.
    pub fn new() -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            inner: Arc::new(SignalInner {
                callbacks: Mutex::new(Some(Vec::new())),
                completed,
            }),
        }
    }

    /// Completes the signal and runs the registered continuations.
    ///
    /// Returns `true` if this call completed the signal, `false` if it had
    /// already completed before.
    pub fn complete(&self) -> bool {
        let callbacks = match self.inner.callbacks.lock().take() {
            Some(callbacks) => callbacks,
            None => return false,
        };
        self.inner.completed.send_replace(true);
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Returns true if the signal has completed.
    pub fn is_complete(&self) -> bool {
        self.inner.callbacks.lock().is_none()
    }

    /// Registers a continuation to run once the signal completes. Runs it
    /// immediately on the calling thread if the signal already completed.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks.lock();
            if let Some(callbacks) = callbacks.as_mut() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Waits until the signal completes.
    pub async fn wait(&self) {
        let mut rx = self.inner.completed.subscribe();
        // the sender lives as long as `self`, so the channel cannot close here
        let _ = rx.wait_for(|completed| *completed).await;
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        CompletionSignal::new()
    }
}

impl Debug for CompletionSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_complete_once() {
        let signal = CompletionSignal::new();
        assert!(!signal.is_complete());
        assert!(signal.complete());
        assert!(signal.is_complete());
        assert!(!signal.complete());
        assert!(signal.clone().is_complete());
    }

    #[test]
    fn test_callbacks_run_exactly_once() {
        let signal = CompletionSignal::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            signal.on_complete(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        signal.complete();
        signal.complete();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_callback_after_completion_runs_immediately() {
        let signal = CompletionSignal::new();
        signal.complete();

        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = counter.clone();
        signal.on_complete(move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait() {
        let signal = CompletionSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        signal.complete();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("signal wait timed out")
            .unwrap();

        // waiting on a completed signal returns immediately
        signal.wait().await;
    }
}
