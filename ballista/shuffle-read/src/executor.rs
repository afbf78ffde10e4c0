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

//! Execution backends running shuffle read tasks.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};

use parking_lot::Mutex;
use tokio::runtime::Handle;

/// A unit of blocking I/O work.
pub type IoTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs read tasks off the calling thread.
///
/// Implementations must not run the task inline: the read scheduler submits
/// tasks while holding its lock.
pub trait IoExecutor: Send + Sync {
    /// Schedules `task` for execution.
    fn execute(&self, task: IoTask);
}

/// Runs tasks on the blocking thread pool of a tokio runtime.
impl IoExecutor for Handle {
    fn execute(&self, task: IoTask) {
        // detached, the task reports its outcome through scheduler state
        drop(self.spawn_blocking(task));
    }
}

/// Executor that queues tasks until they are triggered explicitly.
///
/// Makes read task interleavings deterministic in tests and tools.
#[derive(Default)]
pub struct ManuallyTriggeredExecutor {
    queue: Mutex<VecDeque<IoTask>>,
}

impl ManuallyTriggeredExecutor {
    /// Creates an executor with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to be triggered.
    pub fn num_queued_tasks(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs the oldest queued task on the calling thread. Returns false if
    /// no task was queued.
    pub fn trigger(&self) -> bool {
        // release the queue lock first, the task may submit its successor
        let task = self.queue.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs queued tasks, including tasks submitted while running, until the
    /// queue is empty or `max_tasks` ran. Returns the number of tasks run.
    pub fn trigger_all(&self, max_tasks: usize) -> usize {
        let mut num_run = 0;
        while num_run < max_tasks && self.trigger() {
            num_run += 1;
        }
        num_run
    }
}

impl IoExecutor for ManuallyTriggeredExecutor {
    fn execute(&self, task: IoTask) {
        self.queue.lock().push_back(task);
    }
}

impl Debug for ManuallyTriggeredExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManuallyTriggeredExecutor")
            .field("queued", &self.num_queued_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_manual_trigger_order() {
        let executor = ManuallyTriggeredExecutor::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            executor.execute(Box::new(move || order.lock().push(i)));
        }
        assert_eq!(executor.num_queued_tasks(), 3);
        assert!(executor.trigger());
        assert_eq!(*order.lock(), vec![0]);
        assert_eq!(executor.trigger_all(usize::MAX), 2);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(!executor.trigger());
    }

    #[test]
    fn test_task_can_submit_successor() {
        let executor = Arc::new(ManuallyTriggeredExecutor::new());
        let counter = Arc::new(AtomicUsize::new(0));

        fn submit(executor: Arc<ManuallyTriggeredExecutor>, counter: Arc<AtomicUsize>) {
            let inner = executor.clone();
            executor.execute(Box::new(move || {
                if counter.fetch_add(1, Ordering::SeqCst) < 4 {
                    submit(inner, counter);
                }
            }));
        }

        submit(executor.clone(), counter.clone());
        assert_eq!(executor.trigger_all(3), 3);
        assert_eq!(executor.num_queued_tasks(), 1);
        assert_eq!(executor.trigger_all(usize::MAX), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_handle_runs_task() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        Handle::current().execute(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }
}
