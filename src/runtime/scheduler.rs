// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::waker::QueueWaker;
use crossbeam_channel::{Receiver, Sender};
use futures::task::waker;
use slab::Slab;
use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

//==============================================================================
// Constants & Structures
//==============================================================================

type LocalFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Lifecycle of one spawned coroutine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    Active,
    Completed,
    Canceled,
}

/// Slot of one coroutine in the task table. The future is taken out of the
/// slot while it is being polled so that a task may spawn or cancel other
/// tasks without re-entering the table.
enum TaskSlot {
    Idle(LocalFuture, Rc<Cell<TaskState>>),
    Running(Rc<Cell<TaskState>>),
}

struct Inner {
    tasks: Slab<TaskSlot>,
}

/// FIFO cooperative scheduler. Exactly one task runs at a time; wakers
/// enqueue slot ids onto the ready queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<Inner>>,
    ready_tx: Sender<usize>,
    ready_rx: Receiver<usize>,
}

/// Owner of a spawned coroutine. Dropping the handle cancels the coroutine
/// at its current suspension point; cancellation completes before the drop
/// returns.
pub struct TaskHandle {
    id: usize,
    state: Rc<Cell<TaskState>>,
    scheduler: Scheduler,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Scheduler].
impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Rc::new(RefCell::new(Inner { tasks: Slab::new() })),
            ready_tx,
            ready_rx,
        }
    }

    /// Inserts a coroutine into the task table and marks it ready.
    pub fn spawn<F: Future<Output = ()> + 'static>(&self, future: F) -> TaskHandle {
        let state = Rc::new(Cell::new(TaskState::Active));
        let id = {
            let mut inner = self.inner.borrow_mut();
            inner
                .tasks
                .insert(TaskSlot::Idle(Box::pin(future), state.clone()))
        };
        // Queue the first resume.
        let _ = self.ready_tx.send(id);
        trace!("spawn(): task={:?}", id);
        TaskHandle {
            id,
            state,
            scheduler: self.clone(),
        }
    }

    /// Resumes one task. Stale wakes for completed or canceled slots are
    /// ignored.
    pub fn resume(&self, id: usize) {
        let (mut future, state) = {
            let mut inner = self.inner.borrow_mut();
            let slot = match inner.tasks.get_mut(id) {
                Some(slot) => slot,
                None => return,
            };
            let state = match slot {
                TaskSlot::Idle(_, state) => state.clone(),
                TaskSlot::Running(_) => return,
            };
            match std::mem::replace(slot, TaskSlot::Running(state.clone())) {
                TaskSlot::Idle(future, _) => (future, state),
                TaskSlot::Running(_) => unreachable!(),
            }
        };
        let waker = waker(QueueWaker::new(id, self.ready_tx.clone()));
        let mut ctx = Context::from_waker(&waker);
        let poll = future.as_mut().poll(&mut ctx);
        match poll {
            Poll::Ready(()) => {
                state.set(TaskState::Completed);
                self.inner.borrow_mut().tasks.remove(id);
            }
            Poll::Pending => {
                // The task may have canceled itself while running.
                if state.get() == TaskState::Canceled {
                    self.inner.borrow_mut().tasks.remove(id);
                } else {
                    let mut inner = self.inner.borrow_mut();
                    if let Some(slot) = inner.tasks.get_mut(id) {
                        *slot = TaskSlot::Idle(future, state);
                    }
                }
            }
        }
    }

    /// Pops the next ready task id, if any.
    pub fn pop_ready(&self) -> Option<usize> {
        self.ready_rx.try_recv().ok()
    }

    /// Cancels a task: an idle future is dropped in place, a running one is
    /// flagged and reaped when its poll returns.
    fn cancel(&self, id: usize, state: &Rc<Cell<TaskState>>) {
        let future = {
            let mut inner = self.inner.borrow_mut();
            let owned = match inner.tasks.get(id) {
                Some(TaskSlot::Idle(_, slot_state)) => Rc::ptr_eq(slot_state, state),
                Some(TaskSlot::Running(slot_state)) => {
                    if Rc::ptr_eq(slot_state, state) {
                        state.set(TaskState::Canceled);
                    }
                    return;
                }
                None => false,
            };
            if !owned {
                return;
            }
            state.set(TaskState::Canceled);
            match inner.tasks.remove(id) {
                TaskSlot::Idle(future, _) => future,
                TaskSlot::Running(_) => unreachable!(),
            }
        };
        // Dropping the future unwinds its suspension point and may call back
        // into the scheduler, so the table borrow is released first.
        drop(future);
        trace!("cancel(): task={:?}", id);
    }
}

/// Associate functions for [TaskHandle].
impl TaskHandle {
    /// Returns true if the coroutine ran to completion.
    pub fn has_completed(&self) -> bool {
        self.state.get() == TaskState::Completed
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [Scheduler].
impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop trait implementation for [TaskHandle].
impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.state.get() == TaskState::Active {
            self.scheduler.cancel(self.id, &self.state);
        }
    }
}
