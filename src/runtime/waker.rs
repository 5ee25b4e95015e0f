// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crossbeam_channel::Sender;
use futures::task::ArcWake;
use std::sync::Arc;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Wakes a task by pushing its slot id onto the scheduler's ready queue.
/// The queue is a channel so that wakers stay `Send + Sync` even though the
/// runtime itself is single-threaded.
pub struct QueueWaker {
    id: usize,
    ready: Sender<usize>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [QueueWaker].
impl QueueWaker {
    /// Creates a waker for the task in slot `id`.
    pub fn new(id: usize, ready: Sender<usize>) -> Arc<Self> {
        Arc::new(Self { id, ready })
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// ArcWake trait implementation for [QueueWaker].
impl ArcWake for QueueWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        // The receiver only disappears on runtime teardown.
        let _ = arc_self.ready.send(arc_self.id);
    }
}
