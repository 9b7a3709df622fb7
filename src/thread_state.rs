//! Per-thread execution state.
//!
//! Every tracing or evaluating thread owns one `ThreadState` per backend,
//! created lazily on first use and registered with the global state so
//! shutdown and `sync_all_devices` can reach it. The state carries the
//! thread's ordering primitive (CUDA stream + event, or the chained task
//! handle of the host pool), the deferred release chain, and the tracing
//! queues feeding the scheduler.

use crate::backend::JitBackend;
use crate::malloc::Allocation;
use crate::pool::TaskHandle;
use crate::var::VarId;

/// Fence a released buffer waits behind before re-entering the free lists.
pub enum ReleaseFence {
    /// Reclaimable immediately.
    None,
    /// Host: the launch chained at free time.
    Task(TaskHandle),
    /// CUDA: event recorded on the owning stream (context, event).
    Event { context: usize, event: usize },
}

pub struct ReleaseEntry {
    pub ptr: usize,
    pub alloc: Allocation,
    pub fence: ReleaseFence,
}

pub struct ThreadState {
    pub backend: JitBackend,
    /// Device index; -1 on host.
    pub device: i32,
    /// CUDA primary context of `device` (0 on host).
    pub context: usize,
    pub stream: usize,
    pub event: usize,
    /// Host ordering: handle of the most recent launch.
    pub task: Option<TaskHandle>,
    /// Freed-but-not-yet-reclaimed buffers.
    pub release_chain: Vec<ReleaseEntry>,
    /// Masked execution scopes (innermost last).
    pub active_mask: Vec<VarId>,
    /// CSE scope; bumped by `new_scope` so unrelated traces never collapse.
    pub scope: u32,
    /// Label prefix applied to new variables (`set_prefix`).
    pub prefix: Option<String>,
    /// Variables queued by `var_schedule`.
    pub scheduled: Vec<VarId>,
    /// Side-effect nodes (scatters) that must run at the next eval.
    pub side_effects: Vec<VarId>,
}

impl ThreadState {
    pub fn host() -> ThreadState {
        ThreadState {
            backend: JitBackend::Host,
            device: -1,
            context: 0,
            stream: 0,
            event: 0,
            task: None,
            release_chain: Vec::new(),
            active_mask: Vec::new(),
            scope: 0,
            prefix: None,
            scheduled: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    pub fn cuda(device: i32, context: usize, stream: usize, event: usize) -> ThreadState {
        ThreadState {
            backend: JitBackend::Cuda,
            device,
            context,
            stream,
            event,
            task: None,
            release_chain: Vec::new(),
            active_mask: Vec::new(),
            scope: 0,
            prefix: None,
            scheduled: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    /// Fence for a buffer freed right now on this thread state.
    pub fn current_fence(&self) -> ReleaseFence {
        match self.backend {
            JitBackend::Host => match &self.task {
                Some(task) if !task.is_finished() => ReleaseFence::Task(task.clone()),
                _ => ReleaseFence::None,
            },
            JitBackend::Cuda => {
                if self.event != 0 {
                    ReleaseFence::Event {
                        context: self.context,
                        event: self.event,
                    }
                } else {
                    ReleaseFence::None
                }
            }
        }
    }

    pub fn mask_push(&mut self, mask: VarId) {
        self.active_mask.push(mask);
    }

    pub fn mask_pop(&mut self) -> Option<VarId> {
        self.active_mask.pop()
    }

    pub fn mask_peek(&self) -> VarId {
        self.active_mask.last().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_fence_tracks_pending_task() {
        let ts = ThreadState::host();
        assert!(matches!(ts.current_fence(), ReleaseFence::None));
    }

    #[test]
    fn mask_stack_is_lifo() {
        let mut ts = ThreadState::host();
        assert_eq!(ts.mask_peek(), 0);
        ts.mask_push(3);
        ts.mask_push(7);
        assert_eq!(ts.mask_peek(), 7);
        assert_eq!(ts.mask_pop(), Some(7));
        assert_eq!(ts.mask_peek(), 3);
    }
}
