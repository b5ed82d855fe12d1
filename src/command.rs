//! Command lists and the queues that round-robin them.
//!
//! A [`CommandList`] is one reusable command buffer with its own fence. It
//! cycles through `Idle -> Opened -> Closed -> Submitted -> Idle`, the last
//! step happening when a wait observes its fence value.
//!
//! A [`CommandQueue`] owns a fixed pool of lists bound to one hardware queue
//! and hands them out in round-robin order. Opening a list whose previous
//! submission is still in flight blocks until the GPU finishes it, which caps
//! the number of submissions in flight at the pool size.

use std::time::Duration;

use crate::backend::{
    CommandListHandle, FenceHandle, GpuBackend, PresentStatus, QueueHandle, QueueKind,
};
use crate::error::{DeviceError, DeviceResult};
use crate::fence::FenceValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Idle,
    Opened(FenceValue),
    Closed(FenceValue),
    Submitted(FenceValue),
}

/// One command buffer, its allocator and its completion fence.
#[derive(Debug)]
pub struct CommandList {
    handle: CommandListHandle,
    fence: FenceHandle,
    state: ListState,
}

impl CommandList {
    fn new<B: GpuBackend>(backend: &mut B, queue: QueueHandle, label: &str) -> DeviceResult<Self> {
        let handle = backend.create_command_list(queue)?;
        let fence = backend.create_fence(label)?;
        Ok(Self {
            handle,
            fence,
            state: ListState::Idle,
        })
    }

    /// Native command buffer handle.
    pub fn handle(&self) -> CommandListHandle {
        self.handle
    }

    /// Value assigned at open, while recording.
    pub fn current_fence_value(&self) -> Option<FenceValue> {
        match self.state {
            ListState::Opened(value) => Some(value),
            _ => None,
        }
    }

    /// Value of a closed list awaiting submission.
    pub fn pending_fence_value(&self) -> Option<FenceValue> {
        match self.state {
            ListState::Closed(value) => Some(value),
            _ => None,
        }
    }

    /// Value the GPU signals when the submitted work completes.
    pub fn submitted_fence_value(&self) -> Option<FenceValue> {
        match self.state {
            ListState::Submitted(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ListState::Idle
    }

    /// Block until the submitted work completes.
    ///
    /// Returns the completed value, or `None` when nothing was in flight.
    fn wait<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        timeout: Option<Duration>,
    ) -> DeviceResult<Option<FenceValue>> {
        let Some(value) = self.submitted_fence_value() else {
            return Ok(None);
        };

        if !backend.wait_fence(self.fence, value.get(), timeout)? {
            let err = match timeout {
                Some(timeout) => DeviceError::FenceTimeout {
                    value: value.get(),
                    timeout,
                },
                None => DeviceError::DeviceLost(format!("fence wait for {value} returned early")),
            };
            log::error!("Command list {:?}: {}", self.handle, err);
            return Err(err);
        }

        self.state = ListState::Idle;
        Ok(Some(value))
    }
}

/// What a queue does between executing a command list and signalling its fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreSignal {
    /// Plain submission.
    Nothing,
    /// Present the current back buffer, with sync interval 1 for vsync and 0 otherwise.
    Present,
}

/// Outcome of [`CommandQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub fence_value: FenceValue,
    /// Set when the pre-signal hook presented.
    pub present: Option<PresentStatus>,
}

/// A hardware queue with a round-robin pool of command lists.
#[derive(Debug)]
pub struct CommandQueue {
    kind: QueueKind,
    handle: QueueHandle,
    fence: FenceHandle,
    lists: Vec<CommandList>,
    next_list: usize,
    active: Option<usize>,
    next_value: FenceValue,
    last_submitted: Option<FenceValue>,
    last_completed: Option<FenceValue>,
    pre_signal: PreSignal,
    fence_timeout: Option<Duration>,
    /// Set once a submission or fence wait failed; nothing is waited on after that.
    lost: bool,
}

impl CommandQueue {
    /// Create the hardware queue and `list_count` command lists.
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        kind: QueueKind,
        list_count: u32,
        pre_signal: PreSignal,
        fence_timeout: Option<Duration>,
    ) -> DeviceResult<Self> {
        if list_count == 0 {
            return Err(DeviceError::InvalidConfig(format!(
                "{} queue needs at least one command list",
                kind.label()
            )));
        }

        let handle = backend.create_queue(kind)?;
        let fence = backend.create_fence(&format!("{} queue", kind.label()))?;
        let lists = (0..list_count)
            .map(|i| CommandList::new(backend, handle, &format!("{} list {}", kind.label(), i)))
            .collect::<DeviceResult<Vec<_>>>()?;

        log::debug!(
            "Created {} queue with {} command lists",
            kind.label(),
            list_count
        );

        Ok(Self {
            kind,
            handle,
            fence,
            lists,
            next_list: 0,
            active: None,
            next_value: FenceValue::FIRST,
            last_submitted: None,
            last_completed: None,
            pre_signal,
            fence_timeout,
            lost: false,
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    /// Queue-level fence other queues wait on.
    pub fn fence(&self) -> FenceHandle {
        self.fence
    }

    pub fn lists(&self) -> &[CommandList] {
        &self.lists
    }

    /// Command list currently opened or closed but not yet submitted.
    pub fn active_list(&self) -> Option<&CommandList> {
        self.active.map(|i| &self.lists[i])
    }

    /// Whether a list is recording.
    pub fn is_open(&self) -> bool {
        self.active_list()
            .is_some_and(|list| list.current_fence_value().is_some())
    }

    /// Value that the most recently opened list will signal.
    pub fn last_assigned(&self) -> Option<FenceValue> {
        FenceValue::new(self.next_value.get() - 1)
    }

    pub fn last_submitted(&self) -> Option<FenceValue> {
        self.last_submitted
    }

    /// Whether a failed submission or wait has put the queue out of service.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Highest value a CPU wait on this queue has observed.
    pub fn last_completed(&self) -> Option<FenceValue> {
        self.last_completed
    }

    /// Wait for the previous submission of the list the next `open` reuses.
    pub fn wait_next<B: GpuBackend>(&mut self, backend: &mut B) -> DeviceResult<Option<FenceValue>> {
        self.check_lost()?;
        let result = self.lists[self.next_list].wait(backend, self.fence_timeout);
        let completed = self.latch(result)?;
        if completed.is_some() {
            self.last_completed = self.last_completed.max(completed);
        }
        Ok(completed)
    }

    /// Open the next list in round-robin order.
    ///
    /// Blocks while that list's previous submission is in flight and returns
    /// the value observed complete, so callers can reclaim space it covered.
    pub fn open<B: GpuBackend>(
        &mut self,
        backend: &mut B,
    ) -> DeviceResult<(CommandListHandle, Option<FenceValue>)> {
        if let Some(active) = self.active {
            return Err(DeviceError::InvalidState(format!(
                "{} queue: list {} must be closed and submitted before the next open",
                self.kind.label(),
                active
            )));
        }

        let completed = self.wait_next(backend)?;
        let index = self.next_list;
        let list = &mut self.lists[index];
        let handle = list.handle;
        backend.reset_command_list(handle)?;
        list.state = ListState::Opened(self.next_value);
        log::trace!(
            "{} queue: opened list {} for fence {}",
            self.kind.label(),
            index,
            self.next_value
        );

        self.next_value = self.next_value.next();
        self.next_list = (index + 1) % self.lists.len();
        self.active = Some(index);
        Ok((handle, completed))
    }

    /// Finish recording the open list.
    pub fn close<B: GpuBackend>(&mut self, backend: &mut B) -> DeviceResult<()> {
        let index = self
            .active
            .ok_or_else(|| self.misuse("close without an open command list"))?;
        let list = &mut self.lists[index];
        let ListState::Opened(value) = list.state else {
            return Err(DeviceError::InvalidState(format!(
                "{} queue: command list closed twice",
                self.kind.label()
            )));
        };
        backend.close_command_list(list.handle)?;
        list.state = ListState::Closed(value);
        Ok(())
    }

    /// Execute the closed list, run the pre-signal hook, then signal.
    pub fn submit<B: GpuBackend>(&mut self, backend: &mut B, vsync: bool) -> DeviceResult<Submission> {
        let index = self
            .active
            .ok_or_else(|| self.misuse("submit without a closed command list"))?;
        let list = &mut self.lists[index];
        let ListState::Closed(value) = list.state else {
            return Err(DeviceError::InvalidState(format!(
                "{} queue: command list submitted before close",
                self.kind.label()
            )));
        };

        let result = Self::execute_and_signal(
            backend,
            self.handle,
            self.fence,
            list,
            value,
            self.pre_signal,
            vsync,
        );
        self.active = None;
        let present = match result {
            Ok(present) => present,
            Err(e) => {
                // Nothing is going to signal `value`.
                list.state = ListState::Idle;
                self.lost = true;
                log::error!("{} queue submit failed: {}", self.kind.label(), e);
                return Err(e);
            }
        };
        list.state = ListState::Submitted(value);

        self.last_submitted = Some(value);
        log::debug!("{} queue: submitted fence {}", self.kind.label(), value);
        Ok(Submission {
            fence_value: value,
            present,
        })
    }

    fn execute_and_signal<B: GpuBackend>(
        backend: &mut B,
        queue: QueueHandle,
        queue_fence: FenceHandle,
        list: &CommandList,
        value: FenceValue,
        pre_signal: PreSignal,
        vsync: bool,
    ) -> DeviceResult<Option<PresentStatus>> {
        backend.execute(queue, list.handle)?;
        let present = match pre_signal {
            PreSignal::Nothing => None,
            PreSignal::Present => Some(backend.present(queue, u32::from(vsync))?),
        };
        backend.signal(queue, list.fence, value.get())?;
        backend.signal(queue, queue_fence, value.get())?;
        Ok(present)
    }

    /// Make later work on this queue wait for `value` on another queue's fence.
    pub fn wait_on<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        fence: FenceHandle,
        value: FenceValue,
    ) -> DeviceResult<()> {
        backend.queue_wait(self.handle, fence, value.get())?;
        Ok(())
    }

    /// Completed value of the queue-level fence, without blocking.
    pub fn poll_completed<B: GpuBackend>(&mut self, backend: &B) -> DeviceResult<Option<FenceValue>> {
        let completed = FenceValue::new(backend.completed_value(self.fence)?);
        self.last_completed = self.last_completed.max(completed);
        Ok(self.last_completed)
    }

    /// Wait for every submitted list. Returns the highest completed value.
    pub fn wait_idle<B: GpuBackend>(&mut self, backend: &mut B) -> DeviceResult<Option<FenceValue>> {
        self.check_lost()?;
        let mut highest = None;
        for index in 0..self.lists.len() {
            let result = self.lists[index].wait(backend, self.fence_timeout);
            highest = highest.max(self.latch(result)?);
        }
        self.last_completed = self.last_completed.max(highest);
        Ok(self.last_completed)
    }

    fn check_lost(&self) -> DeviceResult<()> {
        if self.lost {
            return Err(DeviceError::DeviceLost(format!(
                "{} queue stopped after an earlier failure",
                self.kind.label()
            )));
        }
        Ok(())
    }

    fn latch<T>(&mut self, result: DeviceResult<T>) -> DeviceResult<T> {
        if result.as_ref().is_err_and(DeviceError::is_device_lost) {
            self.lost = true;
        }
        result
    }

    fn misuse(&self, what: &str) -> DeviceError {
        DeviceError::InvalidState(format!("{} queue: {}", self.kind.label(), what))
    }
}
