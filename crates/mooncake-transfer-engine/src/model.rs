//! Batch/Task/Slice lifecycle and the endpoint state machine (§3, §4.5,
//! §4.6). Transport-agnostic: the RDMA and TCP transports each drive
//! these types the same way, differing only in how a slice's bytes
//! actually move.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mooncake_common::{BatchId, MooncakeError, MooncakeResult, Opcode, SegmentId};

/// Per-slice lifecycle state (§3 "Slice").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    Pending,
    Posted,
    Success,
    Timeout,
    Failed,
}

/// RDMA-specific payload carried by a slice once a device has been
/// selected for it (§4.5.3 step 3, §4.6.4). Transports other than RDMA
/// leave this unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct RdmaSlicePayload {
    pub dest_vaddr: u64,
    pub source_lkey: u32,
    pub dest_rkey: u32,
}

/// The unit of I/O actually posted to a transport (§3 "Slice").
#[derive(Debug, Clone)]
pub struct Slice {
    pub source_addr: u64,
    pub length: u64,
    pub opcode: Opcode,
    pub target_segment_id: SegmentId,
    pub target_offset: u64,
    pub status: SliceStatus,
    pub retry_cnt: u32,
    pub retry_cap: u32,
    pub rdma: Option<RdmaSlicePayload>,
}

impl Slice {
    pub fn new(
        source_addr: u64,
        length: u64,
        opcode: Opcode,
        target_segment_id: SegmentId,
        target_offset: u64,
        retry_cap: u32,
    ) -> Self {
        Self {
            source_addr,
            length,
            opcode,
            target_segment_id,
            target_offset,
            status: SliceStatus::Pending,
            retry_cnt: 0,
            retry_cap,
            rdma: None,
        }
    }

    /// Applies the §4.5.6 failure-handling policy: bump the retry
    /// counter, return `true` if the cap has now been reached (slice
    /// should be marked `Failed` and counted processed by the caller).
    pub fn record_failure(&mut self) -> bool {
        self.retry_cnt += 1;
        self.retry_cnt >= self.retry_cap
    }
}

/// Tri-state rollup of a task's outstanding slices (§4.5.3
/// `get_transfer_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Waiting,
    Completed,
    Failed,
}

/// One user-visible transfer request, decomposed into ≥1 slices (§3
/// "Task"). Counters are atomics: per §9's concurrency design note, the
/// worker thread's per-slice completion handling is the sole cross-thread
/// writer, and the submitter/poller only ever read them.
pub struct Task {
    pub opcode: Opcode,
    pub source_addr: u64,
    pub target_segment_id: SegmentId,
    pub target_offset: u64,
    pub total_bytes: u64,
    transferred_bytes: AtomicU64,
    success_slice_count: AtomicUsize,
    failed_slice_count: AtomicUsize,
    slices: Mutex<Vec<Slice>>,
}

impl Task {
    pub fn new(
        opcode: Opcode,
        source_addr: u64,
        target_segment_id: SegmentId,
        target_offset: u64,
        total_bytes: u64,
        slices: Vec<Slice>,
    ) -> Self {
        Self {
            opcode,
            source_addr,
            target_segment_id,
            target_offset,
            total_bytes,
            transferred_bytes: AtomicU64::new(0),
            success_slice_count: AtomicUsize::new(0),
            failed_slice_count: AtomicUsize::new(0),
            slices: Mutex::new(slices),
        }
    }

    pub fn slice_count(&self) -> usize {
        self.slices.lock().expect("task slice list lock poisoned").len()
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Acquire)
    }

    pub fn success_slice_count(&self) -> usize {
        self.success_slice_count.load(Ordering::Acquire)
    }

    pub fn failed_slice_count(&self) -> usize {
        self.failed_slice_count.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.success_slice_count() + self.failed_slice_count() == self.slice_count()
    }

    /// §4.5.3 `get_transfer_status`: Completed iff every slice accounted
    /// for and none failed; Failed iff every slice accounted for and at
    /// least one failed; Waiting otherwise.
    pub fn status(&self) -> TransferStatus {
        if !self.is_finished() {
            return TransferStatus::Waiting;
        }
        if self.failed_slice_count() > 0 {
            TransferStatus::Failed
        } else {
            TransferStatus::Completed
        }
    }

    /// Runs `f` over a snapshot-mutable view of this task's slices,
    /// under the task's internal lock. Transports use this to take
    /// slices out for posting/reposting and to record completions.
    pub fn with_slices<R>(&self, f: impl FnOnce(&mut Vec<Slice>) -> R) -> R {
        let mut slices = self.slices.lock().expect("task slice list lock poisoned");
        f(&mut slices)
    }

    /// Records one slice's completion against this task's atomics
    /// (§4.5.4 `perform_poll_cq`).
    pub fn record_slice_success(&self, length: u64) {
        self.transferred_bytes.fetch_add(length, Ordering::AcqRel);
        self.success_slice_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_slice_failure(&self) {
        self.failed_slice_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// A handle for a bounded group of outstanding transfer requests (§3
/// "Batch").
pub struct Batch {
    pub id: BatchId,
    batch_size: usize,
    tasks: Mutex<Vec<Arc<Task>>>,
}

impl Batch {
    pub fn new(id: BatchId, batch_size: usize) -> Self {
        Self {
            id,
            batch_size,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Appends `new_tasks`, rejecting the whole batch of them with
    /// `TooManyRequests` if doing so would exceed `batch_size`. Returns
    /// the indices assigned to the newly appended tasks.
    pub fn append_tasks(&self, new_tasks: Vec<Arc<Task>>) -> MooncakeResult<Vec<usize>> {
        let mut tasks = self.tasks.lock().expect("batch task list lock poisoned");
        if tasks.len() + new_tasks.len() > self.batch_size {
            return Err(MooncakeError::TooManyRequests {
                requested: tasks.len() + new_tasks.len(),
                capacity: self.batch_size,
            });
        }
        let start = tasks.len();
        tasks.extend(new_tasks);
        Ok((start..tasks.len()).collect())
    }

    pub fn task(&self, index: usize) -> Option<Arc<Task>> {
        self.tasks
            .lock()
            .expect("batch task list lock poisoned")
            .get(index)
            .cloned()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().expect("batch task list lock poisoned").len()
    }

    /// §4.5.3 `free_batch`: refuses while any task still has outstanding
    /// slices.
    pub fn check_free(&self) -> MooncakeResult<()> {
        let tasks = self.tasks.lock().expect("batch task list lock poisoned");
        if tasks.iter().any(|t| !t.is_finished()) {
            return Err(MooncakeError::BatchBusy(self.id.into()));
        }
        Ok(())
    }
}

/// Peer-NIC-path connection state machine (§4.6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Initializing,
    Unconnected,
    Connected,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice() -> Slice {
        Slice::new(0, 64, Opcode::Write, SegmentId::new(1), 0, 8)
    }

    #[test]
    fn task_status_waits_until_all_slices_accounted_for() {
        let task = Task::new(
            Opcode::Write,
            0,
            SegmentId::new(1),
            0,
            128,
            vec![slice(), slice()],
        );
        assert_eq!(task.status(), TransferStatus::Waiting);
        task.record_slice_success(64);
        assert_eq!(task.status(), TransferStatus::Waiting);
        task.record_slice_success(64);
        assert_eq!(task.status(), TransferStatus::Completed);
    }

    #[test]
    fn task_status_failed_when_any_slice_fails() {
        let task = Task::new(Opcode::Write, 0, SegmentId::new(1), 0, 64, vec![slice()]);
        task.record_slice_failure();
        assert_eq!(task.status(), TransferStatus::Failed);
    }

    #[test]
    fn batch_append_rejects_over_capacity() {
        let batch = Batch::new(BatchId::new(1), 1);
        let task = Arc::new(Task::new(Opcode::Write, 0, SegmentId::new(1), 0, 64, vec![slice()]));
        batch.append_tasks(vec![Arc::clone(&task)]).unwrap();
        let err = batch.append_tasks(vec![task]).unwrap_err();
        assert!(matches!(err, MooncakeError::TooManyRequests { .. }));
    }

    #[test]
    fn batch_free_fails_while_busy() {
        let batch = Batch::new(BatchId::new(1), 4);
        let task = Arc::new(Task::new(Opcode::Write, 0, SegmentId::new(1), 0, 64, vec![slice()]));
        batch.append_tasks(vec![task.clone()]).unwrap();
        assert!(matches!(batch.check_free(), Err(MooncakeError::BatchBusy(_))));
        task.record_slice_success(64);
        assert!(batch.check_free().is_ok());
    }

    #[test]
    fn slice_failure_policy_caps_retries() {
        let mut s = slice();
        for _ in 0..7 {
            assert!(!s.record_failure());
        }
        assert!(s.record_failure());
    }
}
