//! Single background worker that drains a LIFO-popped queue of
//! [`MoverTask`]s in bandwidth-capped ticks (spec.md §4.3). Policies enqueue
//! tasks; the worker thread is the only place that ever calls
//! `move_pages`/`process_madvise`.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    addr::range::PAGE_SIZE,
    deps::{
        crossbeam_channel::{self, Receiver, Sender},
        log::{debug, warn},
        parking_lot::Mutex,
        serde,
    },
    error::Error,
    node::Node,
    osaccess::{madvise, movepages},
};

/// `{interval_ms, bandwidth_MBps}` — the worker's pacing knobs (spec.md
/// §4.3, §6).
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MoverConfig {
    pub interval_ms:    u64,
    pub bandwidth_mbps: u64,
}

impl MoverConfig {
    /// `count = bandwidth·1024·1024 / PAGE · interval_ms / 1000`
    pub fn page_budget(&self) -> u64 {
        let bytes_per_sec = self.bandwidth_mbps * 1024 * 1024;
        let pages_per_sec = bytes_per_sec / PAGE_SIZE as u64;
        pages_per_sec * self.interval_ms / 1000
    }
}

impl Default for MoverConfig {
    fn default() -> Self {
        MoverConfig { interval_ms: 100, bandwidth_mbps: 100 }
    }
}

/// A pending migration of `pages[offset..]` to node `to`. `to ==
/// Node::UNDEFINED` stands for "no destination was resolved" (spec.md
/// §4.3's "destinations list empty") and the task is dropped without being
/// attempted.
#[derive(Clone, Debug)]
pub struct MoverTask {
    pub pid:    usize,
    pub pages:  Vec<u64>,
    pub to:     Node,
    pub offset: usize,
}

impl MoverTask {
    pub fn new(pid: usize, pages: Vec<u64>, to: Node) -> Self {
        MoverTask { pid, pages, to, offset: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.pages.len()
    }
}

/// Outcome of one worker iteration against the popped task, for logging and
/// testing (spec.md §4.3, §8: offset invariant, `Done` reachability).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Done,
    NoDestinations,
    InProgress,
}

/// `Continue`/`Pause`/`Quit`, sent on the worker's control channel (spec.md
/// §4.3). Pushing a task always signals `Continue`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    Pause,
    Quit,
}

struct Queue {
    tasks: Vec<MoverTask>,
}

/// Handle to the running mover worker thread. Dropping the handle does not
/// stop the worker -- call [`MoverHandle::stop`] explicitly.
pub struct MoverHandle {
    queue:          Arc<Mutex<Queue>>,
    control:        Sender<Control>,
    join:           Option<JoinHandle<()>>,
    /// Runtime override for the per-tick page budget (prompt's `mover
    /// -pages-to N`, spec.md §6); `0` means "use `config.page_budget()`".
    pages_override: Arc<AtomicU64>,
}

impl MoverHandle {
    /// Spawns the worker thread and returns a handle to it.
    pub fn spawn(config: MoverConfig) -> Self {
        let queue = Arc::new(Mutex::new(Queue { tasks: Vec::new() }));
        let pages_override = Arc::new(AtomicU64::new(0));
        let (tx, rx) = crossbeam_channel::unbounded();

        let worker_queue = Arc::clone(&queue);
        let worker_override = Arc::clone(&pages_override);
        let join = thread::spawn(move || run_worker(worker_queue, rx, config, worker_override));

        MoverHandle { queue, control: tx, join: Some(join), pages_override }
    }

    /// Pushes a task onto the tail of the LIFO queue and signals `Continue`.
    pub fn add_task(&self, task: MoverTask) {
        self.queue.lock().tasks.push(task);
        let _ = self.control.send(Control::Continue);
    }

    pub fn pause(&self) {
        let _ = self.control.send(Control::Pause);
    }

    pub fn resume(&self) {
        let _ = self.control.send(Control::Continue);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    /// Snapshot of the currently queued tasks, for the prompt's `mover
    /// -tasks`.
    pub fn tasks(&self) -> Vec<MoverTask> {
        self.queue.lock().tasks.clone()
    }

    /// Removes and returns the queued task at `idx`, for `mover
    /// -remove-task ID` (spec.md §6); `idx` indexes the snapshot returned
    /// by [`MoverHandle::tasks`].
    pub fn remove_task_at(&self, idx: usize) -> Option<MoverTask> {
        let mut queue = self.queue.lock();
        if idx < queue.tasks.len() {
            Some(queue.tasks.remove(idx))
        } else {
            None
        }
    }

    /// Overrides the worker's per-tick page budget (`mover -pages-to N`);
    /// `0` reverts to the configured bandwidth formula.
    pub fn set_pages_override(&self, pages: u64) {
        self.pages_override.store(pages, Ordering::Relaxed);
    }

    /// Sends `Quit` and blocks until the worker observes it and exits.
    pub fn stop(&mut self) {
        let _ = self.control.send(Control::Quit);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for MoverHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop();
        }
    }
}

fn run_worker(queue: Arc<Mutex<Queue>>, control: Receiver<Control>, config: MoverConfig, pages_override: Arc<AtomicU64>) {
    let mut paused = false;

    loop {
        if paused {
            match control.recv() {
                Ok(Control::Quit) | Err(_) => return,
                Ok(Control::Continue) => paused = false,
                Ok(Control::Pause) => continue,
            }
            continue;
        }

        match control.try_recv() {
            Ok(Control::Quit) => return,
            Ok(Control::Pause) => {
                paused = true;
                continue;
            }
            Ok(Control::Continue) | Err(crossbeam_channel::TryRecvError::Empty) => {}
            Err(crossbeam_channel::TryRecvError::Disconnected) => return,
        }

        let overridden = pages_override.load(Ordering::Relaxed);
        let budget = if overridden > 0 { overridden } else { config.page_budget().max(1) };
        let popped = queue.lock().tasks.pop();

        let Some(mut task) = popped else {
            thread::sleep(Duration::from_millis(config.interval_ms));
            continue;
        };

        match tick(&mut task, budget) {
            TickOutcome::InProgress => queue.lock().tasks.push(task),
            TickOutcome::Done => debug!("mover: task for pid {} done", task.pid),
            TickOutcome::NoDestinations => warn!("mover: task for pid {} had no destination, dropped", task.pid),
        }

        thread::sleep(Duration::from_millis(config.interval_ms));
    }
}

/// One iteration of the algorithm in spec.md §4.3 against an already-popped
/// task. Exposed standalone so it is unit-testable without a live worker
/// thread.
pub fn tick(task: &mut MoverTask, budget: u64) -> TickOutcome {
    if task.is_done() {
        return TickOutcome::Done;
    }

    if task.to.is_undefined() {
        return TickOutcome::NoDestinations;
    }

    let end = (task.offset + budget as usize).min(task.pages.len());
    let slice = &task.pages[task.offset..end];

    if let Err(err) = migrate(task.pid, slice, task.to) {
        warn!("mover: move_pages failed for pid {}: {}", task.pid, err);
    }

    task.offset = end;

    if task.is_done() {
        TickOutcome::Done
    } else {
        TickOutcome::InProgress
    }
}

fn migrate(pid: usize, pages: &[u64], to: Node) -> Result<(), Error> {
    if to.is_swap() {
        let ranges = crate::addr::range::AddrRanges::new(
            pid,
            pages.iter().map(|&addr| crate::addr::range::AddrRange::one_page(addr)).collect(),
        );
        let pidfd = madvise::Pidfd::open(pid as i32)?;
        madvise::process_madvise(&pidfd, &ranges, madvise::MADV_PAGEOUT)?;
        return Ok(());
    }

    let dest = vec![to; pages.len()];
    movepages::move_pages(pid as i32, pages, Some(&dest), movepages::MPOL_MF_MOVE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_advances_offset_by_budget() {
        let mut task = MoverTask::new(1, vec![0x1000, 0x2000, 0x3000, 0x4000], Node::new(0));
        let outcome = tick(&mut task, 2);
        assert_eq!(outcome, TickOutcome::InProgress);
        assert_eq!(task.offset, 2);
    }

    #[test]
    fn tick_reaches_done() {
        let mut task = MoverTask::new(1, vec![0x1000], Node::new(0));
        let outcome = tick(&mut task, 100);
        assert_eq!(outcome, TickOutcome::Done);
        assert_eq!(task.offset, 1);
    }

    #[test]
    fn tick_on_already_done_task_is_done() {
        let mut task = MoverTask::new(1, vec![], Node::new(0));
        assert_eq!(tick(&mut task, 10), TickOutcome::Done);
    }

    #[test]
    fn tick_with_undefined_destination_drops() {
        let mut task = MoverTask::new(1, vec![0x1000], Node::UNDEFINED);
        assert_eq!(tick(&mut task, 10), TickOutcome::NoDestinations);
        assert_eq!(task.offset, 0);
    }

    #[test]
    fn page_budget_matches_formula() {
        let cfg = MoverConfig { interval_ms: 1000, bandwidth_mbps: 1 };
        assert_eq!(cfg.page_budget(), 1024 * 1024 / PAGE_SIZE as u64);
    }

    #[test]
    fn handle_pauses_before_tasks_drain() {
        let mut handle = MoverHandle::spawn(MoverConfig { interval_ms: 5, bandwidth_mbps: 1 });
        handle.pause();
        handle.add_task(MoverTask::new(1, vec![0x1000], Node::new(0)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.pending(), 1);
        handle.stop();
    }

    #[test]
    fn remove_task_at_drops_the_indexed_task() {
        let mut handle = MoverHandle::spawn(MoverConfig { interval_ms: 5, bandwidth_mbps: 1 });
        handle.pause();
        handle.add_task(MoverTask::new(1, vec![0x1000], Node::new(0)));
        handle.add_task(MoverTask::new(2, vec![0x2000], Node::new(0)));
        std::thread::sleep(Duration::from_millis(20));

        let removed = handle.remove_task_at(0).unwrap();
        assert_eq!(handle.pending(), 1);
        assert!(removed.pid == 1 || removed.pid == 2);
        handle.stop();
    }
}
