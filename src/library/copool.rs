//! Cooperative scheduling of long-running library work.
//!
//! Rebuilds, scans and watch setup are plain iterators that do a bounded
//! slice of work per `next()`. `CoPool` resumes a set of them round-robin so a
//! host loop can interleave them with event handling, and can pause or
//! cancel any of them by name. Removing a task drops it, which is how work
//! is cancelled.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// What a resumable task is busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Re-checking masked mount points.
    Mounts,
    /// Validating known items.
    Check,
    /// Walking directories for new files.
    Walk,
    /// Loading and adding new files.
    Load,
    /// Re-rooting items after a directory move.
    Move,
    /// Removing items under dropped roots.
    Remove,
    /// Installing directory watches.
    Watch,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Mounts => "mounts",
            Phase::Check => "check",
            Phase::Walk => "walk",
            Phase::Load => "load",
            Phase::Move => "move",
            Phase::Remove => "remove",
            Phase::Watch => "watch",
        };
        f.write_str(name)
    }
}

/// Yielded by every resumable task at each pause point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub phase: Phase,
    pub done: usize,
    pub total: Option<usize>,
}

impl Progress {
    pub fn new(phase: Phase, done: usize, total: Option<usize>) -> Self {
        Self { phase, done, total }
    }

    /// Completed fraction, when the total is known.
    pub fn fraction(&self) -> Option<f32> {
        self.total.map(|total| {
            if total == 0 {
                1.0
            } else {
                (self.done as f32 / total as f32).min(1.0)
            }
        })
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "{} {}/{}", self.phase, self.done, total),
            None => write!(f, "{} {}", self.phase, self.done),
        }
    }
}

/// A boxed resumable task.
pub type Task<'a> = Box<dyn Iterator<Item = Progress> + 'a>;

struct Slot<'a> {
    id: String,
    paused: bool,
    last: Option<Progress>,
    task: Task<'a>,
}

/// Round-robin runner for named resumable tasks.
#[derive(Default)]
pub struct CoPool<'a> {
    slots: VecDeque<Slot<'a>>,
}

impl<'a> CoPool<'a> {
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
        }
    }

    /// Queue `task` under `id`. An existing task with the same id is dropped.
    pub fn add(&mut self, id: impl Into<String>, task: impl Iterator<Item = Progress> + 'a) {
        let id = id.into();
        self.remove(&id);
        tracing::debug!(target: "library", task = %id, "Task queued");
        self.slots.push_back(Slot {
            id,
            paused: false,
            last: None,
            task: Box::new(task),
        });
    }

    /// Cancel a task. Returns false if there was none.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.id != id);
        self.slots.len() != before
    }

    pub fn pause(&mut self, id: &str) -> bool {
        self.set_paused(id, true)
    }

    pub fn resume(&mut self, id: &str) -> bool {
        self.set_paused(id, false)
    }

    fn set_paused(&mut self, id: &str, paused: bool) -> bool {
        match self.slots.iter_mut().find(|slot| slot.id == id) {
            Some(slot) => {
                slot.paused = paused;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.iter().any(|slot| slot.id == id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// No task is runnable (all finished or paused).
    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|slot| slot.paused)
    }

    /// Last progress reported by a task.
    pub fn progress(&self, id: &str) -> Option<Progress> {
        self.slots
            .iter()
            .find(|slot| slot.id == id)
            .and_then(|slot| slot.last)
    }

    /// Resume the next runnable task once.
    ///
    /// Returns false when nothing was runnable.
    pub fn step(&mut self) -> bool {
        let Some(index) = self.slots.iter().position(|slot| !slot.paused) else {
            return false;
        };
        let Some(mut slot) = self.slots.remove(index) else {
            return false;
        };
        match slot.task.next() {
            Some(progress) => {
                slot.last = Some(progress);
                self.slots.push_back(slot);
            }
            None => {
                tracing::debug!(target: "library", task = %slot.id, "Task finished");
            }
        }
        true
    }

    /// Step tasks until `budget` is spent or nothing is runnable.
    pub fn run_for(&mut self, budget: Duration) -> usize {
        let start = Instant::now();
        let mut steps = 0;
        while start.elapsed() < budget && self.step() {
            steps += 1;
        }
        steps
    }

    /// Step tasks until every runnable task has finished.
    pub fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while self.step() {
            steps += 1;
        }
        steps
    }
}

impl fmt::Debug for CoPool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.slots.iter().map(|slot| slot.id.as_str()).collect();
        f.debug_struct("CoPool").field("tasks", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn counting(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str, steps: usize) -> Task<'static> {
        let log = Rc::clone(log);
        Box::new((0..steps).map(move |i| {
            log.borrow_mut().push(name);
            Progress::new(Phase::Check, i + 1, Some(steps))
        }))
    }

    #[test]
    fn test_round_robin() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pool = CoPool::new();
        pool.add("a", counting(&log, "a", 2));
        pool.add("b", counting(&log, "b", 1));

        pool.run_until_idle();
        assert_eq!(*log.borrow(), vec!["a", "b", "a"]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pause_and_resume() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pool = CoPool::new();
        pool.add("a", counting(&log, "a", 3));
        pool.add("b", counting(&log, "b", 1));
        assert!(pool.pause("a"));

        pool.run_until_idle();
        assert_eq!(*log.borrow(), vec!["b"]);
        assert!(pool.is_idle());
        assert!(pool.contains("a"));

        pool.resume("a");
        pool.step();
        assert_eq!(pool.progress("a"), Some(Progress::new(Phase::Check, 1, Some(3))));
    }

    #[test]
    fn test_add_same_id_replaces() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pool = CoPool::new();
        pool.add("scan", counting(&log, "old", 5));
        pool.add("scan", counting(&log, "new", 1));

        assert_eq!(pool.len(), 1);
        pool.run_until_idle();
        assert_eq!(*log.borrow(), vec!["new"]);
    }

    #[test]
    fn test_remove_cancels() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pool = CoPool::new();
        pool.add("a", counting(&log, "a", 5));
        pool.step();
        assert!(pool.remove("a"));
        assert!(!pool.step());
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_progress_display() {
        let progress = Progress::new(Phase::Walk, 3, None);
        assert_eq!(progress.to_string(), "walk 3");
        assert_eq!(Progress::new(Phase::Load, 5, Some(0)).fraction(), Some(1.0));
    }
}
