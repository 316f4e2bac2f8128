//! Identity cache guarding against duplicate stream lifecycles.
//!
//! Watch providers redeliver events as a matter of course, so every start
//! and stop decision funnels through [`DedupCache::check_and_mark`]: of all
//! concurrent callers proposing the same transition for the same container,
//! exactly one observes `changed = true` and acts on it.
//!
//! The cache is bounded. Eviction follows the least recently touched entry,
//! approximated with a generation queue so touches never reorder a list.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use podtail_types::{ContainerRef, PodId, TailState};

/// Outcome of a proposed state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State the entry held before the call, if it was cached at all.
    pub previous: Option<TailState>,
    /// Whether this call performed the transition.
    pub changed: bool,
}

struct Entry {
    state: TailState,
    generation: u64,
}

struct DedupInner {
    entries: HashMap<ContainerRef, Entry>,
    /// Touch log; only the tuple matching an entry's current generation is
    /// live, older tuples for the same ref are stale and skipped.
    recency: VecDeque<(ContainerRef, u64)>,
    next_generation: u64,
}

/// Bounded, concurrency-safe map from container identity to tail state.
pub struct DedupCache {
    inner: Mutex<DedupInner>,
    capacity: usize,
}

impl DedupCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(DedupInner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                next_generation: 0,
            }),
            capacity,
        }
    }

    /// Propose moving `target` to `state`.
    ///
    /// The entry is touched either way; `changed` is true only when the
    /// stored state actually moved. A previously unseen target always
    /// reports `changed = true` with no previous state.
    pub fn check_and_mark(&self, target: &ContainerRef, state: TailState) -> Transition {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let transition = match inner.entries.get_mut(target) {
            Some(entry) => {
                let previous = entry.state;
                let changed = previous != state;
                entry.state = state;
                entry.generation = generation;
                Transition {
                    previous: Some(previous),
                    changed,
                }
            }
            None => {
                inner
                    .entries
                    .insert(target.clone(), Entry { state, generation });
                Transition {
                    previous: None,
                    changed: true,
                }
            }
        };
        inner.recency.push_back((target.clone(), generation));

        while inner.entries.len() > self.capacity {
            match inner.recency.pop_front() {
                Some((victim, r#gen)) => {
                    let live = inner
                        .entries
                        .get(&victim)
                        .is_some_and(|e| e.generation == r#gen);
                    if live {
                        inner.entries.remove(&victim);
                    }
                }
                None => break,
            }
        }
        if inner.recency.len() > inner.entries.len() * 2 + 16 {
            let entries = &inner.entries;
            inner
                .recency
                .retain(|(r, g)| entries.get(r).is_some_and(|e| e.generation == *g));
        }

        transition
    }

    /// Undo a transition that will not be acted on.
    ///
    /// `previous` is the value returned by the matching
    /// [`check_and_mark`](Self::check_and_mark) call; `None` removes the
    /// entry again.
    pub fn restore(&self, target: &ContainerRef, previous: Option<TailState>) {
        let mut inner = self.inner.lock();
        match previous {
            Some(state) => {
                if let Some(entry) = inner.entries.get_mut(target) {
                    entry.state = state;
                }
            }
            None => {
                inner.entries.remove(target);
            }
        }
    }

    /// Drop every entry belonging to `pod`.
    pub fn forget_pod(&self, pod: &PodId) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|r, _| r.pod != *pod);
    }

    #[must_use]
    pub fn state_of(&self, target: &ContainerRef) -> Option<TailState> {
        self.inner.lock().entries.get(target).map(|e| e.state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
