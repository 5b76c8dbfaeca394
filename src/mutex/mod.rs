//! Named-mutex manager with deadlock detection and fair queueing.
//!
//! Plugins that touch the same system resource (a package database, a
//! runtime, an application) declare a named mutex for it. The manager grants
//! a plugin's whole mutex set atomically: either every requested mutex is
//! free and they are all taken in one step, or the request queues. No
//! partial holds are ever visible.
//!
//! Fairness is FIFO with reservation: during a grant scan, a waiter that
//! cannot be granted reserves the free mutexes it needs, so a later waiter
//! cannot overtake it on any of them.

use crate::errors::MutexError;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Mutex categories with defined meaning across plugin configurations.
pub const RESERVED_CATEGORIES: &[&str] = &["pkgmgr", "runtime", "app", "system"];

const NAME_MAX_LEN: usize = 64;

/// A validated mutex identifier of the form `category:resource`.
///
/// Both parts are lowercase alphanumeric plus `-` and `_`; the whole
/// identifier is at most 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(String);

impl MutexId {
    pub fn new(name: &str) -> Result<Self, MutexError> {
        if name.len() > NAME_MAX_LEN {
            return Err(MutexError::InvalidName(name.to_string()));
        }
        let mut parts = name.splitn(2, ':');
        let category = parts.next().unwrap_or_default();
        let resource = parts.next().unwrap_or_default();
        if category.is_empty() || resource.is_empty() {
            return Err(MutexError::InvalidName(name.to_string()));
        }
        let valid_part = |s: &str| {
            s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        };
        if !valid_part(category) || !valid_part(resource) {
            return Err(MutexError::InvalidName(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn category(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Waiter {
    id: u64,
    owner: String,
    mutexes: BTreeSet<MutexId>,
    grant_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    held: HashMap<MutexId, String>,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl Inner {
    fn all_free(&self, mutexes: &BTreeSet<MutexId>) -> bool {
        mutexes.iter().all(|m| !self.held.contains_key(m))
    }

    fn hold_all(&mut self, owner: &str, mutexes: &BTreeSet<MutexId>) {
        for m in mutexes {
            self.held.insert(m.clone(), owner.to_string());
        }
    }

    /// Scan the wait queue in FIFO order, granting every waiter whose full
    /// set is available. Ungrantable waiters reserve the free mutexes they
    /// need so later waiters cannot steal them.
    fn grant_scan(&mut self) {
        let mut reserved: HashSet<MutexId> = HashSet::new();
        let mut remaining: VecDeque<Waiter> = VecDeque::with_capacity(self.queue.len());
        while let Some(waiter) = self.queue.pop_front() {
            let grantable = waiter
                .mutexes
                .iter()
                .all(|m| !self.held.contains_key(m) && !reserved.contains(m));
            if grantable {
                let mutexes = waiter.mutexes.clone();
                let owner = waiter.owner.clone();
                // A dropped receiver means the acquire timed out; skip the
                // grant and leave the mutexes free.
                if waiter.grant_tx.send(()).is_ok() {
                    self.hold_all(&owner, &mutexes);
                }
            } else {
                for m in &waiter.mutexes {
                    if !self.held.contains_key(m) {
                        reserved.insert(m.clone());
                    }
                }
                remaining.push_back(waiter);
            }
        }
        self.queue = remaining;
    }

    /// Build the wait-for graph and look for a cycle that includes a
    /// candidate request from `owner` for `mutexes`.
    ///
    /// Edges: a waiting owner waits for the current holder of each mutex it
    /// has requested. Returns the cycle participants if one exists.
    fn find_cycle(&self, owner: &str, mutexes: &BTreeSet<MutexId>) -> Option<Vec<String>> {
        fn push(
            graph: &mut HashMap<String, HashSet<String>>,
            from: &str,
            wanted: &BTreeSet<MutexId>,
            held: &HashMap<MutexId, String>,
        ) {
            for m in wanted {
                if let Some(holder) = held.get(m) {
                    if holder != from {
                        graph
                            .entry(from.to_string())
                            .or_default()
                            .insert(holder.clone());
                    }
                }
            }
        }

        let mut graph: HashMap<String, HashSet<String>> = HashMap::new();
        push(&mut graph, owner, mutexes, &self.held);
        for waiter in &self.queue {
            push(&mut graph, &waiter.owner, &waiter.mutexes, &self.held);
        }

        // DFS from `owner`: a path back to `owner` is a deadlock cycle.
        let mut path: Vec<String> = vec![owner.to_string()];
        let mut visited: HashSet<String> = HashSet::new();
        if Self::dfs_cycle(owner, owner, &graph, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_cycle(
        current: &str,
        target: &str,
        graph: &HashMap<String, HashSet<String>>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        let Some(next) = graph.get(current) else {
            return false;
        };
        for n in next {
            if n == target {
                return true;
            }
            if visited.insert(n.clone()) {
                path.push(n.clone());
                if Self::dfs_cycle(n, target, graph, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }
}

/// Process-wide named-lock service.
///
/// All operations take a single short critical section; waiting happens
/// outside the lock on a oneshot grant channel.
pub struct MutexManager {
    inner: Mutex<Inner>,
}

impl Default for MutexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Acquire every mutex in `mutexes` atomically, waiting up to `timeout`.
    ///
    /// Fails fast with [`MutexError::Deadlock`] when queueing this request
    /// would close a wait-for cycle; the caller is expected to release
    /// whatever it holds and back off.
    pub async fn acquire(
        &self,
        owner: &str,
        mutexes: &[MutexId],
        timeout: Duration,
    ) -> Result<(), MutexError> {
        if mutexes.is_empty() {
            return Ok(());
        }
        let set: BTreeSet<MutexId> = mutexes.iter().cloned().collect();

        let (waiter_id, mut grant_rx) = {
            let mut inner = self.inner.lock().expect("mutex manager poisoned");
            if inner.all_free(&set) {
                inner.hold_all(owner, &set);
                return Ok(());
            }
            if let Some(participants) = inner.find_cycle(owner, &set) {
                tracing::warn!(owner, ?participants, "mutex deadlock detected, aborting acquire");
                return Err(MutexError::Deadlock { participants });
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.queue.push_back(Waiter {
                id,
                owner: owner.to_string(),
                mutexes: set.clone(),
                grant_tx: tx,
            });
            (id, rx)
        };

        tokio::select! {
            granted = &mut grant_rx => {
                match granted {
                    Ok(()) => Ok(()),
                    // The manager never drops a queued sender except through
                    // timeout removal below, so this arm is unreachable in
                    // practice; treat it as a timeout.
                    Err(_) => Err(MutexError::Timeout {
                        mutexes: set.iter().map(|m| m.to_string()).collect(),
                        timeout_secs: timeout.as_secs(),
                    }),
                }
            }
            _ = tokio::time::sleep(timeout) => {
                let mut inner = self.inner.lock().expect("mutex manager poisoned");
                let was_queued = inner.queue.iter().any(|w| w.id == waiter_id);
                if was_queued {
                    inner.queue.retain(|w| w.id != waiter_id);
                    Err(MutexError::Timeout {
                        mutexes: set.iter().map(|m| m.to_string()).collect(),
                        timeout_secs: timeout.as_secs(),
                    })
                } else {
                    // Grant raced with the timeout; the holds are already
                    // ours.
                    Ok(())
                }
            }
        }
    }

    /// Release mutexes held by `owner`. Releasing a mutex the owner does not
    /// hold is logged and ignored.
    pub fn release(&self, owner: &str, mutexes: &[MutexId]) {
        let mut inner = self.inner.lock().expect("mutex manager poisoned");
        for m in mutexes {
            match inner.held.get(m).cloned() {
                Some(current) if current == owner => {
                    inner.held.remove(m);
                }
                Some(current) => {
                    tracing::warn!(
                        mutex = %m,
                        owner,
                        holder = %current,
                        "illegal release: mutex held by another owner"
                    );
                }
                None => {
                    tracing::warn!(mutex = %m, owner, "illegal release: mutex not held");
                }
            }
        }
        inner.grant_scan();
    }

    /// Current holder of a mutex, if any.
    pub fn holder(&self, mutex: &MutexId) -> Option<String> {
        let inner = self.inner.lock().expect("mutex manager poisoned");
        inner.held.get(mutex).cloned()
    }

    /// Number of requests currently queued.
    pub fn waiting_count(&self) -> usize {
        let inner = self.inner.lock().expect("mutex manager poisoned");
        inner.queue.len()
    }
}
