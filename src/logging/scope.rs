//! Logging scopes shared across sinks.
//!
//! Scopes follow the logical call chain: inside a tokio task a scope belongs
//! to that task, even across `.await` points and worker thread moves.
//! Outside a task it belongs to the current thread. Spawned tasks start with
//! no scopes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Owner of one scope stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ScopeKey {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl ScopeKey {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => ScopeKey::Task(id),
            None => ScopeKey::Thread(thread::current().id()),
        }
    }
}

/// Holds the open scopes for one family of loggers.
#[derive(Debug, Default)]
pub struct ScopeProvider {
    next_id: AtomicU64,
    stacks: Mutex<HashMap<ScopeKey, Vec<(u64, String)>>>,
}

impl ScopeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a scope on the current task (or thread). It closes when the guard drops.
    pub fn begin(self: &Arc<Self>, state: impl fmt::Display) -> ScopeGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = ScopeKey::current();

        self.lock()
            .entry(key)
            .or_default()
            .push((id, state.to_string()));

        ScopeGuard {
            provider: Arc::clone(self),
            key,
            id,
        }
    }

    /// Scopes open on the current task (or thread), outermost first.
    pub fn current(&self) -> Vec<String> {
        self.lock()
            .get(&ScopeKey::current())
            .map(|stack| stack.iter().map(|(_, state)| state.clone()).collect())
            .unwrap_or_default()
    }

    fn close(&self, key: ScopeKey, id: u64) {
        let mut stacks = self.lock();
        if let Some(stack) = stacks.get_mut(&key) {
            stack.retain(|(scope_id, _)| *scope_id != id);
            if stack.is_empty() {
                stacks.remove(&key);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ScopeKey, Vec<(u64, String)>>> {
        self.stacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Closes its scope on drop.
#[must_use = "the scope closes as soon as the guard is dropped"]
pub struct ScopeGuard {
    provider: Arc<ScopeProvider>,
    key: ScopeKey,
    id: u64,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.provider.close(self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    #[test]
    fn test_nested_scopes() {
        let scopes = ScopeProvider::new();

        let outer = scopes.begin("request 42");
        {
            let _inner = scopes.begin("step validate");
            assert_eq!(scopes.current(), vec!["request 42", "step validate"]);
        }
        assert_eq!(scopes.current(), vec!["request 42"]);

        drop(outer);
        assert!(scopes.current().is_empty());
    }

    #[test]
    fn test_out_of_order_drop() {
        let scopes = ScopeProvider::new();
        let a = scopes.begin("a");
        let b = scopes.begin("b");

        drop(a);
        assert_eq!(scopes.current(), vec!["b"]);
        drop(b);
        assert!(scopes.current().is_empty());
    }

    #[test]
    fn test_scopes_isolated_per_thread() {
        let scopes = ScopeProvider::new();
        let _guard = scopes.begin("main");

        let other = {
            let scopes = scopes.clone();
            thread::spawn(move || scopes.current())
        };

        assert!(other.join().unwrap().is_empty());
        assert_eq!(scopes.current(), vec!["main"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_scope_held_across_await_stays_with_its_task() {
        let scopes = ScopeProvider::new();
        let opened = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let holder = {
            let scopes = scopes.clone();
            let opened = opened.clone();
            let release = release.clone();
            tokio::spawn(async move {
                let _guard = scopes.begin("request A");
                opened.notify_one();
                release.notified().await;
                scopes.current()
            })
        };

        opened.notified().await;
        let observer = {
            let scopes = scopes.clone();
            tokio::spawn(async move { scopes.current() })
        };
        let seen_by_other_task = observer.await.unwrap();
        release.notify_one();
        let seen_by_holder = holder.await.unwrap();

        assert!(seen_by_other_task.is_empty());
        assert_eq!(seen_by_holder, vec!["request A"]);
        assert!(scopes.current().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scope_follows_task_across_threads() {
        let scopes = ScopeProvider::new();

        let seen = {
            let scopes = scopes.clone();
            tokio::spawn(async move {
                let _guard = scopes.begin("request B");
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                scopes.current()
            })
        };

        assert_eq!(seen.await.unwrap(), vec!["request B"]);
        assert!(scopes.lock().is_empty());
    }
}
