//! Keeps forked children away from the parent's compiler pipes.
//!
//! After `fork`, a child process holds duplicates of every pipe the parent
//! opened to its compilers. If the child reads from or closes them, the
//! parent sees corrupt reads or premature EOF. The embedding application
//! brackets its `fork` calls with [`ForkRegistry::before_fork`] and one of
//! the [`ForkGuard`] hooks; in the child every registered connection has its
//! descriptors pointed at `/dev/null` and is marked closed.
//!
//! ```ignore
//! let guard = registry.before_fork()?;
//! match unsafe { nix::unistd::fork() }? {
//!     ForkResult::Child => guard.after_fork_in_child(),
//!     ForkResult::Parent { .. } => guard.after_fork_in_parent(),
//! }
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

/// Log target for fork bookkeeping.
const FORK_TARGET: &str = "sass_embedded_host::fork";

/// Something that owns descriptors a forked child must let go of.
pub trait ForkAware: Send + Sync {
    /// Redirects the owned descriptors to `null` and stops using them.
    ///
    /// Runs in the child between `fork` and any other work, so it must not
    /// take locks that a parent thread could have held at fork time.
    ///
    /// # Errors
    ///
    /// Returns the `dup2` failure, if any.
    fn detach_in_child(&self, null: BorrowedFd<'_>) -> nix::Result<()>;
}

/// Registry of live descriptor owners, shared by everything that spawns
/// compilers for one application.
#[derive(Default)]
pub struct ForkRegistry {
    entries: Mutex<Vec<Weak<dyn ForkAware>>>,
}

impl ForkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tracks `entry` until it is dropped.
    pub fn register(&self, entry: Weak<dyn ForkAware>) {
        let mut entries = self.lock();
        entries.retain(|existing| existing.strong_count() > 0);
        entries.push(entry);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Returns `true` when no live entry is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prepares for `fork`: opens `/dev/null` and holds the registry lock so
    /// no entry is added or removed while the process image is copied.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if `/dev/null` cannot be opened.
    pub fn before_fork(&self) -> io::Result<ForkGuard<'_>> {
        let null = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")?;
        let entries = self.lock();
        Ok(ForkGuard { entries, null })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<dyn ForkAware>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Registry state held across a `fork` call.
pub struct ForkGuard<'a> {
    entries: MutexGuard<'a, Vec<Weak<dyn ForkAware>>>,
    null: File,
}

impl ForkGuard<'_> {
    /// Releases the registry in the parent. Connections are untouched.
    pub fn after_fork_in_parent(self) {
        drop(self);
    }

    /// Detaches every live entry in the child and releases the registry.
    ///
    /// Returns the number of entries detached.
    pub fn after_fork_in_child(mut self) -> usize {
        let mut detached = 0;
        for entry in self.entries.iter().filter_map(Weak::upgrade) {
            match entry.detach_in_child(self.null.as_fd()) {
                Ok(()) => detached += 1,
                Err(error) => warn!(
                    target: FORK_TARGET,
                    error = %error,
                    "failed to detach compiler pipes after fork"
                ),
            }
        }
        self.entries.clear();
        debug!(
            target: FORK_TARGET,
            detached,
            "detached compiler connections in forked child"
        );
        detached
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    #[derive(Default)]
    struct Counting {
        detached: AtomicUsize,
    }

    impl ForkAware for Counting {
        fn detach_in_child(&self, _null: BorrowedFd<'_>) -> nix::Result<()> {
            self.detached.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn register(registry: &ForkRegistry, entry: &Arc<Counting>) {
        let weak: Weak<dyn ForkAware> = Arc::downgrade(entry) as Weak<dyn ForkAware>;
        registry.register(weak);
    }

    #[rstest]
    fn dropped_entries_are_not_counted() {
        let registry = ForkRegistry::new();
        let kept = Arc::new(Counting::default());
        let dropped = Arc::new(Counting::default());
        register(&registry, &kept);
        register(&registry, &dropped);

        drop(dropped);

        assert_eq!(registry.len(), 1);
    }

    #[rstest]
    fn parent_hook_leaves_entries_alone() {
        let registry = ForkRegistry::new();
        let entry = Arc::new(Counting::default());
        register(&registry, &entry);

        registry
            .before_fork()
            .expect("open /dev/null")
            .after_fork_in_parent();

        assert_eq!(entry.detached.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[rstest]
    fn child_hook_detaches_every_live_entry() {
        let registry = ForkRegistry::new();
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        register(&registry, &first);
        register(&registry, &second);

        let detached = registry
            .before_fork()
            .expect("open /dev/null")
            .after_fork_in_child();

        assert_eq!(detached, 2);
        assert_eq!(first.detached.load(Ordering::SeqCst), 1);
        assert_eq!(second.detached.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
