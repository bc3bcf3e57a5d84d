//! Repository collaborators and the scoped handle pair a task works on.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// An opened, possibly encrypted, backup repository.
pub trait Repository: Send + Sync {
    /// Configured name the repository was loaded under.
    fn name(&self) -> &str;
    /// Stable identifier of the repository (e.g. its configuration UUID).
    fn id(&self) -> String;
    fn close(&mut self);
}

/// Storage backend underneath a [`Repository`].
pub trait Store: Send + Sync {
    fn location(&self) -> &str;
    fn close(&mut self);
}

/// Opens repositories by name.
///
/// Implementations open the storage, derive the encryption key from the
/// configured passphrase (if any), verify it against the stored canary and
/// build the repository handle. Any failure is returned without leaking an
/// open store.
#[async_trait]
pub trait RepositoryLoader: Send + Sync {
    async fn load(&self, name: &str) -> Result<LoadedRepository>;
}

/// Repository + store pair, closed exactly once on every exit path.
///
/// Closing happens on [`close`](Self::close) or on drop, whichever comes
/// first; the repository is closed before its store.
pub struct LoadedRepository {
    repository: Box<dyn Repository>,
    store: Box<dyn Store>,
    closed: bool,
}

impl LoadedRepository {
    pub fn new(repository: Box<dyn Repository>, store: Box<dyn Store>) -> Self {
        Self {
            repository,
            store,
            closed: false,
        }
    }

    pub fn repository(&self) -> &dyn Repository {
        self.repository.as_ref()
    }

    pub fn store_location(&self) -> &str {
        self.store.location()
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(repository = self.repository.name(), "closing repository");
        self.repository.close();
        self.store.close();
    }
}

impl Drop for LoadedRepository {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory loader that counts every open and close.

    use super::*;
    use crate::error::SchedulerError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    pub struct Counters {
        pub opened: AtomicUsize,
        pub repo_closed: AtomicUsize,
        pub store_closed: AtomicUsize,
        pub fail: AtomicBool,
    }

    impl Counters {
        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
        pub fn repo_closed(&self) -> usize {
            self.repo_closed.load(Ordering::SeqCst)
        }
        pub fn store_closed(&self) -> usize {
            self.store_closed.load(Ordering::SeqCst)
        }
    }

    pub struct FakeRepository {
        pub name: String,
        pub counters: Arc<Counters>,
    }

    impl Repository for FakeRepository {
        fn name(&self) -> &str {
            &self.name
        }
        fn id(&self) -> String {
            format!("id-{}", self.name)
        }
        fn close(&mut self) {
            self.counters.repo_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub struct FakeStore {
        pub counters: Arc<Counters>,
    }

    impl Store for FakeStore {
        fn location(&self) -> &str {
            "mem://"
        }
        fn close(&mut self) {
            self.counters.store_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default, Clone)]
    pub struct FakeLoader {
        pub counters: Arc<Counters>,
    }

    #[async_trait]
    impl RepositoryLoader for FakeLoader {
        async fn load(&self, name: &str) -> Result<LoadedRepository> {
            if self.counters.fail.load(Ordering::SeqCst) {
                return Err(SchedulerError::Repository("invalid passphrase".to_string()));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(LoadedRepository::new(
                Box::new(FakeRepository {
                    name: name.to_string(),
                    counters: Arc::clone(&self.counters),
                }),
                Box::new(FakeStore {
                    counters: Arc::clone(&self.counters),
                }),
            ))
        }
    }
}


impl std::fmt::Debug for LoadedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedRepository")
            .field("repository", &self.repository.name())
            .field("store", &self.store.location())
            .field("closed", &self.closed)
            .finish()
    }
}
