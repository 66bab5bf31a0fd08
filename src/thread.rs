use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use log::{error, trace, warn};
use nix::unistd::{SysconfVar, gettid, sysconf};
use parking_lot::RwLock;

use crate::error::Error;

/// Largest stack a tracked thread may ask for; bigger requests are clamped.
pub const MAX_STACK_SIZE: usize = 1024 * 1024;

// kernel comm names are 16 bytes including the terminator
const OS_THREAD_NAME_MAX: usize = 15;
const MIN_PAGE_SIZE: usize = 1024;
const UNKNOWN_PROCESS: &str = "????????";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub name: &'static str,
    pub tid: i32,
    pub id: ThreadId,
}

/// Threads spawned through this registry, tracked from the moment their
/// entry point starts until it returns or unwinds.
#[derive(Debug, Clone)]
pub struct ThreadRegistry {
    threads: Arc<RwLock<Vec<ThreadInfo>>>,
    page_size: usize,
    process_name: Arc<str>,
}

/// Keeps a thread listed while alive; dropping it, on return or on
/// unwinding, takes the thread off the list.
struct Registration {
    threads: Arc<RwLock<Vec<ThreadInfo>>>,
    id: ThreadId,
    name: &'static str,
    process_name: Arc<str>,
}

impl Registration {
    fn enter(
        threads: Arc<RwLock<Vec<ThreadInfo>>>,
        name: &'static str,
        process_name: Arc<str>,
    ) -> Self {
        let id = thread::current().id();
        let tid = gettid().as_raw();
        trace!("thread(create): proc={process_name}, thrd={name}, tid={tid}");

        threads.write().push(ThreadInfo { name, tid, id });
        Self {
            threads,
            id,
            name,
            process_name,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut threads = self.threads.write();
        if let Some(pos) = threads.iter().position(|t| t.id == self.id) {
            threads.remove(pos);
        }
        trace!(
            "thread(exit): proc={}, thrd={}, remaining={}",
            self.process_name,
            self.name,
            threads.len()
        );
    }
}

/// Stack size actually requested from the OS for `requested` bytes.
///
/// Below `min_stack` the stack becomes `min_stack` plus one guard page.
/// Otherwise it is rounded up to a multiple of two pages, one of which is
/// given up to the guard page.
pub fn normalize_stack_size(requested: usize, min_stack: usize, page_size: usize) -> usize {
    if requested < min_stack {
        min_stack + page_size
    } else {
        requested.next_multiple_of(2 * page_size)
    }
}

pub fn min_stack_size() -> usize {
    nix::libc::PTHREAD_STACK_MIN
}

/// Truncates `name` to what the kernel keeps as a thread name.
pub fn os_thread_name(name: &str) -> String {
    let mut end = name.len().min(OS_THREAD_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

fn process_name() -> Arc<str> {
    fs::read_to_string("/proc/self/comm")
        .map(|comm| comm.trim().to_string())
        .unwrap_or_else(|_| UNKNOWN_PROCESS.to_string())
        .into()
}

impl ThreadRegistry {
    pub fn new() -> Result<Self, Error> {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .map_err(|e| Error::General(format!("page size query: {e}")))?
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size >= MIN_PAGE_SIZE)
            .ok_or_else(|| Error::General("page size unavailable".into()))?;

        Ok(Self {
            threads: Arc::new(RwLock::new(Vec::new())),
            page_size,
            process_name: process_name(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    // the guard page itself is placed by the C library under thread::Builder
    pub fn stack_size_for(&self, requested: usize) -> usize {
        normalize_stack_size(requested, min_stack_size(), self.page_size)
    }

    /// Spawns `f` on a new tracked thread.
    ///
    /// `name` is kept as is for tracing and truncated for the OS thread
    /// name. The thread is listed before `f` runs and delisted after it
    /// returns or panics.
    pub fn spawn<F, T>(
        &self,
        name: &'static str,
        stack_size: usize,
        f: F,
    ) -> Result<JoinHandle<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        assert!(!name.is_empty(), "thread name must not be empty");

        let requested = if stack_size > MAX_STACK_SIZE {
            warn!("thread {name}: stack size {stack_size} clamped to {MAX_STACK_SIZE}");
            MAX_STACK_SIZE
        } else {
            stack_size
        };

        let threads = Arc::clone(&self.threads);
        let process = Arc::clone(&self.process_name);
        thread::Builder::new()
            .name(os_thread_name(name))
            .stack_size(self.stack_size_for(requested))
            .spawn(move || {
                let _registration = Registration::enter(threads, name, process);
                f()
            })
            .map_err(|e| {
                error!(
                    "thread(create): proc={}, cannot create {name}: {e}",
                    self.process_name
                );
                Error::General(format!("spawn thread {name}: {e}"))
            })
    }

    pub fn count(&self) -> usize {
        self.threads.read().len()
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.threads.read().clone()
    }
}
