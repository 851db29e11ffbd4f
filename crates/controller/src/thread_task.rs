//! Runs a blocking closure on a dedicated, named OS thread and joins it.
//!
//! The trace driver requires the thread that seizes a tracee to be the same
//! one that later continues and detaches it, so every trace worker gets its
//! own OS thread for its whole lifetime rather than sharing a pool.

use std::thread;

/// Handle to a closure running on a dedicated thread.
pub struct ThreadHandle<T> {
    join_handle: thread::JoinHandle<T>,
    name: String,
}

impl<T> ThreadHandle<T> {
    /// Blocks until the thread finishes, mapping a panic into
    /// [`crate::error::Error::ThreadJoinPanic`].
    pub fn join(self) -> Result<T, crate::error::Error> {
        self.join_handle
            .join()
            .map_err(|panic| crate::error::Error::ThreadJoinPanic {
                thread_name: self.name,
                panic_message: format!("{panic:?}"),
            })
    }
}

/// Spawns `f` on a newly named OS thread.
pub fn spawn_named<T, F>(
    thread_name: impl Into<String>,
    f: F,
) -> Result<ThreadHandle<T>, crate::error::Error>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let name = thread_name.into();
    let join_handle = thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| crate::error::Error::ThreadSpawnError {
            thread_name: name.clone(),
            source,
        })?;
    Ok(ThreadHandle { join_handle, name })
}
