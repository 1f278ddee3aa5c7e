//! A background thread that runs cache refresh jobs off the caller's thread.
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::{Error, Result};

/// A unit of background work.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// How long shutdown waits for in-flight jobs before abandoning them.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A refresh thread.
///
/// Submitted jobs are run on the blocking pool of a runtime owned by the thread, so a slow store
/// call in one job doesn't hold up the others.
pub(crate) struct RefreshThread {
    join_handle: Option<std::thread::JoinHandle<()>>,
    /// Dropping the sender stops the thread.
    sender: Option<UnboundedSender<Job>>,
}

impl RefreshThread {
    /// Starts the refresh thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread or its runtime failed to start.
    pub fn start() -> std::io::Result<RefreshThread> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (sender, mut receiver) = unbounded_channel::<Job>();

        let join_handle = std::thread::Builder::new()
            .name("flag-engine-refresh".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    runtime.block_on(async {
                        while let Some(job) = receiver.recv().await {
                            tokio::task::spawn_blocking(job);
                        }
                    });
                    log::debug!(target: "flag_engine", "refresh thread received disconnected");
                    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
                }));

                if result.is_err() {
                    log::warn!(target: "flag_engine", "refresh thread panicked");
                }
            })?;

        Ok(RefreshThread {
            join_handle: Some(join_handle),
            sender: Some(sender),
        })
    }

    /// Queue `job` for execution. Returns `false` if the thread has stopped.
    pub fn submit(&self, job: Job) -> bool {
        match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    /// Stop the refresh thread and block waiting for it to exit.
    ///
    /// Jobs already running get a short grace period to complete; queued jobs that haven't
    /// started are dropped.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshThreadPanicked`] if the thread has panicked.
    pub fn shutdown(&mut self) -> Result<()> {
        self.sender = None;

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .join()
                .map_err(|_| Error::RefreshThreadPanicked)?;
        }

        Ok(())
    }
}

impl Drop for RefreshThread {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!(target: "flag_engine", "failed to stop refresh thread: {err}");
        }
    }
}
