//! Background loops driving periodic work: cache refresh followed by change notification, and
//! export flushing.
use std::{
    sync::{
        mpsc::{RecvTimeoutError, SyncSender},
        Arc,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    cache::FlagCache, config::PollerThreadConfig, export::ExportService, notify::NotifyService,
    Error, Result,
};

/// Work performed by a [`PollerThread`].
pub trait PollerTask {
    /// Called once per interval.
    fn tick(&mut self);

    /// Called once when the loop stops.
    fn close(&mut self);
}

/// Refreshes the flag cache and notifies of the changes.
pub struct RefreshTask {
    cache: Arc<FlagCache>,
    notify: Arc<NotifyService>,
}

impl RefreshTask {
    pub fn new(cache: Arc<FlagCache>, notify: Arc<NotifyService>) -> RefreshTask {
        RefreshTask { cache, notify }
    }
}

impl PollerTask for RefreshTask {
    fn tick(&mut self) {
        log::debug!(target: "flagserve", "refreshing flags");
        match self.cache.refresh() {
            Ok((old, new)) => self.notify.notify(&old, &new),
            // Keep serving the current flags, try again on the next tick.
            Err(err) => log::error!(target: "flagserve", "failed to refresh flags: {}", err),
        }
    }

    fn close(&mut self) {
        self.notify.close();
    }
}

/// Flushes buffered evaluation events.
pub struct FlushTask {
    export: Arc<ExportService>,
}

impl FlushTask {
    pub fn new(export: Arc<ExportService>) -> FlushTask {
        FlushTask { export }
    }
}

impl PollerTask for FlushTask {
    fn tick(&mut self) {
        self.export.flush();
    }

    fn close(&mut self) {
        self.export.close();
    }
}

/// A background thread running a [`PollerTask`] every interval until stopped.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the thread.
    stop_sender: SyncSender<()>,
}

impl PollerThread {
    /// Start a thread named `name`.
    ///
    /// # Errors
    ///
    /// IO error if the thread failed to start.
    pub fn start(
        name: &str,
        config: PollerThreadConfig,
        mut task: impl PollerTask + Send + 'static,
    ) -> std::io::Result<PollerThread> {
        // A buffer of 1 is enough: `stop()` uses `try_send()` and a full buffer means a stop
        // command is already pending.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let thread_name = name.to_owned();
        let join_handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                let timeout = jitter(config.interval, config.jitter);
                match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => task.tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        log::debug!(target: "flagserve", "{} received stop command", thread_name);
                        task.close();
                        return;
                    }
                }
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
        })
    }

    /// Ask the thread to stop. Does not wait for it.
    pub fn stop(&self) {
        // Error means either the thread already exited or a stop command is already pending.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the thread and block until it has run its final `close()` and exited.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)
    }
}

/// Subtract a random jitter of up to `jitter` from `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let jitter = jitter.min(interval);
    interval.saturating_sub(thread_rng().gen_range(Duration::ZERO..=jitter))
}
