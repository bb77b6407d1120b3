//! Change notifications.
//!
//! After each refresh, [`NotifyService`] computes the [`Diff`] between the previous and the new
//! flag set and hands it to every configured [`Notifier`] on its own thread.
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::{
    flag::{Diff, FlagSet},
    Result,
};

mod local;
mod webhook;

pub use local::LogNotifier;
pub use webhook::WebhookNotifier;

/// A sink for flag set changes.
pub trait Notifier {
    fn notify(&self, diff: &Diff) -> Result<()>;
}

impl<T: Fn(&Diff) -> Result<()>> Notifier for T {
    fn notify(&self, diff: &Diff) -> Result<()> {
        self(diff)
    }
}

/// Counts deliveries that have not finished yet.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn start(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(self.clone())
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Marks one delivery finished when dropped, including when the delivery panicked or its
/// thread never started.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Dispatches flag set changes to notifiers.
pub struct NotifyService {
    notifiers: Vec<Arc<dyn Notifier + Send + Sync>>,
    in_flight: Arc<InFlight>,
}

impl NotifyService {
    pub fn new(notifiers: Vec<Arc<dyn Notifier + Send + Sync>>) -> NotifyService {
        NotifyService {
            notifiers,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Notify every sink of the changes between `old` and `new`. Does nothing when the two sets
    /// are equal.
    ///
    /// Returns immediately. Delivery failures are logged.
    pub fn notify(&self, old: &FlagSet, new: &FlagSet) {
        let diff = Diff::between(old, new);
        if !diff.has_diff() {
            return;
        }
        let diff = Arc::new(diff);

        for notifier in &self.notifiers {
            let guard = self.in_flight.start();
            let notifier = notifier.clone();
            let diff = diff.clone();
            let spawned = std::thread::Builder::new()
                .name("flagserve-notify".to_owned())
                .spawn(move || {
                    let _guard = guard;
                    if let Err(err) = notifier.notify(&diff) {
                        log::error!(target: "flagserve", "notify service failed to send message: {}", err);
                    }
                });
            if let Err(err) = spawned {
                log::error!(target: "flagserve", "failed to start notification thread: {}", err);
            }
        }
    }

    /// Block until every delivery started so far has finished.
    pub fn close(&self) {
        self.in_flight.wait();
    }
}
