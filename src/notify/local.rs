use crate::{flag::Diff, Result};

use super::Notifier;

/// Writes one log line per changed flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LogNotifier {
    fn messages(diff: &Diff) -> Vec<String> {
        let deleted = diff.deleted.keys().map(|key| format!("flag {key} removed"));
        let added = diff.added.keys().map(|key| format!("flag {key} added"));
        let updated = diff.updated.iter().map(|(key, change)| {
            match (change.before.is_disabled(), change.after.is_disabled()) {
                (true, false) => format!("flag {key} is ON"),
                (false, true) => format!("flag {key} is OFF"),
                _ => format!("flag {key} is updated"),
            }
        });
        deleted.chain(added).chain(updated).collect()
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, diff: &Diff) -> Result<()> {
        for message in LogNotifier::messages(diff) {
            log::info!(target: "flagserve", "{}", message);
        }
        Ok(())
    }
}
