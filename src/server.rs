use std::sync::{mpsc, Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    admin::AdminService,
    attributes::EvaluationContext,
    cache::{AllFlags, FlagCache, FlagState},
    config::ServerConfig,
    export::{Event, ExportService},
    flag::FlagSet,
    notify::NotifyService,
    poller::{FlushTask, PollerThread, RefreshTask},
    query::{QueryEvaluator, RulesEvaluator},
    Exporter, FlagReader, FlagWriter, Notifier, Result,
};

/// Capability implementations a [`Server`] runs with.
pub struct Backends {
    pub reader: Arc<dyn FlagReader + Send + Sync>,
    pub writer: Arc<dyn FlagWriter + Send + Sync>,
    pub notifiers: Vec<Arc<dyn Notifier + Send + Sync>>,
    pub exporter: Box<dyn Exporter + Send + Sync>,
    pub evaluator: Arc<dyn QueryEvaluator + Send + Sync>,
}

impl Backends {
    /// Build every backend selected in `config`.
    pub fn from_config(config: &ServerConfig) -> Result<Backends> {
        Ok(Backends {
            reader: config.reader.build(config.flag_format)?,
            writer: config.writer.build(config.flag_format)?,
            notifiers: config
                .notifiers
                .iter()
                .map(|notifier| notifier.build())
                .collect::<Result<_>>()?,
            exporter: config.exporter.build()?,
            evaluator: Arc::new(RulesEvaluator),
        })
    }
}

/// Health information.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub env: String,
    pub name: String,
    pub version: String,
    pub status: String,
    /// Time of the last successful cache refresh.
    pub latest_update: Option<DateTime<Utc>>,
}

/// A running flag server: the cache with its refresh loop, change notifications, evaluation
/// export and admin access to the store.
///
/// Call [`Server::shutdown`] to stop the background loops.
pub struct Server {
    config: ServerConfig,
    cache: Arc<FlagCache>,
    notify: Arc<NotifyService>,
    export: Arc<ExportService>,
    admin: AdminService,
    refresh_thread: PollerThread,
    export_thread: Option<PollerThread>,
}

impl Server {
    /// Start a server using the backends selected in `config`.
    pub fn start(config: ServerConfig) -> Result<Server> {
        let backends = Backends::from_config(&config)?;
        Server::start_with_backends(config, backends)
    }

    /// Start a server with explicit backends.
    ///
    /// Loads the flags once before returning. A failure of that first load aborts start-up.
    pub fn start_with_backends(config: ServerConfig, backends: Backends) -> Result<Server> {
        let Backends {
            reader,
            writer,
            notifiers,
            exporter,
            evaluator,
        } = backends;

        let cache = Arc::new(FlagCache::new(
            reader.clone(),
            config.flag_format,
            evaluator,
        ));
        let notify = Arc::new(NotifyService::new(notifiers));
        let export = Arc::new(ExportService::new(exporter, config.export_max_events));
        let admin = AdminService::new(reader, writer, config.flag_format);

        let (old, new) = cache.refresh().map_err(|err| {
            log::error!(target: "flagserve", "failed to load flags: {}", err);
            err
        })?;
        notify.notify(&old, &new);
        log::info!(target: "flagserve", "loaded {} flags", new.len());

        let refresh_thread = PollerThread::start(
            "flagserve-refresh",
            config.refresh.clone(),
            RefreshTask::new(cache.clone(), notify.clone()),
        )?;
        let export_thread = if config.export_reports {
            match PollerThread::start(
                "flagserve-export",
                config.export.clone(),
                FlushTask::new(export.clone()),
            ) {
                Ok(thread) => Some(thread),
                Err(err) => {
                    refresh_thread.stop();
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        Ok(Server {
            config,
            cache,
            notify,
            export,
            admin,
            refresh_thread,
            export_thread,
        })
    }

    /// Evaluate flag `key` for `context`, recording an export event when reports are enabled.
    ///
    /// Failed evaluations are not recorded. Use [`FlagState::from_error`] to build the error
    /// payload.
    pub fn evaluate(&self, key: &str, context: &EvaluationContext) -> Result<FlagState> {
        let state = self.cache.evaluate(key, context).map_err(|err| {
            log::debug!(target: "flagserve", key; "failed to evaluate a flag: {}", err);
            err
        })?;
        log::trace!(target: "flagserve", key, state:serde; "evaluated a flag");

        if self.config.export_reports {
            self.export.add(Event::from_state(&state));
        }
        Ok(state)
    }

    /// Evaluate every flag for `context`.
    pub fn evaluate_all(&self, context: &EvaluationContext) -> AllFlags {
        self.cache.evaluate_all(context)
    }

    /// Current flag set as served by the cache.
    pub fn flags(&self) -> Arc<FlagSet> {
        self.cache.flags()
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    /// Refresh the cache now instead of waiting for the next tick.
    pub fn refresh(&self) -> Result<()> {
        let (old, new) = self.cache.refresh()?;
        self.notify.notify(&old, &new);
        Ok(())
    }

    pub fn status(&self) -> Status {
        Status {
            env: self.config.env.clone(),
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            status: "up".to_owned(),
            latest_update: self.cache.last_update(),
        }
    }

    /// Stop the background loops and wait for them to finish their final close.
    ///
    /// Waits at most the configured shutdown timeout. When it is exceeded, the loops are left to
    /// finish on their own and `Ok(())` is returned.
    pub fn shutdown(self) -> Result<()> {
        let Server {
            config,
            refresh_thread,
            export_thread,
            ..
        } = self;

        log::info!(target: "flagserve", "stopping background loops");
        refresh_thread.stop();
        if let Some(thread) = &export_thread {
            thread.stop();
        }

        let (done_sender, done_receiver) = mpsc::channel();
        std::thread::Builder::new()
            .name("flagserve-shutdown".to_owned())
            .spawn(move || {
                let refresh = refresh_thread.shutdown();
                let export = export_thread.map_or(Ok(()), PollerThread::shutdown);
                // The receiver is gone if the wait timed out.
                let _ = done_sender.send(refresh.and(export));
            })?;

        match done_receiver.recv_timeout(config.shutdown_timeout) {
            Ok(result) => {
                log::info!(target: "flagserve", "background loops stopped");
                result
            }
            Err(_) => {
                log::warn!(target: "flagserve", "timed out waiting for background loops to stop");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use serde_json::json;

    use super::*;
    use crate::{
        config::FlagFormat, export::Record, flag::Diff, store::MemoryStore, AttributeValue, Error,
    };

    const FLAGS: &str = r#"
new-checkout:
  disabled: false
  variants:
    default: false
    enabled: true
  rules:
    - name: beta-users
      variant: enabled
      query: beta eq true
"#;

    struct Harness {
        store: Arc<MemoryStore>,
        diffs: Arc<Mutex<Vec<Diff>>>,
        records: Arc<Mutex<Vec<Record>>>,
    }

    fn backends() -> (Backends, Harness) {
        let store = Arc::new(MemoryStore::with_document(FlagFormat::Yaml, FLAGS));
        let diffs = Arc::new(Mutex::new(Vec::new()));
        let records = Arc::new(Mutex::new(Vec::new()));

        let notifier: Arc<dyn Notifier + Send + Sync> = {
            let diffs = diffs.clone();
            Arc::new(move |diff: &Diff| -> Result<()> {
                diffs.lock().unwrap().push(diff.clone());
                Ok(())
            })
        };
        let exporter = {
            let records = records.clone();
            move |batch: &[Record]| -> Result<()> {
                records.lock().unwrap().extend_from_slice(batch);
                Ok(())
            }
        };

        let backends = Backends {
            reader: store.clone(),
            writer: store.clone(),
            notifiers: vec![notifier],
            exporter: Box::new(exporter),
            evaluator: Arc::new(RulesEvaluator),
        };
        (
            backends,
            Harness {
                store,
                diffs,
                records,
            },
        )
    }

    fn config() -> ServerConfig {
        ServerConfig::new()
            .env("test")
            .refresh_interval(Duration::from_secs(3600))
            .export_interval(Duration::from_secs(3600))
    }

    #[test]
    fn loads_flags_and_notifies_on_start() {
        let (backends, harness) = backends();
        let server = Server::start_with_backends(config(), backends).unwrap();

        let beta: EvaluationContext = [("beta".to_owned(), AttributeValue::from(true))].into();
        let state = server.evaluate("new-checkout", &beta).unwrap();
        assert_eq!(state.value, Some(json!(true)));

        let status = server.status();
        assert_eq!(status.env, "test");
        assert_eq!(status.status, "up");
        assert!(status.latest_update.is_some());

        server.shutdown().unwrap();
        let diffs = harness.diffs.lock().unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].added.contains_key("new-checkout"));
    }

    #[test]
    fn start_fails_on_invalid_flags() {
        let (backends, harness) = backends();
        harness.store.set_document("broken:\n  variants: {}\n");
        assert!(matches!(
            Server::start_with_backends(config(), backends),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn exports_single_flag_evaluations_on_shutdown() {
        let (backends, harness) = backends();
        let server =
            Server::start_with_backends(config().export_reports(true), backends).unwrap();

        server
            .evaluate("new-checkout", &EvaluationContext::new())
            .unwrap();
        assert!(server
            .evaluate("missing", &EvaluationContext::new())
            .unwrap_err()
            .is_not_found());
        server.evaluate_all(&EvaluationContext::new());

        server.shutdown().unwrap();
        let records = harness.records.lock().unwrap();
        // Unknown flags and bulk evaluations are not exported.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "new-checkout");
        assert_eq!(records[0].reason.as_deref(), Some("DEFAULT"));
        assert_eq!(records[0].error_code, None);
    }

    #[test]
    fn reports_disabled_means_no_events() {
        let (backends, harness) = backends();
        let server = Server::start_with_backends(config(), backends).unwrap();
        server
            .evaluate("new-checkout", &EvaluationContext::new())
            .unwrap();
        server.shutdown().unwrap();
        assert!(harness.records.lock().unwrap().is_empty());
    }

    #[test]
    fn shutdown_is_bounded() {
        let (mut backends, _harness) = backends();
        let slow: Arc<dyn Notifier + Send + Sync> = Arc::new(|_: &Diff| -> Result<()> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(())
        });
        backends.notifiers = vec![slow];
        let server = Server::start_with_backends(
            config().shutdown_timeout(Duration::from_millis(100)),
            backends,
        )
        .unwrap();

        let started = std::time::Instant::now();
        server.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
