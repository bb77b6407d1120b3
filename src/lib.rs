//! Core of a feature flag evaluation server compatible with the OpenFeature Remote Evaluation
//! Protocol (OFREP).
//!
//! # Overview
//!
//! Flags are defined in a YAML or JSON document held by a flag store (a local file, a remote
//! file, or memory). A [`Server`] keeps the parsed flag set in a [`FlagCache`] and serves
//! evaluations from it, while background loops periodically:
//!
//! - refresh the cache from the store and hand the changes to the configured [`Notifier`]s;
//! - flush buffered evaluation events to an [`Exporter`] (when export is enabled).
//!
//! A flag has named variants and ordered targeting rules. Each rule carries a query evaluated
//! against the caller's [`EvaluationContext`]; the first matching rule selects the served
//! variant, otherwise the `default` variant is served. A flag that is not explicitly enabled is
//! disabled.
//!
//! ```yaml
//! new-checkout:
//!   disabled: false
//!   variants:
//!     default: false
//!     enabled: true
//!   rules:
//!     - name: beta-users
//!       variant: enabled
//!       query: beta eq true and country in ["fr", "de"]
//! ```
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. [`Error::error_code`] maps each error to the
//! OFREP error code to report, and [`FlagState::from_error`] builds the matching payload.
//!
//! # Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log/latest/log/) facade under the
//! `flagserve` target. Install a `log`-compatible logger to see it.

#![warn(rustdoc::missing_crate_level_docs)]

mod admin;
mod attributes;
mod cache;
mod config;
mod error;
mod export;
mod flag;
mod notify;
mod poller;
mod query;
mod server;
mod store;

pub use admin::{AdminService, Upserted};
pub use attributes::{AttributeValue, EvaluationContext};
pub use cache::{AllFlags, FlagCache, FlagState};
pub use config::{
    ExporterConfig, FlagFormat, NotifierConfig, PollerThreadConfig, ReaderConfig, ServerConfig,
    WriterConfig,
};
pub use error::{
    Error, Result, ValidationError, ERROR_FLAG_NOT_FOUND, ERROR_GENERAL, ERROR_PARSE,
};
pub use export::{Event, ExportService, Exporter, FileExporter, Record, ReportFormat};
pub use flag::{
    parse_flags, serialize_flags, Diff, DiffUpdated, DisabledPatch, Flag, FlagSet, Reason,
    ResolutionDetails, Rule, DEFAULT_VARIANT,
};
pub use notify::{LogNotifier, Notifier, NotifyService, WebhookNotifier};
pub use poller::{FlushTask, PollerTask, PollerThread, RefreshTask};
pub use query::{CompareOp, Literal, Query, QueryError, QueryEvaluator, RulesEvaluator};
pub use server::{Backends, Server, Status};
pub use store::{FileStore, FlagReader, FlagWriter, HttpReader, MemoryStore, NoopWriter};
