use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    attributes::EvaluationContext,
    config::FlagFormat,
    flag::{parse_flags, FlagSet, Reason},
    query::QueryEvaluator,
    Error, FlagReader, Result,
};

/// Result of evaluating a single flag, in OFREP shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagState {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FlagState {
    /// Error payload for a failed evaluation of `key`.
    pub fn from_error(key: impl Into<String>, err: &Error) -> FlagState {
        FlagState {
            key: key.into(),
            value: None,
            variant: None,
            reason: None,
            error_code: Some(err.error_code().to_owned()),
            error_message: Some(err.to_string()),
        }
    }
}

/// Result of evaluating every flag, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllFlags {
    pub flags: Vec<FlagState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

struct Snapshot {
    flags: Arc<FlagSet>,
    last_update: Option<DateTime<Utc>>,
}

/// Serves evaluations from an in-memory snapshot of the flag set and refreshes it from a
/// [`FlagReader`].
///
/// Readers clone the current snapshot under a short read lock and evaluate without holding it.
/// Refresh reads and parses outside the lock and only swaps the snapshot under the write lock.
/// Concurrent refreshes run one after the other.
pub struct FlagCache {
    reader: Arc<dyn FlagReader + Send + Sync>,
    format: FlagFormat,
    evaluator: Arc<dyn QueryEvaluator + Send + Sync>,
    snapshot: RwLock<Snapshot>,
    /// Held for a whole refresh so a slow read cannot replace a newer snapshot.
    refresh_lock: Mutex<()>,
}

impl FlagCache {
    pub fn new(
        reader: Arc<dyn FlagReader + Send + Sync>,
        format: FlagFormat,
        evaluator: Arc<dyn QueryEvaluator + Send + Sync>,
    ) -> FlagCache {
        FlagCache {
            reader,
            format,
            evaluator,
            snapshot: RwLock::new(Snapshot {
                flags: Arc::new(FlagSet::new()),
                last_update: None,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Current flag set.
    pub fn flags(&self) -> Arc<FlagSet> {
        // A poisoned lock still holds a consistent snapshot since it is only ever replaced
        // wholesale.
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .flags
            .clone()
    }

    /// Time of the last successful refresh.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_update
    }

    /// Evaluate flag `key` for `context`.
    ///
    /// Returns [`Error::FlagNotFound`] if the flag is not in the current flag set. Use
    /// [`FlagState::from_error`] to turn it into an OFREP error payload.
    pub fn evaluate(&self, key: &str, context: &EvaluationContext) -> Result<FlagState> {
        let flags = self.flags();
        let flag = flags.get(key).ok_or_else(|| Error::FlagNotFound {
            key: key.to_owned(),
        })?;

        let (value, details) = flag.evaluate(context, &*self.evaluator);
        Ok(FlagState {
            key: key.to_owned(),
            value: value.cloned(),
            variant: Some(details.variant),
            reason: Some(details.reason),
            error_code: None,
            error_message: None,
        })
    }

    /// Evaluate every flag in the current flag set against one snapshot.
    pub fn evaluate_all(&self, context: &EvaluationContext) -> AllFlags {
        let flags = self.flags();
        let mut states: Vec<FlagState> = flags
            .iter()
            .map(|(key, flag)| {
                let (value, details) = flag.evaluate(context, &*self.evaluator);
                FlagState {
                    key: key.clone(),
                    value: value.cloned(),
                    variant: Some(details.variant),
                    reason: Some(details.reason),
                    error_code: None,
                    error_message: None,
                }
            })
            .collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));

        AllFlags {
            flags: states,
            error_code: None,
            error_message: None,
        }
    }

    /// Load the flag set from the reader and replace the current snapshot.
    ///
    /// Returns the previous and the new flag set. On error, the current snapshot is kept.
    pub fn refresh(&self) -> Result<(Arc<FlagSet>, Arc<FlagSet>)> {
        let _refreshing = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let bytes = self.reader.read_all()?;
        // Parsing before requesting the lock to minimize lock span.
        let new_flags = Arc::new(parse_flags(&bytes, self.format)?);

        let old_flags = {
            let mut snapshot = self
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            snapshot.last_update = Some(Utc::now());
            std::mem::replace(&mut snapshot.flags, new_flags.clone())
        };

        log::debug!(target: "flagserve", "refreshed flags: {} loaded", new_flags.len());
        Ok((old_flags, new_flags))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::{attributes::AttributeValue, query::RulesEvaluator, store::MemoryStore};

    const V1: &str = r#"
a:
  disabled: false
  variants:
    default: false
    enabled: true
  rules:
    - name: beta
      variant: enabled
      query: beta eq true
b:
  variants:
    default: blue
"#;

    const V2: &str = r#"
a:
  disabled: false
  variants:
    default: 1
    enabled: 2
"#;

    fn cache(store: Arc<MemoryStore>) -> FlagCache {
        FlagCache::new(store, FlagFormat::Yaml, Arc::new(RulesEvaluator))
    }

    #[test]
    fn starts_empty() {
        let cache = cache(Arc::new(MemoryStore::new(FlagFormat::Yaml)));
        assert!(cache.flags().is_empty());
        assert_eq!(cache.last_update(), None);
        assert!(cache.evaluate_all(&EvaluationContext::new()).flags.is_empty());
    }

    #[test]
    fn evaluates_after_refresh() {
        let cache = cache(Arc::new(MemoryStore::with_document(FlagFormat::Yaml, V1)));
        let (old, new) = cache.refresh().unwrap();
        assert!(old.is_empty());
        assert_eq!(new.len(), 2);
        assert!(cache.last_update().is_some());

        let ctx: EvaluationContext = [("beta".to_owned(), AttributeValue::from(true))].into();
        let state = cache.evaluate("a", &ctx).unwrap();
        assert_eq!(state.value, Some(json!(true)));
        assert_eq!(state.variant.as_deref(), Some("enabled"));
        assert_eq!(state.reason, Some(Reason::TargetingMatch));

        let state = cache.evaluate("b", &ctx).unwrap();
        assert_eq!(state.value, Some(json!("blue")));
        assert_eq!(state.reason, Some(Reason::Disabled));
    }

    #[test]
    fn missing_flag_is_not_found() {
        let cache = cache(Arc::new(MemoryStore::with_document(FlagFormat::Yaml, V1)));
        cache.refresh().unwrap();

        let err = cache.evaluate("nope", &EvaluationContext::new()).unwrap_err();
        assert!(matches!(&err, Error::FlagNotFound { key } if key == "nope"));

        let state = FlagState::from_error("nope", &err);
        assert_eq!(state.error_code.as_deref(), Some("FLAG_NOT_FOUND"));
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({
                "key": "nope",
                "errorCode": "FLAG_NOT_FOUND",
                "errorMessage": "flag for key 'nope' does not exist",
            })
        );
    }

    #[test]
    fn evaluate_all_is_sorted() {
        let cache = cache(Arc::new(MemoryStore::with_document(FlagFormat::Yaml, V1)));
        cache.refresh().unwrap();
        let all = cache.evaluate_all(&EvaluationContext::new());
        let keys: Vec<_> = all.flags.iter().map(|state| state.key.as_str()).collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn failed_refresh_keeps_snapshot() {
        let store = Arc::new(MemoryStore::with_document(FlagFormat::Yaml, V1));
        let cache = cache(store.clone());
        cache.refresh().unwrap();
        let updated = cache.last_update();

        store.set_document("a:\n  variants:\n    enabled: true\n");
        let err = cache.refresh().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(cache.flags().len(), 2);
        assert_eq!(cache.last_update(), updated);
    }

    #[test]
    fn readers_never_observe_torn_snapshots() {
        let store = Arc::new(MemoryStore::with_document(FlagFormat::Yaml, V1));
        let cache = Arc::new(cache(store.clone()));
        cache.refresh().unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let mut seen = HashSet::new();
                    for _ in 0..500 {
                        let all = cache.evaluate_all(&EvaluationContext::new());
                        let keys: Vec<_> = all.flags.iter().map(|s| s.key.clone()).collect();
                        let values: Vec<_> = all.flags.iter().map(|s| s.value.clone()).collect();
                        // Either the whole first version or the whole second one, flag bodies
                        // included.
                        if keys == ["a", "b"] {
                            assert_eq!(values, [Some(json!(false)), Some(json!("blue"))]);
                        } else {
                            assert_eq!(keys, ["a"]);
                            assert_eq!(values, [Some(json!(1))]);
                        }
                        seen.insert(keys.len());
                    }
                    seen
                })
            })
            .collect();

        for i in 0..200 {
            store.set_document(if i % 2 == 0 { V2 } else { V1 });
            cache.refresh().unwrap();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }

    /// Serves `V1` slowly on the first read and `V2` right away afterwards.
    struct SlowFirstRead {
        reads: AtomicUsize,
    }

    impl FlagReader for SlowFirstRead {
        fn read_all(&self) -> Result<Vec<u8>> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(300));
                Ok(V1.as_bytes().to_vec())
            } else {
                Ok(V2.as_bytes().to_vec())
            }
        }

        fn read_by_key(&self, key: &str) -> Result<Vec<u8>> {
            Err(Error::RecordNotFound {
                key: key.to_owned(),
            })
        }
    }

    #[test]
    fn overlapping_refreshes_do_not_roll_back() {
        let reader = Arc::new(SlowFirstRead {
            reads: AtomicUsize::new(0),
        });
        let cache = Arc::new(FlagCache::new(
            reader.clone(),
            FlagFormat::Yaml,
            Arc::new(RulesEvaluator),
        ));

        let slow = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.refresh().unwrap())
        };
        while reader.reads.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        let (old, new) = cache.refresh().unwrap();
        let (slow_old, slow_new) = slow.join().unwrap();

        // The later refresh sees the result of the earlier one as its old snapshot.
        assert!(slow_old.is_empty());
        assert_eq!(slow_new.len(), 2);
        assert_eq!(old.len(), 2);
        assert_eq!(new.len(), 1);

        let state = cache.evaluate("a", &EvaluationContext::new()).unwrap();
        assert_eq!(state.value, Some(json!(1)));
        assert!(cache.evaluate("b", &EvaluationContext::new()).is_err());
    }
}
