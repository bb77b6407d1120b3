use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    attributes::EvaluationContext,
    config::FlagFormat,
    error::ValidationError,
    query::{QueryError, QueryEvaluator},
    Result,
};

/// Name of the variant every flag must define. It is served when the flag is disabled or when
/// no rule matches.
pub const DEFAULT_VARIANT: &str = "default";

/// A whole flag set, keyed by flag key.
pub type FlagSet = HashMap<String, Flag>;

/// A feature flag: named variants and ordered targeting rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    /// `None` is treated as disabled.
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variants: BTreeMap<String, serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rules: Vec<Rule>,
    #[serde(skip, default = "Rule::fallback")]
    default_rule: Rule,
}

/// Deserialize an explicit `null` the same way as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A targeting rule. A rule without query matches every context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Why a variant was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Disabled,
    Default,
    TargetingMatch,
    /// Reserved for percentage rollouts, never produced.
    Split,
}

/// Outcome of a flag evaluation, apart from the value itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionDetails {
    pub variant: String,
    pub reason: Reason,
    /// Index of the matching rule, set only for [`Reason::TargetingMatch`].
    pub rule_index: Option<usize>,
    pub rule_name: Option<String>,
}

/// Body of an admin request toggling a flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisabledPatch {
    #[serde(default)]
    pub disabled: Option<bool>,
}

/// Changes between two flag sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diff {
    pub deleted: BTreeMap<String, Flag>,
    pub added: BTreeMap<String, Flag>,
    pub updated: BTreeMap<String, DiffUpdated>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffUpdated {
    #[serde(rename = "old_value")]
    pub before: Flag,
    #[serde(rename = "new_value")]
    pub after: Flag,
}

impl Rule {
    fn fallback() -> Rule {
        Rule {
            name: "default".to_owned(),
            variant: DEFAULT_VARIANT.to_owned(),
            query: None,
        }
    }

    fn applies(
        &self,
        context: &EvaluationContext,
        evaluator: &(impl QueryEvaluator + ?Sized),
    ) -> std::result::Result<bool, QueryError> {
        match &self.query {
            Some(query) => evaluator.evaluate(query, context),
            None => Ok(true),
        }
    }
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Disabled => "DISABLED",
            Reason::Default => "DEFAULT",
            Reason::TargetingMatch => "TARGETING_MATCH",
            Reason::Split => "SPLIT",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VariantKind {
    Boolean,
    Number,
    String,
}

impl VariantKind {
    fn of(value: &serde_json::Value) -> Option<VariantKind> {
        match value {
            serde_json::Value::Bool(_) => Some(VariantKind::Boolean),
            serde_json::Value::Number(_) => Some(VariantKind::Number),
            serde_json::Value::String(_) => Some(VariantKind::String),
            _ => None,
        }
    }
}

impl Flag {
    /// Build a validated flag.
    ///
    /// `key` is only used to report validation errors.
    pub fn new(
        key: &str,
        disabled: Option<bool>,
        variants: BTreeMap<String, serde_json::Value>,
        rules: Vec<Rule>,
    ) -> std::result::Result<Flag, ValidationError> {
        let mut flag = Flag {
            disabled,
            variants,
            rules,
            default_rule: Rule::fallback(),
        };
        flag.prepare(key)?;
        Ok(flag)
    }

    /// Normalize and validate a flag produced by deserialization.
    pub(crate) fn prepare(&mut self, key: &str) -> std::result::Result<(), ValidationError> {
        if key.is_empty() {
            return Err(ValidationError::MissingKey);
        }
        for rule in &mut self.rules {
            if rule.query.as_deref().is_some_and(|q| q.trim().is_empty()) {
                rule.query = None;
            }
        }
        self.default_rule = Rule::fallback();

        if self.variants.is_empty() {
            return Err(ValidationError::MissingVariants {
                flag: key.to_owned(),
            });
        }
        if !self.variants.contains_key(DEFAULT_VARIANT) {
            return Err(ValidationError::MissingDefaultVariant {
                flag: key.to_owned(),
            });
        }

        let mut names = HashSet::new();
        for rule in &self.rules {
            if rule.name.is_empty() {
                return Err(ValidationError::RuleMissingName {
                    flag: key.to_owned(),
                });
            }
            if rule.variant.is_empty() {
                return Err(ValidationError::RuleMissingVariant {
                    flag: key.to_owned(),
                    rule: rule.name.clone(),
                });
            }
            if !self.variants.contains_key(&rule.variant) {
                return Err(ValidationError::UnknownVariant {
                    flag: key.to_owned(),
                    rule: rule.name.clone(),
                    variant: rule.variant.clone(),
                });
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ValidationError::DuplicateRuleName {
                    flag: key.to_owned(),
                    rule: rule.name.clone(),
                });
            }
        }

        let mut kind = None;
        for (name, value) in &self.variants {
            let this = VariantKind::of(value).ok_or_else(|| {
                ValidationError::UnsupportedVariantValue {
                    flag: key.to_owned(),
                    variant: name.clone(),
                }
            })?;
            match kind {
                None => kind = Some(this),
                Some(kind) if kind != this => {
                    return Err(ValidationError::MixedVariantKinds {
                        flag: key.to_owned(),
                    })
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Absent `disabled` counts as disabled.
    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(true)
    }

    /// Value of a variant. Null values are treated as absent.
    pub fn value(&self, variant: &str) -> Option<&serde_json::Value> {
        self.variants.get(variant).filter(|value| !value.is_null())
    }

    /// Evaluate the flag for `context`.
    ///
    /// Rules are tried in order and the first one that applies wins. Evaluator errors are logged
    /// and the rule is skipped. When nothing applies, the `default` variant is served.
    pub fn evaluate(
        &self,
        context: &EvaluationContext,
        evaluator: &(impl QueryEvaluator + ?Sized),
    ) -> (Option<&serde_json::Value>, ResolutionDetails) {
        if self.is_disabled() {
            return (
                self.value(&self.default_rule.variant),
                ResolutionDetails {
                    variant: self.default_rule.variant.clone(),
                    reason: Reason::Disabled,
                    rule_index: None,
                    rule_name: None,
                },
            );
        }

        for (index, rule) in self.rules.iter().enumerate() {
            match rule.applies(context, evaluator) {
                Ok(true) => {
                    return (
                        self.value(&rule.variant),
                        ResolutionDetails {
                            variant: rule.variant.clone(),
                            reason: Reason::TargetingMatch,
                            rule_index: Some(index),
                            rule_name: Some(rule.name.clone()),
                        },
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    let rule_name = rule.name.as_str();
                    log::error!(target: "flagserve", rule_name; "failed to evaluate rule query: {}", err);
                }
            }
        }

        (
            self.value(&self.default_rule.variant),
            ResolutionDetails {
                variant: self.default_rule.variant.clone(),
                reason: Reason::Default,
                rule_index: None,
                rule_name: None,
            },
        )
    }
}

impl Diff {
    /// Compute the changes going from `old` to `new`. Flags are compared structurally.
    pub fn between(old: &FlagSet, new: &FlagSet) -> Diff {
        let mut diff = Diff::default();
        for (key, before) in old {
            match new.get(key) {
                None => {
                    diff.deleted.insert(key.clone(), before.clone());
                }
                Some(after) if after != before => {
                    diff.updated.insert(
                        key.clone(),
                        DiffUpdated {
                            before: before.clone(),
                            after: after.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }
        for (key, after) in new {
            if !old.contains_key(key) {
                diff.added.insert(key.clone(), after.clone());
            }
        }
        diff
    }

    pub fn has_diff(&self) -> bool {
        !(self.deleted.is_empty() && self.added.is_empty() && self.updated.is_empty())
    }
}

/// Parse and validate a whole flag set. An empty payload is an empty flag set.
pub fn parse_flags(bytes: &[u8], format: FlagFormat) -> Result<FlagSet> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(FlagSet::new());
    }
    let mut flags: FlagSet = format.decode(bytes)?;
    for (key, flag) in &mut flags {
        flag.prepare(key)?;
    }
    Ok(flags)
}

/// Serialize a flag set with keys in sorted order.
pub fn serialize_flags(flags: &FlagSet, format: FlagFormat) -> Result<Vec<u8>> {
    let sorted: BTreeMap<&String, &Flag> = flags.iter().collect();
    format.encode(&sorted)
}
