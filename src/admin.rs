use std::{collections::BTreeMap, sync::Arc};

use crate::{
    config::FlagFormat,
    flag::{parse_flags, DisabledPatch, Flag, FlagSet},
    Error, FlagReader, FlagWriter, Result,
};

/// Outcome of [`AdminService::upsert_flag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Created,
    Updated,
}

/// Reads and writes flags directly against the store, bypassing the cache.
///
/// Changes become visible to evaluations after the next cache refresh.
pub struct AdminService {
    reader: Arc<dyn FlagReader + Send + Sync>,
    writer: Arc<dyn FlagWriter + Send + Sync>,
    format: FlagFormat,
}

impl AdminService {
    pub fn new(
        reader: Arc<dyn FlagReader + Send + Sync>,
        writer: Arc<dyn FlagWriter + Send + Sync>,
        format: FlagFormat,
    ) -> AdminService {
        AdminService {
            reader,
            writer,
            format,
        }
    }

    /// Flag `key` as stored, as a single-entry flag set.
    ///
    /// Returns [`Error::FlagNotFound`] if the store has no such flag.
    pub fn retrieve_flag(&self, key: &str) -> Result<FlagSet> {
        let bytes = self.reader.read_by_key(key).map_err(|err| match err {
            Error::RecordNotFound { key } => Error::FlagNotFound { key },
            err => err,
        })?;
        parse_flags(&bytes, self.format)
    }

    /// Every stored flag.
    pub fn retrieve_flags(&self) -> Result<FlagSet> {
        parse_flags(&self.reader.read_all()?, self.format)
    }

    /// Validate `flag` and store it under `key`, replacing any previous version.
    pub fn upsert_flag(&self, key: &str, mut flag: Flag) -> Result<Upserted> {
        flag.prepare(key)?;

        let upserted = match self.retrieve_flag(key) {
            Ok(_) => Upserted::Updated,
            Err(err) if err.is_not_found() => Upserted::Created,
            Err(err) => return Err(err),
        };

        self.write(key, &flag)?;
        log::info!(target: "flagserve", key; "flag {:?}", upserted);
        Ok(upserted)
    }

    /// Turn flag `key` on or off.
    pub fn patch_flag(&self, key: &str, patch: DisabledPatch) -> Result<Flag> {
        let disabled = patch.disabled.ok_or_else(|| {
            Error::InvalidRequest("body missing `disabled` boolean key".to_owned())
        })?;

        let mut flags = self.retrieve_flag(key)?;
        let mut flag = flags.remove(key).ok_or_else(|| Error::FlagNotFound {
            key: key.to_owned(),
        })?;
        flag.disabled = Some(disabled);

        self.write(key, &flag)?;
        log::info!(target: "flagserve", key, disabled; "flag patched");
        Ok(flag)
    }

    fn write(&self, key: &str, flag: &Flag) -> Result<()> {
        let bytes = self.format.encode(&BTreeMap::from([(key, flag)]))?;
        self.writer.write(key, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{error::ValidationError, store::MemoryStore};

    const FLAGS: &str = r#"
dark-mode:
  disabled: true
  variants:
    default: false
    enabled: true
"#;

    fn admin() -> (AdminService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_document(FlagFormat::Yaml, FLAGS));
        (
            AdminService::new(store.clone(), store.clone(), FlagFormat::Yaml),
            store,
        )
    }

    fn flag(variant: &str) -> Flag {
        Flag::new(
            "f",
            Some(false),
            BTreeMap::from([
                ("default".to_owned(), json!("a")),
                (variant.to_owned(), json!("b")),
            ]),
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn retrieves_flags() {
        let (admin, _) = admin();
        assert!(admin.retrieve_flags().unwrap().contains_key("dark-mode"));
        assert!(admin.retrieve_flag("dark-mode").unwrap()["dark-mode"].is_disabled());

        let err = admin.retrieve_flag("missing").unwrap_err();
        assert!(matches!(err, Error::FlagNotFound { key } if key == "missing"));
    }

    #[test]
    fn upsert_creates_then_updates() {
        let (admin, _) = admin();
        assert_eq!(admin.upsert_flag("new", flag("x")).unwrap(), Upserted::Created);
        assert_eq!(admin.upsert_flag("new", flag("y")).unwrap(), Upserted::Updated);

        let flags = admin.retrieve_flags().unwrap();
        assert_eq!(flags.len(), 2);
        assert!(flags["new"].variants.contains_key("y"));
    }

    #[test]
    fn upsert_rejects_invalid_flag() {
        let (admin, _) = admin();
        let mut invalid = flag("x");
        invalid.variants.remove("default");
        let err = admin.upsert_flag("bad", invalid).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::MissingDefaultVariant { .. })
        ));
        assert!(!admin.retrieve_flags().unwrap().contains_key("bad"));
    }

    #[test]
    fn patch_toggles_disabled() {
        let (admin, _) = admin();
        let flag = admin
            .patch_flag("dark-mode", DisabledPatch { disabled: Some(false) })
            .unwrap();
        assert!(!flag.is_disabled());
        assert!(!admin.retrieve_flag("dark-mode").unwrap()["dark-mode"].is_disabled());
    }

    #[test]
    fn patch_requires_disabled_and_existing_flag() {
        let (admin, _) = admin();
        assert!(matches!(
            admin.patch_flag("dark-mode", DisabledPatch::default()),
            Err(Error::InvalidRequest(_))
        ));
        assert!(admin
            .patch_flag("missing", DisabledPatch { disabled: Some(true) })
            .unwrap_err()
            .is_not_found());
    }
}
