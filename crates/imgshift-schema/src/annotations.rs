use std::collections::BTreeMap;

/// Hostname of the source cluster's internal registry, recorded on the backup.
pub const BACKUP_REGISTRY_HOSTNAME: &str = "openshift.io/backup-registry-hostname";
/// Hostname of the destination cluster's internal registry, recorded on the restore.
pub const RESTORE_REGISTRY_HOSTNAME: &str = "openshift.io/restore-registry-hostname";
/// Registry selector for the intermediate migration registry.
pub const MIGRATION_REGISTRY: &str = "openshift.io/migration-registry";
/// Skip image copy for this backup or restore.
pub const SKIP_IMAGE_COPY: &str = "openshift.io/skip-image-copy";
/// Disable image copy for this backup or restore.
pub const DISABLE_IMAGE_COPY: &str = "migration.openshift.io/disable-image-copy";

/// The relocation-relevant subset of a backup's or restore's annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationAnnotations {
    pub backup_registry: Option<String>,
    pub restore_registry: Option<String>,
    pub migration_registry: Option<String>,
    pub skip_image_copy: bool,
    pub disable_image_copy: bool,
}

impl MigrationAnnotations {
    pub fn from_map(annotations: &BTreeMap<String, String>) -> Self {
        let value = |key: &str| {
            annotations
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };
        let flag = |key: &str| {
            annotations
                .get(key)
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
        };
        Self {
            backup_registry: value(BACKUP_REGISTRY_HOSTNAME),
            restore_registry: value(RESTORE_REGISTRY_HOSTNAME),
            migration_registry: value(MIGRATION_REGISTRY),
            skip_image_copy: flag(SKIP_IMAGE_COPY),
            disable_image_copy: flag(DISABLE_IMAGE_COPY),
        }
    }

    /// True when either copy-suppressing flag is set.
    pub fn copy_suppressed(&self) -> bool {
        self.skip_image_copy || self.disable_image_copy
    }
}

/// Parse `key=value` pairs into an annotation map. Later keys win.
pub fn parse_pairs<'a>(
    pairs: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, String>, crate::SchemaError> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            crate::SchemaError::InvalidAnnotation(format!("'{pair}', expected '<key>=<value>'"))
        })?;
        if key.is_empty() {
            return Err(crate::SchemaError::InvalidAnnotation(format!(
                "'{pair}' has an empty key"
            )));
        }
        map.insert(key.to_owned(), value.to_owned());
    }
    Ok(map)
}
