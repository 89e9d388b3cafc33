use crate::transports::TransportCache;
use crate::walker::{plan_copies, walk, CopyOutcome, Direction, PlannedCopy, Route, WalkPlan};
use crate::CoreError;
use imgshift_registry::locator::VIRTUAL_ROUTE_MARKER;
use imgshift_registry::{
    internal_context, migration_context, CredentialProvider, ImageCopier, RegistryContext,
    TransportResolver,
};
use imgshift_schema::{ImageVersionSet, MigrationAnnotations, RelocationConfig};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Annotations and routing of one backup.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub annotations: BTreeMap<String, String>,
    /// Backup storage location, used for `bsl://` routing.
    pub storage_location: Option<String>,
}

/// Annotations and routing of one restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// Annotations recorded on the backup being restored.
    pub backup_annotations: BTreeMap<String, String>,
    pub restore_annotations: BTreeMap<String, String>,
    pub storage_location: Option<String>,
    /// Source namespace to destination namespace. Unmapped namespaces keep
    /// their name.
    pub namespace_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A skip or disable annotation is set.
    CopyDisabled,
    /// No internal registry is known, so no image is local.
    NoInternalRegistry,
    /// No migration registry is annotated and the object transport is off.
    ObjectTransportDisabled,
    /// Object-transport routing without a storage location.
    NoStorageLocation,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CopyDisabled => "image copy disabled by annotation",
            Self::NoInternalRegistry => "no internal registry hostname",
            Self::ObjectTransportDisabled => {
                "no migration registry and the object transport is disabled"
            }
            Self::NoStorageLocation => "no storage location for object-transport routing",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Relocation {
    /// Nothing was copied; the resource is unchanged.
    Skipped(SkipReason),
    Relocated {
        set: ImageVersionSet,
        outcome: CopyOutcome,
    },
}

impl Relocation {
    /// The resource to persist: the relocated one, or `input` when skipped.
    pub fn resource<'a>(&'a self, input: &'a ImageVersionSet) -> &'a ImageVersionSet {
        match self {
            Self::Skipped(_) => input,
            Self::Relocated { set, .. } => set,
        }
    }
}

/// Result of a dry run.
#[derive(Debug, Clone)]
pub enum Plan {
    Skipped(SkipReason),
    Copies(Vec<PlannedCopy>),
}

/// Backup/restore orchestrator.
///
/// Decides from a resource's backup and restore annotations whether its
/// local images need copying and between which registries, then walks the
/// resource. All collaborators are injected; virtual transports are resolved
/// through a cache shared by every call on this relocator.
pub struct Relocator {
    config: RelocationConfig,
    object_transport: bool,
    credentials: Arc<dyn CredentialProvider>,
    copier: Arc<dyn ImageCopier>,
    transports: TransportCache,
}

impl Relocator {
    pub fn new(
        config: RelocationConfig,
        object_transport: bool,
        credentials: Arc<dyn CredentialProvider>,
        copier: Arc<dyn ImageCopier>,
        transports: Arc<dyn TransportResolver>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            config,
            object_transport,
            credentials,
            copier,
            transports: TransportCache::new(transports),
        })
    }

    /// Copy local images from the internal registry to the migration
    /// registry and point the resource's records at the copied digests.
    pub fn backup(
        &self,
        set: &ImageVersionSet,
        request: &BackupRequest,
    ) -> Result<Relocation, CoreError> {
        let route = match self.backup_route(set, request) {
            Ok(route) => route,
            Err(reason) => return Ok(Self::skip(set, Direction::Backup, reason)),
        };
        let plan = WalkPlan {
            route,
            source_context: self.internal_context()?,
            dest_context: self.migration_context(),
        };
        self.run(set, &plan)
    }

    /// Copy local images from the migration registry into the destination
    /// cluster's internal registry. Records are not modified.
    pub fn restore(
        &self,
        set: &ImageVersionSet,
        request: &RestoreRequest,
    ) -> Result<Relocation, CoreError> {
        let route = match self.restore_route(set, request) {
            Ok(route) => route,
            Err(reason) => return Ok(Self::skip(set, Direction::Restore, reason)),
        };
        let plan = WalkPlan {
            route,
            source_context: self.migration_context(),
            dest_context: self.internal_context()?,
        };
        self.run(set, &plan)
    }

    /// Locators a backup would copy between, without contacting a registry.
    pub fn plan_backup(
        &self,
        set: &ImageVersionSet,
        request: &BackupRequest,
    ) -> Result<Plan, CoreError> {
        match self.backup_route(set, request) {
            Ok(route) => Ok(Plan::Copies(plan_copies(set, &route, &self.transports)?)),
            Err(reason) => Ok(Plan::Skipped(reason)),
        }
    }

    pub fn plan_restore(
        &self,
        set: &ImageVersionSet,
        request: &RestoreRequest,
    ) -> Result<Plan, CoreError> {
        match self.restore_route(set, request) {
            Ok(route) => Ok(Plan::Copies(plan_copies(set, &route, &self.transports)?)),
            Err(reason) => Ok(Plan::Skipped(reason)),
        }
    }

    fn backup_route(
        &self,
        set: &ImageVersionSet,
        request: &BackupRequest,
    ) -> Result<Route, SkipReason> {
        let annotations = MigrationAnnotations::from_map(&request.annotations);
        if annotations.copy_suppressed() {
            return Err(SkipReason::CopyDisabled);
        }
        let internal = self
            .config
            .internal_registry()
            .map(str::to_owned)
            .or(annotations.backup_registry)
            .ok_or(SkipReason::NoInternalRegistry)?;
        let dest = self.migration_route(
            annotations.migration_registry.as_deref(),
            request.storage_location.as_deref(),
        )?;

        Ok(Route {
            source_registry: Some(internal.clone()),
            internal_path: internal,
            dest_registry: Some(dest),
            dest_namespace: set.namespace().to_owned(),
            direction: Direction::Backup,
        })
    }

    fn restore_route(
        &self,
        set: &ImageVersionSet,
        request: &RestoreRequest,
    ) -> Result<Route, SkipReason> {
        let backup = MigrationAnnotations::from_map(&request.backup_annotations);
        let restore = MigrationAnnotations::from_map(&request.restore_annotations);
        if backup.copy_suppressed() || restore.copy_suppressed() {
            return Err(SkipReason::CopyDisabled);
        }
        let internal = backup.backup_registry.ok_or(SkipReason::NoInternalRegistry)?;
        let source = self.migration_route(
            backup.migration_registry.as_deref(),
            request.storage_location.as_deref(),
        )?;
        let dest = self
            .config
            .internal_registry()
            .map(str::to_owned)
            .or(restore.restore_registry);
        let namespace = request
            .namespace_mapping
            .get(set.namespace())
            .map_or(set.namespace(), String::as_str);

        Ok(Route {
            internal_path: internal,
            source_registry: Some(source),
            dest_registry: dest,
            dest_namespace: namespace.to_owned(),
            direction: Direction::Restore,
        })
    }

    /// The migration registry selector: the annotated registry, or the
    /// storage location's virtual route when the object transport is on.
    fn migration_route(
        &self,
        annotated: Option<&str>,
        storage_location: Option<&str>,
    ) -> Result<String, SkipReason> {
        if let Some(registry) = annotated {
            return Ok(registry.to_owned());
        }
        if !self.object_transport {
            return Err(SkipReason::ObjectTransportDisabled);
        }
        let location = storage_location
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(SkipReason::NoStorageLocation)?;
        Ok(format!("{VIRTUAL_ROUTE_MARKER}{location}"))
    }

    fn run(&self, set: &ImageVersionSet, plan: &WalkPlan) -> Result<Relocation, CoreError> {
        let route = &plan.route;
        debug!(
            "{} of {}/{}: {} -> {} (internal '{}')",
            route.direction,
            set.namespace(),
            set.name(),
            route.source_registry.as_deref().unwrap_or("<none>"),
            route.dest_registry.as_deref().unwrap_or("<none>"),
            route.internal_path
        );
        let (next, outcome) = walk(set, plan, self.copier.as_ref(), &self.transports)?;
        if !self.transports.is_empty() {
            debug!("{} virtual transport(s) resolved", self.transports.len());
        }
        info!(
            "{} of {}/{} complete (copied: {}, by tag: {})",
            route.direction,
            set.namespace(),
            set.name(),
            outcome.local_image_copied,
            outcome.local_image_copied_by_tag
        );
        Ok(Relocation::Relocated { set: next, outcome })
    }

    fn skip(set: &ImageVersionSet, direction: Direction, reason: SkipReason) -> Relocation {
        info!(
            "{direction} of {}/{}: image copy skipped: {reason}",
            set.namespace(),
            set.name()
        );
        Relocation::Skipped(reason)
    }

    fn internal_context(&self) -> Result<RegistryContext, CoreError> {
        Ok(internal_context(self.credentials.as_ref())?.with_timeout(self.request_timeout()))
    }

    fn migration_context(&self) -> RegistryContext {
        migration_context().with_timeout(self.request_timeout())
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.registry.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::tests::CountingResolver;
    use crate::walker::tests::{stream, MockCopier, NoTransports};
    use imgshift_registry::{RegistryError, StaticToken};
    use imgshift_schema::annotations::{
        BACKUP_REGISTRY_HOSTNAME, DISABLE_IMAGE_COPY, MIGRATION_REGISTRY,
        RESTORE_REGISTRY_HOSTNAME, SKIP_IMAGE_COPY,
    };
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn sample() -> ImageVersionSet {
        stream(
            &json!([{"tag": "latest", "items": [
                {"dockerImageReference": "internal.reg/ns/app@sha256:aaa", "image": "sha256:aaa"}
            ]}]),
            &json!([]),
        )
    }

    struct Harness {
        copier: Arc<MockCopier>,
        relocator: Relocator,
    }

    fn harness(object_transport: bool, transports: Arc<dyn TransportResolver>) -> Harness {
        let copier = Arc::new(MockCopier::default());
        let relocator = Relocator::new(
            RelocationConfig::default(),
            object_transport,
            Arc::new(StaticToken::new("sa-token")),
            copier.clone(),
            transports,
        )
        .unwrap();
        Harness { copier, relocator }
    }

    fn backup_request(entries: &[(&str, &str)]) -> BackupRequest {
        BackupRequest {
            annotations: annotations(entries),
            storage_location: Some("default".to_owned()),
        }
    }

    #[test]
    fn backup_copies_to_annotated_migration_registry() {
        let h = harness(false, Arc::new(NoTransports));
        let set = sample();
        let result = h
            .relocator
            .backup(
                &set,
                &backup_request(&[
                    (BACKUP_REGISTRY_HOSTNAME, "internal.reg"),
                    (MIGRATION_REGISTRY, "migration.reg"),
                ]),
            )
            .unwrap();

        let Relocation::Relocated { set: next, outcome } = &result else {
            panic!("expected relocation, got {result:?}");
        };
        assert!(outcome.local_image_copied_by_tag);
        assert_ne!(next, &set);
        assert_eq!(
            h.copier.calls()[0].1,
            "docker://migration.reg/ns/app:latest"
        );
        assert_eq!(result.resource(&set), next);
    }

    #[test]
    fn skip_annotations_leave_resource_untouched() {
        let h = harness(true, Arc::new(NoTransports));
        let set = sample();
        for flag in [SKIP_IMAGE_COPY, DISABLE_IMAGE_COPY] {
            let result = h
                .relocator
                .backup(
                    &set,
                    &backup_request(&[
                        (BACKUP_REGISTRY_HOSTNAME, "internal.reg"),
                        (MIGRATION_REGISTRY, "migration.reg"),
                        (flag, "true"),
                    ]),
                )
                .unwrap();
            assert_eq!(result, Relocation::Skipped(SkipReason::CopyDisabled));
            assert_eq!(result.resource(&set), &set);
        }
        assert!(h.copier.calls().is_empty());
    }

    #[test]
    fn restore_honours_skip_on_either_side() {
        let h = harness(false, Arc::new(NoTransports));
        let request = RestoreRequest {
            backup_annotations: annotations(&[
                (BACKUP_REGISTRY_HOSTNAME, "internal.reg"),
                (MIGRATION_REGISTRY, "migration.reg"),
            ]),
            restore_annotations: annotations(&[
                (RESTORE_REGISTRY_HOSTNAME, "dest.reg"),
                (SKIP_IMAGE_COPY, "true"),
            ]),
            ..RestoreRequest::default()
        };
        let result = h.relocator.restore(&sample(), &request).unwrap();
        assert_eq!(result, Relocation::Skipped(SkipReason::CopyDisabled));
    }

    #[test]
    fn no_internal_registry_is_a_passthrough() {
        let h = harness(false, Arc::new(NoTransports));
        let result = h
            .relocator
            .backup(&sample(), &backup_request(&[(MIGRATION_REGISTRY, "migration.reg")]))
            .unwrap();
        assert_eq!(result, Relocation::Skipped(SkipReason::NoInternalRegistry));
    }

    #[test]
    fn object_transport_off_skips_without_migration_registry() {
        let h = harness(false, Arc::new(NoTransports));
        let result = h
            .relocator
            .backup(
                &sample(),
                &backup_request(&[(BACKUP_REGISTRY_HOSTNAME, "internal.reg")]),
            )
            .unwrap();
        assert_eq!(
            result,
            Relocation::Skipped(SkipReason::ObjectTransportDisabled)
        );
        assert!(h.copier.calls().is_empty());
    }

    #[test]
    fn object_transport_routes_through_storage_location() {
        let dir = tempfile::tempdir().unwrap();
        let counting = Arc::new(CountingResolver::new(dir.path()));
        let h = harness(true, counting.clone());
        let request = backup_request(&[(BACKUP_REGISTRY_HOSTNAME, "internal.reg")]);

        h.relocator.backup(&sample(), &request).unwrap();
        h.relocator.backup(&sample(), &request).unwrap();

        let calls = h.copier.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "objstore-default://ns/app:latest");
        assert_eq!(counting.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn object_transport_needs_storage_location() {
        let h = harness(true, Arc::new(NoTransports));
        let request = BackupRequest {
            annotations: annotations(&[(BACKUP_REGISTRY_HOSTNAME, "internal.reg")]),
            storage_location: None,
        };
        let result = h.relocator.backup(&sample(), &request).unwrap();
        assert_eq!(result, Relocation::Skipped(SkipReason::NoStorageLocation));
    }

    #[test]
    fn missing_token_fails_closed() {
        let copier = Arc::new(MockCopier::default());
        let relocator = Relocator::new(
            RelocationConfig::default(),
            false,
            Arc::new(StaticToken::none()),
            copier.clone(),
            Arc::new(NoTransports),
        )
        .unwrap();
        let err = relocator
            .backup(
                &sample(),
                &backup_request(&[
                    (BACKUP_REGISTRY_HOSTNAME, "internal.reg"),
                    (MIGRATION_REGISTRY, "migration.reg"),
                ]),
            )
            .unwrap_err();
        assert!(
            matches!(err, CoreError::Registry(RegistryError::Config(_))),
            "{err}"
        );
        assert!(copier.calls().is_empty());
    }

    #[test]
    fn restore_copies_into_mapped_namespace() {
        let h = harness(false, Arc::new(NoTransports));
        let set = sample();
        let request = RestoreRequest {
            backup_annotations: annotations(&[
                (BACKUP_REGISTRY_HOSTNAME, "internal.reg"),
                (MIGRATION_REGISTRY, "migration.reg"),
            ]),
            restore_annotations: annotations(&[(RESTORE_REGISTRY_HOSTNAME, "dest.reg")]),
            storage_location: None,
            namespace_mapping: annotations(&[("ns", "ns-restored")]),
        };

        let result = h.relocator.restore(&set, &request).unwrap();
        let Relocation::Relocated { set: next, .. } = result else {
            panic!("expected relocation");
        };
        assert_eq!(next, set);
        assert_eq!(
            h.copier.calls(),
            vec![(
                "docker://migration.reg/ns/app@sha256:aaa".to_owned(),
                "docker://dest.reg/ns-restored/app:latest".to_owned()
            )]
        );
    }

    #[test]
    fn restore_without_destination_registry_is_a_config_error() {
        let h = harness(false, Arc::new(NoTransports));
        let request = RestoreRequest {
            backup_annotations: annotations(&[
                (BACKUP_REGISTRY_HOSTNAME, "internal.reg"),
                (MIGRATION_REGISTRY, "migration.reg"),
            ]),
            ..RestoreRequest::default()
        };
        let err = h.relocator.restore(&sample(), &request).unwrap_err();
        assert!(err.is_configuration(), "{err}");
        assert!(h.copier.calls().is_empty());
    }

    #[test]
    fn configured_internal_registry_overrides_annotation() {
        let copier = Arc::new(MockCopier::default());
        let mut config = RelocationConfig::default();
        config.registry.internal = Some("internal.reg".to_owned());
        let relocator = Relocator::new(
            config,
            false,
            Arc::new(StaticToken::new("sa-token")),
            copier.clone(),
            Arc::new(NoTransports),
        )
        .unwrap();
        relocator
            .backup(
                &sample(),
                &backup_request(&[
                    (BACKUP_REGISTRY_HOSTNAME, "elsewhere.reg"),
                    (MIGRATION_REGISTRY, "migration.reg"),
                ]),
            )
            .unwrap();
        assert_eq!(
            copier.calls()[0].0,
            "docker://internal.reg/ns/app@sha256:aaa"
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = RelocationConfig::default();
        config.retry.attempts = 0;
        let result = Relocator::new(
            config,
            false,
            Arc::new(StaticToken::none()),
            Arc::new(MockCopier::default()),
            Arc::new(NoTransports),
        );
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn plan_does_not_copy() {
        let h = harness(false, Arc::new(NoTransports));
        let plan = h
            .relocator
            .plan_backup(
                &sample(),
                &backup_request(&[
                    (BACKUP_REGISTRY_HOSTNAME, "internal.reg"),
                    (MIGRATION_REGISTRY, "migration.reg"),
                ]),
            )
            .unwrap();
        let Plan::Copies(copies) = plan else {
            panic!("expected copies");
        };
        assert_eq!(copies.len(), 1);
        assert_eq!(
            copies[0].destination.to_string(),
            "docker://migration.reg/ns/app:latest"
        );
        assert!(h.copier.calls().is_empty());
    }
}
