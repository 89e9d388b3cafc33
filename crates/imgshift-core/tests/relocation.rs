//! Backup and restore of an image stream across in-process fake registries.

use imgshift_core::{BackupRequest, Relocation, Relocator, RestoreRequest};
use imgshift_registry::testing::FakeRegistry;
use imgshift_registry::{
    CancelToken, Copier, ImageCopier, ObjectStoreLocations, RegistryTransfer, RetryPolicy,
    StaticToken, TransportResolver,
};
use imgshift_schema::annotations::{
    BACKUP_REGISTRY_HOSTNAME, MIGRATION_REGISTRY, RESTORE_REGISTRY_HOSTNAME,
};
use imgshift_schema::{ImageVersionSet, RelocationConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const TOKEN: &str = "sa-token";

fn relocator(hosts: &[&FakeRegistry], object_transport: bool, store: &Path) -> Relocator {
    let mut config = RelocationConfig::default();
    config.registry.request_timeout_secs = 10;
    let transfer =
        RegistryTransfer::new().with_plain_http_hosts(hosts.iter().map(|r| r.host.clone()));
    let copier: Arc<dyn ImageCopier> = Arc::new(
        Copier::new(transfer, CancelToken::new()).with_retry(RetryPolicy::new(2, Duration::ZERO)),
    );
    let transports: Arc<dyn TransportResolver> = Arc::new(ObjectStoreLocations::new(store));
    Relocator::new(
        config,
        object_transport,
        Arc::new(StaticToken::new(TOKEN)),
        copier,
        transports,
    )
    .unwrap()
}

fn image_stream(reference: &str, digest: &str) -> ImageVersionSet {
    let doc = format!(
        r#"{{
  "apiVersion": "image.openshift.io/v1",
  "kind": "ImageStream",
  "metadata": {{"name": "app", "namespace": "ns", "resourceVersion": "42"}},
  "status": {{
    "tags": [
      {{"tag": "v1", "items": [
        {{"dockerImageReference": "{reference}", "image": "{digest}", "created": "2024-05-01T10:00:00Z"}}
      ]}}
    ]
  }}
}}"#
    );
    ImageVersionSet::from_json(&doc).unwrap()
}

fn annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[test]
fn backup_then_restore_through_migration_registry() {
    let internal = FakeRegistry::start_with_token(TOKEN);
    let migration = FakeRegistry::start();
    let target = FakeRegistry::start_with_token(TOKEN);
    let digest = internal.seed_image("ns/app", "v1", &[b"base-layer", b"app-layer"]);
    let set = image_stream(&format!("{}/ns/app@{digest}", internal.host), &digest);
    let store = tempfile::tempdir().unwrap();
    let relocator = relocator(&[&internal, &migration, &target], false, store.path());

    let backup = BackupRequest {
        annotations: annotations(&[
            (BACKUP_REGISTRY_HOSTNAME, internal.host.as_str()),
            (MIGRATION_REGISTRY, migration.host.as_str()),
        ]),
        storage_location: None,
    };
    let result = relocator.backup(&set, &backup).unwrap();
    let Relocation::Relocated { set: backed_up, outcome } = result else {
        panic!("backup was skipped");
    };
    assert!(outcome.local_image_copied_by_tag);
    assert_eq!(backed_up, set);
    assert!(migration.manifest("ns/app", "v1").is_some());

    let restore = RestoreRequest {
        backup_annotations: backup.annotations.clone(),
        restore_annotations: annotations(&[(RESTORE_REGISTRY_HOSTNAME, target.host.as_str())]),
        storage_location: None,
        namespace_mapping: annotations(&[("ns", "ns-new")]),
    };
    let result = relocator.restore(&backed_up, &restore).unwrap();
    assert_eq!(result.resource(&backed_up), &backed_up);
    assert_eq!(
        target.manifest("ns-new/app", "v1"),
        internal.manifest("ns/app", "v1")
    );
}

#[test]
fn backup_through_object_transport() {
    let internal = FakeRegistry::start_with_token(TOKEN);
    let target = FakeRegistry::start_with_token(TOKEN);
    let digest = internal.seed_image("ns/app", "v1", &[b"layer"]);
    let set = image_stream(&format!("{}/ns/app@{digest}", internal.host), &digest);
    let store = tempfile::tempdir().unwrap();
    let relocator = relocator(&[&internal, &target], true, store.path());

    let backup = BackupRequest {
        annotations: annotations(&[(BACKUP_REGISTRY_HOSTNAME, internal.host.as_str())]),
        storage_location: Some("default".to_owned()),
    };
    relocator.backup(&set, &backup).unwrap();
    assert!(store
        .path()
        .join("default/docker/registry/v2/repositories/ns/app/_manifests/tags/v1/current/link")
        .exists());

    let restore = RestoreRequest {
        backup_annotations: backup.annotations.clone(),
        restore_annotations: annotations(&[(RESTORE_REGISTRY_HOSTNAME, target.host.as_str())]),
        storage_location: Some("default".to_owned()),
        namespace_mapping: BTreeMap::new(),
    };
    relocator.restore(&set, &restore).unwrap();
    assert_eq!(
        target.manifest("ns/app", "v1"),
        internal.manifest("ns/app", &digest)
    );
}

#[test]
fn unreachable_migration_registry_fails_the_walk() {
    let internal = FakeRegistry::start_with_token(TOKEN);
    let digest = internal.seed_image("ns/app", "v1", &[b"layer"]);
    let set = image_stream(&format!("{}/ns/app@{digest}", internal.host), &digest);
    let store = tempfile::tempdir().unwrap();
    let relocator = relocator(&[&internal], false, store.path());

    let backup = BackupRequest {
        annotations: annotations(&[
            (BACKUP_REGISTRY_HOSTNAME, internal.host.as_str()),
            (MIGRATION_REGISTRY, "127.0.0.1:9"),
        ]),
        storage_location: None,
    };
    let err = relocator.backup(&set, &backup).unwrap_err();
    assert!(!err.is_configuration(), "{err}");
}
