use super::{annotation_map, finish, load_resource, spin_fail, spin_ok, spinner, Failure, Session};
use clap::Args;
use imgshift_core::RestoreRequest;
use imgshift_schema::ImageVersionSet;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Image stream JSON file, or `-` for stdin.
    pub resource: PathBuf,
    /// Annotation recorded on the backup as `key=value` (repeatable).
    /// Defaults to the resource's own annotations.
    #[arg(long = "backup-annotation", value_name = "KEY=VALUE")]
    pub backup_annotations: Vec<String>,
    /// Annotation of the restore as `key=value` (repeatable).
    #[arg(long = "restore-annotation", value_name = "KEY=VALUE")]
    pub restore_annotations: Vec<String>,
    /// Backup storage location for `bsl://` routing.
    #[arg(long)]
    pub storage_location: Option<String>,
    /// Namespace mapping as `source=destination` (repeatable).
    #[arg(long = "namespace-map", value_name = "SRC=DEST")]
    pub namespace_map: Vec<String>,
    /// Write the resulting resource here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl RestoreArgs {
    pub fn request(&self, set: &ImageVersionSet) -> Result<RestoreRequest, Failure> {
        let backup_annotations = if self.backup_annotations.is_empty() {
            set.annotations().clone()
        } else {
            annotation_map(&self.backup_annotations)?
        };
        Ok(RestoreRequest {
            backup_annotations,
            restore_annotations: annotation_map(&self.restore_annotations)?,
            storage_location: self.storage_location.clone(),
            namespace_mapping: annotation_map(&self.namespace_map)?,
        })
    }
}

pub fn run(session: &Session, args: &RestoreArgs) -> Result<u8, Failure> {
    let set = load_resource(&args.resource)?;
    let request = args.request(&set)?;
    let relocator = session.relocator()?;

    let pb = spinner(&format!("restoring images of {}/{}", set.namespace(), set.name()));
    match relocator.restore(&set, &request) {
        Ok(relocation) => {
            spin_ok(&pb, &format!("restore of {}/{} done", set.namespace(), set.name()));
            finish(session, &relocation, &set, args.output.as_deref())
        }
        Err(e) => {
            spin_fail(&pb, "restore failed");
            Err(e.into())
        }
    }
}
