use super::{annotation_map, finish, load_resource, spin_fail, spin_ok, spinner, Failure, Session};
use clap::Args;
use imgshift_core::BackupRequest;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct BackupArgs {
    /// Image stream JSON file, or `-` for stdin.
    pub resource: PathBuf,
    /// Backup annotation as `key=value` (repeatable). Defaults to the
    /// resource's own annotations.
    #[arg(long = "annotation", value_name = "KEY=VALUE")]
    pub annotations: Vec<String>,
    /// Backup storage location for `bsl://` routing.
    #[arg(long)]
    pub storage_location: Option<String>,
    /// Write the resulting resource here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl BackupArgs {
    pub fn request(&self, set: &imgshift_schema::ImageVersionSet) -> Result<BackupRequest, Failure> {
        let annotations = if self.annotations.is_empty() {
            set.annotations().clone()
        } else {
            annotation_map(&self.annotations)?
        };
        Ok(BackupRequest {
            annotations,
            storage_location: self.storage_location.clone(),
        })
    }
}

pub fn run(session: &Session, args: &BackupArgs) -> Result<u8, Failure> {
    let set = load_resource(&args.resource)?;
    let request = args.request(&set)?;
    let relocator = session.relocator()?;

    let pb = spinner(&format!("backing up images of {}/{}", set.namespace(), set.name()));
    match relocator.backup(&set, &request) {
        Ok(relocation) => {
            spin_ok(&pb, &format!("backup of {}/{} done", set.namespace(), set.name()));
            finish(session, &relocation, &set, args.output.as_deref())
        }
        Err(e) => {
            spin_fail(&pb, "backup failed");
            Err(e.into())
        }
    }
}
