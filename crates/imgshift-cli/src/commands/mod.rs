pub mod backup;
pub mod plan;
pub mod restore;

use imgshift_core::{CoreError, Relocation, Relocator};
use imgshift_registry::{
    CancelToken, Copier, CredentialProvider, ObjectStoreLocations, RegistryTransfer, RetryPolicy,
    ServiceAccountToken, StaticToken,
};
use imgshift_schema::{parse_config_file, parse_pairs, ImageVersionSet, RelocationConfig};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_COPY_ERROR: u8 = 3;
pub const EXIT_CANCELLED: u8 = 130;

/// Environment variable enabling `bsl://` routing through the object store.
pub const OBJECT_TRANSPORT_ENV: &str = "IMGSHIFT_OBJECT_TRANSPORT";

/// A failed command: message for stderr and the process exit code.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl Failure {
    pub fn config(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_CONFIG_ERROR,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_FAILURE,
            message: message.into(),
        }
    }
}

impl From<CoreError> for Failure {
    fn from(e: CoreError) -> Self {
        let code = if e.is_cancelled() {
            EXIT_CANCELLED
        } else if e.is_configuration() {
            EXIT_CONFIG_ERROR
        } else {
            EXIT_COPY_ERROR
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<imgshift_schema::SchemaError> for Failure {
    fn from(e: imgshift_schema::SchemaError) -> Self {
        CoreError::from(e).into()
    }
}

/// Process-wide settings shared by every subcommand.
pub struct Session {
    pub config: RelocationConfig,
    pub object_transport: bool,
    pub json: bool,
    token: Option<String>,
    cancel: CancelToken,
}

impl Session {
    pub fn open(
        config_path: Option<&Path>,
        token: Option<String>,
        object_transport: bool,
        json: bool,
        cancel: CancelToken,
    ) -> Result<Self, Failure> {
        let config = match config_path {
            Some(path) => parse_config_file(path)
                .map_err(|e| Failure::config(format!("{}: {e}", path.display())))?,
            None => RelocationConfig::default(),
        };
        Ok(Self {
            config,
            object_transport,
            json,
            token,
            cancel,
        })
    }

    /// Relocator wired to the real registry and object-store transports.
    pub fn relocator(&self) -> Result<Relocator, Failure> {
        let credentials: Arc<dyn CredentialProvider> = match &self.token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(ServiceAccountToken::new(&self.config.registry.token_file)),
        };
        let retry = RetryPolicy::new(
            self.config.retry.attempts,
            Duration::from_secs(self.config.retry.backoff_step_secs),
        );
        let transfer = RegistryTransfer::new()
            .with_plain_http_hosts(self.config.registry.plain_http_hosts.iter().cloned());
        let copier = Copier::new(transfer, self.cancel.clone()).with_retry(retry);
        debug!(
            "retry budget: {} attempts, {}s total wait",
            retry.attempts,
            retry.total_wait().as_secs()
        );

        Ok(Relocator::new(
            self.config.clone(),
            self.object_transport,
            credentials,
            Arc::new(copier),
            Arc::new(ObjectStoreLocations::new(&self.config.object_store.root)),
        )?)
    }
}

/// `true` and `1` enable the object transport; anything else disables it.
pub fn object_transport_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("true")
    })
}

/// Read a resource from a file, or from stdin for `-`.
pub fn load_resource(path: &Path) -> Result<ImageVersionSet, Failure> {
    if path.as_os_str() == "-" {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| Failure::config(format!("failed to read stdin: {e}")))?;
        return Ok(ImageVersionSet::from_json(&input)?);
    }
    ImageVersionSet::load(path)
        .map_err(|e| Failure::config(format!("{}: {e}", path.display())))
}

pub fn annotation_map(pairs: &[String]) -> Result<BTreeMap<String, String>, Failure> {
    Ok(parse_pairs(pairs.iter().map(String::as_str))?)
}

/// Write `content` to `path` atomically, or to stdout when no path is given.
pub fn write_output(path: Option<&Path>, content: &str) -> Result<(), Failure> {
    let Some(path) = path else {
        println!("{content}");
        return Ok(());
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let write = || -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    };
    write().map_err(|e| Failure::other(format!("failed to write {}: {e}", path.display())))
}

pub fn json_pretty(value: &serde_json::Value) -> Result<String, Failure> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Failure::other(format!("JSON serialization failed: {e}")))
}

/// Machine-readable summary of a backup or restore.
pub fn relocation_summary(
    relocation: &Relocation,
    resource: &ImageVersionSet,
) -> Result<serde_json::Value, Failure> {
    let resource = serde_json::to_value(resource)
        .map_err(|e| Failure::other(format!("JSON serialization failed: {e}")))?;
    Ok(match relocation {
        Relocation::Skipped(reason) => serde_json::json!({
            "result": "skipped",
            "reason": reason.to_string(),
            "resource": resource,
        }),
        Relocation::Relocated { outcome, .. } => serde_json::json!({
            "result": "relocated",
            "local_image_copied": outcome.local_image_copied,
            "local_image_copied_by_tag": outcome.local_image_copied_by_tag,
            "resource": resource,
        }),
    })
}

/// Emit the relocated resource and report the outcome.
pub fn finish(
    session: &Session,
    relocation: &Relocation,
    input: &ImageVersionSet,
    output: Option<&Path>,
) -> Result<u8, Failure> {
    let resource = relocation.resource(input);
    if session.json {
        let summary = relocation_summary(relocation, resource)?;
        write_output(output, &json_pretty(&summary)?)?;
    } else {
        write_output(output, &resource.to_json_pretty()?)?;
        match relocation {
            Relocation::Skipped(reason) => eprintln!("image copy skipped: {reason}"),
            Relocation::Relocated { outcome, .. } if !outcome.local_image_copied => {
                eprintln!("no local images to copy");
            }
            Relocation::Relocated { .. } => {}
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish_spinner(pb, &format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish_spinner(pb, &format!("✗ {msg}"));
}

fn finish_spinner(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg.to_owned());
}
