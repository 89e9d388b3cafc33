use super::backup::BackupArgs;
use super::restore::RestoreArgs;
use super::{json_pretty, load_resource, write_output, Failure, Session, EXIT_SUCCESS};
use clap::Subcommand;
use imgshift_core::Plan;
use std::fmt::Write as _;

#[derive(Debug, Subcommand)]
pub enum PlanMode {
    /// Show the copies a backup would perform.
    Backup(BackupArgs),
    /// Show the copies a restore would perform.
    Restore(RestoreArgs),
}

pub fn run(session: &Session, mode: &PlanMode) -> Result<u8, Failure> {
    let relocator = session.relocator()?;
    let (plan, output) = match mode {
        PlanMode::Backup(args) => {
            let set = load_resource(&args.resource)?;
            (relocator.plan_backup(&set, &args.request(&set)?)?, args.output.as_deref())
        }
        PlanMode::Restore(args) => {
            let set = load_resource(&args.resource)?;
            (relocator.plan_restore(&set, &args.request(&set)?)?, args.output.as_deref())
        }
    };

    let rendered = if session.json {
        json_pretty(&plan_json(&plan))?
    } else {
        plan_text(&plan)
    };
    write_output(output, &rendered)?;
    Ok(EXIT_SUCCESS)
}

fn plan_json(plan: &Plan) -> serde_json::Value {
    match plan {
        Plan::Skipped(reason) => serde_json::json!({
            "result": "skipped",
            "reason": reason.to_string(),
        }),
        Plan::Copies(copies) => {
            let copies: Vec<_> = copies
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "tag": c.tag,
                        "index": c.index,
                        "source": c.source.to_string(),
                        "destination": c.destination.to_string(),
                        "moves_tag": c.moves_tag(),
                    })
                })
                .collect();
            serde_json::json!({ "result": "planned", "copies": copies })
        }
    }
}

fn plan_text(plan: &Plan) -> String {
    match plan {
        Plan::Skipped(reason) => format!("image copy skipped: {reason}"),
        Plan::Copies(copies) if copies.is_empty() => "no local images to copy".to_owned(),
        Plan::Copies(copies) => {
            let mut out = String::new();
            for (i, c) in copies.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                }
                let _ = write!(out, "{}[{}]: {} -> {}", c.tag, c.index, c.source, c.destination);
            }
            out
        }
    }
}
