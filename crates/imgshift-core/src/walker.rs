use crate::CoreError;
use imgshift_registry::{
    build_locators, classify, reconcile, ImageCopier, Locator, LocatorRequest, RegistryContext,
    TransportResolver,
};
use imgshift_schema::{ImageVersionSet, TagHistory, VersionRecord};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Internal registry to migration registry. Records follow digest changes.
    Backup,
    /// Migration registry to internal registry. Records are left as they are.
    Restore,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => f.write_str("backup"),
            Self::Restore => f.write_str("restore"),
        }
    }
}

/// Where a walk copies local images from and to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Host path prefix that marks a record as local. Empty matches nothing.
    pub internal_path: String,
    pub source_registry: Option<String>,
    pub dest_registry: Option<String>,
    pub dest_namespace: String,
    pub direction: Direction,
}

#[derive(Debug, Clone)]
pub struct WalkPlan {
    pub route: Route,
    pub source_context: RegistryContext,
    pub dest_context: RegistryContext,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOutcome {
    pub local_image_copied: bool,
    pub local_image_copied_by_tag: bool,
}

/// One copy a walk would perform.
#[derive(Debug, Clone)]
pub struct PlannedCopy {
    pub tag: String,
    /// Position of the record within its tag history.
    pub index: usize,
    pub source: Locator,
    pub destination: Locator,
}

impl PlannedCopy {
    pub fn moves_tag(&self) -> bool {
        self.destination.tag().is_some()
    }
}

/// Copy every local image of `set` along `plan.route` and return the updated
/// resource.
///
/// Tag histories are visited in order and their records last to first, so a
/// moved tag pointer always ends up on the newest record. The input is never
/// modified; on error no resource is returned.
pub fn walk(
    set: &ImageVersionSet,
    plan: &WalkPlan,
    copier: &dyn ImageCopier,
    transports: &dyn TransportResolver,
) -> Result<(ImageVersionSet, CopyOutcome), CoreError> {
    let route = &plan.route;
    let mut outcome = CopyOutcome::default();
    let mut histories = Vec::with_capacity(set.tag_histories().len());

    for history in set.tag_histories() {
        let mut replaced = BTreeMap::new();
        for step in local_copies(set, route, history, transports)? {
            let manifest = copier.copy(
                &step.source,
                &step.destination,
                &plan.source_context,
                &plan.dest_context,
            )?;
            info!("{}: copied {} -> {}", route.direction, step.source, step.destination);
            outcome.local_image_copied = true;
            outcome.local_image_copied_by_tag |= step.moves_tag();

            if route.direction == Direction::Backup {
                let record = &history.items[step.index];
                let reconciled =
                    reconcile(&manifest, &record.content_digest, &record.source_locator)?;
                if reconciled.changed {
                    info!(
                        "tag {}: {} now {}",
                        history.tag, record.source_locator, reconciled.locator
                    );
                    replaced.insert(
                        step.index,
                        record.with_digest(reconciled.digest, reconciled.locator),
                    );
                }
            }
        }
        histories.push(rebuild(history, replaced));
    }

    let next = if set.status.is_some() {
        set.with_tag_histories(histories)
    } else {
        set.clone()
    };
    Ok((next, outcome))
}

/// The copies [`walk`] would perform, in the order it would perform them.
pub fn plan_copies(
    set: &ImageVersionSet,
    route: &Route,
    transports: &dyn TransportResolver,
) -> Result<Vec<PlannedCopy>, CoreError> {
    let mut copies = Vec::new();
    for history in set.tag_histories() {
        copies.extend(local_copies(set, route, history, transports)?);
    }
    Ok(copies)
}

fn local_copies(
    set: &ImageVersionSet,
    route: &Route,
    history: &TagHistory,
    transports: &dyn TransportResolver,
) -> Result<Vec<PlannedCopy>, CoreError> {
    let copy_to_tag = match set.spec_tag(&history.tag) {
        Some(spec) => spec.moves_tag_pointer(set.namespace()),
        None => true,
    };
    let last = history.items.len().saturating_sub(1);

    let mut copies = Vec::new();
    for (index, record) in history.items.iter().enumerate().rev() {
        let class = classify(&record.source_locator, &route.internal_path);
        if !class.is_local {
            debug!("tag {}: {} is not local, skipping", history.tag, record.source_locator);
            continue;
        }
        let dest_tag = (copy_to_tag && index == last).then_some(history.tag.as_str());
        let (source, destination) = build_locators(
            &LocatorRequest {
                relative_path: class.relative_path,
                dest_namespace: &route.dest_namespace,
                dest_repository: set.name(),
                dest_tag,
                source_registry: route.source_registry.as_deref(),
                dest_registry: route.dest_registry.as_deref(),
            },
            transports,
        )?;
        copies.push(PlannedCopy {
            tag: history.tag.clone(),
            index,
            source,
            destination,
        });
    }
    Ok(copies)
}

fn rebuild(history: &TagHistory, mut replaced: BTreeMap<usize, VersionRecord>) -> TagHistory {
    let items = history
        .items
        .iter()
        .enumerate()
        .map(|(index, record)| replaced.remove(&index).unwrap_or_else(|| record.clone()))
        .collect();
    TagHistory {
        tag: history.tag.clone(),
        items,
        extra: history.extra.clone(),
    }
}
