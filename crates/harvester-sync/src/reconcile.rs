//! Bucket Reconciliation Engine.
//!
//! Turns one [`Bucket`] into the minimal ordered list of index operations:
//! deletes for ids that are no longer canonical, then exactly one index
//! operation for the merged document.

use std::collections::{HashMap, HashSet};

use harvester_core::geometry::{bounding_box, centroid, sanitize};
use harvester_core::{Distribution, IndexDocument, SourceType, TransformedData};
use harvester_storage::IndexOperation;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bucket::Bucket;
use crate::export;

pub const NOTE_NO_GEOMETRY: &str = "No valid geometry";
pub const NOTE_WINDING_FIXED: &str = "Geometry winding order corrected";
pub const NOTE_CENTROID_DERIVED: &str = "Centroid derived from spatial";

/// Service formats whose resolved geometry is authoritative for `spatial`.
const GEOMETRY_SERVICE_FORMATS: &[&str] = &["WFS"];

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("bucket {anchor_id} has {services} service(s) but no dataset record")]
    NoPrimary { anchor_id: i64, services: usize },
    #[error("rendering the DCAT-AP.PLU export: {0}")]
    Export(#[from] serde_json::Error),
}

/// Primary plus the duplicates its tier retains, in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct Prioritized {
    pub primary: IndexDocument,
    pub duplicates: Vec<IndexDocument>,
    pub discarded: Vec<IndexDocument>,
}

/// Picks the primary record by source-type rank.
///
/// The highest ranked type present wins with its first record. The tier
/// decides which other records survive as duplicates: `cockpit` keeps
/// `beteiligungsdb`, `csw` keeps `wfs`, `wfs` keeps further `wfs` records,
/// everything else is discarded. Without any ranked type the first record
/// wins and all others are duplicates.
pub fn prioritize(records: Vec<IndexDocument>) -> Option<Prioritized> {
    let tier = SourceType::ranked()
        .into_iter()
        .find(|rank| records.iter().any(|r| r.source_type() == rank));

    let mut iter = records.into_iter();
    let Some(tier) = tier else {
        let primary = iter.next()?;
        return Some(Prioritized {
            primary,
            duplicates: iter.collect(),
            discarded: Vec::new(),
        });
    };

    let retained = match tier {
        SourceType::Wfs => Some(SourceType::Wfs),
        ref other => other.retained_duplicate(),
    };
    let mut primary = None;
    let mut duplicates = Vec::new();
    let mut discarded = Vec::new();
    for record in iter {
        if primary.is_none() && record.source_type() == &tier {
            primary = Some(record);
        } else if retained.as_ref() == Some(record.source_type()) {
            duplicates.push(record);
        } else {
            discarded.push(record);
        }
    }
    let mut primary = primary?;
    if tier == SourceType::Csw {
        // Confirmed by a geometry-authoritative duplicate during merging.
        primary.set_valid(false);
    }
    Some(Prioritized {
        primary,
        duplicates,
        discarded,
    })
}

/// Merges `incoming` into `distributions`, collapsing entries that share a
/// content hash. Resolved geometries never survive into the document.
pub fn merge_distributions(distributions: &mut Vec<Distribution>, incoming: impl IntoIterator<Item = Distribution>) {
    let existing = std::mem::take(distributions);
    let mut positions: HashMap<String, usize> = HashMap::new();
    for mut dist in existing.into_iter().chain(incoming) {
        dist.resolved_geometry = None;
        let hash = dist.content_hash();
        match positions.get(&hash) {
            Some(&idx) => distributions[idx].absorb(dist),
            None => {
                positions.insert(hash, distributions.len());
                distributions.push(dist);
            }
        }
    }
}

/// Couples operating services into the primary. A geometry-bearing service
/// with a resolved geometry overrides `spatial`; the bounding box follows it
/// and the centroid is left to sanitization.
pub fn couple_services(primary: &mut IndexDocument, services: Vec<Distribution>) {
    for service in &services {
        let authoritative = GEOMETRY_SERVICE_FORMATS.iter().any(|tag| service.has_format(tag));
        if let (true, Some(geometry)) = (authoritative, service.resolved_geometry.as_ref()) {
            primary.bounding_box = bounding_box(geometry);
            primary.centroid = None;
            primary.spatial = Some(geometry.clone());
        }
    }
    merge_distributions(&mut primary.distributions, services);
}

fn is_geometry_authoritative(document: &IndexDocument) -> bool {
    document
        .extras
        .metadata
        .source
        .source_base
        .to_ascii_lowercase()
        .contains("wfs")
}

/// Field allowlist a `csw` primary takes from its `wfs` duplicate. Absent
/// values on the duplicate leave the primary untouched.
fn overwrite_from(primary: &mut IndexDocument, duplicate: &IndexDocument) {
    fn take<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
        if source.is_some() {
            target.clone_from(source);
        }
    }

    if !duplicate.catalog.identifier.is_empty() {
        primary.catalog = duplicate.catalog.clone();
    }
    take(&mut primary.bounding_box, &duplicate.bounding_box);
    take(&mut primary.spatial, &duplicate.spatial);
    take(&mut primary.centroid, &duplicate.centroid);
    take(&mut primary.spatial_text, &duplicate.spatial_text);
    take(&mut primary.plan_name, &duplicate.plan_name);
    take(&mut primary.plan_type_fine, &duplicate.plan_type_fine);
    take(&mut primary.procedure_period, &duplicate.procedure_period);
    take(&mut primary.procedure_start_date, &duplicate.procedure_start_date);
    take(&mut primary.plan_or_procedure_start_date, &duplicate.plan_or_procedure_start_date);
    if !duplicate.plan_state.is_unknown() {
        primary.plan_state = duplicate.plan_state;
    }
    if !duplicate.plan_type.is_unknown() {
        primary.plan_type = duplicate.plan_type;
    }
    if !duplicate.procedure_state.is_unknown() {
        primary.procedure_state = duplicate.procedure_state;
    }
    if !duplicate.procedure_type.is_unknown() {
        primary.procedure_type = duplicate.procedure_type;
    }
    if !duplicate.process_steps.is_empty() {
        primary.process_steps = duplicate.process_steps.clone();
    }

    if primary.publisher.is_none() {
        primary.publisher = duplicate.publisher.clone();
    }
    if primary.maintainers.is_empty() {
        primary.maintainers = duplicate.maintainers.clone();
    }
    if is_geometry_authoritative(duplicate) && duplicate.is_valid() {
        primary.set_valid(true);
    }
}

/// Applies the primary's tier rule for one duplicate. Returns whether any
/// field was taken over.
pub fn merge_duplicate(primary: &mut IndexDocument, duplicate: &IndexDocument) -> bool {
    match primary.source_type() {
        SourceType::Cockpit if duplicate.source_type() == &SourceType::BeteiligungsDb => {
            primary.process_steps = duplicate.process_steps.clone();
            true
        }
        SourceType::Csw => {
            overwrite_from(primary, duplicate);
            true
        }
        _ => false,
    }
}

/// Geometry validation, quality notes and centroid derivation.
pub fn sanitize_document(document: &mut IndexDocument) {
    match document.spatial.as_ref().and_then(sanitize) {
        Some(sanitized) => {
            if sanitized.flipped {
                document.add_quality_note(NOTE_WINDING_FIXED);
            }
            if document.centroid.is_none() {
                document.centroid = centroid(&sanitized.geometry);
                if document.centroid.is_some() {
                    document.add_quality_note(NOTE_CENTROID_DERIVED);
                }
            }
            document.spatial = Some(sanitized.geometry);
        }
        None => {
            document.spatial = None;
            document.set_valid(false);
            document.add_quality_note(NOTE_NO_GEOMETRY);
        }
    }
    let errors = document
        .distributions
        .iter()
        .flat_map(|d| d.errors.iter().map(move |e| format!("{}: {e}", d.access_url)))
        .collect::<Vec<_>>();
    for error in errors {
        document.add_quality_note(error);
    }
}

/// Per-pass engine state: the indexed-id snapshot, kept current as
/// operations are emitted.
#[derive(Debug, Default)]
pub struct Reconciler {
    indexed: Option<HashSet<String>>,
}

impl Reconciler {
    pub fn new(indexed: Option<HashSet<String>>) -> Self {
        Self { indexed }
    }

    fn is_indexed(&self, id: &str) -> bool {
        self.indexed.as_ref().map_or(true, |ids| ids.contains(id))
    }

    pub fn process(&mut self, bucket: Bucket) -> Result<Vec<IndexOperation>, ReconcileError> {
        let anchor_id = bucket.anchor_id;
        let mut stale = bucket.retired;
        let services = bucket.operating_services.into_values().collect::<Vec<_>>();

        let Some(prioritized) = prioritize(bucket.duplicates.into_values().collect()) else {
            if !services.is_empty() {
                return Err(ReconcileError::NoPrimary {
                    anchor_id,
                    services: services.len(),
                });
            }
            return Ok(self.emit(stale, None));
        };

        let Prioritized {
            mut primary,
            duplicates,
            discarded,
        } = prioritized;
        debug!(
            anchor_id,
            primary = %primary.canonical_id(),
            duplicates = duplicates.len(),
            discarded = discarded.len(),
            "bucket prioritized"
        );
        stale.extend(discarded.iter().map(IndexDocument::canonical_id));

        couple_services(&mut primary, services);

        for duplicate in &duplicates {
            let before = primary.canonical_id();
            merge_duplicate(&mut primary, duplicate);
            let after = primary.canonical_id();
            if after != before {
                debug!(anchor_id, from = %before, to = %after, "canonical id changed");
                primary.record_merged_from(&before);
                stale.push(before);
            }
            let duplicate_id = duplicate.canonical_id();
            if duplicate_id != after {
                stale.push(duplicate_id.clone());
            }
            primary.record_merged_from(duplicate_id);
        }

        let final_id = primary.canonical_id();
        primary.record_merged_from(final_id.clone());
        sanitize_document(&mut primary);
        if !primary.is_valid() {
            warn!(anchor_id, id = %final_id, notes = ?primary.extras.metadata.quality_notes, "reconciled document is invalid");
        }
        primary.extras.transformed_data = Some(TransformedData {
            dcat_ap_plu: export::dcat_ap_plu(&primary)?,
        });
        Ok(self.emit(stale, Some((final_id, primary))))
    }

    fn emit(&mut self, stale: Vec<String>, indexed: Option<(String, IndexDocument)>) -> Vec<IndexOperation> {
        let final_id = indexed.as_ref().map(|(id, _)| id.clone());
        let mut seen = HashSet::new();
        let mut ops = Vec::new();
        for id in stale {
            if Some(&id) == final_id.as_ref() || !seen.insert(id.clone()) || !self.is_indexed(&id) {
                continue;
            }
            ops.push(IndexOperation::Delete { id });
        }
        if let Some(ids) = self.indexed.as_mut() {
            for op in &ops {
                ids.remove(op.id());
            }
            if let Some(id) = &final_id {
                ids.insert(id.clone());
            }
        }
        if let Some((id, document)) = indexed {
            ops.push(IndexOperation::Index {
                id,
                document: Box::new(document),
            });
        }
        ops
    }
}
