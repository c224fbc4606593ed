//! Index Document Factory: assembles one [`IndexDocument`] from a mapper.

use harvester_core::{Extras, IndexDocument, Metadata, Summary};
use tracing::{debug, warn};

use crate::{HookRegistry, IdGenerator, Mapper};

/// Owns the per-run id generator and the hook registry.
#[derive(Debug, Default)]
pub struct IndexDocumentFactory {
    ids: IdGenerator,
    hooks: HookRegistry,
}

impl IndexDocumentFactory {
    pub fn new(hooks: HookRegistry) -> Self {
        Self {
            ids: IdGenerator::new(),
            hooks,
        }
    }

    /// Calls every getter once, in a fixed order, then runs the source's
    /// configured hooks. Never fails; problems end up in the document's
    /// harvesting errors and in `summary`.
    pub fn create(&mut self, mapper: &dyn Mapper, summary: &mut Summary) -> IndexDocument {
        let identifier = mapper.generated_id(&mut self.ids);
        let adms_identifier = mapper.adms_identifier();
        let resource_identifier = mapper.resource_identifier();
        let title = mapper.title();
        let description = mapper.description();
        let source = mapper.metadata_source();
        let harvested = mapper.harvesting_date();
        let issued = mapper.issued();
        let modified = mapper.modified_date();
        let publisher = mapper.publisher();
        let maintainers = mapper.maintainers();
        let contributors = mapper.contributors();
        let contact_point = mapper.contact_point();
        let keywords = mapper.keywords();
        let distributions = mapper.distributions();
        let bounding_box = mapper.bounding_box();
        let spatial = mapper.spatial();
        let centroid = mapper.centroid();
        let spatial_text = mapper.spatial_text();
        let plan_name = mapper.plan_name();
        let plan_state = mapper.plan_state();
        let plan_type = mapper.plan_type();
        let plan_type_fine = mapper.plan_type_fine();
        let procedure_state = mapper.procedure_state();
        let procedure_type = mapper.procedure_type();
        let procedure_period = mapper.procedure_period();
        let process_steps = mapper.process_steps();

        let total = distributions.len();
        let distributions = distributions
            .into_iter()
            .filter(|d| !d.access_url.trim().is_empty())
            .collect::<Vec<_>>();
        if distributions.len() < total {
            warn!(identifier, dropped = total - distributions.len(), "distributions without accessURL dropped");
        }

        let start_date = procedure_period.as_ref().and_then(|p| p.gte);
        let mut document = IndexDocument {
            identifier,
            adms_identifier,
            resource_identifier,
            title,
            description,
            keywords,
            publisher,
            maintainers,
            contributors,
            contact_point,
            distributions,
            catalog: mapper.context().settings.catalog.clone(),
            plan_name,
            plan_state,
            plan_type,
            plan_type_fine,
            procedure_state,
            procedure_type,
            procedure_period,
            procedure_start_date: start_date,
            plan_or_procedure_start_date: start_date,
            process_steps,
            bounding_box,
            spatial,
            centroid,
            spatial_text,
            issued,
            modified,
            extras: Extras {
                metadata: Metadata {
                    harvested,
                    issued: harvested,
                    modified: modified.unwrap_or(harvested),
                    source,
                    harvesting_errors: Vec::new(),
                    is_valid: true,
                    merged_from: Vec::new(),
                    quality_notes: Vec::new(),
                },
                transformed_data: None,
            },
        };
        let own_id = document.canonical_id();
        document.record_merged_from(own_id);

        document.extras.metadata.harvesting_errors = mapper.context().errors();
        document.set_valid(mapper.context().is_valid());

        self.execute_custom_code(&mapper.context().settings.custom_hooks, &mut document, summary);
        document
    }

    fn execute_custom_code(&self, hooks: &[String], document: &mut IndexDocument, summary: &mut Summary) {
        for name in hooks {
            match self.hooks.run(name, document) {
                Ok(()) => debug!(hook = %name, identifier = %document.identifier, "hook applied"),
                Err(err) => {
                    warn!(identifier = %document.identifier, error = %err, "hook failed");
                    document.extras.metadata.harvesting_errors.push(err.to_string());
                    summary.app_error(format!("{}: {err}", document.identifier));
                }
            }
        }
    }
}
