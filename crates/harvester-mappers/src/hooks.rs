//! Named post-processing hooks, resolved per source from a fixed registry.

use std::collections::BTreeMap;

use harvester_core::IndexDocument;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("unknown hook `{0}`")]
    Unknown(String),
    #[error("hook `{hook}` failed: {message}")]
    Failed { hook: String, message: String },
}

pub type HookFn = fn(&mut IndexDocument) -> Result<(), String>;

#[derive(Debug, Clone)]
pub struct HookRegistry {
    hooks: BTreeMap<&'static str, HookFn>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self {
            hooks: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("normalize-whitespace", normalize_whitespace);
        registry.register("drop-formatless-distributions", drop_formatless_distributions);
        registry.register("publisher-from-catalog", publisher_from_catalog);
        registry.register("require-spatial", require_spatial);
        registry
    }

    pub fn register(&mut self, name: &'static str, hook: HookFn) {
        self.hooks.insert(name, hook);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.keys().copied().collect()
    }

    /// Runs one hook against the document; the document may be partially
    /// mutated when the hook fails.
    pub fn run(&self, name: &str, document: &mut IndexDocument) -> Result<(), HookError> {
        let hook = self
            .hooks
            .get(name)
            .ok_or_else(|| HookError::Unknown(name.to_string()))?;
        hook(document).map_err(|message| HookError::Failed {
            hook: name.to_string(),
            message,
        })
    }
}

fn collapse(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_whitespace(doc: &mut IndexDocument) -> Result<(), String> {
    doc.title = collapse(&doc.title);
    doc.description = collapse(&doc.description);
    doc.keywords = doc
        .keywords
        .iter()
        .map(|k| collapse(k))
        .filter(|k| !k.is_empty())
        .collect();
    Ok(())
}

fn drop_formatless_distributions(doc: &mut IndexDocument) -> Result<(), String> {
    doc.distributions.retain(|d| d.format.iter().any(|f| !f.trim().is_empty()));
    Ok(())
}

fn publisher_from_catalog(doc: &mut IndexDocument) -> Result<(), String> {
    if doc.publisher.is_some() {
        return Ok(());
    }
    match doc.catalog.publisher.clone() {
        Some(publisher) => {
            doc.publisher = Some(publisher);
            Ok(())
        }
        None => Err("neither record nor catalog names a publisher".to_string()),
    }
}

fn require_spatial(doc: &mut IndexDocument) -> Result<(), String> {
    if doc.spatial.is_none() && doc.bounding_box.is_none() {
        doc.set_valid(false);
        return Err("record has no spatial extent".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use harvester_core::{Agent, Distribution};

    use super::*;
    use crate::factory::tests::sample_document;

    #[test]
    fn builtins_are_registered() {
        assert_eq!(
            HookRegistry::builtin().names(),
            vec![
                "drop-formatless-distributions",
                "normalize-whitespace",
                "publisher-from-catalog",
                "require-spatial"
            ]
        );
    }

    #[test]
    fn unknown_hooks_are_reported() {
        let mut doc = sample_document();
        assert_eq!(
            HookRegistry::builtin().run("rm -rf", &mut doc),
            Err(HookError::Unknown("rm -rf".into()))
        );
    }

    #[test]
    fn whitespace_and_formats_are_cleaned() {
        let registry = HookRegistry::builtin();
        let mut doc = sample_document();
        doc.title = "  Bebauungsplan \n Nord ".into();
        doc.distributions = vec![Distribution::new("https://x.org/a"), {
            let mut d = Distribution::new("https://x.org/b.pdf");
            d.format = vec!["PDF".into()];
            d
        }];
        registry.run("normalize-whitespace", &mut doc).unwrap();
        registry.run("drop-formatless-distributions", &mut doc).unwrap();
        assert_eq!(doc.title, "Bebauungsplan Nord");
        assert_eq!(doc.distributions.len(), 1);
    }

    #[test]
    fn publisher_falls_back_to_catalog_and_spatial_is_enforced() {
        let registry = HookRegistry::builtin();
        let mut doc = sample_document();
        doc.publisher = None;
        doc.catalog.publisher = Some(Agent::organization("Bezirksamt"));
        registry.run("publisher-from-catalog", &mut doc).unwrap();
        assert_eq!(doc.publisher, Some(Agent::organization("Bezirksamt")));

        doc.spatial = None;
        doc.bounding_box = None;
        let err = registry.run("require-spatial", &mut doc).unwrap_err();
        assert!(matches!(err, HookError::Failed { .. }));
        assert!(!doc.is_valid());
    }
}
