//! Namespace-agnostic path queries over `roxmltree` nodes.
//!
//! Paths are `/`-separated element local names relative to a node; `*`
//! matches any element. Every query yields `Option`/empty on absence.

use roxmltree::Node;

use crate::text_or_none;

pub(crate) fn nodes<'a, 'i>(node: Node<'a, 'i>, path: &str) -> Vec<Node<'a, 'i>> {
    let mut current = vec![node];
    for step in path.split('/').filter(|s| !s.is_empty()) {
        current = current
            .into_iter()
            .flat_map(|n| {
                n.children()
                    .filter(|c| c.is_element() && (step == "*" || c.tag_name().name() == step))
                    .collect::<Vec<_>>()
            })
            .collect();
        if current.is_empty() {
            break;
        }
    }
    current
}

pub(crate) fn first<'a, 'i>(node: Node<'a, 'i>, path: &str) -> Option<Node<'a, 'i>> {
    nodes(node, path).into_iter().next()
}

pub(crate) fn node_text(node: Node<'_, '_>) -> Option<String> {
    let text = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>();
    text_or_none(text)
}

pub(crate) fn text(node: Node<'_, '_>, path: &str) -> Option<String> {
    first(node, path).and_then(node_text)
}

pub(crate) fn texts(node: Node<'_, '_>, path: &str) -> Vec<String> {
    nodes(node, path).into_iter().filter_map(node_text).collect()
}

/// Attribute lookup by local name, ignoring the attribute's namespace.
pub(crate) fn attr_of(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.attributes()
        .find(|a| a.name() == name)
        .and_then(|a| text_or_none(a.value()))
}

pub(crate) fn attr(node: Node<'_, '_>, path: &str, name: &str) -> Option<String> {
    first(node, path).and_then(|n| attr_of(n, name))
}

/// RDF properties carry their value either as `rdf:resource` or as text.
pub(crate) fn resource_or_text(node: Node<'_, '_>, path: &str) -> Option<String> {
    let target = first(node, path)?;
    attr_of(target, "resource").or_else(|| node_text(target))
}

pub(crate) fn descendants<'a, 'i>(node: Node<'a, 'i>, name: &'a str) -> impl Iterator<Item = Node<'a, 'i>> + 'a {
    node.descendants()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

/// Source slice of the element, used as the stored original document.
pub(crate) fn outer_xml(node: Node<'_, '_>) -> String {
    node.document().input_text()[node.range()].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<a:root xmlns:a="urn:a" xmlns:b="urn:b">
        <a:item b:code="x1"><b:name> First </b:name></a:item>
        <a:item><b:name>Second</b:name><b:link rdf:resource="https://x.org" xmlns:rdf="urn:rdf"/></a:item>
        <a:empty>   </a:empty>
    </a:root>"#;

    #[test]
    fn paths_ignore_namespaces_and_trim_text() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let root = doc.root_element();
        assert_eq!(text(root, "item/name").as_deref(), Some("First"));
        assert_eq!(texts(root, "item/name"), vec!["First", "Second"]);
        assert_eq!(text(root, "*/name").as_deref(), Some("First"));
        assert_eq!(text(root, "empty"), None);
        assert_eq!(text(root, "missing/name"), None);
    }

    #[test]
    fn attributes_and_rdf_resources() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let root = doc.root_element();
        assert_eq!(attr(root, "item", "code").as_deref(), Some("x1"));
        let second = nodes(root, "item")[1];
        assert_eq!(resource_or_text(second, "link").as_deref(), Some("https://x.org"));
        assert_eq!(resource_or_text(second, "name").as_deref(), Some("Second"));
        assert!(outer_xml(second).starts_with("<a:item>"));
    }
}
