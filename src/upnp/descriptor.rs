//! Control URL lookup in a UPnP device descriptor.

use roxmltree::{Document, Node, ParsingOptions};

pub const WAN_IP_SERVICE: &str = "WANIPConnection";

/// Control URL of the first `service` element whose `serviceType`
/// mentions `WANIPConnection`, with entities and CDATA resolved.
///
/// Elements are matched by local name, so namespaced descriptors work as
/// well. Returns `Ok(None)` when no such service carries a control URL.
pub fn control_url(descriptor: &str) -> Result<Option<String>, roxmltree::Error> {
    let options = ParsingOptions { allow_dtd: true, ..ParsingOptions::default() };
    let document = Document::parse_with_options(descriptor, options)?;

    let url = document
        .descendants()
        .filter(|node| is_element(node, "service"))
        .find(|service| {
            child_text(service, "serviceType")
                .is_some_and(|service_type| service_type.contains(WAN_IP_SERVICE))
        })
        .and_then(|service| child_text(&service, "controlURL"))
        .filter(|url| !url.is_empty());

    Ok(url)
}

fn is_element(node: &Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn child_text(node: &Node<'_, '_>, name: &str) -> Option<String> {
    let child = node.children().find(|child| is_element(child, name))?;
    let text: String = child
        .children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    Some(text.trim().to_string())
}
