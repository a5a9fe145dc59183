//! XML helpers shared by the message parser and serializer.
//!
//! Payload fragments (operation elements, reply data, notification content)
//! are re-serialized from the parsed tree instead of being sliced out of the
//! source text. Each fragment then declares its own default namespace and
//! stays well-formed no matter which prefixes the peer used.

use std::fmt::Write;

use roxmltree::{Document, Node};

/// Escape character data.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape an attribute value (double-quoted).
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            _ => out.push(c),
        }
    }
    out
}

/// Parse a document; leading whitespace left over from framing is ignored.
pub fn parse_document(text: &str) -> Result<Document<'_>, roxmltree::Error> {
    Document::parse(text.trim_start())
}

/// Concatenated text of all descendant text nodes.
pub fn text_content(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

/// First element child with the given local name.
pub fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

/// Element children of a node.
pub fn element_children<'a, 'input>(
    node: Node<'a, 'input>,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

/// Re-serialize a sequence of sibling elements (reply data, event
/// content) so every element is self-contained. Fragments without a
/// namespace inherit `default_ns`, as they would inside the message.
pub fn normalize_fragment(fragment: &str, default_ns: &str) -> Result<String, roxmltree::Error> {
    let wrapped = format!("<fragment xmlns=\"{}\">{fragment}</fragment>", escape_attr(default_ns));
    let doc = Document::parse(&wrapped)?;
    Ok(element_children(doc.root_element()).map(canonical_xml).collect())
}

/// Serialize an element subtree as a self-contained fragment.
///
/// Elements use default-namespace declarations only where the namespace
/// changes; namespaced attributes keep their prefix and get a local
/// declaration. Comments and processing instructions are dropped.
pub fn canonical_xml(node: Node<'_, '_>) -> String {
    let mut out = String::new();
    write_element(node, None, &mut out);
    out
}

fn write_element(node: Node<'_, '_>, inherited_ns: Option<&str>, out: &mut String) {
    let name = node.tag_name().name();
    let ns = node.tag_name().namespace();

    out.push('<');
    out.push_str(name);
    if ns != inherited_ns {
        let _ = write!(out, " xmlns=\"{}\"", escape_attr(ns.unwrap_or("")));
    }
    for attr in node.attributes() {
        match attr.namespace() {
            Some(attr_ns) => {
                let prefix = node.lookup_prefix(attr_ns).unwrap_or("ns");
                let _ = write!(
                    out,
                    " xmlns:{prefix}=\"{}\" {prefix}:{}=\"{}\"",
                    escape_attr(attr_ns),
                    attr.name(),
                    escape_attr(attr.value())
                );
            },
            None => {
                let _ = write!(out, " {}=\"{}\"", attr.name(), escape_attr(attr.value()));
            },
        }
    }

    let mut children = node
        .children()
        .filter(|c| c.is_element() || c.is_text())
        .peekable();
    if children.peek().is_none() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for c in children {
        if c.is_element() {
            write_element(c, ns, out);
        } else if let Some(text) = c.text() {
            out.push_str(&escape_text(text));
        }
    }
    let _ = write!(out, "</{name}>");
}
