//! Syntactic XML tree used by the canonicalizer, signer and verifier.
//!
//! The tree keeps prefixes, namespace declarations and attribute order exactly as they were
//! parsed or built; namespace resolution happens on demand through [`NamespaceScope`].
//! Comments, processing instructions and DOCTYPE declarations are not represented.
use thiserror::Error;

pub mod constants;
pub mod parse;

use constants::{ID_ATTRIBUTES, XML_NS};

pub use parse::{parse_document, parse_document_bytes};

/// XML parse and structure errors.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error at byte {position}: {message}")]
    Parse { position: u64, message: String },
    #[error("document is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("document has no root element")]
    MissingRoot,
    #[error("unexpected content after the root element")]
    TrailingContent,
    #[error("namespace prefix '{prefix}' is not bound (on <{element}>)")]
    UnboundPrefix { prefix: String, element: String },
}

/// A namespace declaration (`xmlns="..."` or `xmlns:p="..."`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    pub prefix: Option<String>,
    pub uri: String,
}

/// A non-namespace attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn qualified_name(&self) -> String {
        qualified(self.prefix.as_deref(), &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    prefix: Option<String>,
    name: String,
    namespaces: Vec<NamespaceDecl>,
    attributes: Vec<Attribute>,
    children: Vec<Node>,
}

impl Element {
    /// Unprefixed element; it lives in whatever default namespace is in scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            prefix: None,
            name: name.into(),
            namespaces: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn prefixed(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::new(name)
        }
    }

    pub fn with_namespace(mut self, prefix: Option<&str>, uri: impl Into<String>) -> Self {
        self.declare_namespace(prefix, uri);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_prefixed_attribute(
        mut self,
        prefix: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.attributes.push(Attribute {
            prefix: Some(prefix.into()),
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified_name(&self) -> String {
        qualified(self.prefix.as_deref(), &self.name)
    }

    pub fn namespaces(&self) -> &[NamespaceDecl] {
        &self.namespaces
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Node> {
        &mut self.children
    }

    pub fn declare_namespace(&mut self, prefix: Option<&str>, uri: impl Into<String>) {
        let uri = uri.into();
        match self
            .namespaces
            .iter_mut()
            .find(|d| d.prefix.as_deref() == prefix)
        {
            Some(existing) => existing.uri = uri,
            None => self.namespaces.push(NamespaceDecl {
                prefix: prefix.map(str::to_owned),
                uri,
            }),
        }
    }

    /// Sets an unprefixed attribute, replacing an existing one with the same name.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .attributes
            .iter_mut()
            .find(|a| a.prefix.is_none() && a.name == name)
        {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute {
                prefix: None,
                name,
                value,
            }),
        }
    }

    /// Unprefixed attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.prefix.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Fragment identifier (`Id`, `ID` or `id`).
    pub fn id(&self) -> Option<&str> {
        ID_ATTRIBUTES.iter().find_map(|name| self.attribute(name))
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    pub fn has_child_elements(&self) -> bool {
        self.child_elements().next().is_some()
    }

    /// First child element with the given local name, ignoring namespaces.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|el| el.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|node| match node {
            Node::Element(el) if el.name == name => Some(el),
            _ => None,
        })
    }

    /// Walks child elements by local name.
    pub fn descend(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.child(name))
    }

    pub fn descend_mut(&mut self, path: &[&str]) -> Option<&mut Element> {
        let mut current = self;
        for name in path {
            current = current.child_mut(name)?;
        }
        Some(current)
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Replaces all children with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children.clear();
        self.children.push(Node::Text(text.into()));
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn insert_child(&mut self, index: usize, child: Element) {
        let index = index.min(self.children.len());
        self.children.insert(index, Node::Element(child));
    }

    /// Node index of the first child element with the given local name.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|node| matches!(node, Node::Element(el) if el.name == name))
    }

    pub(crate) fn from_parts(
        prefix: Option<String>,
        name: String,
        namespaces: Vec<NamespaceDecl>,
        attributes: Vec<Attribute>,
        children: Vec<Node>,
    ) -> Self {
        Self {
            prefix,
            name,
            namespaces,
            attributes,
            children,
        }
    }
}

/// A parsed or assembled document. Always has exactly one root element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    root: Element,
}

/// Child-node indices from the root to an element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementPath(Vec<usize>);

impl ElementPath {
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn into_root(self) -> Element {
        self.root
    }

    /// Namespace URI of the root element.
    pub fn root_namespace(&self) -> Result<Option<String>, XmlError> {
        let mut scope = NamespaceScope::default();
        scope.enter(&self.root);
        scope.resolve_element(&self.root)
    }

    pub fn element_at(&self, path: &ElementPath) -> Option<&Element> {
        path.0.iter().try_fold(&self.root, |el, &idx| match el.children.get(idx) {
            Some(Node::Element(child)) => Some(child),
            _ => None,
        })
    }

    pub fn element_at_mut(&mut self, path: &ElementPath) -> Option<&mut Element> {
        let mut current = &mut self.root;
        for &idx in &path.0 {
            current = match current.children.get_mut(idx) {
                Some(Node::Element(child)) => child,
                _ => return None,
            };
        }
        Some(current)
    }

    /// First element (document order) with the given namespace URI and local name.
    pub fn find_element(&self, namespace: &str, name: &str) -> Result<Option<ElementPath>, XmlError> {
        fn walk(
            el: &Element,
            scope: &mut NamespaceScope,
            path: &mut Vec<usize>,
            namespace: &str,
            name: &str,
        ) -> Result<Option<ElementPath>, XmlError> {
            scope.enter(el);
            let resolved = scope.resolve_element(el)?;
            if el.name == name && resolved.as_deref() == Some(namespace) {
                scope.leave();
                return Ok(Some(ElementPath(path.clone())));
            }
            for (idx, node) in el.children.iter().enumerate() {
                if let Node::Element(child) = node {
                    path.push(idx);
                    let found = walk(child, scope, path, namespace, name)?;
                    path.pop();
                    if found.is_some() {
                        scope.leave();
                        return Ok(found);
                    }
                }
            }
            scope.leave();
            Ok(None)
        }

        let mut scope = NamespaceScope::default();
        walk(&self.root, &mut scope, &mut Vec::new(), namespace, name)
    }

    /// Removes the element at `path` (never the root) and returns it.
    pub fn remove_element(&mut self, path: &ElementPath) -> Option<Element> {
        let (&last, parent) = path.0.split_last()?;
        let parent = self.element_at_mut(&ElementPath(parent.to_vec()))?;
        match parent.children.get(last) {
            Some(Node::Element(_)) => match parent.children.remove(last) {
                Node::Element(el) => Some(el),
                Node::Text(_) => None,
            },
            _ => None,
        }
    }

    /// Serializes the tree as-is, preceded by an XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>");
        write_element(&self.root, &mut out);
        out
    }
}

/// In-scope namespace bindings while walking a tree.
#[derive(Debug, Default)]
pub(crate) struct NamespaceScope {
    bindings: Vec<(Option<String>, String)>,
    frames: Vec<usize>,
}

impl NamespaceScope {
    pub(crate) fn enter(&mut self, el: &Element) {
        self.frames.push(self.bindings.len());
        for decl in &el.namespaces {
            self.bindings.push((decl.prefix.clone(), decl.uri.clone()));
        }
    }

    pub(crate) fn leave(&mut self) {
        if let Some(len) = self.frames.pop() {
            self.bindings.truncate(len);
        }
    }

    fn lookup(&self, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NS);
        }
        self.bindings
            .iter()
            .rev()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
            .filter(|uri| !uri.is_empty())
    }

    pub(crate) fn resolve_element(&self, el: &Element) -> Result<Option<String>, XmlError> {
        match el.prefix.as_deref() {
            None => Ok(self.lookup(None).map(str::to_owned)),
            Some(prefix) => self
                .lookup(Some(prefix))
                .map(|uri| Some(uri.to_owned()))
                .ok_or_else(|| XmlError::UnboundPrefix {
                    prefix: prefix.to_owned(),
                    element: el.qualified_name(),
                }),
        }
    }

    /// Unprefixed attributes are in no namespace.
    pub(crate) fn resolve_attribute(
        &self,
        el: &Element,
        attr: &Attribute,
    ) -> Result<Option<String>, XmlError> {
        match attr.prefix.as_deref() {
            None => Ok(None),
            Some(prefix) => self
                .lookup(Some(prefix))
                .map(|uri| Some(uri.to_owned()))
                .ok_or_else(|| XmlError::UnboundPrefix {
                    prefix: prefix.to_owned(),
                    element: el.qualified_name(),
                }),
        }
    }
}

fn qualified(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(p) => format!("{p}:{name}"),
        None => name.to_owned(),
    }
}

/// Writes an element with canonical-XML escaping and explicit end tags.
pub(crate) fn write_element(el: &Element, out: &mut String) {
    let qname = el.qualified_name();
    out.push('<');
    out.push_str(&qname);
    for decl in &el.namespaces {
        match &decl.prefix {
            Some(p) => {
                out.push_str(" xmlns:");
                out.push_str(p);
            }
            None => out.push_str(" xmlns"),
        }
        out.push_str("=\"");
        escape_attribute(&decl.uri, out);
        out.push('"');
    }
    for attr in &el.attributes {
        out.push(' ');
        out.push_str(&attr.qualified_name());
        out.push_str("=\"");
        escape_attribute(&attr.value, out);
        out.push('"');
    }
    out.push('>');
    for child in &el.children {
        match child {
            Node::Element(e) => write_element(e, out),
            Node::Text(t) => escape_text(t, out),
        }
    }
    out.push_str("</");
    out.push_str(&qname);
    out.push('>');
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FE_NS: &str =
        "https://cdn.comprobanteselectronicos.go.cr/xml-schemas/v4.4/facturaElectronica";

    #[test]
    fn writer_escapes_like_canonical_xml() {
        let el = Element::new("Detalle")
            .with_attribute("nota", "a\"b\tc\n<d>&")
            .with_text("1 < 2 & 3 > 2\r");
        let mut out = String::new();
        write_element(&el, &mut out);
        assert_eq!(
            out,
            "<Detalle nota=\"a&quot;b&#x9;c&#xA;&lt;d>&amp;\">1 &lt; 2 &amp; 3 &gt; 2&#xD;</Detalle>"
        );
    }

    #[test]
    fn empty_elements_get_explicit_end_tags() {
        let doc = Document::new(Element::new("Vacio"));
        assert_eq!(
            doc.to_xml(),
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><Vacio></Vacio>"
        );
    }

    #[test]
    fn find_element_resolves_prefixes() {
        let root = Element::new("FacturaElectronica")
            .with_namespace(None, FE_NS)
            .with_child(Element::new("Clave").with_text("1"))
            .with_child(
                Element::prefixed("firma", "Signature")
                    .with_namespace(Some("firma"), constants::DS_NS),
            );
        let doc = Document::new(root);

        let clave = doc.find_element(FE_NS, "Clave").unwrap().unwrap();
        assert_eq!(clave.indices(), &[0]);
        let sig = doc.find_element(constants::DS_NS, "Signature").unwrap().unwrap();
        assert_eq!(doc.element_at(&sig).unwrap().prefix(), Some("firma"));
        assert!(doc.find_element(constants::DS_NS, "Clave").unwrap().is_none());
    }

    #[test]
    fn unbound_prefix_is_reported() {
        let doc = Document::new(Element::new("Raiz").with_child(Element::prefixed("x", "Hijo")));
        let err = doc.find_element(FE_NS, "Nada").unwrap_err();
        assert!(matches!(err, XmlError::UnboundPrefix { ref prefix, .. } if prefix == "x"));
    }

    #[test]
    fn remove_element_detaches_child() {
        let mut doc = Document::new(
            Element::new("Raiz")
                .with_child(Element::new("A"))
                .with_child(Element::new("B")),
        );
        let removed = doc.remove_element(&ElementPath(vec![0])).unwrap();
        assert_eq!(removed.name(), "A");
        assert_eq!(doc.root().child_elements().count(), 1);
        assert!(doc.remove_element(&ElementPath::default()).is_none());
    }

    #[test]
    fn descend_follows_local_names() {
        let mut root = Element::new("A").with_child(Element::new("B").with_child(Element::new("C")));
        root.descend_mut(&["B", "C"]).unwrap().set_text("x");
        assert_eq!(root.descend(&["B", "C"]).unwrap().text(), "x");
        assert!(root.descend(&["B", "D"]).is_none());
    }
}
