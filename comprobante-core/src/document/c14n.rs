//! Canonical serialization.
//!
//! The canonical form is Exclusive XML Canonicalization 1.0 (without comments) applied to a
//! prefix-normalized tree:
//!
//! - the root element's namespace becomes the default namespace;
//! - XML-DSig, XAdES, XML Schema instance and XML Schema get `ds`, `xades`, `xsi`, `xsd`;
//! - every other namespace gets `ns1`, `ns2`, ... in order of first use (elements before their
//!   attributes, attributes in canonical order);
//! - an attribute in the root namespace, which cannot use the default namespace, gets `ns0`;
//! - whitespace-only text inside element-only content is dropped.
//!
//! Trees that differ only in prefix spelling, attribute order, namespace declaration placement
//! or indentation therefore canonicalize to the same bytes. QName-valued attribute content
//! (`xsi:type="p:T"`) is not rewritten.
//!
//! [`Canonicalizer::exclusive`] skips the normalization step and yields plain exclusive c14n,
//! which is what a `CanonicalizationMethod` of [`EXC_C14N`](super::xml::constants::EXC_C14N)
//! asks a verifier to compute. On a normalized tree both modes produce identical bytes.
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::xml::constants::{WELL_KNOWN_PREFIXES, XML_NS};
use super::xml::{
    write_element, Attribute, Document, Element, NamespaceDecl, NamespaceScope, Node, XmlError,
};

#[derive(Debug, Error)]
pub enum CanonicalizationError {
    #[error("namespace prefix '{prefix}' on <{element}> is not declared")]
    UnresolvableNamespace { prefix: String, element: String },
    #[error("no element with Id '{id}'")]
    MissingFragment { id: String },
    #[error("Id '{id}' is used by more than one element")]
    DuplicateId { id: String },
    #[error("namespace '{uri}' is not part of the document this canonicalizer was built for")]
    UnmappedNamespace { uri: String },
    #[error(transparent)]
    Xml(XmlError),
}

impl From<XmlError> for CanonicalizationError {
    fn from(err: XmlError) -> Self {
        match err {
            XmlError::UnboundPrefix { prefix, element } => {
                CanonicalizationError::UnresolvableNamespace { prefix, element }
            }
            other => CanonicalizationError::Xml(other),
        }
    }
}

/// Canonical UTF-8 bytes of a document or fragment.
#[derive(Clone, PartialEq, Eq)]
pub struct CanonicalBytes(String);

impl CanonicalBytes {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sha256(&self) -> [u8; 32] {
        Sha256::digest(self.0.as_bytes()).into()
    }

    /// Base64 SHA-256, as carried in `ds:DigestValue`.
    pub fn digest_base64(&self) -> String {
        Base64::encode_string(&self.sha256())
    }
}

impl std::fmt::Debug for CanonicalBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CanonicalBytes").field(&self.0).finish()
    }
}

impl AsRef<[u8]> for CanonicalBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Canonicalizes the whole document in normalized form.
pub fn canonicalize(document: &Document) -> Result<CanonicalBytes, CanonicalizationError> {
    Canonicalizer::for_document(document)?.canonicalize(document)
}

/// Canonicalizes the element whose `Id` is `fragment_id`, in normalized form.
pub fn canonicalize_fragment(
    document: &Document,
    fragment_id: &str,
) -> Result<CanonicalBytes, CanonicalizationError> {
    Canonicalizer::for_document(document)?.canonicalize_fragment(document, fragment_id)
}

#[derive(Debug, Clone)]
pub struct Canonicalizer {
    prefixes: Option<PrefixMap>,
}

impl Canonicalizer {
    /// Normalizing canonicalizer; prefixes are assigned from `document`.
    pub fn for_document(document: &Document) -> Result<Self, CanonicalizationError> {
        Ok(Self {
            prefixes: Some(PrefixMap::collect(document)?),
        })
    }

    /// Plain exclusive c14n: prefixes and whitespace are kept as written.
    pub fn exclusive() -> Self {
        Self { prefixes: None }
    }

    pub fn is_normalizing(&self) -> bool {
        self.prefixes.is_some()
    }

    /// The tree whose serialization is the canonical form.
    pub fn normalize(&self, document: &Document) -> Result<Document, CanonicalizationError> {
        let root = self.build(
            document.root(),
            &mut NamespaceScope::default(),
            &mut Rendered::default(),
            &|_: &Element| false,
        )?;
        Ok(Document::new(root))
    }

    pub fn canonicalize(&self, document: &Document) -> Result<CanonicalBytes, CanonicalizationError> {
        let normalized = self.normalize(document)?;
        Ok(serialize(normalized.root()))
    }

    pub fn canonicalize_fragment(
        &self,
        document: &Document,
        fragment_id: &str,
    ) -> Result<CanonicalBytes, CanonicalizationError> {
        let mut found = Vec::new();
        self.find_fragment(
            document.root(),
            fragment_id,
            &mut NamespaceScope::default(),
            &mut found,
        )?;
        match found.pop() {
            Some(fragment) => Ok(serialize(&fragment)),
            None => Err(CanonicalizationError::MissingFragment {
                id: fragment_id.to_owned(),
            }),
        }
    }

    /// `target`, which must be borrowed from `document`, canonicalized as an apex.
    pub(crate) fn canonicalize_subtree(
        &self,
        document: &Document,
        target: &Element,
    ) -> Result<Option<CanonicalBytes>, CanonicalizationError> {
        let mut scope = NamespaceScope::default();
        self.find_subtree(document.root(), target, &mut scope)
            .map(|found| found.map(|el| serialize(&el)))
    }

    /// Whole document minus the element whose `Id` is `element_id` (enveloped-signature transform).
    pub fn canonicalize_excluding(
        &self,
        document: &Document,
        element_id: &str,
    ) -> Result<CanonicalBytes, CanonicalizationError> {
        match count_ids(document.root(), element_id) {
            0 => {
                return Err(CanonicalizationError::MissingFragment {
                    id: element_id.to_owned(),
                })
            }
            1 => {}
            _ => {
                return Err(CanonicalizationError::DuplicateId {
                    id: element_id.to_owned(),
                })
            }
        }
        let root = self.build(
            document.root(),
            &mut NamespaceScope::default(),
            &mut Rendered::default(),
            &|el: &Element| el.id() == Some(element_id),
        )?;
        Ok(serialize(&root))
    }

    /// Whole document minus `excluded`, which must be an element borrowed from `document`.
    pub(crate) fn canonicalize_without(
        &self,
        document: &Document,
        excluded: &Element,
    ) -> Result<CanonicalBytes, CanonicalizationError> {
        let root = self.build(
            document.root(),
            &mut NamespaceScope::default(),
            &mut Rendered::default(),
            &|el: &Element| std::ptr::eq(el, excluded),
        )?;
        Ok(serialize(&root))
    }

    fn find_fragment(
        &self,
        el: &Element,
        id: &str,
        scope: &mut NamespaceScope,
        found: &mut Vec<Element>,
    ) -> Result<(), CanonicalizationError> {
        if el.id() == Some(id) {
            if !found.is_empty() {
                return Err(CanonicalizationError::DuplicateId { id: id.to_owned() });
            }
            found.push(self.build(el, scope, &mut Rendered::default(), &|_: &Element| false)?);
        }
        scope.enter(el);
        let result = el
            .child_elements()
            .try_for_each(|child| self.find_fragment(child, id, scope, found));
        scope.leave();
        result
    }

    fn find_subtree(
        &self,
        el: &Element,
        target: &Element,
        scope: &mut NamespaceScope,
    ) -> Result<Option<Element>, CanonicalizationError> {
        if std::ptr::eq(el, target) {
            return self
                .build(el, scope, &mut Rendered::default(), &|_: &Element| false)
                .map(Some);
        }
        scope.enter(el);
        let mut result = Ok(None);
        for child in el.child_elements() {
            result = self.find_subtree(child, target, scope);
            if !matches!(result, Ok(None)) {
                break;
            }
        }
        scope.leave();
        result
    }

    fn build(
        &self,
        el: &Element,
        scope: &mut NamespaceScope,
        rendered: &mut Rendered,
        skip: &dyn Fn(&Element) -> bool,
    ) -> Result<Element, CanonicalizationError> {
        scope.enter(el);
        let result = self.build_entered(el, scope, rendered, skip);
        scope.leave();
        result
    }

    fn build_entered(
        &self,
        el: &Element,
        scope: &mut NamespaceScope,
        rendered: &mut Rendered,
        skip: &dyn Fn(&Element) -> bool,
    ) -> Result<Element, CanonicalizationError> {
        let namespace = scope.resolve_element(el)?;
        let prefix = self.element_prefix(el.prefix(), namespace.as_deref())?;

        let mut attributes = Vec::with_capacity(el.attributes().len());
        for attr in el.attributes() {
            let attr_ns = scope.resolve_attribute(el, attr)?;
            let attr_prefix = match &attr_ns {
                None => None,
                Some(uri) => Some(self.attribute_prefix(attr.prefix.as_deref(), uri)?),
            };
            attributes.push((
                attr_ns,
                Attribute {
                    prefix: attr_prefix,
                    name: attr.name.clone(),
                    value: attr.value.clone(),
                },
            ));
        }
        attributes.sort_by(|(a_ns, a), (b_ns, b)| {
            a_ns.as_deref()
                .unwrap_or("")
                .cmp(b_ns.as_deref().unwrap_or(""))
                .then_with(|| a.name.cmp(&b.name))
        });

        // Visibly utilized namespaces not already rendered by an output ancestor.
        let mut used = vec![(prefix.clone(), namespace.clone().unwrap_or_default())];
        for (attr_ns, attr) in &attributes {
            if let (Some(uri), Some(p)) = (attr_ns, &attr.prefix) {
                if uri != XML_NS {
                    used.push((Some(p.clone()), uri.clone()));
                }
            }
        }
        let mut declarations: Vec<NamespaceDecl> = Vec::new();
        for (p, uri) in used {
            if declarations.iter().any(|d| d.prefix == p) {
                continue;
            }
            if rendered.current(p.as_deref()) != uri {
                declarations.push(NamespaceDecl { prefix: p, uri });
            }
        }
        declarations.sort_by(|a, b| a.prefix.cmp(&b.prefix));

        rendered.enter(&declarations);
        let children = self.build_children(el, scope, rendered, skip);
        rendered.leave();

        Ok(Element::from_parts(
            prefix,
            el.name().to_owned(),
            declarations,
            attributes.into_iter().map(|(_, attr)| attr).collect(),
            children?,
        ))
    }

    fn build_children(
        &self,
        el: &Element,
        scope: &mut NamespaceScope,
        rendered: &mut Rendered,
        skip: &dyn Fn(&Element) -> bool,
    ) -> Result<Vec<Node>, CanonicalizationError> {
        let strip_whitespace = self.prefixes.is_some() && el.has_child_elements();
        let mut children: Vec<Node> = Vec::with_capacity(el.children().len());
        for node in el.children() {
            match node {
                Node::Element(child) => {
                    if skip(child) {
                        continue;
                    }
                    children.push(Node::Element(self.build(child, scope, rendered, skip)?));
                }
                Node::Text(text) => {
                    if text.is_empty() || (strip_whitespace && is_xml_whitespace(text)) {
                        continue;
                    }
                    match children.last_mut() {
                        Some(Node::Text(prev)) => prev.push_str(text),
                        _ => children.push(Node::Text(text.clone())),
                    }
                }
            }
        }
        Ok(children)
    }

    fn element_prefix(
        &self,
        written: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Option<String>, CanonicalizationError> {
        match (&self.prefixes, namespace) {
            (None, _) => Ok(written.map(str::to_owned)),
            (Some(_), None) => Ok(None),
            (Some(map), Some(uri)) => map.element_prefix(uri),
        }
    }

    fn attribute_prefix(
        &self,
        written: Option<&str>,
        namespace: &str,
    ) -> Result<String, CanonicalizationError> {
        match &self.prefixes {
            None => Ok(written.unwrap_or_default().to_owned()),
            Some(map) => map.attribute_prefix(namespace),
        }
    }
}

fn serialize(el: &Element) -> CanonicalBytes {
    let mut out = String::new();
    write_element(el, &mut out);
    CanonicalBytes(out)
}

fn is_xml_whitespace(text: &str) -> bool {
    text.chars().all(|c| matches!(c, ' ' | '\t' | '\n' | '\r'))
}

fn count_ids(el: &Element, id: &str) -> usize {
    usize::from(el.id() == Some(id))
        + el.child_elements().map(|child| count_ids(child, id)).sum::<usize>()
}

/// Namespace URI → canonical prefix.
#[derive(Debug, Clone, Default)]
struct PrefixMap {
    default: Option<String>,
    named: Vec<(String, String)>,
    next: usize,
}

impl PrefixMap {
    fn collect(document: &Document) -> Result<Self, CanonicalizationError> {
        let mut map = Self {
            default: document.root_namespace()?,
            named: Vec::new(),
            next: 1,
        };
        map.visit(document.root(), &mut NamespaceScope::default())?;
        Ok(map)
    }

    fn visit(&mut self, el: &Element, scope: &mut NamespaceScope) -> Result<(), CanonicalizationError> {
        scope.enter(el);
        let result = self.visit_entered(el, scope);
        scope.leave();
        result
    }

    fn visit_entered(
        &mut self,
        el: &Element,
        scope: &mut NamespaceScope,
    ) -> Result<(), CanonicalizationError> {
        if let Some(uri) = scope.resolve_element(el)? {
            self.note(&uri, false);
        }
        let mut attr_namespaces = Vec::new();
        for attr in el.attributes() {
            if let Some(uri) = scope.resolve_attribute(el, attr)? {
                attr_namespaces.push((uri, attr.name.clone()));
            }
        }
        attr_namespaces.sort();
        for (uri, _) in &attr_namespaces {
            self.note(uri, true);
        }
        el.child_elements()
            .try_for_each(|child| self.visit(child, scope))
    }

    fn note(&mut self, uri: &str, for_attribute: bool) {
        if uri == XML_NS || self.named.iter().any(|(u, _)| u == uri) {
            return;
        }
        let is_default = self.default.as_deref() == Some(uri);
        let fixed = WELL_KNOWN_PREFIXES
            .iter()
            .find(|(known, _)| *known == uri)
            .map(|(_, p)| (*p).to_owned());
        let prefix = match (fixed, is_default) {
            (Some(p), _) => p,
            (None, true) if for_attribute => "ns0".to_owned(),
            (None, true) => return,
            (None, false) => {
                let p = format!("ns{}", self.next);
                self.next += 1;
                p
            }
        };
        self.named.push((uri.to_owned(), prefix));
    }

    fn named(&self, uri: &str) -> Option<&str> {
        self.named
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, p)| p.as_str())
    }

    fn element_prefix(&self, uri: &str) -> Result<Option<String>, CanonicalizationError> {
        if self.default.as_deref() == Some(uri) {
            return Ok(None);
        }
        self.named(uri)
            .map(|p| Some(p.to_owned()))
            .ok_or_else(|| CanonicalizationError::UnmappedNamespace { uri: uri.to_owned() })
    }

    fn attribute_prefix(&self, uri: &str) -> Result<String, CanonicalizationError> {
        if uri == XML_NS {
            return Ok("xml".to_owned());
        }
        self.named(uri)
            .map(str::to_owned)
            .ok_or_else(|| CanonicalizationError::UnmappedNamespace { uri: uri.to_owned() })
    }
}

/// Namespace bindings already rendered by output ancestors.
#[derive(Debug, Default)]
struct Rendered {
    bindings: Vec<(Option<String>, String)>,
    frames: Vec<usize>,
}

impl Rendered {
    fn enter(&mut self, declarations: &[NamespaceDecl]) {
        self.frames.push(self.bindings.len());
        self.bindings.extend(
            declarations
                .iter()
                .map(|d| (d.prefix.clone(), d.uri.clone())),
        );
    }

    fn leave(&mut self) {
        if let Some(len) = self.frames.pop() {
            self.bindings.truncate(len);
        }
    }

    fn current(&self, prefix: Option<&str>) -> &str {
        self.bindings
            .iter()
            .rev()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
            .unwrap_or("")
    }
}
