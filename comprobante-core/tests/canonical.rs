mod common;

use comprobante_core::document::c14n::{canonicalize, canonicalize_fragment, CanonicalizationError};
use comprobante_core::document::xml::parse_document;
use proptest::prelude::*;

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn document(
    root_prefix: &str,
    other_prefix: &str,
    attributes: &[(String, String)],
    text: &str,
) -> String {
    let (rp, decl) = if root_prefix.is_empty() {
        (String::new(), "xmlns=\"urn:factura\"".to_string())
    } else {
        (format!("{root_prefix}:"), format!("xmlns:{root_prefix}=\"urn:factura\""))
    };
    let attrs: String = attributes
        .iter()
        .map(|(name, value)| format!(" {name}=\"{}\"", escape(value)))
        .collect();
    format!(
        "<{rp}Factura {decl} xmlns:{other_prefix}=\"urn:extension\"{attrs}>\n  <{rp}Clave>{}</{rp}Clave>\n  <{other_prefix}:Ext {other_prefix}:kind=\"v\"><{rp}Dato/></{other_prefix}:Ext>\n</{rp}Factura>",
        escape(text)
    )
}

fn attributes() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::btree_map("[a-z]{1,6}", "[ -~]{0,12}", 1..6).prop_map(|map| {
        map.into_iter()
            .map(|(name, value)| (format!("a{name}"), value))
            .collect()
    })
}

proptest! {
    #[test]
    fn attribute_order_and_prefix_spelling_do_not_change_bytes(
        (first, second) in attributes().prop_flat_map(|attrs| {
            (Just(attrs.clone()).prop_shuffle(), Just(attrs).prop_shuffle())
        }),
        root_prefixes in (prop::sample::select(vec!["", "fe", "doc"]), prop::sample::select(vec!["", "fe", "doc"])),
        other_prefixes in (prop::sample::select(vec!["o", "ext"]), prop::sample::select(vec!["o", "ext"])),
        text in "[ -~]{1,20}",
    ) {
        let a = parse_document(&document(root_prefixes.0, other_prefixes.0, &first, &text)).unwrap();
        let b = parse_document(&document(root_prefixes.1, other_prefixes.1, &second, &text)).unwrap();
        let left = canonicalize(&a).unwrap();
        let right = canonicalize(&b).unwrap();
        prop_assert_eq!(left.as_str(), right.as_str());
        prop_assert_eq!(left.digest_base64(), right.digest_base64());
    }

    #[test]
    fn canonical_form_is_a_fixed_point(attrs in attributes(), text in "[ -~]{1,20}") {
        let once = canonicalize(&parse_document(&document("fe", "o", &attrs, &text)).unwrap()).unwrap();
        let twice = canonicalize(&parse_document(once.as_str()).unwrap()).unwrap();
        prop_assert_eq!(once.as_str(), twice.as_str());
    }
}

#[test]
fn factura_fixture_canonical_shape() {
    let canonical = canonicalize(&common::factura()).unwrap();
    assert!(canonical.as_str().starts_with(
        "<FacturaElectronica xmlns=\"https://cdn.comprobanteselectronicos.go.cr/xml-schemas/v4.4/facturaElectronica\"><ProveedorSistemas>"
    ));
    assert!(!canonical.as_str().contains('\n'));
    assert!(canonical.as_str().contains("<Nombre>Cliente &amp; Asociados</Nombre>"));
    assert_eq!(canonical.sha256().len(), 32);
}

#[test]
fn fragment_lookup_reports_missing_ids() {
    let document = parse_document(r#"<r xmlns="urn:r"><a Id="one"><b/></a></r>"#).unwrap();
    assert_eq!(
        canonicalize_fragment(&document, "one").unwrap().as_str(),
        r#"<a xmlns="urn:r" Id="one"><b></b></a>"#
    );
    assert!(matches!(
        canonicalize_fragment(&document, "two"),
        Err(CanonicalizationError::MissingFragment { .. })
    ));
}
