//! Header fields written at issuance: `Clave` and `NumeroConsecutivo`.
use tracing::debug;

use super::xml::{Document, Element};
use crate::clave::DocumentKey;
use crate::consecutive::ConsecutiveNumber;

pub const CLAVE: &str = "Clave";
pub const NUMERO_CONSECUTIVO: &str = "NumeroConsecutivo";

/// Elements `NumeroConsecutivo` goes after when `FechaEmision` is absent, most specific first.
const CONSECUTIVE_ANCHORS: [&str; 2] = ["CodigoActividadEmisor", CLAVE];

/// Writes `Clave` as the first child of the root and `NumeroConsecutivo` before
/// `FechaEmision`. Existing values are overwritten; both elements use the root's prefix.
pub fn write_header(document: &mut Document, clave: &DocumentKey, consecutive: &ConsecutiveNumber) {
    let root = document.root_mut();
    let prefix = root.prefix().map(str::to_owned);
    let field = |name: &str, value: String| match &prefix {
        Some(prefix) => Element::prefixed(prefix.as_str(), name).with_text(value),
        None => Element::new(name).with_text(value),
    };

    if let Some(index) = root.position_of(CLAVE) {
        root.children_mut().remove(index);
    }
    root.insert_child(0, field(CLAVE, clave.to_string()));

    match root.child_mut(NUMERO_CONSECUTIVO) {
        Some(existing) => existing.set_text(consecutive.to_string()),
        None => {
            let index = root.position_of("FechaEmision").unwrap_or_else(|| {
                CONSECUTIVE_ANCHORS
                    .iter()
                    .find_map(|anchor| root.position_of(anchor))
                    .map_or(1, |index| index + 1)
            });
            root.insert_child(index, field(NUMERO_CONSECUTIVO, consecutive.to_string()));
        }
    }
    debug!(clave = %clave, consecutive = %consecutive, "header written");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::xml::parse_document;

    const CLAVE_VALUE: &str = "50601012500012345678900100001010000000001112345678";

    fn header() -> (DocumentKey, ConsecutiveNumber) {
        (
            CLAVE_VALUE.parse().unwrap(),
            "00100001010000000001".parse().unwrap(),
        )
    }

    fn child_names(document: &Document) -> Vec<String> {
        document
            .root()
            .child_elements()
            .map(|el| el.qualified_name())
            .collect()
    }

    #[test]
    fn inserts_before_fecha_emision() {
        let mut document = parse_document(
            "<FacturaElectronica xmlns=\"urn:f\"><CodigoActividadEmisor>1</CodigoActividadEmisor><FechaEmision>x</FechaEmision></FacturaElectronica>",
        )
        .unwrap();
        let (clave, consecutive) = header();
        write_header(&mut document, &clave, &consecutive);
        assert_eq!(
            child_names(&document),
            ["Clave", "CodigoActividadEmisor", "NumeroConsecutivo", "FechaEmision"]
        );
        assert_eq!(document.root().child(CLAVE).unwrap().text(), CLAVE_VALUE);
    }

    #[test]
    fn falls_back_to_activity_code_then_clave() {
        let mut document = parse_document(
            "<f:Tiquete xmlns:f=\"urn:f\"><f:CodigoActividadEmisor>1</f:CodigoActividadEmisor><f:Emisor/></f:Tiquete>",
        )
        .unwrap();
        let (clave, consecutive) = header();
        write_header(&mut document, &clave, &consecutive);
        assert_eq!(
            child_names(&document),
            ["f:Clave", "f:CodigoActividadEmisor", "f:NumeroConsecutivo", "f:Emisor"]
        );

        let mut bare = parse_document("<Tiquete><Emisor/></Tiquete>").unwrap();
        write_header(&mut bare, &clave, &consecutive);
        assert_eq!(child_names(&bare), ["Clave", "NumeroConsecutivo", "Emisor"]);
    }

    #[test]
    fn overwrites_existing_values() {
        let mut document = parse_document(
            "<Factura><NumeroConsecutivo>old</NumeroConsecutivo><Clave>old</Clave></Factura>",
        )
        .unwrap();
        let (clave, consecutive) = header();
        write_header(&mut document, &clave, &consecutive);
        assert_eq!(child_names(&document), ["Clave", "NumeroConsecutivo"]);
        assert_eq!(
            document.root().child(NUMERO_CONSECUTIVO).unwrap().text(),
            "00100001010000000001"
        );
    }
}
