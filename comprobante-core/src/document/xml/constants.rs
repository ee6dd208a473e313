pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema";
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";
pub const XMLNS_NS: &str = "http://www.w3.org/2000/xmlns/";

pub(crate) const HACIENDA_SCHEMA_BASE: &str =
    "https://cdn.comprobanteselectronicos.go.cr/xml-schemas/v4.4/";

pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const SHA256_DIGEST: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
pub const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";

/// Namespaces with a fixed canonical prefix.
pub(crate) const WELL_KNOWN_PREFIXES: [(&str, &str); 4] = [
    (DS_NS, "ds"),
    (XADES_NS, "xades"),
    (XSI_NS, "xsi"),
    (XSD_NS, "xsd"),
];

/// Attribute names that carry fragment identifiers.
pub(crate) const ID_ATTRIBUTES: [&str; 3] = ["Id", "ID", "id"];
