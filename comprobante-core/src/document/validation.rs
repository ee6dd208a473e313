//! XSD validation against the Hacienda v4.4 schemas (libxml2).
use std::path::PathBuf;

use crate::config::Config;
use crate::consecutive::DocumentType;
use libxml::{
    error::StructuredError,
    parser::Parser,
    schemas::{SchemaParserContext, SchemaValidationContext},
};

pub type ValidationResult = Result<(), Vec<String>>;

fn format_validation_errors(errors: Vec<StructuredError>) -> Vec<String> {
    errors.into_iter().map(|se| format!("{se:?}")).collect()
}

/// `<xsd_dir>/<schema file>` for the document type.
pub fn schema_path(document_type: DocumentType, config: &Config) -> Result<PathBuf, Vec<String>> {
    let dir = config
        .xsd_dir()
        .ok_or_else(|| vec!["xsd_dir is not configured".to_string()])?;
    Ok(dir.join(document_type.schema_file()))
}

fn build_validation_context(
    document_type: DocumentType,
    config: &Config,
) -> Result<SchemaValidationContext, Vec<String>> {
    let path = schema_path(document_type, config)?;
    // libxml reports a missing schema file as an opaque parser failure
    if !path.exists() {
        return Err(vec![format!("schema not found: {}", path.display())]);
    }
    let xsd_path = path
        .to_str()
        .ok_or_else(|| vec!["schema path is not UTF-8".to_string()])?;

    let mut parser_ctx = SchemaParserContext::from_file(xsd_path);
    SchemaValidationContext::from_parser(&mut parser_ctx).map_err(format_validation_errors)
}

pub fn validate_document(xml: &str, document_type: DocumentType, config: &Config) -> ValidationResult {
    let mut validation_ctx = build_validation_context(document_type, config)?;
    let document = Parser::default()
        .parse_string(xml)
        .map_err(|e| vec![format!("failed to parse XML: {e:?}")])?;

    validation_ctx
        .validate_document(&document)
        .map_err(format_validation_errors)
}
