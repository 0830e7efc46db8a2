use std::io::Read;
use std::path::Path;

use libxml::parser::Parser as XmlParser;
use libxml::schemas::{SchemaParserContext, SchemaValidationContext};

use crate::errors::ExtractError;

/// Validates a byte stream against an XSD schema using libxml2's schema
/// validator. Independent of extraction: never called from the hot
/// extraction path, only from the `validate` CLI subcommand or `run
/// --validate`.
pub fn validate_against_xsd<R: Read>(mut source: R, xsd_path: &Path) -> Result<(bool, Vec<String>), ExtractError> {
    let xsd_path_str = xsd_path
        .to_str()
        .ok_or_else(|| ExtractError::SchemaInvalid("xsd path is not valid UTF-8".to_string()))?;

    let mut parser_ctx = SchemaParserContext::from_file(xsd_path_str);
    let mut schema = SchemaValidationContext::from_parser(&mut parser_ctx)
        .map_err(|errors| ExtractError::SchemaInvalid(format!("could not parse schema: {errors:?}")))?;

    let mut xml = String::new();
    source
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::SchemaInvalid(e.to_string()))?;

    let mut doc = XmlParser::default()
        .parse_string(xml)
        .map_err(|e| ExtractError::SchemaInvalid(format!("{e:?}")))?;

    match schema.validate_document(&mut doc) {
        Ok(()) => Ok((true, Vec::new())),
        Err(errors) => Ok((false, errors.into_iter().map(|e| format!("{e:?}")).collect())),
    }
}
