//! Front end: textual IR in, validated arena module out.

pub mod lower;
pub mod parser;

use derive_more::Display;

use crate::commons::Valid;
use crate::middle_end::ir::{Module, ValidationError};

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum FrontEndError {
    Parse(parser::ParseError),
    Lower(lower::LowerError),
    Validate(ValidationError),
}

impl std::error::Error for FrontEndError {}

/// Parse, lower and validate a textual IR module.
pub fn parse_module(code: &str) -> Result<Valid<Module>, FrontEndError> {
    let ast = parser::parse(code).map_err(FrontEndError::Parse)?;
    let module = lower::lower(ast).map_err(FrontEndError::Lower)?;
    module.validate().map_err(FrontEndError::Validate)
}
