//! Parsers for the error-specification text files.
//!
//! Two shapes exist in the wild: seed specs (`fname <interval>` per line) and
//! finalized specs as printed by the `specs` command, where the first
//! whitespace-separated field is noise (`fname: fname <interval>`).

use std::collections::BTreeMap as Map;

use pest::iterators::Pair;
use pest::Parser;

use super::constraint::{Constraint, Interval};

#[derive(pest_derive::Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" }

input_specs = { SOI ~ NEWLINE* ~ (input_line ~ NEWLINE+)* ~ input_line? ~ EOI }
input_line  = { fname ~ interval }

final_specs = { SOI ~ NEWLINE* ~ (final_line ~ NEWLINE+)* ~ final_line? ~ EOI }
final_line  = { field ~ fname ~ interval }

fname    = @{ (ASCII_ALPHANUMERIC | "_" | "." | "$")+ }
field    = @{ (!(" " | "\t" | NEWLINE) ~ ANY)+ }
interval = @{ "<=0" | "<0" | ">=0" | ">0" | "==0" | "!=0" | "top" | "bottom" }
"#]
struct SpecFileParser;

use derive_more::Display;

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum SpecParseError {
    Syntax(Box<pest::error::Error<Rule>>),
    #[display(fmt = "bad interval token: {}", _0)]
    BadInterval(String),
}

impl std::error::Error for SpecParseError {}

/// Parse a seed-specification file: one `fname <interval>` per line.
pub fn parse_input_specs(text: &str) -> Result<Map<String, Constraint>, SpecParseError> {
    let tree = SpecFileParser::parse(Rule::input_specs, text)
        .map_err(|e| SpecParseError::Syntax(Box::new(e)))?
        .next()
        .unwrap();

    let mut specs = Map::new();
    for line in tree.into_inner() {
        if line.as_rule() != Rule::input_line {
            continue; // EOI
        }
        let mut fields = line.into_inner();
        let fname = fields.next().unwrap().as_str().to_string();
        let interval = parse_interval(fields.next().unwrap())?;
        specs.insert(fname.clone(), Constraint::with_interval(fname, interval));
    }
    Ok(specs)
}

/// Parse a finalized-specification file: `<ignored> fname <interval>` per
/// line, as produced by the `specs` command.
pub fn parse_final_specs(text: &str) -> Result<Map<String, Constraint>, SpecParseError> {
    let tree = SpecFileParser::parse(Rule::final_specs, text)
        .map_err(|e| SpecParseError::Syntax(Box::new(e)))?
        .next()
        .unwrap();

    let mut specs = Map::new();
    for line in tree.into_inner() {
        if line.as_rule() != Rule::final_line {
            continue;
        }
        let mut fields = line.into_inner();
        let _ignored = fields.next().unwrap();
        let fname = fields.next().unwrap().as_str().to_string();
        let interval = parse_interval(fields.next().unwrap())?;
        specs.insert(fname.clone(), Constraint::with_interval(fname, interval));
    }
    Ok(specs)
}

fn parse_interval(pair: Pair<Rule>) -> Result<Interval, SpecParseError> {
    pair.as_str()
        .parse::<Interval>()
        .map_err(|e| SpecParseError::BadInterval(e.0))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn input_specs_basic() {
        let specs = parse_input_specs("malloc ==0\nopen <0\n").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs["malloc"].interval, Interval::Zero);
        assert_eq!(specs["open"].interval, Interval::Ltz);
        assert_eq!(specs["open"].fname, "open");
    }

    #[test]
    fn input_specs_empty_and_trailing_newline() {
        assert_eq!(parse_input_specs("").unwrap().len(), 0);
        assert_eq!(parse_input_specs("\n\n").unwrap().len(), 0);
        assert_eq!(parse_input_specs("f top").unwrap()["f"].interval, Interval::Top);
    }

    #[test]
    fn final_specs_skip_first_field() {
        let specs = parse_final_specs("open: open <0\nread: read <=0\n").unwrap();
        assert_eq!(specs["open"].interval, Interval::Ltz);
        assert_eq!(specs["read"].interval, Interval::Lez);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_input_specs("open <0 extra\n").is_err());
        assert!(parse_input_specs("open\n").is_err());
    }

    #[test]
    fn finalized_output_parses_back() {
        let c = Constraint::with_interval("frob", Interval::Ntz);
        let line = format!("{}: {}\n", c.fname, c);
        let specs = parse_final_specs(&line).unwrap();
        assert_eq!(specs["frob"], c);
    }
}
