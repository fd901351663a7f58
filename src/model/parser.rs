//! Parser for the declarative model file format.
//!
//! Four labelled sections: `[METADATA]`, `[VARIABLES]`, `[FUNCION]`,
//! `[SIMULACION]`. Lines starting with `#` or `;` are comments, except
//! inside a `codigo` block where `#` belongs to the code itself. The parser
//! validates everything it can — identifiers, distribution parameters,
//! function compilability — but never evaluates the function.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::distribution::validate_params;
use crate::error::{MontebusError, MontebusResult, ParseError};
use crate::eval::CompiledFunction;
use crate::model::{
    DistributionKind, FunctionSpec, Model, ModelMetadata, SimulationSpec, VariableKind,
    VariableSpec,
};

const SECTION_METADATA: &str = "METADATA";
const SECTION_VARIABLES: &str = "VARIABLES";
const SECTION_FUNCTION: &str = "FUNCION";
const SECTION_SIMULATION: &str = "SIMULACION";

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Parses and validates a complete model file.
pub fn parse_model(input: &str) -> MontebusResult<Model> {
    let sections = split_sections(input)?;

    let metadata = parse_metadata(section(&sections, SECTION_METADATA)?)?;
    let variables = parse_variables(section(&sections, SECTION_VARIABLES)?)?;
    let function = parse_function(section(&sections, SECTION_FUNCTION)?)?;
    let simulation = parse_simulation(section(&sections, SECTION_SIMULATION)?)?;

    // Compile once to validate; the compiled form is discarded here and
    // rebuilt by each consumer against the published payload.
    if let Err(err) = CompiledFunction::compile(&function) {
        return Err(ParseError::Validation {
            line: 0,
            msg: err.to_string(),
        }
        .into());
    }

    let model = Model {
        metadata,
        variables,
        function,
        simulation,
    };
    check_function_names(&model)?;
    Ok(model)
}

/// One raw line with its 1-based position in the source file.
#[derive(Debug, Clone)]
struct Line {
    number: usize,
    text: String,
}

type Sections = Vec<(String, Vec<Line>)>;

fn split_sections(input: &str) -> Result<Sections, ParseError> {
    let mut sections: Sections = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let number = idx + 1;
        let trimmed = raw.trim();
        if let Some(name) = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
        {
            sections.push((name.trim().to_uppercase(), Vec::new()));
            continue;
        }
        match sections.last_mut() {
            Some((_, lines)) => lines.push(Line {
                number,
                text: raw.to_string(),
            }),
            None => {
                if !trimmed.is_empty() && !is_comment(trimmed) {
                    return Err(ParseError::Syntax {
                        section: "preamble".to_string(),
                        line: number,
                        msg: format!("content before the first section header: '{trimmed}'"),
                    });
                }
            }
        }
    }
    Ok(sections)
}

fn section<'a>(sections: &'a Sections, name: &str) -> Result<&'a [Line], ParseError> {
    sections
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, lines)| lines.as_slice())
        .ok_or_else(|| ParseError::MissingSection(name.to_string()))
}

fn is_comment(trimmed: &str) -> bool {
    trimmed.starts_with('#') || trimmed.starts_with(';')
}

/// Splits `key = value` pairs, skipping blanks and comments.
fn key_values(lines: &[Line], section: &str) -> Result<Vec<(String, String, usize)>, ParseError> {
    let mut out = Vec::new();
    for line in lines {
        let trimmed = line.text.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(ParseError::Syntax {
                section: section.to_string(),
                line: line.number,
                msg: format!("expected 'key = value', got '{trimmed}'"),
            });
        };
        out.push((
            key.trim().to_string(),
            value.trim().to_string(),
            line.number,
        ));
    }
    Ok(out)
}

fn lookup<'a>(pairs: &'a [(String, String, usize)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _, _)| k == key)
        .map(|(_, v, _)| v.as_str())
}

fn require<'a>(
    pairs: &'a [(String, String, usize)],
    section: &str,
    key: &str,
) -> Result<&'a str, ParseError> {
    lookup(pairs, key).ok_or_else(|| ParseError::MissingKey {
        section: section.to_string(),
        key: key.to_string(),
    })
}

fn parse_metadata(lines: &[Line]) -> Result<ModelMetadata, ParseError> {
    let pairs = key_values(lines, SECTION_METADATA)?;
    Ok(ModelMetadata {
        name: require(&pairs, SECTION_METADATA, "name")?.to_string(),
        version: lookup(&pairs, "version").unwrap_or("1.0").to_string(),
        description: lookup(&pairs, "description").unwrap_or_default().to_string(),
        author: lookup(&pairs, "author").unwrap_or_default().to_string(),
        creation_date: lookup(&pairs, "creationDate").unwrap_or_default().to_string(),
    })
}

fn parse_variables(lines: &[Line]) -> Result<Vec<VariableSpec>, ParseError> {
    let mut variables: Vec<VariableSpec> = Vec::new();
    for line in lines {
        let trimmed = line.text.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            continue;
        }
        let variable = parse_variable_line(trimmed, line.number)?;
        if variables.iter().any(|v| v.name == variable.name) {
            return Err(ParseError::DuplicateVariable(variable.name));
        }
        variables.push(variable);
    }
    if variables.is_empty() {
        return Err(ParseError::Syntax {
            section: SECTION_VARIABLES.to_string(),
            line: lines.first().map_or(0, |l| l.number),
            msg: "at least one variable is required".to_string(),
        });
    }
    Ok(variables)
}

/// `name, kind, distribution, k1=v1, k2=v2, ...`
fn parse_variable_line(text: &str, line: usize) -> Result<VariableSpec, ParseError> {
    let syntax = |msg: String| ParseError::Syntax {
        section: SECTION_VARIABLES.to_string(),
        line,
        msg,
    };

    let fields: Vec<&str> = text.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(syntax(format!(
            "expected 'name, kind, distribution, k=v, ...', got '{text}'"
        )));
    }

    let name = fields[0];
    if !identifier_re().is_match(name) {
        return Err(syntax(format!("'{name}' is not a valid identifier")));
    }

    let kind: VariableKind = fields[1]
        .parse()
        .map_err(|_| syntax(format!("unknown kind '{}', expected int or float", fields[1])))?;
    let distribution: DistributionKind = fields[2].parse().map_err(|_| {
        syntax(format!(
            "unsupported distribution '{}'",
            fields[2]
        ))
    })?;
    if kind != distribution.natural_kind() {
        return Err(syntax(format!(
            "distribution '{distribution}' produces {} variates, but '{name}' is declared {kind}",
            distribution.natural_kind()
        )));
    }

    let mut params = BTreeMap::new();
    for field in &fields[3..] {
        let Some((key, value)) = field.split_once('=') else {
            return Err(syntax(format!("expected 'key=value', got '{field}'")));
        };
        let value: f64 = value.trim().parse().map_err(|_| {
            syntax(format!("parameter '{}' is not a number: '{}'", key.trim(), value.trim()))
        })?;
        params.insert(key.trim().to_string(), value);
    }

    validate_params(distribution, &params).map_err(|e| syntax(e.to_string()))?;

    Ok(VariableSpec {
        name: name.to_string(),
        kind,
        distribution,
        params,
    })
}

fn parse_function(lines: &[Line]) -> Result<FunctionSpec, ParseError> {
    // Everything up to `codigo =` is key=value territory; from there on the
    // indented block is captured verbatim.
    let mut head: Vec<Line> = Vec::new();
    let mut code_lines: Option<Vec<Line>> = None;
    for line in lines {
        match &mut code_lines {
            Some(collected) => collected.push(line.clone()),
            None => {
                let trimmed = line.text.trim();
                if trimmed == "codigo =" || trimmed == "codigo=" {
                    code_lines = Some(Vec::new());
                } else {
                    head.push(line.clone());
                }
            }
        }
    }

    let pairs = key_values(&head, SECTION_FUNCTION)?;
    let tipo = require(&pairs, SECTION_FUNCTION, "tipo")?;
    match tipo {
        "expression" => {
            let text = require(&pairs, SECTION_FUNCTION, "expression")?.to_string();
            if text.is_empty() {
                return Err(ParseError::Syntax {
                    section: SECTION_FUNCTION.to_string(),
                    line: lines.first().map_or(0, |l| l.number),
                    msg: "expression is empty".to_string(),
                });
            }
            Ok(FunctionSpec::Expression { text })
        }
        "code" => {
            let lines = code_lines.ok_or_else(|| ParseError::MissingKey {
                section: SECTION_FUNCTION.to_string(),
                key: "codigo".to_string(),
            })?;
            let text = dedent(&lines);
            if text.trim().is_empty() {
                return Err(ParseError::Syntax {
                    section: SECTION_FUNCTION.to_string(),
                    line: lines.first().map_or(0, |l| l.number),
                    msg: "code block is empty".to_string(),
                });
            }
            Ok(FunctionSpec::Code { text })
        }
        other => Err(ParseError::Syntax {
            section: SECTION_FUNCTION.to_string(),
            line: lines.first().map_or(0, |l| l.number),
            msg: format!("tipo must be 'expression' or 'code', got '{other}'"),
        }),
    }
}

/// Strips the common leading indentation of all non-blank lines.
fn dedent(lines: &[Line]) -> String {
    let indent = lines
        .iter()
        .filter(|l| !l.text.trim().is_empty())
        .map(|l| l.text.len() - l.text.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = String::new();
    for line in lines {
        if line.text.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str(&line.text[indent..]);
            out.push('\n');
        }
    }
    // Trailing blank lines carry no information.
    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

fn parse_simulation(lines: &[Line]) -> Result<SimulationSpec, ParseError> {
    let pairs = key_values(lines, SECTION_SIMULATION)?;
    let raw = require(&pairs, SECTION_SIMULATION, "numero_escenarios")?;
    let num_scenarios: u64 = raw.parse().map_err(|_| ParseError::Syntax {
        section: SECTION_SIMULATION.to_string(),
        line: pairs
            .iter()
            .find(|(k, _, _)| k == "numero_escenarios")
            .map_or(0, |(_, _, n)| *n),
        msg: format!("numero_escenarios must be a positive integer, got '{raw}'"),
    })?;
    if num_scenarios == 0 {
        return Err(ParseError::Syntax {
            section: SECTION_SIMULATION.to_string(),
            line: 0,
            msg: "numero_escenarios must be > 0".to_string(),
        });
    }
    let seed = match lookup(&pairs, "semilla_aleatoria") {
        Some(raw) => Some(raw.parse().map_err(|_| ParseError::Syntax {
            section: SECTION_SIMULATION.to_string(),
            line: 0,
            msg: format!("semilla_aleatoria must be an unsigned integer, got '{raw}'"),
        })?),
        None => None,
    };
    Ok(SimulationSpec {
        num_scenarios,
        seed,
    })
}

/// Expression functions may only reference declared variables; unknown names
/// would otherwise surface as runtime errors on every scenario.
fn check_function_names(model: &Model) -> MontebusResult<()> {
    if let FunctionSpec::Expression { text } = &model.function {
        let known: Vec<&str> = model.variables.iter().map(|v| v.name.as_str()).collect();
        if let Some(unknown) = crate::eval::expr::free_names(text)?
            .into_iter()
            .find(|name| !known.contains(&name.as_str()))
        {
            return Err(MontebusError::Parse(ParseError::Validation {
                line: 0,
                msg: format!("expression references undeclared variable '{unknown}'"),
            }));
        }
    }
    Ok(())
}
