//! Filter pipeline applied to query results
//!
//! A test composes its outcome by threading the query's [`Outcome`]
//! through an ordered list of filters. Filters are pure transformations:
//! most pass failures through untouched, `default:` recovers them, and
//! the threshold filters turn successful payloads into WARNING/CRITICAL
//! failures. This is the canonical place where raw results become
//! status-bearing outcomes.
//!
//! Filter syntax is `kind:argument`:
//!
//! - `regex:<pattern>` - first capture group (or whole match); no match
//!   is a CRITICAL failure carrying the payload.
//! - `grep:<pattern>` - keep matching lines.
//! - `default:<value>` - replace any failure with the given payload.
//! - `warning:<op> <value>` / `critical:<op> <value>` - raise when the
//!   comparison matches. Operators: `<, <=, >, >=, ==, !=, =~`.

use regex::Regex;
use shared::status::{Failure, Outcome, Status};
use shared::utils::truncate_string;
use shared::ProbeError;

/// One stage of the pipeline.
#[derive(Debug, Clone)]
pub enum Filter {
    Regex { raw: String, pattern: Regex },
    Grep { raw: String, pattern: Regex },
    Default { value: String },
    Warning { check: Comparison },
    Critical { check: Comparison },
}

impl Filter {
    /// Parses one `kind:argument` filter specification.
    pub fn parse(text: &str) -> shared::Result<Filter> {
        let (kind, argument) = text.split_once(':').ok_or_else(|| {
            ProbeError::Config(format!("Invalid filter '{text}': expected 'kind:argument'"))
        })?;

        match kind.trim().to_ascii_lowercase().as_str() {
            "regex" => Ok(Filter::Regex {
                raw: argument.to_string(),
                pattern: compile(argument)?,
            }),
            "grep" => Ok(Filter::Grep {
                raw: argument.to_string(),
                pattern: compile(argument)?,
            }),
            "default" => Ok(Filter::Default {
                value: argument.to_string(),
            }),
            "warning" => Ok(Filter::Warning {
                check: Comparison::parse(argument)?,
            }),
            "critical" => Ok(Filter::Critical {
                check: Comparison::parse(argument)?,
            }),
            other => Err(ProbeError::Config(format!("Unknown filter type '{other}'")).into()),
        }
    }

    /// Applies this filter to the running outcome.
    pub fn apply(&self, input: Outcome) -> Outcome {
        match self {
            Filter::Regex { raw, pattern } => match input {
                Ok(payload) => match pattern.captures(&payload) {
                    Some(caps) => {
                        let matched = caps
                            .get(1)
                            .or_else(|| caps.get(0))
                            .map(|m| m.as_str().to_string())
                            .unwrap_or_default();
                        Ok(matched)
                    }
                    None => Err(Failure::critical(format!("No match for regex '{raw}'"))
                        .with_partial(payload)),
                },
                Err(failure) => Err(failure),
            },

            Filter::Grep { raw, pattern } => match input {
                Ok(payload) => {
                    let matched: Vec<&str> = payload
                        .lines()
                        .filter(|line| pattern.is_match(line))
                        .collect();
                    if matched.is_empty() {
                        Err(Failure::critical(format!("No lines matched '{raw}'"))
                            .with_partial(payload))
                    } else {
                        Ok(matched.join("\n"))
                    }
                }
                Err(failure) => Err(failure),
            },

            Filter::Default { value } => match input {
                Ok(payload) => Ok(payload),
                Err(_) => Ok(value.clone()),
            },

            Filter::Warning { check } => threshold(input, check, Status::Warning),
            Filter::Critical { check } => threshold(input, check, Status::Critical),
        }
    }
}

fn compile(pattern: &str) -> shared::Result<Regex> {
    Regex::new(pattern)
        .map_err(|err| ProbeError::Config(format!("Invalid filter regex '{pattern}': {err}")).into())
}

fn threshold(input: Outcome, check: &Comparison, status: Status) -> Outcome {
    let payload = match input {
        Ok(payload) => payload,
        Err(failure) => return Err(failure),
    };

    match check.evaluate(payload.trim()) {
        Ok(true) => {
            let message = format!("Matched threshold '{}'", check.raw);
            let failure = match status {
                Status::Warning => Failure::warning(message),
                _ => Failure::critical(message),
            };
            Err(failure.with_partial(payload))
        }
        Ok(false) => Ok(payload),
        Err(failure) => Err(failure.with_partial(payload)),
    }
}

/// Parses a whole pipeline, preserving order.
pub fn parse_pipeline(specs: &[String]) -> shared::Result<Vec<Filter>> {
    specs.iter().map(|spec| Filter::parse(spec)).collect()
}

/// A comparison against a threshold value.
///
/// Values compare numerically whenever both sides parse as numbers;
/// `==`/`!=` fall back to string comparison, while the ordering
/// operators on non-numeric input are themselves a CRITICAL failure.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub raw: String,
    op: CompareOp,
    operand: String,
    number: Option<f64>,
    pattern: Option<Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Match,
}

impl Comparison {
    /// Parses `"<op> <value>"`, e.g. `"> 5"` or `"=~ down"`.
    pub fn parse(text: &str) -> shared::Result<Comparison> {
        let trimmed = text.trim();

        // Two-character operators must be tried first.
        let table: &[(&str, CompareOp)] = &[
            ("<=", CompareOp::Le),
            (">=", CompareOp::Ge),
            ("==", CompareOp::Eq),
            ("!=", CompareOp::Ne),
            ("=~", CompareOp::Match),
            ("<", CompareOp::Lt),
            (">", CompareOp::Gt),
        ];

        let (op, rest) = table
            .iter()
            .find_map(|(symbol, op)| trimmed.strip_prefix(symbol).map(|rest| (*op, rest)))
            .ok_or_else(|| {
                ProbeError::Config(format!("Invalid comparison '{text}': unknown operator"))
            })?;

        let operand = rest.trim().to_string();
        if operand.is_empty() {
            return Err(
                ProbeError::Config(format!("Invalid comparison '{text}': missing value")).into(),
            );
        }

        let pattern = if op == CompareOp::Match {
            Some(compile(&operand)?)
        } else {
            None
        };

        Ok(Comparison {
            raw: trimmed.to_string(),
            op,
            number: operand.parse::<f64>().ok(),
            operand,
            pattern,
        })
    }

    /// Evaluates the comparison against a payload value.
    pub fn evaluate(&self, value: &str) -> Result<bool, Failure> {
        match self.op {
            CompareOp::Match => Ok(self
                .pattern
                .as_ref()
                .map(|pattern| pattern.is_match(value))
                .unwrap_or(false)),

            CompareOp::Eq | CompareOp::Ne => {
                let equal = match (value.trim().parse::<f64>(), self.number) {
                    (Ok(left), Some(right)) => left == right,
                    _ => value == self.operand,
                };
                Ok(equal == (self.op == CompareOp::Eq))
            }

            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                let left = value.trim().parse::<f64>().map_err(|_| {
                    Failure::critical(format!(
                        "Attempted numeric comparison on '{}'",
                        truncate_string(value, 40)
                    ))
                })?;
                let right = self.number.ok_or_else(|| {
                    Failure::critical(format!(
                        "Attempted numeric comparison on '{}'",
                        self.operand
                    ))
                })?;

                Ok(match self.op {
                    CompareOp::Lt => left < right,
                    CompareOp::Le => left <= right,
                    CompareOp::Gt => left > right,
                    _ => left >= right,
                })
            }
        }
    }
}
