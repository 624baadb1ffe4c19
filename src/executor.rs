//! Sandboxed interpretation of extraction programs.
//!
//! The executor runs one artifact against one simplified document and
//! returns a record or an [`ExtractError`]. Interpretation is pure: the
//! program cannot touch the filesystem, the network, or pipeline state,
//! and every run is bounded by a wall-clock deadline, a selector match
//! cap, and a per-field output cap.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::artifact::{Artifact, Step};

/// Field name to extracted value. Array results are carried as
/// JSON-encoded strings.
pub type Record = IndexMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractErrorKind {
    /// The artifact could not be loaded or compiled.
    Load,
    /// A field pipeline applied a step to an incompatible value.
    Field,
    /// The run exceeded its wall-clock deadline.
    Timeout,
    /// The run exceeded a match or output cap.
    Resource,
    /// The interpreter panicked; treated as an artifact fault.
    Panic,
}

impl ExtractErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Field => "field",
            Self::Timeout => "timeout",
            Self::Resource => "resource",
            Self::Panic => "panic",
        }
    }
}

/// An artifact runtime fault, attributed to a field when one is at fault.
#[derive(Debug, Clone)]
pub struct ExtractError {
    pub kind: ExtractErrorKind,
    pub message: String,
    pub field: Option<String>,
}

impl std::error::Error for ExtractError {}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "extract error ({}) in field '{field}': {}",
                self.kind.as_str(),
                self.message
            ),
            None => write!(f, "extract error ({}): {}", self.kind.as_str(), self.message),
        }
    }
}

impl ExtractError {
    fn field(kind: ExtractErrorKind, field: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

/// Resource bounds for one run.
#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    pub deadline: Duration,
    /// Most elements a single `select_all` may return.
    pub max_matches: usize,
    /// Most bytes a single field value may occupy.
    pub max_field_bytes: usize,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            max_matches: 10_000,
            max_field_bytes: 64 * 1024,
        }
    }
}

pub struct Executor {
    limits: ExecutorLimits,
}

/// Intermediate value flowing through a field pipeline.
enum Value<'a> {
    /// Initial state: the whole document.
    Doc,
    /// Result of `select`: at most one element.
    Element(Option<ElementRef<'a>>),
    /// Result of `select_all`: any number of elements.
    Elements(Vec<ElementRef<'a>>),
    Str(String),
    List(Vec<String>),
}

impl Value<'_> {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Doc => "document",
            Value::Element(_) => "element",
            Value::Elements(_) => "element list",
            Value::Str(_) => "string",
            Value::List(_) => "string list",
        }
    }
}

impl Executor {
    pub fn new(limits: ExecutorLimits) -> Self {
        Self { limits }
    }

    pub fn with_deadline_ms(deadline_ms: u64) -> Self {
        Self::new(ExecutorLimits {
            deadline: Duration::from_millis(deadline_ms),
            ..ExecutorLimits::default()
        })
    }

    /// Run an artifact against one simplified document.
    ///
    /// Deterministic for a given input; the returned record carries every
    /// program field, with empty strings where nothing matched.
    pub fn run(&self, artifact: &Artifact, simplified_html: &str) -> Result<Record, ExtractError> {
        let document = Html::parse_document(simplified_html);
        let started = Instant::now();
        let mut record = Record::new();

        for (field, program) in &artifact.program().fields {
            let mut value = Value::Doc;
            for step in &program.steps {
                if started.elapsed() > self.limits.deadline {
                    return Err(ExtractError {
                        kind: ExtractErrorKind::Timeout,
                        message: format!(
                            "deadline of {} ms exceeded",
                            self.limits.deadline.as_millis()
                        ),
                        field: Some(field.clone()),
                    });
                }
                value = self.apply(step, value, &document, field)?;
            }

            let rendered = finalize(value);
            if rendered.len() > self.limits.max_field_bytes {
                return Err(ExtractError::field(
                    ExtractErrorKind::Resource,
                    field,
                    format!(
                        "value of {} bytes exceeds the {} byte cap",
                        rendered.len(),
                        self.limits.max_field_bytes
                    ),
                ));
            }
            record.insert(field.clone(), rendered);
        }

        Ok(record)
    }

    fn apply<'a>(
        &self,
        step: &Step,
        value: Value<'a>,
        document: &'a Html,
        field: &str,
    ) -> Result<Value<'a>, ExtractError> {
        match step {
            Step::Literal { value: literal } => Ok(Value::Str(literal.clone())),

            Step::Select { selector } => {
                let selector = compile(selector, field)?;
                let found = match value {
                    Value::Doc => document.select(&selector).next(),
                    Value::Element(Some(el)) => el.select(&selector).next(),
                    Value::Element(None) => None,
                    Value::Elements(els) => {
                        els.iter().flat_map(|el| el.select(&selector)).next()
                    }
                    other => return Err(type_error(field, "select", &other)),
                };
                Ok(Value::Element(found))
            }

            Step::SelectAll { selector } => {
                let selector = compile(selector, field)?;
                let found: Vec<ElementRef<'a>> = match value {
                    Value::Doc => document.select(&selector).collect(),
                    Value::Element(Some(el)) => el.select(&selector).collect(),
                    Value::Element(None) => Vec::new(),
                    Value::Elements(els) => els
                        .iter()
                        .flat_map(|el| el.select(&selector).collect::<Vec<_>>())
                        .collect(),
                    other => return Err(type_error(field, "select_all", &other)),
                };
                if found.len() > self.limits.max_matches {
                    return Err(ExtractError::field(
                        ExtractErrorKind::Resource,
                        field,
                        format!(
                            "{} matches exceed the {} match cap",
                            found.len(),
                            self.limits.max_matches
                        ),
                    ));
                }
                Ok(Value::Elements(found))
            }

            Step::Text => match value {
                Value::Element(el) => Ok(Value::Str(el.map(element_text).unwrap_or_default())),
                Value::Elements(els) => {
                    Ok(Value::List(els.into_iter().map(element_text).collect()))
                }
                other => Err(type_error(field, "text", &other)),
            },

            Step::Attr { name } => match value {
                Value::Element(el) => Ok(Value::Str(
                    el.and_then(|e| e.value().attr(name).map(str::to_string))
                        .unwrap_or_default(),
                )),
                Value::Elements(els) => Ok(Value::List(
                    els.into_iter()
                        .map(|e| e.value().attr(name).unwrap_or_default().to_string())
                        .collect(),
                )),
                other => Err(type_error(field, "attr", &other)),
            },

            Step::Regex { pattern, group } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    ExtractError::field(ExtractErrorKind::Load, field, e.to_string())
                })?;
                let apply = |s: &str| -> String {
                    regex
                        .captures(s)
                        .and_then(|caps| caps.get(*group))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                };
                match value {
                    Value::Str(s) => Ok(Value::Str(apply(&s))),
                    Value::List(items) => {
                        Ok(Value::List(items.iter().map(|s| apply(s)).collect()))
                    }
                    other => Err(type_error(field, "regex", &other)),
                }
            }

            Step::Index { index } => match value {
                Value::Elements(els) => Ok(Value::Element(els.get(*index).copied())),
                Value::List(items) => {
                    Ok(Value::Str(items.get(*index).cloned().unwrap_or_default()))
                }
                other => Err(type_error(field, "index", &other)),
            },

            Step::Join { sep } => match value {
                Value::List(items) => Ok(Value::Str(items.join(sep))),
                other => Err(type_error(field, "join", &other)),
            },

            Step::Trim => match value {
                Value::Str(s) => Ok(Value::Str(s.trim().to_string())),
                Value::List(items) => Ok(Value::List(
                    items.into_iter().map(|s| s.trim().to_string()).collect(),
                )),
                other => Err(type_error(field, "trim", &other)),
            },
        }
    }
}

fn compile(selector: &str, field: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| {
        ExtractError::field(
            ExtractErrorKind::Load,
            field,
            format!("invalid selector '{selector}': {e}"),
        )
    })
}

fn type_error(field: &str, op: &str, value: &Value<'_>) -> ExtractError {
    ExtractError::field(
        ExtractErrorKind::Field,
        field,
        format!("'{op}' cannot apply to a {}", value.type_name()),
    )
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Render the pipeline's final value into the record representation.
/// Dangling element values render as their text; lists become JSON arrays.
fn finalize(value: Value<'_>) -> String {
    match value {
        Value::Doc => String::new(),
        Value::Element(el) => el.map(element_text).unwrap_or_default(),
        Value::Elements(els) => {
            let texts: Vec<String> = els.into_iter().map(element_text).collect();
            serde_json::to_string(&texts).unwrap_or_default()
        }
        Value::Str(s) => s,
        Value::List(items) => serde_json::to_string(&items).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PAGE: &str = r#"<html><body>
        <h1 class="title">Dune</h1>
        <div class="price">$9.99</div>
        <ul class="tags"><li>sci-fi</li><li>classic</li></ul>
        <a id="buy" href="/cart">Buy</a>
    </body></html>"#;

    fn artifact(json: &str) -> Artifact {
        Artifact::from_source(json).unwrap()
    }

    fn run(json: &str) -> Result<Record, ExtractError> {
        Executor::new(ExecutorLimits::default()).run(&artifact(json), PAGE)
    }

    #[test]
    fn extracts_scalars_lists_and_attributes() {
        let record = run(r##"{"fields": {
            "title": {"steps": [{"op": "select", "selector": "h1.title"}, {"op": "text"}]},
            "price": {"steps": [
                {"op": "select", "selector": ".price"},
                {"op": "text"},
                {"op": "regex", "pattern": "\\$([0-9.]+)", "group": 1}
            ]},
            "tags": {"steps": [{"op": "select_all", "selector": ".tags li"}, {"op": "text"}]},
            "link": {"steps": [{"op": "select", "selector": "#buy"}, {"op": "attr", "name": "href"}]}
        }}"##)
        .unwrap();

        assert_eq!(record["title"], "Dune");
        assert_eq!(record["price"], "9.99");
        assert_eq!(record["tags"], r#"["sci-fi","classic"]"#);
        assert_eq!(record["link"], "/cart");
    }

    #[test]
    fn missing_selections_yield_empty_values() {
        let record = run(r#"{"fields": {
            "ghost": {"steps": [{"op": "select", "selector": ".nope"}, {"op": "text"}]},
            "ghosts": {"steps": [{"op": "select_all", "selector": ".nope"}, {"op": "text"}]}
        }}"#)
        .unwrap();
        assert_eq!(record["ghost"], "");
        assert_eq!(record["ghosts"], "[]");
    }

    #[test]
    fn nested_selection_and_post_processing() {
        let record = run(r#"{"fields": {
            "first_tag": {"steps": [
                {"op": "select_all", "selector": ".tags li"},
                {"op": "text"},
                {"op": "index", "index": 0}
            ]},
            "all_tags": {"steps": [
                {"op": "select_all", "selector": ".tags li"},
                {"op": "text"},
                {"op": "join", "sep": ", "}
            ]},
            "constant": {"steps": [{"op": "literal", "value": "book"}]}
        }}"#)
        .unwrap();
        assert_eq!(record["first_tag"], "sci-fi");
        assert_eq!(record["all_tags"], "sci-fi, classic");
        assert_eq!(record["constant"], "book");
    }

    #[test]
    fn type_mismatch_is_attributed_to_the_field() {
        let err = run(r#"{"fields": {
            "good": {"steps": [{"op": "select", "selector": "h1"}, {"op": "text"}]},
            "broken": {"steps": [{"op": "text"}]}
        }}"#)
        .unwrap_err();
        assert_eq!(err.kind, ExtractErrorKind::Field);
        assert_eq!(err.field.as_deref(), Some("broken"));
    }

    #[test]
    fn match_cap_is_enforced() {
        let many: String = (0..50).map(|i| format!("<li>{i}</li>")).collect();
        let html = format!("<ul>{many}</ul>");
        let executor = Executor::new(ExecutorLimits {
            max_matches: 10,
            ..ExecutorLimits::default()
        });
        let err = executor
            .run(
                &artifact(r#"{"fields": {"items": {"steps": [{"op": "select_all", "selector": "li"}, {"op": "text"}]}}}"#),
                &html,
            )
            .unwrap_err();
        assert_eq!(err.kind, ExtractErrorKind::Resource);
    }

    #[test]
    fn field_byte_cap_is_enforced() {
        let executor = Executor::new(ExecutorLimits {
            max_field_bytes: 3,
            ..ExecutorLimits::default()
        });
        let err = executor
            .run(
                &artifact(r#"{"fields": {"title": {"steps": [{"op": "select", "selector": "h1"}, {"op": "text"}]}}}"#),
                PAGE,
            )
            .unwrap_err();
        assert_eq!(err.kind, ExtractErrorKind::Resource);
        assert_eq!(err.field.as_deref(), Some("title"));
    }

    #[test]
    fn deadline_zero_times_out() {
        let executor = Executor::new(ExecutorLimits {
            deadline: Duration::ZERO,
            ..ExecutorLimits::default()
        });
        let err = executor
            .run(
                &artifact(r#"{"fields": {"title": {"steps": [{"op": "select", "selector": "h1"}, {"op": "text"}]}}}"#),
                PAGE,
            )
            .unwrap_err();
        assert_eq!(err.kind, ExtractErrorKind::Timeout);
    }

    #[test]
    fn runs_are_deterministic() {
        let program = r#"{"fields": {
            "tags": {"steps": [{"op": "select_all", "selector": ".tags li"}, {"op": "text"}]}
        }}"#;
        let first = run(program).unwrap();
        for _ in 0..5 {
            assert_eq!(run(program).unwrap(), first);
        }
    }
}
