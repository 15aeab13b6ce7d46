//! Statement records and the normalizer that canonicalizes caller input.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::stream::RowStream;

pub type Parameters = Map<String, Value>;

/// Invoked once when a statement's result begins, with a sub-stream
/// carrying that statement's rows.
pub type ResultCallback = Arc<dyn Fn(RowStream) + Send + Sync>;

/// Control directives attached to a statement.
#[derive(Clone, Default)]
pub struct Directives {
    pub commit: bool,
    pub rollback: bool,
    pub metadata: Option<bool>,
    pub headers: Option<BTreeMap<String, String>>,
    pub on_result: Option<ResultCallback>,
}

impl Directives {
    /// True when any directive with a batch-level effect is set.
    pub fn has_effect(&self) -> bool {
        self.commit || self.rollback || self.metadata.is_some() || self.headers.is_some()
    }
}

impl fmt::Debug for Directives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directives")
            .field("commit", &self.commit)
            .field("rollback", &self.rollback)
            .field("metadata", &self.metadata)
            .field("headers", &self.headers)
            .field("on_result", &self.on_result.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// One unit of query text plus parameters and/or directives.
///
/// A record with no text is a pure control record.
#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub text: Option<String>,
    pub parameters: Option<Parameters>,
    pub directives: Directives,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// A record carrying only directives.
    pub fn control(directives: Directives) -> Self {
        Self {
            directives,
            ..Default::default()
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn commit(mut self) -> Self {
        self.directives.commit = true;
        self
    }

    pub fn rollback(mut self) -> Self {
        self.directives.rollback = true;
        self
    }

    pub fn metadata(mut self, enabled: bool) -> Self {
        self.directives.metadata = Some(enabled);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.directives
            .headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Register a callback that receives this statement's rows as a
    /// separate sub-stream.
    ///
    /// Each row goes to the sub-stream before the main sequence, and both
    /// are bounded by `channel_capacity`. Keep the sub-stream draining while
    /// reading the main sequence: if it is stored and left unread, the
    /// exchange stalls once `channel_capacity` rows are buffered in it.
    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: Fn(RowStream) + Send + Sync + 'static,
    {
        self.directives.on_result = Some(Arc::new(callback));
        self
    }

    /// Has non-blank text, i.e. is sent to the server.
    pub fn is_executable(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    fn is_usable(&self) -> bool {
        self.is_executable() || self.directives.has_effect()
    }
}

/// The shapes of statement input callers may hand to `write`/`open`.
#[derive(Debug, Clone)]
pub enum StatementInput {
    Text(String),
    Record(Statement),
    Many(Vec<StatementInput>),
}

impl StatementInput {
    pub fn empty() -> Self {
        Self::Many(Vec::new())
    }

    /// Apply `parameters` to every record that has none of its own.
    pub fn with_default_parameters(self, parameters: Parameters) -> Self {
        match self {
            Self::Text(text) => Self::Record(Statement::new(text).with_parameters(parameters)),
            Self::Record(mut statement) => {
                if statement.parameters.is_none() {
                    statement.parameters = Some(parameters);
                }
                Self::Record(statement)
            }
            Self::Many(items) => Self::Many(
                items
                    .into_iter()
                    .map(|item| item.with_default_parameters(parameters.clone()))
                    .collect(),
            ),
        }
    }

    /// Decode the JSON forms accepted on the wire-facing surfaces: a string,
    /// a statement object, or an array of either. `null` is empty input.
    pub fn from_json(value: Value) -> Result<Self, EngineError> {
        match value {
            Value::Null => Ok(Self::empty()),
            Value::String(text) => Ok(Self::Text(text)),
            Value::Array(items) => items
                .into_iter()
                .map(Self::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Many),
            Value::Object(object) => statement_from_object(object).map(Self::Record),
            other => Err(EngineError::InvalidInput(format!(
                "expected a string, statement object, or array, got {other}"
            ))),
        }
    }
}

fn statement_from_object(mut object: Map<String, Value>) -> Result<Statement, EngineError> {
    let mut statement = Statement::default();

    match object.remove("statement") {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => statement.text = Some(text),
        Some(other) => {
            return Err(EngineError::InvalidInput(format!(
                "`statement` must be a string, got {other}"
            )))
        }
    }
    match object.remove("parameters") {
        None | Some(Value::Null) => {}
        Some(Value::Object(parameters)) => statement.parameters = Some(parameters),
        Some(other) => {
            return Err(EngineError::InvalidInput(format!(
                "`parameters` must be an object, got {other}"
            )))
        }
    }
    statement.directives.commit = flag(&object, "commit")?.unwrap_or(false);
    statement.directives.rollback = flag(&object, "rollback")?.unwrap_or(false);
    statement.directives.metadata = flag(&object, "metadata")?;
    if let Some(headers) = object.remove("headers") {
        let Value::Object(headers) = headers else {
            return Err(EngineError::InvalidInput("`headers` must be an object".into()));
        };
        let headers = headers
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(value) => Ok((name, value)),
                other => Err(EngineError::InvalidInput(format!(
                    "header `{name}` must be a string, got {other}"
                ))),
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        statement.directives.headers = Some(headers);
    }
    Ok(statement)
}

fn flag(object: &Map<String, Value>, name: &str) -> Result<Option<bool>, EngineError> {
    match object.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(EngineError::InvalidInput(format!(
            "`{name}` must be a boolean, got {other}"
        ))),
    }
}

impl From<&str> for StatementInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for StatementInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Statement> for StatementInput {
    fn from(statement: Statement) -> Self {
        Self::Record(statement)
    }
}

impl From<Directives> for StatementInput {
    fn from(directives: Directives) -> Self {
        Self::Record(Statement::control(directives))
    }
}

impl<T: Into<StatementInput>> From<Vec<T>> for StatementInput {
    fn from(items: Vec<T>) -> Self {
        Self::Many(items.into_iter().map(Into::into).collect())
    }
}

/// Canonicalize `input` into an ordered sequence of statement records.
///
/// Nested arrays are flattened in order. Records that carry neither text nor
/// a directive are dropped; if nothing usable remains from non-empty input
/// the input is rejected.
pub fn normalize(input: StatementInput) -> Result<Vec<Statement>, EngineError> {
    let mut pending = vec![input];
    let mut leaves = 0usize;
    let mut statements = Vec::new();

    while let Some(item) = pending.pop() {
        match item {
            StatementInput::Many(items) => pending.extend(items.into_iter().rev()),
            StatementInput::Text(text) => {
                leaves += 1;
                let statement = Statement::new(text);
                if statement.is_usable() {
                    statements.push(statement);
                }
            }
            StatementInput::Record(statement) => {
                leaves += 1;
                if statement.is_usable() {
                    statements.push(statement);
                }
            }
        }
    }

    if leaves > 0 && statements.is_empty() {
        return Err(EngineError::InvalidInput(
            "input contains no statements and no directives".into(),
        ));
    }
    Ok(statements)
}

/// Directives hoisted from one normalized input to write level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDirectives {
    pub commit: bool,
    pub rollback: bool,
    pub metadata: Option<bool>,
    pub headers: Option<BTreeMap<String, String>>,
}

impl BatchDirectives {
    /// The first record specifying metadata or headers wins.
    pub fn hoist(statements: &[Statement]) -> Self {
        let mut hoisted = Self::default();
        for statement in statements {
            let directives = &statement.directives;
            hoisted.commit |= directives.commit;
            hoisted.rollback |= directives.rollback;
            if hoisted.metadata.is_none() {
                hoisted.metadata = directives.metadata;
            }
            if hoisted.headers.is_none() {
                hoisted.headers = directives.headers.clone();
            }
        }
        hoisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn texts(statements: &[Statement]) -> Vec<Option<&str>> {
        statements.iter().map(|s| s.text.as_deref()).collect()
    }

    #[test]
    fn test_single_string() {
        let out = normalize("Q".into()).unwrap();
        assert_eq!(texts(&out), vec![Some("Q")]);
    }

    #[test]
    fn test_array_of_strings_keeps_order() {
        let out = normalize(vec!["Q1", "Q2"].into()).unwrap();
        assert_eq!(texts(&out), vec![Some("Q1"), Some("Q2")]);
    }

    #[test]
    fn test_bare_directive_is_a_control_record() {
        let directives = Directives {
            commit: true,
            ..Default::default()
        };
        let out = normalize(directives.into()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].text.is_none());
        assert!(out[0].directives.commit);
        assert!(!out[0].is_executable());
    }

    #[test]
    fn test_nested_arrays_flatten_in_order() {
        let input = StatementInput::Many(vec![
            "A".into(),
            StatementInput::Many(vec!["B".into(), Statement::new("C").into()]),
            "D".into(),
        ]);
        let out = normalize(input).unwrap();
        assert_eq!(texts(&out), vec![Some("A"), Some("B"), Some("C"), Some("D")]);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(normalize(StatementInput::empty()).unwrap().is_empty());
    }

    #[test]
    fn test_unusable_input_is_rejected() {
        let err = normalize(Statement::default().into()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let err = normalize(vec!["   "].into()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_unusable_records_are_dropped_among_usable_ones() {
        let input = StatementInput::Many(vec![Statement::default().into(), "Q".into()]);
        assert_eq!(texts(&normalize(input).unwrap()), vec![Some("Q")]);
    }

    #[test]
    fn test_first_directive_occurrence_wins() {
        let statements = normalize(
            vec![
                Statement::new("A").metadata(true).header("X-Foo", "first"),
                Statement::new("B").metadata(false).header("X-Foo", "second").commit(),
            ]
            .into(),
        )
        .unwrap();
        let hoisted = BatchDirectives::hoist(&statements);
        assert!(hoisted.commit);
        assert!(!hoisted.rollback);
        assert_eq!(hoisted.metadata, Some(true));
        assert_eq!(hoisted.headers.unwrap()["X-Foo"], "first");
    }

    #[test]
    fn test_json_forms_decode() {
        let input = StatementInput::from_json(json!([
            "match (n) return n",
            {"statement": "return $x", "parameters": {"x": 1}, "commit": true},
            {"headers": {"X-Lorem": "ipsum"}}
        ]))
        .unwrap();
        let out = normalize(input).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].parameters.as_ref().unwrap()["x"], json!(1));
        assert!(out[1].directives.commit);
        assert!(out[2].text.is_none());
        assert_eq!(out[2].directives.headers.as_ref().unwrap()["X-Lorem"], "ipsum");
    }

    #[test]
    fn test_json_rejects_other_types() {
        assert!(StatementInput::from_json(json!(42)).is_err());
        assert!(StatementInput::from_json(json!({"statement": 1})).is_err());
        assert!(StatementInput::from_json(json!({"commit": "yes"})).is_err());
        assert!(StatementInput::from_json(json!({"headers": {"a": 1}})).is_err());
    }

    #[test]
    fn test_default_parameters_fill_gaps_only() {
        let mut params = Parameters::new();
        params.insert("x".into(), json!(1));
        let input = StatementInput::Many(vec![
            "A".into(),
            Statement::new("B").param("x", 2).into(),
        ])
        .with_default_parameters(params);
        let out = normalize(input).unwrap();
        assert_eq!(out[0].parameters.as_ref().unwrap()["x"], json!(1));
        assert_eq!(out[1].parameters.as_ref().unwrap()["x"], json!(2));
    }
}
