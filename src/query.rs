//! Query compiler for the AeroDB REST API
//!
//! Accumulates filters, projection, ordering, paging and mutation state through a
//! fluent API, then compiles it into an [`HttpRequest`] using the backend's
//! `column=operator.value` query syntax.

use crate::error::{CompileError, Error};
use crate::http::HttpTransport;
use crate::response::{rows_from_http, ErrorInfo, Response, Rows};
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Comparison and pattern operators understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    In,
}

impl Operator {
    pub const ALL: [Operator; 9] = [
        Operator::Eq,
        Operator::Neq,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::Like,
        Operator::Ilike,
        Operator::In,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Like => "like",
            Operator::Ilike => "ilike",
            Operator::In => "in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single filter operand
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<&String> for Scalar {
    fn from(s: &String) -> Self {
        Scalar::Text(s.clone())
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<i32> for Scalar {
    fn from(i: i32) -> Self {
        Scalar::Int(i.into())
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<u32> for Scalar {
    fn from(i: u32) -> Self {
        Scalar::Int(i.into())
    }
}

impl From<f64> for Scalar {
    fn from(x: f64) -> Self {
        Scalar::Float(x)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        v.map_or(Scalar::Null, Into::into)
    }
}

/// Right-hand side of a predicate
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

impl FilterValue {
    pub fn scalar(value: impl Into<Scalar>) -> Self {
        FilterValue::Scalar(value.into())
    }

    pub fn list<V: Into<Scalar>>(values: impl IntoIterator<Item = V>) -> Self {
        FilterValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// One `column operator value` constraint. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    column: String,
    operator: Operator,
    value: FilterValue,
}

impl Predicate {
    /// Build a predicate, rejecting reserved column names and operand shapes
    /// the operator cannot take.
    pub fn new(
        column: impl Into<String>,
        operator: Operator,
        value: FilterValue,
    ) -> Result<Self, CompileError> {
        let column = column.into();
        if RESERVED_PARAMS.contains(&column.as_str()) {
            return Err(CompileError::ReservedColumn(column));
        }
        match (&value, operator) {
            (FilterValue::List(values), Operator::In) if values.is_empty() => {
                return Err(CompileError::EmptyInList { column });
            }
            (FilterValue::List(_), Operator::In) => {}
            (FilterValue::Scalar(_), Operator::In) => {
                return Err(CompileError::ExpectedList {
                    column,
                    operator: operator.to_string(),
                });
            }
            (FilterValue::List(_), _) => {
                return Err(CompileError::ExpectedScalar {
                    column,
                    operator: operator.to_string(),
                });
            }
            (FilterValue::Scalar(_), _) => {}
        }

        Ok(Self {
            column,
            operator,
            value,
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn value(&self) -> &FilterValue {
        &self.value
    }

    /// Wire form: `(column, "operator.value")`
    pub fn to_param(&self) -> (String, String) {
        let rendered = match &self.value {
            FilterValue::Scalar(v) => v.to_string(),
            FilterValue::List(values) => {
                let items: Vec<String> = values
                    .iter()
                    .map(|v| quote_list_item(&v.to_string()).into_owned())
                    .collect();
                format!("({})", items.join(","))
            }
        };
        (self.column.clone(), format!("{}.{}", self.operator, rendered))
    }
}

fn quote_list_item(raw: &str) -> Cow<'_, str> {
    let needs_quotes =
        raw.is_empty() || raw.contains(|c| matches!(c, ',' | '(' | ')' | '"' | '\\'));
    if !needs_quotes {
        return Cow::Borrowed(raw);
    }

    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('"');
    for c in raw.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

/// A filter parameter decoded from its wire form. Values stay textual.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilter {
    pub column: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

/// Query parameter names that are never filters
pub const RESERVED_PARAMS: [&str; 4] = ["select", "order", "limit", "offset"];

/// Decode one `column=operator.value` parameter.
pub fn parse_filter(key: &str, value: &str) -> Result<ParsedFilter, CompileError> {
    if RESERVED_PARAMS.contains(&key) {
        return Err(CompileError::MalformedFilter(format!("'{}' is not a filter", key)));
    }

    let (op, rest) = value
        .split_once('.')
        .ok_or_else(|| CompileError::MalformedFilter(format!("missing operator in '{}'", value)))?;
    let operator = Operator::parse(op)
        .ok_or_else(|| CompileError::MalformedFilter(format!("unknown operator '{}'", op)))?;

    let values = if operator == Operator::In {
        let inner = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(|| CompileError::MalformedFilter(format!("unparenthesized list '{}'", rest)))?;
        parse_list(inner)?
    } else {
        vec![rest.to_string()]
    };

    Ok(ParsedFilter {
        column: key.to_string(),
        operator,
        values,
    })
}

fn parse_list(inner: &str) -> Result<Vec<String>, CompileError> {
    let mut items = Vec::new();
    if inner.is_empty() {
        return Ok(items);
    }

    let mut chars = inner.chars().peekable();
    loop {
        let mut item = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c) => item.push(c),
                        None => {
                            return Err(CompileError::MalformedFilter("dangling escape".to_string()))
                        }
                    },
                    Some('"') => break,
                    Some(c) => item.push(c),
                    None => {
                        return Err(CompileError::MalformedFilter(
                            "unterminated quoted value".to_string(),
                        ))
                    }
                }
            }
            items.push(item);
            match chars.next() {
                None => return Ok(items),
                Some(',') => continue,
                Some(c) => {
                    return Err(CompileError::MalformedFilter(format!(
                        "unexpected '{}' after quoted value",
                        c
                    )))
                }
            }
        }

        loop {
            match chars.next() {
                None => {
                    items.push(item);
                    return Ok(items);
                }
                Some(',') => break,
                Some(c) => item.push(c),
            }
        }
        items.push(item);
    }
}

/// HTTP verb of a compiled request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Patch => write!(f, "PATCH"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// What the compiled request does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
}

impl Mode {
    pub fn method(self) -> Method {
        match self {
            Mode::Select => Method::Get,
            Mode::Insert => Method::Post,
            Mode::Update => Method::Patch,
            Mode::Delete => Method::Delete,
        }
    }

    fn action(self) -> &'static str {
        match self {
            Mode::Select => "Query",
            Mode::Insert => "Insert",
            Mode::Update => "Update",
            Mode::Delete => "Delete",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Select => write!(f, "select"),
            Mode::Insert => write!(f, "insert"),
            Mode::Update => write!(f, "update"),
            Mode::Delete => write!(f, "delete"),
        }
    }
}

/// Single-column ordering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordering {
    pub column: String,
    pub ascending: bool,
    pub nulls_first: Option<bool>,
}

impl fmt::Display for Ordering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.column, if self.ascending { "asc" } else { "desc" })?;
        match self.nulls_first {
            Some(true) => write!(f, ".nullsfirst"),
            Some(false) => write!(f, ".nullslast"),
            None => Ok(()),
        }
    }
}

/// Accumulated builder state
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub table: String,
    pub schema: String,
    pub projection: String,
    pub predicates: Vec<Predicate>,
    pub ordering: Option<Ordering>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub mode: Mode,
    pub payload: Option<Value>,
}

impl QueryState {
    fn new(table: String, schema: String) -> Self {
        Self {
            table,
            schema,
            projection: "*".to_string(),
            predicates: Vec::new(),
            ordering: None,
            limit: None,
            offset: None,
            mode: Mode::Select,
            payload: None,
        }
    }
}

/// Wire-level request description handed to the HTTP collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    /// URL-encoded `k=v&k=v` in parameter order
    pub fn query_string(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Query builder for AeroDB tables
///
/// Chained calls consume and return the builder. It is `Clone`, so a built
/// query can be kept and executed again; each execution is a separate request.
///
/// # Example
/// ```
/// use aerodb::query::table;
///
/// let request = table("users")
///     .eq("role", "admin")
///     .order("created_at", false)
///     .limit(10)
///     .compile()
///     .unwrap();
/// assert_eq!(request.query_string(), "role=eq.admin&order=created_at.desc&limit=10");
/// ```
#[derive(Clone)]
pub struct QueryBuilder {
    state: QueryState,
    deferred: Option<CompileError>,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("state", &self.state)
            .field("deferred", &self.deferred)
            .field("bound", &self.transport.is_some())
            .finish()
    }
}

impl QueryBuilder {
    /// Create a builder that can compile but is not bound to a client
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            state: QueryState::new(name.into(), "public".to_string()),
            deferred: None,
            transport: None,
        }
    }

    pub(crate) fn bound(
        name: impl Into<String>,
        schema: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            state: QueryState::new(name.into(), schema.into()),
            deferred: None,
            transport: Some(transport),
        }
    }

    pub fn state(&self) -> &QueryState {
        &self.state
    }

    /// Set the projection. Relation syntax like `"id, author(name)"` is passed through.
    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.state.projection = columns.into();
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.filter(column, Operator::Eq, FilterValue::scalar(value))
    }

    pub fn neq(self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.filter(column, Operator::Neq, FilterValue::scalar(value))
    }

    pub fn gt(self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.filter(column, Operator::Gt, FilterValue::scalar(value))
    }

    pub fn gte(self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.filter(column, Operator::Gte, FilterValue::scalar(value))
    }

    pub fn lt(self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.filter(column, Operator::Lt, FilterValue::scalar(value))
    }

    pub fn lte(self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.filter(column, Operator::Lte, FilterValue::scalar(value))
    }

    /// Case-sensitive pattern match
    pub fn like(self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filter(column, Operator::Like, FilterValue::scalar(pattern.into()))
    }

    /// Case-insensitive pattern match
    pub fn ilike(self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filter(column, Operator::Ilike, FilterValue::scalar(pattern.into()))
    }

    /// Membership test. An empty value list fails at compile time.
    pub fn in_<V: Into<Scalar>>(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filter(column, Operator::In, FilterValue::list(values))
    }

    /// Add a predicate with an explicit operator
    pub fn filter(mut self, column: impl Into<String>, operator: Operator, value: FilterValue) -> Self {
        match Predicate::new(column, operator, value) {
            Ok(predicate) => self.state.predicates.push(predicate),
            Err(err) => {
                if self.deferred.is_none() {
                    self.deferred = Some(err);
                }
            }
        }
        self
    }

    /// Order by one column. A second call replaces the first.
    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.state.ordering = Some(Ordering {
            column: column.into(),
            ascending,
            nulls_first: None,
        });
        self
    }

    /// Order by one column with explicit null placement
    pub fn order_nulls(mut self, column: impl Into<String>, ascending: bool, nulls_first: bool) -> Self {
        self.state.ordering = Some(Ordering {
            column: column.into(),
            ascending,
            nulls_first: Some(nulls_first),
        });
        self
    }

    /// Limit number of results
    pub fn limit(mut self, n: i64) -> Self {
        self.state.limit = Some(n);
        self
    }

    /// Skip results (offset)
    pub fn offset(mut self, n: i64) -> Self {
        self.state.offset = Some(n);
        self
    }

    /// Insert one record (an object) or many (an array of objects)
    pub fn insert(mut self, rows: impl Into<Value>) -> Self {
        self.state.mode = Mode::Insert;
        self.state.payload = Some(rows.into());
        self
    }

    /// Patch every row matching the filters. Requires at least one filter.
    pub fn update(mut self, patch: impl Into<Value>) -> Self {
        self.state.mode = Mode::Update;
        self.state.payload = Some(patch.into());
        self
    }

    /// Delete every row matching the filters. Requires at least one filter.
    pub fn delete(mut self) -> Self {
        self.state.mode = Mode::Delete;
        self.state.payload = None;
        self
    }

    /// Compile the accumulated state without touching the network
    pub fn compile(&self) -> Result<HttpRequest, CompileError> {
        if let Some(err) = &self.deferred {
            return Err(err.clone());
        }

        let state = &self.state;
        if let Some(n) = state.limit.filter(|n| *n < 0) {
            return Err(CompileError::NegativeLimit(n));
        }
        if let Some(n) = state.offset.filter(|n| *n < 0) {
            return Err(CompileError::NegativeOffset(n));
        }
        if matches!(state.mode, Mode::Update | Mode::Delete) && state.predicates.is_empty() {
            return Err(CompileError::UnconditionalMutation {
                mode: state.mode.to_string(),
                table: state.table.clone(),
            });
        }

        let mut query = Vec::new();
        if state.projection != "*" {
            query.push(("select".to_string(), state.projection.clone()));
        }
        if state.mode != Mode::Insert {
            query.extend(state.predicates.iter().map(Predicate::to_param));
        }
        if state.mode == Mode::Select {
            if let Some(ordering) = &state.ordering {
                query.push(("order".to_string(), ordering.to_string()));
            }
            if let Some(n) = state.limit {
                query.push(("limit".to_string(), n.to_string()));
            }
            if let Some(n) = state.offset {
                query.push(("offset".to_string(), n.to_string()));
            }
        }

        let mut headers = Vec::new();
        if state.mode != Mode::Select {
            headers.push(("Prefer".to_string(), "return=representation".to_string()));
        }
        if state.schema != "public" {
            let profile = if state.mode == Mode::Select {
                "Accept-Profile"
            } else {
                "Content-Profile"
            };
            headers.push((profile.to_string(), state.schema.clone()));
        }

        let body = match state.mode {
            Mode::Select | Mode::Delete => None,
            Mode::Insert => Some(normalize_rows(state.payload.as_ref())?),
            Mode::Update => match &state.payload {
                Some(patch @ Value::Object(_)) => Some(patch.clone()),
                _ => {
                    return Err(CompileError::InvalidPayload(
                        "update patch must be an object".to_string(),
                    ))
                }
            },
        };

        Ok(HttpRequest {
            method: state.mode.method(),
            path: format!("/{}", state.table),
            query,
            headers,
            body,
        })
    }

    /// Compile and send. Every failure resolves into the returned envelope.
    pub async fn execute(&self) -> Response<Rows> {
        let request = match self.compile() {
            Ok(request) => request,
            Err(err) => {
                debug!("[QUERY] {} on '{}' rejected: {}", self.state.mode, self.state.table, err);
                return err.into();
            }
        };

        let Some(transport) = &self.transport else {
            return Error::Config("query is not bound to a client".to_string()).into();
        };

        rows_from_http(self.state.mode.action(), transport.send(&request).await)
    }

    /// Like [`execute`](Self::execute), deserializing each row into `T`
    pub async fn execute_as<T: DeserializeOwned>(&self) -> Response<Vec<T>> {
        match self.execute().await {
            Response::Data(rows) => rows
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<T>, _>>()
                .map_or_else(
                    |e| {
                        Response::Error(ErrorInfo::transport(&Error::MalformedResponse(
                            e.to_string(),
                        )))
                    },
                    Response::Data,
                ),
            Response::Error(err) => Response::Error(err),
        }
    }
}

fn normalize_rows(payload: Option<&Value>) -> Result<Value, CompileError> {
    match payload {
        Some(row @ Value::Object(_)) => Ok(Value::Array(vec![row.clone()])),
        Some(Value::Array(rows)) if rows.iter().all(Value::is_object) => Ok(Value::Array(rows.clone())),
        Some(Value::Array(_)) => Err(CompileError::InvalidPayload(
            "every inserted row must be an object".to_string(),
        )),
        _ => Err(CompileError::InvalidPayload(
            "insert expects an object or an array of objects".to_string(),
        )),
    }
}

/// Create a table query builder
pub fn table(name: impl Into<String>) -> QueryBuilder {
    QueryBuilder::table(name)
}
