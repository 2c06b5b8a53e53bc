//! Collection queries and their in-memory evaluation.
//!
//! A query selects documents of one collection through a tree of filters,
//! optionally ordering them, limiting them and attaching related documents
//! via include subqueries. Subqueries refer to rows of enclosing queries
//! through `$N.attr` variables, where `$1` is the nearest enclosing row.

use crate::path::PathSegment;
use crate::storage::Direction;
use crate::{AttributePath, CollectionName, Error, Object, Result, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Variables with this prefix are bound to precomputed view results.
pub const VIEW_VARIABLE_PREFIX: &str = "view_";

/// Scope of caller-supplied variables such as `$global.userId`.
pub const GLOBAL_SCOPE: &str = "global";

/// Number of hex characters kept from a structural hash.
const HASH_LEN: usize = 16;

static NULL: Value = Value::Null;

/// Structural hash of a query tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Truncated SHA-256 of the canonical JSON form of `value`.
pub(crate) fn structural_hash<T: Serialize>(value: &T) -> Result<String> {
    // Maps are BTreeMaps throughout, so the serialized form is canonical.
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Error::Encoding(format!("cannot serialize for hashing: {}", e)))?;
    let digest = Sha256::digest(&bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    Ok(hex)
}

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "nin")]
    Nin,
}

/// Right-hand side of a filter. Strings beginning with `$` are variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum FilterValue {
    Value(Value),
    /// Variable name without the leading `$`
    Variable(String),
}

impl FilterValue {
    pub fn var(name: impl Into<String>) -> Self {
        FilterValue::Variable(name.into())
    }

    pub fn variable_name(&self) -> Option<&str> {
        match self {
            FilterValue::Variable(name) => Some(name),
            FilterValue::Value(_) => None,
        }
    }
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) if s.starts_with('$') => FilterValue::Variable(s[1..].to_string()),
            other => FilterValue::Value(other),
        }
    }
}

impl From<FilterValue> for Value {
    fn from(value: FilterValue) -> Self {
        match value {
            FilterValue::Value(v) => v,
            FilterValue::Variable(name) => Value::String(format!("${}", name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStatement {
    /// Path from the document root
    pub attribute: AttributePath,
    pub op: FilterOp,
    pub value: FilterValue,
}

/// A node of a query's filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueryWhere {
    Filter(FilterStatement),
    And { filters: Vec<QueryWhere> },
    Or { filters: Vec<QueryWhere> },
    /// Matches when the subquery returns at least one row
    Exists { subquery: Box<CollectionQuery> },
    Constant { value: bool },
}

impl QueryWhere {
    pub fn filter(
        attribute: impl Into<AttributePath>,
        op: FilterOp,
        value: impl Into<FilterValue>,
    ) -> Self {
        QueryWhere::Filter(FilterStatement {
            attribute: attribute.into(),
            op,
            value: value.into(),
        })
    }

    pub fn exists(subquery: CollectionQuery) -> Self {
        QueryWhere::Exists {
            subquery: Box::new(subquery),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOrder {
    pub attribute: AttributePath,
    pub direction: Direction,
    /// Order by `attribute` of the first row of this subquery instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subquery: Option<Box<CollectionQuery>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationSubquery {
    pub subquery: CollectionQuery,
    pub cardinality: Cardinality,
}

/// A query over one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionQuery {
    pub collection_name: CollectionName,
    /// Conjunction of clauses
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<QueryWhere>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<QueryOrder>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub include: BTreeMap<String, RelationSubquery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, Value>,
}

impl CollectionQuery {
    pub fn new(collection_name: impl Into<CollectionName>) -> Self {
        Self {
            collection_name: collection_name.into(),
            filters: Vec::new(),
            order: Vec::new(),
            include: BTreeMap::new(),
            limit: None,
            vars: BTreeMap::new(),
        }
    }

    pub fn filter(
        mut self,
        attribute: impl Into<AttributePath>,
        op: FilterOp,
        value: impl Into<FilterValue>,
    ) -> Self {
        self.filters.push(QueryWhere::filter(attribute, op, value));
        self
    }

    pub fn where_clause(mut self, clause: QueryWhere) -> Self {
        self.filters.push(clause);
        self
    }

    pub fn order_by(mut self, attribute: impl Into<AttributePath>, direction: Direction) -> Self {
        self.order.push(QueryOrder {
            attribute: attribute.into(),
            direction,
            subquery: None,
        });
        self
    }

    pub fn include(
        mut self,
        name: impl Into<String>,
        subquery: CollectionQuery,
        cardinality: Cardinality,
    ) -> Self {
        self.include.insert(
            name.into(),
            RelationSubquery {
                subquery,
                cardinality,
            },
        );
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn hash(&self) -> Result<QueryHash> {
        structural_hash(self).map(QueryHash)
    }

    /// Direct subqueries: exists clauses, includes and order subqueries.
    pub fn subqueries(&self) -> Vec<&CollectionQuery> {
        let mut found = Vec::new();
        for clause in &self.filters {
            collect_exists(clause, &mut found);
        }
        found.extend(self.include.values().map(|rel| &rel.subquery));
        found.extend(self.order.iter().filter_map(|o| o.subquery.as_deref()));
        found
    }

    /// Variable names used by this query's own filters.
    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for clause in &self.filters {
            collect_variables(clause, &mut names);
        }
        names
    }
}

fn collect_exists<'a>(clause: &'a QueryWhere, found: &mut Vec<&'a CollectionQuery>) {
    match clause {
        QueryWhere::Exists { subquery } => found.push(subquery),
        QueryWhere::And { filters } | QueryWhere::Or { filters } => {
            for nested in filters {
                collect_exists(nested, found);
            }
        }
        QueryWhere::Filter(_) | QueryWhere::Constant { .. } => {}
    }
}

fn collect_variables<'a>(clause: &'a QueryWhere, names: &mut Vec<&'a str>) {
    match clause {
        QueryWhere::Filter(statement) => names.extend(statement.value.variable_name()),
        QueryWhere::And { filters } | QueryWhere::Or { filters } => {
            for nested in filters {
                collect_variables(nested, names);
            }
        }
        QueryWhere::Exists { .. } | QueryWhere::Constant { .. } => {}
    }
}

/// A parsed variable reference.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableRef<'a> {
    /// `$N.path`: the N-th enclosing row
    Relational { depth: usize, path: Vec<PathSegment> },
    /// `$scope.path` resolved against query variables
    Named { scope: &'a str, path: Vec<PathSegment> },
}

impl<'a> VariableRef<'a> {
    pub fn parse(name: &'a str) -> Self {
        let mut parts = name.split('.');
        let scope = parts.next().unwrap_or_default();
        let path = parts
            .map(|part| match part.parse::<u64>() {
                Ok(i) => PathSegment::Index(i),
                Err(_) => PathSegment::Key(part.to_string()),
            })
            .collect();
        match scope.parse::<usize>() {
            Ok(depth) if depth > 0 => VariableRef::Relational { depth, path },
            _ => VariableRef::Named { scope, path },
        }
    }
}

/// Where the evaluator reads documents from.
pub trait CollectionSource {
    /// Live documents of `collection`, in id order.
    fn documents(&self, collection: &str) -> Result<Vec<(String, Value)>>;
}

impl CollectionSource for crate::diff::DatabaseView {
    fn documents(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .get(collection)
            .map(|docs| docs.iter().map(|(id, d)| (id.clone(), d.clone())).collect())
            .unwrap_or_default())
    }
}

type Rows = Rc<Vec<(String, Value)>>;

/// Runs queries against a [`CollectionSource`], loading each collection at
/// most once.
pub struct QueryEvaluator<'a, S: CollectionSource + ?Sized> {
    source: &'a S,
    loaded: RefCell<BTreeMap<CollectionName, Rows>>,
}

impl<'a, S: CollectionSource + ?Sized> QueryEvaluator<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            loaded: RefCell::new(BTreeMap::new()),
        }
    }

    /// Matching documents by id, ordered, limited and with includes attached.
    pub fn execute(&self, query: &CollectionQuery) -> Result<Vec<(String, Value)>> {
        self.run(query, &[], &query.vars)
    }

    fn load(&self, collection: &str) -> Result<Rows> {
        if let Some(rows) = self.loaded.borrow().get(collection) {
            return Ok(rows.clone());
        }
        let rows = Rc::new(self.source.documents(collection)?);
        self.loaded
            .borrow_mut()
            .insert(collection.to_string(), rows.clone());
        Ok(rows)
    }

    fn run(
        &self,
        query: &CollectionQuery,
        ancestors: &[&Value],
        vars: &BTreeMap<String, Value>,
    ) -> Result<Vec<(String, Value)>> {
        let vars: Cow<'_, BTreeMap<String, Value>> = if query.vars.is_empty() {
            Cow::Borrowed(vars)
        } else {
            let mut merged = vars.clone();
            merged.extend(query.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
            Cow::Owned(merged)
        };
        let rows = self.load(&query.collection_name)?;

        let mut selected = Vec::new();
        for (id, doc) in rows.iter() {
            if self.matches_all(&query.filters, doc, ancestors, &vars)? {
                selected.push((id, doc));
            }
        }

        if !query.order.is_empty() {
            let mut keyed = Vec::with_capacity(selected.len());
            for (id, doc) in selected {
                let keys = self.order_keys(&query.order, doc, ancestors, &vars)?;
                keyed.push((keys, id, doc));
            }
            keyed.sort_by(|(a, a_id, _), (b, b_id, _)| {
                compare_order_keys(&query.order, a, b).then_with(|| a_id.cmp(b_id))
            });
            selected = keyed.into_iter().map(|(_, id, doc)| (id, doc)).collect();
        }

        if let Some(limit) = query.limit {
            selected.truncate(limit);
        }

        let mut results = Vec::with_capacity(selected.len());
        for (id, doc) in selected {
            let mut output = doc.clone();
            if !query.include.is_empty() {
                let scope = with_row(ancestors, doc);
                let mut attached = Object::new();
                for (name, relation) in &query.include {
                    let related = self.run(&relation.subquery, &scope, &vars)?;
                    let value = match relation.cardinality {
                        Cardinality::One => related
                            .into_iter()
                            .next()
                            .map(|(_, v)| v)
                            .unwrap_or_default(),
                        Cardinality::Many => {
                            Value::Array(related.into_iter().map(|(_, v)| v).collect())
                        }
                    };
                    attached.insert(name.clone(), value);
                }
                if let Value::Object(map) = &mut output {
                    map.extend(attached);
                }
            }
            results.push((id.clone(), output));
        }
        Ok(results)
    }

    fn matches_all(
        &self,
        clauses: &[QueryWhere],
        doc: &Value,
        ancestors: &[&Value],
        vars: &BTreeMap<String, Value>,
    ) -> Result<bool> {
        for clause in clauses {
            if !self.matches(clause, doc, ancestors, vars)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn matches(
        &self,
        clause: &QueryWhere,
        doc: &Value,
        ancestors: &[&Value],
        vars: &BTreeMap<String, Value>,
    ) -> Result<bool> {
        match clause {
            QueryWhere::Constant { value } => Ok(*value),
            QueryWhere::And { filters } => self.matches_all(filters, doc, ancestors, vars),
            QueryWhere::Or { filters } => {
                for nested in filters {
                    if self.matches(nested, doc, ancestors, vars)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            QueryWhere::Exists { subquery } => {
                let scope = with_row(ancestors, doc);
                Ok(!self.run(subquery, &scope, vars)?.is_empty())
            }
            QueryWhere::Filter(statement) => {
                let left = doc
                    .get_path(statement.attribute.segments())
                    .unwrap_or(&NULL);
                let right = resolve(&statement.value, ancestors, vars)?;
                Ok(satisfies(statement.op, left, &right))
            }
        }
    }

    fn order_keys(
        &self,
        order: &[QueryOrder],
        doc: &Value,
        ancestors: &[&Value],
        vars: &BTreeMap<String, Value>,
    ) -> Result<Vec<Value>> {
        let mut keys = Vec::with_capacity(order.len());
        for clause in order {
            let key = match &clause.subquery {
                Some(subquery) => {
                    let scope = with_row(ancestors, doc);
                    self.run(subquery, &scope, vars)?
                        .first()
                        .and_then(|(_, related)| {
                            related.get_path(clause.attribute.segments()).cloned()
                        })
                        .unwrap_or_default()
                }
                None => doc
                    .get_path(clause.attribute.segments())
                    .cloned()
                    .unwrap_or_default(),
            };
            keys.push(key);
        }
        Ok(keys)
    }
}

fn with_row<'v>(ancestors: &[&'v Value], row: &'v Value) -> Vec<&'v Value> {
    let mut scope = ancestors.to_vec();
    scope.push(row);
    scope
}

fn compare_order_keys(order: &[QueryOrder], a: &[Value], b: &[Value]) -> Ordering {
    for (clause, (x, y)) in order.iter().zip(a.iter().zip(b)) {
        let ordering = match clause.direction {
            Direction::Asc => x.compare(y),
            Direction::Desc => y.compare(x),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Resolve a filter value against enclosing rows and variables.
pub fn resolve(
    value: &FilterValue,
    ancestors: &[&Value],
    vars: &BTreeMap<String, Value>,
) -> Result<Value> {
    let name = match value {
        FilterValue::Value(v) => return Ok(v.clone()),
        FilterValue::Variable(name) => name,
    };
    match VariableRef::parse(name) {
        VariableRef::Relational { depth, path } => {
            let row = ancestors
                .len()
                .checked_sub(depth)
                .and_then(|i| ancestors.get(i))
                .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
            Ok(row.get_path(&path).cloned().unwrap_or_default())
        }
        VariableRef::Named { scope, path } => {
            // Named variables may be flat (`view_x`) or scoped (`global.x`).
            if let Some(flat) = vars.get(name.as_str()) {
                return Ok(flat.clone());
            }
            let base = vars
                .get(scope)
                .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
            Ok(base.get_path(&path).cloned().unwrap_or_default())
        }
    }
}

/// Apply a filter operator. Ordering operators only hold between values
/// of the same type.
pub fn satisfies(op: FilterOp, left: &Value, right: &Value) -> bool {
    let same_type = left.rank() == right.rank();
    match op {
        FilterOp::Eq => left.compare(right) == Ordering::Equal,
        FilterOp::Ne => left.compare(right) != Ordering::Equal,
        FilterOp::Lt => same_type && left.compare(right) == Ordering::Less,
        FilterOp::Lte => same_type && left.compare(right) != Ordering::Greater,
        FilterOp::Gt => same_type && left.compare(right) == Ordering::Greater,
        FilterOp::Gte => same_type && left.compare(right) != Ordering::Less,
        FilterOp::In => contains(right, left),
        FilterOp::Nin => !contains(right, left),
    }
}

fn contains(set: &Value, item: &Value) -> bool {
    set.as_array()
        .map(|items| items.iter().any(|v| v.compare(item) == Ordering::Equal))
        .unwrap_or(false)
}
