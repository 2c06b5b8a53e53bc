//! Query tree analysis for incremental view maintenance.
//!
//! Subscriptions use these to decide cheaply whether a change could affect
//! them. Every function treats a query as an immutable tree of nodes keyed
//! by [`QueryHash`], so structurally equal queries share results.

use crate::query::{
    CollectionQuery, FilterValue, QueryHash, QueryWhere, VariableRef, VIEW_VARIABLE_PREFIX,
};
use crate::{CollectionName, Result, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A query tree with every node's structural hash computed once.
///
/// Analyses that key results by node thread these hashes instead of
/// re-hashing subtrees as they go.
#[derive(Debug, Clone)]
pub struct HashedQuery<'a> {
    pub query: &'a CollectionQuery,
    pub hash: QueryHash,
    pub children: Vec<HashedQuery<'a>>,
}

impl<'a> HashedQuery<'a> {
    pub fn new(query: &'a CollectionQuery) -> Result<Self> {
        let children = query
            .subqueries()
            .into_iter()
            .map(HashedQuery::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            query,
            hash: query.hash()?,
            children,
        })
    }

    /// See [`get_referenced_relational_variables`].
    pub fn referenced_relational_variables(&self) -> BTreeMap<QueryHash, BTreeSet<String>> {
        let mut referenced = BTreeMap::new();
        walk_relational(self, &mut Vec::new(), &mut referenced);
        referenced
    }

    /// See [`get_collections_referenced_in_subqueries`].
    pub fn collections_by_node(&self) -> BTreeMap<QueryHash, BTreeSet<CollectionName>> {
        let mut by_node = BTreeMap::new();
        collect_collections(self, &mut by_node);
        by_node
    }
}

/// Per ancestor query, the attributes its descendants read through `$N.attr`
/// variables.
pub fn get_referenced_relational_variables(
    query: &CollectionQuery,
) -> Result<BTreeMap<QueryHash, BTreeSet<String>>> {
    Ok(HashedQuery::new(query)?.referenced_relational_variables())
}

fn walk_relational<'t>(
    node: &'t HashedQuery<'_>,
    ancestors: &mut Vec<&'t QueryHash>,
    referenced: &mut BTreeMap<QueryHash, BTreeSet<String>>,
) {
    for name in node.query.variables() {
        if let VariableRef::Relational { depth, path } = VariableRef::parse(name) {
            let Some(target) = ancestors.len().checked_sub(depth) else {
                continue;
            };
            let attribute = path
                .iter()
                .map(|seg| seg.as_key().into_owned())
                .collect::<Vec<_>>()
                .join(".");
            referenced
                .entry(ancestors[target].clone())
                .or_default()
                .insert(attribute);
        }
    }
    ancestors.push(&node.hash);
    for child in &node.children {
        walk_relational(child, ancestors, referenced);
    }
    ancestors.pop();
}

/// For every node of the tree, the collections it and its subqueries read.
pub fn get_collections_referenced_in_subqueries(
    query: &CollectionQuery,
) -> Result<BTreeMap<QueryHash, BTreeSet<CollectionName>>> {
    Ok(HashedQuery::new(query)?.collections_by_node())
}

fn collect_collections(
    node: &HashedQuery<'_>,
    by_node: &mut BTreeMap<QueryHash, BTreeSet<CollectionName>>,
) -> BTreeSet<CollectionName> {
    let mut collections = BTreeSet::from([node.query.collection_name.clone()]);
    for child in &node.children {
        collections.extend(collect_collections(child, by_node));
    }
    by_node.insert(node.hash.clone(), collections.clone());
    collections
}

/// Whether any node filters through an exists subquery.
pub fn has_subquery_filter_at_any_level(query: &CollectionQuery) -> bool {
    query.filters.iter().any(has_exists)
        || query
            .subqueries()
            .into_iter()
            .any(has_subquery_filter_at_any_level)
}

fn has_exists(clause: &QueryWhere) -> bool {
    match clause {
        QueryWhere::Exists { .. } => true,
        QueryWhere::And { filters } | QueryWhere::Or { filters } => filters.iter().any(has_exists),
        QueryWhere::Filter(_) | QueryWhere::Constant { .. } => false,
    }
}

/// Whether any node orders by a subquery value.
pub fn has_subquery_order_at_any_level(query: &CollectionQuery) -> bool {
    query.order.iter().any(|o| o.subquery.is_some())
        || query
            .subqueries()
            .into_iter()
            .any(has_subquery_order_at_any_level)
}

/// Replace `$view_*` variables throughout the tree with their values from
/// `views`, in place. Array values are bound as sets. Other variables and
/// views missing from `views` are left alone.
pub fn bind_view_references_in_query(
    query: &mut CollectionQuery,
    views: &BTreeMap<String, Value>,
) {
    for clause in &mut query.filters {
        bind_clause(clause, views);
    }
    for relation in query.include.values_mut() {
        bind_view_references_in_query(&mut relation.subquery, views);
    }
    for order in &mut query.order {
        if let Some(subquery) = order.subquery.as_deref_mut() {
            bind_view_references_in_query(subquery, views);
        }
    }
}

/// [`bind_view_references_in_query`] on a copy, leaving `query` untouched.
pub fn with_view_references_bound(
    query: &CollectionQuery,
    views: &BTreeMap<String, Value>,
) -> CollectionQuery {
    let mut bound = query.clone();
    bind_view_references_in_query(&mut bound, views);
    bound
}

fn bind_clause(clause: &mut QueryWhere, views: &BTreeMap<String, Value>) {
    match clause {
        QueryWhere::Filter(statement) => {
            if let Some(bound) = resolve_view(&statement.value, views) {
                statement.value = FilterValue::Value(bound);
            }
        }
        QueryWhere::And { filters } | QueryWhere::Or { filters } => {
            for nested in filters {
                bind_clause(nested, views);
            }
        }
        QueryWhere::Exists { subquery } => bind_view_references_in_query(subquery, views),
        QueryWhere::Constant { .. } => {}
    }
}

fn resolve_view(value: &FilterValue, views: &BTreeMap<String, Value>) -> Option<Value> {
    let name = value.variable_name()?;
    if !name.starts_with(VIEW_VARIABLE_PREFIX) {
        return None;
    }
    let resolved = match views.get(name) {
        Some(flat) => flat.clone(),
        None => match VariableRef::parse(name) {
            VariableRef::Named { scope, path } => views.get(scope)?.get_path(&path)?.clone(),
            VariableRef::Relational { .. } => return None,
        },
    };
    Some(match resolved {
        Value::Array(items) => Value::Array(into_set(items)),
        other => other,
    })
}

fn into_set(mut items: Vec<Value>) -> Vec<Value> {
    items.sort_by(Value::compare);
    items.dedup_by(|a, b| a.compare(b) == std::cmp::Ordering::Equal);
    items
}
