use sqlx::{Any, QueryBuilder};

use crate::error::{ErrorKind, FleetResult};
use crate::fleet_error;
use crate::resource::{GroupResource, ResourceType};
use crate::storage::{validate_json_key, Backend};

/// Columns a list may be ordered by. Anything else is rejected rather than spliced
/// into SQL.
pub const ORDER_BY_COLUMNS: &[&str] = &[
    "cluster",
    "namespace",
    "name",
    "created_at",
    "synced_at",
    "resource_version",
];

/// How a selector requirement compares the extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One label or field requirement.
///
/// For label requirements `key` is the label key; for field requirements it is a
/// dotted path into the object document (e.g. `status.phase`).
#[derive(Debug, Clone)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn equals(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::Equals,
            values: vec![value.to_string()],
        }
    }

    pub fn not_equals(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::NotEquals,
            values: vec![value.to_string()],
        }
    }

    pub fn r#in(key: &str, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::In,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn exists(key: &str) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::Exists,
            values: Vec::new(),
        }
    }

    pub fn does_not_exist(key: &str) -> Self {
        Self {
            key: key.to_string(),
            operator: Operator::DoesNotExist,
            values: Vec::new(),
        }
    }
}

/// One ordering term.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub desc: bool,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            desc: false,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            desc: true,
        }
    }
}

/// Cross-cluster list options compiled into SQL by this module.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Clusters to search. Empty means all clusters.
    pub cluster_names: Vec<String>,
    pub namespaces: Vec<String>,
    pub names: Vec<String>,
    pub label_selector: Vec<Requirement>,
    pub field_selector: Vec<Requirement>,
    /// Case-insensitive substring match against the object name.
    pub fuzzy_name: Option<String>,
    /// Match objects owned (transitively, see `owner_seniority`) by this UID.
    pub owner_uid: Option<String>,
    /// Match objects owned by the object of this name.
    pub owner_name: Option<String>,
    /// Narrows the owner-by-name lookup to a group/resource.
    pub owner_group_resource: Option<GroupResource>,
    /// How many extra hops to walk down the owner chain. Zero selects direct children.
    pub owner_seniority: u32,
    pub order_by: Vec<OrderBy>,
    /// Page size. Zero or negative disables paging.
    pub limit: i64,
    /// Continuation token from a previous page; malformed tokens mean offset zero.
    pub continue_token: Option<String>,
    /// Whether a continuation token should be emitted when the page is full.
    pub with_continue: bool,
    /// Whether to run the side count query and report the remaining item count.
    pub with_remaining_count: bool,
    /// Project only the metadata document instead of the full object.
    pub only_metadata: bool,
    /// Attach the row's decoded events to each returned object.
    pub inject_events: bool,
}

/// Appends the WHERE clause for `opts` scoped to one storage resource type.
pub(crate) fn push_filters(
    qb: &mut QueryBuilder<'_, Any>,
    backend: Backend,
    resource_type: &ResourceType,
    opts: &ListOptions,
) -> FleetResult<()> {
    qb.push(" WHERE ");
    qb.push(backend.quote_ident("group"));
    qb.push(" = ");
    qb.push_bind(resource_type.group.clone());
    qb.push(" AND version = ");
    qb.push_bind(resource_type.version.clone());
    qb.push(" AND resource = ");
    qb.push_bind(resource_type.resource.clone());

    push_in_clause(qb, "cluster", &opts.cluster_names);
    push_in_clause(qb, "namespace", &opts.namespaces);
    push_in_clause(qb, "name", &opts.names);

    if let Some(fuzzy) = opts.fuzzy_name.as_deref().filter(|f| !f.is_empty()) {
        push_fuzzy_name(qb, backend, fuzzy);
    }

    push_owner(qb, backend, opts);

    for requirement in &opts.label_selector {
        validate_json_key(&requirement.key)?;
        let segments = ["metadata", "labels", requirement.key.as_str()];
        push_requirement(qb, backend, &segments, requirement)?;
    }
    for requirement in &opts.field_selector {
        let segments: Vec<&str> = requirement.key.split('.').collect();
        for segment in &segments {
            validate_json_key(segment)?;
        }
        push_requirement(qb, backend, &segments, requirement)?;
    }

    Ok(())
}

/// Appends ORDER BY / LIMIT / OFFSET and returns the offset the page starts at.
pub(crate) fn push_order_and_paging(
    qb: &mut QueryBuilder<'_, Any>,
    opts: &ListOptions,
) -> FleetResult<i64> {
    let offset = parse_continue(opts.continue_token.as_deref());

    if !opts.order_by.is_empty() || opts.limit > 0 {
        qb.push(" ORDER BY ");
        for order in &opts.order_by {
            if !ORDER_BY_COLUMNS.contains(&order.field.as_str()) {
                return Err(fleet_error!(
                    ErrorKind::ValidationError,
                    "order by column is not allowed",
                    order.field
                ));
            }
            qb.push(order.field.as_str());
            if order.desc {
                qb.push(" DESC");
            }
            qb.push(", ");
        }
        // Rows sharing the requested sort keys still page deterministically.
        qb.push("id");
    }

    if opts.limit > 0 {
        qb.push(" LIMIT ");
        qb.push_bind(opts.limit);
        if offset > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(offset);
        }
    }

    Ok(offset)
}

/// Parses a continuation token. Tokens are decimal offsets; anything else means
/// starting over from offset zero.
pub(crate) fn parse_continue(token: Option<&str>) -> i64 {
    token
        .and_then(|t| t.parse::<i64>().ok())
        .filter(|offset| *offset >= 0)
        .unwrap_or(0)
}

fn push_in_clause(qb: &mut QueryBuilder<'_, Any>, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    {
        let mut separated = qb.separated(", ");
        for value in values {
            separated.push_bind(value.clone());
        }
    }
    qb.push(")");
}

fn push_fuzzy_name(qb: &mut QueryBuilder<'_, Any>, backend: Backend, fuzzy: &str) {
    match backend {
        Backend::Mysql => {
            qb.push(" AND name LIKE CONCAT('%', ");
            qb.push_bind(fuzzy.to_string());
            qb.push(", '%')");
        }
        Backend::Sqlite => {
            qb.push(" AND name LIKE '%' || ");
            qb.push_bind(fuzzy.to_string());
            qb.push(" || '%'");
        }
        Backend::Postgres => {
            qb.push(" AND name ILIKE '%' || ");
            qb.push_bind(fuzzy.to_string());
            qb.push(" || '%'");
        }
    }
}

fn push_requirement(
    qb: &mut QueryBuilder<'_, Any>,
    backend: Backend,
    segments: &[&str],
    requirement: &Requirement,
) -> FleetResult<()> {
    let expr = backend.json_field_expr("object", segments);

    match requirement.operator {
        Operator::Equals => {
            let value = single_value(requirement)?;
            qb.push(format!(" AND {expr} = "));
            qb.push_bind(value);
        }
        Operator::NotEquals => {
            // Objects without the key at all also satisfy a != requirement.
            let value = single_value(requirement)?;
            qb.push(format!(" AND ({expr} IS NULL OR {expr} <> "));
            qb.push_bind(value);
            qb.push(")");
        }
        Operator::In => {
            require_values(requirement)?;
            qb.push(format!(" AND {expr} IN ("));
            {
                let mut separated = qb.separated(", ");
                for value in &requirement.values {
                    separated.push_bind(value.clone());
                }
            }
            qb.push(")");
        }
        Operator::NotIn => {
            require_values(requirement)?;
            qb.push(format!(" AND ({expr} IS NULL OR {expr} NOT IN ("));
            {
                let mut separated = qb.separated(", ");
                for value in &requirement.values {
                    separated.push_bind(value.clone());
                }
            }
            qb.push("))");
        }
        Operator::Exists => {
            qb.push(format!(" AND {expr} IS NOT NULL"));
        }
        Operator::DoesNotExist => {
            qb.push(format!(" AND {expr} IS NULL"));
        }
    }

    Ok(())
}

fn single_value(requirement: &Requirement) -> FleetResult<String> {
    match requirement.values.as_slice() {
        [value] => Ok(value.clone()),
        _ => Err(fleet_error!(
            ErrorKind::ValidationError,
            "selector operator requires exactly one value",
            requirement.key
        )),
    }
}

fn require_values(requirement: &Requirement) -> FleetResult<()> {
    if requirement.values.is_empty() {
        return Err(fleet_error!(
            ErrorKind::ValidationError,
            "selector operator requires at least one value",
            requirement.key
        ));
    }
    Ok(())
}

/// Appends the owner-chain predicate.
///
/// Owner UIDs only mean anything inside a single cluster, so the owner options are
/// ignored unless exactly one cluster is selected.
fn push_owner(qb: &mut QueryBuilder<'_, Any>, backend: Backend, opts: &ListOptions) {
    if opts.cluster_names.len() != 1 {
        return;
    }
    let cluster = opts.cluster_names[0].clone();

    if let Some(uid) = opts.owner_uid.as_deref().filter(|u| !u.is_empty()) {
        if opts.owner_seniority == 0 {
            qb.push(" AND owner_uid = ");
            qb.push_bind(uid.to_string());
            return;
        }

        // Each seniority level resolves the UIDs one generation further down.
        qb.push(" AND owner_uid IN ");
        for level in 0..opts.owner_seniority {
            qb.push("(SELECT uid FROM resources WHERE cluster = ");
            qb.push_bind(cluster.clone());
            qb.push(" AND owner_uid ");
            if level + 1 == opts.owner_seniority {
                qb.push("= ");
                qb.push_bind(uid.to_string());
            } else {
                qb.push("IN ");
            }
        }
        for _ in 0..opts.owner_seniority {
            qb.push(")");
        }
        return;
    }

    if let Some(owner_name) = opts.owner_name.as_deref().filter(|n| !n.is_empty()) {
        qb.push(" AND owner_uid IN ");
        for _ in 0..opts.owner_seniority {
            qb.push("(SELECT uid FROM resources WHERE cluster = ");
            qb.push_bind(cluster.clone());
            qb.push(" AND owner_uid IN ");
        }

        qb.push("(SELECT uid FROM resources WHERE cluster = ");
        qb.push_bind(cluster.clone());
        if let Some(group_resource) = &opts.owner_group_resource {
            qb.push(format!(" AND {} = ", backend.quote_ident("group")));
            qb.push_bind(group_resource.group.clone());
            qb.push(" AND resource = ");
            qb.push_bind(group_resource.resource.clone());
        }
        if !opts.namespaces.is_empty() {
            // The owner may live in one of the queried namespaces or at cluster scope.
            qb.push(" AND namespace IN (");
            {
                let mut separated = qb.separated(", ");
                for namespace in &opts.namespaces {
                    separated.push_bind(namespace.clone());
                }
                separated.push_bind(String::new());
            }
            qb.push(")");
        }
        qb.push(" AND name = ");
        qb.push_bind(owner_name.to_string());
        qb.push(")");

        for _ in 0..opts.owner_seniority {
            qb.push(")");
        }
    }
}
