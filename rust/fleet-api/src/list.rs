//! Paginated, sortable, filterable listings over any [`ResourceSchema`].
//!
//! A list call validates the whole request into a [`ListPlan`] first, then issues
//! two read-only statements: an unsorted `COUNT(*)` over the filtered base table and
//! the joined page itself. Nothing reaches the store when validation fails.

use crate::{
    error::{Result, ServiceError},
    resources::{FilterKind, LimitPolicy, ResourceSchema, SortPolicy},
    store::{BindParam, DataStore, Statement},
};
use serde_json::{json, Map, Value};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};
use tracing::debug;

pub const PAGE_PARAM: &str = "page";
pub const LIMIT_PARAM: &str = "limit";
pub const SORT_FIELD_PARAM: &str = "sortField";
pub const SORT_ORDER_PARAM: &str = "sortOrder";

/// Raw, untrusted listing parameters as they arrive on the query string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRequest {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub sort_field: Option<String>,
    pub sort_order: Option<String>,
    pub filters: BTreeMap<String, String>,
}

impl ListRequest {
    /// Splits query parameters into the paging keys and everything else (filters).
    pub fn from_query(mut params: HashMap<String, String>) -> Self {
        Self {
            page: params.remove(PAGE_PARAM),
            limit: params.remove(LIMIT_PARAM),
            sort_field: params.remove(SORT_FIELD_PARAM),
            sort_order: params.remove(SORT_ORDER_PARAM),
            filters: params.into_iter().collect(),
        }
    }

    pub fn page(mut self, page: impl Into<String>) -> Self {
        self.page = Some(page.into());
        self
    }

    pub fn limit(mut self, limit: impl Into<String>) -> Self {
        self.limit = Some(limit.into());
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: impl Into<String>) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = Some(order.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Case-insensitive `asc`/`desc`; anything else is ascending.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("desc") => SortDirection::Desc,
            _ => SortDirection::Asc,
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFilter {
    pub column: &'static str,
    pub value: BindParam,
}

/// A fully validated listing: every identifier comes from the schema allowlist and
/// every user value is a bind.
#[derive(Debug, Clone)]
pub struct ListPlan {
    pub schema: &'static ResourceSchema,
    pub page: i64,
    pub limit: i64,
    pub sort_field: &'static str,
    pub sort_columns: &'static [&'static str],
    pub direction: SortDirection,
    pub filters: Vec<ResolvedFilter>,
}

impl ListPlan {
    pub fn build(schema: &'static ResourceSchema, request: &ListRequest) -> Result<Self> {
        let page = parse_page(request.page.as_deref());
        let limit = resolve_limit(schema, request.limit.as_deref())?;
        let (sort_field, sort_columns) = resolve_sort(schema, request.sort_field.as_deref())?;
        let direction = SortDirection::parse(request.sort_order.as_deref());
        let filters = resolve_filters(schema, &request.filters)?;

        Ok(Self {
            schema,
            page,
            limit,
            sort_field,
            sort_columns,
            direction,
            filters,
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    /// `COUNT(*)` over the filtered base table; no joins, no ordering.
    pub fn count_statement(&self) -> Statement {
        let mut sql = format!(
            "SELECT COUNT(*) AS total FROM {} {}",
            self.schema.table, self.schema.alias
        );
        sql.push_str(&self.where_clause());
        Statement::new(&sql, self.filter_binds())
    }

    /// The joined page. `LIMIT`/`OFFSET` are always the final two binds.
    pub fn page_statement(&self) -> Statement {
        let mut sql = format!(
            "{} {}",
            self.schema.select_clause(),
            self.schema.from_clause()
        );
        sql.push_str(&self.where_clause());
        sql.push_str(&self.order_clause());
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut params = self.filter_binds();
        params.push(BindParam::Int(self.limit));
        params.push(BindParam::Int(self.offset()));
        Statement::new(&sql, params)
    }

    fn where_clause(&self) -> String {
        if self.filters.is_empty() {
            return String::new();
        }
        let predicates = self
            .filters
            .iter()
            .map(|filter| format!("{} = ?", filter.column))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(" WHERE {predicates}")
    }

    fn order_clause(&self) -> String {
        let primary_key = self.schema.primary_key();
        let mut terms: Vec<String> = self
            .sort_columns
            .iter()
            .filter(|column| **column != primary_key)
            .map(|column| format!("{column} {}", self.direction))
            .collect();
        terms.push(format!("{primary_key} {}", self.direction));
        format!(" ORDER BY {}", terms.join(", "))
    }

    fn filter_binds(&self) -> Vec<BindParam> {
        self.filters.iter().map(|filter| filter.value.clone()).collect()
    }
}

fn parse_page(raw: Option<&str>) -> i64 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|page| *page > 0)
        .unwrap_or(1)
}

fn resolve_limit(schema: &ResourceSchema, raw: Option<&str>) -> Result<i64> {
    let Some(limit) = raw.and_then(|value| value.trim().parse::<i64>().ok()) else {
        return Ok(schema.default_limit);
    };

    if schema.allows_limit(limit) {
        return Ok(limit);
    }

    match schema.limit_policy {
        LimitPolicy::Substitute => Ok(schema.default_limit),
        LimitPolicy::Reject => Err(ServiceError::InvalidLimit(limit)),
    }
}

fn resolve_sort(
    schema: &'static ResourceSchema,
    raw: Option<&str>,
) -> Result<(&'static str, &'static [&'static str])> {
    let requested = raw.map(str::trim).filter(|value| !value.is_empty());

    if let Some(field) = requested.and_then(|key| {
        schema
            .sort_fields
            .iter()
            .find(|candidate| candidate.key == key)
    }) {
        return Ok((field.key, field.columns));
    }

    if let Some(key) = requested {
        if schema.sort_policy == SortPolicy::Reject {
            return Err(ServiceError::InvalidSortField(key.to_string()));
        }
    }

    let columns = schema.sort_columns(schema.default_sort).ok_or_else(|| {
        ServiceError::Config(format!(
            "default sort '{}' missing for {:?}",
            schema.default_sort, schema.resource
        ))
    })?;
    Ok((schema.default_sort, columns))
}

fn resolve_filters(
    schema: &ResourceSchema,
    raw: &BTreeMap<String, String>,
) -> Result<Vec<ResolvedFilter>> {
    let mut resolved = Vec::new();

    // Declaration order keeps bind positions stable across requests.
    for spec in schema.filters {
        let Some(value) = raw.get(spec.param) else {
            continue;
        };
        let value = value.trim();
        let invalid = || ServiceError::InvalidFilter {
            field: spec.param.to_string(),
            value: value.to_string(),
        };

        let bind = match spec.kind {
            // Key columns are INTEGER; anything wider could never match.
            FilterKind::Integer => {
                BindParam::Int(i64::from(value.parse::<i32>().map_err(|_| invalid())?))
            }
            FilterKind::OneOf { values, wildcard } => {
                if wildcard.is_some_and(|wildcard| wildcard.eq_ignore_ascii_case(value)) {
                    continue;
                }
                let matched = values
                    .iter()
                    .find(|candidate| candidate.eq_ignore_ascii_case(value))
                    .ok_or_else(invalid)?;
                BindParam::Text((*matched).to_string())
            }
        };

        resolved.push(ResolvedFilter {
            column: spec.column,
            value: bind,
        });
    }

    Ok(resolved)
}

/// `ceil(total / limit)`; an empty set has zero pages.
pub fn total_pages(total: i64, limit: i64) -> i64 {
    if limit <= 0 || total <= 0 {
        return 0;
    }
    (total + limit - 1) / limit
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListResult {
    pub rows: Vec<Value>,
    pub total: i64,
    pub total_pages: i64,
    pub current_page: i64,
    /// Effective page size after validation.
    pub limit: i64,
}

impl ListResult {
    /// Response body: `{ <arrayKey>: [...], totalPages, currentPage, total, limit, validLimits? }`.
    pub fn into_body(self, schema: &ResourceSchema) -> Value {
        let mut body = Map::new();
        body.insert(schema.array_key.to_string(), Value::Array(self.rows));
        body.insert("totalPages".into(), json!(self.total_pages));
        body.insert("currentPage".into(), json!(self.current_page));
        body.insert("total".into(), json!(self.total));
        body.insert("limit".into(), json!(self.limit));
        if schema.advertise_limits {
            body.insert("validLimits".into(), json!(schema.allowed_limits));
        }
        Value::Object(body)
    }
}

#[derive(Clone)]
pub struct ListQueryEngine {
    store: Arc<dyn DataStore>,
}

impl ListQueryEngine {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn execute_list(
        &self,
        schema: &'static ResourceSchema,
        request: &ListRequest,
    ) -> Result<ListResult> {
        let plan = ListPlan::build(schema, request)?;

        let total = self.store.count(&plan.count_statement()).await?;
        let rows = self.store.rows(&plan.page_statement()).await?;

        debug!(
            resource = ?schema.resource,
            page = plan.page,
            limit = plan.limit,
            sort = plan.sort_field,
            direction = %plan.direction,
            total,
            returned = rows.len(),
            "list query complete"
        );

        Ok(ListResult {
            rows,
            total,
            total_pages: total_pages(total, plan.limit),
            current_page: plan.page,
            limit: plan.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resources::{CARS, CAR_MAINTENANCE, CAR_MAINTENANCE_BY_CAR, DRIVERS, OIL_CHANGES},
        testing::MemoryStore,
    };
    use pretty_assertions::assert_eq;

    fn drivers(count: i64) -> Vec<Value> {
        (1..=count)
            .map(|id| json!({ "id": id, "name": format!("driver-{id:02}"), "license_number": format!("L{id}") }))
            .collect()
    }

    fn engine(store: &Arc<MemoryStore>) -> ListQueryEngine {
        ListQueryEngine::new(store.clone())
    }

    #[test]
    fn defaults_apply_when_params_are_absent() {
        let plan = ListPlan::build(&DRIVERS, &ListRequest::default()).unwrap();
        assert_eq!(plan.page, 1);
        assert_eq!(plan.limit, 10);
        assert_eq!(plan.sort_field, "id");
        assert_eq!(plan.direction, SortDirection::Asc);
        assert_eq!(plan.offset(), 0);
    }

    #[test]
    fn non_positive_or_garbage_page_coerces_to_one() {
        for raw in ["0", "-3", "abc", "", "  "] {
            let plan = ListPlan::build(&DRIVERS, &ListRequest::default().page(raw)).unwrap();
            assert_eq!(plan.page, 1, "page {raw:?}");
        }
        let plan = ListPlan::build(&DRIVERS, &ListRequest::default().page("4")).unwrap();
        assert_eq!(plan.page, 4);
        assert_eq!(plan.offset(), 30);
    }

    #[test]
    fn disallowed_limit_is_substituted_for_resource_wide_listings() {
        let plan = ListPlan::build(&CAR_MAINTENANCE, &ListRequest::default().limit("7")).unwrap();
        assert_eq!(plan.limit, 10);
    }

    #[test]
    fn disallowed_limit_is_rejected_for_scoped_listings() {
        let request = ListRequest::default().limit("7").filter("car_id", "42");
        let err = ListPlan::build(&CAR_MAINTENANCE_BY_CAR, &request).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidLimit(7)), "{err:?}");

        let request = ListRequest::default().limit("500").filter("car_id", "42");
        let plan = ListPlan::build(&CAR_MAINTENANCE_BY_CAR, &request).unwrap();
        assert_eq!(plan.limit, 500);
    }

    #[test]
    fn unparsable_limit_uses_default_even_when_strict() {
        let request = ListRequest::default().limit("lots").filter("car_id", "42");
        let plan = ListPlan::build(&CAR_MAINTENANCE_BY_CAR, &request).unwrap();
        assert_eq!(plan.limit, 10);
    }

    #[test]
    fn unknown_sort_field_is_rejected_or_falls_back_per_schema() {
        let request = ListRequest::default().sort("hack", "asc");
        let err = ListPlan::build(&DRIVERS, &request).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidSortField(ref f) if f == "hack"));

        let plan = ListPlan::build(&CARS, &request).unwrap();
        assert_eq!(plan.sort_field, "id");
        assert_eq!(plan.sort_columns, &["c.id"]);
    }

    #[test]
    fn sort_order_is_case_insensitive_and_defaults_to_asc() {
        assert_eq!(SortDirection::parse(Some("DESC")), SortDirection::Desc);
        assert_eq!(SortDirection::parse(Some(" desc ")), SortDirection::Desc);
        assert_eq!(SortDirection::parse(Some("Asc")), SortDirection::Asc);
        assert_eq!(SortDirection::parse(Some("sideways")), SortDirection::Asc);
        assert_eq!(SortDirection::parse(None), SortDirection::Asc);
    }

    #[test]
    fn non_numeric_foreign_key_filter_is_invalid() {
        let request = ListRequest::default().filter("car_id", "42abc");
        let err = ListPlan::build(&OIL_CHANGES, &request).unwrap_err();
        assert!(
            matches!(err, ServiceError::InvalidFilter { ref field, ref value } if field == "car_id" && value == "42abc"),
            "{err:?}"
        );
    }

    #[test]
    fn foreign_key_filter_outside_integer_range_is_invalid() {
        let request = ListRequest::default().filter("car_id", "99999999999");
        let err = ListPlan::build(&CAR_MAINTENANCE, &request).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidFilter { .. }), "{err:?}");

        let request = ListRequest::default().filter("car_id", "2147483647");
        assert!(ListPlan::build(&CAR_MAINTENANCE, &request).is_ok());
    }

    #[test]
    fn status_filter_accepts_known_values_and_wildcard() {
        let plan = ListPlan::build(&CARS, &ListRequest::default().filter("status", "Active")).unwrap();
        assert_eq!(
            plan.filters,
            vec![ResolvedFilter {
                column: "c.status",
                value: BindParam::Text("active".into())
            }]
        );

        let plan = ListPlan::build(&CARS, &ListRequest::default().filter("status", "all")).unwrap();
        assert!(plan.filters.is_empty());

        let err = ListPlan::build(&CARS, &ListRequest::default().filter("status", "scrapped"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidFilter { .. }));
    }

    #[test]
    fn undeclared_filters_are_ignored() {
        let request = ListRequest::default().filter("make", "Fiat");
        let plan = ListPlan::build(&DRIVERS, &request).unwrap();
        assert!(plan.filters.is_empty());
    }

    #[test]
    fn page_statement_appends_primary_key_tie_breaker() {
        let request = ListRequest::default()
            .sort("vehicle", "desc")
            .page("3")
            .limit("20");
        let plan = ListPlan::build(&CAR_MAINTENANCE, &request).unwrap();
        let statement = plan.page_statement();

        assert!(
            statement
                .sql
                .ends_with("ORDER BY c.make DESC, c.model DESC, cmh.id DESC LIMIT $1 OFFSET $2"),
            "{}",
            statement.sql
        );
        assert!(statement.sql.contains("LEFT JOIN cars c ON cmh.car_id = c.id"));
        assert_eq!(statement.params, vec![BindParam::Int(20), BindParam::Int(40)]);
    }

    #[test]
    fn sorting_by_primary_key_does_not_repeat_it() {
        let plan = ListPlan::build(&DRIVERS, &ListRequest::default().sort("id", "desc")).unwrap();
        assert!(plan.page_statement().sql.contains("ORDER BY d.id DESC LIMIT"));
    }

    #[test]
    fn count_statement_is_filtered_but_unjoined_and_unsorted() {
        let request = ListRequest::default()
            .filter("car_id", "42")
            .sort("vehicle", "asc");
        let plan = ListPlan::build(&CAR_MAINTENANCE_BY_CAR, &request).unwrap();
        let count = plan.count_statement();

        assert_eq!(
            count.sql,
            "SELECT COUNT(*) AS total FROM car_maintenance_history cmh WHERE cmh.car_id = $1"
        );
        assert_eq!(count.params, vec![BindParam::Int(42)]);

        let page = plan.page_statement();
        assert!(page.sql.contains("WHERE cmh.car_id = $1"));
        assert_eq!(
            page.params,
            vec![BindParam::Int(42), BindParam::Int(10), BindParam::Int(0)]
        );
    }

    #[test]
    fn user_values_never_appear_in_sql_text() {
        let request = ListRequest::default()
            .filter("status", "inactive")
            .sort("make", "desc; DROP TABLE cars")
            .limit("20");
        let plan = ListPlan::build(&CARS, &request).unwrap();
        for statement in [plan.count_statement(), plan.page_statement()] {
            assert!(!statement.sql.contains("inactive"), "{}", statement.sql);
            assert!(!statement.sql.contains("DROP"), "{}", statement.sql);
        }
    }

    #[test]
    fn total_pages_rounds_up_and_is_zero_for_empty_sets() {
        assert_eq!(total_pages(25, 10), 3);
        assert_eq!(total_pages(20, 10), 2);
        assert_eq!(total_pages(1, 100), 1);
        assert_eq!(total_pages(0, 10), 0);
    }

    #[tokio::test]
    async fn twenty_five_rows_split_into_ten_ten_five() {
        let store = Arc::new(MemoryStore::new(drivers(25)));
        let engine = engine(&store);

        let mut sizes = Vec::new();
        for page in 1..=3 {
            let result = engine
                .execute_list(&DRIVERS, &ListRequest::default().page(page.to_string()))
                .await
                .unwrap();
            assert_eq!(result.total, 25);
            assert_eq!(result.total_pages, 3);
            assert_eq!(result.current_page, page);
            sizes.push(result.rows.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn walking_every_page_yields_each_row_once() {
        let rows = drivers(47);
        let store = Arc::new(MemoryStore::new(rows.clone()));
        let engine = engine(&store);

        for limit in [10_i64, 20, 50, 100] {
            let first = engine
                .execute_list(&DRIVERS, &ListRequest::default().limit(limit.to_string()))
                .await
                .unwrap();
            let mut seen = first.rows.clone();
            for page in 2..=first.total_pages {
                let request = ListRequest::default()
                    .limit(limit.to_string())
                    .page(page.to_string());
                let result = engine.execute_list(&DRIVERS, &request).await.unwrap();
                assert!(result.rows.len() as i64 <= limit);
                let expected = limit.min((result.total - (page - 1) * limit).max(0));
                assert_eq!(result.rows.len() as i64, expected);
                seen.extend(result.rows);
            }
            assert_eq!(seen, rows, "limit {limit}");
        }
    }

    #[tokio::test]
    async fn page_past_the_end_is_empty_without_clamping() {
        let store = Arc::new(MemoryStore::new(drivers(25)));
        let result = engine(&store)
            .execute_list(&DRIVERS, &ListRequest::default().page("9"))
            .await
            .unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.total_pages, 3);
        assert_eq!(result.current_page, 9);
    }

    #[tokio::test]
    async fn substituted_limit_is_reported_back() {
        let store = Arc::new(MemoryStore::new(drivers(25)));
        let result = engine(&store)
            .execute_list(&CARS, &ListRequest::default().limit("7"))
            .await
            .unwrap();
        assert_eq!(result.limit, 10);
        assert_eq!(result.rows.len(), 10);
    }

    #[tokio::test]
    async fn empty_filtered_set_has_zero_pages() {
        let rows = vec![json!({ "id": 1, "car_id": 7 }), json!({ "id": 2, "car_id": 7 })];
        let store = Arc::new(MemoryStore::new(rows).with_filter_fields(["car_id"]));
        let request = ListRequest::default().filter("car_id", "42");
        let result = engine(&store)
            .execute_list(&CAR_MAINTENANCE_BY_CAR, &request)
            .await
            .unwrap();

        assert_eq!(
            result,
            ListResult {
                rows: vec![],
                total: 0,
                total_pages: 0,
                current_page: 1,
                limit: 10,
            }
        );
    }

    #[tokio::test]
    async fn rejected_sort_field_never_reaches_the_store() {
        let store = Arc::new(MemoryStore::new(drivers(5)));
        let request = ListRequest::default().sort("password", "asc");
        let err = engine(&store)
            .execute_list(&DRIVERS, &request)
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::InvalidSortField(_)));
        assert!(store.statements().is_empty());
    }

    #[tokio::test]
    async fn store_failure_propagates_without_partial_results() {
        let store = Arc::new(MemoryStore::new(drivers(5)).failing("connection reset"));
        let err = engine(&store)
            .execute_list(&DRIVERS, &ListRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::StoreUnavailable(_)));
        assert!(format!("{:#}", anyhow::Error::from(err)).contains("connection reset"));
        assert_eq!(store.statements().len(), 1, "page query must not run after a failed count");
    }

    #[test]
    fn body_uses_resource_array_key_and_advertises_limits() {
        let result = ListResult {
            rows: vec![json!({ "id": 1 })],
            total: 1,
            total_pages: 1,
            current_page: 1,
            limit: 10,
        };
        let body = result.clone().into_body(&CAR_MAINTENANCE);
        assert_eq!(
            body,
            json!({
                "carMaintenanceHistory": [{ "id": 1 }],
                "totalPages": 1,
                "currentPage": 1,
                "total": 1,
                "limit": 10,
                "validLimits": [10, 20, 50, 100],
            })
        );

        let body = result.into_body(&DRIVERS);
        assert!(body.get("validLimits").is_none());
        assert!(body.get("drivers").is_some());
    }

    #[test]
    fn from_query_splits_paging_keys_from_filters() {
        let params: HashMap<String, String> = [
            ("page", "2"),
            ("limit", "20"),
            ("sortField", "make"),
            ("sortOrder", "desc"),
            ("status", "active"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let request = ListRequest::from_query(params);
        assert_eq!(
            request,
            ListRequest::default()
                .page("2")
                .limit("20")
                .sort("make", "desc")
                .filter("status", "active")
        );
    }
}
