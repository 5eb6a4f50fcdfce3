//! Static declarations of every listable fleet resource.
//!
//! A [`ResourceSchema`] is the allowlist the list engine validates requests against:
//! which columns exist, which public sort keys map to which columns, which page sizes
//! are accepted and how violations are treated. Schemas are `'static` and never
//! mutated; the [`Registry`] is built once at startup and shared behind an `Arc`.

use anyhow::{bail, Result};

/// What to do with a parsed `limit` that is not in the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Use the schema default instead.
    Substitute,
    /// Fail with `InvalidLimit`.
    Reject,
}

/// What to do with a `sortField` that is not in the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPolicy {
    /// Fail with `InvalidSortField` before touching the store.
    Reject,
    /// Sort by the schema default instead.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Base-10 integer, e.g. a foreign key.
    Integer,
    /// One of a fixed set of strings. `wildcard` disables the filter entirely.
    OneOf {
        values: &'static [&'static str],
        wildcard: Option<&'static str>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct FilterSpec {
    /// Query (or path) parameter name.
    pub param: &'static str,
    /// Column on the primary table, qualified with its alias.
    pub column: &'static str,
    pub kind: FilterKind,
}

/// `LEFT JOIN <table> <alias> ON <local> = <foreign>`
#[derive(Debug, Clone, Copy)]
pub struct Join {
    pub table: &'static str,
    pub alias: &'static str,
    pub local: &'static str,
    pub foreign: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct SortField {
    pub key: &'static str,
    pub columns: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// Key in the JSON row.
    pub name: &'static str,
    pub expr: &'static str,
}

#[derive(Debug)]
pub struct ResourceSchema {
    pub resource: Resource,
    /// JSON key that holds the rows in list responses.
    pub array_key: &'static str,
    /// Human label used in not-found messages.
    pub label: &'static str,
    pub table: &'static str,
    pub alias: &'static str,
    pub joins: &'static [Join],
    pub columns: &'static [Column],
    pub sort_fields: &'static [SortField],
    pub default_sort: &'static str,
    pub allowed_limits: &'static [i64],
    pub default_limit: i64,
    pub limit_policy: LimitPolicy,
    pub sort_policy: SortPolicy,
    pub filters: &'static [FilterSpec],
    /// Include `validLimits` in list responses.
    pub advertise_limits: bool,
}

impl ResourceSchema {
    pub fn primary_key(&self) -> String {
        format!("{}.id", self.alias)
    }

    pub fn sort_columns(&self, key: &str) -> Option<&'static [&'static str]> {
        self.sort_fields
            .iter()
            .find(|field| field.key == key)
            .map(|field| field.columns)
    }

    pub fn allows_limit(&self, limit: i64) -> bool {
        self.allowed_limits.contains(&limit)
    }

    /// `SELECT json_build_object(...) AS payload`
    pub fn select_clause(&self) -> String {
        let pairs = self
            .columns
            .iter()
            .map(|column| format!("'{}', {}", column.name, column.expr))
            .collect::<Vec<_>>()
            .join(", ");
        format!("SELECT json_build_object({pairs}) AS payload")
    }

    /// `FROM <table> <alias>` followed by every declared join.
    pub fn from_clause(&self) -> String {
        let mut sql = format!("FROM {} {}", self.table, self.alias);
        for join in self.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} {} ON {} = {}",
                join.table, join.alias, join.local, join.foreign
            ));
        }
        sql
    }

    fn validate(&self) -> Result<()> {
        let identifiers = [self.table, self.alias]
            .into_iter()
            .chain(self.joins.iter().flat_map(|j| [j.table, j.alias, j.local, j.foreign]))
            .chain(self.columns.iter().flat_map(|c| [c.name, c.expr]))
            .chain(self.sort_fields.iter().flat_map(|f| f.columns.iter().copied()))
            .chain(self.filters.iter().map(|f| f.column));
        for ident in identifiers {
            if !is_plain_identifier(ident) {
                bail!("{:?}: '{ident}' is not a plain SQL identifier", self.resource);
            }
        }

        if self.columns.is_empty() {
            bail!("{:?}: no columns declared", self.resource);
        }
        if self.sort_columns(self.default_sort).is_none() {
            bail!(
                "{:?}: default sort '{}' is not a sortable field",
                self.resource,
                self.default_sort
            );
        }
        if self.sort_fields.iter().any(|field| field.columns.is_empty()) {
            bail!("{:?}: sort field without columns", self.resource);
        }
        if self.allowed_limits.iter().any(|limit| *limit <= 0) {
            bail!("{:?}: page sizes must be positive", self.resource);
        }
        if !self.allows_limit(self.default_limit) {
            bail!(
                "{:?}: default limit {} is not in the allowlist",
                self.resource,
                self.default_limit
            );
        }
        Ok(())
    }
}

fn is_plain_identifier(ident: &str) -> bool {
    !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Cars,
    Drivers,
    CarMaintenance,
    CarMaintenanceByCar,
    OilChanges,
    MaintenanceHistory,
    MaintenanceTypes,
    Fueling,
}

impl Resource {
    pub const ALL: [Resource; 8] = [
        Resource::Cars,
        Resource::Drivers,
        Resource::CarMaintenance,
        Resource::CarMaintenanceByCar,
        Resource::OilChanges,
        Resource::MaintenanceHistory,
        Resource::MaintenanceTypes,
        Resource::Fueling,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Immutable lookup from [`Resource`] to its schema.
#[derive(Debug)]
pub struct Registry {
    schemas: Vec<&'static ResourceSchema>,
}

impl Registry {
    pub fn builtin() -> Result<Self> {
        Self::new(vec![
            &CARS,
            &DRIVERS,
            &CAR_MAINTENANCE,
            &CAR_MAINTENANCE_BY_CAR,
            &OIL_CHANGES,
            &MAINTENANCE_HISTORY,
            &MAINTENANCE_TYPES,
            &FUELING,
        ])
    }

    pub fn new(mut schemas: Vec<&'static ResourceSchema>) -> Result<Self> {
        schemas.sort_by_key(|schema| schema.resource.index());
        for (index, expected) in Resource::ALL.iter().enumerate() {
            match schemas.get(index) {
                Some(schema) if schema.resource == *expected => {}
                _ => bail!("missing or duplicate schema for {expected:?}"),
            }
        }
        if schemas.len() != Resource::ALL.len() {
            bail!(
                "expected {} resource schemas, got {}",
                Resource::ALL.len(),
                schemas.len()
            );
        }
        for schema in &schemas {
            schema.validate()?;
        }
        Ok(Self { schemas })
    }

    pub fn get(&self, resource: Resource) -> &'static ResourceSchema {
        self.schemas[resource.index()]
    }
}

const STANDARD_LIMITS: &[i64] = &[10, 20, 50, 100];

const fn car_join(local: &'static str) -> Join {
    Join {
        table: "cars",
        alias: "c",
        local,
        foreign: "c.id",
    }
}

const fn column(name: &'static str, expr: &'static str) -> Column {
    Column { name, expr }
}

const fn sort(key: &'static str, columns: &'static [&'static str]) -> SortField {
    SortField { key, columns }
}

pub const CARS: ResourceSchema = ResourceSchema {
    resource: Resource::Cars,
    array_key: "cars",
    label: "Car",
    table: "cars",
    alias: "c",
    joins: &[Join {
        table: "drivers",
        alias: "d",
        local: "c.driver_id",
        foreign: "d.id",
    }],
    columns: &[
        column("id", "c.id"),
        column("make", "c.make"),
        column("model", "c.model"),
        column("license_plate", "c.license_plate"),
        column("current_kilometers", "c.current_kilometers"),
        column("next_tire_change", "c.next_tire_change"),
        column("is_next_tire_change_bigger", "c.is_next_tire_change_bigger"),
        column("next_oil_change", "c.next_oil_change"),
        column("is_next_oil_change_bigger", "c.is_next_oil_change_bigger"),
        column("driver_id", "c.driver_id"),
        column("driver_name", "d.name"),
        column("status", "c.status"),
    ],
    sort_fields: &[
        sort("id", &["c.id"]),
        sort("make", &["c.make"]),
        sort("model", &["c.model"]),
        sort("license_plate", &["c.license_plate"]),
        sort("current_kilometers", &["c.current_kilometers"]),
        sort("next_tire_change", &["c.next_tire_change"]),
        sort("next_oil_change", &["c.next_oil_change"]),
        sort("driver_name", &["d.name"]),
        sort("status", &["c.status"]),
    ],
    default_sort: "id",
    allowed_limits: STANDARD_LIMITS,
    default_limit: 10,
    limit_policy: LimitPolicy::Substitute,
    sort_policy: SortPolicy::Fallback,
    filters: &[FilterSpec {
        param: "status",
        column: "c.status",
        kind: FilterKind::OneOf {
            values: CAR_STATUSES,
            wildcard: Some("all"),
        },
    }],
    advertise_limits: true,
};

pub const CAR_STATUSES: &[&str] = &["active", "inactive"];

pub const DRIVERS: ResourceSchema = ResourceSchema {
    resource: Resource::Drivers,
    array_key: "drivers",
    label: "Driver",
    table: "drivers",
    alias: "d",
    joins: &[],
    columns: &[
        column("id", "d.id"),
        column("name", "d.name"),
        column("license_number", "d.license_number"),
    ],
    sort_fields: &[
        sort("id", &["d.id"]),
        sort("name", &["d.name"]),
        sort("license_number", &["d.license_number"]),
    ],
    default_sort: "id",
    allowed_limits: STANDARD_LIMITS,
    default_limit: 10,
    limit_policy: LimitPolicy::Substitute,
    sort_policy: SortPolicy::Reject,
    filters: &[],
    advertise_limits: false,
};

const CAR_MAINTENANCE_JOINS: &[Join] = &[
    car_join("cmh.car_id"),
    Join {
        table: "maintenance_types",
        alias: "mt",
        local: "cmh.maintenance_type_id",
        foreign: "mt.id",
    },
];

const CAR_MAINTENANCE_COLUMNS: &[Column] = &[
    column("id", "cmh.id"),
    column("car_id", "cmh.car_id"),
    column("maintenance_type_id", "cmh.maintenance_type_id"),
    column("maintenance_date", "cmh.maintenance_date"),
    column("maintenance_kilometers", "cmh.maintenance_kilometers"),
    column("recurrency", "cmh.recurrency"),
    column("make", "c.make"),
    column("model", "c.model"),
    column("license_plate", "c.license_plate"),
    column("maintenance_type", "mt.name"),
];

const CAR_MAINTENANCE_SORT: &[SortField] = &[
    sort("id", &["cmh.id"]),
    sort("car_id", &["cmh.car_id"]),
    sort("maintenance_type", &["mt.name"]),
    sort("maintenance_type_name", &["mt.name"]),
    sort("maintenance_date", &["cmh.maintenance_date"]),
    sort("maintenance_kilometers", &["cmh.maintenance_kilometers"]),
    sort("recurrency", &["cmh.recurrency"]),
    sort("vehicle", &["c.make", "c.model"]),
];

const CAR_ID_FILTER: &[FilterSpec] = &[FilterSpec {
    param: "car_id",
    column: "cmh.car_id",
    kind: FilterKind::Integer,
}];

pub const CAR_MAINTENANCE: ResourceSchema = ResourceSchema {
    resource: Resource::CarMaintenance,
    array_key: "carMaintenanceHistory",
    label: "Car maintenance entry",
    table: "car_maintenance_history",
    alias: "cmh",
    joins: CAR_MAINTENANCE_JOINS,
    columns: CAR_MAINTENANCE_COLUMNS,
    sort_fields: CAR_MAINTENANCE_SORT,
    default_sort: "id",
    allowed_limits: STANDARD_LIMITS,
    default_limit: 10,
    limit_policy: LimitPolicy::Substitute,
    sort_policy: SortPolicy::Reject,
    filters: CAR_ID_FILTER,
    advertise_limits: true,
};

/// Maintenance history scoped to one car via the path.
pub const CAR_MAINTENANCE_BY_CAR: ResourceSchema = ResourceSchema {
    resource: Resource::CarMaintenanceByCar,
    allowed_limits: &[10, 20, 50, 100, 200, 500],
    limit_policy: LimitPolicy::Reject,
    sort_policy: SortPolicy::Fallback,
    ..CAR_MAINTENANCE
};

pub const OIL_CHANGES: ResourceSchema = ResourceSchema {
    resource: Resource::OilChanges,
    array_key: "oilChangeHistory",
    label: "Oil change",
    table: "oil_change_history",
    alias: "och",
    joins: &[car_join("och.car_id")],
    columns: &[
        column("id", "och.id"),
        column("car_id", "och.car_id"),
        column("oil_change_date", "och.oil_change_date"),
        column("oil_change_kilometers", "och.oil_change_kilometers"),
        column("liters_quantity", "och.liters_quantity"),
        column("price_per_liter", "och.price_per_liter"),
        column("total_cost", "och.total_cost"),
        column("observation", "och.observation"),
        column("make", "c.make"),
        column("model", "c.model"),
        column("license_plate", "c.license_plate"),
    ],
    sort_fields: &[
        sort("id", &["och.id"]),
        sort("car_id", &["och.car_id"]),
        sort("oil_change_date", &["och.oil_change_date"]),
        sort("oil_change_kilometers", &["och.oil_change_kilometers"]),
        sort("liters_quantity", &["och.liters_quantity"]),
        sort("price_per_liter", &["och.price_per_liter"]),
        sort("total_cost", &["och.total_cost"]),
        sort("vehicle", &["c.make", "c.model"]),
    ],
    default_sort: "id",
    allowed_limits: STANDARD_LIMITS,
    default_limit: 10,
    limit_policy: LimitPolicy::Substitute,
    sort_policy: SortPolicy::Reject,
    filters: &[FilterSpec {
        param: "car_id",
        column: "och.car_id",
        kind: FilterKind::Integer,
    }],
    advertise_limits: true,
};

pub const MAINTENANCE_HISTORY: ResourceSchema = ResourceSchema {
    resource: Resource::MaintenanceHistory,
    array_key: "maintenanceHistory",
    label: "Maintenance history entry",
    table: "maintenance_history",
    alias: "mh",
    joins: &[
        car_join("mh.car_id"),
        Join {
            table: "maintenance_types",
            alias: "mt",
            local: "mh.maintenance_type_id",
            foreign: "mt.id",
        },
    ],
    columns: &[
        column("id", "mh.id"),
        column("car_id", "mh.car_id"),
        column("maintenance_type_id", "mh.maintenance_type_id"),
        column("maintenance_date", "mh.maintenance_date"),
        column("maintenance_kilometers", "mh.maintenance_kilometers"),
        column("recurrency", "mh.recurrency"),
        column("observation", "mh.observation"),
        column("make", "c.make"),
        column("model", "c.model"),
        column("license_plate", "c.license_plate"),
        column("maintenance_type", "mt.name"),
    ],
    sort_fields: &[
        sort("id", &["mh.id"]),
        sort("vehicle", &["c.make", "c.model"]),
        sort("maintenance_type", &["mt.name"]),
        sort("maintenance_date", &["mh.maintenance_date"]),
        sort("maintenance_kilometers", &["mh.maintenance_kilometers"]),
        sort("recurrency", &["mh.recurrency"]),
    ],
    default_sort: "id",
    allowed_limits: STANDARD_LIMITS,
    default_limit: 10,
    limit_policy: LimitPolicy::Substitute,
    sort_policy: SortPolicy::Fallback,
    filters: &[FilterSpec {
        param: "car_id",
        column: "mh.car_id",
        kind: FilterKind::Integer,
    }],
    advertise_limits: true,
};

/// Lookup table behind every maintenance form, so one default page holds all of it.
pub const MAINTENANCE_TYPES: ResourceSchema = ResourceSchema {
    resource: Resource::MaintenanceTypes,
    array_key: "maintenanceTypes",
    label: "Maintenance type",
    table: "maintenance_types",
    alias: "mt",
    joins: &[],
    columns: &[
        column("id", "mt.id"),
        column("name", "mt.name"),
        column("recurrency", "mt.recurrency"),
        column("recurrency_date", "mt.recurrency_date"),
    ],
    sort_fields: &[
        sort("id", &["mt.id"]),
        sort("name", &["mt.name"]),
        sort("recurrency", &["mt.recurrency"]),
    ],
    default_sort: "name",
    allowed_limits: STANDARD_LIMITS,
    default_limit: 100,
    limit_policy: LimitPolicy::Substitute,
    sort_policy: SortPolicy::Fallback,
    filters: &[],
    advertise_limits: true,
};

pub const FUELING: ResourceSchema = ResourceSchema {
    resource: Resource::Fueling,
    array_key: "fuelingHistory",
    label: "Fueling",
    table: "fueling",
    alias: "f",
    joins: &[car_join("f.car_id")],
    columns: &[
        column("id", "f.id"),
        column("car_id", "f.car_id"),
        column("fuel_date", "f.fuel_date"),
        column("fueling_kilometers", "f.fueling_kilometers"),
        column("liters_quantity", "f.liters_quantity"),
        column("price_per_liter", "f.price_per_liter"),
        column("total_cost", "f.total_cost"),
        column("fuel_type", "f.fuel_type"),
        column("observation", "f.observation"),
        column("make", "c.make"),
        column("model", "c.model"),
        column("license_plate", "c.license_plate"),
    ],
    sort_fields: &[
        sort("id", &["f.id"]),
        sort("fuel_date", &["f.fuel_date"]),
        sort("fueling_kilometers", &["f.fueling_kilometers"]),
        sort("total_cost", &["f.total_cost"]),
        sort("fuel_type", &["f.fuel_type"]),
        sort("vehicle", &["c.make", "c.model"]),
    ],
    default_sort: "id",
    allowed_limits: STANDARD_LIMITS,
    default_limit: 10,
    limit_policy: LimitPolicy::Substitute,
    sort_policy: SortPolicy::Fallback,
    filters: &[FilterSpec {
        param: "car_id",
        column: "f.car_id",
        kind: FilterKind::Integer,
    }],
    advertise_limits: true,
};
