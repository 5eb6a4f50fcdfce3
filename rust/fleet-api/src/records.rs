//! Single-entity reads and the write operations behind the fleet forms.
//!
//! Every write body implements [`RecordInput`]: it names its table through a
//! [`ResourceSchema`], lists its columns in bind order and validates itself. The
//! service turns that into one `INSERT`, `UPDATE` or `DELETE` statement.

use crate::{
    error::{Result, ServiceError},
    resources::{
        ResourceSchema, CARS, CAR_MAINTENANCE, CAR_STATUSES, DRIVERS, FUELING,
        MAINTENANCE_HISTORY,
    },
    store::{BindParam, DataStore, Statement},
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

const DATE: &str = "CAST(? AS date)";

/// A request body that maps one-to-one onto a row of `SCHEMA.table`.
pub trait RecordInput: Send + Sync {
    const SCHEMA: &'static ResourceSchema;
    /// `(column, placeholder)` pairs in bind order. A placeholder may carry a cast.
    const FIELDS: &'static [(&'static str, &'static str)];

    fn validate(&self) -> Result<()>;

    fn binds(&self) -> Vec<BindParam>;
}

fn invalid(message: String) -> ServiceError {
    ServiceError::InvalidRequest(message)
}

fn check_date(field: &str, value: &str) -> Result<()> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| invalid(format!("{field} '{value}' is not a YYYY-MM-DD date")))
}

/// Integer columns are `INTEGER`, so values must also fit in an `i32`.
fn check_int(field: &str, value: i64, min: i64) -> Result<()> {
    let max = i64::from(i32::MAX);
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{field} must be between {min} and {max}")))
    }
}

fn check_optional_int(field: &str, value: Option<i64>, min: i64) -> Result<()> {
    value.map_or(Ok(()), |value| check_int(field, value, min))
}

fn check_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{field} is required")));
    }
    Ok(())
}

fn check_amount(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{field} must be a non-negative number")))
    }
}

fn optional_text(value: &Option<String>) -> BindParam {
    BindParam::OptionalText(
        value
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string),
    )
}

/// Request body for creating or replacing a car maintenance entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CarMaintenanceInput {
    pub car_id: i64,
    pub maintenance_type_id: i64,
    pub maintenance_date: String,
    pub maintenance_kilometers: i64,
    #[serde(default)]
    pub recurrency: Option<i64>,
}

impl RecordInput for CarMaintenanceInput {
    const SCHEMA: &'static ResourceSchema = &CAR_MAINTENANCE;
    const FIELDS: &'static [(&'static str, &'static str)] = &[
        ("car_id", "?"),
        ("maintenance_type_id", "?"),
        ("maintenance_date", DATE),
        ("maintenance_kilometers", "?"),
        ("recurrency", "?"),
    ];

    fn validate(&self) -> Result<()> {
        check_int("car_id", self.car_id, 1)?;
        check_int("maintenance_type_id", self.maintenance_type_id, 1)?;
        check_date("maintenance_date", &self.maintenance_date)?;
        check_int("maintenance_kilometers", self.maintenance_kilometers, 0)?;
        check_optional_int("recurrency", self.recurrency, 1)
    }

    fn binds(&self) -> Vec<BindParam> {
        vec![
            BindParam::Int(self.car_id),
            BindParam::Int(self.maintenance_type_id),
            BindParam::Text(self.maintenance_date.clone()),
            BindParam::Int(self.maintenance_kilometers),
            BindParam::OptionalInt(self.recurrency),
        ]
    }
}

/// Maintenance history entries; the forms send `recurrency: 0` for "none".
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceHistoryInput {
    pub car_id: i64,
    pub maintenance_type_id: i64,
    pub maintenance_date: String,
    pub maintenance_kilometers: i64,
    #[serde(default)]
    pub recurrency: Option<i64>,
    #[serde(default)]
    pub observation: Option<String>,
}

impl RecordInput for MaintenanceHistoryInput {
    const SCHEMA: &'static ResourceSchema = &MAINTENANCE_HISTORY;
    const FIELDS: &'static [(&'static str, &'static str)] = &[
        ("car_id", "?"),
        ("maintenance_type_id", "?"),
        ("maintenance_date", DATE),
        ("maintenance_kilometers", "?"),
        ("recurrency", "?"),
        ("observation", "?"),
    ];

    fn validate(&self) -> Result<()> {
        check_int("car_id", self.car_id, 1)?;
        check_int("maintenance_type_id", self.maintenance_type_id, 1)?;
        check_date("maintenance_date", &self.maintenance_date)?;
        check_int("maintenance_kilometers", self.maintenance_kilometers, 0)?;
        check_optional_int("recurrency", self.recurrency, 0)
    }

    fn binds(&self) -> Vec<BindParam> {
        vec![
            BindParam::Int(self.car_id),
            BindParam::Int(self.maintenance_type_id),
            BindParam::Text(self.maintenance_date.clone()),
            BindParam::Int(self.maintenance_kilometers),
            BindParam::OptionalInt(self.recurrency),
            optional_text(&self.observation),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverInput {
    pub name: String,
    pub license_number: String,
}

impl RecordInput for DriverInput {
    const SCHEMA: &'static ResourceSchema = &DRIVERS;
    const FIELDS: &'static [(&'static str, &'static str)] =
        &[("name", "?"), ("license_number", "?")];

    fn validate(&self) -> Result<()> {
        check_text("name", &self.name)?;
        check_text("license_number", &self.license_number)
    }

    fn binds(&self) -> Vec<BindParam> {
        vec![
            BindParam::Text(self.name.trim().to_string()),
            BindParam::Text(self.license_number.trim().to_string()),
        ]
    }
}

/// Car details as edited in the car form. Status has its own endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CarInput {
    pub make: String,
    pub model: String,
    pub license_plate: String,
    #[serde(default)]
    pub current_kilometers: i64,
    pub next_tire_change: i64,
    #[serde(default)]
    pub is_next_tire_change_bigger: bool,
    pub next_oil_change: i64,
    #[serde(default)]
    pub is_next_oil_change_bigger: bool,
    #[serde(default)]
    pub driver_id: Option<i64>,
}

impl RecordInput for CarInput {
    const SCHEMA: &'static ResourceSchema = &CARS;
    const FIELDS: &'static [(&'static str, &'static str)] = &[
        ("make", "?"),
        ("model", "?"),
        ("license_plate", "?"),
        ("current_kilometers", "?"),
        ("next_tire_change", "?"),
        ("is_next_tire_change_bigger", "?"),
        ("next_oil_change", "?"),
        ("is_next_oil_change_bigger", "?"),
        ("driver_id", "?"),
    ];

    fn validate(&self) -> Result<()> {
        check_text("make", &self.make)?;
        check_text("model", &self.model)?;
        check_text("license_plate", &self.license_plate)?;
        check_int("current_kilometers", self.current_kilometers, 0)?;
        check_int("next_tire_change", self.next_tire_change, 0)?;
        check_int("next_oil_change", self.next_oil_change, 0)?;
        check_optional_int("driver_id", self.driver_id, 1)
    }

    fn binds(&self) -> Vec<BindParam> {
        vec![
            BindParam::Text(self.make.trim().to_string()),
            BindParam::Text(self.model.trim().to_string()),
            BindParam::Text(self.license_plate.trim().to_string()),
            BindParam::Int(self.current_kilometers),
            BindParam::Int(self.next_tire_change),
            BindParam::Bool(self.is_next_tire_change_bigger),
            BindParam::Int(self.next_oil_change),
            BindParam::Bool(self.is_next_oil_change_bigger),
            BindParam::OptionalInt(self.driver_id),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FuelingInput {
    pub car_id: i64,
    pub fuel_date: String,
    pub fueling_kilometers: i64,
    pub liters_quantity: f64,
    pub price_per_liter: f64,
    pub total_cost: f64,
    pub fuel_type: String,
    #[serde(default)]
    pub observation: Option<String>,
}

impl RecordInput for FuelingInput {
    const SCHEMA: &'static ResourceSchema = &FUELING;
    const FIELDS: &'static [(&'static str, &'static str)] = &[
        ("car_id", "?"),
        ("fuel_date", DATE),
        ("fueling_kilometers", "?"),
        ("liters_quantity", "?"),
        ("price_per_liter", "?"),
        ("total_cost", "?"),
        ("fuel_type", "?"),
        ("observation", "?"),
    ];

    fn validate(&self) -> Result<()> {
        check_int("car_id", self.car_id, 1)?;
        check_date("fuel_date", &self.fuel_date)?;
        check_int("fueling_kilometers", self.fueling_kilometers, 0)?;
        check_amount("liters_quantity", self.liters_quantity)?;
        if self.liters_quantity == 0.0 {
            return Err(invalid("liters_quantity must be positive".into()));
        }
        check_amount("price_per_liter", self.price_per_liter)?;
        check_amount("total_cost", self.total_cost)?;
        check_text("fuel_type", &self.fuel_type)
    }

    fn binds(&self) -> Vec<BindParam> {
        vec![
            BindParam::Int(self.car_id),
            BindParam::Text(self.fuel_date.clone()),
            BindParam::Int(self.fueling_kilometers),
            BindParam::Float(self.liters_quantity),
            BindParam::Float(self.price_per_liter),
            BindParam::Float(self.total_cost),
            BindParam::Text(self.fuel_type.trim().to_string()),
            optional_text(&self.observation),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarStatusInput {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarKilometersInput {
    pub current_kilometers: i64,
}

/// Parses a path id, rejecting anything that is not a base-10 `INTEGER` key.
pub fn parse_id(raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i32>()
        .map(i64::from)
        .map_err(|_| ServiceError::InvalidRequest(format!("invalid id '{raw}'")))
}

fn insert_sql<T: RecordInput>() -> String {
    let columns = T::FIELDS
        .iter()
        .map(|(column, _)| *column)
        .collect::<Vec<_>>()
        .join(", ");
    let values = T::FIELDS
        .iter()
        .map(|(_, placeholder)| *placeholder)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({columns}) VALUES ({values}) \
         RETURNING json_build_object('id', id) AS payload",
        T::SCHEMA.table
    )
}

fn update_sql<T: RecordInput>() -> String {
    let assignments = T::FIELDS
        .iter()
        .map(|(column, placeholder)| format!("{column} = {placeholder}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE {} SET {assignments} WHERE id = ?", T::SCHEMA.table)
}

#[derive(Clone)]
pub struct RecordService {
    store: Arc<dyn DataStore>,
}

impl RecordService {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// The same joined row a listing would return, or `NotFound`.
    pub async fn fetch(&self, schema: &ResourceSchema, id: i64) -> Result<Value> {
        let sql = format!(
            "{} {} WHERE {} = ?",
            schema.select_clause(),
            schema.from_clause(),
            schema.primary_key()
        );
        let statement = Statement::new(&sql, vec![BindParam::Int(id)]);

        self.store
            .rows(&statement)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::NotFound(schema.label.to_string()))
    }

    /// Inserts a row and returns its new id.
    pub async fn create<T: RecordInput>(&self, input: &T) -> Result<i64> {
        input.validate()?;
        let statement = Statement::new(&insert_sql::<T>(), input.binds());

        let id = self
            .store
            .rows(&statement)
            .await?
            .into_iter()
            .next()
            .and_then(|row| row["id"].as_i64())
            .ok_or_else(|| {
                ServiceError::StoreUnavailable(anyhow::anyhow!("insert returned no id"))
            })?;

        info!(table = T::SCHEMA.table, id, "record created");
        Ok(id)
    }

    pub async fn update<T: RecordInput>(&self, id: i64, input: &T) -> Result<()> {
        input.validate()?;
        let mut params = input.binds();
        params.push(BindParam::Int(id));
        let statement = Statement::new(&update_sql::<T>(), params);

        self.expect_affected(&statement, T::SCHEMA.label).await?;
        info!(table = T::SCHEMA.table, id, "record updated");
        Ok(())
    }

    pub async fn delete(&self, schema: &ResourceSchema, id: i64) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", schema.table);
        let statement = Statement::new(&sql, vec![BindParam::Int(id)]);

        self.expect_affected(&statement, schema.label).await?;
        info!(table = schema.table, id, "record deleted");
        Ok(())
    }

    /// Sets a car's status; only `active` and `inactive` are accepted.
    pub async fn set_car_status(&self, id: i64, input: &CarStatusInput) -> Result<String> {
        let status = CAR_STATUSES
            .iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(input.status.trim()))
            .ok_or_else(|| ServiceError::InvalidFilter {
                field: "status".into(),
                value: input.status.clone(),
            })?;

        let statement = Statement::new(
            "UPDATE cars SET status = ? WHERE id = ?",
            vec![BindParam::Text((*status).to_string()), BindParam::Int(id)],
        );

        self.expect_affected(&statement, CARS.label).await?;
        info!(id, status = *status, "car status changed");
        Ok((*status).to_string())
    }

    /// Records the odometer reading reported after a fueling.
    pub async fn set_car_kilometers(&self, id: i64, input: &CarKilometersInput) -> Result<()> {
        check_int("current_kilometers", input.current_kilometers, 0)?;
        let statement = Statement::new(
            "UPDATE cars SET current_kilometers = ? WHERE id = ?",
            vec![BindParam::Int(input.current_kilometers), BindParam::Int(id)],
        );

        self.expect_affected(&statement, CARS.label).await?;
        info!(id, kilometers = input.current_kilometers, "car odometer updated");
        Ok(())
    }

    async fn expect_affected(&self, statement: &Statement, label: &str) -> Result<()> {
        match self.store.execute(statement).await? {
            0 => Err(ServiceError::NotFound(label.to_string())),
            _ => Ok(()),
        }
    }
}
