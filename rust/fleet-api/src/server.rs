use crate::{
    config::AppConfig,
    db::{self, PgStore},
    error::{Result, ServiceError},
    list::{ListQueryEngine, ListRequest},
    records::{
        parse_id, CarInput, CarKilometersInput, CarMaintenanceInput, CarStatusInput, DriverInput,
        FuelingInput, MaintenanceHistoryInput, RecordInput, RecordService,
    },
    resources::{Registry, Resource},
    state::AppState,
    store::DataStore,
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, patch},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

type Params = Query<HashMap<String, String>>;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let pool = db::connect_pool(&config).await?;
        Self::with_store(config, Arc::new(PgStore::new(pool)))
    }

    /// Builds the service over any store; nothing is connected here.
    pub fn with_store(config: AppConfig, store: Arc<dyn DataStore>) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::builtin()?);
        let config = Arc::new(config);
        let state = AppState::new(
            Arc::clone(&config),
            registry,
            ListQueryEngine::new(Arc::clone(&store)),
            RecordService::new(store),
        );

        Ok(Self { config, state })
    }

    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/healthz", get(Self::health))
            .route("/cars", get(Self::list_cars).post(create::<CarInput>))
            .route(
                "/cars/:id",
                get(Self::get_car)
                    .put(update::<CarInput>)
                    .delete(Self::delete_car),
            )
            .route("/cars/:id/status", patch(Self::set_car_status))
            .route(
                "/cars/:id/current-kilometers",
                patch(Self::set_car_kilometers).put(Self::set_car_kilometers),
            )
            .route(
                "/drivers",
                get(Self::list_drivers).post(create::<DriverInput>),
            )
            .route(
                "/drivers/:id",
                get(Self::get_driver)
                    .put(update::<DriverInput>)
                    .delete(Self::delete_driver),
            )
            .route(
                "/car-maintenance",
                get(Self::list_car_maintenance).post(create::<CarMaintenanceInput>),
            )
            .route(
                "/car-maintenance/car/:car_id",
                get(Self::list_car_maintenance_by_car),
            )
            .route(
                "/car-maintenance/:id",
                get(Self::get_car_maintenance)
                    .put(update::<CarMaintenanceInput>)
                    .delete(Self::delete_car_maintenance),
            )
            .route("/oil-changes", get(Self::list_oil_changes))
            .route(
                "/oil-changes/:id",
                get(Self::get_oil_change).delete(Self::delete_oil_change),
            )
            .route(
                "/maintenance/history",
                get(Self::list_maintenance_history).post(create::<MaintenanceHistoryInput>),
            )
            .route(
                "/maintenance/history/:id",
                get(Self::get_maintenance_history)
                    .put(update::<MaintenanceHistoryInput>)
                    .delete(Self::delete_maintenance_history),
            )
            .route("/maintenance/types", get(Self::list_maintenance_types))
            .route("/maintenance/types/:id", get(Self::get_maintenance_type))
            .route(
                "/fueling",
                get(Self::list_fueling).post(create::<FuelingInput>),
            )
            .route(
                "/fueling/:id",
                get(Self::get_fueling).put(update::<FuelingInput>),
            )
            .with_state(self.state.clone())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.config.request_timeout,
            ))
            .layer(TraceLayer::new_for_http());

        match &self.config.allowed_origins {
            Some(origins) => router.layer(cors_layer(origins)),
            None => router,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "fleet API listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn list_cars(State(state): State<AppState>, Query(params): Params) -> Result<Json<Value>> {
        list(&state, Resource::Cars, ListRequest::from_query(params)).await
    }

    async fn list_drivers(
        State(state): State<AppState>,
        Query(params): Params,
    ) -> Result<Json<Value>> {
        list(&state, Resource::Drivers, ListRequest::from_query(params)).await
    }

    async fn list_car_maintenance(
        State(state): State<AppState>,
        Query(params): Params,
    ) -> Result<Json<Value>> {
        list(&state, Resource::CarMaintenance, ListRequest::from_query(params)).await
    }

    async fn list_car_maintenance_by_car(
        State(state): State<AppState>,
        Path(car_id): Path<String>,
        Query(params): Params,
    ) -> Result<Json<Value>> {
        // The path segment wins over any car_id on the query string.
        let request = ListRequest::from_query(params).filter("car_id", car_id);
        list(&state, Resource::CarMaintenanceByCar, request).await
    }

    async fn list_oil_changes(
        State(state): State<AppState>,
        Query(params): Params,
    ) -> Result<Json<Value>> {
        list(&state, Resource::OilChanges, ListRequest::from_query(params)).await
    }

    async fn list_maintenance_history(
        State(state): State<AppState>,
        Query(params): Params,
    ) -> Result<Json<Value>> {
        list(&state, Resource::MaintenanceHistory, ListRequest::from_query(params)).await
    }

    async fn list_maintenance_types(
        State(state): State<AppState>,
        Query(params): Params,
    ) -> Result<Json<Value>> {
        list(&state, Resource::MaintenanceTypes, ListRequest::from_query(params)).await
    }

    async fn list_fueling(
        State(state): State<AppState>,
        Query(params): Params,
    ) -> Result<Json<Value>> {
        list(&state, Resource::Fueling, ListRequest::from_query(params)).await
    }

    async fn get_car(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
        fetch(&state, Resource::Cars, &id).await
    }

    async fn get_driver(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        fetch(&state, Resource::Drivers, &id).await
    }

    async fn get_car_maintenance(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        fetch(&state, Resource::CarMaintenance, &id).await
    }

    async fn get_oil_change(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        fetch(&state, Resource::OilChanges, &id).await
    }

    async fn get_maintenance_history(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        fetch(&state, Resource::MaintenanceHistory, &id).await
    }

    async fn get_maintenance_type(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        fetch(&state, Resource::MaintenanceTypes, &id).await
    }

    async fn get_fueling(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        fetch(&state, Resource::Fueling, &id).await
    }

    async fn set_car_status(
        State(state): State<AppState>,
        Path(id): Path<String>,
        payload: std::result::Result<Json<CarStatusInput>, JsonRejection>,
    ) -> Result<Json<Value>> {
        let id = parse_id(&id)?;
        let Json(input) = payload.map_err(json_rejection)?;
        let status = state.records.set_car_status(id, &input).await?;
        Ok(Json(json!({ "message": "Car status updated", "status": status })))
    }

    async fn set_car_kilometers(
        State(state): State<AppState>,
        Path(id): Path<String>,
        payload: std::result::Result<Json<CarKilometersInput>, JsonRejection>,
    ) -> Result<Json<Value>> {
        let id = parse_id(&id)?;
        let Json(input) = payload.map_err(json_rejection)?;
        state.records.set_car_kilometers(id, &input).await?;
        Ok(Json(json!({
            "message": "Car kilometers updated",
            "current_kilometers": input.current_kilometers,
        })))
    }

    async fn delete_car(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        remove(&state, Resource::Cars, &id).await
    }

    async fn delete_driver(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        remove(&state, Resource::Drivers, &id).await
    }

    async fn delete_car_maintenance(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        remove(&state, Resource::CarMaintenance, &id).await
    }

    async fn delete_oil_change(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        remove(&state, Resource::OilChanges, &id).await
    }

    async fn delete_maintenance_history(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<Json<Value>> {
        remove(&state, Resource::MaintenanceHistory, &id).await
    }
}

async fn create<T>(
    State(state): State<AppState>,
    payload: std::result::Result<Json<T>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)>
where
    T: RecordInput + DeserializeOwned + 'static,
{
    let Json(input) = payload.map_err(json_rejection)?;
    let id = state.records.create(&input).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": format!("{} created", T::SCHEMA.label), "id": id })),
    ))
}

async fn update<T>(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<T>, JsonRejection>,
) -> Result<Json<Value>>
where
    T: RecordInput + DeserializeOwned + 'static,
{
    let id = parse_id(&id)?;
    let Json(input) = payload.map_err(json_rejection)?;
    state.records.update(id, &input).await?;
    Ok(Json(json!({ "message": format!("{} updated", T::SCHEMA.label) })))
}

async fn remove(state: &AppState, resource: Resource, raw_id: &str) -> Result<Json<Value>> {
    let id = parse_id(raw_id)?;
    let schema = state.registry.get(resource);
    state.records.delete(schema, id).await?;
    Ok(Json(json!({ "message": format!("{} deleted", schema.label) })))
}

async fn list(state: &AppState, resource: Resource, request: ListRequest) -> Result<Json<Value>> {
    let schema = state.registry.get(resource);
    let result = state.lists.execute_list(schema, &request).await?;
    Ok(Json(result.into_body(schema)))
}

async fn fetch(state: &AppState, resource: Resource, raw_id: &str) -> Result<Json<Value>> {
    let id = parse_id(raw_id)?;
    let row = state.records.fetch(state.registry.get(resource), id).await?;
    Ok(Json(row))
}

fn json_rejection(rejection: JsonRejection) -> ServiceError {
    ServiceError::InvalidRequest(rejection.body_text())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];

    if origins.iter().any(|origin| origin == "*") {
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers([header::CONTENT_TYPE]);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers([header::CONTENT_TYPE])
}
