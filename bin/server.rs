// Facility KPIs - Web Server
// JSON API over the entry store and report builder (Axum)
//
// Identity comes from the fronting auth proxy: `X-User` carries the
// username and `X-Roles` a comma-separated role list.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::NaiveDate;
use facility_kpis::{
    facility_report, get_database_path, get_entry, kpi_report, load_catalog, load_config,
    load_units, open_month, parse_month, query_entries, setup_database, unit_report,
    upsert_entry, AccessPolicy, Config, Dendrogram, EntryFilter, KpiCatalog, KpiEntry, KpiError,
    Period, Principal, Report, Unit, UnitTree,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    policy: Arc<AccessPolicy>,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned"))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Handler error rendered as an ApiResponse with a status code
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<KpiError> for ApiError {
    fn from(e: KpiError) -> Self {
        let status = match e {
            KpiError::UnknownUnit(_) | KpiError::UnknownKpi(_) => StatusCode::NOT_FOUND,
            KpiError::InvalidPeriod(_) | KpiError::InvalidMonth(_) | KpiError::InvalidRole(_) => {
                StatusCode::BAD_REQUEST
            }
            KpiError::NotReporting(_) => StatusCode::UNPROCESSABLE_ENTITY,
            KpiError::MissingParent { .. } | KpiError::Cycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!("Request failed: {:#}", e);
        Self::internal(format!("{:#}", e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::err(self.message))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Report navigation parameters
#[derive(Debug, Deserialize)]
struct ReportQuery {
    year: Option<i32>,
    quarter: Option<u32>,
    period: Option<String>,
}

impl ReportQuery {
    fn period(&self) -> Result<Option<Period>, KpiError> {
        self.period.as_deref().map(str::parse).transpose()
    }
}

/// PUT /api/entries body
#[derive(Debug, Deserialize)]
struct EntryUpdate {
    kpi: i64,
    unit: i64,
    /// "YYYY-MM" or "YYYY-MM-DD"
    month: String,
    value: Option<f64>,
    comments: Option<String>,
}

#[derive(Serialize)]
struct OpenMonthResponse {
    unit: i64,
    month: NaiveDate,
    created: usize,
}

fn principal(headers: &HeaderMap) -> Principal {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    Principal::new(&header("x-user"), &header("x-roles"))
}

fn load_reference(conn: &Connection) -> Result<(UnitTree, KpiCatalog), ApiError> {
    Ok((load_units(conn)?, load_catalog(conn)?))
}

fn require_owner(
    state: &AppState,
    headers: &HeaderMap,
    tree: &UnitTree,
    unit: i64,
) -> Result<Principal, ApiError> {
    tree.require(unit)?;
    let who = principal(headers);
    if !state.policy.can_edit_entry(&who, tree, unit) {
        tracing::warn!(user = %who.username, unit, "edit refused");
        return Err(ApiError::new(StatusCode::FORBIDDEN, "not allowed to edit this unit"));
    }
    Ok(who)
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/units - All units
async fn list_units(State(state): State<AppState>) -> ApiResult<Vec<Unit>> {
    let conn = state.conn()?;
    let tree = load_units(&conn)?;
    Ok(Json(ApiResponse::ok(tree.all().cloned().collect())))
}

/// GET /api/units/:id/tree - Unit and everything below it
async fn unit_tree(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Dendrogram> {
    let conn = state.conn()?;
    let tree = load_units(&conn)?;
    let dendrogram = tree
        .dendrogram(id)
        .ok_or_else(|| KpiError::UnknownUnit(id.to_string()))?;
    Ok(Json(ApiResponse::ok(dendrogram)))
}

/// GET /api/units/:id/report - Unit report (aggregates reporting subunits)
async fn get_unit_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Report> {
    let conn = state.conn()?;
    let (tree, catalog) = load_reference(&conn)?;
    let entries = query_entries(&conn, &EntryFilter::for_unit(&tree, id))?;

    let report = unit_report(&catalog, &tree, &entries, id, query.year, query.quarter, query.period()?)?;
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/kpis/:id/report - One KPI across its units
async fn get_kpi_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Report> {
    let conn = state.conn()?;
    let (tree, catalog) = load_reference(&conn)?;
    let entries = query_entries(&conn, &EntryFilter::for_kpi(id))?;

    let report = kpi_report(&catalog, &tree, &entries, id, query.year, query.quarter, query.period()?)?;
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/report - Facility-wide report
async fn get_facility_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Report> {
    let conn = state.conn()?;
    let (tree, catalog) = load_reference(&conn)?;
    let entries = query_entries(&conn, &EntryFilter::all())?;

    let report = facility_report(&catalog, &tree, &entries, query.year, query.quarter, query.period()?)?;
    Ok(Json(ApiResponse::ok(report)))
}

/// PUT /api/entries - Save value and comments (last write wins)
async fn put_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<EntryUpdate>,
) -> ApiResult<Option<KpiEntry>> {
    let conn = state.conn()?;
    let (tree, catalog) = load_reference(&conn)?;
    if catalog.kpi(update.kpi).is_none() {
        return Err(KpiError::UnknownKpi(update.kpi.to_string()).into());
    }
    let who = require_owner(&state, &headers, &tree, update.unit)?;
    tree.require_reporter(update.unit)?;

    let entry = KpiEntry {
        id: 0,
        kpi: update.kpi,
        unit: update.unit,
        month: parse_month(&update.month)?,
        value: update.value,
        comments: update.comments,
    };
    upsert_entry(&conn, &entry, &who.username)?;

    let stored = get_entry(&conn, entry.kpi, entry.unit, entry.month)?;
    Ok(Json(ApiResponse::ok(stored)))
}

/// POST /api/units/:id/months/:year/:month - Open a reporting month
async fn post_open_month(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, year, month)): Path<(i64, i32, u32)>,
) -> ApiResult<OpenMonthResponse> {
    let conn = state.conn()?;
    let (tree, catalog) = load_reference(&conn)?;
    let who = require_owner(&state, &headers, &tree, id)?;

    let month = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| KpiError::InvalidMonth(format!("{}-{:02}", year, month)))?;
    let created = open_month(&conn, &catalog, &tree, id, month, &who.username)?;

    Ok(Json(ApiResponse::ok(OpenMonthResponse {
        unit: id,
        month,
        created,
    })))
}

// ============================================================================
// Main Server
// ============================================================================

fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let db_path = get_database_path(config);
    let conn = Connection::open(&db_path)?;
    setup_database(&conn)?;
    tracing::info!("Database opened: {}", db_path.display());

    Ok(AppState {
        db: Arc::new(Mutex::new(conn)),
        policy: Arc::new(AccessPolicy::new(
            &config.access.admin_users,
            &config.access.admin_roles,
        )),
    })
}

fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/units", get(list_units))
        .route("/units/:id/tree", get(unit_tree))
        .route("/units/:id/report", get(get_unit_report))
        .route("/units/:id/months/:year/:month", post(post_open_month))
        .route("/kpis/:id/report", get(get_kpi_report))
        .route("/report", get(get_facility_report))
        .route("/entries", put(put_entry))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = load_config(config_path.as_deref())?;
    let state = build_state(&config)?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    tracing::info!("Server running on http://{}", config.server.addr);
    tracing::info!("API: http://{}/api/report", config.server.addr);

    axum::serve(listener, app).await?;
    Ok(())
}
