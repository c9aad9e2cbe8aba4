//! Axum JSON read API over the listing database.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use rentrack_core::DailyAggregate;
use rentrack_storage::{GoldStore, SilverStore, SqliteStore};
use rentrack_sync::{count_new_listings, delta_as_of, delta_between, ChangeError, PipelineConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rentrack-web";

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
}

impl AppState {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChangesQuery {
    as_of: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Serialize)]
struct GoldComparison {
    start: Option<DailyAggregate>,
    end: Option<DailyAggregate>,
}

#[derive(Debug, Serialize)]
struct SummaryStats {
    latest: Option<DailyAggregate>,
    previous_date: Option<NaiveDate>,
    /// Latest median minus the previous aggregate's median.
    median_price_change: Option<f64>,
    new_listings: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ping", get(ping_handler))
        .route("/api/gold-metrics", get(gold_metrics_handler))
        .route("/api/gold-compare", get(gold_compare_handler))
        .route("/api/summary-stats", get(summary_stats_handler))
        .route("/api/silver-latest", get(silver_latest_handler))
        .route("/api/silver-by-date/{date}", get(silver_by_date_handler))
        .route("/api/silver-zip/{zip}", get(silver_zip_handler))
        .route("/api/scrape-dates", get(scrape_dates_handler))
        .route("/api/silver-changes", get(silver_changes_handler))
        .route("/api/new-listings", get(new_listings_handler))
        .route("/api/last-updated", get(last_updated_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    let store = SqliteStore::open(&config.db_path).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, db = %config.db_path.display(), "serving read API");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn ping_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn gold_metrics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let start = match optional_date(query.start.as_deref(), "start") {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let end = match optional_date(query.end.as_deref(), "end") {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    let rows = match (start, end) {
        (Some(start), Some(end)) if start > end => {
            return json_error(StatusCode::BAD_REQUEST, "start must not be after end")
        }
        (Some(start), Some(end)) => state.store.aggregates_between(start, end).await,
        _ => state.store.aggregates().await.map(|rows| {
            rows.into_iter()
                .filter(|r| start.map_or(true, |s| r.scrape_date >= s))
                .filter(|r| end.map_or(true, |e| r.scrape_date <= e))
                .collect()
        }),
    };
    match rows {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn gold_compare_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let (Some(start), Some(end)) = (query.start.as_deref(), query.end.as_deref()) else {
        return json_error(StatusCode::BAD_REQUEST, "start and end are required");
    };
    let start = match parse_date(start, "start") {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let end = match parse_date(end, "end") {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    let start = match state.store.aggregate_for(start).await {
        Ok(row) => row,
        Err(err) => return server_error(err),
    };
    let end = match state.store.aggregate_for(end).await {
        Ok(row) => row,
        Err(err) => return server_error(err),
    };
    Json(GoldComparison { start, end }).into_response()
}

async fn summary_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut rows = match state.store.aggregates().await {
        Ok(rows) => rows,
        Err(err) => return server_error(err),
    };
    let latest = rows.pop();
    let previous = rows.pop();
    let median_price_change = latest
        .as_ref()
        .zip(previous.as_ref())
        .map(|(l, p)| l.median_price - p.median_price);

    let new_listings = match count_new_listings(&state.store).await {
        Ok(count) => Some(count.new_listings),
        Err(ChangeError::InsufficientHistory { .. }) => None,
        Err(err) => return server_error(err),
    };

    Json(SummaryStats {
        latest,
        previous_date: previous.map(|p| p.scrape_date),
        median_price_change,
        new_listings,
    })
    .into_response()
}

async fn silver_latest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_silver_partition().await {
        Ok(Some((_, listings))) => Json(listings).into_response(),
        Ok(None) => Json(Vec::<serde_json::Value>::new()).into_response(),
        Err(err) => server_error(err),
    }
}

async fn silver_by_date_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> Response {
    let date = match parse_date(&date, "date") {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match state.store.silver_partition(date).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => server_error(err),
    }
}

async fn silver_zip_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(zip): AxumPath<String>,
) -> Response {
    match state.store.latest_silver_by_zip(zip.trim()).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => server_error(err),
    }
}

async fn scrape_dates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.silver_dates_desc().await {
        Ok(dates) => Json(dates).into_response(),
        Err(err) => server_error(err),
    }
}

async fn silver_changes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let report = match (query.from.as_deref(), query.to.as_deref()) {
        (Some(from), Some(to)) => {
            let from = match parse_date(from, "from") {
                Ok(d) => d,
                Err(resp) => return resp,
            };
            let to = match parse_date(to, "to") {
                Ok(d) => d,
                Err(resp) => return resp,
            };
            delta_between(&state.store, from, to).await
        }
        (None, None) => {
            let as_of = match optional_date(query.as_of.as_deref(), "as_of") {
                Ok(d) => d,
                Err(resp) => return resp,
            };
            delta_as_of(&state.store, as_of).await
        }
        _ => return json_error(StatusCode::BAD_REQUEST, "from and to must be given together"),
    };
    match report {
        Ok(report) => Json(report).into_response(),
        Err(err) => change_error(err),
    }
}

async fn new_listings_handler(State(state): State<Arc<AppState>>) -> Response {
    match count_new_listings(&state.store).await {
        Ok(count) => Json(count).into_response(),
        Err(err) => change_error(err),
    }
}

async fn last_updated_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.last_updated().await {
        Ok(at) => Json(serde_json::json!({ "last_updated": at })).into_response(),
        Err(err) => server_error(err),
    }
}

fn parse_date(raw: &str, name: &str) -> Result<NaiveDate, Response> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            &format!("{name} must be a YYYY-MM-DD date, got '{raw}'"),
        )
    })
}

fn optional_date(raw: Option<&str>, name: &str) -> Result<Option<NaiveDate>, Response> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => parse_date(raw, name).map(Some),
        None => Ok(None),
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn change_error(err: ChangeError) -> Response {
    match err {
        ChangeError::InsufficientHistory { .. } => json_error(StatusCode::BAD_REQUEST, "Not enough data"),
        ChangeError::SameDate(_) => json_error(StatusCode::BAD_REQUEST, &err.to_string()),
        ChangeError::MissingPartition(_) => json_error(StatusCode::NOT_FOUND, &err.to_string()),
        ChangeError::Store(err) => server_error(err),
    }
}

fn server_error(err: impl Into<anyhow::Error>) -> Response {
    let err = err.into();
    error!(error = %format!("{err:#}"), "read API request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("Server error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use rentrack_sync::Pipeline;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(name)
    }

    async fn seeded(days: &[&str]) -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::open(PipelineConfig::in_dir(dir.path())).await.unwrap();
        for day in days {
            pipeline
                .ingest_file(fixture(&format!("raw_{day}.json")))
                .await
                .unwrap();
            pipeline.run_once().await.unwrap();
        }
        let router = app(AppState::new(pipeline.store().clone()));
        (dir, router)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn ping_and_empty_database() {
        let (_dir, app) = seeded(&[]).await;
        let (status, body) = get_json(app.clone(), "/api/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (_, dates) = get_json(app.clone(), "/api/scrape-dates").await;
        assert_eq!(dates, serde_json::json!([]));
        let (_, latest) = get_json(app.clone(), "/api/silver-latest").await;
        assert_eq!(latest, serde_json::json!([]));
        let (_, updated) = get_json(app, "/api/last-updated").await;
        assert!(updated["last_updated"].is_null());
    }

    #[tokio::test]
    async fn single_day_has_not_enough_data_for_changes() {
        let (_dir, app) = seeded(&["2025-06-01"]).await;
        let (status, body) = get_json(app.clone(), "/api/silver-changes").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Not enough data");

        let (status, _) = get_json(app.clone(), "/api/new-listings").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, summary) = get_json(app, "/api/summary-stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["latest"]["listing_count"], 3);
        assert!(summary["median_price_change"].is_null());
        assert!(summary["new_listings"].is_null());
    }

    #[tokio::test]
    async fn two_days_expose_changes_and_metrics() {
        let (_dir, app) = seeded(&["2025-06-01", "2025-06-02"]).await;

        let (status, changes) = get_json(app.clone(), "/api/silver-changes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(changes["latest_date"], "2025-06-02");
        assert_eq!(changes["changes"][0]["delta"], -50);
        assert_eq!(changes["changes"][1]["change"], "new");

        let (_, as_of) = get_json(app.clone(), "/api/silver-changes?as_of=2025-06-01").await;
        assert_eq!(as_of["error"], "Not enough data");

        let (_, explicit) =
            get_json(app.clone(), "/api/silver-changes?from=2025-06-02&to=2025-06-01").await;
        assert_eq!(explicit, changes);

        let (_, new) = get_json(app.clone(), "/api/new-listings").await;
        assert_eq!(new["new_listings"], 1);
        assert_eq!(new["previous_date"], "2025-06-01");

        let (_, dates) = get_json(app.clone(), "/api/scrape-dates").await;
        assert_eq!(dates, serde_json::json!(["2025-06-02", "2025-06-01"]));

        let (_, metrics) = get_json(app.clone(), "/api/gold-metrics").await;
        assert_eq!(metrics.as_array().map(Vec::len), Some(2));
        let (_, ranged) = get_json(app.clone(), "/api/gold-metrics?start=2025-06-02").await;
        assert_eq!(ranged.as_array().map(Vec::len), Some(1));

        let (_, compare) =
            get_json(app.clone(), "/api/gold-compare?start=2025-06-01&end=2025-06-02").await;
        assert_eq!(compare["start"]["scrape_date"], "2025-06-01");
        assert_eq!(compare["end"]["median_price"], 1150.0);

        let (_, summary) = get_json(app.clone(), "/api/summary-stats").await;
        assert_eq!(summary["median_price_change"], 150.0);
        assert_eq!(summary["new_listings"], 1);

        let (_, by_zip) = get_json(app.clone(), "/api/silver-zip/50312").await;
        assert_eq!(by_zip.as_array().map(Vec::len), Some(1));
        assert_eq!(by_zip[0]["neighborhood"], "Sherman Hill");

        let (_, by_date) = get_json(app.clone(), "/api/silver-by-date/2025-06-01").await;
        assert_eq!(by_date.as_array().map(Vec::len), Some(3));

        let (_, updated) = get_json(app, "/api/last-updated").await;
        assert!(updated["last_updated"].is_string());
    }

    #[tokio::test]
    async fn as_of_picks_the_pair_ending_on_that_date() {
        let (_dir, app) = seeded(&["2025-06-01", "2025-06-02", "2025-06-03"]).await;

        let (_, latest) = get_json(app.clone(), "/api/silver-changes").await;
        assert_eq!(latest["latest_date"], "2025-06-03");
        assert_eq!(latest["previous_date"], "2025-06-02");
        assert_eq!(latest["changes"][0]["delta"], -25);

        let (status, as_of) = get_json(app, "/api/silver-changes?as_of=2025-06-02").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_of["latest_date"], "2025-06-02");
        assert_eq!(as_of["previous_date"], "2025-06-01");
        assert_eq!(as_of["changes"][0]["delta"], -50);
        assert_eq!(as_of["changes"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn malformed_parameters_are_rejected() {
        let (_dir, app) = seeded(&["2025-06-01"]).await;
        let (status, body) = get_json(app.clone(), "/api/silver-by-date/june-first").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("YYYY-MM-DD"));

        let (status, _) = get_json(app.clone(), "/api/gold-compare?start=2025-06-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            get_json(app.clone(), "/api/gold-metrics?start=2025-06-03&end=2025-06-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(app.clone(), "/api/silver-changes?from=2025-06-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            get_json(app, "/api/silver-changes?from=2025-06-01&to=2025-05-31").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("2025-05-31"));
    }
}
