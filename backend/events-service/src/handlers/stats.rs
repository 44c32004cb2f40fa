/// Analytical query endpoints
use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::error::Result;
use crate::services::queries::{
    parse_date, DateRange, Segment, DEFAULT_RETENTION_WINDOWS, DEFAULT_TOP_EVENTS_LIMIT,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DauParams {
    pub from: String,
    pub to: String,
    pub segment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TopEventsParams {
    pub from: String,
    pub to: String,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RetentionParams {
    #[serde(alias = "start_date")]
    pub start: String,
    pub windows: Option<u32>,
}

fn range(from: &str, to: &str) -> Result<DateRange> {
    DateRange::new(parse_date("from", from)?, parse_date("to", to)?)
}

/// `GET /stats/dau?from&to[&segment=key:value]`
pub async fn dau(state: web::Data<AppState>, params: web::Query<DauParams>) -> Result<HttpResponse> {
    let range = range(&params.from, &params.to)?;
    let segment = params.segment.as_deref().map(Segment::parse).transpose()?;

    let rows = state.queries.dau(range, segment).await?;
    Ok(HttpResponse::Ok().json(rows))
}

/// `GET /stats/top-events?from&to[&limit=10]`
pub async fn top_events(
    state: web::Data<AppState>,
    params: web::Query<TopEventsParams>,
) -> Result<HttpResponse> {
    let range = range(&params.from, &params.to)?;
    let limit = params.limit.unwrap_or(DEFAULT_TOP_EVENTS_LIMIT);

    let rows = state.queries.top_events(range, limit).await?;
    Ok(HttpResponse::Ok().json(rows))
}

/// `GET /stats/retention?start[&windows=3]`
pub async fn retention(
    state: web::Data<AppState>,
    params: web::Query<RetentionParams>,
) -> Result<HttpResponse> {
    let start = parse_date("start", &params.start)?;
    let windows = params.windows.unwrap_or(DEFAULT_RETENTION_WINDOWS);

    let rows = state.queries.retention(start, windows).await?;
    Ok(HttpResponse::Ok().json(rows))
}
