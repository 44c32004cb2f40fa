//! Analytical Query Engine over the ClickHouse `events` table.
//!
//! Builders return a SQL template plus parameters; user input only ever
//! reaches ClickHouse through `?` placeholders.

use chrono::NaiveDate;
use clickhouse::Row;
use serde::Deserialize;
use tracing::debug;

use crate::db::{BuiltQuery, ClickHouseClient, QueryParam, EVENTS_TABLE};
use crate::error::{AppError, Result};
use crate::metrics::QUERY_DURATION_SECONDS;
use crate::models::{DauRow, RetentionRow, TopEventRow};

pub const DEFAULT_TOP_EVENTS_LIMIT: u32 = 10;
pub const MAX_TOP_EVENTS_LIMIT: u32 = 100;
pub const DEFAULT_RETENTION_WINDOWS: u32 = 3;
pub const MAX_RETENTION_WINDOWS: u32 = 12;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Inclusive UTC date range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self> {
        if from > to {
            return Err(AppError::Validation(format!(
                "from ({}) must not be after to ({})",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    fn params(&self) -> [QueryParam; 2] {
        [
            QueryParam::Str(self.from.format(DATE_FORMAT).to_string()),
            QueryParam::Str(self.to.format(DATE_FORMAT).to_string()),
        ]
    }
}

/// Strict `YYYY-MM-DD`
pub fn parse_date(field: &str, raw: &str) -> Result<NaiveDate> {
    let well_formed = raw.len() == 10
        && raw
            .char_indices()
            .all(|(i, c)| if i == 4 || i == 7 { c == '-' } else { c.is_ascii_digit() });
    if !well_formed {
        return Err(AppError::Validation(format!(
            "{}: expected a date in YYYY-MM-DD format",
            field
        )));
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|_| AppError::Validation(format!("{}: not a valid calendar date", field)))
}

/// DAU filter, written `key:value` and split at the first colon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    EventType(String),
    Property { name: String, value: String },
}

impl Segment {
    pub fn parse(raw: &str) -> Result<Self> {
        let (key, value) = raw.split_once(':').ok_or_else(|| {
            AppError::Validation("segment: expected key:value".to_string())
        })?;

        if key == "event_type" {
            return Ok(Segment::EventType(value.to_string()));
        }

        match key.strip_prefix("properties.") {
            Some(name) if !name.is_empty() => Ok(Segment::Property {
                name: name.to_string(),
                value: value.to_string(),
            }),
            _ => Err(AppError::Validation(format!(
                "segment: unsupported key '{}' (use event_type or properties.<name>)",
                key
            ))),
        }
    }

    fn condition(&self) -> (&'static str, Vec<QueryParam>) {
        match self {
            Segment::EventType(value) => ("event_type = ?", vec![QueryParam::Str(value.clone())]),
            Segment::Property { name, value } => (
                "JSONExtractString(properties, ?) = ?",
                vec![QueryParam::Str(name.clone()), QueryParam::Str(value.clone())],
            ),
        }
    }
}

pub fn dau_query(range: &DateRange, segment: Option<&Segment>) -> BuiltQuery {
    let mut params = range.params().to_vec();
    let mut filter = String::new();
    if let Some(segment) = segment {
        let (condition, extra) = segment.condition();
        filter = format!(" AND {}", condition);
        params.extend(extra);
    }

    let sql = format!(
        "SELECT toString(toDate(occurred_at)) AS date, uniqExact(user_id) AS unique_users \
         FROM {table} \
         WHERE toDate(occurred_at) BETWEEN toDate(?) AND toDate(?){filter} \
         GROUP BY date \
         ORDER BY date ASC",
        table = EVENTS_TABLE,
        filter = filter
    );

    BuiltQuery { sql, params }
}

pub fn top_events_query(range: &DateRange, limit: u32) -> Result<BuiltQuery> {
    if !(1..=MAX_TOP_EVENTS_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit: must be between 1 and {}",
            MAX_TOP_EVENTS_LIMIT
        )));
    }

    let mut params = range.params().to_vec();
    params.push(QueryParam::UInt(limit as u64));

    let sql = format!(
        "SELECT event_type, uniqExact(event_id) AS count \
         FROM {table} \
         WHERE toDate(occurred_at) BETWEEN toDate(?) AND toDate(?) \
         GROUP BY event_type \
         ORDER BY count DESC, event_type ASC \
         LIMIT ?",
        table = EVENTS_TABLE
    );

    Ok(BuiltQuery { sql, params })
}

pub fn retention_query(start: NaiveDate, windows: u32) -> Result<BuiltQuery> {
    if !(1..=MAX_RETENTION_WINDOWS).contains(&windows) {
        return Err(AppError::Validation(format!(
            "windows: must be between 1 and {}",
            MAX_RETENTION_WINDOWS
        )));
    }

    let start = start.format(DATE_FORMAT).to_string();
    let sql = format!(
        r#"
        WITH
            cohorts AS (
                SELECT user_id, toMonday(min(toDate(occurred_at))) AS cohort_week
                FROM {table}
                WHERE toDate(occurred_at) >= toDate(?)
                GROUP BY user_id
            ),
            activity AS (
                SELECT DISTINCT user_id, toMonday(toDate(occurred_at)) AS activity_week
                FROM {table}
                WHERE toDate(occurred_at) >= toDate(?)
            )
        SELECT
            toString(c.cohort_week) AS cohort,
            uniqExact(c.user_id) AS week_0,
            uniqExactIf(a.user_id, dateDiff('day', c.cohort_week, a.activity_week) = 7) AS week_1,
            uniqExactIf(a.user_id, dateDiff('day', c.cohort_week, a.activity_week) = 14) AS week_2,
            uniqExactIf(a.user_id, dateDiff('day', c.cohort_week, a.activity_week) = 21) AS week_3
        FROM cohorts AS c
        INNER JOIN activity AS a ON c.user_id = a.user_id
        GROUP BY c.cohort_week
        ORDER BY c.cohort_week ASC
        LIMIT ?
        "#,
        table = EVENTS_TABLE
    );

    Ok(BuiltQuery {
        sql,
        params: vec![
            QueryParam::Str(start.clone()),
            QueryParam::Str(start),
            QueryParam::UInt(windows as u64),
        ],
    })
}

/// Raw cohort counts as returned by [`retention_query`]
#[derive(Debug, Clone, PartialEq, Eq, Row, Deserialize)]
pub struct RetentionCounts {
    pub cohort: String,
    pub week_0: u64,
    pub week_1: u64,
    pub week_2: u64,
    pub week_3: u64,
}

fn percent_of(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let pct = (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0);
    (pct * 100.0).round() / 100.0
}

pub fn retention_rows(counts: Vec<RetentionCounts>) -> Vec<RetentionRow> {
    counts
        .into_iter()
        .map(|c| RetentionRow {
            week_1: percent_of(c.week_1, c.week_0),
            week_2: percent_of(c.week_2, c.week_0),
            week_3: percent_of(c.week_3, c.week_0),
            week_0: c.week_0,
            cohort_week: c.cohort,
        })
        .collect()
}

/// Store failures become [`AppError::Query`]; validation passes through
fn query_error(err: AppError) -> AppError {
    match err {
        AppError::Validation(_) => err,
        other => AppError::Query(other.to_string()),
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    ch: ClickHouseClient,
}

impl QueryEngine {
    pub fn new(ch: ClickHouseClient) -> Self {
        Self { ch }
    }

    pub async fn dau(&self, range: DateRange, segment: Option<Segment>) -> Result<Vec<DauRow>> {
        let query = dau_query(&range, segment.as_ref());
        let _timer = QUERY_DURATION_SECONDS
            .with_label_values(&["dau"])
            .start_timer();
        let rows = self.ch.fetch::<DauRow>(&query).await.map_err(query_error)?;
        debug!(from = %range.from, to = %range.to, days = rows.len(), "DAU query finished");
        Ok(rows)
    }

    pub async fn top_events(&self, range: DateRange, limit: u32) -> Result<Vec<TopEventRow>> {
        let query = top_events_query(&range, limit)?;
        let _timer = QUERY_DURATION_SECONDS
            .with_label_values(&["top_events"])
            .start_timer();
        self.ch.fetch::<TopEventRow>(&query).await.map_err(query_error)
    }

    pub async fn retention(&self, start: NaiveDate, windows: u32) -> Result<Vec<RetentionRow>> {
        let query = retention_query(start, windows)?;
        let _timer = QUERY_DURATION_SECONDS
            .with_label_values(&["retention"])
            .start_timer();
        let counts = self
            .ch
            .fetch::<RetentionCounts>(&query)
            .await
            .map_err(query_error)?;
        Ok(retention_rows(counts))
    }
}
