//! In-memory analytics over normalized opportunities: KPIs, rollups and queries.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use funil_core::{Opportunity, OpportunityStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "funil-analytics";

/// Entries kept in the profile's geography and product sections.
pub const TOP_SECTION_LIMIT: usize = 5;

/// Hard cap on groups returned by one query.
pub const MAX_QUERY_GROUPS: usize = 40;

/// Counters accumulated for one dimension value during the linear scan.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregationBucket {
    pub total: u64,
    pub won_count: u64,
    pub lost_count: u64,
    pub amount_sum: f64,
    pub won_amount_sum: f64,
    pub lost_amount_sum: f64,
}

impl AggregationBucket {
    fn observe(&mut self, row: &Opportunity) {
        self.total += 1;
        self.amount_sum += row.amount;
        match row.status {
            OpportunityStatus::Won => {
                self.won_count += 1;
                self.won_amount_sum += row.amount;
            }
            OpportunityStatus::Lost => {
                self.lost_count += 1;
                self.lost_amount_sum += row.amount;
            }
            OpportunityStatus::Open => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryKpis {
    pub total: u64,
    pub won: u64,
    pub lost: u64,
    pub open: u64,
    pub won_revenue: f64,
    pub average_won_deal: f64,
}

/// One dimension value with its counters and display-ready conversion rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionRollup {
    pub key: String,
    pub total: u64,
    pub won: u64,
    pub lost: u64,
    pub won_revenue: f64,
    pub conversion: String,
}

/// One `MM/YYYY` slot. Creations are bucketed by creation month, wins by
/// closure month falling back to creation month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthBucket {
    pub month: String,
    pub created: u64,
    pub won: u64,
    pub won_revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetAnalytics {
    pub summary: SummaryKpis,
    pub sellers: Vec<DimensionRollup>,
    pub sources: Vec<DimensionRollup>,
    pub funnels: Vec<DimensionRollup>,
    pub regions: Vec<DimensionRollup>,
    pub cities: Vec<DimensionRollup>,
    pub products: Vec<DimensionRollup>,
    pub timeline: Vec<MonthBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Geography {
    pub states: Vec<DimensionRollup>,
    pub cities: Vec<DimensionRollup>,
}

/// Compact dataset profile handed to the report prompt and the profile API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsProfile {
    pub summary: SummaryKpis,
    pub funnels: Vec<DimensionRollup>,
    pub sellers: Vec<DimensionRollup>,
    pub sources: Vec<DimensionRollup>,
    pub timeline: Vec<MonthBucket>,
    pub geography: Geography,
    pub products: Vec<DimensionRollup>,
}

pub fn conversion_rate(won: u64, total: u64) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    let pct = (100.0 * won as f64 / total as f64).round();
    format!("{}%", pct as i64)
}

fn month_key(at: DateTime<Utc>) -> (i32, u32) {
    (at.year(), at.month())
}

fn month_label(year: i32, month: u32) -> String {
    format!("{month:02}/{year}")
}

#[derive(Debug, Clone, Copy, Default)]
struct MonthAccumulator {
    created: u64,
    won: u64,
    won_revenue: f64,
}

fn rollup(buckets: BTreeMap<String, AggregationBucket>) -> Vec<DimensionRollup> {
    let mut out: Vec<DimensionRollup> = buckets
        .into_iter()
        .map(|(key, bucket)| DimensionRollup {
            key,
            total: bucket.total,
            won: bucket.won_count,
            lost: bucket.lost_count,
            won_revenue: bucket.won_amount_sum,
            conversion: conversion_rate(bucket.won_count, bucket.total),
        })
        .collect();
    out.sort_by(|a, b| {
        b.won_revenue
            .partial_cmp(&a.won_revenue)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    out
}

/// Single-pass aggregation. Empty input yields `None` so callers can
/// short-circuit instead of rendering a zeroed report.
pub fn aggregate(rows: &[Opportunity]) -> Option<DatasetAnalytics> {
    if rows.is_empty() {
        return None;
    }
    let mut global = AggregationBucket::default();
    let mut sellers: BTreeMap<String, AggregationBucket> = BTreeMap::new();
    let mut sources: BTreeMap<String, AggregationBucket> = BTreeMap::new();
    let mut funnels: BTreeMap<String, AggregationBucket> = BTreeMap::new();
    let mut regions: BTreeMap<String, AggregationBucket> = BTreeMap::new();
    let mut cities: BTreeMap<String, AggregationBucket> = BTreeMap::new();
    let mut products: BTreeMap<String, AggregationBucket> = BTreeMap::new();
    let mut months: BTreeMap<(i32, u32), MonthAccumulator> = BTreeMap::new();

    for row in rows {
        global.observe(row);
        sellers.entry(row.seller.clone()).or_default().observe(row);
        sources.entry(row.lead_source.clone()).or_default().observe(row);
        funnels.entry(row.funnel.clone()).or_default().observe(row);
        regions.entry(row.region_code.clone()).or_default().observe(row);
        cities.entry(row.city.clone()).or_default().observe(row);
        products.entry(row.product.clone()).or_default().observe(row);

        months.entry(month_key(row.created_at)).or_default().created += 1;
        if row.status == OpportunityStatus::Won {
            let key = month_key(row.closed_at.unwrap_or(row.created_at));
            let slot = months.entry(key).or_default();
            slot.won += 1;
            slot.won_revenue += row.amount;
        }
    }

    let average_won_deal = if global.won_count > 0 {
        global.won_amount_sum / global.won_count as f64
    } else {
        0.0
    };
    Some(DatasetAnalytics {
        summary: SummaryKpis {
            total: global.total,
            won: global.won_count,
            lost: global.lost_count,
            open: global.total - global.won_count - global.lost_count,
            won_revenue: global.won_amount_sum,
            average_won_deal,
        },
        sellers: rollup(sellers),
        sources: rollup(sources),
        funnels: rollup(funnels),
        regions: rollup(regions),
        cities: rollup(cities),
        products: rollup(products),
        timeline: months
            .into_iter()
            .map(|((year, month), acc)| MonthBucket {
                month: month_label(year, month),
                created: acc.created,
                won: acc.won,
                won_revenue: acc.won_revenue,
            })
            .collect(),
    })
}

fn top_section(mut rollups: Vec<DimensionRollup>) -> Vec<DimensionRollup> {
    rollups.truncate(TOP_SECTION_LIMIT);
    rollups
}

/// Shapes aggregation output into the profile consumed downstream, trimming
/// geography and products to the strongest entries by won revenue.
pub fn build_profile(analytics: DatasetAnalytics) -> AnalyticsProfile {
    let DatasetAnalytics {
        summary,
        sellers,
        sources,
        funnels,
        regions,
        cities,
        products,
        timeline,
    } = analytics;
    AnalyticsProfile {
        summary,
        funnels,
        sellers,
        sources,
        timeline,
        geography: Geography {
            states: top_section(regions),
            cities: top_section(cities),
        },
        products: top_section(products),
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("group_by must name at least one dimension")]
    EmptyGroupBy,
    #[error("unknown group dimension {0:?}")]
    UnknownDimension(String),
    #[error("unknown status filter {0:?}, expected won, lost or open")]
    InvalidStatus(String),
    #[error("month filter must be between 1 and 12, got {0}")]
    InvalidMonth(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDimension {
    Seller,
    LeadSource,
    Funnel,
    Stage,
    Region,
    City,
    Product,
    Status,
    Month,
    Year,
}

impl GroupDimension {
    pub const NAMES: [&'static str; 10] = [
        "seller",
        "lead_source",
        "funnel",
        "stage",
        "region",
        "city",
        "product",
        "status",
        "month",
        "year",
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "seller" => Some(Self::Seller),
            "lead_source" => Some(Self::LeadSource),
            "funnel" => Some(Self::Funnel),
            "stage" => Some(Self::Stage),
            "region" => Some(Self::Region),
            "city" => Some(Self::City),
            "product" => Some(Self::Product),
            "status" => Some(Self::Status),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }
}

/// Text filters match case-insensitively by substring; status matches exactly.
/// A month without a year is pinned to the caller's reference year.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryFilters {
    pub seller: Option<String>,
    pub lead_source: Option<String>,
    pub funnel: Option<String>,
    pub region: Option<String>,
    pub product: Option<String>,
    pub status: Option<String>,
    pub year: Option<i32>,
    pub month: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryRequest {
    pub filters: QueryFilters,
    pub group_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRow {
    pub group: String,
    pub count: u64,
    pub revenue: f64,
    pub won: u64,
    pub lost: u64,
    pub won_revenue: f64,
    pub lost_revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
    pub total_groups: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct QueryBucket {
    count: u64,
    revenue: f64,
    won: u64,
    lost: u64,
    won_revenue: f64,
    lost_revenue: f64,
}

fn lowered(filter: &Option<String>) -> Option<String> {
    filter
        .as_ref()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

fn substring_matches(needle: &Option<String>, haystack: &str) -> bool {
    match needle {
        Some(needle) => haystack.to_lowercase().contains(needle),
        None => true,
    }
}

/// Questions about wins are answered on the closure date (falling back to the
/// creation date); everything else is answered on the creation date.
fn resolved_date(row: &Opportunity, use_closed: bool) -> DateTime<Utc> {
    if use_closed {
        row.closed_at.unwrap_or(row.created_at)
    } else {
        row.created_at
    }
}

fn project(row: &Opportunity, dim: GroupDimension, date: DateTime<Utc>) -> String {
    match dim {
        GroupDimension::Seller => row.seller.clone(),
        GroupDimension::LeadSource => row.lead_source.clone(),
        GroupDimension::Funnel => row.funnel.clone(),
        GroupDimension::Stage => row.stage.clone(),
        GroupDimension::Region => row.region_code.clone(),
        GroupDimension::City => row.city.clone(),
        GroupDimension::Product => row.product.clone(),
        GroupDimension::Status => row.status.as_str().to_string(),
        GroupDimension::Month => month_label(date.year(), date.month()),
        GroupDimension::Year => date.year().to_string(),
    }
}

/// Filters and groups the dataset in one pass. Groups are sorted by revenue,
/// then lost revenue, then count, then key, and capped at [`MAX_QUERY_GROUPS`].
pub fn run_query(
    rows: &[Opportunity],
    request: &QueryRequest,
    reference: NaiveDate,
) -> Result<QueryResult, QueryError> {
    if request.group_by.is_empty() {
        return Err(QueryError::EmptyGroupBy);
    }
    let mut dimensions = Vec::with_capacity(request.group_by.len());
    for name in &request.group_by {
        let dim = GroupDimension::parse(name)
            .ok_or_else(|| QueryError::UnknownDimension(name.clone()))?;
        dimensions.push(dim);
    }

    let filters = &request.filters;
    let status_filter = match &filters.status {
        Some(raw) => Some(
            OpportunityStatus::parse_wire(raw)
                .ok_or_else(|| QueryError::InvalidStatus(raw.clone()))?,
        ),
        None => None,
    };
    if let Some(month) = filters.month {
        if !(1..=12).contains(&month) {
            return Err(QueryError::InvalidMonth(month));
        }
    }
    let year_filter = filters.year.or_else(|| filters.month.map(|_| reference.year()));
    let use_closed = status_filter == Some(OpportunityStatus::Won);

    let seller_needle = lowered(&filters.seller);
    let source_needle = lowered(&filters.lead_source);
    let funnel_needle = lowered(&filters.funnel);
    let region_needle = lowered(&filters.region);
    let product_needle = lowered(&filters.product);

    let mut groups: BTreeMap<String, QueryBucket> = BTreeMap::new();
    for row in rows {
        if let Some(status) = status_filter {
            if row.status != status {
                continue;
            }
        }
        if !substring_matches(&seller_needle, &row.seller)
            || !substring_matches(&source_needle, &row.lead_source)
            || !substring_matches(&funnel_needle, &row.funnel)
            || !substring_matches(&region_needle, &row.region_code)
            || !substring_matches(&product_needle, &row.product)
        {
            continue;
        }
        let date = resolved_date(row, use_closed);
        if let Some(year) = year_filter {
            if date.year() != year {
                continue;
            }
        }
        if let Some(month) = filters.month {
            if date.month() != month {
                continue;
            }
        }

        let key = dimensions
            .iter()
            .map(|dim| project(row, *dim, date))
            .collect::<Vec<_>>()
            .join(" | ");
        let bucket = groups.entry(key).or_default();
        bucket.count += 1;
        bucket.revenue += row.amount;
        match row.status {
            OpportunityStatus::Won => {
                bucket.won += 1;
                bucket.won_revenue += row.amount;
            }
            OpportunityStatus::Lost => {
                bucket.lost += 1;
                bucket.lost_revenue += row.amount;
            }
            OpportunityStatus::Open => {}
        }
    }

    let total_groups = groups.len();
    let mut out: Vec<QueryRow> = groups
        .into_iter()
        .map(|(group, bucket)| QueryRow {
            group,
            count: bucket.count,
            revenue: bucket.revenue,
            won: bucket.won,
            lost: bucket.lost,
            won_revenue: bucket.won_revenue,
            lost_revenue: bucket.lost_revenue,
        })
        .collect();
    out.sort_by(|a, b| {
        b.revenue
            .partial_cmp(&a.revenue)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.lost_revenue
                    .partial_cmp(&a.lost_revenue)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.group.cmp(&b.group))
    });
    let truncated = out.len() > MAX_QUERY_GROUPS;
    out.truncate(MAX_QUERY_GROUPS);
    Ok(QueryResult {
        rows: out,
        total_groups,
        truncated,
    })
}
