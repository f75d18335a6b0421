//! Spreadsheet ingestion: header aliasing, value normalization and batched upserts.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use encoding_rs::WINDOWS_1252;
use funil_core::{
    IngestReport, Opportunity, OpportunityDraft, OpportunityStatus, RawRecord, UnmappedHeader,
    DEFAULT_CITY, DEFAULT_CUSTOMER_NAME, DEFAULT_FUNNEL, DEFAULT_LEAD_SOURCE, DEFAULT_LOSS_REASON,
    DEFAULT_PRODUCT, DEFAULT_REGION_CODE, DEFAULT_SELLER, DEFAULT_STAGE,
};
use funil_store::{RowStore, StoreError, DEFAULT_PAGE_SIZE};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "funil-ingest";

/// Rows sent to the store per upsert call.
pub const UPSERT_BATCH_SIZE: usize = 500;

/// Minimum Jaro-Winkler similarity before an unmapped header gets a hint.
const HINT_SIMILARITY_FLOOR: f64 = 0.85;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid upload: {0}")]
    Input(String),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Canonical opportunity fields a spreadsheet column can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CanonicalField {
    Seller,
    Funnel,
    Stage,
    Status,
    Amount,
    CreatedAt,
    ClosedAt,
    LeadSource,
    CustomerName,
    Region,
    City,
    Product,
    LossReason,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 13] = [
        CanonicalField::Seller,
        CanonicalField::Funnel,
        CanonicalField::Stage,
        CanonicalField::Status,
        CanonicalField::Amount,
        CanonicalField::CreatedAt,
        CanonicalField::ClosedAt,
        CanonicalField::LeadSource,
        CanonicalField::CustomerName,
        CanonicalField::Region,
        CanonicalField::City,
        CanonicalField::Product,
        CanonicalField::LossReason,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Seller => "seller",
            Self::Funnel => "funnel",
            Self::Stage => "stage",
            Self::Status => "status",
            Self::Amount => "amount",
            Self::CreatedAt => "created_at",
            Self::ClosedAt => "closed_at",
            Self::LeadSource => "lead_source",
            Self::CustomerName => "customer_name",
            Self::Region => "region",
            Self::City => "city",
            Self::Product => "product",
            Self::LossReason => "loss_reason",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.name() == name.trim().to_lowercase())
    }
}

const BUILTIN_ALIASES: &[(CanonicalField, &[&str])] = &[
    (
        CanonicalField::Seller,
        &["vendedor", "responsável", "responsavel", "vendedor responsável", "proprietário", "owner", "seller"],
    ),
    (CanonicalField::Funnel, &["funil", "funil de vendas", "pipeline"]),
    (CanonicalField::Stage, &["etapa", "fase", "estágio", "estagio", "stage", "step"]),
    (
        CanonicalField::Status,
        &["status", "situação", "situacao", "status da oportunidade", "resultado"],
    ),
    (
        CanonicalField::Amount,
        &["valor", "valor da oportunidade", "valor total", "valor do negócio", "receita", "preço", "preco", "amount"],
    ),
    (
        CanonicalField::CreatedAt,
        &["data de criação", "data de criacao", "data_criacao", "criado em", "data de cadastro", "created at", "data"],
    ),
    (
        CanonicalField::ClosedAt,
        &["data de fechamento", "data_fechamento", "fechado em", "data de conclusão", "data de conclusao", "closed at"],
    ),
    (
        CanonicalField::LeadSource,
        &["origem", "origem do lead", "fonte", "canal", "lead source", "source"],
    ),
    (
        CanonicalField::CustomerName,
        &["cliente", "nome do cliente", "empresa", "contato", "nome", "customer"],
    ),
    (CanonicalField::Region, &["estado", "uf", "região", "regiao", "state"]),
    (CanonicalField::City, &["cidade", "município", "municipio", "city"]),
    (CanonicalField::Product, &["produto", "serviço", "servico", "plano", "product"]),
    (
        CanonicalField::LossReason,
        &["motivo da perda", "motivo de perda", "motivo_perda", "motivo", "loss reason"],
    ),
];

#[derive(Debug, Clone, Deserialize)]
struct AliasOverrides {
    #[serde(default)]
    aliases: BTreeMap<String, Vec<String>>,
}

/// Ordered header aliases per canonical field. Earlier aliases win, so
/// deployment overrides are prepended ahead of the built-in vocabulary.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: BTreeMap<CanonicalField, Vec<String>>,
}

impl Default for AliasTable {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        for (field, aliases) in BUILTIN_ALIASES {
            entries.insert(*field, aliases.iter().map(|a| a.to_string()).collect());
        }
        Self { entries }
    }
}

impl AliasTable {
    /// Returns the first non-empty cell matching the field's aliases in order.
    /// Header comparison trims and lowercases both sides; an empty cell is
    /// treated as absent and the search moves on to the next alias.
    pub fn resolve<'a>(&self, record: &'a RawRecord, field: CanonicalField) -> Option<&'a str> {
        let aliases = self.entries.get(&field)?;
        for alias in aliases {
            let hit = record
                .iter()
                .find(|(header, _)| header.trim().to_lowercase() == *alias);
            if let Some((_, value)) = hit {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        None
    }

    pub fn known_alias(&self, header: &str) -> bool {
        let needle = header.trim().to_lowercase();
        self.entries.values().flatten().any(|alias| *alias == needle)
    }

    /// Closest alias across all fields, if similar enough to be worth showing.
    pub fn closest_alias(&self, header: &str) -> Option<String> {
        let needle = header.trim().to_lowercase();
        let mut best: Option<(f64, &str)> = None;
        for alias in self.entries.values().flatten() {
            let score = strsim::jaro_winkler(&needle, alias);
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, alias));
            }
        }
        best.filter(|(score, _)| *score >= HINT_SIMILARITY_FLOOR)
            .map(|(_, alias)| alias.to_string())
    }

    fn prepend(&mut self, field: CanonicalField, aliases: &[String]) {
        let entry = self.entries.entry(field).or_default();
        for alias in aliases.iter().rev() {
            let alias = alias.trim().to_lowercase();
            if alias.is_empty() {
                continue;
            }
            entry.retain(|existing| *existing != alias);
            entry.insert(0, alias);
        }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let overrides: AliasOverrides =
            serde_yaml::from_str(text).context("parsing alias overrides yaml")?;
        let mut table = Self::default();
        for (name, aliases) in &overrides.aliases {
            let field = CanonicalField::parse(name)
                .ok_or_else(|| anyhow!("unknown canonical field {name:?} in alias overrides"))?;
            table.prepend(field, aliases);
        }
        Ok(table)
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading alias overrides from {}", path.display()))?;
        Self::from_yaml_str(&text)
    }
}

/// Parses monetary text like `R$ 1.234,56` into a float. Never errors:
/// anything non-numeric comes back as 0.
pub fn parse_currency_amount(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    let cleaned = cleaned.replace('.', "").replace(',', ".");
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => value,
        _ => 0.0,
    }
}

/// Parses `DD/MM/YYYY` dates, with an ISO `YYYY-MM-DD` fast path for values
/// containing `-`. Placeholder cells (`00/00/0000`, spreadsheet `#` overflow,
/// blanks) and impossible calendar dates come back as `None`.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains('#') || trimmed == "00/00/0000" {
        return None;
    }
    if trimmed.contains('-') {
        let head: String = trimmed.chars().take(10).collect();
        return NaiveDate::parse_from_str(&head, "%Y-%m-%d").ok();
    }
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    let day: u32 = parts[0].trim().parse().ok()?;
    let month: u32 = parts[1].trim().parse().ok()?;
    let year: i32 = parts[2].trim().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

const WON_KEYWORDS: [&str; 4] = ["ganha", "conquistado", "fechado", "vendido"];
const LOST_KEYWORDS: [&str; 4] = ["perdida", "perdido", "lost", "desqualificado"];

/// Collapses free-text vendor statuses. Won keywords are checked first, so a
/// cell matching both families resolves as won.
pub fn normalize_status(raw: Option<&str>) -> OpportunityStatus {
    let Some(raw) = raw else {
        return OpportunityStatus::Open;
    };
    let lower = raw.to_lowercase();
    if WON_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return OpportunityStatus::Won;
    }
    if LOST_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return OpportunityStatus::Lost;
    }
    OpportunityStatus::Open
}

/// Uppercases the matched value and keeps the first two characters, so both
/// `sp` and full state names land on a two-character code. Absent values
/// become `NA`.
pub fn normalize_region_code(raw: Option<&str>) -> String {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => value.chars().flat_map(char::to_uppercase).take(2).collect(),
        None => DEFAULT_REGION_CODE.to_string(),
    }
}

fn start_of_day_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Maps one raw row onto a normalized draft. Missing or unparsable fields take
/// documented defaults; an unreadable creation date takes the batch timestamp.
#[derive(Debug)]
pub struct RowNormalizer {
    aliases: AliasTable,
}

impl RowNormalizer {
    pub fn new(aliases: AliasTable) -> Self {
        Self { aliases }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn normalize(&self, record: &RawRecord, ingested_at: DateTime<Utc>) -> OpportunityDraft {
        let text = |field: CanonicalField, default: &str| -> String {
            self.aliases
                .resolve(record, field)
                .map(str::to_string)
                .unwrap_or_else(|| default.to_string())
        };
        let status = normalize_status(self.aliases.resolve(record, CanonicalField::Status));
        let amount = self
            .aliases
            .resolve(record, CanonicalField::Amount)
            .map(parse_currency_amount)
            .unwrap_or(0.0);
        let created_at = self
            .aliases
            .resolve(record, CanonicalField::CreatedAt)
            .and_then(parse_flexible_date)
            .map(start_of_day_utc)
            .unwrap_or(ingested_at);
        let mut closed_at = self
            .aliases
            .resolve(record, CanonicalField::ClosedAt)
            .and_then(parse_flexible_date)
            .map(start_of_day_utc);
        if status == OpportunityStatus::Won && closed_at.is_none() {
            closed_at = Some(created_at);
        }
        OpportunityDraft {
            seller: text(CanonicalField::Seller, DEFAULT_SELLER),
            funnel: text(CanonicalField::Funnel, DEFAULT_FUNNEL),
            stage: text(CanonicalField::Stage, DEFAULT_STAGE),
            status,
            amount,
            created_at,
            closed_at,
            lead_source: text(CanonicalField::LeadSource, DEFAULT_LEAD_SOURCE),
            customer_name: text(CanonicalField::CustomerName, DEFAULT_CUSTOMER_NAME),
            region_code: normalize_region_code(self.aliases.resolve(record, CanonicalField::Region)),
            city: text(CanonicalField::City, DEFAULT_CITY),
            product: text(CanonicalField::Product, DEFAULT_PRODUCT),
            loss_reason: text(CanonicalField::LossReason, DEFAULT_LOSS_REASON),
        }
    }
}

/// Content identity of a row within an account: creation date, customer,
/// amount to two decimals and product. Rows agreeing on these merge on upsert.
pub fn compute_fingerprint(owner_id: Uuid, draft: &OpportunityDraft) -> String {
    let material = [
        owner_id.to_string(),
        draft.created_at.format("%Y-%m-%d").to_string(),
        draft.customer_name.clone(),
        format!("{:.2}", draft.amount),
        draft.product.clone(),
    ]
    .join("|");
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

fn decode_text(bytes: &[u8]) -> Result<String, IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::Input("uploaded file is empty".to_string()));
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => Ok(WINDOWS_1252.decode(bytes).0.into_owned()),
    }
}

fn detect_delimiter(header_line: &str) -> u8 {
    let semicolons = header_line.matches(';').count();
    let commas = header_line.matches(',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn parse_raw_records(text: &str) -> Result<(Vec<String>, Vec<RawRecord>), IngestError> {
    let text = text.trim_start_matches('\u{feff}');
    let header_line = text
        .lines()
        .next()
        .ok_or_else(|| IngestError::Input("uploaded file has no header row".to_string()))?;
    let delimiter = detect_delimiter(header_line);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| IngestError::Input(format!("unreadable header row: {err}")))?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestError::Input("header row is empty".to_string()));
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "skipping unparsable row");
                continue;
            }
        };
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let mut row = RawRecord::new();
        for (idx, header) in headers.iter().enumerate() {
            if header.trim().is_empty() {
                continue;
            }
            if let Some(cell) = record.get(idx) {
                row.insert(header.clone(), cell.to_string());
            }
        }
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(IngestError::Input("no data rows after the header".to_string()));
    }
    Ok((headers, rows))
}

fn collect_unmapped_headers(aliases: &AliasTable, headers: &[String]) -> Vec<UnmappedHeader> {
    headers
        .iter()
        .filter(|h| !h.trim().is_empty())
        .filter(|h| !aliases.known_alias(h))
        .map(|h| UnmappedHeader {
            header: h.clone(),
            hint: aliases.closest_alias(h),
        })
        .collect()
}

/// A finished ingestion run: the caller-facing report plus the account's full
/// dataset reloaded from the store.
#[derive(Debug)]
pub struct IngestOutcome {
    pub report: IngestReport,
    pub dataset: Vec<Opportunity>,
}

/// Orchestrates one upload end to end: decode, parse, normalize, collapse
/// duplicates, persist in batches and reload the account.
#[derive(Debug)]
pub struct IngestPipeline {
    normalizer: RowNormalizer,
}

impl IngestPipeline {
    pub fn new(aliases: AliasTable) -> Self {
        Self {
            normalizer: RowNormalizer::new(aliases),
        }
    }

    pub fn aliases(&self) -> &AliasTable {
        self.normalizer.aliases()
    }

    pub async fn run(
        &self,
        store: &dyn RowStore,
        owner_id: Uuid,
        file_bytes: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        let ingested_at = Utc::now();
        let text = decode_text(file_bytes)?;
        let (headers, raw_rows) = parse_raw_records(&text)?;
        let parsed_rows = raw_rows.len();

        let span = info_span!("normalize_rows", %owner_id, rows = parsed_rows);
        let (batch, duplicates_collapsed, invalid_rows) = span.in_scope(|| {
            let mut ordered: Vec<Opportunity> = Vec::new();
            let mut slot_by_fingerprint: HashMap<String, usize> = HashMap::new();
            let mut duplicates = 0usize;
            for raw in &raw_rows {
                let draft = self.normalizer.normalize(raw, ingested_at);
                let fingerprint = compute_fingerprint(owner_id, &draft);
                let opp = Opportunity::from_draft(owner_id, fingerprint, draft);
                match slot_by_fingerprint.entry(opp.fingerprint.clone()) {
                    Entry::Occupied(slot) => {
                        duplicates += 1;
                        ordered[*slot.get()] = opp;
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(ordered.len());
                        ordered.push(opp);
                    }
                }
            }
            let before = ordered.len();
            ordered.retain(|opp| opp.amount >= 0.0);
            let invalid = before - ordered.len();
            (ordered, duplicates, invalid)
        });
        if duplicates_collapsed > 0 {
            warn!(
                %owner_id,
                collapsed = duplicates_collapsed,
                "rows with identical fingerprints collapsed, later rows won"
            );
        }

        let unmapped_headers = collect_unmapped_headers(self.aliases(), &headers);
        let accepted = batch.len();
        for chunk in batch.chunks(UPSERT_BATCH_SIZE) {
            store.upsert_batch(chunk).await?;
        }
        let dataset = store.fetch_all(owner_id, DEFAULT_PAGE_SIZE).await?;
        info!(
            %owner_id,
            parsed_rows,
            accepted,
            stored_total = dataset.len(),
            "ingestion run complete"
        );
        Ok(IngestOutcome {
            report: IngestReport {
                parsed_rows,
                accepted,
                duplicates_collapsed,
                invalid_rows,
                unmapped_headers,
                stored_total: dataset.len(),
            },
            dataset,
        })
    }
}
