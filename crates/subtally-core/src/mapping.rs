//! Code Mapping Table: billing code to commercial service.
//!
//! The source is `MASTERCPC.csv`, one row per service pricing pair:
//!
//! ```text
//! Service Name,TME Category,Free_CPC,Free_Period,Upgrade_CPC,CHG_Period,CHG_Price,CPCs
//! Music Plus,MUSIC,100,Monthly,101,Monthly,4.99,"{100, 101}"
//! ```
//!
//! `CPCs` lists the row's codes in brace notation; `Upgrade_CPC` is folded
//! into the same set. After expansion each code resolves to exactly one
//! service. When a code appears in several rows the last row wins.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::source::decode_text;

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("failed to read code mapping {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse code mapping {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("code mapping {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: &'static str },
}

impl MappingError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::MappingUnreadable
    }
}

const COL_SERVICE: &str = "Service Name";
const COL_CATEGORY: &str = "TME Category";
const COL_FREE_CPC: &str = "Free_CPC";
const COL_FREE_PERIOD: &str = "Free_Period";
const COL_UPGRADE_CPC: &str = "Upgrade_CPC";
const COL_CHG_PERIOD: &str = "CHG_Period";
const COL_CHG_PRICE: &str = "CHG_Price";
const COL_CPCS: &str = "CPCs";

/// Static service attributes attached to every code of a service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub service_name: String,
    pub tme_category: String,
    pub free_cpc: i64,
    pub free_period: i64,
    pub upgrade_cpc: i64,
    pub chg_period: i64,
    pub chg_price: f64,
}

impl ServiceInfo {
    /// Sentinel attributes for a code the table does not know.
    #[must_use]
    pub fn unknown(name: &str) -> Self {
        Self {
            service_name: name.to_string(),
            tme_category: String::new(),
            free_cpc: 0,
            free_period: 0,
            upgrade_cpc: 0,
            chg_period: 0,
            chg_price: 0.0,
        }
    }
}

/// One expanded `(code, service)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeMappingEntry {
    pub cpc: i64,
    pub service: ServiceInfo,
}

/// Expanded mapping from billing code to service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeMapping {
    by_code: BTreeMap<i64, ServiceInfo>,
}

impl CodeMapping {
    /// Load and expand the mapping file at `path`. Rows with an empty service
    /// name are attributed to `unknown_name`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] if the file cannot be read, is not valid CSV,
    /// or lacks the `CPCs` and `Service Name` columns.
    pub fn load(path: &Path, unknown_name: &str) -> Result<Self, MappingError> {
        let bytes = fs::read(path).map_err(|source| MappingError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let (text, _) = decode_text(bytes);
        let mapping = Self::parse(&text, unknown_name).map_err(|err| match err {
            ParseError::Csv(source) => MappingError::Csv {
                path: path.to_path_buf(),
                source,
            },
            ParseError::MissingColumn(column) => MappingError::MissingColumn {
                path: path.to_path_buf(),
                column,
            },
        })?;
        info!(
            path = %path.display(),
            codes = mapping.len(),
            "loaded code mapping"
        );
        Ok(mapping)
    }

    fn parse(text: &str, unknown_name: &str) -> Result<Self, ParseError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let header = reader.headers().map_err(ParseError::Csv)?.clone();
        let index = |name: &str| header.iter().position(|h| h.eq_ignore_ascii_case(name));
        let cpcs_at = index(COL_CPCS).ok_or(ParseError::MissingColumn(COL_CPCS))?;
        let service_at = index(COL_SERVICE).ok_or(ParseError::MissingColumn(COL_SERVICE))?;
        let category_at = index(COL_CATEGORY);
        let free_cpc_at = index(COL_FREE_CPC);
        let free_period_at = index(COL_FREE_PERIOD);
        let upgrade_at = index(COL_UPGRADE_CPC);
        let chg_period_at = index(COL_CHG_PERIOD);
        let chg_price_at = index(COL_CHG_PRICE);

        let mut by_code = BTreeMap::new();
        let mut overridden = 0usize;
        for (line, row) in reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    debug!(line = line + 2, error = %err, "skipping malformed mapping row");
                    continue;
                }
            };
            let cell = |at: Option<usize>| at.and_then(|i| row.get(i)).unwrap_or("");

            let service_name = match cell(Some(service_at)) {
                "" => unknown_name.to_string(),
                name => name.to_string(),
            };
            let upgrade_cpc = parse_code(cell(upgrade_at));
            let info = ServiceInfo {
                service_name,
                tme_category: cell(category_at).to_string(),
                free_cpc: parse_code(cell(free_cpc_at)).unwrap_or(0),
                free_period: period_days(cell(free_period_at)),
                upgrade_cpc: upgrade_cpc.unwrap_or(0),
                chg_period: period_days(cell(chg_period_at)),
                chg_price: cell(chg_price_at).parse::<f64>().ok().filter(|p| p.is_finite()).unwrap_or(0.0),
            };

            let mut codes = expand_codes(cell(Some(cpcs_at)));
            codes.extend(upgrade_cpc);
            codes.sort_unstable();
            codes.dedup();
            for code in codes {
                if by_code.insert(code, info.clone()).is_some() {
                    overridden += 1;
                }
            }
        }
        if overridden > 0 {
            warn!(overridden, "codes listed by more than one mapping row, last row wins");
        }
        Ok(Self { by_code })
    }

    #[must_use]
    pub fn get(&self, cpc: i64) -> Option<&ServiceInfo> {
        self.by_code.get(&cpc)
    }

    #[must_use]
    pub fn contains(&self, cpc: i64) -> bool {
        self.by_code.contains_key(&cpc)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Expanded entries in code order.
    pub fn entries(&self) -> impl Iterator<Item = CodeMappingEntry> + '_ {
        self.by_code.iter().map(|(&cpc, service)| CodeMappingEntry {
            cpc,
            service: service.clone(),
        })
    }
}

impl FromIterator<CodeMappingEntry> for CodeMapping {
    fn from_iter<I: IntoIterator<Item = CodeMappingEntry>>(iter: I) -> Self {
        Self {
            by_code: iter.into_iter().map(|e| (e.cpc, e.service)).collect(),
        }
    }
}

enum ParseError {
    Csv(csv::Error),
    MissingColumn(&'static str),
}

/// Parse a code cell. Spreadsheet exports write integers as `100.0`.
fn parse_code(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let digits = raw.strip_suffix(".0").unwrap_or(raw);
    digits.parse().ok()
}

/// Expand compact code notation: `{100,101}`, `{100.0, 101.0}` or a bare
/// `100`. Unparseable items are ignored.
#[must_use]
pub fn expand_codes(raw: &str) -> Vec<i64> {
    raw.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter_map(parse_code)
        .collect()
}

/// Days covered by a subscription period cell. Numeric cells are taken as
/// days already; words are looked up; anything else is 0.
#[must_use]
pub fn period_days(raw: &str) -> i64 {
    let raw = raw.trim();
    if let Some(days) = parse_code(raw) {
        return days;
    }
    let word = raw.split_whitespace().next().unwrap_or("");
    match word.to_ascii_lowercase().as_str() {
        "monthly" => 30,
        "weekly" => 7,
        "trimonthly" => 90,
        "bimontly" | "bimonthly" => 60,
        "one" => 1,
        _ => 0,
    }
}
