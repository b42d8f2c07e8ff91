//! Cleaning of the National Drug Monitor incident tables.
//!
//! Every report year prints its incident table with a slightly different
//! layout. The extracted CSVs have one row per statistic and one column per
//! reporting origin; cleaning transposes them, strips units, and then applies
//! the per-year [`YearQuirk`]s before the positional column renames.

use crate::catalog::{DataLayout, ReportKind};
use crate::clean::{load_json, load_json_opt};
use crate::error::{PipelineError, StageError};
use crate::output::{Stage, StageReport};
use crate::table::{format_number, parse_number, to_int_or_zero, Table};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// `year → substance → raw CSV file`, in report order.
pub type Datasets = IndexMap<u16, IndexMap<String, String>>;

/// `year → column position → column name`.
pub type ColumnMappings = BTreeMap<u16, BTreeMap<usize, String>>;

static SPACED_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)\s+(\d)").unwrap());
static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(\.\d+)?").unwrap());

// ── Settings ─────────────────────────────────────────────────────────────

/// Overwrite one cell of the first (origin) column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstColumnOverride {
    pub row: usize,
    pub value: String,
    /// Substances the override does not apply to.
    #[serde(default)]
    pub except: Vec<String>,
}

/// Column moves and drops for some substances of a year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstanceRule {
    pub substances: Vec<String>,
    #[serde(default)]
    pub move_to_end: Vec<String>,
    /// Column positions to drop, counted before any removal.
    #[serde(default)]
    pub drop_positions: Vec<usize>,
}

/// Layout fixes for a set of report years.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct YearQuirk {
    pub years: Vec<u16>,
    #[serde(default)]
    pub drop_columns_containing: Vec<String>,
    /// Name empty headers `Unnamed_{position}`.
    #[serde(default)]
    pub name_unnamed_columns: bool,
    #[serde(default)]
    pub first_column_overrides: Vec<FirstColumnOverride>,
    #[serde(default)]
    pub substance_rules: Vec<SubstanceRule>,
    /// The `year` column takes the row labels instead of the report year.
    #[serde(default)]
    pub year_from_index: bool,
    /// Add an `origin` column from the row labels.
    #[serde(default)]
    pub origin_from_index: bool,
}

impl YearQuirk {
    fn applies(&self, year: u16) -> bool {
        self.years.contains(&year)
    }
}

/// Replace `column` by `100 - value` for one drug and year; a result of
/// 100 means the value was missing and is cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplementFix {
    pub drug: String,
    pub year: String,
    pub column: String,
}

/// Set a cell of the concatenated table by row position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointCellFix {
    pub row: usize,
    pub column: String,
    pub value: String,
}

/// Set `column` on every row matching origin, drug and year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueCorrection {
    pub origin: String,
    pub drug: String,
    pub year: String,
    pub column: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NationalCleaningPlan {
    /// Dataset listing, relative to the settings directory.
    pub datasets_file: String,
    /// Positional renames, relative to the settings directory. Optional.
    pub column_mapping_file: String,
    /// Tables from this year on could not be extracted.
    pub scanned_before: u16,
    /// Tables of later years are read from the next year's report.
    pub next_edition_after: u16,
    pub skip_substances: Vec<String>,
    pub quirks: Vec<YearQuirk>,
    pub complements: Vec<ComplementFix>,
    pub joint_cell_fixes: Vec<JointCellFix>,
    pub corrections: Vec<ValueCorrection>,
    /// Raw CSV directories holding hand-made tables.
    pub handmade_years: Vec<u16>,
    pub origin_mapping: IndexMap<String, String>,
    pub drop_years: Vec<u16>,
}

impl Default for NationalCleaningPlan {
    fn default() -> Self {
        Self::builtin()
    }
}

fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn overrides(v: &[(usize, &str)]) -> Vec<FirstColumnOverride> {
    v.iter()
        .map(|&(row, value)| FirstColumnOverride {
            row,
            value: value.into(),
            except: Vec::new(),
        })
        .collect()
}

impl NationalCleaningPlan {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        load_json(path)
    }

    /// Quirks of the 2010-2019 reports.
    pub fn builtin() -> Self {
        let mut ehbo = overrides(&[(0, "Ambulances"), (4, "EHBO-posten")]);
        ehbo[1].except = names(&["Opioids"]);

        let quirks = vec![
            YearQuirk {
                years: vec![2010],
                year_from_index: true,
                ..Default::default()
            },
            YearQuirk {
                years: vec![2011],
                drop_columns_containing: names(&["lcohol"]),
                ..Default::default()
            },
            YearQuirk {
                years: (2011..=2014).collect(),
                origin_from_index: true,
                ..Default::default()
            },
            YearQuirk {
                years: vec![2014, 2015, 2016, 2019],
                name_unnamed_columns: true,
                ..Default::default()
            },
            YearQuirk {
                years: (2015..=2019).collect(),
                first_column_overrides: overrides(&[
                    (1, "SEH-MDI-ziekenhuizen"),
                    (2, "SEH-LIS-ziekenhuizen"),
                ]),
                ..Default::default()
            },
            YearQuirk {
                years: vec![2018, 2019],
                first_column_overrides: overrides(&[(3, "Forensisch artsen")]),
                ..Default::default()
            },
            YearQuirk {
                years: vec![2019],
                first_column_overrides: ehbo,
                substance_rules: vec![
                    SubstanceRule {
                        substances: names(&["Cocaine"]),
                        move_to_end: names(&["Ook alcohol gebruikt (%)"]),
                        drop_positions: Vec::new(),
                    },
                    SubstanceRule {
                        substances: names(&["MDMA", "Opioids"]),
                        move_to_end: Vec::new(),
                        drop_positions: vec![1],
                    },
                    SubstanceRule {
                        substances: names(&["GHB"]),
                        move_to_end: Vec::new(),
                        drop_positions: vec![1, 2],
                    },
                ],
                ..Default::default()
            },
        ];

        let origin_mapping = [
            ("Ziekenhuizen", "SEH-MDI-ziekenhuizen"),
            ("Totaa", "Totaal"),
            ("EHB", "EHBO-posten"),
            ("EHBO", "EHBO-posten"),
            ("Politieartsen", "Politieartsen/Forensisch artsen"),
            ("Forensisch artsen", "Politieartsen/Forensisch artsen"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            datasets_file: "incidents_datasets.json".into(),
            column_mapping_file: "incidents_columns_mapping.json".into(),
            scanned_before: 2020,
            next_edition_after: 2013,
            skip_substances: names(&["Ketamine"]),
            quirks,
            complements: vec![ComplementFix {
                drug: "Opioids".into(),
                year: "2013".into(),
                column: "below_25_pcnt".into(),
            }],
            joint_cell_fixes: vec![JointCellFix {
                row: 57,
                column: "median_age".into(),
                value: "22".into(),
            }],
            corrections: vec![ValueCorrection {
                origin: "EHB".into(),
                drug: "MDMA".into(),
                year: "2012".into(),
                column: "incidents".into(),
                value: "2215".into(),
            }],
            handmade_years: vec![2021, 2022, 2023],
            origin_mapping,
            drop_years: vec![2020],
        }
    }

    /// Year of the report a table for `year` is printed in.
    pub fn edition_year(&self, year: u16) -> u16 {
        if year > self.next_edition_after {
            year + 1
        } else {
            year
        }
    }
}

// ── Single table ─────────────────────────────────────────────────────────

fn clean_value(cell: &str) -> String {
    let stripped = cell.replace('%', "").replace(" jaar", "");
    let joined = SPACED_DIGITS.replace_all(&stripped, "$1$2");
    match FIRST_NUMBER.find(&joined) {
        Some(m) => m.as_str().to_string(),
        None => joined.into_owned(),
    }
}

/// Clean one raw incident table of `year` for `substance`.
pub fn clean_incident_table(
    table: Table,
    year: u16,
    substance: &str,
    mapping: &ColumnMappings,
    quirks: &[YearQuirk],
) -> Result<Table, PipelineError> {
    let (mut df, index) = table.transpose();
    df.drop_empty_columns();
    df.map_cells(clean_value);

    let active: Vec<&YearQuirk> = quirks.iter().filter(|q| q.applies(year)).collect();

    for q in &active {
        if q.drop_columns_containing.is_empty() {
            continue;
        }
        let doomed: Vec<String> = df
            .header()
            .iter()
            .filter(|h| q.drop_columns_containing.iter().any(|p| h.contains(p.as_str())))
            .cloned()
            .collect();
        let doomed: Vec<&str> = doomed.iter().map(String::as_str).collect();
        df.remove_columns(&doomed);
    }

    if active.iter().any(|q| q.name_unnamed_columns) {
        let unnamed: Vec<usize> = df
            .header()
            .iter()
            .enumerate()
            .filter(|(_, h)| h.trim().is_empty())
            .map(|(i, _)| i)
            .collect();
        for i in unnamed {
            df.rename_at(i, format!("Unnamed_{i}"));
        }
    }

    for q in &active {
        for o in &q.first_column_overrides {
            if !o.except.iter().any(|s| s == substance) {
                df.set_cell(o.row, 0, o.value.clone())?;
            }
        }
    }

    for rule in active
        .iter()
        .flat_map(|q| &q.substance_rules)
        .filter(|r| r.substances.iter().any(|s| s == substance))
    {
        for column in &rule.move_to_end {
            df.move_to_end(column)?;
        }
        for &pos in rule.drop_positions.iter().rev() {
            df.remove_at(pos);
        }
    }

    if let Some(positions) = mapping.get(&year) {
        let width = df.width();
        for (&pos, name) in positions.iter().filter(|(&p, _)| p < width) {
            df.rename_at(pos, name.clone());
        }
    }

    let rows = df.len();
    let year_values = if active.iter().any(|q| q.year_from_index) {
        index.clone()
    } else {
        vec![year.to_string(); rows]
    };
    df.set_column("year", year_values);
    if active.iter().any(|q| q.origin_from_index) {
        df.set_column("origin", index);
    }
    df.set_column("drug", vec![substance.to_string(); rows]);
    Ok(df)
}

// ── Report years ─────────────────────────────────────────────────────────

fn is_row(table: &Table, row: &[String], column: &str, value: &str) -> bool {
    table
        .column_index(column)
        .map(|i| row[i] == value)
        .unwrap_or(false)
}

/// Apply the complement quirks to the concatenated table.
fn apply_complements(table: &mut Table, fixes: &[ComplementFix]) -> Result<(), PipelineError> {
    for fix in fixes {
        if !table.has_column(&fix.column) {
            continue;
        }
        let selected: Vec<bool> = table
            .rows()
            .iter()
            .map(|r| is_row(table, r, "drug", &fix.drug) && is_row(table, r, "year", &fix.year))
            .collect();
        table.map_column(&fix.column, |i, v| {
            if !selected[i] {
                return v.to_string();
            }
            match 100 - to_int_or_zero(v) {
                100 => String::new(),
                n => n.to_string(),
            }
        })?;
    }
    Ok(())
}

fn apply_joint_fixes(table: &mut Table, fixes: &[JointCellFix]) -> Result<(), PipelineError> {
    for fix in fixes {
        if fix.row >= table.len() {
            warn!(
                "Cell fix for row {} skipped: the joint table has {} rows",
                fix.row,
                table.len()
            );
            continue;
        }
        if !table.has_column(&fix.column) {
            table.push_column(fix.column.clone(), Vec::new());
        }
        let col = table.require_column(&fix.column)?;
        table.set_cell(fix.row, col, fix.value.clone())?;
    }
    Ok(())
}

/// Clean and concatenate every listed dataset.
///
/// A dataset that cannot be read or cleaned is reported and left out.
pub fn clean_national_reports(
    datasets: &Datasets,
    layout: &DataLayout,
    mapping: &ColumnMappings,
    plan: &NationalCleaningPlan,
) -> Result<(Table, Vec<StageError>), PipelineError> {
    let mut tables = Vec::new();
    let mut errors = Vec::new();

    for (&year, substances) in datasets {
        let dir = layout.raw_csv_dir(ReportKind::National, plan.edition_year(year));
        for (substance, file) in substances {
            if plan.skip_substances.contains(substance) {
                continue;
            }
            let path = dir.join(file);
            let cleaned = Table::read_csv(&path).and_then(|t| {
                clean_incident_table(t, year, substance, mapping, &plan.quirks)
            });
            match cleaned {
                Ok(t) => {
                    debug!("{} {}: {} rows", year, substance, t.len());
                    tables.push(t);
                }
                Err(PipelineError::FileNotFound { path }) => {
                    warn!("{} {}: {} missing", year, substance, path.display());
                    errors.push(StageError::MissingInput { year, path });
                }
                Err(e) => {
                    warn!("{} {}: {}", year, substance, e);
                    errors.push(StageError::YearFailed {
                        year,
                        detail: format!("{substance} ({file}): {e}"),
                    });
                }
            }
        }
    }

    let mut joint = Table::concat("national_reports", &tables);
    apply_joint_fixes(&mut joint, &plan.joint_cell_fixes)?;
    apply_complements(&mut joint, &plan.complements)?;
    Ok((joint, errors))
}

/// Concatenate every `.csv` in `dir`, in file-name order.
pub fn load_and_append_csvs(dir: &Path) -> Result<Table, PipelineError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::FileNotFound {
                path: dir.to_path_buf(),
            }
        } else {
            PipelineError::ReadFailed {
                path: dir.to_path_buf(),
                source: e,
            }
        }
    })?;
    let mut files: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|x| x == "csv"))
        .collect();
    files.sort();

    let tables = files
        .iter()
        .map(|p| Table::read_csv(p))
        .collect::<Result<Vec<_>, _>>()?;
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Table::concat(name, &tables))
}

/// Normalize origins and sum `incidents` per `(year, origin, drug)`.
///
/// Groups keep first-seen order. A group with no numeric incident count
/// gets an empty total.
pub fn yearly_incidents(
    table: &Table,
    origin_mapping: &IndexMap<String, String>,
) -> Result<Table, PipelineError> {
    let year = table.require_column("year")?;
    let origin = table.require_column("origin")?;
    let drug = table.require_column("drug")?;
    let incidents = table.require_column("incidents")?;

    let mut groups: IndexMap<(String, String, String), Option<f64>> = IndexMap::new();
    for row in table.rows() {
        let y = format_number(parse_number(&row[year]));
        let y = if y.is_empty() { row[year].trim().to_string() } else { y };
        let o = row[origin].trim();
        let o = origin_mapping.get(o).map(String::as_str).unwrap_or(o).to_string();
        let d = row[drug].trim().to_string();

        let total = groups.entry((y, o, d)).or_insert(None);
        if let Some(n) = parse_number(&row[incidents]) {
            *total = Some(total.unwrap_or(0.0) + n);
        }
    }

    let mut out = Table::new(
        "yearly_incidents",
        names(&["year", "origin", "drug", "incidents"]),
    );
    for ((y, o, d), total) in groups {
        out.push_row(vec![y, o, d, format_number(total)]);
    }
    Ok(out)
}

fn apply_corrections(table: &mut Table, corrections: &[ValueCorrection]) -> Result<(), PipelineError> {
    for c in corrections {
        if !table.has_column(&c.column) {
            continue;
        }
        let selected: Vec<bool> = table
            .rows()
            .iter()
            .map(|r| {
                is_row(table, r, "origin", &c.origin)
                    && is_row(table, r, "drug", &c.drug)
                    && is_row(table, r, "year", &c.year)
            })
            .collect();
        table.map_column(&c.column, |i, v| {
            if selected[i] {
                c.value.clone()
            } else {
                v.to_string()
            }
        })?;
    }
    Ok(())
}

/// Build `joint_incidents.csv` from the cleaned report tables and the
/// hand-made tables of the years that could not be extracted.
///
/// `settings_dir` holds the dataset listing and the optional column mapping.
pub fn build_joint_incidents(
    layout: &DataLayout,
    settings_dir: &Path,
    plan: &NationalCleaningPlan,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let mut report = StageReport::new(Stage::Clean, Some(ReportKind::National));

    let mut datasets: Datasets = load_json(&settings_dir.join(&plan.datasets_file))?;
    datasets.retain(|&year, _| year < plan.scanned_before);
    let mapping: ColumnMappings =
        load_json_opt(&settings_dir.join(&plan.column_mapping_file))?.unwrap_or_default();
    info!(
        "Cleaning {} National report years from {}",
        datasets.len(),
        layout.root().display()
    );

    let (mut scanned, errors) = clean_national_reports(&datasets, layout, &mapping, plan)?;
    report.errors.extend(errors);
    apply_corrections(&mut scanned, &plan.corrections)?;
    report.years_processed.extend(datasets.keys().copied());

    let mut parts = vec![scanned];
    for &year in &plan.handmade_years {
        let dir = layout.raw_csv_dir(ReportKind::National, year);
        match load_and_append_csvs(&dir) {
            Ok(t) => parts.push(t),
            Err(PipelineError::FileNotFound { path }) => {
                report.skip(year, StageError::MissingInput { year, path })
            }
            Err(e) => report.fail(StageError::for_year(year, &e)),
        }
    }

    let joint = Table::concat("joint_incidents", &parts);
    let mut incidents = yearly_incidents(&joint, &plan.origin_mapping)?;
    let dropped: Vec<String> = plan.drop_years.iter().map(u16::to_string).collect();
    incidents.retain_rows(|r| !dropped.contains(&r[0]));

    let out = layout
        .processed_dir(ReportKind::National)
        .join("joint_incidents.csv");
    incidents.write_csv(&out)?;
    info!("{} incident rows written to {}", incidents.len(), out.display());
    report.files_written.push(out);
    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}
