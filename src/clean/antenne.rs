//! Cleaning of the Antenne Amsterdam "testservice" tables.
//!
//! Three table families come out of the yearly report appendix: total
//! samples per substance, dose and price statistics per substance, and
//! purity categories per substance. [`AntenneCleaningPlan::builtin_2023`]
//! describes where each table of the 2023 report landed after extraction
//! and which cells need fixing.

use crate::catalog::{DataLayout, ReportKind};
use crate::clean::load_json;
use crate::error::{PipelineError, StageError};
use crate::output::{Stage, StageReport};
use crate::table::{format_number, parse_number, to_int_or_zero, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

// ── Settings ─────────────────────────────────────────────────────────────

/// Everything needed to clean one report year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntenneCleaningPlan {
    /// Report year; selects the raw CSV directory and names the outputs.
    pub year: u16,
    pub total_samples: TotalSamplesSettings,
    pub doses: DoseSettings,
    pub purity: PuritySettings,
}

impl Default for AntenneCleaningPlan {
    fn default() -> Self {
        Self::builtin_2023()
    }
}

/// A `(row, col, value)` fix applied after the faulty rows are removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellCorrection {
    pub row: usize,
    pub col: usize,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalSamplesSettings {
    pub file: String,
    /// Rows without data, removed first.
    pub faulty_rows: Vec<usize>,
    pub corrections: Vec<CellCorrection>,
    pub column_map: BTreeMap<String, String>,
    /// Columns whose values below 10 lost their thousands separator.
    pub thousands_columns: Vec<String>,
}

/// Source column names shared by every dose table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseColumns {
    pub year: String,
    pub n_samples: String,
    pub n_prices: String,
    pub prices: String,
    pub dosering: String,
}

/// A value fix applied to one column of a dose table before splitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Adjustment {
    /// Add `offset` to values below `below` (all values when absent) and
    /// `otherwise` to the rest.
    Offset {
        column: String,
        offset: f64,
        #[serde(default)]
        below: Option<f64>,
        #[serde(default)]
        otherwise: f64,
    },
    /// Multiply values below `below` by `factor`.
    ScaleBelow {
        column: String,
        below: f64,
        factor: f64,
    },
    /// Append the row's entry of `suffixes` to the value.
    AppendSuffix {
        column: String,
        suffixes: Vec<String>,
    },
}

/// What a price in a dose table is quoted per.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceUnit {
    #[default]
    Gram,
    Pill,
    Tab,
}

/// A column to split into two new columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSpec {
    pub column: String,
    pub into: [String; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstanceDoses {
    pub substance: String,
    pub file: String,
    #[serde(default)]
    pub adjustments: Vec<Adjustment>,
    /// Overrides the default `min-max` and `mean (sd)` splits.
    #[serde(default)]
    pub split_columns: Option<Vec<SplitSpec>>,
    /// Overrides [`DoseColumns::prices`].
    #[serde(default)]
    pub price_column: Option<String>,
    /// Overrides [`DoseColumns::n_prices`].
    #[serde(default)]
    pub n_price_column: Option<String>,
    #[serde(default = "yes")]
    pub has_price: bool,
    #[serde(default)]
    pub unit: PriceUnit,
    #[serde(default)]
    pub drop_columns: Vec<String>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseSettings {
    pub columns: DoseColumns,
    pub substances: Vec<SubstanceDoses>,
}

/// A Dutch purity category and its English column stem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub dutch: String,
    pub english: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstancePurity {
    pub substance: String,
    pub file: String,
    /// Added to the year column (two-digit years).
    #[serde(default)]
    pub year_offset: Option<i64>,
    /// Rows the extraction missed, appended verbatim.
    #[serde(default)]
    pub extra_rows: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuritySettings {
    pub column_map: BTreeMap<String, String>,
    pub translations: Vec<Translation>,
    pub substances: Vec<SubstancePurity>,
}

fn strings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl AntenneCleaningPlan {
    /// Load a plan from JSON.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        load_json(path)
    }

    /// Layout of the 2023 report tables.
    pub fn builtin_2023() -> Self {
        let total_samples = TotalSamplesSettings {
            file: "225_0.csv".into(),
            faulty_rows: vec![0, 4, 16, 28],
            corrections: [(10, 2, "35"), (6, 3, "6"), (10, 3, "39"), (17, 3, "66"), (21, 3, "138"), (28, 3, "291")]
                .iter()
                .map(|&(row, col, value)| CellCorrection {
                    row,
                    col,
                    value: value.into(),
                })
                .collect(),
            column_map: strings(&[
                ("Unnamed: 0", "year"),
                ("Unnamed: 1", "mdma"),
                ("Unnamed: 2", "cocaine"),
                ("overig", "amphetamine"),
                ("Unnamed: 3", "ketamine"),
                ("Unnamed: 4", "2cb"),
                ("Unnamed: 5", "3mmc4mmc"),
                ("Unnamed: 6", "4fa"),
                ("Unnamed: 7", "lsd"),
                ("Unnamed: 8", "ghb"),
                ("Unnamed: 9", "other"),
                ("Unnamed: 10", "unknown"),
                ("Unnamed: 11", "total"),
            ]),
            thousands_columns: vec!["mdma".into(), "total".into()],
        };

        let columns = DoseColumns {
            year: "Unnamed: 0".into(),
            n_samples: "Unnamed: 1".into(),
            n_prices: "Unnamed: 3".into(),
            prices: "Unnamed: 4".into(),
            dosering: "dosering".into(),
        };
        let century = |column: &str| Adjustment::Offset {
            column: column.into(),
            offset: 2000.0,
            below: None,
            otherwise: 0.0,
        };
        let dose = |substance: &str, file: &str| SubstanceDoses {
            substance: substance.into(),
            file: file.into(),
            adjustments: Vec::new(),
            split_columns: None,
            price_column: None,
            n_price_column: None,
            has_price: true,
            unit: PriceUnit::Gram,
            drop_columns: Vec::new(),
        };
        let substances = vec![
            SubstanceDoses {
                adjustments: vec![
                    Adjustment::Offset {
                        column: columns.year.clone(),
                        offset: 2000.0,
                        below: Some(50.0),
                        otherwise: 1000.0,
                    },
                    Adjustment::ScaleBelow {
                        column: columns.n_samples.clone(),
                        below: 10.0,
                        factor: 1000.0,
                    },
                    Adjustment::ScaleBelow {
                        column: columns.n_prices.clone(),
                        below: 10.0,
                        factor: 1000.0,
                    },
                ],
                unit: PriceUnit::Pill,
                ..dose("mdma", "227_2.csv")
            },
            SubstanceDoses {
                adjustments: vec![century(&columns.year)],
                ..dose("cocaine", "229_2.csv")
            },
            dose("amphetamine", "230_2.csv"),
            dose("ketamine", "231_1.csv"),
            SubstanceDoses {
                adjustments: vec![Adjustment::AppendSuffix {
                    column: "Unnamed: 5".into(),
                    suffixes: ["2", "3", "2", "4", "4", "2", "3", "3", "6", "7", "0", "7"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                }],
                price_column: Some("Unnamed: 5".into()),
                n_price_column: Some("Unnamed: 4".into()),
                unit: PriceUnit::Pill,
                drop_columns: vec!["Unnamed: 3".into()],
                ..dose("twocb", "232_2.csv")
            },
            SubstanceDoses {
                adjustments: vec![century(&columns.year)],
                price_column: Some("prijs".into()),
                unit: PriceUnit::Tab,
                ..dose("lsd", "233_2.csv")
            },
            SubstanceDoses {
                split_columns: Some(vec![
                    SplitSpec {
                        column: "Unnamed: 2".into(),
                        into: ["dose_min".into(), "dose_max".into()],
                    },
                    SplitSpec {
                        column: "doserin".into(),
                        into: ["dose_mean".into(), "dose_sd".into()],
                    },
                ]),
                has_price: false,
                drop_columns: vec!["Unnamed: 2".into(), "doserin".into()],
                ..dose("ghb", "234_2.csv")
            },
        ];

        let purity = |substance: &str, file: &str| SubstancePurity {
            substance: substance.into(),
            file: file.into(),
            year_offset: None,
            extra_rows: Vec::new(),
        };
        let purity = PuritySettings {
            column_map: strings(&[("Unnamed: 0", "year"), ("geen", "no_analysis")]),
            translations: [
                ("uitsluitend", "exclusively"),
                ("voornamelijk", "primarily"),
                ("ander", "other"),
                ("overige", "remaining"),
            ]
            .iter()
            .map(|(d, e)| Translation {
                dutch: d.to_string(),
                english: e.to_string(),
            })
            .collect(),
            substances: vec![
                SubstancePurity {
                    extra_rows: vec![vec![2023, 35, 791, 97, 4, 0, 18, 2, 1, 0]],
                    ..purity("mdma", "227_0.csv")
                },
                purity("cocaine", "228_0.csv"),
                purity("amphetamine", "229_1.csv"),
                SubstancePurity {
                    year_offset: Some(2000),
                    ..purity("ketamine", "230_1.csv")
                },
                purity("twocb", "231_0.csv"),
                SubstancePurity {
                    year_offset: Some(2000),
                    ..purity("lsd", "232_1.csv")
                },
                purity("ghb", "233_1.csv"),
            ],
        };

        Self {
            year: 2023,
            total_samples,
            doses: DoseSettings {
                columns,
                substances,
            },
            purity,
        }
    }
}

// ── Cleaners ─────────────────────────────────────────────────────────────

/// Multiply numeric values below `below` by `factor`, leaving others as-is.
fn scale_below(value: &str, below: f64, factor: f64) -> String {
    match parse_number(value) {
        Some(v) if v < below => format_number(Some((v * factor * 1000.0).round() / 1000.0)),
        _ => value.to_string(),
    }
}

/// Clean the total-samples table.
pub fn clean_total_samples(
    mut table: Table,
    settings: &TotalSamplesSettings,
) -> Result<Table, PipelineError> {
    table.drop_rows(&settings.faulty_rows)?;
    for c in &settings.corrections {
        table.set_cell(c.row, c.col, c.value.clone())?;
    }
    table.rename_columns(&settings.column_map);
    for column in &settings.thousands_columns {
        table.map_column(column, |_, v| scale_below(v, 10.0, 1000.0))?;
    }
    table.map_cells(|v| to_int_or_zero(v).to_string());
    Ok(table)
}

fn apply_adjustment(table: &mut Table, adjustment: &Adjustment) -> Result<(), PipelineError> {
    match adjustment {
        Adjustment::Offset {
            column,
            offset,
            below,
            otherwise,
        } => table.map_column(column, |_, v| match parse_number(v) {
            Some(x) => {
                let add = match below {
                    Some(limit) if x >= *limit => *otherwise,
                    _ => *offset,
                };
                format_number(Some(x + add))
            }
            None => v.to_string(),
        }),
        Adjustment::ScaleBelow {
            column,
            below,
            factor,
        } => table.map_column(column, |_, v| scale_below(v, *below, *factor)),
        Adjustment::AppendSuffix { column, suffixes } => table.map_column(column, |i, v| {
            match suffixes.get(i) {
                Some(s) => format!("{v}{s}"),
                None => v.to_string(),
            }
        }),
    }
}

/// Clean one substance's dose and price table.
pub fn clean_doses(
    mut table: Table,
    settings: &SubstanceDoses,
    columns: &DoseColumns,
) -> Result<Table, PipelineError> {
    table.drop_rows(&[0, 1])?;

    for adjustment in &settings.adjustments {
        apply_adjustment(&mut table, adjustment)?;
    }

    let default_splits = [
        SplitSpec {
            column: "Unnamed: 2".into(),
            into: ["dose_min".into(), "dose_max".into()],
        },
        SplitSpec {
            column: columns.dosering.clone(),
            into: ["dose_mean".into(), "dose_sd".into()],
        },
    ];
    let splits = settings.split_columns.as_deref().unwrap_or(&default_splits);
    for split in splits {
        let [a, b] = &split.into;
        table.split_column(&split.column, &[a.as_str(), b.as_str()])?;
    }

    let price_col = settings
        .has_price
        .then(|| settings.price_column.clone().unwrap_or_else(|| columns.prices.clone()));
    let n_price_col = settings
        .n_price_column
        .clone()
        .unwrap_or_else(|| columns.n_prices.clone());

    table.map_column("dose_sd", |_, v| v.replace(['(', ')'], ""))?;
    if let Some(col) = &price_col {
        table.map_column(col, |_, v| v.replace('€', ""))?;
    }

    let mut rename = BTreeMap::new();
    rename.insert(columns.year.clone(), "year".to_string());
    rename.insert(columns.n_samples.clone(), "n_samples".to_string());
    rename.insert(n_price_col, "n_prices".to_string());
    if let Some(col) = &price_col {
        rename.insert(col.clone(), "price_per_gram".to_string());
    }
    table.rename_columns(&rename);

    let mut numeric = vec!["dose_min", "dose_max", "dose_mean", "dose_sd"];
    if table.has_column("price_per_gram") {
        table.map_column("price_per_gram", |_, v| v.replace(',', "."))?;
        numeric.push("price_per_gram");
    }
    for col in &numeric {
        table.map_column(col, |_, v| format_number(parse_number(v)))?;
    }

    let sd = table.column("dose_sd")?.iter().map(|v| parse_number(v)).collect::<Vec<_>>();
    let n = table.column("n_samples")?.iter().map(|v| parse_number(v)).collect::<Vec<_>>();
    let volatility = sd
        .iter()
        .zip(&n)
        .map(|(sd, n)| format_number(sd.zip(*n).map(|(sd, n)| sd * n.sqrt())))
        .collect();
    table.set_column("adj_volatility", volatility);

    let per_unit = match settings.unit {
        PriceUnit::Gram => None,
        PriceUnit::Pill => Some("price_per_pill"),
        PriceUnit::Tab => Some("price_per_tab"),
    };
    if let (Some(name), true) = (per_unit, table.has_column("price_per_gram")) {
        let mut rename = BTreeMap::new();
        rename.insert("price_per_gram".to_string(), name.to_string());
        table.rename_columns(&rename);

        let price = table.column(name)?.iter().map(|v| parse_number(v)).collect::<Vec<_>>();
        let mean = table.column("dose_mean")?.iter().map(|v| parse_number(v)).collect::<Vec<_>>();
        let per_mg = price
            .iter()
            .zip(&mean)
            .map(|(p, m)| format_number(p.zip(*m).filter(|(_, m)| *m != 0.0).map(|(p, m)| p / m)))
            .collect();
        table.set_column("price_per_mg", per_mg);
    }

    let mut drop: Vec<&str> = settings.drop_columns.iter().map(String::as_str).collect();
    drop.extend(["Unnamed: 2", columns.dosering.as_str(), "prijs"]);
    table.remove_columns(&drop);
    Ok(table)
}

/// Clean one substance's purity table.
pub fn clean_purity(
    mut table: Table,
    settings: &SubstancePurity,
    column_map: &BTreeMap<String, String>,
    translations: &[Translation],
) -> Result<Table, PipelineError> {
    table.drop_rows(&[0])?;
    table.rename_columns(column_map);

    let substance = &settings.substance;
    for t in translations {
        let has_pairs = table.column(&t.dutch)?.iter().any(|v| v.contains(' '));
        if has_pairs {
            let count = format!("N_{}_{}", t.english, substance);
            let pct = format!("{}_{}_pct", t.english, substance);
            table.split_column_whitespace(&t.dutch, &[count.as_str(), pct.as_str()])?;
        }
    }
    let dutch: Vec<&str> = translations.iter().map(|t| t.dutch.as_str()).collect();
    table.remove_columns(&dutch);

    table.map_cells(|v| to_int_or_zero(&v.replace('%', "")).to_string());

    for row in &settings.extra_rows {
        table.push_row(row.iter().map(i64::to_string).collect());
    }
    if let Some(offset) = settings.year_offset {
        table.map_column("year", |_, v| (to_int_or_zero(v) + offset).to_string())?;
    }
    Ok(table)
}

// ── Stage ────────────────────────────────────────────────────────────────

/// Run every cleaner of `plan` on the raw CSVs under `layout` and write the
/// results to the processed directory.
///
/// A missing or malformed table is recorded and the next one is cleaned.
pub fn clean_antenne_reports(
    layout: &DataLayout,
    plan: &AntenneCleaningPlan,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let year = plan.year;
    let source = layout.raw_csv_dir(ReportKind::Antenne, year);
    let target = layout.processed_dir(ReportKind::Antenne);
    let mut report = StageReport::new(Stage::Clean, Some(ReportKind::Antenne));
    info!("Cleaning Antenne {} tables from {}", year, source.display());

    let mut run = |label: String, file: &str, clean: &dyn Fn(Table) -> Result<Table, PipelineError>| {
        let out = target.join(format!("{label}_{year}.csv"));
        match Table::read_csv(&source.join(file))
            .and_then(|t| clean(t))
            .and_then(|t| t.write_csv(&out).map(|_| out.clone()))
        {
            Ok(path) => report.files_written.push(path),
            Err(e) => {
                warn!("{}: {}", label, e);
                report.errors.push(StageError::YearFailed {
                    year,
                    detail: format!("{label} ({file}): {e}"),
                });
            }
        }
    };

    run("total_samples".into(), &plan.total_samples.file, &|t| {
        clean_total_samples(t, &plan.total_samples)
    });
    for s in &plan.doses.substances {
        run(format!("{}_dosering", s.substance), &s.file, &|t| {
            clean_doses(t, s, &plan.doses.columns)
        });
    }
    for s in &plan.purity.substances {
        run(format!("{}_purity", s.substance), &s.file, &|t| {
            clean_purity(t, s, &plan.purity.column_map, &plan.purity.translations)
        });
    }

    if !report.files_written.is_empty() {
        report.years_processed.push(year);
    }
    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

/// Path of a cleaned output for `label` (e.g. `mdma_purity`).
pub fn output_path(layout: &DataLayout, label: &str, year: u16) -> PathBuf {
    layout
        .processed_dir(ReportKind::Antenne)
        .join(format!("{label}_{year}.csv"))
}
