//! Report kinds, page catalogs and the on-disk data layout.
//!
//! Every stage of the pipeline reads what the previous stage wrote, so all
//! paths are derived in one place, [`DataLayout`], from
//! `(root, kind, year, page)`. The directory names match the research
//! repository's `data/` tree so existing intermediate files are picked up
//! as-is.

use crate::error::PipelineError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The two report series the pipeline knows how to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    /// Antenne Amsterdam yearly monitor (drug checking service tables).
    Antenne,
    /// National Drug Monitor yearly report (incident tables).
    National,
}

impl ReportKind {
    pub const ALL: [ReportKind; 2] = [ReportKind::Antenne, ReportKind::National];

    /// Short lowercase name used on the command line and in logs.
    pub fn slug(self) -> &'static str {
        match self {
            ReportKind::Antenne => "antenne",
            ReportKind::National => "national",
        }
    }

    /// Directory under `source/` holding the downloaded PDFs.
    pub fn source_dir_name(self) -> &'static str {
        match self {
            ReportKind::Antenne => "antenne_reports",
            ReportKind::National => "national_drug_monitor",
        }
    }

    /// File name of the report PDF for `year`.
    pub fn pdf_name(self, year: u16) -> String {
        match self {
            ReportKind::Antenne => format!("antenne-amsterdam-{year}.pdf"),
            ReportKind::National => format!("NDM-{year}.pdf"),
        }
    }

    /// Per-year directory stem shared by all intermediate stages.
    pub fn year_dir_name(self, year: u16) -> String {
        match self {
            ReportKind::Antenne => format!("antenne_amsterdam_{year}"),
            ReportKind::National => format!("national_report_{year}"),
        }
    }

    /// Prefix of the intermediate stage directories.
    fn stage_prefix(self) -> &'static str {
        match self {
            ReportKind::Antenne => "antenne_reports",
            ReportKind::National => "national_reports",
        }
    }

    /// Name of the JSON page catalog inside the source directory.
    pub fn catalog_file_name(self) -> &'static str {
        match self {
            ReportKind::Antenne => "tables_dict.json",
            ReportKind::National => "incidents_dict.json",
        }
    }

    /// Report years processed by default (end exclusive).
    pub fn default_years(self) -> Range<u16> {
        match self {
            ReportKind::Antenne => 2003..2024,
            ReportKind::National => 1999..2024,
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ReportKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "antenne" => Ok(ReportKind::Antenne),
            "national" | "ndm" => Ok(ReportKind::National),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown report kind '{other}' (expected antenne or national)"
            ))),
        }
    }
}

// ── Page catalog ─────────────────────────────────────────────────────────

/// Which pages of each year's report hold the tables of interest.
///
/// Serialised as `{"2003": [224, 225, ...], ...}` with 1-based page numbers.
/// A year may also be given as a selection string, `{"2019": "207-211,213"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PageCatalog {
    years: BTreeMap<u16, Vec<u32>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogEntry {
    Pages(Vec<u32>),
    Selection(String),
}

impl<'de> Deserialize<'de> for PageCatalog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = BTreeMap::<u16, CatalogEntry>::deserialize(deserializer)?;
        let mut years = BTreeMap::new();
        for (year, entry) in raw {
            let pages = match entry {
                CatalogEntry::Pages(pages) => pages,
                CatalogEntry::Selection(s) => s
                    .parse::<PageSelection>()
                    .map_err(D::Error::custom)?
                    .explicit_pages()
                    .ok_or_else(|| D::Error::custom(format!("{year}: a catalog must name its pages")))?,
            };
            years.insert(year, pages);
        }
        Ok(Self { years })
    }
}

/// Half-open page ranges of the table appendices of the 2003–2023 Antenne reports.
const ANTENNE_PAGE_RANGES: &[(u16, &[(u32, u32)])] = &[
    (2003, &[(224, 233), (235, 237), (239, 258), (261, 267), (269, 276), (279, 286), (289, 294)]),
    (2004, &[(177, 187), (189, 194)]),
    (2005, &[(210, 219), (221, 255), (256, 262)]),
    (2006, &[(185, 195), (197, 214), (216, 222)]),
    (2007, &[(221, 232), (233, 241), (243, 253), (255, 274), (275, 292), (293, 296), (297, 303)]),
    (2008, &[(179, 187), (190, 224), (226, 233)]),
    (2009, &[(169, 177), (179, 205), (206, 213)]),
    (2010, &[(192, 200), (205, 237), (238, 253), (255, 263)]),
    (2011, &[(214, 221), (223, 230), (233, 238), (241, 258), (261, 280), (283, 302), (305, 312)]),
    (2012, &[(162, 169), (171, 186), (189, 195)]),
    (2013, &[(172, 177), (180, 213), (215, 219)]),
    (2014, &[(180, 185), (189, 218), (219, 224), (225, 227)]),
    (2015, &[(191, 196), (199, 225), (227, 237), (239, 242)]),
    (2016, &[(205, 211), (214, 245), (246, 256), (259, 261)]),
    (2017, &[(229, 234), (239, 279), (280, 290), (293, 297)]),
    (2018, &[(212, 216), (220, 255), (258, 271)]),
    (2019, &[(207, 211), (213, 234), (236, 246)]),
    (2020, &[(234, 239), (248, 276), (279, 285)]),
    (2021, &[(205, 210), (220, 243), (246, 252)]),
    (2022, &[(219, 224), (235, 262), (263, 264), (266, 277)]),
    (2023, &[(187, 194), (201, 221), (225, 236)]),
];

impl PageCatalog {
    /// Catalog of the Antenne table appendices, usable without a catalog file.
    pub fn antenne_builtin() -> Self {
        let years = ANTENNE_PAGE_RANGES
            .iter()
            .map(|(year, ranges)| {
                let pages = ranges.iter().flat_map(|&(start, end)| start..end).collect();
                (*year, pages)
            })
            .collect();
        Self { years }
    }

    /// Load a catalog from a JSON file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        crate::clean::load_json(path)
    }

    /// Load the catalog for `kind` from the layout, falling back to the
    /// built-in Antenne catalog when the file is absent.
    pub fn for_kind(layout: &DataLayout, kind: ReportKind) -> Result<Self, PipelineError> {
        let path = layout.catalog_file(kind);
        match Self::load(&path) {
            Err(PipelineError::FileNotFound { .. }) if kind == ReportKind::Antenne => {
                tracing::debug!("{} absent, using built-in Antenne catalog", path.display());
                Ok(Self::antenne_builtin())
            }
            other => other,
        }
    }

    /// Sorted, de-duplicated pages for `year`, or `None` when not catalogued.
    pub fn pages(&self, year: u16) -> Option<Vec<u32>> {
        self.years.get(&year).map(|pages| {
            let mut pages = pages.clone();
            pages.sort_unstable();
            pages.dedup();
            pages
        })
    }

    /// Insert or replace the pages of `year`.
    pub fn insert(&mut self, year: u16, pages: Vec<u32>) {
        self.years.insert(year, pages);
    }

    /// Catalogued years in ascending order.
    pub fn years(&self) -> impl Iterator<Item = u16> + '_ {
        self.years.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of a PDF to process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// All pages (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(u32),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(u32, u32),
    /// Specific pages (1-indexed, deduplicated on expansion).
    Set(Vec<u32>),
}

impl PageSelection {
    /// The pages named by the selection, sorted and de-duplicated, or `None`
    /// for [`PageSelection::All`], which depends on the document.
    pub fn explicit_pages(&self) -> Option<Vec<u32>> {
        let mut pages: Vec<u32> = match self {
            PageSelection::All => return None,
            PageSelection::Single(p) => vec![*p],
            PageSelection::Range(start, end) => (*start..=*end).collect(),
            PageSelection::Set(pages) => pages.clone(),
        };
        pages.sort_unstable();
        pages.dedup();
        Some(pages)
    }
}

impl FromStr for PageSelection {
    type Err = PipelineError;

    /// Parse `all`, `5`, `3-15`, `1,3,5` or mixed lists like `224-232,235`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim().to_lowercase();
        let invalid = |reason: String| PipelineError::InvalidPageSelection {
            input: s.to_string(),
            reason,
        };

        if input == "all" {
            return Ok(PageSelection::All);
        }

        let parse_page = |p: &str| -> Result<u32, PipelineError> {
            let page: u32 = p
                .trim()
                .parse()
                .map_err(|_| invalid(format!("'{}' is not a page number", p.trim())))?;
            if page < 1 {
                return Err(invalid("pages are 1-indexed".into()));
            }
            Ok(page)
        };

        let mut pages = Vec::new();
        let parts: Vec<&str> = input.split(',').filter(|p| !p.trim().is_empty()).collect();
        if parts.is_empty() {
            return Err(invalid("empty selection".into()));
        }

        for part in &parts {
            if let Some((start, end)) = part.split_once('-') {
                let (start, end) = (parse_page(start)?, parse_page(end)?);
                if start > end {
                    return Err(invalid(format!("range {start}-{end} is reversed")));
                }
                if parts.len() == 1 {
                    return Ok(PageSelection::Range(start, end));
                }
                pages.extend(start..=end);
            } else {
                pages.push(parse_page(part)?);
            }
        }

        if pages.len() == 1 && parts.len() == 1 {
            Ok(PageSelection::Single(pages[0]))
        } else {
            Ok(PageSelection::Set(pages))
        }
    }
}

// ── Data layout ──────────────────────────────────────────────────────────

/// Resolves every file and directory the pipeline reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLayout {
    root: PathBuf,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self::new("data")
    }
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `source/<kind>/`: downloaded PDFs, link file and catalog.
    pub fn source_dir(&self, kind: ReportKind) -> PathBuf {
        self.root.join("source").join(kind.source_dir_name())
    }

    pub fn report_pdf(&self, kind: ReportKind, year: u16) -> PathBuf {
        self.source_dir(kind).join(kind.pdf_name(year))
    }

    /// `original_link.txt` holding the URL of the publications page.
    pub fn link_file(&self, kind: ReportKind) -> PathBuf {
        self.source_dir(kind).join("original_link.txt")
    }

    pub fn catalog_file(&self, kind: ReportKind) -> PathBuf {
        self.source_dir(kind).join(kind.catalog_file_name())
    }

    /// Rendered page images: `{page}.png`.
    pub fn images_dir(&self, kind: ReportKind, year: u16) -> PathBuf {
        self.intermediate(kind, "to_images", year)
    }

    /// Detected table boxes: `{page}.json`.
    pub fn boxes_dir(&self, kind: ReportKind, year: u16) -> PathBuf {
        self.intermediate(kind, "table_tensors", year)
    }

    /// Raw extracted tables: `{page}_{index}.csv`.
    pub fn raw_csv_dir(&self, kind: ReportKind, year: u16) -> PathBuf {
        self.intermediate(kind, "raw_csvs", year)
    }

    /// Cleaned time series.
    pub fn processed_dir(&self, kind: ReportKind) -> PathBuf {
        match kind {
            ReportKind::Antenne => self.root.join("processed/antenne_reports/testservice"),
            ReportKind::National => self.root.join("processed/national_reports/incidents"),
        }
    }

    /// Supplementary EUDA tables.
    pub fn euda_dir(&self) -> PathBuf {
        self.root.join("source/euda")
    }

    fn intermediate(&self, kind: ReportKind, stage: &str, year: u16) -> PathBuf {
        self.root
            .join("intermediate")
            .join(format!("{}_{stage}", kind.stage_prefix()))
            .join(kind.year_dir_name(year))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_covers_antenne_years() {
        let catalog = PageCatalog::antenne_builtin();
        let years: Vec<u16> = catalog.years().collect();
        assert_eq!(years.first(), Some(&2003));
        assert_eq!(years.last(), Some(&2023));
        assert_eq!(years.len(), 21);

        let pages_2004 = catalog.pages(2004).unwrap();
        assert_eq!(pages_2004.len(), 10 + 5);
        assert_eq!(pages_2004[0], 177);
        assert!(!pages_2004.contains(&187));
        assert!(pages_2004.contains(&193));

        assert!(catalog.pages(2022).unwrap().contains(&263));
        assert!(!catalog.pages(2022).unwrap().contains(&264));
        assert!(catalog.pages(2024).is_none());
    }

    #[test]
    fn catalog_json_uses_string_year_keys() {
        let catalog: PageCatalog = serde_json::from_str(r#"{"2012": [30, 12, 30]}"#).unwrap();
        assert_eq!(catalog.pages(2012), Some(vec![12, 30]));
    }

    #[test]
    fn report_kind_parse() {
        assert_eq!("Antenne".parse::<ReportKind>().unwrap(), ReportKind::Antenne);
        assert_eq!("ndm".parse::<ReportKind>().unwrap(), ReportKind::National);
        assert!("euda".parse::<ReportKind>().is_err());
    }

    #[test]
    fn page_selection_parse() {
        assert_eq!("all".parse::<PageSelection>().unwrap(), PageSelection::All);
        assert_eq!("5".parse::<PageSelection>().unwrap(), PageSelection::Single(5));
        assert_eq!(
            "3-15".parse::<PageSelection>().unwrap(),
            PageSelection::Range(3, 15)
        );
        assert_eq!(
            "224-226,230".parse::<PageSelection>().unwrap(),
            PageSelection::Set(vec![224, 225, 226, 230])
        );
        assert!("0".parse::<PageSelection>().is_err());
        assert!("9-3".parse::<PageSelection>().is_err());
        assert!("x".parse::<PageSelection>().is_err());
    }

    #[test]
    fn page_selection_expands() {
        assert_eq!(PageSelection::All.explicit_pages(), None);
        assert_eq!(PageSelection::Single(6).explicit_pages(), Some(vec![6]));
        assert_eq!(PageSelection::Range(3, 5).explicit_pages(), Some(vec![3, 4, 5]));
        assert_eq!(PageSelection::Set(vec![3, 1, 3]).explicit_pages(), Some(vec![1, 3]));
    }

    #[test]
    fn catalog_accepts_selection_strings() {
        let catalog: PageCatalog =
            serde_json::from_str(r#"{"2019": "207-209,213", "2020": [234]}"#).unwrap();
        assert_eq!(catalog.pages(2019), Some(vec![207, 208, 209, 213]));
        assert_eq!(catalog.pages(2020), Some(vec![234]));
        assert!(serde_json::from_str::<PageCatalog>(r#"{"2019": "all"}"#).is_err());
        assert!(serde_json::from_str::<PageCatalog>(r#"{"2019": "9-3"}"#).is_err());
    }

    #[test]
    fn layout_paths() {
        let layout = DataLayout::new("/d");
        assert_eq!(
            layout.report_pdf(ReportKind::Antenne, 2023),
            PathBuf::from("/d/source/antenne_reports/antenne-amsterdam-2023.pdf")
        );
        assert_eq!(
            layout.report_pdf(ReportKind::National, 2010),
            PathBuf::from("/d/source/national_drug_monitor/NDM-2010.pdf")
        );
        assert_eq!(
            layout.images_dir(ReportKind::Antenne, 2023),
            PathBuf::from("/d/intermediate/antenne_reports_to_images/antenne_amsterdam_2023")
        );
        assert_eq!(
            layout.boxes_dir(ReportKind::National, 2012),
            PathBuf::from("/d/intermediate/national_reports_table_tensors/national_report_2012")
        );
        assert_eq!(
            layout.raw_csv_dir(ReportKind::National, 2012),
            PathBuf::from("/d/intermediate/national_reports_raw_csvs/national_report_2012")
        );
    }
}
