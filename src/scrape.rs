//! Supplementary tables scraped from EUDA web pages.

use crate::error::PipelineError;
use crate::output::{Stage, StageReport};
use crate::pipeline::download::fetch_text;
use crate::pipeline::{ensure_dir, write_atomic};
use crate::table::Table;
use scraper::{ElementRef, Html, Selector};
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// New psychoactive substances page of the 2023 European Drug Report.
pub const DEFAULT_EUDA_URL: &str = "https://www.euda.europa.eu/data/source-data/edr/2023/nps_en";

pub const DEFAULT_STEM: &str = "euda_tables";

/// Tables and captions found on one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedPage {
    /// Each table as rows of cell texts, `th` and `td` alike.
    pub tables: Vec<Vec<Vec<String>>>,
    pub captions: Vec<String>,
}

fn selector(css: &str) -> Result<Selector, PipelineError> {
    Selector::parse(css).map_err(|e| PipelineError::HtmlParse {
        url: String::new(),
        reason: format!("selector '{css}': {e:?}"),
    })
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Every `<table>` of `html` and every `<caption>` text.
pub fn scrape_tables(html: &str) -> Result<ScrapedPage, PipelineError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td, th")?;
    let caption_sel = selector("caption")?;

    let tables = document
        .select(&table_sel)
        .map(|table| {
            table
                .select(&row_sel)
                .map(|row| row.select(&cell_sel).map(text_of).collect())
                .collect()
        })
        .collect();
    let captions = document.select(&caption_sel).map(text_of).collect();
    Ok(ScrapedPage { tables, captions })
}

/// Fetch `url` and save its tables as `{stem}_{i}.csv` (first row as
/// header) and its captions as `{stem}_{i}.txt` in `dir`.
pub async fn tables_to_csv(
    url: &str,
    dir: &Path,
    stem: &str,
    timeout_secs: u64,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let html = fetch_text(url, timeout_secs).await?;
    let page = scrape_tables(&html)?;
    let mut report = save_page(&page, dir, stem)?;
    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

/// Write a scraped page to `dir`.
pub fn save_page(page: &ScrapedPage, dir: &Path, stem: &str) -> Result<StageReport, PipelineError> {
    let mut report = StageReport::new(Stage::Scrape, None);
    ensure_dir(dir)?;

    for (i, rows) in page.tables.iter().enumerate() {
        let path = dir.join(format!("{stem}_{i}.csv"));
        Table::from_records(format!("{stem}_{i}"), rows.clone()).write_csv(&path)?;
        info!("Table {} saved as {}", i, path.display());
        report.files_written.push(path);
    }
    for (i, caption) in page.captions.iter().enumerate() {
        let path = dir.join(format!("{stem}_{i}.txt"));
        write_atomic(&path, format!("{caption}\n").as_bytes())?;
        report.files_written.push(path);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <table>
            <caption> New substances notified </caption>
            <tr><th>Year</th><th>Count</th></tr>
            <tr><td>2021</td><td> 52 </td></tr>
            <tr><td>2022</td><td>41</td></tr>
          </table>
          <table>
            <tr><th>Group</th><th>Share</th></tr>
            <tr><td>Cathinones</td><td>25%</td><td>extra</td></tr>
          </table>
        </body></html>"#;

    #[test]
    fn scrapes_tables_and_captions() {
        let page = scrape_tables(PAGE).unwrap();
        assert_eq!(page.tables.len(), 2);
        assert_eq!(page.tables[0][1], vec!["2021", "52"]);
        assert_eq!(page.tables[1][1].len(), 3);
        assert_eq!(page.captions, vec!["New substances notified"]);
    }

    #[test]
    fn page_without_tables() {
        let page = scrape_tables("<p>nothing</p>").unwrap();
        assert!(page.tables.is_empty());
        assert!(page.captions.is_empty());
    }

    #[test]
    fn saves_csv_and_captions() {
        let dir = tempfile::tempdir().unwrap();
        let page = scrape_tables(PAGE).unwrap();
        let report = save_page(&page, dir.path(), "euda_tables").unwrap();
        assert_eq!(report.files_written.len(), 3);

        let first = Table::read_csv(&dir.path().join("euda_tables_0.csv")).unwrap();
        assert_eq!(first.header(), &["Year".to_string(), "Count".to_string()][..]);
        assert_eq!(first.len(), 2);

        let second = Table::read_csv(&dir.path().join("euda_tables_1.csv")).unwrap();
        assert_eq!(second.width(), 3);

        let caption = std::fs::read_to_string(dir.path().join("euda_tables_0.txt")).unwrap();
        assert_eq!(caption, "New substances notified\n");
    }

    #[tokio::test]
    async fn live_euda_page() {
        if std::env::var("E2E_ENABLED").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let report = tables_to_csv(DEFAULT_EUDA_URL, dir.path(), DEFAULT_STEM, 60)
            .await
            .unwrap();
        assert!(!report.files_written.is_empty());
    }
}
