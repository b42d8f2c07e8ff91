//! Report downloader: publications page → linked PDFs on disk.
//!
//! The publications page is fetched once and every anchor whose `href` ends
//! in `.pdf` is downloaded into the target folder. A page that cannot be
//! fetched is fatal for the call; a single PDF that fails is recorded in the
//! [`StageReport`] and the remaining downloads continue.

use crate::error::{PipelineError, StageError};
use crate::output::{Stage, StageReport};
use crate::pipeline::{ensure_dir, pdfium, write_atomic};
use percent_encoding::percent_decode_str;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(19|20)\d{2}").unwrap());

/// The 2023 monitor is published under a name that carries no year.
const OFF_PATTERN_NAMES: &[(&str, &str)] = &[("bevriezing-JB23-verkleind.pdf", "NDM-2023.pdf")];

/// Read a link file and return its trimmed content.
pub fn read_link(path: &Path) -> Result<String, PipelineError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::FileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                PipelineError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })
}

/// Collect absolute URLs of the PDFs linked from `html`, in document order
/// and without duplicates.
pub fn collect_pdf_links(html: &str, base_url: &str) -> Result<Vec<String>, PipelineError> {
    let base = Url::parse(base_url).map_err(|e| PipelineError::HtmlParse {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;
    let selector = Selector::parse("a[href]").map_err(|e| PipelineError::HtmlParse {
        url: base_url.to_string(),
        reason: format!("{e:?}"),
    })?;

    let document = Html::parse_document(html);
    let mut links: Vec<String> = Vec::new();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if !href.ends_with(".pdf") {
            continue;
        }
        match base.join(href) {
            Ok(url) => {
                let url = url.to_string();
                if !links.contains(&url) {
                    links.push(url);
                }
            }
            Err(e) => debug!("Ignoring unresolvable link '{}': {}", href, e),
        }
    }
    Ok(links)
}

/// File name of a downloaded report: the last path segment of its URL,
/// percent-decoded. Segments that decode to a path separator or to invalid
/// UTF-8 are kept encoded.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let name = match percent_decode_str(last).decode_utf8() {
        Ok(decoded) if !decoded.contains(['/', '\\']) && !decoded.is_empty() => {
            decoded.into_owned()
        }
        _ => last.to_string(),
    };
    Some(name)
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))
}

fn request_error(url: &str, timeout_secs: u64, e: reqwest::Error) -> PipelineError {
    if e.is_timeout() {
        PipelineError::DownloadTimeout {
            url: url.to_string(),
            secs: timeout_secs,
        }
    } else {
        PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Fetch a page as text; non-success status codes are errors.
pub async fn fetch_text(url: &str, timeout_secs: u64) -> Result<String, PipelineError> {
    let client = http_client(timeout_secs)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| request_error(url, timeout_secs, e))?;
    if !response.status().is_success() {
        return Err(PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }
    response
        .text()
        .await
        .map_err(|e| request_error(url, timeout_secs, e))
}

/// Download every PDF linked from `url` into `folder`.
pub async fn download_reports(
    url: &str,
    folder: &Path,
    timeout_secs: u64,
) -> Result<StageReport, PipelineError> {
    let started = Instant::now();
    let mut report = StageReport::new(Stage::Download, None);

    info!("Fetching publications page {}", url);
    let html = fetch_text(url, timeout_secs).await?;
    let links = collect_pdf_links(&html, url)?;
    info!("Found {} PDF links", links.len());

    ensure_dir(folder)?;

    let client = http_client(timeout_secs)?;
    for link in &links {
        match download_one(&client, link, folder, timeout_secs).await {
            Ok(path) => {
                info!("Downloaded {}", path.display());
                report.files_written.push(path);
            }
            Err(e) => {
                warn!("Failed to download {}: {}", link, e);
                report.errors.push(StageError::DownloadFailed {
                    url: link.clone(),
                    detail: e.to_string(),
                });
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

async fn download_one(
    client: &reqwest::Client,
    url: &str,
    folder: &Path,
    timeout_secs: u64,
) -> Result<std::path::PathBuf, PipelineError> {
    let name = file_name_from_url(url).ok_or_else(|| PipelineError::DownloadFailed {
        url: url.to_string(),
        reason: "URL has no file name".into(),
    })?;
    let dest = folder.join(&name);

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| request_error(url, timeout_secs, e))?;
    if !response.status().is_success() {
        return Err(PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| request_error(url, timeout_secs, e))?;

    pdfium::check_signature(&bytes, &dest)?;
    write_atomic(&dest, &bytes)?;
    Ok(dest)
}

/// Target name for a National Drug Monitor file, if it carries a year.
pub fn national_report_name(file_name: &str) -> Option<String> {
    if let Some((_, target)) = OFF_PATTERN_NAMES.iter().find(|(src, _)| *src == file_name) {
        return Some((*target).to_string());
    }
    if !file_name.ends_with(".pdf") {
        return None;
    }
    YEAR_RE
        .find(file_name)
        .map(|m| format!("NDM-{}.pdf", m.as_str()))
}

/// What [`rename_national_reports`] did in a folder.
#[derive(Debug, Default)]
pub struct RenameOutcome {
    /// `(old, new)` file names that changed.
    pub renamed: Vec<(String, String)>,
    /// Files left alone because their target name already exists.
    pub conflicts: Vec<StageError>,
}

/// Rename the downloaded monitors in `folder` to `NDM-{year}.pdf`.
///
/// Files without a year are left alone. A file whose target already exists
/// is never overwritten; it is reported as a conflict instead.
pub fn rename_national_reports(folder: &Path) -> Result<RenameOutcome, PipelineError> {
    let read_err = |source| PipelineError::ReadFailed {
        path: folder.to_path_buf(),
        source,
    };
    let mut names: Vec<String> = std::fs::read_dir(folder)
        .map_err(read_err)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut outcome = RenameOutcome::default();
    for name in names {
        let Some(target) = national_report_name(&name) else {
            debug!("No year in '{}', leaving it", name);
            continue;
        };
        if target == name {
            continue;
        }
        let to = folder.join(&target);
        if to.exists() {
            warn!("Not renaming {}: {} already exists", name, target);
            outcome.conflicts.push(StageError::NameTaken { file: name, target });
            continue;
        }
        std::fs::rename(folder.join(&name), &to).map_err(|e| {
            PipelineError::OutputWriteFailed {
                path: to.clone(),
                source: e,
            }
        })?;
        info!("Renamed {} → {}", name, target);
        outcome.renamed.push((name, target));
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_pdf_links_in_order() {
        let html = r#"
            <html><body>
              <a href="/files/antenne-2021.pdf">2021</a>
              <a href="https://cdn.example.org/antenne-2022.pdf">2022</a>
              <a href="about.html">About</a>
              <a>no href</a>
              <a href="/files/antenne-2021.pdf">again</a>
              <a href="reports/NDM 2010.pdf">relative</a>
            </body></html>"#;
        let links = collect_pdf_links(html, "https://www.example.org/publicaties/").unwrap();
        assert_eq!(
            links,
            vec![
                "https://www.example.org/files/antenne-2021.pdf",
                "https://cdn.example.org/antenne-2022.pdf",
                "https://www.example.org/publicaties/reports/NDM%202010.pdf",
            ]
        );
    }

    #[test]
    fn bad_base_url_is_an_error() {
        assert!(matches!(
            collect_pdf_links("<a href='a.pdf'></a>", "not a url"),
            Err(PipelineError::HtmlParse { .. })
        ));
    }

    #[test]
    fn file_name_is_last_segment() {
        assert_eq!(
            file_name_from_url("https://x.org/a/b/NDM-2019.pdf").as_deref(),
            Some("NDM-2019.pdf")
        );
        assert_eq!(file_name_from_url("https://x.org/"), None);
        assert_eq!(
            file_name_from_url("https://x.org/reports/NDM%202010.pdf").as_deref(),
            Some("NDM 2010.pdf")
        );
        assert_eq!(
            file_name_from_url("https://x.org/a%2Fb.pdf").as_deref(),
            Some("a%2Fb.pdf")
        );
    }

    #[test]
    fn national_names() {
        assert_eq!(
            national_report_name("jaarbericht-2012-def.pdf").as_deref(),
            Some("NDM-2012.pdf")
        );
        assert_eq!(
            national_report_name("bevriezing-JB23-verkleind.pdf").as_deref(),
            Some("NDM-2023.pdf")
        );
        assert_eq!(national_report_name("monitor.pdf"), None);
        assert_eq!(national_report_name("notes-2012.txt"), None);
    }

    #[test]
    fn renames_in_folder() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["nationale-drug-monitor-2015.pdf", "bevriezing-JB23-verkleind.pdf", "leesmij.pdf"] {
            std::fs::write(dir.path().join(name), b"%PDF-1.4").unwrap();
        }
        let outcome = rename_national_reports(dir.path()).unwrap();
        assert_eq!(outcome.renamed.len(), 2);
        assert!(outcome.conflicts.is_empty());
        assert!(dir.path().join("NDM-2015.pdf").exists());
        assert!(dir.path().join("NDM-2023.pdf").exists());
        assert!(dir.path().join("leesmij.pdf").exists());
    }

    #[test]
    fn rename_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("jaarbericht-2012.pdf"), b"%PDF-first").unwrap();
        std::fs::write(dir.path().join("jaarbericht-2012-def.pdf"), b"%PDF-second").unwrap();

        let outcome = rename_national_reports(dir.path()).unwrap();
        assert_eq!(
            outcome.renamed,
            vec![("jaarbericht-2012-def.pdf".to_string(), "NDM-2012.pdf".to_string())]
        );
        assert!(matches!(
            &outcome.conflicts[..],
            [StageError::NameTaken { file, target }]
                if file == "jaarbericht-2012.pdf" && target == "NDM-2012.pdf"
        ));
        assert_eq!(std::fs::read(dir.path().join("NDM-2012.pdf")).unwrap(), b"%PDF-second");
        assert!(dir.path().join("jaarbericht-2012.pdf").exists());
    }

    #[test]
    fn read_link_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("original_link.txt");
        std::fs::write(&path, "  https://example.org/rapporten \n").unwrap();
        assert_eq!(read_link(&path).unwrap(), "https://example.org/rapporten");
        assert!(matches!(
            read_link(&dir.path().join("missing.txt")),
            Err(PipelineError::FileNotFound { .. })
        ));
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.pdf");
        write_atomic(&dest, b"%PDF-old").unwrap();
        write_atomic(&dest, b"%PDF-new").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF-new");
    }

    type Routes = Vec<(&'static str, &'static [u8])>;

    /// Serve fixed bodies over plain HTTP on a local port; unknown paths 404.
    async fn serve(routes: Routes) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let path = request.split_whitespace().nth(1).unwrap_or("/");
                    let (status, body) = routes
                        .iter()
                        .find(|(p, _)| *p == path)
                        .map(|(_, b)| ("200 OK", *b))
                        .unwrap_or(("404 Not Found", b"".as_slice()));
                    let head = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn failed_downloads_do_not_stop_the_rest() {
        let base = serve(vec![
            (
                "/publicaties",
                &b"<a href=\"/files/NDM%202019.pdf\">2019</a>\
                   <a href=\"/files/moved.pdf\">2018</a>\
                   <a href=\"/files/gone.pdf\">2017</a>"[..],
            ),
            ("/files/NDM%202019.pdf", &b"%PDF-1.7 report"[..]),
            ("/files/moved.pdf", &b"<html>moved</html>"[..]),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();

        let report = download_reports(&format!("{base}/publicaties"), dir.path(), 10)
            .await
            .unwrap();
        assert_eq!(report.files_written, vec![dir.path().join("NDM 2019.pdf")]);
        assert_eq!(
            std::fs::read(dir.path().join("NDM 2019.pdf")).unwrap(),
            b"%PDF-1.7 report"
        );
        assert!(!dir.path().join("moved.pdf").exists());

        assert_eq!(report.errors.len(), 2);
        let details: Vec<String> = report.errors.iter().map(|e| e.to_string()).collect();
        assert!(details[0].contains("moved.pdf") && details[0].contains("not a valid PDF"));
        assert!(details[1].contains("gone.pdf") && details[1].contains("404"));
    }

    #[tokio::test]
    async fn unreachable_page_is_fatal() {
        let base = serve(Vec::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let err = download_reports(&format!("{base}/publicaties"), dir.path(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DownloadFailed { .. }));
    }

    #[tokio::test]
    async fn download_reports_live() {
        if std::env::var("E2E_ENABLED").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let result = download_reports("https://www.example.org/", dir.path(), 30).await;
        assert!(result.is_ok());
    }
}
