//! Binding to the pdfium shared library.
//!
//! Lookup order: an explicit path from the config, `PDFIUM_LIB_PATH`, a
//! library next to the working directory, then the system library.

use crate::error::PipelineError;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bind pdfium, trying each candidate location in turn.
pub fn bind(explicit: Option<&Path>) -> Result<Pdfium, PipelineError> {
    let mut attempts: Vec<String> = Vec::new();

    for candidate in candidates(explicit) {
        match Pdfium::bind_to_library(&candidate) {
            Ok(bindings) => {
                debug!("Bound pdfium from {}", candidate.display());
                return Ok(Pdfium::new(bindings));
            }
            Err(e) => attempts.push(format!("{}: {:?}", candidate.display(), e)),
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => {
            debug!("Bound system pdfium library");
            Ok(Pdfium::new(bindings))
        }
        Err(e) => {
            attempts.push(format!("system library: {:?}", e));
            Err(PipelineError::PdfiumBindingFailed(attempts.join("; ")))
        }
    }
}

fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = explicit {
        out.push(library_path(p));
    }
    if let Ok(env) = std::env::var("PDFIUM_LIB_PATH") {
        if !env.trim().is_empty() {
            out.push(library_path(Path::new(env.trim())));
        }
    }
    out.push(Pdfium::pdfium_platform_library_name_at_path("./"));
    out
}

/// Accept either the library file itself or the directory holding it.
fn library_path(p: &Path) -> PathBuf {
    if p.is_dir() {
        Pdfium::pdfium_platform_library_name_at_path(p)
    } else {
        p.to_path_buf()
    }
}

/// Accept `bytes` only when they start with the `%PDF` signature.
pub fn check_signature(bytes: &[u8], path: &Path) -> Result<(), PipelineError> {
    if bytes.starts_with(b"%PDF") {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    Err(PipelineError::NotAPdf {
        path: path.to_path_buf(),
        magic,
    })
}

/// Open a PDF, mapping pdfium failures to [`PipelineError::CorruptPdf`].
pub fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PipelineError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_comes_first() {
        let list = candidates(Some(Path::new("/opt/pdfium/libpdfium.so")));
        assert_eq!(list[0], PathBuf::from("/opt/pdfium/libpdfium.so"));
        assert!(list.len() >= 2);
    }

    #[test]
    fn signature_check() {
        let path = Path::new("NDM-2019.pdf");
        assert!(check_signature(b"%PDF-1.7\n", path).is_ok());
        match check_signature(b"<!D", path) {
            Err(PipelineError::NotAPdf { magic, .. }) => assert_eq!(&magic, b"<!D\0"),
            other => panic!("expected NotAPdf, got {other:?}"),
        }
        assert!(check_signature(b"", path).is_err());
    }

    #[test]
    fn directory_resolves_to_platform_name() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = library_path(dir.path());
        assert!(resolved.starts_with(dir.path()));
        assert_ne!(resolved, dir.path());
    }
}
