//! WDAC catalog generation
//!
//! Writes a catalog definition file (`.cdf`) for a package folder plus a
//! SHA-256 manifest of the same files, then runs `makecat.exe` to produce the
//! `.cat` that a WDAC policy can allow by signer.

use crate::error::{IntunePackError, Result};
use crate::packaging::external::find_on_path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use walkdir::WalkDir;

pub const MAKECAT: &str = "makecat.exe";
const OS_ATTRIBUTE: &str = "0x10010001:OSAttr:2:10.0";

/// Files under `dir`, sorted; only the given extensions when any are given
pub fn collect_files(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(IntunePackError::ValidationError(format!(
            "{} is not a folder",
            dir.display()
        )));
    }

    let wanted: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect();

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = wanted.is_empty()
            || entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| wanted.contains(&ext.to_lowercase()));
        if matches {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Catalog definition, CRLF line endings
pub fn build_cdf(name: &str, result_dir: &Path, files: &[PathBuf]) -> String {
    let mut lines = vec![
        "[CatalogHeader]".to_string(),
        format!("Name={}", name),
        format!("ResultDir={}", result_dir.display()),
        "PublicVersion=0x0000001".to_string(),
        "EncodingType=0x00010001".to_string(),
        format!("CATATTR1={}", OS_ATTRIBUTE),
        String::new(),
        "[CatalogFiles]".to_string(),
    ];
    for (i, file) in files.iter().enumerate() {
        lines.push(format!("<HASH>File{}={}", i + 1, file.display()));
    }
    lines.push(String::new());
    lines.join("\r\n")
}

/// UTF-8 when the text is ASCII, otherwise UTF-16LE with a BOM (what makecat reads)
pub fn encode_cdf(cdf: &str) -> Vec<u8> {
    if cdf.is_ascii() {
        return cdf.as_bytes().to_vec();
    }
    let mut bytes = vec![0xFF, 0xFE];
    for unit in cdf.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    /// Relative to the catalog root, `/` separated
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

pub fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, format!("{:x}", hasher.finalize())))
}

pub fn hash_manifest(root: &Path, files: &[PathBuf]) -> Result<Vec<HashEntry>> {
    files
        .iter()
        .map(|file| {
            let (size, sha256) = sha256_file(file)?;
            let relative = file.strip_prefix(root).unwrap_or(file);
            Ok(HashEntry {
                path: relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                size,
                sha256,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CatalogRequest {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Catalog file name; `.cat` is appended when missing
    pub name: String,
    pub extensions: Vec<String>,
    pub makecat: Option<PathBuf>,
    /// Stop after writing the `.cdf` and hash manifest
    pub cdf_only: bool,
}

#[derive(Debug, Clone)]
pub struct CatalogResult {
    pub cdf_path: PathBuf,
    pub manifest_path: PathBuf,
    pub catalog_path: Option<PathBuf>,
    pub files: usize,
}

/// Catalog file name and stem for `name`, with or without a `.cat` suffix
fn catalog_names(name: &str) -> (String, String) {
    let split = name.len().saturating_sub(4);
    match name.get(split..) {
        Some(suffix) if suffix.eq_ignore_ascii_case(".cat") => {
            (name.to_string(), name[..split].to_string())
        }
        _ => (format!("{}.cat", name), name.to_string()),
    }
}

pub async fn generate(request: &CatalogRequest) -> Result<CatalogResult> {
    let source_dir = request.source_dir.canonicalize().map_err(|e| {
        IntunePackError::ValidationError(format!(
            "Cannot open {}: {}",
            request.source_dir.display(),
            e
        ))
    })?;
    let files = collect_files(&source_dir, &request.extensions)?;
    if files.is_empty() {
        return Err(IntunePackError::ValidationError(format!(
            "No files to catalog in {}",
            source_dir.display()
        )));
    }

    fs::create_dir_all(&request.output_dir)?;
    let output_dir = request.output_dir.canonicalize()?;

    let (catalog_name, stem) = catalog_names(&request.name);

    let cdf_path = output_dir.join(format!("{}.cdf", stem));
    let cdf = build_cdf(&catalog_name, &output_dir, &files);
    fs::write(&cdf_path, encode_cdf(&cdf))?;
    tracing::info!("Wrote {} ({} files)", cdf_path.display(), files.len());

    let manifest_path = output_dir.join(format!("{}.hashes.json", stem));
    let manifest = hash_manifest(&source_dir, &files)?;
    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

    if request.cdf_only {
        return Ok(CatalogResult {
            cdf_path,
            manifest_path,
            catalog_path: None,
            files: files.len(),
        });
    }

    let makecat = match &request.makecat {
        Some(path) => path.clone(),
        None => find_on_path(MAKECAT).ok_or_else(|| {
            IntunePackError::ConfigError(format!(
                "{} not found; install the Windows SDK, set packaging.makecat_path or pass --cdf-only",
                MAKECAT
            ))
        })?,
    };

    let output = Command::new(&makecat)
        .arg("-v")
        .arg(&cdf_path)
        .current_dir(&output_dir)
        .output()
        .await
        .map_err(|e| {
            IntunePackError::ProcessError(format!("Cannot start {}: {}", makecat.display(), e))
        })?;
    if !output.status.success() {
        return Err(IntunePackError::ProcessError(format!(
            "{} exited with {}: {}",
            MAKECAT,
            output.status,
            String::from_utf8_lossy(&output.stdout).trim()
        )));
    }

    let catalog_path = output_dir.join(&catalog_name);
    if !catalog_path.is_file() {
        return Err(IntunePackError::ProcessError(format!(
            "{} finished but {} was not created",
            MAKECAT,
            catalog_path.display()
        )));
    }

    Ok(CatalogResult {
        cdf_path,
        manifest_path,
        catalog_path: Some(catalog_path),
        files: files.len(),
    })
}
