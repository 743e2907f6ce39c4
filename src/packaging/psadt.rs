//! PSADT package builder
//!
//! Copies a PowerShell App Deployment Toolkit template into
//! `<output>/<Vendor>_<Name>_<Version>_<Arch>`, drops the installer into
//! `Files/`, then fills in `{{Token}}` placeholders and the toolkit's session
//! variables (`AppVendor = '...'` in v4, `[string]$appVendor = '...'` in v3).

use crate::error::{IntunePackError, Result};
use crate::manifest::AppManifest;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const TEXT_EXTENSIONS: &[&str] = &["ps1", "psm1", "psd1", "xml", "txt", "json", "cmd", "bat"];
const FILES_DIR: &str = "Files";

/// Session variables rewritten in the main deployment script
const SESSION_FIELDS: &[&str] = &[
    "AppVendor",
    "AppName",
    "AppVersion",
    "AppArch",
    "AppLang",
    "AppRevision",
    "AppScriptDate",
    "AppScriptAuthor",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolkitFlavor {
    /// PSADT 4.x
    V4,
    /// PSADT 3.x
    V3,
}

impl ToolkitFlavor {
    pub fn detect(template_dir: &Path) -> Result<Self> {
        if !template_dir.is_dir() {
            return Err(IntunePackError::PackagingError(format!(
                "Template folder does not exist: {}",
                template_dir.display()
            )));
        }
        for flavor in [ToolkitFlavor::V4, ToolkitFlavor::V3] {
            if template_dir.join(flavor.script()).is_file() {
                return Ok(flavor);
            }
        }
        Err(IntunePackError::PackagingError(format!(
            "{} is not a PSADT template (no {} or {})",
            template_dir.display(),
            ToolkitFlavor::V4.script(),
            ToolkitFlavor::V3.script()
        )))
    }

    pub fn script(&self) -> &'static str {
        match self {
            ToolkitFlavor::V4 => "Invoke-AppDeployToolkit.ps1",
            ToolkitFlavor::V3 => "Deploy-Application.ps1",
        }
    }

    pub fn launcher(&self) -> &'static str {
        match self {
            ToolkitFlavor::V4 => "Invoke-AppDeployToolkit.exe",
            ToolkitFlavor::V3 => "Deploy-Application.exe",
        }
    }

    fn date_format(&self) -> &'static str {
        match self {
            ToolkitFlavor::V4 => "%Y-%m-%d",
            ToolkitFlavor::V3 => "%d/%m/%Y",
        }
    }

    /// Flavor whose launcher or script is `setup_file`
    pub fn from_setup_file(setup_file: &str) -> Option<Self> {
        let name = setup_file.rsplit(['/', '\\']).next().unwrap_or(setup_file);
        [ToolkitFlavor::V4, ToolkitFlavor::V3].into_iter().find(|flavor| {
            name.eq_ignore_ascii_case(flavor.launcher()) || name.eq_ignore_ascii_case(flavor.script())
        })
    }

    pub fn deployment_args(&self, deployment_type: &str) -> String {
        match self {
            ToolkitFlavor::V4 => format!("-DeploymentType {} -DeployMode Silent", deployment_type),
            ToolkitFlavor::V3 => {
                format!("-DeploymentType \"{}\" -DeployMode \"Silent\"", deployment_type)
            }
        }
    }
}

impl std::fmt::Display for ToolkitFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolkitFlavor::V4 => write!(f, "PSADT v4"),
            ToolkitFlavor::V3 => write!(f, "PSADT v3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedToken {
    pub file: PathBuf,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct BuiltPackage {
    pub root: PathBuf,
    pub flavor: ToolkitFlavor,
    pub setup_file: String,
    pub install_command: String,
    pub uninstall_command: String,
    pub files_updated: usize,
    pub unresolved_tokens: Vec<UnresolvedToken>,
}

impl BuiltPackage {
    /// `<root>.intunewin.d`, next to the package folder. Every PSADT setup
    /// wraps to `Invoke-AppDeployToolkit.intunewin`, so each app gets its own.
    pub fn wrap_dir(&self) -> PathBuf {
        let mut name = self
            .root
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".intunewin.d");
        self.root.with_file_name(name)
    }
}

pub struct PsadtBuilder {
    template_dir: PathBuf,
    output_dir: PathBuf,
    force: bool,
}

fn sanitize(part: &str) -> String {
    part.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<Vendor>_<Name>_<Version>_<Arch>`
pub fn package_folder_name(manifest: &AppManifest) -> String {
    [
        manifest.app.vendor.as_str(),
        manifest.app.name.as_str(),
        manifest.app.version.as_str(),
        manifest.app.architecture.as_str(),
    ]
    .iter()
    .map(|part| sanitize(part))
    .collect::<Vec<_>>()
    .join("_")
}

/// PowerShell single-quoted literal
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Length of `Field`, `$field` or `[string]$field` at the start of `text`
fn target_len(text: &str, field: &str) -> Option<usize> {
    const CAST: &str = "[string]";
    let mut pos = 0;
    if text
        .get(..CAST.len())
        .is_some_and(|s| s.eq_ignore_ascii_case(CAST))
    {
        pos = CAST.len();
    }
    if text[pos..].starts_with('$') {
        pos += 1;
    }
    let end = pos + field.len();
    if !text.get(pos..end)?.eq_ignore_ascii_case(field) {
        return None;
    }
    match text[end..].chars().next() {
        Some(c) if c.is_alphanumeric() || c == '_' => None,
        _ => Some(end),
    }
}

/// Byte index just past the closing quote of a single-quoted literal
fn literal_end(literal: &str) -> Option<usize> {
    let bytes = literal.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Replace the literal in `<field> = '<old>'`, keeping indentation and trailing text
pub fn rewrite_assignment(line: &str, field: &str, value: &str) -> Option<String> {
    let rest = line.trim_start();
    let lhs = target_len(rest, field)?;
    let after_eq = rest[lhs..].trim_start().strip_prefix('=')?;
    let literal = after_eq.trim_start();
    if !literal.starts_with('\'') {
        return None;
    }
    let end = literal_end(literal)?;
    let head = &line[..line.len() - literal.len()];
    Some(format!("{}{}{}", head, ps_quote(value), &literal[end..]))
}

fn rewrite_session(text: &str, fields: &[(&str, String)]) -> String {
    text.split_inclusive('\n')
        .map(|line| {
            let content = line.trim_end_matches(['\r', '\n']);
            let ending = &line[content.len()..];
            fields
                .iter()
                .find_map(|(field, value)| rewrite_assignment(content, field, value))
                .map(|rewritten| format!("{}{}", rewritten, ending))
                .unwrap_or_else(|| line.to_string())
        })
        .collect()
}

fn substitute_tokens(text: &str, tokens: &[(&str, String)]) -> String {
    tokens.iter().fold(text.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{{{}}}}}", name), value)
    })
}

/// `{{Name}}` placeholders left in `text`
pub fn find_placeholders(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end)
                if end > 0
                    && after[..end]
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                found.push(after[..end].to_string());
                rest = &after[end + 2..];
            }
            _ => rest = after,
        }
    }
    found
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| TEXT_EXTENSIONS.iter().any(|t| t.eq_ignore_ascii_case(ext)))
}

fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| IntunePackError::PackagingError(e.to_string()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            tracing::warn!("Skipping {} (not a regular file)", entry.path().display());
        }
    }
    Ok(copied)
}

impl PsadtBuilder {
    pub fn new(template_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            output_dir: output_dir.into(),
            force: false,
        }
    }

    /// Replace an existing package folder instead of failing
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    fn tokens(
        &self,
        manifest: &AppManifest,
        flavor: ToolkitFlavor,
        installer_file: &str,
    ) -> Vec<(&'static str, String)> {
        let app = &manifest.app;
        let installer = &manifest.installer;
        vec![
            ("AppVendor", app.vendor.clone()),
            ("AppName", app.name.clone()),
            ("AppVersion", app.version.clone()),
            ("AppArch", app.architecture.as_str().to_string()),
            ("AppLang", app.language.clone()),
            ("AppRevision", app.revision.clone()),
            (
                "AppScriptAuthor",
                app.author.clone().unwrap_or_else(|| "intunepack".to_string()),
            ),
            (
                "AppScriptDate",
                chrono::Local::now().format(flavor.date_format()).to_string(),
            ),
            ("InstallerFile", installer_file.to_string()),
            ("InstallArgs", installer.install_args.clone().unwrap_or_default()),
            ("UninstallArgs", installer.uninstall_args.clone().unwrap_or_default()),
            ("ProductCode", installer.product_code.clone().unwrap_or_default()),
        ]
    }

    pub fn build(&self, manifest: &AppManifest, installer: Option<&Path>) -> Result<BuiltPackage> {
        let flavor = ToolkitFlavor::detect(&self.template_dir)?;
        let root = self.output_dir.join(package_folder_name(manifest));
        tracing::info!("Building {} package at {}", flavor, root.display());

        if root.exists() {
            if !self.force {
                return Err(IntunePackError::PackagingError(format!(
                    "{} already exists (use --force to replace it)",
                    root.display()
                )));
            }
            fs::remove_dir_all(&root)?;
        }

        fs::create_dir_all(&self.output_dir)?;
        if self
            .output_dir
            .canonicalize()?
            .starts_with(self.template_dir.canonicalize()?)
        {
            return Err(IntunePackError::PackagingError(
                "Output folder must not be inside the template folder".into(),
            ));
        }

        let copied = copy_tree(&self.template_dir, &root)?;
        tracing::debug!("Copied {} template files", copied);

        let files_dir = root.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;
        let mut installer_file = manifest.installer.file.clone();
        if let Some(installer) = installer {
            if installer.is_file() {
                let name = installer.file_name().ok_or_else(|| {
                    IntunePackError::PackagingError(format!(
                        "Invalid installer path {}",
                        installer.display()
                    ))
                })?;
                fs::copy(installer, files_dir.join(name))?;
                installer_file.get_or_insert_with(|| name.to_string_lossy().into_owned());
            } else if installer.is_dir() {
                copy_tree(installer, &files_dir)?;
            } else {
                return Err(IntunePackError::PackagingError(format!(
                    "Installer not found: {}",
                    installer.display()
                )));
            }
        }

        if let Some(file) = &installer_file {
            if !files_dir.join(file).is_file() {
                return Err(IntunePackError::PackagingError(format!(
                    "Installer '{}' is not in {}",
                    file,
                    files_dir.display()
                )));
            }
        }

        let tokens = self.tokens(manifest, flavor, installer_file.as_deref().unwrap_or_default());
        let session: Vec<(&str, String)> = tokens
            .iter()
            .filter(|(name, _)| SESSION_FIELDS.contains(name))
            .cloned()
            .collect();
        let main_script = root.join(flavor.script());

        let mut files_updated = 0;
        let mut unresolved_tokens = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_text_file(path) {
                continue;
            }

            let bytes = fs::read(path)?;
            let (bom, body) = match bytes.strip_prefix(UTF8_BOM) {
                Some(body) => (true, body),
                None => (false, bytes.as_slice()),
            };
            let Ok(text) = std::str::from_utf8(body) else {
                tracing::debug!("Skipping non UTF-8 file {}", path.display());
                continue;
            };

            let mut updated = substitute_tokens(text, &tokens);
            if path == main_script {
                updated = rewrite_session(&updated, &session);
            }

            let relative = path.strip_prefix(&root).unwrap_or(path).to_path_buf();
            for token in find_placeholders(&updated) {
                tracing::warn!("Unresolved {{{{{}}}}} in {}", token, relative.display());
                unresolved_tokens.push(UnresolvedToken {
                    file: relative.clone(),
                    token,
                });
            }

            if updated != text {
                let mut out = Vec::with_capacity(updated.len() + UTF8_BOM.len());
                if bom {
                    out.extend_from_slice(UTF8_BOM);
                }
                out.extend_from_slice(updated.as_bytes());
                fs::write(path, out)?;
                files_updated += 1;
            }
        }

        let (setup_file, install_command, uninstall_command) =
            if root.join(flavor.launcher()).is_file() {
                let exe = flavor.launcher();
                (
                    exe.to_string(),
                    format!("{} {}", exe, flavor.deployment_args("Install")),
                    format!("{} {}", exe, flavor.deployment_args("Uninstall")),
                )
            } else {
                let script = flavor.script();
                let shell = format!("powershell.exe -ExecutionPolicy Bypass -NoProfile -File {}", script);
                (
                    script.to_string(),
                    format!("{} {}", shell, flavor.deployment_args("Install")),
                    format!("{} {}", shell, flavor.deployment_args("Uninstall")),
                )
            };

        Ok(BuiltPackage {
            root,
            flavor,
            setup_file,
            install_command,
            uninstall_command,
            files_updated,
            unresolved_tokens,
        })
    }
}
