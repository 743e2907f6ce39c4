//! Wrapper around Microsoft's `IntuneWinAppUtil.exe`

use super::intunewin::IntuneWinPackage;
use crate::error::{IntunePackError, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub const TOOL_NAME: &str = "IntuneWinAppUtil.exe";

/// First `PATH` entry containing `tool`
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Clone)]
pub struct IntuneWinAppUtil {
    exe: PathBuf,
}

impl IntuneWinAppUtil {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    /// Use the configured path, or find the tool on `PATH`
    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        if let Some(path) = configured {
            if path.is_file() {
                return Ok(Self::new(path));
            }
            return Err(IntunePackError::ConfigError(format!(
                "intunewin_tool points to {}, which does not exist",
                path.display()
            )));
        }

        find_on_path(TOOL_NAME).map(Self::new).ok_or_else(|| {
            IntunePackError::ConfigError(format!(
                "{} not found on PATH; set packaging.intunewin_tool or use the native packager",
                TOOL_NAME
            ))
        })
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// Run `-c <source> -s <setup> -o <output> -q` and open the result
    pub async fn run(
        &self,
        source_dir: &Path,
        setup_file: &str,
        output_dir: &Path,
    ) -> Result<IntuneWinPackage> {
        std::fs::create_dir_all(output_dir)?;
        tracing::debug!(
            "Running {} -c {} -s {} -o {}",
            self.exe.display(),
            source_dir.display(),
            setup_file,
            output_dir.display()
        );

        let output = Command::new(&self.exe)
            .arg("-c")
            .arg(source_dir)
            .arg("-s")
            .arg(setup_file)
            .arg("-o")
            .arg(output_dir)
            .arg("-q")
            .output()
            .await
            .map_err(|e| {
                IntunePackError::ProcessError(format!("Cannot start {}: {}", self.exe.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(IntunePackError::ProcessError(format!(
                "{} exited with {}: {}",
                TOOL_NAME,
                output.status,
                detail.trim()
            )));
        }

        let stem = Path::new(setup_file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| setup_file.to_string());
        let produced = output_dir.join(format!("{}.intunewin", stem));
        if !produced.is_file() {
            return Err(IntunePackError::ProcessError(format!(
                "{} reported success but {} was not created",
                TOOL_NAME,
                produced.display()
            )));
        }

        IntuneWinPackage::open(&produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_rejects_missing_configured_path() {
        let err = IntuneWinAppUtil::locate(Some(Path::new("/nonexistent/IntuneWinAppUtil.exe")))
            .unwrap_err();
        assert!(err.to_string().contains("intunewin_tool"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_tool_reports_exit_status() {
        let out = tempfile::tempdir().unwrap();
        let tool = IntuneWinAppUtil::new("false");
        let err = tool
            .run(Path::new("."), "setup.exe", out.path())
            .await
            .unwrap_err();
        assert!(matches!(err, IntunePackError::ProcessError(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output_is_an_error() {
        let out = tempfile::tempdir().unwrap();
        let tool = IntuneWinAppUtil::new("true");
        let err = tool
            .run(Path::new("."), "setup.exe", out.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("was not created"));
    }
}
