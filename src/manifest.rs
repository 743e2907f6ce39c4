//! Per-application manifest (`app.toml`)
//!
//! ```toml
//! [app]
//! name = "7-Zip"
//! vendor = "Igor Pavlov"
//! version = "24.09"
//! architecture = "x64"
//!
//! [installer]
//! file = "7z2409-x64.msi"
//! product_code = "{23170F69-40C1-2702-2409-000001000000}"
//!
//! [[detection]]
//! type = "msi"
//! product_code = "{23170F69-40C1-2702-2409-000001000000}"
//! ```

use crate::detection::{DetectionRule, is_braced_guid};
use crate::error::{IntunePackError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[default]
    X64,
    X86,
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::X86 => "x86",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Graph `applicableArchitectures` flags
    pub fn graph_value(&self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::X86 => "x86,x64",
            Architecture::Arm64 => "arm64",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallContext {
    #[default]
    System,
    User,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RestartBehavior {
    #[default]
    Suppress,
    Allow,
    BasedOnReturnCode,
    Force,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum InstallIntent {
    #[default]
    Required,
    Available,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Notifications {
    #[default]
    ShowAll,
    ShowReboot,
    HideAll,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppSection {
    pub name: String,
    pub vendor: String,
    pub version: String,
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub information_url: Option<String>,
    #[serde(default)]
    pub privacy_url: Option<String>,
    /// PNG shown in Company Portal
    #[serde(default)]
    pub icon: Option<PathBuf>,
    #[serde(default)]
    pub install_context: InstallContext,
    #[serde(default)]
    pub restart_behavior: RestartBehavior,
    #[serde(default = "default_max_run_time")]
    pub max_run_time_minutes: u32,
    #[serde(default = "default_minimum_os")]
    pub minimum_os: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InstallerSection {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub install_args: Option<String>,
    #[serde(default)]
    pub uninstall_args: Option<String>,
    #[serde(default)]
    pub product_code: Option<String>,
    /// Overrides the command line derived from the setup file
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub uninstall_command: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AssignmentSection {
    #[serde(default)]
    pub user_install_intent: InstallIntent,
    #[serde(default)]
    pub notifications: Notifications,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppManifest {
    pub app: AppSection,
    #[serde(default)]
    pub installer: InstallerSection,
    #[serde(default)]
    pub detection: Vec<DetectionRule>,
    #[serde(default)]
    pub assignments: AssignmentSection,

    /// Directory the manifest was loaded from; relative paths resolve here
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_language() -> String {
    "EN".to_string()
}

fn default_revision() -> String {
    "01".to_string()
}

fn default_max_run_time() -> u32 {
    60
}

fn default_minimum_os() -> String {
    "1607".to_string()
}

impl AppManifest {
    /// Read, resolve and validate a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            IntunePackError::ConfigError(format!("Cannot read manifest {}: {}", path.display(), e))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml(&contents, &base_dir)
    }

    pub fn from_toml(contents: &str, base_dir: &Path) -> Result<Self> {
        let mut manifest: AppManifest = toml::from_str(contents)?;
        manifest.base_dir = base_dir.to_path_buf();

        for rule in &mut manifest.detection {
            rule.resolve(base_dir)?;
        }

        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("app.name", &self.app.name),
            ("app.vendor", &self.app.vendor),
            ("app.version", &self.app.version),
        ] {
            if value.trim().is_empty() {
                return Err(IntunePackError::ValidationError(format!(
                    "{} must not be empty",
                    field
                )));
            }
        }

        if let Some(code) = &self.installer.product_code {
            if !is_braced_guid(code) {
                return Err(IntunePackError::ValidationError(format!(
                    "installer.product_code '{}' is not a braced GUID",
                    code
                )));
            }
        }

        if self.app.max_run_time_minutes == 0 || self.app.max_run_time_minutes > 1440 {
            return Err(IntunePackError::ValidationError(
                "app.max_run_time_minutes must be between 1 and 1440".into(),
            ));
        }

        if self.detection.is_empty() {
            return Err(IntunePackError::ValidationError(
                "at least one [[detection]] rule is required".into(),
            ));
        }

        for (i, rule) in self.detection.iter().enumerate() {
            rule.validate().map_err(|e| {
                IntunePackError::ValidationError(format!("detection rule #{}: {}", i + 1, e))
            })?;
        }

        Ok(())
    }

    pub fn publisher(&self) -> &str {
        self.app.publisher.as_deref().unwrap_or(&self.app.vendor)
    }

    /// "Vendor Name", used for group names and display text
    pub fn label(&self) -> String {
        if self
            .app
            .name
            .to_lowercase()
            .starts_with(&self.app.vendor.to_lowercase())
        {
            self.app.name.clone()
        } else {
            format!("{} {}", self.app.vendor, self.app.name)
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.label(), self.app.version)
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[app]
name = "Widget"
vendor = "Contoso"
version = "2.4.1"
architecture = "x86"
install_context = "user"
restart_behavior = "basedOnReturnCode"

[installer]
file = "WidgetSetup.msi"
product_code = "{11111111-2222-3333-4444-555555555555}"

[[detection]]
type = "msi"
product_code = "{11111111-2222-3333-4444-555555555555}"

[[detection]]
type = "script"
script_file = "detect.ps1"

[assignments]
user_install_intent = "available"
"#;

    #[test]
    fn test_load_resolves_script_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("detect.ps1"), "Write-Output 'found'").unwrap();
        let path = dir.path().join("app.toml");
        fs::write(&path, MANIFEST).unwrap();

        let manifest = AppManifest::load(&path).unwrap();
        assert_eq!(manifest.app.architecture, Architecture::X86);
        assert_eq!(manifest.app.install_context, InstallContext::User);
        assert_eq!(manifest.app.language, "EN");
        assert_eq!(manifest.assignments.user_install_intent, InstallIntent::Available);
        assert_eq!(manifest.publisher(), "Contoso");
        assert_eq!(manifest.display_name(), "Contoso Widget 2.4.1");
        match &manifest.detection[1] {
            DetectionRule::Script { script, script_file, .. } => {
                assert_eq!(script, "Write-Output 'found'");
                assert!(script_file.is_none());
            }
            other => panic!("unexpected rule {:?}", other),
        }
    }

    #[test]
    fn test_missing_script_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppManifest::from_toml(MANIFEST, dir.path()).is_err());
    }

    #[test]
    fn test_detection_required() {
        let toml = r#"
[app]
name = "Widget"
vendor = "Contoso"
version = "1.0"
"#;
        let err = AppManifest::from_toml(toml, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("detection"));
    }

    #[test]
    fn test_label_does_not_repeat_vendor() {
        let toml = r#"
[app]
name = "Contoso Widget"
vendor = "Contoso"
version = "1.0"

[[detection]]
type = "file"
path = "C:\\Program Files\\Contoso"
name = "widget.exe"
"#;
        let manifest = AppManifest::from_toml(toml, Path::new(".")).unwrap();
        assert_eq!(manifest.label(), "Contoso Widget");
    }
}
