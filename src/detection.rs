//! Win32 app detection rules
//!
//! Typed model for the four rule kinds Intune understands (file system,
//! registry, MSI product code, PowerShell script), conversion to and from the
//! Graph `win32LobApp*Detection` objects, and reconciliation of an app's
//! current rules against the rules declared in its manifest.

use crate::error::{IntunePackError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

const FILE_DETECTION: &str = "#microsoft.graph.win32LobAppFileSystemDetection";
const REGISTRY_DETECTION: &str = "#microsoft.graph.win32LobAppRegistryDetection";
const MSI_DETECTION: &str = "#microsoft.graph.win32LobAppProductCodeDetection";
const SCRIPT_DETECTION: &str = "#microsoft.graph.win32LobAppPowerShellScriptDetection";

const REGISTRY_HIVES: &[(&str, &str)] = &[
    ("HKLM", "HKEY_LOCAL_MACHINE"),
    ("HKCU", "HKEY_CURRENT_USER"),
    ("HKCR", "HKEY_CLASSES_ROOT"),
    ("HKU", "HKEY_USERS"),
];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    #[default]
    NotConfigured,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FileCheck {
    #[default]
    Exists,
    DoesNotExist,
    Version,
    #[serde(rename = "sizeInMB")]
    SizeInMb,
    ModifiedDate,
    CreatedDate,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RegistryCheck {
    #[default]
    Exists,
    DoesNotExist,
    String,
    Integer,
    Version,
}

impl FileCheck {
    fn needs_value(self) -> bool {
        !matches!(self, FileCheck::Exists | FileCheck::DoesNotExist)
    }
}

impl RegistryCheck {
    fn needs_value(self) -> bool {
        !matches!(self, RegistryCheck::Exists | RegistryCheck::DoesNotExist)
    }
}

/// A single detection rule as written in an app manifest
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DetectionRule {
    File {
        path: String,
        name: String,
        #[serde(default)]
        check: FileCheck,
        #[serde(default)]
        operator: Operator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default)]
        check_32bit: bool,
    },
    Registry {
        key_path: String,
        #[serde(default)]
        value_name: String,
        #[serde(default)]
        check: RegistryCheck,
        #[serde(default)]
        operator: Operator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default)]
        check_32bit: bool,
    },
    Msi {
        product_code: String,
        #[serde(default)]
        version_operator: Operator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Script {
        /// Script body; loaded from `script_file` when the manifest is read
        #[serde(default)]
        script: String,
        #[serde(default, skip_serializing)]
        script_file: Option<PathBuf>,
        #[serde(default)]
        enforce_signature_check: bool,
        #[serde(default)]
        run_as_32bit: bool,
    },
}

/// `{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}`
pub fn is_braced_guid(value: &str) -> bool {
    let Some(inner) = value.strip_prefix('{').and_then(|v| v.strip_suffix('}')) else {
        return false;
    };
    let groups: Vec<&str> = inner.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

fn expand_hive(key_path: &str) -> String {
    let trimmed = key_path.trim().trim_end_matches('\\');
    let (hive, rest) = match trimmed.split_once('\\') {
        Some((hive, rest)) => (hive, Some(rest)),
        None => (trimmed, None),
    };
    let hive = REGISTRY_HIVES
        .iter()
        .find(|(short, long)| hive.eq_ignore_ascii_case(short) || hive.eq_ignore_ascii_case(long))
        .map(|(_, long)| long.to_string())
        .unwrap_or_else(|| hive.to_uppercase());
    match rest {
        Some(rest) => format!("{}\\{}", hive, rest),
        None => hive,
    }
}

fn require_comparison(kind: &str, operator: Operator, value: &Option<String>) -> Result<()> {
    if operator == Operator::NotConfigured {
        return Err(IntunePackError::ValidationError(format!(
            "{} detection needs an operator",
            kind
        )));
    }
    if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
        return Err(IntunePackError::ValidationError(format!(
            "{} detection needs a value",
            kind
        )));
    }
    Ok(())
}

impl DetectionRule {
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionRule::File { .. } => "file",
            DetectionRule::Registry { .. } => "registry",
            DetectionRule::Msi { .. } => "msi",
            DetectionRule::Script { .. } => "script",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            DetectionRule::File {
                path,
                name,
                check,
                operator,
                value,
                ..
            } => {
                if path.trim().is_empty() || name.trim().is_empty() {
                    return Err(IntunePackError::ValidationError(
                        "file detection needs both path and name".into(),
                    ));
                }
                if check.needs_value() {
                    require_comparison("file", *operator, value)?;
                }
            }
            DetectionRule::Registry {
                key_path,
                check,
                operator,
                value,
                value_name,
                ..
            } => {
                let hive = key_path.split('\\').next().unwrap_or_default();
                let known = REGISTRY_HIVES.iter().any(|(short, long)| {
                    hive.eq_ignore_ascii_case(short) || hive.eq_ignore_ascii_case(long)
                });
                if !known {
                    return Err(IntunePackError::ValidationError(format!(
                        "registry key '{}' must start with a hive such as HKEY_LOCAL_MACHINE",
                        key_path
                    )));
                }
                if check.needs_value() {
                    if value_name.trim().is_empty() {
                        return Err(IntunePackError::ValidationError(
                            "registry value comparison needs value_name".into(),
                        ));
                    }
                    require_comparison("registry", *operator, value)?;
                }
            }
            DetectionRule::Msi {
                product_code,
                version_operator,
                version,
            } => {
                if !is_braced_guid(product_code) {
                    return Err(IntunePackError::ValidationError(format!(
                        "'{}' is not a product code like {{00000000-0000-0000-0000-000000000000}}",
                        product_code
                    )));
                }
                if *version_operator != Operator::NotConfigured {
                    require_comparison("msi", *version_operator, version)?;
                }
            }
            DetectionRule::Script { script, .. } => {
                if script.trim().is_empty() {
                    return Err(IntunePackError::ValidationError(
                        "script detection has an empty script".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Load `script_file` (relative to `base_dir`) into the rule body
    pub fn resolve(&mut self, base_dir: &Path) -> Result<()> {
        if let DetectionRule::Script {
            script,
            script_file,
            ..
        } = self
        {
            if let Some(file) = script_file.take() {
                let full = if file.is_absolute() {
                    file
                } else {
                    base_dir.join(file)
                };
                *script = std::fs::read_to_string(&full).map_err(|e| {
                    IntunePackError::ValidationError(format!(
                        "cannot read detection script {}: {}",
                        full.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Graph `win32LobApp*Detection` object
    pub fn to_graph(&self) -> Value {
        match self {
            DetectionRule::File {
                path,
                name,
                check,
                operator,
                value,
                check_32bit,
            } => json!({
                "@odata.type": FILE_DETECTION,
                "path": path,
                "fileOrFolderName": name,
                "check32BitOn64System": check_32bit,
                "detectionType": check,
                "operator": operator,
                "detectionValue": value,
            }),
            DetectionRule::Registry {
                key_path,
                value_name,
                check,
                operator,
                value,
                check_32bit,
            } => json!({
                "@odata.type": REGISTRY_DETECTION,
                "keyPath": key_path,
                "valueName": value_name,
                "check32BitOn64System": check_32bit,
                "detectionType": check,
                "operator": operator,
                "detectionValue": value,
            }),
            DetectionRule::Msi {
                product_code,
                version_operator,
                version,
            } => json!({
                "@odata.type": MSI_DETECTION,
                "productCode": product_code,
                "productVersionOperator": version_operator,
                "productVersion": version,
            }),
            DetectionRule::Script {
                script,
                enforce_signature_check,
                run_as_32bit,
                ..
            } => json!({
                "@odata.type": SCRIPT_DETECTION,
                "enforceSignatureCheck": enforce_signature_check,
                "runAs32Bit": run_as_32bit,
                "scriptContent": BASE64.encode(script.as_bytes()),
            }),
        }
    }

    /// Parse a Graph detection object
    pub fn from_graph(value: &Value) -> Result<Self> {
        let odata_type = value["@odata.type"].as_str().unwrap_or_default();
        let string = |key: &str| value[key].as_str().unwrap_or_default().to_string();
        let optional = |key: &str| value[key].as_str().map(String::from);
        let flag = |key: &str| value[key].as_bool().unwrap_or(false);
        let field = |key: &str| value.get(key).cloned().unwrap_or(Value::Null);
        let operator = |key: &str| -> Result<Operator> {
            match field(key) {
                Value::Null => Ok(Operator::NotConfigured),
                v => Ok(serde_json::from_value(v)?),
            }
        };

        let rule = match odata_type {
            FILE_DETECTION => DetectionRule::File {
                path: string("path"),
                name: string("fileOrFolderName"),
                check: serde_json::from_value(field("detectionType"))?,
                operator: operator("operator")?,
                value: optional("detectionValue"),
                check_32bit: flag("check32BitOn64System"),
            },
            REGISTRY_DETECTION => DetectionRule::Registry {
                key_path: string("keyPath"),
                value_name: string("valueName"),
                check: serde_json::from_value(field("detectionType"))?,
                operator: operator("operator")?,
                value: optional("detectionValue"),
                check_32bit: flag("check32BitOn64System"),
            },
            MSI_DETECTION => DetectionRule::Msi {
                product_code: string("productCode"),
                version_operator: operator("productVersionOperator")?,
                version: optional("productVersion"),
            },
            SCRIPT_DETECTION => {
                let decoded = BASE64.decode(string("scriptContent")).map_err(|e| {
                    IntunePackError::GraphApiError(format!("Invalid scriptContent: {}", e))
                })?;
                DetectionRule::Script {
                    script: String::from_utf8_lossy(&decoded).into_owned(),
                    script_file: None,
                    enforce_signature_check: flag("enforceSignatureCheck"),
                    run_as_32bit: flag("runAs32Bit"),
                }
            }
            other => {
                return Err(IntunePackError::GraphApiError(format!(
                    "Unsupported detection rule type: {}",
                    other
                )));
            }
        };
        Ok(rule)
    }

    /// Comparable form: hives expanded, trailing separators and case folded
    fn normalized(&self) -> DetectionRule {
        match self.clone() {
            DetectionRule::File {
                path,
                name,
                check,
                operator,
                value,
                check_32bit,
            } => DetectionRule::File {
                path: path.trim().trim_end_matches('\\').to_lowercase(),
                name: name.trim().to_lowercase(),
                check,
                operator,
                value: value.map(|v| v.trim().to_string()),
                check_32bit,
            },
            DetectionRule::Registry {
                key_path,
                value_name,
                check,
                operator,
                value,
                check_32bit,
            } => DetectionRule::Registry {
                key_path: expand_hive(&key_path).to_lowercase(),
                value_name: value_name.trim().to_lowercase(),
                check,
                operator,
                value: value.map(|v| v.trim().to_string()),
                check_32bit,
            },
            DetectionRule::Msi {
                product_code,
                version_operator,
                version,
            } => DetectionRule::Msi {
                product_code: product_code.trim().to_uppercase(),
                version_operator,
                version: if version_operator == Operator::NotConfigured {
                    None
                } else {
                    version.map(|v| v.trim().to_string())
                },
            },
            DetectionRule::Script {
                script,
                enforce_signature_check,
                run_as_32bit,
                ..
            } => DetectionRule::Script {
                script: script.replace("\r\n", "\n").trim().to_string(),
                script_file: None,
                enforce_signature_check,
                run_as_32bit,
            },
        }
    }

    pub fn same_as(&self, other: &DetectionRule) -> bool {
        self.normalized() == other.normalized()
    }
}

impl std::fmt::Display for DetectionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionRule::File { path, name, check, .. } => {
                write!(f, "file {}\\{} ({:?})", path.trim_end_matches('\\'), name, check)
            }
            DetectionRule::Registry {
                key_path,
                value_name,
                check,
                ..
            } => write!(f, "registry {} [{}] ({:?})", key_path, value_name, check),
            DetectionRule::Msi { product_code, .. } => write!(f, "msi {}", product_code),
            DetectionRule::Script { script, .. } => {
                write!(f, "script ({} lines)", script.lines().count())
            }
        }
    }
}

/// Difference between an app's current and desired detection rules
#[derive(Debug, Default)]
pub struct RulePlan {
    pub keep: Vec<DetectionRule>,
    pub add: Vec<DetectionRule>,
    pub remove: Vec<DetectionRule>,
}

impl RulePlan {
    pub fn is_noop(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Rule set to write back; Graph replaces the whole collection
    pub fn desired(&self) -> Vec<DetectionRule> {
        self.keep.iter().chain(self.add.iter()).cloned().collect()
    }
}

pub fn plan(existing: &[DetectionRule], desired: &[DetectionRule]) -> RulePlan {
    let mut plan = RulePlan::default();
    let mut unmatched: Vec<&DetectionRule> = existing.iter().collect();

    for rule in desired {
        if let Some(pos) = unmatched.iter().position(|current| current.same_as(rule)) {
            plan.keep.push(unmatched.remove(pos).clone());
        } else if !plan.add.iter().any(|added| added.same_as(rule)) {
            plan.add.push(rule.clone());
        }
    }

    plan.remove = unmatched.into_iter().cloned().collect();
    plan
}
