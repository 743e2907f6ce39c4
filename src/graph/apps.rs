//! Win32 line-of-business apps (`deviceAppManagement/mobileApps`)

use super::{GraphClient, odata_filter, odata_quote};
use crate::detection::{self, DetectionRule, RulePlan};
use crate::error::{IntunePackError, Result};
use crate::manifest::{AppManifest, InstallContext};
use crate::packaging::{IntuneWinPackage, ToolkitFlavor};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

pub const MOBILE_APPS: &str = "deviceAppManagement/mobileApps";
pub const WIN32_APP_TYPE: &str = "#microsoft.graph.win32LobApp";

// Windows Installer (MSI) return codes
// See: https://learn.microsoft.com/en-us/windows/win32/msi/error-codes

/// Installation completed successfully
const WIN_SUCCESS: i32 = 0;

/// Product is already installed
const WIN_SUCCESS_ALREADY_INSTALLED: i32 = 1707;

/// Restart required to complete (soft reboot - user can defer)
const WIN_SOFT_REBOOT: i32 = 3010;

/// Restart initiated by the installer (hard reboot)
const WIN_HARD_REBOOT: i32 = 1641;

/// Another installation is in progress - retry later
const WIN_RETRY_INSTALL_IN_PROGRESS: i32 = 1618;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileApp {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub display_version: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub committed_content_version: Option<String>,
    #[serde(default)]
    pub publishing_state: Option<String>,
}

/// Install and uninstall command lines for an app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLines {
    pub install: String,
    pub uninstall: String,
}

fn join_args(base: String, args: Option<&str>) -> String {
    match args.map(str::trim).filter(|a| !a.is_empty()) {
        Some(args) => format!("{} {}", base, args),
        None => base,
    }
}

/// Command lines for `setup_file`; `[installer]` overrides win
pub fn command_lines(manifest: &AppManifest, setup_file: &str) -> CommandLines {
    let installer = &manifest.installer;
    let install_args = installer.install_args.as_deref();
    let uninstall_args = installer.uninstall_args.as_deref();

    let derived = if let Some(flavor) = ToolkitFlavor::from_setup_file(setup_file) {
        let base = if setup_file.to_lowercase().ends_with(".ps1") {
            format!(
                "powershell.exe -ExecutionPolicy Bypass -NoProfile -File {}",
                setup_file
            )
        } else {
            setup_file.to_string()
        };
        CommandLines {
            install: format!("{} {}", base, flavor.deployment_args("Install")),
            uninstall: format!("{} {}", base, flavor.deployment_args("Uninstall")),
        }
    } else if setup_file.to_lowercase().ends_with(".msi") {
        let target = installer
            .product_code
            .clone()
            .unwrap_or_else(|| format!("\"{}\"", setup_file));
        CommandLines {
            install: join_args(
                format!("msiexec /i \"{}\" /qn /norestart", setup_file),
                install_args,
            ),
            uninstall: join_args(format!("msiexec /x {} /qn /norestart", target), uninstall_args),
        }
    } else {
        CommandLines {
            install: join_args(format!("\"{}\"", setup_file), install_args),
            uninstall: join_args(format!("\"{}\"", setup_file), uninstall_args),
        }
    };

    CommandLines {
        install: installer.install_command.clone().unwrap_or(derived.install),
        uninstall: installer.uninstall_command.clone().unwrap_or(derived.uninstall),
    }
}

/// Graph `win32LobApp` body for a manifest and its packaged content
pub fn win32_app_body(
    manifest: &AppManifest,
    package: &IntuneWinPackage,
    rules: &[DetectionRule],
) -> Result<Value> {
    let app = &manifest.app;
    let info = &package.info;
    let commands = command_lines(manifest, &info.setup_file);
    let run_as = match app.install_context {
        InstallContext::System => "system",
        InstallContext::User => "user",
    };
    let file_name = package
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| info.file_name.clone());

    let mut body = json!({
        "@odata.type": WIN32_APP_TYPE,
        "displayName": manifest.display_name(),
        "description": app.description.clone().unwrap_or_else(|| manifest.display_name()),
        "publisher": manifest.publisher(),
        "displayVersion": app.version,
        "developer": app.vendor,
        "owner": app.owner,
        "notes": app.notes,
        "informationUrl": app.information_url,
        "privacyInformationUrl": app.privacy_url,
        "isFeatured": false,
        "fileName": file_name,
        "setupFilePath": info.setup_file,
        "installCommandLine": commands.install,
        "uninstallCommandLine": commands.uninstall,
        "applicableArchitectures": app.architecture.graph_value(),
        "minimumSupportedWindowsRelease": app.minimum_os,
        "installExperience": {
            "runAsAccount": run_as,
            "deviceRestartBehavior": app.restart_behavior,
            "maxRunTimeInMinutes": app.max_run_time_minutes,
        },
        "returnCodes": [
            {"returnCode": WIN_SUCCESS, "type": "success"},
            {"returnCode": WIN_SUCCESS_ALREADY_INSTALLED, "type": "success"},
            {"returnCode": WIN_SOFT_REBOOT, "type": "softReboot"},
            {"returnCode": WIN_HARD_REBOOT, "type": "hardReboot"},
            {"returnCode": WIN_RETRY_INSTALL_IN_PROGRESS, "type": "retry"}
        ],
        "detectionRules": rules.iter().map(DetectionRule::to_graph).collect::<Vec<_>>(),
        "requirementRules": [],
    });

    let product_code = info
        .msi_product_code
        .clone()
        .or_else(|| manifest.installer.product_code.clone());
    if let (Some(code), true) = (product_code, info.setup_file.to_lowercase().ends_with(".msi")) {
        body["msiInformation"] = json!({
            "productCode": code,
            "productVersion": app.version,
            "productName": app.name,
            "publisher": manifest.publisher(),
            "requiresReboot": false,
            "packageType": if run_as == "user" { "perUser" } else { "perMachine" },
        });
    }

    if let Some(icon) = &app.icon {
        let path = manifest.resolve_path(icon);
        let bytes = std::fs::read(&path).map_err(|e| {
            IntunePackError::ConfigError(format!("Cannot read icon {}: {}", path.display(), e))
        })?;
        body["largeIcon"] = json!({
            "@odata.type": "#microsoft.graph.mimeContent",
            "type": "image/png",
            "value": BASE64.encode(bytes),
        });
    }

    Ok(body)
}

pub async fn create_win32_app(client: &GraphClient, body: &Value) -> Result<MobileApp> {
    let app: MobileApp = client.post(MOBILE_APPS, body).await?;
    tracing::info!("Created win32LobApp {} ({})", app.display_name, app.id);
    Ok(app)
}

pub async fn get_app(client: &GraphClient, app_id: &str) -> Result<Value> {
    client.get(&format!("{}/{}", MOBILE_APPS, app_id)).await
}

pub async fn find_app_by_name(client: &GraphClient, display_name: &str) -> Result<Option<MobileApp>> {
    let filter = format!(
        "isof('microsoft.graph.win32LobApp') and displayName eq {}",
        odata_quote(display_name)
    );
    let apps: Vec<MobileApp> = client
        .get_all_pages(&format!("{}?{}", MOBILE_APPS, odata_filter(&filter)))
        .await?;
    if apps.len() > 1 {
        tracing::warn!(
            "{} apps are named '{}', using {}",
            apps.len(),
            display_name,
            apps[0].id
        );
    }
    Ok(apps.into_iter().next())
}

pub async fn list_win32_apps(client: &GraphClient) -> Result<Vec<MobileApp>> {
    client
        .get_all_pages(&format!(
            "{}?{}",
            MOBILE_APPS,
            odata_filter("isof('microsoft.graph.win32LobApp')")
        ))
        .await
}

pub async fn delete_app(client: &GraphClient, app_id: &str) -> Result<()> {
    client.delete(&format!("{}/{}", MOBILE_APPS, app_id)).await
}

pub async fn get_detection_rules(client: &GraphClient, app_id: &str) -> Result<Vec<DetectionRule>> {
    let app = get_app(client, app_id).await?;
    app["detectionRules"]
        .as_array()
        .map(|rules| {
            rules
                .iter()
                .map(DetectionRule::from_graph)
                .collect::<Result<Vec<_>>>()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

pub async fn set_detection_rules(
    client: &GraphClient,
    app_id: &str,
    rules: &[DetectionRule],
) -> Result<()> {
    let body = json!({
        "@odata.type": WIN32_APP_TYPE,
        "detectionRules": rules.iter().map(DetectionRule::to_graph).collect::<Vec<_>>(),
    });
    client.patch(&format!("{}/{}", MOBILE_APPS, app_id), &body).await
}

/// Bring an app's detection rules in line with `desired`; no PATCH when already equal
pub async fn reconcile_detection_rules(
    client: &GraphClient,
    app_id: &str,
    desired: &[DetectionRule],
) -> Result<RulePlan> {
    let existing = get_detection_rules(client, app_id).await?;
    let plan = detection::plan(&existing, desired);
    if plan.is_noop() {
        tracing::debug!("Detection rules of {} already match", app_id);
    } else {
        set_detection_rules(client, app_id, &plan.desired()).await?;
    }
    Ok(plan)
}

pub async fn get_assignments(client: &GraphClient, app_id: &str) -> Result<Vec<Value>> {
    client
        .get_all_pages(&format!("{}/{}/assignments", MOBILE_APPS, app_id))
        .await
}

/// Replace the app's assignments with `assignments`
pub async fn assign(client: &GraphClient, app_id: &str, assignments: &[Value]) -> Result<()> {
    let body = json!({ "mobileAppAssignments": assignments });
    client
        .post_empty(&format!("{}/{}/assign", MOBILE_APPS, app_id), &body)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn manifest(extra: &str) -> AppManifest {
        AppManifest::from_toml(
            &format!(
                r#"
[app]
name = "Widget"
vendor = "Contoso"
version = "2.4.1"

[installer]
product_code = "{{11111111-2222-3333-4444-555555555555}}"
install_args = "ALLUSERS=1"
{}

[[detection]]
type = "msi"
product_code = "{{11111111-2222-3333-4444-555555555555}}"
"#,
                extra
            ),
            std::path::Path::new("."),
        )
        .unwrap()
    }

    #[test]
    fn test_command_lines_per_setup_kind() {
        let m = manifest("");
        let psadt = command_lines(&m, "Invoke-AppDeployToolkit.exe");
        assert_eq!(
            psadt.install,
            "Invoke-AppDeployToolkit.exe -DeploymentType Install -DeployMode Silent"
        );

        let msi = command_lines(&m, "widget.msi");
        assert_eq!(msi.install, "msiexec /i \"widget.msi\" /qn /norestart ALLUSERS=1");
        assert_eq!(
            msi.uninstall,
            "msiexec /x {11111111-2222-3333-4444-555555555555} /qn /norestart"
        );

        let exe = command_lines(&m, "setup.exe");
        assert_eq!(exe.install, "\"setup.exe\" ALLUSERS=1");
    }

    #[test]
    fn test_manifest_command_override() {
        let m = manifest("uninstall_command = \"uninstall.cmd\"");
        let lines = command_lines(&m, "setup.exe");
        assert_eq!(lines.uninstall, "uninstall.cmd");
    }

    #[test]
    fn test_win32_app_body() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("widget.msi"), b"MSI").unwrap();
        let out = tempfile::tempdir().unwrap();
        let package = IntuneWinPackage::create(
            src.path(),
            "widget.msi",
            out.path(),
            Some("{11111111-2222-3333-4444-555555555555}"),
        )
        .unwrap();
        let m = manifest("");

        let body = win32_app_body(&m, &package, &m.detection).unwrap();
        assert_eq!(body["@odata.type"], WIN32_APP_TYPE);
        assert_eq!(body["displayName"], "Contoso Widget 2.4.1");
        assert_eq!(body["fileName"], "widget.intunewin");
        assert_eq!(body["setupFilePath"], "widget.msi");
        assert_eq!(body["installExperience"]["runAsAccount"], "system");
        assert_eq!(body["installExperience"]["deviceRestartBehavior"], "suppress");
        assert_eq!(body["returnCodes"].as_array().unwrap().len(), 5);
        assert_eq!(body["returnCodes"][2]["returnCode"], 3010);
        assert_eq!(body["applicableArchitectures"], "x64");
        assert_eq!(body["msiInformation"]["packageType"], "perMachine");
        assert_eq!(
            body["detectionRules"][0]["@odata.type"],
            "#microsoft.graph.win32LobAppProductCodeDetection"
        );
        assert!(body.get("largeIcon").is_none());
    }
}
