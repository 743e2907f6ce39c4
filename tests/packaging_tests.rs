//! Template to .intunewin to catalog, without touching Graph

use intunepack::graph::apps::command_lines;
use intunepack::manifest::AppManifest;
use intunepack::packaging::{IntuneWinPackage, PsadtBuilder, ToolkitFlavor};
use intunepack::wdac::{self, CatalogRequest};
use std::fs;
use std::path::Path;

const MANIFEST: &str = r#"
[app]
name = "Widget"
vendor = "Contoso"
version = "2.4.1"

[installer]
file = "WidgetSetup.exe"
install_args = "/S"

[[detection]]
type = "registry"
key_path = "HKEY_LOCAL_MACHINE\\SOFTWARE\\Contoso\\Widget"
value_name = "Version"
check = "version"
operator = "greaterThanOrEqual"
value = "2.4.1"
"#;

const SCRIPT: &str = "$adtSession = @{\r\n    AppVendor = ''\r\n    AppName = ''\r\n    AppVersion = ''\r\n}\r\nStart-ADTProcess -FilePath '{{InstallerFile}}' -ArgumentList '{{InstallArgs}}'\r\n";

fn template(dir: &Path) {
    fs::write(dir.join("Invoke-AppDeployToolkit.ps1"), SCRIPT).unwrap();
    fs::write(dir.join("Invoke-AppDeployToolkit.exe"), b"MZ launcher").unwrap();
    fs::create_dir_all(dir.join("PSAppDeployToolkit")).unwrap();
    fs::write(dir.join("PSAppDeployToolkit/PSAppDeployToolkit.psm1"), "# module").unwrap();
}

#[tokio::test]
async fn test_build_wrap_and_catalog() {
    let work = tempfile::tempdir().unwrap();
    let template_dir = work.path().join("template");
    fs::create_dir_all(&template_dir).unwrap();
    template(&template_dir);
    let installer = work.path().join("WidgetSetup.exe");
    fs::write(&installer, vec![0x4d; 2048]).unwrap();
    let output = work.path().join("output");

    let manifest = AppManifest::from_toml(MANIFEST, work.path()).unwrap();
    let built = PsadtBuilder::new(&template_dir, &output)
        .build(&manifest, Some(&installer))
        .unwrap();
    assert_eq!(built.flavor, ToolkitFlavor::V4);
    assert!(built.unresolved_tokens.is_empty());

    let script = fs::read_to_string(built.root.join("Invoke-AppDeployToolkit.ps1")).unwrap();
    assert!(script.contains("    AppVendor = 'Contoso'\r\n"));
    assert!(script.contains("-FilePath 'WidgetSetup.exe' -ArgumentList '/S'"));

    let package =
        IntuneWinPackage::create(&built.root, &built.setup_file, &output, None).unwrap();
    assert!(package.path.ends_with("Invoke-AppDeployToolkit.intunewin"));

    let reopened = IntuneWinPackage::open(&package.path).unwrap();
    assert_eq!(reopened.info, package.info);
    reopened.verify().unwrap();
    let entries = reopened.payload_entries().unwrap();
    assert!(entries.contains(&"Files/WidgetSetup.exe".to_string()));
    assert!(entries.contains(&"PSAppDeployToolkit/PSAppDeployToolkit.psm1".to_string()));

    let commands = command_lines(&manifest, &reopened.info.setup_file);
    assert_eq!(commands.install, built.install_command);
    assert_eq!(commands.uninstall, built.uninstall_command);

    let catalog = wdac::generate(&CatalogRequest {
        source_dir: built.root.clone(),
        output_dir: work.path().join("catalog"),
        name: "ContosoWidget".into(),
        extensions: vec!["exe".into(), "ps1".into(), "psm1".into()],
        makecat: None,
        cdf_only: true,
    })
    .await
    .unwrap();
    assert_eq!(catalog.files, 4);
    let cdf = fs::read_to_string(&catalog.cdf_path).unwrap();
    assert!(cdf.contains("<HASH>File4="));
    assert!(!cdf.contains("<HASH>File5="));
}

#[test]
fn test_tampered_package_fails_verification() {
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("src");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("setup.exe"), b"MZ").unwrap();

    let package = IntuneWinPackage::create(&source, "setup.exe", work.path(), None).unwrap();
    let mut tampered = package.clone();
    tampered.info.encryption_info.mac = package.info.encryption_info.mac_key.clone();

    assert!(package.verify().is_ok());
    assert!(tampered.verify().is_err());
}

#[test]
fn test_each_app_wraps_into_its_own_folder() {
    let work = tempfile::tempdir().unwrap();
    let template_dir = work.path().join("template");
    fs::create_dir_all(&template_dir).unwrap();
    template(&template_dir);
    let installer = work.path().join("WidgetSetup.exe");
    fs::write(&installer, b"MZ").unwrap();
    let output = work.path().join("output");

    let widget = AppManifest::from_toml(MANIFEST, work.path()).unwrap();
    let gadget =
        AppManifest::from_toml(&MANIFEST.replace("name = \"Widget\"", "name = \"Gadget\""), work.path())
            .unwrap();

    let mut wrapped = Vec::new();
    for manifest in [&widget, &gadget] {
        let built = PsadtBuilder::new(&template_dir, &output)
            .build(manifest, Some(&installer))
            .unwrap();
        let package =
            IntuneWinPackage::create(&built.root, &built.setup_file, &built.wrap_dir(), None)
                .unwrap();
        assert!(package.path.starts_with(built.wrap_dir()));
        assert!(!package.path.starts_with(&built.root));
        wrapped.push(package);
    }

    assert_ne!(wrapped[0].path, wrapped[1].path);
    for package in &wrapped {
        assert!(package.path.exists());
        package.verify().unwrap();
    }
}
