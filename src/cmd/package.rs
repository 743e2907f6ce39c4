//! `package build|wrap|inspect`
//!
//! `build` fills a PSADT template from an app manifest, `wrap` turns any folder
//! into a `.intunewin` (natively, or through `IntuneWinAppUtil.exe` with
//! `--external`), and `inspect` reads one back.

use super::progress::{create_spinner, finish_spinner_error, finish_spinner_success};
use crate::config::PackagingSettings;
use crate::error::{IntunePackError, Result};
use crate::manifest::AppManifest;
use crate::packaging::{BuiltPackage, IntuneWinAppUtil, IntuneWinPackage, PsadtBuilder};
use clap::Args;
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// App manifest (TOML)
    #[arg(short, long)]
    pub manifest: PathBuf,

    /// Installer to place in the package's Files folder
    #[arg(short, long)]
    pub installer: Option<PathBuf>,

    /// PSADT template folder (defaults to packaging.template_dir)
    #[arg(short, long)]
    pub template: Option<PathBuf>,

    /// Output folder (defaults to packaging.output_dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Replace an existing package folder
    #[arg(long)]
    pub force: bool,

    /// Also wrap the result as .intunewin
    #[arg(long)]
    pub wrap: bool,

    /// Wrap with IntuneWinAppUtil.exe instead of the native packager
    #[arg(long, requires = "wrap")]
    pub external: bool,
}

#[derive(Args, Debug)]
pub struct WrapArgs {
    /// Folder to package
    #[arg(short = 'c', long)]
    pub source: PathBuf,

    /// Setup file inside the folder (e.g. Invoke-AppDeployToolkit.exe, setup.msi)
    #[arg(short = 's', long)]
    pub setup_file: String,

    /// Output folder (defaults to packaging.output_dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// MSI product code recorded in Detection.xml
    #[arg(long)]
    pub product_code: Option<String>,

    /// Use IntuneWinAppUtil.exe instead of the native packager
    #[arg(long)]
    pub external: bool,

    /// Path to IntuneWinAppUtil.exe (implies --external)
    #[arg(long)]
    pub tool: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// .intunewin file
    pub file: PathBuf,

    /// Decrypt the payload and check MAC, digest and setup file
    #[arg(long)]
    pub verify: bool,

    /// List the files inside the payload (implies decryption)
    #[arg(long)]
    pub list: bool,
}

pub(crate) fn template_dir(explicit: Option<&Path>, settings: &PackagingSettings) -> Result<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| settings.template_dir.clone())
        .ok_or_else(|| {
            IntunePackError::ConfigError(
                "No PSADT template given; pass --template or set packaging.template_dir".into(),
            )
        })
}

pub(crate) fn build_package(
    manifest: &AppManifest,
    installer: Option<&Path>,
    template: &Path,
    output: &Path,
    force: bool,
) -> Result<BuiltPackage> {
    let spinner = create_spinner(&format!("Building {}...", manifest.display_name()));
    match PsadtBuilder::new(template, output)
        .force(force)
        .build(manifest, installer)
    {
        Ok(built) => {
            finish_spinner_success(
                &spinner,
                &format!("{} package ready ({} files updated)", built.flavor, built.files_updated),
            );
            Ok(built)
        }
        Err(e) => {
            finish_spinner_error(&spinner, "Package build failed");
            Err(e)
        }
    }
}

pub(crate) async fn wrap_folder(
    source: &Path,
    setup_file: &str,
    output: &Path,
    product_code: Option<&str>,
    external: Option<IntuneWinAppUtil>,
) -> Result<IntuneWinPackage> {
    let spinner = create_spinner(&format!("Wrapping {}...", source.display()));
    let result = match external {
        Some(tool) => {
            tracing::info!("Using {}", tool.exe().display());
            tool.run(source, setup_file, output).await
        }
        None => IntuneWinPackage::create(source, setup_file, output, product_code),
    };

    match result {
        Ok(package) => {
            finish_spinner_success(&spinner, &format!("Created {}", package.path.display()));
            Ok(package)
        }
        Err(e) => {
            finish_spinner_error(&spinner, "Wrapping failed");
            Err(e)
        }
    }
}

fn print_built(built: &BuiltPackage) {
    println!("  Folder:    {}", built.root.display().to_string().cyan());
    println!("  Setup:     {}", built.setup_file);
    println!("  Install:   {}", built.install_command.dimmed());
    println!("  Uninstall: {}", built.uninstall_command.dimmed());

    if !built.unresolved_tokens.is_empty() {
        println!(
            "\n{} {} placeholder(s) left unresolved:",
            "!".yellow().bold(),
            built.unresolved_tokens.len()
        );
        for unresolved in &built.unresolved_tokens {
            println!("  {} in {}", unresolved.token.yellow(), unresolved.file.display());
        }
    }
}

pub async fn build(args: BuildArgs) -> Result<()> {
    let config = super::local_config()?;
    let settings = &config.packaging;
    let manifest = AppManifest::load(&args.manifest)?;

    println!("{} {}", "Packaging".cyan().bold(), manifest.display_name());

    let template = template_dir(args.template.as_deref(), settings)?;
    let output = args.output.clone().unwrap_or_else(|| settings.output_dir.clone());
    let installer = args.installer.as_deref().map(|p| manifest.resolve_path(p));

    let built = build_package(&manifest, installer.as_deref(), &template, &output, args.force)?;
    print_built(&built);

    if args.wrap {
        let tool = if args.external {
            Some(IntuneWinAppUtil::locate(settings.intunewin_tool.as_deref())?)
        } else {
            None
        };
        let package = wrap_folder(
            &built.root,
            &built.setup_file,
            &built.wrap_dir(),
            manifest.installer.product_code.as_deref(),
            tool,
        )
        .await?;
        println!(
            "\n{} Next: {}",
            "→".cyan(),
            format!(
                "intunepack app upload {} --manifest {}",
                package.path.display(),
                args.manifest.display()
            )
            .bold()
        );
    }

    Ok(())
}

pub async fn wrap(args: WrapArgs) -> Result<()> {
    let config = super::local_config()?;
    let settings = &config.packaging;
    let output = args.output.clone().unwrap_or_else(|| settings.output_dir.clone());

    let tool = match (&args.tool, args.external) {
        (Some(path), _) => Some(IntuneWinAppUtil::locate(Some(path))?),
        (None, true) => Some(IntuneWinAppUtil::locate(settings.intunewin_tool.as_deref())?),
        (None, false) => None,
    };
    if tool.is_some() && args.product_code.is_some() {
        tracing::warn!("--product-code is ignored by IntuneWinAppUtil.exe");
    }

    let package = wrap_folder(
        &args.source,
        &args.setup_file,
        &output,
        args.product_code.as_deref(),
        tool,
    )
    .await?;

    println!("  Setup:     {}", package.info.setup_file);
    println!("  Size:      {} bytes", package.info.unencrypted_content_size);
    Ok(())
}

pub async fn inspect(args: InspectArgs) -> Result<()> {
    let package = IntuneWinPackage::open(&args.file)?;
    let info = &package.info;

    println!("\n{}", args.file.display().to_string().bold());
    println!("{}", "─".repeat(60));
    println!("  Name:            {}", info.name);
    println!("  Setup file:      {}", info.setup_file);
    println!("  Payload file:    {}", info.file_name);
    println!("  Plain size:      {} bytes", info.unencrypted_content_size);
    println!("  Encrypted size:  {} bytes", package.encrypted_size()?);
    if let Some(code) = &info.msi_product_code {
        println!("  MSI product:     {}", code);
    }
    println!("  Digest:          {}", info.encryption_info.file_digest.dimmed());

    if args.verify || args.list {
        package.verify()?;
        println!("\n{} Payload decrypts and matches Detection.xml", "✓".green());
    }

    if args.list {
        println!();
        for entry in package.payload_entries()? {
            println!("  {}", entry);
        }
    }

    Ok(())
}
