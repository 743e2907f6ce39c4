//! `app upload|publish|detection|groups|list|remove`

use super::package::{build_package, template_dir, wrap_folder};
use super::progress::create_upload_bar;
use super::{Session, confirm, connect};
use crate::detection;
use crate::error::Result;
use crate::graph::GraphClient;
use crate::graph::apps::{self, MobileApp};
use crate::graph::content::{ContentUploader, UploadCheckpoint, UploadOptions};
use crate::graph::groups::{self, AssignmentOptions};
use crate::manifest::AppManifest;
use crate::packaging::{IntuneWinAppUtil, IntuneWinPackage};
use clap::Args;
use colored::Colorize;
use indicatif::ProgressBar;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// .intunewin file
    pub package: PathBuf,

    /// App manifest (TOML)
    #[arg(short, long)]
    pub manifest: PathBuf,

    /// Upload as new content of this app instead of creating or matching one
    #[arg(long)]
    pub app_id: Option<String>,

    /// Also create the assignment groups and assign them
    #[arg(long)]
    pub assign: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
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

    /// Wrap with IntuneWinAppUtil.exe instead of the native packager
    #[arg(long)]
    pub external: bool,

    /// Group name prefix (defaults to packaging.group_prefix)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Stop after uploading; no groups or assignments
    #[arg(long)]
    pub skip_groups: bool,
}

#[derive(Args, Debug)]
pub struct DetectionArgs {
    /// Intune app ID
    pub app_id: String,

    /// App manifest holding the desired [[detection]] rules
    #[arg(short, long)]
    pub manifest: PathBuf,

    /// Show the difference without changing the app
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct GroupsArgs {
    /// Intune app ID
    pub app_id: String,

    /// App manifest (TOML)
    #[arg(short, long)]
    pub manifest: PathBuf,

    /// Group name prefix (defaults to packaging.group_prefix)
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only apps whose name contains this text
    #[arg(short, long)]
    pub filter: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Intune app ID
    pub app_id: String,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// App to upload into: explicit ID, an interrupted upload, a same-named app, or a new one
async fn target_app(
    graph: &GraphClient,
    manifest: &AppManifest,
    package: &IntuneWinPackage,
    explicit: Option<String>,
) -> Result<String> {
    if let Some(app_id) = explicit {
        reconcile_rules(graph, &app_id, manifest).await?;
        return Ok(app_id);
    }

    if let Some(checkpoint) = UploadCheckpoint::for_package(package)? {
        println!(
            "{} Resuming interrupted upload into {} ({} blocks done)",
            "→".cyan(),
            checkpoint.app_id,
            checkpoint.blocks_done
        );
        return Ok(checkpoint.app_id);
    }

    let display_name = manifest.display_name();
    if let Some(existing) = apps::find_app_by_name(graph, &display_name).await? {
        println!(
            "{} Found existing app {} ({})",
            "→".cyan(),
            existing.display_name.bold(),
            existing.id
        );
        reconcile_rules(graph, &existing.id, manifest).await?;
        return Ok(existing.id);
    }

    println!("{} Creating Win32 app {}...", "→".cyan(), display_name.bold());
    let body = apps::win32_app_body(manifest, package, &manifest.detection)?;
    let app = apps::create_win32_app(graph, &body).await?;
    println!("  {} Win32 app created: {}", "✓".green(), app.id);
    Ok(app.id)
}

async fn reconcile_rules(graph: &GraphClient, app_id: &str, manifest: &AppManifest) -> Result<()> {
    let plan = apps::reconcile_detection_rules(graph, app_id, &manifest.detection).await?;
    if plan.is_noop() {
        println!("  {} Detection rules unchanged", "✓".green());
    } else {
        println!(
            "  {} Detection rules updated ({} added, {} removed)",
            "✓".green(),
            plan.add.len(),
            plan.remove.len()
        );
    }
    Ok(())
}

async fn upload_content(
    session: &Session,
    manifest: &AppManifest,
    package: &IntuneWinPackage,
    explicit_app: Option<String>,
    show_progress: bool,
) -> Result<String> {
    let app_id = target_app(&session.graph, manifest, package, explicit_app).await?;

    let options = UploadOptions::from_settings(&session.config.packaging)?;
    let bar = if show_progress {
        create_upload_bar(0, "Uploading")
    } else {
        ProgressBar::hidden()
    };

    println!("\n{} Uploading {}...", "→".cyan(), package.path.display());
    let outcome = ContentUploader::new(&session.graph, options)
        .with_progress(bar)
        .upload(&app_id, package)
        .await?;

    println!(
        "  {} Content version {} committed ({} blocks{})",
        "✓".green(),
        outcome.content_version_id,
        outcome.blocks,
        if outcome.resumed_blocks > 0 {
            format!(", {} resumed", outcome.resumed_blocks)
        } else {
            String::new()
        }
    );
    Ok(app_id)
}

async fn assign_groups(
    graph: &GraphClient,
    manifest: &AppManifest,
    app_id: &str,
    prefix: &str,
) -> Result<()> {
    let label = manifest.label();
    println!("\n{} Resolving groups for {}...", "→".cyan(), label.bold());

    let resolved = groups::ensure_groups(graph, prefix, &label).await?;
    for group in &resolved {
        let state = if group.created {
            "created".green()
        } else {
            "exists".dimmed()
        };
        println!("  {} {} ({})", "•".cyan(), group.group.display_name, state);
    }

    let existing = apps::get_assignments(graph, app_id).await?;
    let plan = groups::plan_assignments(
        &existing,
        &resolved,
        AssignmentOptions::from(&manifest.assignments),
    );

    if groups::apply_assignments(graph, app_id, &plan).await? {
        println!(
            "  {} Assignments: {} added, {} updated, {} unchanged, {} other kept",
            "✓".green(),
            plan.added,
            plan.updated,
            plan.unchanged,
            plan.kept
        );
    } else {
        println!("  {} Assignments already up to date", "✓".green());
    }
    Ok(())
}

fn print_app_summary(app_id: &str) {
    println!("\n{} App deployed to Intune", "✓".green().bold());
    println!("  App ID: {}", app_id);
}

pub async fn upload(args: UploadArgs) -> Result<()> {
    let manifest = AppManifest::load(&args.manifest)?;
    let package = IntuneWinPackage::open(&args.package)?;
    let session = connect().await?;

    let app_id = upload_content(
        &session,
        &manifest,
        &package,
        args.app_id,
        !args.no_progress,
    )
    .await?;

    if args.assign {
        let prefix = session.config.packaging.group_prefix.clone();
        assign_groups(&session.graph, &manifest, &app_id, &prefix).await?;
    }

    print_app_summary(&app_id);
    Ok(())
}

pub async fn publish(args: PublishArgs) -> Result<()> {
    let manifest = AppManifest::load(&args.manifest)?;
    let session = connect().await?;
    let settings = &session.config.packaging;

    println!("{} {}", "Publishing".cyan().bold(), manifest.display_name());

    let template = template_dir(args.template.as_deref(), settings)?;
    let output = args.output.clone().unwrap_or_else(|| settings.output_dir.clone());
    let installer = args.installer.as_deref().map(|p| manifest.resolve_path(p));

    let built = build_package(&manifest, installer.as_deref(), &template, &output, args.force)?;
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

    let app_id = upload_content(&session, &manifest, &package, None, true).await?;

    if !args.skip_groups {
        let prefix = args
            .prefix
            .clone()
            .unwrap_or_else(|| settings.group_prefix.clone());
        assign_groups(&session.graph, &manifest, &app_id, &prefix).await?;
    }

    print_app_summary(&app_id);
    Ok(())
}

pub async fn detection(args: DetectionArgs) -> Result<()> {
    let manifest = AppManifest::load(&args.manifest)?;
    let session = connect().await?;

    if args.dry_run {
        let existing = apps::get_detection_rules(&session.graph, &args.app_id).await?;
        let plan = detection::plan(&existing, &manifest.detection);
        println!("\n{} (no changes made)", "DRY RUN".yellow().bold());
        for rule in &plan.keep {
            println!("  {} keep   {}", "=".dimmed(), rule);
        }
        for rule in &plan.add {
            println!("  {} add    {}", "+".green(), rule);
        }
        for rule in &plan.remove {
            println!("  {} remove {}", "-".red(), rule);
        }
        return Ok(());
    }

    reconcile_rules(&session.graph, &args.app_id, &manifest).await
}

pub async fn groups(args: GroupsArgs) -> Result<()> {
    let manifest = AppManifest::load(&args.manifest)?;
    let session = connect().await?;
    let prefix = args
        .prefix
        .unwrap_or_else(|| session.config.packaging.group_prefix.clone());
    assign_groups(&session.graph, &manifest, &args.app_id, &prefix).await
}

fn matches_filter(app: &MobileApp, filter: Option<&str>) -> bool {
    filter.is_none_or(|f| app.display_name.to_lowercase().contains(&f.to_lowercase()))
}

pub async fn list(args: ListArgs) -> Result<()> {
    let session = connect().await?;
    let found: Vec<MobileApp> = apps::list_win32_apps(&session.graph)
        .await?
        .into_iter()
        .filter(|app| matches_filter(app, args.filter.as_deref()))
        .collect();

    if found.is_empty() {
        println!("{} No Win32 apps found", "!".yellow());
        return Ok(());
    }

    println!("\n{}", "Win32 Apps:".bold());
    println!("{}", "─".repeat(80));
    for app in &found {
        let state = match app.publishing_state.as_deref() {
            Some("published") => "published".green(),
            Some(other) => other.yellow(),
            None => "unknown".dimmed(),
        };
        println!(
            "{} {} {}",
            app.display_name.bold(),
            app.display_version.as_deref().unwrap_or("").dimmed(),
            state
        );
        println!("  {}", app.id.dimmed());
    }
    println!("{}", "─".repeat(80));
    println!("{} {} app(s)", "→".cyan(), found.len());
    Ok(())
}

pub async fn remove(args: RemoveArgs) -> Result<()> {
    let session = connect().await?;
    let app = apps::get_app(&session.graph, &args.app_id).await?;
    let name = app["displayName"].as_str().unwrap_or("Unknown");

    if !confirm(
        &format!("Delete '{}' ({}) from {}?", name, args.app_id, session.tenant.name),
        args.yes,
    )? {
        println!("{}", "Cancelled.".yellow());
        return Ok(());
    }

    apps::delete_app(&session.graph, &args.app_id).await?;
    println!("{} Deleted {}", "✓".green(), name);
    Ok(())
}
