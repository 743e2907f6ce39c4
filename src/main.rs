use clap::{Parser, Subcommand};
use colored::Colorize;
use intunepack::{cmd, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "intunepack",
    about = "Package, wrap and publish Win32 apps to Microsoft Intune",
    version,
    long_about = "Build PSADT packages from an app manifest, wrap them as .intunewin,\n\
                  upload them to Intune with resumable chunked uploads, and manage\n\
                  detection rules, assignment groups and WDAC catalogs."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authenticate to Microsoft Graph
    Login(cmd::login::LoginArgs),

    /// Clear cached credentials
    Logout(cmd::login::LogoutArgs),

    /// Manage tenant configurations
    #[command(subcommand)]
    Tenant(TenantCommands),

    /// Build PSADT packages and .intunewin files
    #[command(subcommand)]
    Package(PackageCommands),

    /// Upload and manage Win32 apps in Intune
    #[command(subcommand)]
    App(AppCommands),

    /// WDAC catalog generation
    #[command(subcommand)]
    Wdac(WdacCommands),
}

#[derive(Subcommand, Debug)]
enum TenantCommands {
    /// Add a tenant configuration
    Add(cmd::tenant::TenantAddArgs),

    /// List configured tenants
    List(cmd::tenant::TenantListArgs),

    /// Switch the active tenant
    Switch(cmd::tenant::TenantSwitchArgs),

    /// Remove a tenant configuration
    Remove(cmd::tenant::TenantRemoveArgs),
}

#[derive(Subcommand, Debug)]
enum PackageCommands {
    /// Fill a PSADT template from an app manifest
    Build(cmd::package::BuildArgs),

    /// Wrap a folder as .intunewin
    Wrap(cmd::package::WrapArgs),

    /// Show what an .intunewin contains
    Inspect(cmd::package::InspectArgs),
}

#[derive(Subcommand, Debug)]
enum AppCommands {
    /// Upload an .intunewin (resumes interrupted uploads)
    Upload(cmd::app::UploadArgs),

    /// Build, wrap, upload and assign in one go
    Publish(cmd::app::PublishArgs),

    /// Reconcile an app's detection rules with a manifest
    Detection(cmd::app::DetectionArgs),

    /// Create or reuse the assignment groups and assign them
    Groups(cmd::app::GroupsArgs),

    /// List Win32 apps
    List(cmd::app::ListArgs),

    /// Delete an app
    Remove(cmd::app::RemoveArgs),
}

#[derive(Subcommand, Debug)]
enum WdacCommands {
    /// Generate a catalog (.cdf, hash manifest, .cat) for a folder
    Catalog(cmd::wdac::CatalogArgs),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("intunepack=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> error::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Login(args) => cmd::login::login(args).await?,
        Commands::Logout(args) => cmd::login::logout(args).await?,
        Commands::Tenant(tenant_cmd) => match tenant_cmd {
            TenantCommands::Add(args) => cmd::tenant::add(args).await?,
            TenantCommands::List(args) => cmd::tenant::list(args).await?,
            TenantCommands::Switch(args) => cmd::tenant::switch(args).await?,
            TenantCommands::Remove(args) => cmd::tenant::remove(args).await?,
        },
        Commands::Package(package_cmd) => match package_cmd {
            PackageCommands::Build(args) => cmd::package::build(args).await?,
            PackageCommands::Wrap(args) => cmd::package::wrap(args).await?,
            PackageCommands::Inspect(args) => cmd::package::inspect(args).await?,
        },
        Commands::App(app_cmd) => match app_cmd {
            AppCommands::Upload(args) => cmd::app::upload(args).await?,
            AppCommands::Publish(args) => cmd::app::publish(args).await?,
            AppCommands::Detection(args) => cmd::app::detection(args).await?,
            AppCommands::Groups(args) => cmd::app::groups(args).await?,
            AppCommands::List(args) => cmd::app::list(args).await?,
            AppCommands::Remove(args) => cmd::app::remove(args).await?,
        },
        Commands::Wdac(wdac_cmd) => match wdac_cmd {
            WdacCommands::Catalog(args) => cmd::wdac::catalog(args).await?,
        },
    }

    Ok(())
}
