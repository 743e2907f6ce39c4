use super::progress::{create_spinner, finish_spinner_error, finish_spinner_success};
use crate::error::Result;
use crate::wdac::{self, CatalogRequest};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct CatalogArgs {
    /// Folder whose files go into the catalog
    pub source: PathBuf,

    /// Where the .cdf, .cat and hash manifest are written (defaults to packaging.output_dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Catalog name (defaults to the folder name)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Only these extensions, e.g. --extensions exe,dll,ps1
    #[arg(short, long, value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Path to makecat.exe (defaults to packaging.makecat_path, then PATH)
    #[arg(long)]
    pub makecat: Option<PathBuf>,

    /// Write the .cdf and hash manifest without running makecat
    #[arg(long)]
    pub cdf_only: bool,
}

pub async fn catalog(args: CatalogArgs) -> Result<()> {
    let config = super::local_config()?;
    let settings = &config.packaging;

    let name = args.name.clone().unwrap_or_else(|| {
        args.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "catalog".to_string())
    });

    let request = CatalogRequest {
        source_dir: args.source.clone(),
        output_dir: args.output.clone().unwrap_or_else(|| settings.output_dir.clone()),
        name,
        extensions: args.extensions,
        makecat: args.makecat.or_else(|| settings.makecat_path.clone()),
        cdf_only: args.cdf_only,
    };

    let spinner = create_spinner(&format!("Cataloging {}...", args.source.display()));
    let result = match wdac::generate(&request).await {
        Ok(result) => {
            finish_spinner_success(&spinner, &format!("{} files cataloged", result.files));
            result
        }
        Err(e) => {
            finish_spinner_error(&spinner, "Catalog generation failed");
            return Err(e);
        }
    };

    println!("  CDF:       {}", result.cdf_path.display());
    println!("  Hashes:    {}", result.manifest_path.display());
    match &result.catalog_path {
        Some(cat) => println!("  Catalog:   {}", cat.display().to_string().green()),
        None => println!(
            "\n{} Run {} to build the catalog",
            "→".cyan(),
            format!("makecat.exe -v {}", result.cdf_path.display()).bold()
        ),
    }
    Ok(())
}
