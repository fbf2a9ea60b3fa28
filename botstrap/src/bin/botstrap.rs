//! `botstrap` command line: build images, inspect plans and history, and
//! launch the payload inside a running container.

use anyhow::{Context, Result};
use botstrap::build::{ImageBuilder, StageSpec};
use botstrap::db::{BuildStore, Database};
use botstrap::launch::{LaunchOptions, launch};
use botstrap::logging::init_logging;
use botstrap::recipe::Recipe;
use botstrap::runtime::constants::image_paths;
use botstrap::runtime::{BotstrapOptions, FilesystemLayout};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "botstrap", version, about = "Secure bootstrap pipeline for bot container images")]
struct Cli {
    /// State directory for logs and build history (default: $BOTSTRAP_HOME or ~/.botstrap)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an OCI image layout from a recipe
    Build {
        /// Path to botstrap.toml
        recipe: PathBuf,

        /// Output directory; must not exist yet
        #[arg(short, long, default_value = "image")]
        output: PathBuf,

        /// Do not record the build in the history database
        #[arg(long)]
        no_history: bool,
    },

    /// Validate a recipe and print the stage plan
    Plan {
        recipe: PathBuf,
    },

    /// Bind secrets and exec the payload (container entrypoint)
    Launch {
        /// Launch spec written at build time
        #[arg(long, default_value = image_paths::LAUNCH_SPEC)]
        spec: PathBuf,

        /// Directory of mounted secret files
        #[arg(long, default_value = image_paths::SECRETS_DIR)]
        secrets_dir: PathBuf,

        /// Payload argv, replaces the one in the launch spec
        #[arg(last = true)]
        argv: Vec<String>,
    },

    /// Show recent builds
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

fn options(home: Option<PathBuf>) -> BotstrapOptions {
    match home {
        Some(home) => BotstrapOptions::with_home(home),
        None => BotstrapOptions::default(),
    }
}

async fn run_build(
    options: BotstrapOptions,
    recipe_path: PathBuf,
    output: PathBuf,
    no_history: bool,
) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;

    let mut builder = ImageBuilder::new(recipe, &output)?.with_recipe_path(&recipe_path);
    if options.record_history && !no_history {
        let layout = FilesystemLayout::new(options.home_dir.clone());
        match Database::open(&layout.db_path()) {
            Ok(db) => builder = builder.with_history(BuildStore::new(db)),
            Err(e) => tracing::warn!("Build history disabled: {}", e),
        }
    }

    let outcome = builder.build().await?;

    println!("build     {}", outcome.build_id);
    println!("output    {}", outcome.output.display());
    println!("manifest  {}", outcome.image.manifest_digest);
    println!("layers    {}", outcome.image.layers);
    for entry in &outcome.ledger.entries {
        println!(
            "  {:<13} {:<24} {:>6} paths  {:>6} ms  {}",
            entry.stage, entry.to, entry.changed_paths, entry.duration_ms, entry.identity
        );
    }
    Ok(())
}

fn run_plan(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let builder = ImageBuilder::new(recipe, "unused")?;
    builder.plan().validate()?;

    println!("{:<3} {:<13} {:<13} {:<11} PREREQUISITES", "#", "STAGE", "PRIVILEGE", "KIND");
    for (index, StageSpec { kind, prerequisites, privilege, idempotency }) in
        builder.plan().stages().iter().enumerate()
    {
        let prerequisites = prerequisites
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<3} {:<13} {:<13} {:<11} {}",
            index + 1,
            kind.name(),
            privilege.to_string(),
            idempotency.to_string(),
            prerequisites
        );
    }
    Ok(())
}

fn run_history(options: BotstrapOptions, limit: usize) -> Result<()> {
    let layout = FilesystemLayout::new(options.home_dir);
    let db_path = layout.db_path();
    if !db_path.exists() {
        println!("no builds recorded");
        return Ok(());
    }
    let store = BuildStore::new(
        Database::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
    );

    for record in store.list(limit)? {
        println!(
            "{}  {:<9}  {:<22}  {}  {}",
            record.id,
            record.status.to_string(),
            record.state,
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.output
        );
        if let Some(error) = &record.error {
            println!("    {}", error);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let options = options(cli.home);

    match cli.command {
        Command::Build {
            recipe,
            output,
            no_history,
        } => {
            let layout = FilesystemLayout::new(options.home_dir.clone());
            let _guard = init_logging(options.log_to_file.then_some(&layout))?;
            run_build(options, recipe, output, no_history).await
        }
        Command::Plan { recipe } => {
            let _guard = init_logging(None)?;
            run_plan(recipe)
        }
        Command::Launch {
            spec,
            secrets_dir,
            argv,
        } => {
            let _guard = init_logging(None)?;
            let options = LaunchOptions {
                spec_path: spec,
                secrets_dir,
                argv,
            };
            match launch(&options)? {}
        }
        Command::History { limit } => {
            let _guard = init_logging(None)?;
            run_history(options, limit)
        }
    }
}
