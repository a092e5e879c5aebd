use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use atlas_pipeline_core::grouping::{BundlePredicate, group};
use atlas_pipeline_core::store::{DirStore, MemoryStore, ResourceStore};
use atlas_pipeline_core::{
    AtlasPipelineError, BuildOutput, PipelineConfig, ResourceKind, TransparentPolicy,
    atlas_frames_json, run_build,
};
use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info, warn};

mod import;

use import::{Manifest, import, preview_resources, scan};

#[derive(Parser, Debug)]
#[command(
    name = "atlas-pipeline",
    about = "Group images by tag/episode rules and build cached texture atlases",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Show progress bars (disable with --progress false or --quiet)
    #[arg(long, default_value_t = true, action=ArgAction::Set, global=true, help_heading = "Logging/UX")]
    progress: bool,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action=ArgAction::Count, global=true, help_heading = "Logging/UX")]
    verbose: u8,
    /// Quiet mode (overrides verbose)
    #[arg(
        short,
        long,
        default_value_t = false,
        global = true,
        help_heading = "Logging/UX"
    )]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import images, pack every bundle group and write atlases plus the manifest
    Build(BuildArgs),
    /// Print which images each bundle group would receive
    Groups(GroupsArgs),
}

#[derive(Parser, Debug, Clone)]
struct InputArgs {
    /// Input file or directory
    #[arg(help_heading = "Input/Output")]
    input: PathBuf,
    /// Groups YAML: { config?, dedup?, groups: [..] }
    #[arg(short, long, help_heading = "Input/Output")]
    groups: PathBuf,
    /// Include patterns (glob, relative to input). If set, only matching files are imported
    #[arg(long, help_heading = "Input/Output")]
    include: Vec<String>,
    /// Exclude patterns (glob, relative to input)
    #[arg(long, help_heading = "Input/Output")]
    exclude: Vec<String>,
}

#[derive(Parser, Debug, Clone)]
struct GroupsArgs {
    #[command(flatten)]
    input: InputArgs,
}

#[derive(Parser, Debug, Clone)]
struct BuildArgs {
    #[command(flatten)]
    input: InputArgs,
    /// Output directory (store, manifest.json, atlases.json)
    #[arg(short, long, default_value = "out", help_heading = "Input/Output")]
    out: PathBuf,
    /// Build id recorded on atlases; defaults to one past the last build in the manifest
    #[arg(long, help_heading = "Input/Output")]
    build_id: Option<u32>,

    // Packing
    /// Largest atlas side
    #[arg(long, help_heading = "Packing")]
    max_dimension: Option<u32>,
    /// Padding between packed images
    #[arg(long, help_heading = "Packing")]
    texture_padding: Option<u32>,
    /// Disable 90° rotation
    #[arg(long, default_value_t = false, help_heading = "Packing")]
    no_rotation: bool,
    /// Process groups in parallel (requires feature `parallel`)
    #[arg(long, default_value_t = false, help_heading = "Packing")]
    parallel: bool,

    // Image Processing
    /// Alpha threshold for envelopes (0..=255)
    #[arg(long, help_heading = "Image Processing")]
    alpha_threshold: Option<u8>,
    /// Envelope of fully transparent images: one_by_one | full_frame
    #[arg(long, help_heading = "Image Processing")]
    transparent_policy: Option<String>,

    // Export
    /// Export the build report (JSON) to this file
    #[arg(long, help_heading = "Export")]
    export_report: Option<PathBuf>,
    /// Print the merged configuration (after YAML/CLI) and exit
    #[arg(long, default_value_t = false, help_heading = "Export")]
    print_config: bool,
    /// Output format for --print-config: json|yaml
    #[arg(long, default_value = "json", value_parser = ["json", "yaml"], help_heading = "Export")]
    print_config_format: String,
    /// Dry run: build in memory and write nothing
    #[arg(long, default_value_t = false, help_heading = "Export")]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct GroupsFile {
    #[serde(default)]
    config: Option<PipelineConfig>,
    /// Overrides `config.deduplicate_groups`.
    #[serde(default)]
    dedup: Option<bool>,
    groups: Vec<BundlePredicate>,
}

impl GroupsFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let file: GroupsFile =
            serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        if file.groups.is_empty() {
            anyhow::bail!("{} declares no groups", path.display());
        }
        Ok(file)
    }

    fn config(&self) -> PipelineConfig {
        let mut cfg = self.config.clone().unwrap_or_default();
        if let Some(d) = self.dedup {
            cfg.deduplicate_groups = d;
        }
        cfg
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_with_level(cli.quiet, cli.verbose);
    match &cli.command {
        Commands::Build(args) => run_build_cmd(args, cli.progress && !cli.quiet),
        Commands::Groups(args) => run_groups_cmd(args),
    }
}

fn merged_config(args: &BuildArgs, file: &GroupsFile) -> anyhow::Result<PipelineConfig> {
    let mut cfg = file.config();
    if let Some(v) = args.max_dimension {
        cfg.max_dimension = v;
    }
    if let Some(v) = args.texture_padding {
        cfg.texture_padding = v;
    }
    if let Some(v) = args.alpha_threshold {
        cfg.alpha_threshold = v;
    }
    if let Some(p) = &args.transparent_policy {
        cfg.transparent_policy = p
            .parse::<TransparentPolicy>()
            .map_err(|_| anyhow::anyhow!("unknown transparent policy: {p}"))?;
    }
    if args.no_rotation {
        cfg.allow_rotation = false;
    }
    if args.parallel {
        cfg.parallel = true;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run_build_cmd(args: &BuildArgs, show_progress: bool) -> anyhow::Result<()> {
    let groups_file = GroupsFile::load(&args.input.groups)?;
    let cfg = merged_config(args, &groups_file)?;
    if args.print_config {
        match args.print_config_format.as_str() {
            "yaml" => println!("{}", serde_yaml::to_string(&cfg)?),
            _ => println!("{}", serde_json::to_string_pretty(&cfg)?),
        }
        return Ok(());
    }

    let manifest_path = args.out.join("manifest.json");
    let manifest = Manifest::load(&manifest_path)?;
    let build_id = args
        .build_id
        .unwrap_or_else(|| manifest.last_build_id().map_or(1, |b| b + 1));
    let files = scan(&args.input.input, &args.input.include, &args.input.exclude)?;
    info!(count = files.len(), build_id, "found input images");

    let result = if args.dry_run {
        let store = MemoryStore::new();
        let seeded = seed_cached_atlases(&manifest, &args.out.join("store"), &store);
        info!(seeded, "dry run: cached atlases loaded");
        let resources = import(&files, manifest.resources, &store, show_progress)?;
        run_build(resources, &groups_file.groups, build_id, &store, &cfg)
    } else {
        fs::create_dir_all(&args.out)
            .with_context(|| format!("create out dir {}", args.out.display()))?;
        let store = DirStore::new(args.out.join("store"))?;
        let resources = import(&files, manifest.resources, &store, show_progress)?;
        run_build(resources, &groups_file.groups, build_id, &store, &cfg)
    };

    let (output, failure) = match result {
        Ok(output) => (output, None),
        Err(AtlasPipelineError::GroupsFailed {
            failed,
            total,
            output,
        }) => {
            for g in output.report.groups.iter().filter(|g| g.is_failed()) {
                error!(group = %g.name, error = g.error.as_deref().unwrap_or(""), "group failed");
            }
            (*output, Some(format!("{failed} of {total} bundle groups failed")))
        }
        Err(e) => return Err(e.into()),
    };

    info!("{}", output.report.summary());
    if args.dry_run {
        info!("dry run: nothing written");
    } else {
        write_outputs(args, &output)?;
    }
    if let Some(msg) = failure {
        anyhow::bail!(msg);
    }
    Ok(())
}

/// Copies binaries of recorded atlases into the in-memory store so a dry run sees cache hits.
/// Returns how many were copied.
fn seed_cached_atlases(manifest: &Manifest, store_dir: &Path, store: &MemoryStore) -> usize {
    if !store_dir.is_dir() {
        return 0;
    }
    let disk = match DirStore::new(store_dir) {
        Ok(disk) => disk,
        Err(e) => {
            warn!(dir = %store_dir.display(), error = %e, "atlas store unavailable; dry run sees no cache hits");
            return 0;
        }
    };
    let mut seeded = 0;
    for atlas in manifest
        .resources
        .iter()
        .filter(|r| r.kind == ResourceKind::Atlas)
    {
        let key = atlas.reference.to_string();
        match disk.read(&key).and_then(|bytes| store.write(&key, &bytes)) {
            Ok(()) => seeded += 1,
            Err(e) => warn!(atlas = atlas.id, error = %e, "cached atlas not available"),
        }
    }
    seeded
}

fn write_outputs(args: &BuildArgs, output: &BuildOutput) -> anyhow::Result<()> {
    let manifest = Manifest {
        resources: output.resources.clone(),
    };
    let manifest_path = args.out.join("manifest.json");
    manifest.save(&manifest_path)?;
    info!(?manifest_path, resources = output.resources.len(), "manifest written");

    let atlases_path = args.out.join("atlases.json");
    let json = serde_json::to_string_pretty(&atlas_frames_json(&output.resources))?;
    fs::write(&atlases_path, json).with_context(|| format!("write {}", atlases_path.display()))?;
    info!(?atlases_path, atlases = output.atlases().count(), "atlas frames written");

    if let Some(report_path) = &args.export_report {
        fs::write(report_path, serde_json::to_string_pretty(&output.report)?)
            .with_context(|| format!("write {}", report_path.display()))?;
        info!(?report_path, "report written");
    }
    Ok(())
}

fn run_groups_cmd(args: &GroupsArgs) -> anyhow::Result<()> {
    let groups_file = GroupsFile::load(&args.input.groups)?;
    let cfg = groups_file.config();
    let files = scan(&args.input.input, &args.input.include, &args.input.exclude)?;
    let resources = preview_resources(&files);
    let groups = group(&resources, &groups_file.groups, cfg.deduplicate_groups);
    let mut claimed = 0usize;
    for g in &groups {
        println!("{} ({} images)", g.name(), g.members.len());
        for r in &g.members {
            println!("  {}", r.name);
        }
        claimed += g.members.len();
    }
    info!(
        images = resources.len(),
        claimed,
        dedup = cfg.deduplicate_groups,
        "group preview"
    );
    Ok(())
}

fn init_tracing_with_level(quiet: bool, verbose: u8) {
    let level = if quiet {
        "error".to_string()
    } else {
        match verbose {
            0 => "info".into(),
            1 => "debug".into(),
            _ => "trace".into(),
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_target(false)
        .try_init();
}
