use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};

use kiln::config::UserConfig;
use kiln::context::Context;
use kiln::element::ElementId;
use kiln::planner;
use kiln::project::{self, LoadedProject, PROJECT_FILE};
use kiln::scheduler::{Reporter, Scheduler, SchedulerSummary, SessionMode};

#[derive(Parser, Debug)]
#[command(name = "kiln", version)]
#[command(about = "Content-addressed, cached builds for element graphs")]
struct Cli {
    /// Path to the project file.
    #[arg(long, default_value = PROJECT_FILE)]
    project: PathBuf,

    /// Path to the user configuration (default: $XDG_CONFIG_HOME/kiln/kiln.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the cache directory.
    #[arg(long)]
    cachedir: Option<PathBuf>,

    /// Tolerate weak-key cache hits instead of strict rebuilds.
    #[arg(long)]
    no_strict: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the depth-ordered build plan for the targets.
    Plan { targets: Vec<String> },
    /// Build the targets (pulling and fetching as needed).
    Build {
        targets: Vec<String>,
        /// Track source refs before building.
        #[arg(long)]
        track: bool,
    },
    /// Fetch sources for the targets without building.
    Fetch { targets: Vec<String> },
    /// Pull artifacts for the targets from configured remotes.
    Pull { targets: Vec<String> },
    /// Push locally cached artifacts for the targets.
    Push { targets: Vec<String> },
    /// Track source refs for the targets.
    Track { targets: Vec<String> },
    /// Show element states and cache keys.
    Show { targets: Vec<String> },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        println!("{}", msg);
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("warning: {}", msg);
    }

    fn error(&mut self, msg: &str) {
        eprintln!("error: {}", msg);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => UserConfig::load(path)?,
        None => UserConfig::load_default()?,
    };
    if let Some(cachedir) = &cli.cachedir {
        config.cachedir = Some(cachedir.clone());
    }
    if cli.no_strict {
        config.strict = false;
    }

    let ctx = Context::new(config)?;
    let project = project::load_project(&ctx, &cli.project)?;
    let base_dir = cli
        .project
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    match &cli.cmd {
        Commands::Plan { targets } => {
            let ids = resolve_targets(&project, targets)?;
            for (id, depth) in planner::plan(&project.graph, &ids) {
                let element = project.graph.get(id);
                println!("{:>3}  {}", depth, element.decl.name);
            }
            Ok(())
        }
        Commands::Show { targets } => {
            let mut graph = project.graph;
            let ids: Vec<ElementId> = if targets.is_empty() {
                graph.ids().collect()
            } else {
                targets
                    .iter()
                    .map(|name| lookup(&graph, name))
                    .collect::<Result<_>>()?
            };
            for id in graph.ids().collect::<Vec<_>>() {
                graph.update_cache_keys(id, ctx.strict)?;
            }
            for id in ids {
                let element = graph.get(id);
                println!(
                    "{:<40} {:?} {}",
                    element.decl.name,
                    graph.state(id),
                    element.display_key()
                );
            }
            Ok(())
        }
        Commands::Build { targets, track } => {
            run_session(&ctx, project, base_dir, targets, SessionMode::Build, *track)
        }
        Commands::Fetch { targets } => {
            run_session(&ctx, project, base_dir, targets, SessionMode::Fetch, false)
        }
        Commands::Pull { targets } => {
            run_session(&ctx, project, base_dir, targets, SessionMode::Pull, false)
        }
        Commands::Push { targets } => {
            run_session(&ctx, project, base_dir, targets, SessionMode::Push, false)
        }
        Commands::Track { targets } => {
            run_session(&ctx, project, base_dir, targets, SessionMode::Track, false)
        }
    }
}

fn run_session(
    ctx: &Context,
    mut project: LoadedProject,
    base_dir: PathBuf,
    targets: &[String],
    mode: SessionMode,
    track: bool,
) -> Result<()> {
    let ids = resolve_targets(&project, targets)?;
    let mut reporter = CliReporter;
    let scheduler = Scheduler::new(ctx, &mut project.graph, base_dir, &mut reporter)?;
    let summary = scheduler.run(&ids, mode, track)?;
    print_summary(&summary);
    ctx.enforce_quota()?;

    if !summary.success() {
        bail!("session finished with failures");
    }
    Ok(())
}

fn print_summary(summary: &SchedulerSummary) {
    let mut parts = Vec::new();
    for (label, list) in [
        ("tracked", &summary.tracked),
        ("pulled", &summary.pulled),
        ("fetched", &summary.fetched),
        ("built", &summary.built),
        ("pushed", &summary.pushed),
    ] {
        if !list.is_empty() {
            parts.push(format!("{} {}", list.len(), label));
        }
    }
    if parts.is_empty() {
        parts.push("nothing to do".to_string());
    }
    println!("session complete: {}", parts.join(", "));

    for (name, reason) in &summary.push_skipped {
        println!("push skipped for {}: {}", name, reason);
    }
    for (name, error) in &summary.failed {
        eprintln!("failed: {}: {}", name, error);
    }
    for (name, reason) in &summary.skipped {
        eprintln!("skipped: {}: {}", name, reason);
    }
    if summary.cancelled {
        eprintln!("session was cancelled");
    }
}

fn resolve_targets(project: &LoadedProject, targets: &[String]) -> Result<Vec<ElementId>> {
    if targets.is_empty() {
        return Ok(project.graph.ids().collect());
    }
    targets
        .iter()
        .map(|name| lookup(&project.graph, name))
        .collect()
}

fn lookup(graph: &kiln::element::Graph, name: &str) -> Result<ElementId> {
    graph
        .lookup(name)
        .with_context(|| format!("no such element: {}", name))
}
