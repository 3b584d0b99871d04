use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{debug, instrument};
use tracing_subscriber::EnvFilter;

use migration_graph_core::executor::PruneOutcome;
use migration_graph_core::planner::{self, Direction};
use migration_graph_core::{
    FileSystemSource, Ledger, MemoryBackend, MigrationError, MigrationEvent, MigrationExecutor,
    MigrationObserver, MigratorConfig, PlanStep, ProjectState, Target,
};

type Executor = MigrationExecutor<ProjectState, MemoryBackend>;

/// Default location of the storage file, relative to the project root.
const DEFAULT_DATABASE: &str = ".migrator/state.json";

/// migrator - Graph, plan and apply schema migrations
#[derive(Parser)]
#[command(name = "migrator")]
#[command(version)] // Auto-pull version from Cargo.toml
#[command(about = "Graph, plan and apply dependency-linked schema migrations", long_about = None)]
struct Cli {
    /// Project root holding `migrator.toml` and the component directories
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Storage file (defaults to .migrator/state.json under the root)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// More logging (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the storage to the state of a set of migrations
    Migrate {
        /// Component to migrate; all components when omitted
        component: Option<String>,
        /// Migration name or unique prefix; `zero` unapplies the component
        migration: Option<String>,
        /// Record migrations without running them
        #[arg(long)]
        fake: bool,
        /// Print the planned operations and exit
        #[arg(long)]
        plan: bool,
        /// Exit with a non-zero status if unapplied migrations exist
        #[arg(long)]
        check: bool,
        /// Delete ledger rows of migrations no longer on disk
        #[arg(long)]
        prune: bool,
    },
    /// List migrations and whether they are applied
    Show {
        /// Restrict the listing to one component
        component: Option<String>,
    },
    /// Print components with conflicting leaf migrations
    Conflicts,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let database = cli
        .database
        .clone()
        .unwrap_or_else(|| cli.root.join(DEFAULT_DATABASE));

    match cli.command {
        Commands::Migrate {
            component,
            migration,
            fake,
            plan,
            check,
            prune,
        } => cmd_migrate(
            &cli.root,
            &database,
            component.as_deref(),
            migration.as_deref(),
            MigrateFlags {
                fake,
                plan,
                check,
                prune,
            },
        ),
        Commands::Show { component } => cmd_show(&cli.root, &database, component.as_deref()),
        Commands::Conflicts => cmd_conflicts(&cli.root, &database),
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_executor(root: &Path, database: &Path) -> Result<Executor> {
    let config = MigratorConfig::load(root)
        .with_context(|| format!("failed to read config under {}", root.display()))?;
    let backend = MemoryBackend::open(database)
        .with_context(|| format!("failed to open database {}", database.display()))?;
    let source = FileSystemSource::new(root, config.clone());
    let ledger = Ledger::new(config.ledger_table.clone());
    debug!(root = %root.display(), database = %database.display(), "opening project");
    let executor = MigrationExecutor::new(&source, backend, ledger, config.loader_config())
        .context("failed to load migrations")?;
    Ok(executor)
}

fn save(executor: &Executor, database: &Path) -> Result<()> {
    executor
        .adapter()
        .save(database)
        .with_context(|| format!("failed to save database {}", database.display()))
}

struct MigrateFlags {
    fake: bool,
    plan: bool,
    check: bool,
    prune: bool,
}

#[instrument(skip(root, database, flags))]
fn cmd_migrate(
    root: &Path,
    database: &Path,
    component: Option<&str>,
    migration: Option<&str>,
    flags: MigrateFlags,
) -> Result<ExitCode> {
    let executor = open_executor(root, database)?;
    let mut executor = executor.with_observer(ProgressPrinter);

    executor.check_consistent_history()?;

    let conflicts = executor.loader().detect_conflicts();
    if !conflicts.is_empty() {
        let err = MigrationError::ConflictingLeaves { conflicts };
        bail!("{err}\nTo fix them, add a merge migration depending on every leaf.");
    }

    if let Some(component) = component {
        let loader = executor.loader();
        if !loader.migrated_components().contains(component) {
            if loader.unmigrated_components().contains(component) {
                return Err(MigrationError::UnmigratedComponent {
                    component: component.to_string(),
                }
                .into());
            }
            return Err(MigrationError::UnknownComponent {
                component: component.to_string(),
            }
            .into());
        }
    }

    let targets = match (component, migration) {
        (Some(component), Some("zero")) => vec![Target::Zero(component.to_string())],
        (Some(component), Some(prefix)) => {
            vec![Target::Node(executor.loader().resolve_target(component, prefix)?)]
        }
        (Some(component), None) => planner::leaf_targets(executor.loader().graph(), Some(component)),
        (None, _) => planner::leaf_targets(executor.loader().graph(), None),
    };

    if flags.prune {
        let Some(component) = component else {
            bail!("migrations can be pruned only when a component is specified");
        };
        println!("Pruning migrations:");
        match executor.prune(component)? {
            PruneOutcome::Blocked(squashes) => {
                println!(
                    "  Cannot prune because these squashed migrations still list pruned rows in 'replaces':"
                );
                for key in squashes {
                    println!("    {key}");
                }
                println!("  Re-run 'migrator migrate' if they are not applied, then remove their 'replaces' entries.");
            }
            PruneOutcome::Pruned(keys) if keys.is_empty() => println!("  No migrations to prune."),
            PruneOutcome::Pruned(keys) => {
                for key in keys {
                    println!("  Pruned {key}");
                }
            }
        }
    }

    let plan = executor.migration_plan(&targets)?;

    if flags.plan {
        println!("Planned operations:");
        if plan.is_empty() {
            println!("  No planned migration operations.");
        }
        for step in &plan {
            print_step(&executor, step);
        }
        if flags.check && !plan.is_empty() {
            return Ok(ExitCode::FAILURE);
        }
        return Ok(ExitCode::SUCCESS);
    }
    if flags.check {
        return Ok(if plan.is_empty() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }
    if flags.prune {
        save(&executor, database)?;
        return Ok(ExitCode::SUCCESS);
    }

    println!("Running migrations:");
    if plan.is_empty() {
        println!("  No migrations to apply.");
    }
    let result = executor.migrate(&plan, flags.fake);
    // Persist whatever was recorded, including partial progress.
    save(&executor, database)?;
    result.context("migration failed")?;
    Ok(ExitCode::SUCCESS)
}

fn print_step(executor: &Executor, step: &PlanStep) {
    println!("{}", step.key);
    let Some(migration) = executor.loader().graph().node(&step.key) else {
        return;
    };
    for operation in &migration.operations {
        let line = match step.direction {
            Direction::Apply => operation.describe(),
            Direction::Unapply if operation.reversible() => format!("Undo {}", operation.describe()),
            Direction::Unapply => format!("Undo {} -> IRREVERSIBLE", operation.describe()),
        };
        println!("    {line}");
    }
}

fn cmd_show(root: &Path, database: &Path, component: Option<&str>) -> Result<ExitCode> {
    let executor = open_executor(root, database)?;
    let loader = executor.loader();
    let graph = loader.graph();

    let components: Vec<&String> = match component {
        Some(c) if loader.migrated_components().contains(c) || loader.unmigrated_components().contains(c) => {
            loader
                .migrated_components()
                .iter()
                .chain(loader.unmigrated_components())
                .filter(|name| name.as_str() == c)
                .collect()
        }
        Some(c) => {
            return Err(MigrationError::UnknownComponent {
                component: c.to_string(),
            }
            .into())
        }
        None => loader
            .migrated_components()
            .iter()
            .chain(loader.unmigrated_components())
            .collect(),
    };

    for name in components {
        println!("{name}");
        if loader.unmigrated_components().contains(name) {
            println!(" (no migrations)");
            continue;
        }
        let targets = planner::leaf_targets(graph, Some(name.as_str()));
        let steps = planner::plan(graph, &Default::default(), &targets)?;
        let mut shown = 0;
        for step in steps.iter().filter(|s| &s.key.component == name) {
            let migration = graph.node(&step.key);
            let mark = if loader.is_applied(&step.key) { "X" } else { " " };
            match migration {
                Some(m) if m.is_squash() => println!(
                    " [{mark}] {} ({} squashed migrations)",
                    step.key.name,
                    m.replaces.len()
                ),
                _ => println!(" [{mark}] {}", step.key.name),
            }
            shown += 1;
        }
        if shown == 0 {
            println!(" (no migrations)");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_conflicts(root: &Path, database: &Path) -> Result<ExitCode> {
    let executor = open_executor(root, database)?;
    let conflicts = executor.loader().detect_conflicts();
    if conflicts.is_empty() {
        println!("No conflicts detected.");
        return Ok(ExitCode::SUCCESS);
    }
    for (component, leaves) in &conflicts {
        println!("{component}: {}", leaves.join(", "));
    }
    Ok(ExitCode::FAILURE)
}

/// Prints one line per migration as the plan runs.
struct ProgressPrinter;

impl MigrationObserver<ProjectState> for ProgressPrinter {
    fn on_event(&mut self, event: &MigrationEvent) {
        let mut stdout = std::io::stdout();
        match event {
            MigrationEvent::ApplyStart { key, .. } => {
                let _ = write!(stdout, "  Applying {key}...");
            }
            MigrationEvent::UnapplyStart { key, .. } => {
                let _ = write!(stdout, "  Unapplying {key}...");
            }
            MigrationEvent::ApplySuccess { fake, .. } | MigrationEvent::UnapplySuccess { fake, .. } => {
                let _ = writeln!(stdout, "{}", if *fake { " FAKED" } else { " OK" });
            }
        }
        let _ = stdout.flush();
    }

    fn post_run(&mut self, state: &ProjectState, plan: &[PlanStep]) {
        let unapplied = plan.iter().filter(|s| s.is_backwards()).count();
        debug!(
            steps = plan.len(),
            unapplied,
            empty_schema = state.is_empty(),
            "post-run hook"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_migrate_flags() {
        let cli = Cli::try_parse_from([
            "migrator", "--root", "proj", "migrate", "blog", "0002", "--fake",
        ])
        .unwrap();
        assert_eq!(cli.root, PathBuf::from("proj"));
        match cli.command {
            Commands::Migrate {
                component,
                migration,
                fake,
                plan,
                ..
            } => {
                assert_eq!(component.as_deref(), Some("blog"));
                assert_eq!(migration.as_deref(), Some("0002"));
                assert!(fake);
                assert!(!plan);
            }
            _ => panic!("expected migrate"),
        }
    }

    #[test]
    fn test_cli_verbosity_is_counted() {
        let cli = Cli::try_parse_from(["migrator", "-vv", "show"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Show { component: None }));
    }
}
