use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use atomflow::config::DirectiveConfig;
use atomflow::{DirectiveRegistry, EngineConfig, FlowError, LiftOptions, transform};

/// Directives recognised when the configuration names none.
const DEFAULT_DIRECTIVES: &[(&str, &str)] = &[
    ("text", "markdown"),
    ("slider", "slider"),
    ("table", "table"),
    ("select", "select"),
    ("chart", "chart"),
];

#[derive(Parser)]
#[command(name = "atomflow")]
#[command(about = "Lift programs into memoized atom graphs")]
struct Cli {
    /// Configuration file (defaults to the user configuration directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Additional directive names to lift (repeatable)
    #[arg(long = "directive", global = true, value_name = "NAME")]
    directives: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the rewritten program
    Lift {
        /// JavaScript or TypeScript program
        file: PathBuf,
    },
    /// Print the lifted atoms, their dependencies and the execution order
    Graph {
        /// JavaScript or TypeScript program
        file: PathBuf,
    },
}

fn load_config(path: Option<&Path>, extra: &[String]) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::load().context("Failed to load config")?,
    };

    if config.directives.is_empty() {
        config.directives = DEFAULT_DIRECTIVES
            .iter()
            .map(|(name, component_type)| DirectiveConfig {
                name: name.to_string(),
                component_type: Some(component_type.to_string()),
                liftable: true,
            })
            .collect();
    }
    for name in extra {
        if !config.directives.iter().any(|d| &d.name == name) {
            config.directives.push(DirectiveConfig {
                name: name.clone(),
                component_type: None,
                liftable: true,
            });
        }
    }
    tracing::debug!("Loaded {} directives", config.directives.len());
    Ok(config)
}

fn lift_file(file: &Path, config: &EngineConfig) -> anyhow::Result<atomflow::LiftedProgram> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let registry = Arc::new(DirectiveRegistry::from_config(&config.directives));
    let file_name = file.to_string_lossy();
    Ok(transform(
        &source,
        &file_name,
        &registry,
        &LiftOptions::from_config(config),
    )?)
}

fn print_graph(program: &atomflow::LiftedProgram) -> anyhow::Result<()> {
    println!("Atoms ({}):", program.declarations.len());
    for decl in &program.declarations {
        let origin = match decl.component_id() {
            Some(id) => format!("component {}", id),
            None => "function".to_string(),
        };
        let dependencies = if decl.dependencies.is_empty() {
            "-".to_string()
        } else {
            decl.dependencies.join(", ")
        };
        println!(
            "  {} ({}, {}) <- {}",
            decl.name, origin, decl.callsite, dependencies
        );
    }

    let graph = program.graph();
    graph.validate().map_err(FlowError::from)?;
    println!("Execution order:");
    for (idx, name) in graph.execution_order().iter().enumerate() {
        println!("  {}. {}", idx + 1, name);
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref(), &cli.directives)?;
    match cli.command {
        Commands::Lift { file } => {
            let program = lift_file(&file, &config)?;
            print!("{}", program.source);
        }
        Commands::Graph { file } => {
            let program = lift_file(&file, &config)?;
            print_graph(&program)?;
        }
    }
    Ok(())
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<FlowError>() {
        Some(FlowError::Graph(_)) | Some(FlowError::Lift(_)) => exitcode::DATAERR,
        Some(FlowError::Config(_)) => exitcode::CONFIG,
        Some(FlowError::Io(_)) => exitcode::IOERR,
        _ if error.downcast_ref::<std::io::Error>().is_some() => exitcode::NOINPUT,
        _ if error.downcast_ref::<confy::ConfyError>().is_some() => exitcode::CONFIG,
        _ => exitcode::SOFTWARE,
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("atomflow=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
    std::process::exit(exitcode::OK);
}
