//! etcdform CLI - declarative management of etcd keys.
//!
//! This tool reads a provider configuration and a list of declared
//! resources, then plans or applies the store operations that converge
//! them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use etcdform_common::KeyPath;
use etcdform_provider::{Provider, ResourceDecl, ResourceResult};
use etcdform_reconcile::StateStore;

#[derive(Parser)]
#[command(name = "etcdform")]
#[command(about = "etcdform - Declarative etcd key management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Provider configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// State file of tracked resources. Without it every run starts from
    /// the remote state and undeclared resources are left alone.
    #[arg(short, long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show provider options and resource attributes.
    Schema {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Read a key, or the observed state of a resource.
    Get {
        /// Absolute key path.
        path: String,

        /// Resource type whose state to print as JSON (e.g. etcd_discovery).
        #[arg(short = 't', long = "type")]
        resource_type: Option<String>,
    },

    /// Show the operations that would converge the declared resources.
    Plan {
        /// Resources file (JSON list of {"type", "config"}).
        file: PathBuf,
    },

    /// Converge the declared resources.
    Apply {
        /// Resources file (JSON list of {"type", "config"}).
        file: PathBuf,
    },

    /// Delete the declared resources.
    Destroy {
        /// Resources file (JSON list of {"type", "config"}).
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Schema { json } => cmd_schema(json),

        Commands::Get {
            ref path,
            ref resource_type,
        } => cmd_get(cli.config.as_deref(), path, resource_type.as_deref()).await,

        Commands::Plan { ref file } => {
            cmd_plan(cli.config.as_deref(), cli.state.as_deref(), file).await
        }

        Commands::Apply { ref file } => {
            cmd_apply(cli.config.as_deref(), cli.state.as_deref(), file).await
        }

        Commands::Destroy { ref file } => {
            cmd_destroy(cli.config.as_deref(), cli.state.as_deref(), file).await
        }
    }
}

/// Build the provider from the configuration file, or from defaults.
fn load_provider(config: Option<&Path>) -> Result<Provider> {
    let value = match config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?
        }
        None => serde_json::Value::Null,
    };
    Provider::configure(value).context("Failed to configure provider")
}

fn load_resources(file: &Path) -> Result<Vec<ResourceDecl>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid resources file {}", file.display()))
}

async fn load_state(state: Option<&Path>) -> Result<StateStore> {
    match state {
        Some(path) => StateStore::load(path)
            .await
            .with_context(|| format!("Failed to load state from {}", path.display())),
        None => Ok(StateStore::new()),
    }
}

async fn save_state(state: Option<&Path>, store: &StateStore) -> Result<()> {
    if let Some(path) = state {
        store
            .save(path)
            .await
            .with_context(|| format!("Failed to save state to {}", path.display()))?;
    }
    Ok(())
}

/// Print per-resource results and fail if any resource failed.
fn report(results: &[ResourceResult]) -> Result<()> {
    let mut failed = 0;
    for r in results {
        match &r.result {
            Ok(action) => println!("{} {}: {}", r.resource_type, r.path, action),
            Err(e) => {
                failed += 1;
                println!("{} {}: failed: {}", r.resource_type, r.path, e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} resources failed", failed, results.len());
    }
    Ok(())
}

fn cmd_schema(json: bool) -> Result<()> {
    let schema = Provider::schema();
    if json {
        println!("{}", serde_json::to_string_pretty(&schema)?);
    } else {
        print!("{}", schema);
    }
    Ok(())
}

async fn cmd_get(config: Option<&Path>, path: &str, resource_type: Option<&str>) -> Result<()> {
    let provider = load_provider(config)?;
    let path = KeyPath::parse(path).context("Invalid key path")?;

    if let Some(resource_type) = resource_type {
        match provider
            .read(resource_type, &path)
            .await
            .with_context(|| format!("Failed to read {} {}", resource_type, path))?
        {
            Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
            None => println!("{} {} is absent", resource_type, path),
        }
        return Ok(());
    }

    match provider.get(&path).await.context("Failed to read key")? {
        Some(node) if node.dir => {
            println!("{} is a directory [version {}]", path, node.modified_index);
            for child in &node.nodes {
                println!("  {}{}", child.key, if child.dir { "/" } else { "" });
            }
        }
        Some(node) => {
            println!("{}", node.value.unwrap_or_default());
            println!("  Version: {}", node.modified_index);
            if let Some(ttl) = node.ttl {
                println!("  TTL: {}s", ttl);
            }
        }
        None => println!("{} is absent", path),
    }
    Ok(())
}

async fn cmd_plan(config: Option<&Path>, state: Option<&Path>, file: &Path) -> Result<()> {
    let provider = load_provider(config)?;
    let decls = load_resources(file)?;
    let mut store = load_state(state).await?;

    info!("Planning {} resources", decls.len());
    let plans = provider
        .plan(&mut store, &decls)
        .await
        .context("Failed to plan")?;
    save_state(state, &store).await?;

    let changes: usize = plans.iter().map(|p| p.len()).sum();
    for plan in &plans {
        println!("{}", plan);
    }
    println!("\n{} operations planned", changes);
    Ok(())
}

async fn cmd_apply(config: Option<&Path>, state: Option<&Path>, file: &Path) -> Result<()> {
    let provider = load_provider(config)?;
    let decls = load_resources(file)?;
    let mut store = load_state(state).await?;

    info!("Applying {} resources", decls.len());
    let results = provider.apply(&mut store, &decls).await;
    save_state(state, &store).await?;
    report(&results.context("Failed to apply")?)
}

async fn cmd_destroy(config: Option<&Path>, state: Option<&Path>, file: &Path) -> Result<()> {
    let provider = load_provider(config)?;
    let decls = load_resources(file)?;
    let mut store = load_state(state).await?;

    info!("Destroying {} resources", decls.len());
    let results = provider.destroy(&mut store, &decls).await;
    save_state(state, &store).await?;
    report(&results.context("Failed to destroy")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_with_state() {
        let cli = Cli::parse_from([
            "etcdform",
            "--config",
            "provider.json",
            "apply",
            "resources.json",
            "--state",
            "state.json",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("provider.json")));
        assert_eq!(cli.state, Some(PathBuf::from("state.json")));
        assert!(matches!(cli.command, Commands::Apply { .. }));
    }

    #[test]
    fn test_parse_get_with_type() {
        let cli = Cli::parse_from(["etcdform", "get", "/services/web", "--type", "etcd_discovery"]);
        match cli.command {
            Commands::Get {
                path,
                resource_type,
            } => {
                assert_eq!(path, "/services/web");
                assert_eq!(resource_type.as_deref(), Some("etcd_discovery"));
            }
            _ => panic!("expected get"),
        }
    }

    #[test]
    fn test_resources_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("resources.json");
        std::fs::write(
            &file,
            r#"[
                {"type": "etcd_keys", "config": {"path": "/a", "value": "1"}},
                {"type": "etcd_discovery", "config": {"path": "/d", "entries": {"x": "1"}}}
            ]"#,
        )
        .unwrap();

        let decls = load_resources(&file).unwrap();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[1].resource_type, "etcd_discovery");
    }

    #[test]
    fn test_missing_resources_file_names_the_path() {
        let err = load_resources(Path::new("/nonexistent/resources.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/resources.json"));
    }
}
