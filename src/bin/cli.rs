//! Polystore CLI - Main entry point for CLI binary
//!
//! This binary provides the `polystore` tool for setting up a project and
//! inspecting its audit ledger.

use anyhow::{bail, Context, Result};
use clap::Parser;
use polystore::engine::{
    adapter::SqliteDriver,
    audit::{AuditLedger, SqliteAuditStore},
    cli::{Cli, Commands, OutputFormat},
    config::{EngineConfig, CONFIG_FILE},
    security::FieldEncryption,
};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polystore=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_cli(cli: Cli) -> Result<()> {
    let project_dir = cli.get_project_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { force } => cmd_init(&project_dir, force, json_output),
        Commands::VerifyChain { tenant } => cmd_verify_chain(&project_dir, tenant.as_deref(), json_output),
        Commands::History { tenant, model, entity } => {
            cmd_history(&project_dir, tenant.as_deref(), &model, &entity, json_output)
        }
        Commands::Models => cmd_models(&project_dir, json_output),
        Commands::Keygen => cmd_keygen(json_output),
    }
}

fn cmd_init(project_dir: &Path, force: bool, json: bool) -> Result<()> {
    let config_path = project_dir.join(CONFIG_FILE);
    if config_path.exists() && !force {
        bail!("Config already exists: {} (use --force to overwrite)", config_path.display());
    }

    let config = EngineConfig::default();
    config.save(project_dir).context("writing config")?;
    std::fs::create_dir_all(EngineConfig::resolve(project_dir, &config.overflow.root))?;

    if json {
        println!("{}", serde_json::json!({ "success": true, "config": config_path }));
    } else {
        println!("Created {}", config_path.display());
    }
    Ok(())
}

fn open_ledger(project_dir: &Path) -> Result<AuditLedger> {
    let config = EngineConfig::load(project_dir)?;
    let db_path = config.audit_db_path(project_dir);
    let driver = SqliteDriver::new(&db_path, config.sqlite.pool_size)
        .with_context(|| format!("opening audit database {}", db_path.display()))?;
    let store = SqliteAuditStore::new(&driver)?;
    Ok(AuditLedger::new(Arc::new(store)))
}

fn cmd_verify_chain(project_dir: &Path, tenant: Option<&str>, json: bool) -> Result<()> {
    let ledger = open_ledger(project_dir)?;
    let records = ledger.records(tenant)?.len();
    let valid = ledger.verify_chain(tenant)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "tenant": tenant, "records": records, "valid": valid })
        );
    } else if valid {
        println!("Chain valid: {} records (tenant: {})", records, tenant.unwrap_or("-"));
    } else {
        println!("Chain INVALID (tenant: {})", tenant.unwrap_or("-"));
    }

    if !valid {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_history(project_dir: &Path, tenant: Option<&str>, model: &str, entity: &str, json: bool) -> Result<()> {
    let ledger = open_ledger(project_dir)?;
    let history = ledger.history(tenant, model, entity)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No audit records for {} {}", model, entity);
    }
    for record in &history {
        println!(
            "{}  {:<12} {:<6} actor={} {}",
            record.timestamp.to_rfc3339(),
            record.action.as_str(),
            if record.success { "ok" } else { "failed" },
            record.actor_id.as_deref().unwrap_or("-"),
            record.changed_fields.join(","),
        );
    }
    Ok(())
}

fn cmd_models(project_dir: &Path, json: bool) -> Result<()> {
    let config = EngineConfig::load(project_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config.models)?);
        return Ok(());
    }

    if config.models.is_empty() {
        println!("(no models configured)");
    }
    for model in &config.models {
        let location = model.table.as_deref().or(model.collection.as_deref()).unwrap_or("-");
        println!("{:<24} {:<10} {}", model.name, model.storage, location);
    }
    Ok(())
}

fn cmd_keygen(json: bool) -> Result<()> {
    let key = FieldEncryption::generate_key()?;
    if json {
        println!("{}", serde_json::json!({ "key": key }));
    } else {
        println!("{}", key);
    }
    Ok(())
}
