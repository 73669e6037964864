//! `cdex`: extract CCDA documents from a clinical records platform.
//!
//! Resolves settings from flags, `CDEX_*` environment variables and an
//! optional `.env` file, prompts for the two passwords when they are not in
//! the environment, then hands everything to the core extractor and prints
//! one line per patient outcome.

use anyhow::Context;
use cdex_core::{DatabaseSettings, Dialect, DocumentClient, Extractor, Gateway, ServiceSettings};
use cdex_files::DocumentStore;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cdex")]
#[command(version, about = "Extract CCDA documents from a clinical records platform")]
struct Cli {
    /// Output directory for the extracted documents
    output_dir: PathBuf,

    /// Platform database dialect
    #[arg(short = 't', long, default_value = "postgres", env = "CDEX_DIALECT")]
    dialect: Dialect,

    /// Patient key to extract (repeatable); no keys extracts every patient
    #[arg(short = 'p', long = "pid")]
    pids: Vec<i64>,

    /// File of patient keys, one per line
    #[arg(short = 'f', long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Platform login name of the extracting provider (default: the OS user)
    #[arg(short = 'U', long, env = "CDEX_EMR_USERNAME")]
    username: Option<String>,

    /// Document service host
    #[arg(long, default_value = "localhost", env = "CDEX_SERVICE_HOST")]
    service_host: String,

    /// Document service port
    #[arg(long, default_value_t = 9443, env = "CDEX_SERVICE_PORT")]
    service_port: u16,

    /// Database host
    #[arg(long, default_value = "localhost", env = "CDEX_DB_HOST")]
    db_host: String,

    /// Database port (default: 5432 for postgres, 3306 for mysql)
    #[arg(long, env = "CDEX_DB_PORT")]
    db_port: Option<u16>,

    /// Database name
    #[arg(long, default_value = "emr", env = "CDEX_DB_NAME")]
    db_name: String,

    /// Database user (empty defers to ambient authentication on postgres)
    #[arg(long, default_value = "", env = "CDEX_DB_USER")]
    db_user: String,

    /// Accept document-service TLS certificates that fail validation
    #[arg(long)]
    insecure_skip_tls_verify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cdex_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let username = match cli.username.clone() {
        Some(name) => name,
        None => std::env::var("USER").context("no --username given and $USER is unset")?,
    };

    let pids = collect_pids(&cli)?;

    let db_password = password_from("CDEX_DB_PASSWORD", "Enter database password: ")?;
    let service_password = password_from("CDEX_EMR_PASSWORD", "Enter platform password: ")?;

    let database = DatabaseSettings {
        dialect: cli.dialect,
        host: cli.db_host.clone(),
        port: cli.db_port.unwrap_or_else(|| cli.dialect.default_port()),
        name: cli.db_name.clone(),
        username: cli.db_user.clone(),
        password: db_password,
    };

    let service = ServiceSettings {
        host: cli.service_host.clone(),
        port: cli.service_port,
        database: cli.db_name.clone(),
        username: username.clone(),
        password: service_password,
        accept_invalid_certs: cli.insecure_skip_tls_verify,
    };

    let sink = DocumentStore::new(&cli.output_dir)?;
    let gateway = Gateway::connect(&database)
        .await
        .context("failed to connect to the platform database")?;
    let client = DocumentClient::new(&service)?;

    let extractor = Extractor::new(gateway, client, sink);
    let outcomes = extractor.run(&username, &pids).await?;

    for outcome in &outcomes {
        match &outcome.result {
            Ok(path) => println!("Patient {} written to {}", outcome.pid, path.display()),
            Err(error) if outcome.is_integrity_failure() => {
                eprintln!("Patient {} integrity error: {}", outcome.pid, error)
            }
            Err(error) => eprintln!("Patient {} error: {}", outcome.pid, error),
        }
    }

    Ok(())
}

/// Merges explicit `--pid` flags with the contents of `--pid-file`.
fn collect_pids(cli: &Cli) -> anyhow::Result<Vec<i64>> {
    let mut pids = cli.pids.clone();

    if let Some(path) = &cli.pid_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pid file {}", path.display()))?;

        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let pid = line.parse::<i64>().with_context(|| {
                format!("{}:{}: not a patient key: {line:?}", path.display(), index + 1)
            })?;
            pids.push(pid);
        }
    }

    Ok(pids)
}

/// Reads a password from the environment, falling back to an interactive
/// no-echo prompt.
fn password_from(env_var: &str, prompt: &str) -> anyhow::Result<String> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(value);
    }
    rpassword::prompt_password(prompt).context("failed to read password")
}
