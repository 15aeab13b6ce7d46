//! CLI entry point: run Cypher statements and print rows as JSON lines.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::{fmt, EnvFilter};

use cypherstream_client::CypherClient;
use cypherstream_core::{
    ClientConfig, Completion, Parameters, Record, ReturnType, RowStream, StatementInput,
    TransactionEvent, TransactionOptions,
};

#[derive(Parser)]
#[command(name = "cypherstream")]
#[command(about = "Stream Cypher results from the transactional HTTP endpoint")]
struct Cli {
    /// Statement to run. Repeat to run several, in order.
    #[arg(short, long)]
    query: Vec<String>,

    /// JSON file with a statement string, a statement object, or an array of either.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Parameters (JSON object) for statements that carry none of their own.
    #[arg(long)]
    params: Option<String>,

    /// Use an explicit transaction and log its lifecycle events.
    #[arg(long)]
    transaction: bool,

    /// Keep identity/label envelopes around nodes and relationships.
    #[arg(long)]
    metadata: bool,

    /// Print values exactly as the server sent them.
    #[arg(long)]
    raw: bool,

    /// Override the configured transaction endpoint.
    #[arg(long)]
    endpoint: Option<String>,

    /// Config file prefix (default: cypherstream).
    #[arg(short, long, default_value = "cypherstream")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::load(&cli.config)?;
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }

    let mut options = config.transaction.clone();
    if cli.metadata {
        options = options.with_metadata(true);
    }
    if cli.raw {
        options = options.with_return_type(ReturnType::Raw);
    }

    let input = read_input(&cli)?;
    let parameters = parse_params(cli.params.as_deref())?;
    let client = CypherClient::connect(config)?;

    let rows = if cli.transaction {
        run_transaction(&client, input, parameters, options).await?
    } else {
        print_rows(client.open(input, parameters, Some(options))).await?
    };
    tracing::info!(rows, "Finished");
    Ok(())
}

fn read_input(cli: &Cli) -> anyhow::Result<StatementInput> {
    let mut items: Vec<StatementInput> = cli
        .query
        .iter()
        .map(|q| StatementInput::from(q.as_str()))
        .collect();

    if let Some(path) = &cli.file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", path.display()))?;
        items.push(StatementInput::from_json(value)?);
    }

    if items.is_empty() {
        anyhow::bail!("Specify at least one --query or a --file");
    }
    Ok(StatementInput::Many(items))
}

fn parse_params(raw: Option<&str>) -> anyhow::Result<Option<Parameters>> {
    raw.map(|raw| serde_json::from_str::<Parameters>(raw).context("--params must be a JSON object"))
        .transpose()
}

fn print_row(out: &mut impl Write, record: &Record) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, record)?;
    writeln!(out)?;
    Ok(())
}

async fn print_rows(mut rows: RowStream) -> anyhow::Result<usize> {
    let mut out = std::io::stdout().lock();
    let mut count = 0;
    while let Some(row) = rows.next().await {
        print_row(&mut out, &row?)?;
        count += 1;
    }
    Ok(count)
}

async fn run_transaction(
    client: &CypherClient,
    input: StatementInput,
    parameters: Option<Parameters>,
    options: TransactionOptions,
) -> anyhow::Result<usize> {
    let input = match parameters {
        Some(parameters) => input.with_default_parameters(parameters),
        None => input,
    };

    let mut transaction = client.open_transaction(Some(options));
    transaction.write(input)?;
    transaction.commit();

    let mut out = std::io::stdout().lock();
    let mut count = 0;
    while let Some(event) = transaction.next_event().await {
        match event {
            TransactionEvent::TransactionId(id) => {
                tracing::info!(transaction_id = %id, "Transaction opened");
            }
            TransactionEvent::Expires(deadline) => {
                tracing::info!(expires = %deadline, "Transaction expiry updated");
            }
            TransactionEvent::Expired => tracing::warn!("Transaction expired"),
            TransactionEvent::Row(record) => {
                print_row(&mut out, &record)?;
                count += 1;
            }
            TransactionEvent::Failed(error) => return Err(error.into()),
            TransactionEvent::Finished(Completion::Committed) => return Ok(count),
            TransactionEvent::Finished(other) => anyhow::bail!("Transaction ended with {other:?}"),
        }
    }
    anyhow::bail!("Transaction ended without a result")
}
