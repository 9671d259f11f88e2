mod batch;
mod config;
mod document;
mod error;
mod history;
mod invoice;
mod llm_extract;
mod normalize;

use batch::{BatchOptions, BatchReport};
use clap::{Args, Parser, Subcommand};
use config::Config;
use error::{DocumentError, Result};
use history::HistoryStore;
use invoice::Extraction;
use llm_extract::{Extractor, RemoteClient, RetryingClient};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Extract invoice fields with a hosted LLM and keep a CSV history
#[derive(Parser)]
#[command(name = "invoice-extract")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More logging (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to config file
    #[arg(short, long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract one invoice and save it to the history
    Extract(ExtractArgs),

    /// Extract every invoice in a folder into one JSON file
    Batch(BatchArgs),

    /// Manage the saved history
    #[command(subcommand)]
    History(HistoryCommand),

    /// Check the model answers at all
    Ping,

    /// List models that support content generation
    Models,

    /// Show or edit the config file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args)]
struct ExtractArgs {
    /// Invoice file (png, jpg, jpeg, pdf, docx, xlsx, txt)
    #[arg(required_unless_present_any = ["text", "stdin"], conflicts_with_all = ["text", "stdin"])]
    file: Option<PathBuf>,

    /// Invoice text pasted on the command line
    #[arg(long, conflicts_with = "stdin")]
    text: Option<String>,

    /// Read invoice text from stdin
    #[arg(long)]
    stdin: bool,

    /// Print the result without saving it to the history
    #[arg(long)]
    no_save: bool,
}

#[derive(Args)]
struct BatchArgs {
    /// Folder of invoices (defaults to `batch.input_dir`)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output JSON file (defaults to `batch.output_path`)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pause between model calls (defaults to `batch.delay_ms`)
    #[arg(long)]
    delay_ms: Option<u64>,
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// Invoice count and total spend
    Summary,

    /// Write the history CSV to a file or stdout
    Export {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delete the whole history
    Clear {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective config (API key masked)
    Show,

    /// Set a value, e.g. `config set model.model_name models/gemini-2.5-pro`
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // init tracing; stderr keeps stdout clean for JSON/CSV output
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Extract(args) => run_extract(&cfg, args).await,
        Commands::Batch(args) => run_batch(&cfg, args).await,
        Commands::History(cmd) => run_history(&cfg, cmd),
        Commands::Ping => {
            let client = RemoteClient::new(cfg.model.backend, cfg.client_config())?;
            let reply = client.ping().await?;
            println!("Bot says: {}", reply.trim());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Models => {
            let client = RemoteClient::new(cfg.model.backend, cfg.client_config())?;
            for name in client.list_models().await? {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(ConfigCommand::Show) => {
            print!("{}", cfg.redacted()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(ConfigCommand::Set { key, value }) => {
            Config::set_value(&cli.config, &key, &value)?;
            eprintln!("Updated {key} in {}", cli.config.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_extractor(cfg: &Config) -> Result<Extractor<RetryingClient<RemoteClient>>> {
    let client = RemoteClient::new(cfg.model.backend, cfg.client_config())?;
    Ok(Extractor::new(RetryingClient::new(client, cfg.retry_policy())))
}

async fn run_extract(cfg: &Config, args: ExtractArgs) -> Result<ExitCode> {
    let content = if let Some(text) = args.text {
        document::text_content(text)?
    } else if args.stdin {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        document::text_content(buf)?
    } else if let Some(path) = args.file {
        document::load(&path)?
    } else {
        return Err(DocumentError::Empty.into());
    };

    let extractor = build_extractor(cfg)?;
    eprintln!("Analyzing invoice...");

    match extractor.extract(&content).await? {
        Extraction::Success(record) => {
            let mut shown = serde_json::to_value(&record)?;
            shown["status"] = "success".into();
            println!("{}", serde_json::to_string_pretty(&shown)?);

            if args.no_save {
                return Ok(ExitCode::SUCCESS);
            }
            let store = HistoryStore::new(&cfg.history.path);
            store.append(&record)?;
            let summary = store.summarize()?;
            eprintln!(
                "Saved to {}: {} invoices, total spend ${:.2}",
                store.path().display(),
                summary.count,
                summary.total
            );
            Ok(ExitCode::SUCCESS)
        }
        Extraction::Rejected { reason } => {
            eprintln!("AI Error: {reason}");
            Ok(ExitCode::from(2))
        }
    }
}

async fn run_batch(cfg: &Config, args: BatchArgs) -> Result<ExitCode> {
    let options = BatchOptions {
        input_dir: args.input.unwrap_or_else(|| cfg.batch.input_dir.clone()),
        extensions: cfg.batch.extensions.clone(),
        delay: Duration::from_millis(args.delay_ms.unwrap_or(cfg.batch.delay_ms)),
    };
    let output = args.output.unwrap_or_else(|| cfg.batch.output_path.clone());

    // Fail on a missing folder before building a client
    batch::list_inputs(&options.input_dir, &options.extensions)?;

    let extractor = build_extractor(cfg)?;
    let entries = batch::run_batch(&extractor, &options).await?;
    batch::write_results(&output, &entries)?;

    let report = BatchReport::from_entries(&entries);
    println!(
        "BATCH COMPLETE. {} processed ({} success, {} not invoices, {} crashed). Results saved to '{}'",
        entries.len(),
        report.success,
        report.rejected,
        report.crashed,
        output.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn run_history(cfg: &Config, cmd: HistoryCommand) -> Result<ExitCode> {
    let store = HistoryStore::new(&cfg.history.path);

    match cmd {
        HistoryCommand::Summary => {
            let summary = store.summarize()?;
            if summary.count == 0 {
                println!("No history yet.");
            } else {
                println!("Total Invoices: {}", summary.count);
                println!("Total Spend: ${:.2}", summary.total);
            }
        }
        HistoryCommand::Export { out: Some(dest) } => {
            if store.export_to(&dest)? {
                eprintln!("Report written to {}", dest.display());
            } else {
                eprintln!("No history yet.");
            }
        }
        HistoryCommand::Export { out: None } => match store.export()? {
            Some(bytes) => std::io::stdout().write_all(&bytes)?,
            None => eprintln!("No history yet."),
        },
        HistoryCommand::Clear { yes: false } => {
            eprintln!("Refusing to delete {} without --yes", store.path().display());
            return Ok(ExitCode::FAILURE);
        }
        HistoryCommand::Clear { yes: true } => {
            if store.clear()? {
                info!("History cleared");
                println!("History deleted!");
            } else {
                println!("No history yet.");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
