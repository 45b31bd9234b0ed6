use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use note_vault::config::{PreferenceStore, SettingsPreferenceStore};
use note_vault::{logger, ChatOptions, IndexEvent, SessionId, Settings, StreamEvent, VaultService};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "note-vault")]
#[command(about = "Local-first note vaults with semantic search and streaming chat")]
struct Cli {
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,

    /// Vault directory; defaults to the last one opened
    #[arg(short, long, global = true)]
    vault_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Synchronize the index once and exit
    Index,
    /// Synchronize, then follow changes until Ctrl-C
    Watch,
    /// Interactive chat over the vault
    Chat {
        /// Retrieved chunks prepended to every prompt
        #[arg(long, default_value_t = 4)]
        context: usize,
        #[arg(long)]
        ignore_history: bool,
    },
    /// Nearest chunks for a query
    Search {
        query: String,
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    logger::init(&settings.logging)?;

    info!("Starting note-vault v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", cli.config);

    let prefs = Arc::new(SettingsPreferenceStore::new(settings.clone())?);
    let vault = match cli.vault_path.or_else(|| prefs.get_last_opened_directory()) {
        Some(vault) => vault,
        None => anyhow::bail!("No vault given and no previously opened vault; pass --vault-path"),
    };

    let service = VaultService::new(prefs, settings);
    let (id, events) = service.open_vault_and_index(&vault).await?;

    let outcome = match cli.command {
        Command::Index => wait_for_pass(events).await,
        Command::Watch => follow(events).await,
        Command::Chat {
            context,
            ignore_history,
        } => {
            tokio::spawn(report_errors(events));
            chat(
                &service,
                &id,
                ChatOptions {
                    ignore_history,
                    context_chunks: context,
                },
            )
            .await
        }
        Command::Search { query, limit } => match wait_for_pass(events).await {
            Ok(()) => search(&service, &id, &query, limit).await,
            Err(e) => Err(e),
        },
    };

    service.shutdown().await;
    outcome
}

/// Prints progress until the first pass ends.
async fn wait_for_pass(mut events: UnboundedReceiver<IndexEvent>) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            IndexEvent::Progress(fraction) => {
                eprint!("\rIndexing... {:>3.0}%", fraction * 100.0);
                if fraction >= 1.0 {
                    eprintln!();
                    return Ok(());
                }
            }
            IndexEvent::Error(message) => {
                eprintln!();
                anyhow::bail!(message);
            }
        }
    }
    Ok(())
}

async fn follow(mut events: UnboundedReceiver<IndexEvent>) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Some(IndexEvent::Progress(fraction)) => info!("Index progress {:.0}%", fraction * 100.0),
                Some(IndexEvent::Error(message)) => eprintln!("{}", message),
                None => return Ok(()),
            },
        }
    }
}

async fn report_errors(mut events: UnboundedReceiver<IndexEvent>) {
    while let Some(event) = events.recv().await {
        if let IndexEvent::Error(message) = event {
            warn!("{}", message);
        }
    }
}

async fn chat(service: &VaultService, id: &SessionId, options: ChatOptions) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        let mut stream = service.send_chat_message(id, prompt, options)?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => service.abort_generation(id)?,
                event = stream.recv() => match event {
                    Some(StreamEvent::Token(token)) => {
                        print!("{}", token);
                        std::io::stdout().flush()?;
                    }
                    Some(StreamEvent::Error(message)) => {
                        eprintln!("\n{}", message);
                        break;
                    }
                    Some(StreamEvent::Done) | None => {
                        println!();
                        break;
                    }
                },
            }
        }
    }
}

async fn search(service: &VaultService, id: &SessionId, query: &str, limit: usize) -> anyhow::Result<()> {
    let hits = service.search(id, query, limit).await?;
    if hits.is_empty() {
        println!("No matches.");
    }
    for hit in hits {
        println!("{:.3}  {}\n{}\n", hit.score, hit.source_path, hit.text.trim());
    }
    Ok(())
}
