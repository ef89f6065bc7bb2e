mod chat;
mod chunker;
mod config;
mod conversation;
mod embedder;
mod error;
mod evaluation;
mod llm;
mod loader;
mod prompt;
mod qa;
mod retriever;
mod utils;
mod vector_db;
mod web;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Config, Settings, parse_bind};
use conversation::Conversation;
use llm::LLMConfig;
use loader::Loader;
use qa::{Answerer, QaEngine};
use retriever::{IndexOrigin, Retriever, build_index};
use vector_db::VectorDB;

#[derive(Parser)]
#[command(name = "paperchat", version, about = "Question answering over a corpus of research papers")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest the corpus and (re)build the persisted vector index
    Build {
        /// Only open the existing index and report its size
        #[arg(long)]
        load_only: bool,
    },
    /// Multi-turn conversation in the terminal
    Chat,
    /// Answer a single question without conversation history
    Ask {
        query: String,
        /// Print the retrieved sources with their metadata
        #[arg(long)]
        sources: bool,
    },
    /// Serve the browser chat page
    Serve {
        #[arg(long, env = "PAPERCHAT_BIND", default_value = "127.0.0.1:8501")]
        bind: String,
    },
    /// Grade single-turn answers against reference answers
    Eval {
        /// JSON array of {"query", "answer"} objects
        #[arg(long)]
        examples: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let default = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn open_engine(config: &Config) -> Result<QaEngine> {
    let generator = config.build_generator()?;
    let embedder = config.build_embedder()?;
    let (retriever, origin) = Retriever::open_or_build(
        &config.db_dir,
        &config.docs_dir,
        config.chunk,
        embedder,
        config.top_k,
    )
    .context("failed to open the vector index")?;
    match origin {
        IndexOrigin::Loaded => info!(
            chunks = retriever.index_len(),
            top_k = retriever.top_k(),
            "using persisted index"
        ),
        IndexOrigin::Built { papers, chunks } => {
            info!(papers, chunks, "built a new index from {}", config.docs_dir.display())
        }
    }

    let engine = QaEngine::new(retriever, generator, config.chat.clone());
    Ok(if config.condense_questions {
        engine
    } else {
        engine.without_condensing()
    })
}

fn run_build(config: &Config, load_only: bool) -> Result<()> {
    let embedder = config.build_embedder()?;
    if load_only {
        let db = VectorDB::open(&config.db_dir, embedder.as_ref())?;
        println!(
            "Vector database loaded successfully from {} ({} chunks, embedder {})",
            config.db_dir.display(),
            db.len(),
            db.embedder_id()
        );
        return Ok(());
    }

    info!(
        size = config.chunk.size(),
        overlap = config.chunk.overlap(),
        "building index from {}",
        config.docs_dir.display()
    );
    let (db, papers) = build_index(
        &config.docs_dir,
        config.chunk,
        embedder.as_ref(),
        &Loader::default(),
    )?;
    db.persist(&config.db_dir)?;
    println!(
        "Vector database created successfully in {} ({} chunks from {} papers)",
        config.db_dir.display(),
        db.len(),
        papers
    );
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config = Config::from_args(cli.settings).context("invalid configuration")?;

    match cli.command {
        Command::Build { load_only } => run_build(&config, load_only),
        Command::Chat => {
            let engine = open_engine(&config)?;
            let mut conversation = Conversation::new(config.history_turns);
            let stdin = io::stdin();
            chat::chat_interface(&engine, &mut conversation, stdin.lock(), io::stdout())?;
            Ok(())
        }
        Command::Ask { query, sources } => {
            let engine = open_engine(&config)?;
            chat::ask_once(&engine, &query, sources, io::stdout())
        }
        Command::Serve { bind } => {
            let addr = parse_bind(&bind)?;
            let engine: Arc<dyn Answerer> = Arc::new(open_engine(&config)?);
            let state = web::AppState::new(engine, config.history_turns, config.session_idle);
            web::run(addr, state, async {
                let _ = tokio::signal::ctrl_c().await;
            })
        }
        Command::Eval { examples } => {
            let examples = match examples {
                Some(path) => evaluation::load_examples(&path)?,
                None => evaluation::default_examples(),
            };
            let engine = open_engine(&config)?;
            let grader_config = LLMConfig {
                temperature: 0.0,
                ..config.chat.clone()
            };
            println!("Running evaluation on question-answering chain...");
            let results = evaluation::evaluate(&engine, engine.generator(), &grader_config, &examples);
            evaluation::report(&results, io::stdout())?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_flags_accepted_after_subcommand() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["paperchat", "ask", "what?", "--top-k", "3", "--embedder", "hashing"])?;
        assert_eq!(cli.settings.top_k, 3);
        assert!(matches!(cli.command, Command::Ask { ref query, .. } if query == "what?"));

        let cli = Cli::try_parse_from(["paperchat", "--top-k", "4", "chat"])?;
        assert_eq!(cli.settings.top_k, 4);
        Ok(())
    }
}
