use anyhow::{Context, Result};
use console::style;
use dialoguer::Input;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::RagError;
use crate::config::Config;
use crate::embeddings::Document;
use crate::generation::Answer;
use crate::index::VectorIndex;
use crate::ollama::OllamaClient;
use crate::session::Session;

/// Load the configuration and open a session over the saved index
#[inline]
pub fn open_session(config_dir: &Path) -> Result<Session> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let client = Arc::new(
        OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?,
    );
    Session::open(&config, Arc::<OllamaClient>::clone(&client), client).context("Failed to open index")
}

/// Ingest files into the index, saving after each one
#[inline]
pub async fn ingest_files(config_dir: &Path, files: &[PathBuf]) -> Result<()> {
    let mut session = open_session(config_dir)?;
    let mut failures = 0_usize;

    for file in files {
        let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        let document = Document::from_bytes(file.display().to_string(), &bytes);

        let spinner = spinner(format!("Ingesting {}", file.display()));
        let result = session
            .ingest_until(document, tokio::signal::ctrl_c())
            .await;
        spinner.finish_and_clear();

        match result {
            Ok(report) => {
                session.save().context("Failed to save index")?;
                println!(
                    "✅ {}: {} chunks added ({} entries total)",
                    report.document_id, report.chunks_added, report.total_entries
                );
            }
            Err(RagError::Cancelled) => {
                println!("\n📴 Received interrupt signal, stopping ingestion");
                return Ok(());
            }
            Err(e) => {
                error!("{}", e);
                println!("❌ {}", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} files failed to ingest", failures, files.len());
    }
    Ok(())
}

/// Answer a single question and print the sources used
#[inline]
pub async fn ask_question(config_dir: &Path, question: &str) -> Result<()> {
    let mut session = open_session(config_dir)?;

    match session.ask_until(question, tokio::signal::ctrl_c()).await {
        Ok(answer) => {
            print_answer(&answer);
            Ok(())
        }
        Err(RagError::Cancelled) => {
            println!("\n📴 Cancelled");
            Ok(())
        }
        Err(RagError::NotIndexed) => {
            anyhow::bail!("No documents have been indexed yet. Run `ragchat ingest <FILE>...` first.")
        }
        Err(e) => Err(e.into()),
    }
}

/// Interactive question loop with conversation memory
#[inline]
pub async fn run_chat(config_dir: &Path) -> Result<()> {
    let mut session = open_session(config_dir)?;
    if session.index().is_empty() {
        anyhow::bail!("No documents have been indexed yet. Run `ragchat ingest <FILE>...` first.");
    }

    eprintln!(
        "{}",
        style(format!(
            "💬 Chatting over {} indexed chunks. Type /clear to forget the conversation, /exit to quit.",
            session.index().len()
        ))
        .cyan()
    );

    loop {
        let line: String = Input::new()
            .with_prompt("You")
            .allow_empty(true)
            .interact_text()?;
        let question = line.trim();

        match question {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                session.clear_history();
                eprintln!("{}", style("Conversation cleared.").dim());
                continue;
            }
            _ => {}
        }

        match session.ask_until(question, tokio::signal::ctrl_c()).await {
            Ok(answer) => print_answer(&answer),
            Err(RagError::Cancelled) => {
                println!("\n📴 Cancelled");
                break;
            }
            Err(e) => {
                warn!("Question failed: {}", e);
                println!("❌ {}", e);
            }
        }
    }

    info!("Chat ended");
    Ok(())
}

/// Report configuration, Ollama health and index statistics
#[inline]
pub fn show_status(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).unwrap_or_else(|e| {
        warn!("Using default configuration: {}", e);
        Config {
            base_dir: config_dir.to_path_buf(),
            ..Config::default()
        }
    });

    println!("📊 ragchat Status Report");
    println!("{}", "=".repeat(50));
    println!();

    println!("🤖 Ollama Status:");
    match OllamaClient::new(&config.ollama) {
        Ok(client) => match client.health_check() {
            Ok(()) => {
                println!("   ✅ Ollama: Connected ({})", client.base_url());
                println!("   📋 Embedding Model: {}", config.ollama.embedding_model);
                println!("   📋 Generation Model: {}", config.ollama.generation_model);
            }
            Err(e) => {
                println!("   ⚠️  Ollama: Unhealthy - {}", e);
            }
        },
        Err(e) => {
            println!("   ❌ Ollama: Failed to create client - {}", e);
        }
    }

    println!();
    println!("🔍 Index Status:");
    let index_path = config.resolved_index_path();
    println!("   📁 Path: {}", index_path.display());
    if VectorIndex::exists(&index_path) {
        match VectorIndex::read_manifest(&index_path) {
            Ok(manifest) => {
                println!("   📄 Entries: {}", manifest.entry_count);
                println!("   🔢 Dimension: {}", manifest.dimension.unwrap_or(0));
                println!("   📐 Metric: {}", manifest.metric);
                if let Some(model) = &manifest.embedding_model {
                    println!("   🧮 Embedded With: {}", model);
                }
                println!(
                    "   🕒 Saved At: {}",
                    manifest.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            Err(e) => {
                println!("   ❌ Unreadable index - {}", e);
            }
        }
    } else {
        println!("   💤 No index saved yet");
    }

    println!();
    println!("⚙️  Retrieval:");
    println!(
        "   Chunk size {} / overlap {}, k = {}, history = {} turns",
        config.chunking.chunk_size,
        config.chunking.overlap,
        config.retrieval.k,
        config.retrieval.history_turns
    );

    Ok(())
}

fn print_answer(answer: &Answer) {
    println!();
    println!("{}", answer.text.trim());
    println!();

    if answer.context.is_empty() {
        println!("{}", style("(answered without indexed sources)").dim());
        return;
    }

    println!("{}", style("Sources:").bold().yellow());
    for (rank, hit) in answer.context.iter().enumerate() {
        println!(
            "  [{}] {} (chunk {}, distance {:.3})",
            rank + 1,
            style(&hit.chunk.document_id).cyan(),
            hit.chunk.chunk_index,
            hit.distance
        );
    }
    println!();
}

fn spinner(message: String) -> ProgressBar {
    if !console::user_attended_stderr() {
        return ProgressBar::hidden();
    }

    let bar = ProgressStyle::with_template("{spinner} {msg} [{elapsed}]").map_or_else(
        |_| ProgressBar::new_spinner(),
        |style| ProgressBar::new_spinner().with_style(style),
    );
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}
