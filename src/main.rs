use anyhow::Result;
use clap::{Parser, Subcommand};
use ragchat::commands::{ask_question, ingest_files, run_chat, show_status};
use ragchat::config::{resolve_config_dir, run_interactive_config, show_config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ragchat")]
#[command(about = "Ask questions about your documents using a local Ollama model")]
#[command(version)]
struct Cli {
    /// Use this configuration directory instead of the platform default
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure Ollama connection and retrieval settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Chunk, embed and index text files
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Ask a single question about the indexed documents
    Ask {
        /// The question to answer
        question: String,
    },
    /// Start an interactive conversation about the indexed documents
    Chat,
    /// Show configuration, Ollama health and index statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = resolve_config_dir(cli.config_dir)?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Ingest { files } => {
            ingest_files(&config_dir, &files).await?;
        }
        Commands::Ask { question } => {
            ask_question(&config_dir, &question).await?;
        }
        Commands::Chat => {
            run_chat(&config_dir).await?;
        }
        Commands::Status => {
            show_status(&config_dir)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["ragchat", "status"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Status));
            assert_eq!(parsed.config_dir, None);
        }
    }

    #[test]
    fn ingest_command_with_files() {
        let cli = Cli::try_parse_from(["ragchat", "ingest", "notes.md", "paper.txt"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ingest { files } = parsed.command {
                assert_eq!(
                    files,
                    vec![PathBuf::from("notes.md"), PathBuf::from("paper.txt")]
                );
            } else {
                panic!("expected ingest command");
            }
        }
    }

    #[test]
    fn ingest_requires_a_file() {
        let cli = Cli::try_parse_from(["ragchat", "ingest"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        }
    }

    #[test]
    fn ask_command_with_question() {
        let cli = Cli::try_parse_from(["ragchat", "ask", "What is the capital of France?"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ask { question } = parsed.command {
                assert_eq!(question, "What is the capital of France?");
            } else {
                panic!("expected ask command");
            }
        }
    }

    #[test]
    fn config_dir_override_after_subcommand() {
        let cli = Cli::try_parse_from(["ragchat", "chat", "--config-dir", "/tmp/ragchat"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert!(matches!(parsed.command, Commands::Chat));
            assert_eq!(parsed.config_dir, Some(PathBuf::from("/tmp/ragchat")));
        }
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["ragchat", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["ragchat", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["ragchat", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
