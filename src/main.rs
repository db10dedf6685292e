use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use docchat_memory::{ChatMemory, Config};

/// Docchat Memory - Conversation memory with hierarchical summarization
#[derive(Parser)]
#[command(name = "docchat-memory", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/docchat/memory.toml)
    #[arg(short, long, env = "DOCCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Database path, overriding the config
    #[arg(long)]
    db: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a conversation
    Create {
        /// Owning user ID
        #[arg(short, long)]
        user: String,
        /// Title (defaults to a placeholder replaced by the first message)
        #[arg(short, long)]
        title: Option<String>,
        /// Token budget (defaults to the configured limit)
        #[arg(long)]
        token_limit: Option<i64>,
    },
    /// List a user's conversations, most recent first
    List {
        /// User ID
        #[arg(short, long)]
        user: String,
    },
    /// Show a conversation with its summaries and messages
    Show {
        /// Conversation ID
        id: String,
        /// Number of recent messages (0 for all)
        #[arg(short, long, default_value = "0")]
        limit: i64,
    },
    /// Record a user/assistant turn and summarize if over budget
    Append {
        /// Conversation ID
        id: String,
        /// User message
        #[arg(long)]
        user_message: String,
        /// Assistant reply
        #[arg(long)]
        assistant_message: String,
    },
    /// Summarize a conversation if it exceeds its budget
    Compact {
        /// Conversation ID
        id: String,
        /// Token limit (defaults to the conversation's own)
        #[arg(long)]
        token_limit: Option<i64>,
        /// Target ratio (defaults to the configured one)
        #[arg(long)]
        target_ratio: Option<f64>,
    },
    /// Print the model context for a conversation
    Context {
        /// Conversation ID
        id: String,
        /// System prompt to put first
        #[arg(short, long)]
        system_prompt: Option<String>,
        /// Recent messages to include (defaults to the configured limit)
        #[arg(short, long)]
        recent: Option<i64>,
    },
    /// Recompute a conversation's token total from its live rows
    Recount {
        /// Conversation ID
        id: String,
    },
    /// Delete a conversation with its messages and summaries
    Delete {
        /// Conversation ID
        id: String,
    },
    /// Delete conversations with no recent activity
    Cleanup {
        /// Inactivity threshold in days (defaults to the configured value)
        #[arg(short, long)]
        days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,docchat_memory=info",
        1 => "info,docchat_memory=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    tracing::debug!(database = %config.database_path.display(), "loaded configuration");

    let memory = ChatMemory::from_config(&config)?;

    match cli.command {
        Command::Create {
            user,
            title,
            token_limit,
        } => {
            let conversation = memory.create_conversation(&user, title.as_deref(), token_limit)?;
            print_json(&conversation)
        }
        Command::List { user } => {
            let conversations = memory.list_conversations(&user)?;
            if conversations.is_empty() {
                println!("No conversations for {user}");
                return Ok(());
            }
            for c in conversations {
                println!(
                    "{}  {:>7}/{:<7}  {}  {}",
                    c.id,
                    c.token_count_total,
                    c.token_limit,
                    c.last_activity.format("%Y-%m-%d %H:%M"),
                    c.title
                );
            }
            Ok(())
        }
        Command::Show { id, limit } => show(&memory, &id, limit),
        Command::Append {
            id,
            user_message,
            assistant_message,
        } => {
            let turn = memory
                .record_turn(&id, &user_message, &assistant_message)
                .await?;
            print_json(&turn)
        }
        Command::Compact {
            id,
            token_limit,
            target_ratio,
        } => {
            let conversation = memory
                .get_conversation(&id)?
                .ok_or_else(|| anyhow::anyhow!("conversation not found: {id}"))?;
            let outcome = memory
                .summarize_if_needed(
                    &id,
                    token_limit.unwrap_or(conversation.token_limit),
                    target_ratio.unwrap_or(memory.config().target_ratio),
                )
                .await?;
            print_json(&outcome)
        }
        Command::Context {
            id,
            system_prompt,
            recent,
        } => {
            let context = memory.build_model_context(&id, system_prompt.as_deref(), recent)?;
            print_json(&context)
        }
        Command::Recount { id } => {
            let total = memory.recount_totals(&id)?;
            println!("{total}");
            Ok(())
        }
        Command::Delete { id } => {
            if memory.delete_conversation(&id)? {
                println!("Deleted {id}");
                Ok(())
            } else {
                anyhow::bail!("conversation not found: {id}")
            }
        }
        Command::Cleanup { days } => {
            let removed = match days {
                Some(days) if days > 0 => memory.cleanup_older_than(days)?,
                Some(days) => anyhow::bail!("days must be positive, got {days}"),
                None => memory.cleanup_inactive()?,
            };
            println!("Removed {removed} inactive conversation(s)");
            Ok(())
        }
    }
}

fn show(memory: &ChatMemory, id: &str, limit: i64) -> anyhow::Result<()> {
    let conversation = memory
        .get_conversation(id)?
        .ok_or_else(|| anyhow::anyhow!("conversation not found: {id}"))?;

    println!("{} ({})", conversation.title, conversation.id);
    println!(
        "tokens: {}/{}{}  messages appended: {}",
        conversation.token_count_total,
        conversation.token_limit,
        if conversation.is_over_budget() { " (over budget)" } else { "" },
        conversation.message_count
    );

    let summaries = memory.list_summaries(id)?;
    if !summaries.is_empty() {
        println!("\nSummaries:");
        for s in &summaries {
            println!("  [layer {}, {} tokens] {}", s.layer, s.token_count, s.summary_text);
        }
    }

    let messages = memory.get_recent_messages(id, limit)?;
    if !messages.is_empty() {
        println!("\nMessages:");
        for m in &messages {
            println!(
                "  {} {}: {}",
                m.timestamp.format("%H:%M:%S"),
                m.role.as_display_str(),
                m.content
            );
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
