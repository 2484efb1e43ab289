mod server;
mod tools;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use imsg_core::rpc::DEFAULT_MAX_FRAME_BYTES;
use imsg_query::{
    ChatDbSource, ListArgs, QueryFacade, ReadArgs, RecentArgs, SearchArgs,
};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tools::{ToolCall, ToolServer};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "imsg")]
#[command(about = "Read-only queries over the local Messages history", long_about = None)]
struct Cli {
    /// Path to chat.db (defaults to ~/Library/Messages/chat.db)
    #[arg(long, global = true, env = "IMSG_DB_PATH")]
    db: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[arg(long, global = true, env = "IMSG_LOG_DIR", default_value = "")]
    log_dir: String,
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the query tools over stdio (default)
    Serve,
    /// List conversations, most recent first
    Conversations {
        #[arg(long, default_value_t = 50)]
        limit: i64,
        /// Only iMessage conversations
        #[arg(long, default_value_t = false)]
        native_only: bool,
    },
    /// Search conversations by name, identifier or participant
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Read messages for a conversation id, phone number or email
    Read {
        identifier: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 30)]
        days_back: i64,
    },
    /// Recent messages across every conversation
    Recent {
        #[arg(long, default_value_t = 30)]
        limit: i64,
        #[arg(long, default_value_t = 24)]
        hours_back: i64,
    },
}

#[derive(Debug, Clone)]
struct Config {
    db_path: PathBuf,
    debug: bool,
    log_dir: String,
    max_frame_bytes: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let _log_guard = init_logging(&config);

    let facade = QueryFacade::new(ChatDbSource::new(&config.db_path));
    let server = ToolServer::new(facade).with_max_frame_bytes(config.max_frame_bytes);
    let call = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(event = "serve", db = %config.db_path.display());
            let result = server::serve_stdio(Arc::new(server), config.max_frame_bytes).await;
            if let Err(err) = &result {
                error!(event = "server_error", error = %err);
            }
            return result;
        }
        Command::Conversations { limit, native_only } => ToolCall::ListConversations(ListArgs {
            limit,
            include_sms: !native_only,
        }),
        Command::Search { query, limit } => ToolCall::SearchConversations(SearchArgs {
            query: Some(query),
            limit,
        }),
        Command::Read {
            identifier,
            limit,
            days_back,
        } => ToolCall::ReadMessages(ReadArgs {
            identifier: Some(identifier),
            limit,
            days_back,
        }),
        Command::Recent { limit, hours_back } => {
            ToolCall::GetRecentMessages(RecentArgs { limit, hours_back })
        }
    };

    let name = call.name();
    let output = server
        .run(call)
        .with_context(|| format!("{name} failed"))?;
    println!("{output}");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    if cli.max_frame_bytes == 0 {
        bail!("--max-frame-bytes must be positive");
    }
    Ok(Config {
        db_path,
        debug: cli.debug || env_true("IMSG_DEBUG"),
        log_dir: cli.log_dir.clone(),
        max_frame_bytes: cli.max_frame_bytes,
    })
}

fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join("Library").join("Messages").join("chat.db"))
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("IMSG_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Stdout carries protocol frames, so log lines go to stderr and the optional file.
struct MultiWriter {
    stderr: io::Stderr,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("imsg-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
