use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use pgmcp::auth::token_store::TokenStore;
use pgmcp::auth::user_store::UserStore;
use pgmcp::config::AppConfig;
use pgmcp::server;

#[derive(Parser)]
#[command(
    name = "pgmcp",
    about = "Model Context Protocol server exposing PostgreSQL to AI assistants"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (the default)
    Serve,
    /// Manage service tokens
    Token {
        #[command(subcommand)]
        cmd: TokenCmd,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        cmd: UserCmd,
    },
}

#[derive(Subcommand)]
enum TokenCmd {
    /// Create a service token; the token value is printed exactly once
    Add {
        #[arg(long, default_value = "")]
        annotation: String,
        /// Days until expiry; omit for a token that never expires
        #[arg(long)]
        expires_in_days: Option<i64>,
        /// Bind the token to a single database
        #[arg(long)]
        database: Option<String>,
    },
    /// List tokens (hash prefixes only)
    List,
    /// Remove a token by id or by a hash prefix of at least 8 chars
    Remove { id: String },
    /// Remove every expired token
    Cleanup,
}

#[derive(Subcommand)]
enum UserCmd {
    /// Create a user
    Add {
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "")]
        annotation: String,
    },
    /// Change a user's password and/or annotation
    Update {
        username: String,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        annotation: Option<String>,
    },
    Enable { username: String },
    Disable { username: String },
    Remove { username: String },
    List,
    /// Clear a user's failed-attempt counter
    ResetAttempts { username: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgmcp=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))?;

    if let Err(msg) = config.validate() {
        eprintln!("Configuration error: {msg}");
        return Err(msg.into());
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(
                host = %config.server.host,
                port = config.server.port,
                auth = config.auth.enabled,
                databases = config.databases.len(),
                "starting pgmcp"
            );
            server::serve(config).await
        }
        Command::Token { cmd } => run_token_cmd(&config, cmd),
        Command::User { cmd } => run_user_cmd(&config, cmd),
    }
}

fn run_token_cmd(config: &AppConfig, cmd: TokenCmd) -> Result<(), Box<dyn std::error::Error>> {
    let store = TokenStore::open(&config.auth.token_file)?;
    match cmd {
        TokenCmd::Add {
            annotation,
            expires_in_days,
            database,
        } => {
            let (plaintext, hash) = TokenStore::generate();
            let expires_at = expires_in_days.map(|days| Utc::now() + Duration::days(days));
            let id = store.add(&hash, &annotation, expires_at, database)?;
            println!("token id: {id}");
            println!("token:    {plaintext}");
            println!("Store this token now; it cannot be recovered later.");
        }
        TokenCmd::List => {
            for t in store.list() {
                let expiry = match t.expires_at {
                    Some(exp) if t.expired => format!("{exp} (expired)"),
                    Some(exp) => exp.to_string(),
                    None => "never".to_string(),
                };
                let bound = t.bound_database.unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {}…  created {}  expires {}  db {}  {}",
                    t.id, t.hash_prefix, t.created_at, expiry, bound, t.annotation
                );
            }
        }
        TokenCmd::Remove { id } => {
            let removed = store.remove(&id)?;
            println!("removed token {}", removed.id);
        }
        TokenCmd::Cleanup => {
            let (count, _) = store.cleanup_expired()?;
            println!("removed {count} expired tokens");
        }
    }
    Ok(())
}

fn run_user_cmd(config: &AppConfig, cmd: UserCmd) -> Result<(), Box<dyn std::error::Error>> {
    let store = UserStore::open(&config.auth.user_file)?;
    match cmd {
        UserCmd::Add {
            username,
            password,
            annotation,
        } => {
            store.add_user(&username, &password, &annotation)?;
            println!("added user {username}");
        }
        UserCmd::Update {
            username,
            password,
            annotation,
        } => {
            store.update_user(&username, password.as_deref(), annotation.as_deref())?;
            println!("updated user {username}");
        }
        UserCmd::Enable { username } => {
            store.set_enabled(&username, true)?;
            println!("enabled user {username}");
        }
        UserCmd::Disable { username } => {
            store.set_enabled(&username, false)?;
            println!("disabled user {username}");
        }
        UserCmd::Remove { username } => {
            store.remove_user(&username)?;
            println!("removed user {username}");
        }
        UserCmd::List => {
            for u in store.list() {
                let status = if u.enabled { "enabled" } else { "disabled" };
                let last = u
                    .last_login
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}  {}  created {}  last login {}  failed {}  {}",
                    u.username, status, u.created_at, last, u.failed_attempts, u.annotation
                );
            }
        }
        UserCmd::ResetAttempts { username } => {
            store.reset_failed_attempts(&username)?;
            println!("reset failed attempts for {username}");
        }
    }
    Ok(())
}
