use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use clawchat_sync::config::ClientConfig;
use clawchat_sync::executor::HttpMethod;
use clawchat_sync::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "clawchat-sync",
    about = "Keep a ClawChat client in sync: stream replies, follow push events, replay offline edits",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "CLAWCHAT_SERVER_URL",
        value_name = "URL",
        help = "Base URL of the ClawChat server; stored credentials are used when omitted"
    )]
    pub server: Option<String>,

    #[arg(
        long,
        global = true,
        env = "CLAWCHAT_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Bearer token for the server"
    )]
    pub token: Option<String>,

    #[arg(
        long = "data-dir",
        global = true,
        env = "CLAWCHAT_DATA_DIR",
        value_name = "DIR",
        help = "Directory holding the offline queue and stored credentials"
    )]
    pub data_dir: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Flags over environment over defaults.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_env();
        if let Some(server) = self.server.as_deref().filter(|s| !s.trim().is_empty()) {
            config.server_url = Some(server.trim_end_matches('/').to_string());
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "CLAWCHAT_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "CLAWCHAT_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a message and stream the reply to stdout (Ctrl-C stops generation)
    Chat(ChatArgs),
    /// Follow push events and replay queued edits whenever the server is reachable
    Watch(WatchArgs),
    /// Inspect or replay the offline mutation queue
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Record a mutation in the offline queue
    Enqueue(EnqueueArgs),
    /// Manage stored server credentials
    #[command(subcommand)]
    Auth(AuthCommand),
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Conversation id
    pub conversation: String,
    /// Message text
    pub text: String,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[arg(
        long = "probe-interval",
        value_name = "SECS",
        default_value_t = 5,
        help = "Seconds between reachability probes"
    )]
    pub probe_interval: u64,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Print queued actions, oldest first, one JSON object per line
    List,
    /// Print the number of queued actions
    Count,
    /// Drop every queued action
    Clear,
    /// Replay the queue against the server now
    Flush,
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE)
    pub method: HttpMethod,
    /// Path relative to the API root, e.g. /todos/42
    pub path: String,
    #[arg(long, value_name = "JSON", help = "Request body")]
    pub body: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Store the server URL and token given via --server/--token
    Save(AuthSaveArgs),
    /// Show the stored credentials (token masked)
    Show,
    /// Remove the stored credentials
    Clear,
}

#[derive(Args, Debug)]
pub struct AuthSaveArgs {
    #[arg(long = "refresh-token", value_name = "TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_enqueue_with_body() {
        let cli = Cli::try_parse_from([
            "clawchat-sync",
            "--server",
            "http://srv/",
            "enqueue",
            "patch",
            "/todos/1",
            "--body",
            "{\"status\":\"completed\"}",
        ])
        .unwrap();
        assert_eq!(cli.client_config().server_url.as_deref(), Some("http://srv"));
        match cli.command {
            Command::Enqueue(args) => {
                assert_eq!(args.method, HttpMethod::Patch);
                assert_eq!(args.path, "/todos/1");
                assert!(args.body.is_some());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn queue_subcommands_parse() {
        let cli = Cli::try_parse_from(["clawchat-sync", "queue", "flush", "--log-level", "debug"]).unwrap();
        assert!(matches!(cli.command, Command::Queue(QueueCommand::Flush)));
        assert_eq!(cli.logging.level, LogLevel::Debug);
    }
}
