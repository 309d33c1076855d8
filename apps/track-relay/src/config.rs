use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use track_mux::WorkerConfig;

use crate::upstream::{UpstreamConfig, DEFAULT_MAX_LINE_BYTES};

#[derive(Debug, Parser)]
#[command(
    name = "track-relay",
    author,
    version,
    about = "Relays a keyword-filtered upstream feed to WebSocket clients"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect to a running relay, track a keyword and print what arrives.
    Watch {
        /// Relay URL (e.g., ws://localhost:8888).
        #[arg(short, long, default_value = "ws://localhost:8888")]
        url: String,

        /// Keyword to track.
        #[arg(short, long)]
        keyword: String,

        /// Exit after this many messages.
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TRACK_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8888")]
    pub listen_addr: String,

    /// Redis URI used to relay client messages. An in-process bus is used when unset.
    #[arg(long, env = "TRACK_RELAY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Filter endpoint of the upstream streaming API.
    #[arg(
        long,
        env = "TRACK_RELAY_UPSTREAM_URL",
        default_value = "https://stream.twitter.com/1.1/statuses/filter.json"
    )]
    pub upstream_url: String,

    /// Bearer token presented to the upstream.
    #[arg(long, env = "TRACK_RELAY_UPSTREAM_TOKEN", hide_env_values = true)]
    pub upstream_token: Option<String>,

    /// Restrict upstream statuses to this language.
    #[arg(long, env = "TRACK_RELAY_LANGUAGE", default_value = "en")]
    pub language: String,

    #[arg(long, env = "TRACK_RELAY_UPSTREAM_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub upstream_connect_timeout_secs: u64,

    /// Silence on the upstream stream, keep-alives included, after which it is reconnected.
    #[arg(long, env = "TRACK_RELAY_UPSTREAM_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub upstream_idle_timeout_secs: u64,

    /// Longest the stream worker waits for a command before re-evaluating, in milliseconds.
    #[arg(long, env = "TRACK_RELAY_POLL_INTERVAL_MS", default_value_t = 250)]
    pub poll_interval_ms: u64,

    /// Delay before reconnecting after a transient upstream failure.
    #[arg(long, env = "TRACK_RELAY_RECONNECT_BACKOFF_SECS", default_value_t = 2)]
    pub reconnect_backoff_secs: u64,

    /// Frames buffered per client before new messages are dropped for it.
    #[arg(long, env = "TRACK_RELAY_SESSION_BUFFER", default_value_t = 64)]
    pub session_buffer: usize,

    /// How often the registry is reconciled against live sockets.
    #[arg(long, env = "TRACK_RELAY_RECONCILE_INTERVAL_SECS", default_value_t = 30)]
    pub reconcile_interval_secs: u64,

    /// Time allowed for the upstream connection to close on shutdown.
    #[arg(long, env = "TRACK_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Tracing filter directive; overrides RUST_LOG.
    #[arg(long, env = "TRACK_RELAY_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Directory for a daily-rotated file of ERROR events. Errors only go to stderr when unset.
    #[arg(long, env = "TRACK_RELAY_ERROR_LOG_DIR")]
    pub error_log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub upstream: UpstreamConfig,
    pub worker: WorkerConfig,
    pub session_buffer: usize,
    pub reconcile_interval: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.session_buffer == 0 {
            bail!("session buffer must be at least 1");
        }
        if args.poll_interval_ms == 0 {
            bail!("poll interval must be greater than zero");
        }
        if args.upstream_idle_timeout_secs == 0 {
            bail!("upstream idle timeout must be greater than zero");
        }
        let language = Some(args.language.trim().to_string()).filter(|lang| !lang.is_empty());
        Ok(ServerConfig {
            listen_addr,
            redis_url: args.redis_url.filter(|url| !url.trim().is_empty()),
            upstream: UpstreamConfig {
                endpoint: args.upstream_url,
                bearer_token: args.upstream_token,
                language,
                connect_timeout: Duration::from_secs(args.upstream_connect_timeout_secs),
                idle_timeout: Duration::from_secs(args.upstream_idle_timeout_secs),
                max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(args.poll_interval_ms),
                reconnect_backoff: Duration::from_secs(args.reconnect_backoff_secs),
                ..WorkerConfig::default()
            },
            session_buffer: args.session_buffer,
            reconcile_interval: Duration::from_secs(args.reconcile_interval_secs.max(1)),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
