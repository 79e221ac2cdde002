use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mediaviewer_core::{ConfigOverrides, ConfigSource, ForwardMode, UserId};
use mediaviewerd::{DEFAULT_LOG_FILTER, EventFile, daemon, derive_view, link_event};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mediaviewerd")]
#[command(about = "Links encrypted Matrix media to a media viewer service")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Long-running JSONL sidecar driven by the host messaging runtime over stdio.
    Daemon {
        #[command(flatten)]
        forwarder: ForwarderArgs,
    },

    /// Forward a single event read from a JSON file and print the reply.
    Link {
        #[command(flatten)]
        forwarder: ForwarderArgs,

        /// JSON file with event_id, room_id, sender and content
        #[arg(long)]
        event: PathBuf,
    },

    /// Re-derive what the viewer computes from a link fragment.
    Derive {
        /// Fragment of a self-encrypted link (with or without the leading '#')
        #[arg(long)]
        fragment: String,

        /// Ciphertext as uploaded, to decrypt and print the event content
        #[arg(long)]
        ciphertext: Option<String>,
    },
}

#[derive(Debug, Args)]
struct ForwarderArgs {
    /// TOML config file
    #[arg(long, env = "MEDIAVIEWER_CONFIG")]
    config: Option<PathBuf>,

    /// Matrix user id of the bot; its own messages are never forwarded
    #[arg(long, env = "MEDIAVIEWER_BOT_USER_ID")]
    bot_user_id: String,

    /// Overrides media_viewer_url from the config file
    #[arg(long, env = "MEDIAVIEWER_URL")]
    media_viewer_url: Option<String>,

    /// self-encrypt or passthrough
    #[arg(long)]
    mode: Option<ForwardMode>,

    /// Per-request timeout for the viewer call, clamped to 1..=300
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl ForwarderArgs {
    fn source(&self) -> ConfigSource {
        ConfigSource::new(
            self.config.clone(),
            ConfigOverrides {
                media_viewer_url: self.media_viewer_url.clone(),
                mode: self.mode,
                request_timeout_secs: self.timeout_secs,
            },
        )
    }

    fn bot_user_id(&self) -> anyhow::Result<UserId> {
        UserId::parse(&self.bot_user_id).context("parse --bot-user-id")
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.cmd {
        Command::Daemon { forwarder } => {
            daemon::daemon_main(forwarder.source(), forwarder.bot_user_id()?)
                .await
                .context("daemon failed")
        }
        Command::Link { forwarder, event } => {
            let raw = std::fs::read_to_string(&event)
                .with_context(|| format!("read event file {}", event.display()))?;
            let event: EventFile = serde_json::from_str(&raw).context("parse event file")?;
            let reply = link_event(&forwarder.source(), forwarder.bot_user_id()?, event).await?;
            println!("{reply}");
            Ok(())
        }
        Command::Derive {
            fragment,
            ciphertext,
        } => {
            let view = derive_view(&fragment, ciphertext.as_deref())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&view).context("encode derived view")?
            );
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let res = runtime.block_on(run(cli));
    // stdin is read on a blocking thread that may never return
    runtime.shutdown_timeout(Duration::from_secs(1));
    res
}
