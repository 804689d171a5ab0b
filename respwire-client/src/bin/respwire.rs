//! respwire: a small command-line front end for the RESP client engine.
//!
//! Connection settings come from an optional TOML file; command-line flags
//! take precedence over file values.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use respwire_client::{ClientConfig, Command, Dispatcher, PushMessage, Reply, Subscriber};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "respwire")]
#[command(version)]
#[command(about = "Send commands to a RESP server", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Database index selected after connecting
    #[arg(short = 'n', long)]
    db: Option<u32>,

    /// Password sent with AUTH
    #[arg(short = 'a', long)]
    password: Option<String>,

    /// Connect over TLS
    #[arg(long)]
    tls: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Send one command and print its reply
    Call {
        #[arg(required = true, num_args = 1..)]
        args: Vec<String>,
    },
    /// Send `;`-separated commands as one pipeline
    Pipeline { commands: String },
    /// Stream MONITOR output
    Monitor {
        /// Stop after this many lines
        #[arg(long)]
        count: Option<usize>,
    },
    /// Subscribe to channels and print messages
    Subscribe {
        #[arg(required = true, num_args = 1..)]
        channels: Vec<String>,
        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
    /// Subscribe to patterns and print messages
    Psubscribe {
        #[arg(required = true, num_args = 1..)]
        patterns: Vec<String>,
        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    info!(addr = %config.addr(), db = config.db, tls = config.tls, "connecting");
    let dispatcher = Dispatcher::connect(config).context("failed to connect")?;

    match cli.action {
        Action::Call { args } => run_call(dispatcher, &args),
        Action::Pipeline { commands } => run_pipeline(dispatcher, &commands),
        Action::Monitor { count } => run_monitor(dispatcher, count),
        Action::Subscribe { channels, count } => {
            let subscriber = dispatcher.subscribe(&channels)?;
            run_subscriber(subscriber, count)
        }
        Action::Psubscribe { patterns, count } => {
            let subscriber = dispatcher.psubscribe(&patterns)?;
            run_subscriber(subscriber, count)
        }
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_toml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db) = cli.db {
        config.db = db;
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }
    if cli.tls {
        config.tls = true;
    }
    config.validate()?;
    Ok(config)
}

fn run_call(mut dispatcher: Dispatcher, args: &[String]) -> Result<()> {
    let cmd = Command::from_args(args);
    // Error replies are printed, not treated as failures.
    let replies = dispatcher.pipeline(std::slice::from_ref(&cmd))?;
    for reply in &replies {
        println!("{}", format_reply(reply));
    }
    Ok(())
}

fn run_pipeline(mut dispatcher: Dispatcher, script: &str) -> Result<()> {
    let cmds = parse_pipeline(script);
    if cmds.is_empty() {
        bail!("pipeline contains no commands");
    }
    let replies = dispatcher.pipeline(&cmds)?;
    for (cmd, reply) in cmds.iter().zip(&replies) {
        println!("> {cmd}");
        println!("{}", format_reply(reply));
    }
    Ok(())
}

fn run_monitor(dispatcher: Dispatcher, count: Option<usize>) -> Result<()> {
    let monitor = dispatcher.monitor()?;
    println!("OK");
    for line in monitor.take(count.unwrap_or(usize::MAX)) {
        println!("{}", String::from_utf8_lossy(&line?));
    }
    Ok(())
}

fn run_subscriber(mut subscriber: Subscriber, count: Option<usize>) -> Result<()> {
    let limit = count.unwrap_or(usize::MAX);
    let mut printed = 0;
    while printed < limit {
        let Some(message) = subscriber.messages().next() else {
            break;
        };
        let message = message?;
        if matches!(message, PushMessage::Message { .. } | PushMessage::PMessage { .. }) {
            printed += 1;
        }
        println!("{}", format_push(&message));
    }
    subscriber.close();
    Ok(())
}

fn parse_pipeline(script: &str) -> Vec<Command> {
    script
        .split(';')
        .map(|segment| segment.split_whitespace().collect::<Vec<_>>())
        .filter(|args| !args.is_empty())
        .map(Command::from_args)
        .collect()
}

fn format_push(message: &PushMessage) -> String {
    let quoted = |data: &[u8]| format!("\"{}\"", String::from_utf8_lossy(data));
    let fields: Vec<String> = match message {
        PushMessage::Message { channel, payload } => {
            vec!["\"message\"".into(), quoted(channel), quoted(payload)]
        }
        PushMessage::PMessage {
            pattern,
            channel,
            payload,
        } => vec![
            "\"pmessage\"".into(),
            quoted(pattern),
            quoted(channel),
            quoted(payload),
        ],
        PushMessage::Subscribe { channel, count, .. } => {
            vec!["\"subscribe\"".into(), quoted(channel), format!("(integer) {count}")]
        }
        PushMessage::Unsubscribe { channel, count, .. } => vec![
            "\"unsubscribe\"".into(),
            channel.as_deref().map_or_else(|| "(nil)".into(), quoted),
            format!("(integer) {count}"),
        ],
        PushMessage::Pong(data) => vec!["\"pong\"".into(), quoted(data)],
        PushMessage::Other(reply) => return format_reply(reply),
    };
    fields
        .iter()
        .enumerate()
        .map(|(idx, field)| format!("{}) {field}", idx + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders a reply the way redis-cli does.
fn format_reply(reply: &Reply) -> String {
    let mut out = String::new();
    write_reply(&mut out, reply, 0);
    out
}

fn write_reply(out: &mut String, reply: &Reply, indent: usize) {
    match reply {
        Reply::Simple(text) => out.push_str(&String::from_utf8_lossy(text)),
        Reply::Error(text) => {
            let _ = write!(out, "(error) {}", String::from_utf8_lossy(text));
        }
        Reply::Integer(value) => {
            let _ = write!(out, "(integer) {value}");
        }
        Reply::Bulk(Some(data)) => {
            let _ = write!(out, "\"{}\"", String::from_utf8_lossy(data).escape_debug());
        }
        Reply::Bulk(None) | Reply::Array(None) => out.push_str("(nil)"),
        Reply::Array(Some(items)) if items.is_empty() => out.push_str("(empty array)"),
        Reply::Array(Some(items)) => {
            let width = items.len().to_string().len();
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push('\n');
                    out.push_str(&" ".repeat(indent));
                }
                let prefix = format!("{:>width$}) ", idx + 1);
                out.push_str(&prefix);
                write_reply(out, item, indent + prefix.len());
            }
        }
    }
}
