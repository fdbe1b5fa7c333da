use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use relay_core::Notification;
use relay_server::config::relay_config;
use relay_server::ServerConfig;
use relay_settings::RelaySettings;
use relay_store::Database;
use relay_telemetry::{LogQuery, SqliteLogSink, TelemetryConfig};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const PUBLISH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Order status notification relay")]
struct Cli {
    /// Settings file. Defaults to ~/.relay/settings.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server (the default).
    Serve(ServeArgs),
    /// Publish one notification over WebSocket, as a producer would.
    Publish(PublishArgs),
    /// Print persisted warn+ log lines.
    Logs(LogsArgs),
}

#[derive(Debug, Default, Args)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database file.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[arg(long, default_value = "ws://127.0.0.1:9091/ws")]
    url: String,
    #[arg(long)]
    order_id: String,
    #[arg(long, default_value = "PENDING")]
    status: String,
}

#[derive(Debug, Args)]
struct LogsArgs {
    #[arg(long)]
    order_id: Option<String>,
    /// WARN or ERROR.
    #[arg(long)]
    level: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => relay_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => relay_settings::load_settings().context("failed to load settings")?,
    };

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(settings, args).await,
        Command::Publish(args) => publish(args).await,
        Command::Logs(args) => show_logs(&settings, args),
    }
}

async fn serve(mut settings: RelaySettings, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(db) = args.db {
        settings.database.path = db;
    }

    let _telemetry = relay_telemetry::init_telemetry(telemetry_config(&settings)?);
    tracing::info!("starting relay");

    let db = Database::open(&settings.database.path).with_context(|| {
        format!(
            "failed to open database at {}",
            settings.database.path.display()
        )
    })?;

    let handle = relay_server::start(
        ServerConfig::from_settings(&settings),
        relay_config(&settings),
        db,
    )
    .await
    .context("failed to start server")?;
    tracing::info!(port = handle.port, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn telemetry_config(settings: &RelaySettings) -> anyhow::Result<TelemetryConfig> {
    let log_level = parse_level(&settings.logging.level)?;
    let module_levels = settings
        .logging
        .modules
        .iter()
        .map(|(module, level)| parse_level(level).map(|level| (module.clone(), level)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(TelemetryConfig {
        log_level,
        module_levels,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: settings.logging.log_db_path.clone(),
    })
}

fn parse_level(level: &str) -> anyhow::Result<tracing::Level> {
    level
        .parse::<tracing::Level>()
        .with_context(|| format!("invalid log level {level:?}"))
}

/// Append `order_id` to the connect URL so the producer is subscribed like any client.
fn connect_url(base: &str, order_id: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair("order_id", order_id);
    Ok(url)
}

async fn publish(args: PublishArgs) -> anyhow::Result<()> {
    let order_id = args.order_id.trim();
    if order_id.is_empty() {
        bail!("--order-id must not be empty");
    }

    let url = connect_url(&args.url, order_id)
        .with_context(|| format!("invalid relay URL {}", args.url))?;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let message = Notification {
        id: uuid::Uuid::now_v7().to_string(),
        status: args.status,
        date: chrono::Utc::now().to_rfc3339(),
        order_id: order_id.to_string(),
    };
    let frame = serde_json::json!({
        "action": "sendmessage",
        "order_id": order_id,
        "message": message,
    });
    ws.send(Message::text(frame.to_string())).await?;

    loop {
        let next = tokio::time::timeout(PUBLISH_RESPONSE_TIMEOUT, ws.next())
            .await
            .context("timed out waiting for the relay to respond")?;
        let Some(msg) = next else {
            bail!("connection closed before the relay responded");
        };
        let Message::Text(text) = msg? else {
            continue;
        };
        let response: serde_json::Value = serde_json::from_str(&text)?;
        let Some(status) = response.get("statusCode").and_then(serde_json::Value::as_u64) else {
            continue;
        };

        println!("{response}");
        let _ = ws.close(None).await;
        if status >= 300 {
            bail!("publish failed with status {status}");
        }
        return Ok(());
    }
}

fn show_logs(settings: &RelaySettings, args: LogsArgs) -> anyhow::Result<()> {
    let sink = SqliteLogSink::new(&settings.logging.log_db_path).with_context(|| {
        format!(
            "failed to open log database at {}",
            settings.logging.log_db_path.display()
        )
    })?;
    let records = sink.query(&LogQuery {
        level: args.level.map(|level| level.to_uppercase()),
        correlation_id: args.order_id,
        limit: Some(args.limit),
        ..Default::default()
    })?;
    for record in records {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
