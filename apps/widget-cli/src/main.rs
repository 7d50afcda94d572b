use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sbw_core::{MerchantId, ReqwestWidgetApi, RuntimeConfig, SharedWidgetApi};
use sbw_runtime::{
    DEFAULT_HOST_ELEMENT, FallbackKind, MemoryDocument, THEME_VARIABLES_VERSION, ThemeOverrides,
    WidgetController, WidgetInit, apply_theme, fallback_for, resolve_theme,
};
use sbw_session::shared_memory_cache;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "sbw-cli",
    version,
    about = "Drive the storefront assistant widget from a terminal"
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Mount a widget against a backend and chat over stdin (`/quit` to leave)
    Chat {
        /// Backend base URL; defaults to SBW_API_BASE or http://localhost:8080.
        #[arg(long, value_name = "URL")]
        api_base: Option<String>,
        #[arg(long)]
        merchant_id: String,
        /// Host element id the widget mounts into.
        #[arg(long, default_value = DEFAULT_HOST_ELEMENT)]
        host: String,
        /// Theme overrides as a JSON object.
        #[arg(long, value_name = "JSON")]
        theme: Option<String>,
    },
    /// Print the style variables a theme resolves to
    Theme {
        /// Theme overrides as a JSON object.
        #[arg(long, value_name = "JSON")]
        overrides: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    sbw_telemetry::install("sbw-cli")?;
    match cli.command {
        CliCommand::Chat {
            api_base,
            merchant_id,
            host,
            theme,
        } => handle_chat(api_base, merchant_id, host, theme).await,
        CliCommand::Theme { overrides } => handle_theme(overrides),
    }
}

fn parse_overrides(raw: Option<&str>) -> Result<Option<ThemeOverrides>> {
    raw.map(|raw| {
        let value: Value = serde_json::from_str(raw).context("theme overrides must be JSON")?;
        Ok(ThemeOverrides::from_value(&value))
    })
    .transpose()
}

fn handle_theme(overrides: Option<String>) -> Result<()> {
    let overrides = parse_overrides(overrides.as_deref())?;
    let (theme, fallbacks) = resolve_theme(overrides.as_ref());
    let report = json!({
        "version": THEME_VARIABLES_VERSION,
        "variables": apply_theme(&theme),
        "position": theme.position,
        "fallbacks": fallbacks
            .iter()
            .map(|fallback| json!({"field": fallback.field, "reason": fallback.reason}))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn handle_chat(
    api_base: Option<String>,
    merchant_id: String,
    host: String,
    theme: Option<String>,
) -> Result<()> {
    let mut config = RuntimeConfig::from_env();
    if let Some(api_base) = api_base {
        config = config.with_api_base(api_base);
    }
    let client = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let api: SharedWidgetApi = Arc::new(ReqwestWidgetApi::new(client, config.api_base())?);
    let document = Arc::new(MemoryDocument::with_element(&host));
    let controller = WidgetController::new(document, api, shared_memory_cache(), config);

    let mut init = WidgetInit::new(MerchantId::new(merchant_id)).with_host(host);
    if let Some(overrides) = parse_overrides(theme.as_deref())? {
        init = init.with_theme(overrides);
    }
    controller.init(init).await.context("mounting widget")?;

    let view = controller.view();
    let bot_name = view.bot_name.unwrap_or_else(|| "Assistant".into());
    for entry in &view.transcript {
        println!("{bot_name}: {}", entry.message.content);
    }
    if let Some(fallback) = view.last_error {
        eprintln!("[{}] {}", fallback.code, fallback.message);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        match controller.send_message(line).await {
            Ok(receipt) => println!("{bot_name}: {}", receipt.reply.content),
            Err(err) => {
                let fallback = fallback_for(&err);
                eprintln!("[{}] {}", fallback.code, fallback.message);
                if fallback.kind == FallbackKind::ErrorBoundary {
                    break;
                }
            }
        }
    }

    controller.unmount().await;
    info!("chat ended");
    Ok(())
}
