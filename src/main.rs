//! mcp-hub binary entry point.

use std::sync::Arc;

use clap::Parser;
use mcp_hub::agent_loop::{InvocationOutcome, TurnEvent, TurnEventPayload, TurnRequest, TurnStatus};
use mcp_hub::cli::{ChatArgs, Cli, Commands, ServeArgs};
use mcp_hub::config::HubConfig;
use mcp_hub::hub::McpHub;
use mcp_hub::server::{create_router, AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match HubConfig::load(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Serve(args) => handle_serve(config, args).await,
            Commands::Servers => handle_servers(&config),
            Commands::Chat(args) => handle_chat(config, args).await,
        },
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn handle_serve(config: HubConfig, args: ServeArgs) -> CliResult {
    let bind = args.bind.unwrap_or_else(|| config.settings.bind.clone());
    let hub = Arc::new(McpHub::from_config(&config)?);

    if args.connect_all {
        for (server, result) in hub.connect_all().await {
            if let Err(e) = result {
                warn!(server = %server, error = %e, "startup connect failed");
            }
        }
    }
    hub.start_periodic_refresh();

    let app = create_router(AppState::new(Arc::clone(&hub)));
    let listener = TcpListener::bind(&bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    hub.shutdown().await;
    Ok(())
}

fn handle_servers(config: &HubConfig) -> CliResult {
    if config.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }
    for spec in &config.servers {
        println!("{:<24} {}", spec.id, spec.endpoint);
    }
    Ok(())
}

async fn handle_chat(config: HubConfig, args: ChatArgs) -> CliResult {
    let hub = McpHub::from_config(&config)?;
    let targets = if args.servers.is_empty() {
        hub.server_ids()
    } else {
        args.servers.clone()
    };
    for server in &targets {
        if let Err(e) = hub.connect(server).await {
            eprintln!("⚠ {server}: {e}");
        }
    }

    // Tool activity goes to stderr; the answer goes to stdout
    let sink = Arc::new(|event: TurnEvent| match &event.payload {
        TurnEventPayload::ToolCallStarted { server, tool, .. } => {
            eprintln!("⚡ {server}/{tool}");
        }
        TurnEventPayload::ToolCallFinished { record } => match &record.outcome {
            InvocationOutcome::Ok { result } => {
                let output = truncate(&result.to_value_or_text().to_string(), 200);
                if result.is_error {
                    eprintln!("  ❌ {output}");
                } else {
                    eprintln!("  ✅ {output}");
                }
            }
            InvocationOutcome::Failed { error, .. } => eprintln!("  ❌ {error}"),
        },
        _ => {}
    });

    let mut request = TurnRequest::new(args.prompt).with_event_sink(sink);
    if !args.servers.is_empty() {
        request = request.with_servers(args.servers);
    }
    let result = hub.send_prompt(request).await;
    hub.shutdown().await;
    let result = result?;

    if let Some(advisory) = &result.advisory {
        eprintln!("({advisory})");
    }
    println!("{}", result.response);
    if result.status != TurnStatus::Completed {
        result.into_result()?;
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
