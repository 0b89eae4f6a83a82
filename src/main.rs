use std::io::Write;

use cloudcode_relay::config::{load_config, AppConfig};
use cloudcode_relay::observability::init_tracing;
use cloudcode_relay::protocol::conversation::ChatRequest;
use cloudcode_relay::Relay;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const USAGE: &str = "usage: cloudcode-relay <config.yaml> <conversation.json>";

fn main() {
    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(conversation_path)) = (args.next(), args.next()) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config = load_config(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });
    let request = load_conversation(&conversation_path).unwrap_or_else(|e| {
        eprintln!("Failed to load conversation '{conversation_path}': {e}");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);
    let runtime = build_runtime();

    let code = runtime.block_on(async move { run(config, request).await });
    std::process::exit(code);
}

fn load_conversation(path: &str) -> Result<ChatRequest, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&contents).map_err(|e| e.to_string())
}

fn write_json_line<W: Write, T: Serialize>(out: &mut W, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    out.flush()
}

fn build_runtime() -> tokio::runtime::Runtime {
    let mut runtime_builder = tokio::runtime::Builder::new_current_thread();
    runtime_builder.enable_io();
    runtime_builder.enable_time();
    runtime_builder.build().unwrap_or_else(|e| {
        eprintln!("Failed to initialize Tokio runtime: {e}");
        std::process::exit(1);
    })
}

async fn run(config: AppConfig, request: ChatRequest) -> i32 {
    let relay = match Relay::from_config(config) {
        Ok(relay) => relay,
        Err(err) => {
            eprintln!("Failed to start relay: {err}");
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; cancelling stream");
            interrupt.cancel();
        }
    });

    tracing::info!(model = %request.model, "cloudcode-relay streaming request");
    let (mut events, handle) = relay.spawn_chat(request, cancel);

    let stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        if let Err(err) = write_json_line(&mut stdout.lock(), &event) {
            tracing::debug!("stdout closed: {err}");
            break;
        }
    }
    drop(events);

    match handle.await {
        Ok(Ok(summary)) => {
            let line = serde_json::json!({ "type": "summary", "summary": summary });
            if let Err(err) = write_json_line(&mut stdout.lock(), &line) {
                tracing::debug!("stdout closed before summary: {err}");
            }
            0
        }
        Ok(Err(err)) => {
            eprintln!("Request failed: {err}");
            1
        }
        Err(err) => {
            eprintln!("Relay task failed: {err}");
            1
        }
    }
}
