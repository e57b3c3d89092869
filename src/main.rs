use tokio::io::{AsyncBufReadExt, BufReader};

use romdock::config::EngineConfig;
use romdock::ipc::IpcServer;
use romdock::services::engine::DownloadEngine;

/// Headless engine driver: JSON requests one per line on stdin, envelopes
/// and events one per line on stdout. The desktop shell embeds the library
/// directly; this binary exists for development and scripting.
#[tokio::main]
async fn main() {
    let log_options = romdock::logging::LogOptions::from_env();
    let _log_guard = match romdock::logging::init(&log_options) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("logging init failed: {err}");
            None
        }
    };

    let config = EngineConfig::from_env();
    let engine = match DownloadEngine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!("engine startup failed: {}", err);
            eprintln!("engine startup failed: {err}");
            std::process::exit(1);
        }
    };
    engine.start();
    tracing::info!("romdock engine ready");

    // Push every bus event to stdout alongside request responses.
    let mut events = engine.bus().subscribe();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("event subscriber lagged, dropped {} events", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let server = IpcServer::new(engine.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let envelope = server.handle_raw("stdio", trimmed).await;
        match serde_json::to_string(&envelope) {
            Ok(response) => println!("{response}"),
            Err(err) => tracing::error!("response serialization failed: {}", err),
        }
    }

    engine.shutdown().await;
    forwarder.abort();
}
