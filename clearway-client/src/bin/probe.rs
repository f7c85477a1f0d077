//! Quick connectivity probe against a Clearway relay.

use std::sync::Arc;
use std::time::Duration;

use clearway_client::{ClearwayClient, ClearwayConfig, ConnectionState};
use clearway_core::{Signer, WalletKey};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8000/ws".to_string());
    println!("connecting to {url}...");

    let config = ClearwayConfig::new(url, std::env::temp_dir().join("clearway-probe"));
    let client = ClearwayClient::new(config)?;
    client.connect();

    for _ in 0..50 {
        if client.connection_state() == ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("connection state: {:?}", client.connection_state());

    let wallet = Arc::new(WalletKey::generate());
    println!("authenticating as {}", wallet.address());
    match client.set_wallet(wallet).await {
        Ok(true) => println!("authenticated"),
        Ok(false) => println!("handshake preconditions not met"),
        Err(e) => println!("authentication failed: {e}"),
    }

    if client.is_authenticated() {
        let sessions = client.query_sessions(None).await?;
        println!("visible sessions: {}", sessions.len());
        for session in sessions {
            println!("  {} ({:?})", session.app_session_id, session.status);
        }
    }

    Ok(())
}
