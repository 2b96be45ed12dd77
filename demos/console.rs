//! Console streaming example.
//!
//! Logs in, starts the first server on the account, and prints its console
//! output while sending a single command once the server is online.
//!
//! Before running:
//! - Replace the username and password placeholders below.
//!
//! Behavior notes:
//! - The queued start is confirmed automatically.
//! - The console stream is activated when the server reports "starting".
//! - The example returns once the panel closes the socket.

use std::error::Error;

use aternos_sdk::server::{ServerInfo, ServerStatus};
use aternos_sdk::stream::multiplexer::{HandlerDrain, StreamOptions};
use aternos_sdk::stream::proto::{StreamEvent, StreamKind};
use aternos_sdk::AternosClient;
use secrecy::SecretString;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let username = "REPLACE_WITH_USERNAME";
    let password = SecretString::new("REPLACE_WITH_PASSWORD".to_string());

    let client = AternosClient::new();
    client.login(username, &password, None).await?;

    let server = client
        .list_servers(true)
        .await?
        .into_iter()
        .next()
        .ok_or("account has no servers")?;
    let mut stream = server
        .stream(
            StreamOptions::default()
                .with_auto_confirm(true)
                .with_auto_activate(true),
        )
        .await?;

    stream.subscribe(StreamKind::Console, |event, _| async move {
        if let StreamEvent::ConsoleLine(line) = event {
            println!("console: {line}");
        }
    });

    let sender = stream.sender();
    stream.subscribe(StreamKind::Status, move |event, _| {
        let sender = sender.clone();
        async move {
            let Some(info) = event.as_status().map(ServerInfo::from_value) else {
                return;
            };
            println!("status: {:?}", info.status());
            if info.status() == ServerStatus::On {
                if let Err(error) = sender.command("say Hello from Rust").await {
                    eprintln!("command failed: {error}");
                }
            }
        }
    });

    stream.connect().await?;
    server.start(false, true).await?;

    stream.closed().await;
    stream.close(HandlerDrain::Wait).await?;
    Ok(())
}
