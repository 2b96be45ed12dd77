//! Server status example.
//!
//! Restores the user's saved session when one exists, otherwise logs in and
//! saves it, then prints the status of every server on the account.

use std::error::Error;

use aternos_sdk::client::session_filename;
use aternos_sdk::AternosClient;
use secrecy::SecretString;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let username = "REPLACE_WITH_USERNAME";
    let password = SecretString::new("REPLACE_WITH_PASSWORD".to_string());
    let session_path = session_filename(username, ".");

    let client = AternosClient::new();
    if session_path.exists() {
        client.restore_session(&session_path).await?;
    } else {
        client.login(username, &password, None).await?;
        client.save_session(&session_path, true).await?;
    }

    for server in client.list_servers(true).await? {
        let info = server.status().await?;
        println!(
            "{}: {:?} ({}) address={} software={} {}",
            server.id(),
            info.status(),
            info.status_text().unwrap_or("unknown"),
            info.address().unwrap_or("-"),
            info.software().unwrap_or("-"),
            info.version().unwrap_or(""),
        );
    }
    Ok(())
}
