//! Live match listener.
//!
//! Authenticates with the credentials from the environment (a `.env` file is
//! loaded first), listens to two matches and prints every update until
//! Ctrl-C.
//!
//! Required variables: `LZPUSH_ACCESS_KEY`, `LZPUSH_SECRET_KEY`,
//! `LZPUSH_APP_ID`. Set `RUST_LOG=lzpush=debug` to see the session lifecycle.

use std::error::Error;

use lzpush::{Dispatcher, PushConfig, SessionManager};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lzpush=info")),
        )
        .init();

    let config = PushConfig::from_env()?;
    let dispatcher = Dispatcher::new()
        .on_update(|card: Value| {
            println!("match update for {}", card["key"]);
        })
        .on_past_ball_update(|ball: Value| {
            println!("past ball update: {ball}");
        })
        .on_event(|name: &str, args: &[Value]| {
            println!("event {name} with params {args:?}");
        });

    let mut manager = SessionManager::from_config(config, dispatcher)?;
    manager.listen_match("iplt20_2013_g54");
    manager.listen_match("iplt20_2013_g55");

    let handle = manager.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    manager.connect(None).await?;
    Ok(())
}
