//! Echo bot example.
//!
//! This program connects to Slack RTM with the token from `SLACK_TOKEN`,
//! runs a short two-turn greeting per channel, and alongside it echoes every
//! message back to the channel it came from.
//!
//! Before running:
//! - Export `SLACK_TOKEN` with a bot token.
//! - Optionally set `RUST_LOG=slack_rtm_bot=debug` to watch reconnects.
//!
//! Behavior notes:
//! - Dropped connections are retried forever; press Ctrl-C to stop.
//! - A failed turn is logged and only ends that channel's exchange.

use std::error::Error;

use slack_rtm_bot::bridge::{procedure_fn, InteractionError, Step, Turns};
use slack_rtm_bot::stream::proto::EventFilter;
use slack_rtm_bot::stream::session::InboundEvent;
use slack_rtm_bot::{Bot, BotOptions};
use tracing_subscriber::EnvFilter;

fn text_of(inbound: &InboundEvent) -> &str {
    inbound.event.text.as_deref().unwrap_or_default()
}

/// Two-turn greeting: ask for a name, then use it.
fn greeting() -> Turns<InboundEvent> {
    Turns::new()
        .then(|_: &InboundEvent| "hello! what should I call you?")
        .try_then(|inbound: &InboundEvent| {
            let name = text_of(inbound).trim();
            if name.is_empty() {
                return Err(InteractionError::new("empty name"));
            }
            Ok(format!("nice to meet you, {name}"))
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bot = Bot::new(BotOptions::from_env())?;

    let greetings = bot.converse_keyed(
        EventFilter::messages(),
        |inbound: &InboundEvent| inbound.channel().unwrap_or_default().to_string(),
        |_| greeting(),
        4,
    );

    let echoes = bot.converse(
        EventFilter::messages(),
        |_| {
            procedure_fn(|inbound: &InboundEvent| {
                Ok(Step::reply(format!("you said: {}", text_of(inbound))))
            })
        },
        1,
    );

    tokio::signal::ctrl_c().await?;
    println!("shutting down");

    bot.shutdown().await;
    greetings.await?;
    echoes.await?;
    Ok(())
}
