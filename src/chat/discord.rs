//! Discord gateway adapter for the command handler.

use anyhow::Result;
use log::{error, info};
use serenity::Client;
use serenity::all::{
    ActivityData, ChannelId, Context, EventHandler, GatewayIntents, Message, OnlineStatus, Ready,
};
use serenity::async_trait;
use serenity::http::Http;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat::commands::{CommandHandler, parse, render_announcement};
use crate::domain::problem::ProblemRecord;

struct DiscordHandler {
    commands: Arc<CommandHandler>,
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Bot is online as {}", ready.user.name);
        ctx.set_presence(
            Some(ActivityData::playing(format!(
                "Type {}help for usage!",
                self.commands.prefix()
            ))),
            OnlineStatus::Online,
        );
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(cmd) = parse(&msg.content, self.commands.prefix()) else {
            return;
        };
        info!(
            "Command {:?} from {} in channel {}",
            cmd, msg.author.name, msg.channel_id
        );

        let replies = self.commands.handle(&cmd);
        send_all(&ctx.http, msg.channel_id, &replies).await;
    }
}

/// Send messages in order; stop at the first failure so the rest does not
/// arrive out of context.
async fn send_all(http: &Arc<Http>, channel: ChannelId, messages: &[String]) {
    for m in messages {
        if let Err(e) = channel.say(http, m.as_str()).await {
            error!("Failed to send message to channel {channel}: {e}");
            break;
        }
    }
}

async fn announce_loop(
    http: Arc<Http>,
    channel: ChannelId,
    mut problems: mpsc::UnboundedReceiver<ProblemRecord>,
) {
    while let Some(problem) = problems.recv().await {
        info!(
            "Announcing problem #{} in channel {channel}",
            problem.problem_number
        );
        send_all(&http, channel, &render_announcement(&problem)).await;
    }
}

/// Connect to the gateway and serve commands until the connection ends.
/// With `announcements`, newly discovered problems are posted to the channel.
pub async fn run_bot(
    token: &str,
    commands: Arc<CommandHandler>,
    announcements: Option<(u64, mpsc::UnboundedReceiver<ProblemRecord>)>,
) -> Result<()> {
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(token, intents)
        .event_handler(DiscordHandler { commands })
        .await?;

    if let Some((channel_id, rx)) = announcements {
        tokio::spawn(announce_loop(
            Arc::clone(&client.http),
            ChannelId::new(channel_id),
            rx,
        ));
    }

    info!("Starting Discord Gateway client...");
    client.start().await?;
    Ok(())
}
