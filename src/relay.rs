// Inbound chat events: activity tracking, message rewards, commands, and the
// duel and nickname side effects of command replies.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::{de_id, de_opt_id, ChannelId, ChatBoundary, GuildId, UserId};
use crate::duel::{DuelManager, DuelSummary};
use crate::gateway::{ActionKind, Backend, CommandRequest, RewardOutcome};
use crate::identity::NicknameReconciler;
use crate::ledger::ActivityLedger;
use crate::presence::{PresenceScheduler, SchedulerPhase};

pub const COMMAND_PREFIX: char = '!';

const TEST_REPLY: &str = "🤖 Bot is working!";
const NO_RESPONSE: &str = "❌ No response from server";
const CONNECTION_ERROR: &str = "❌ Connection error";
const DUEL_CHANNEL_FAILED: &str = "❌ Could not create the duel channel.";

#[derive(Debug, Clone, Deserialize)]
pub struct Author {
    #[serde(deserialize_with = "de_id")]
    pub id: UserId,
    pub username: String,
    /// Guild nickname or global display name, when the platform sent one.
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl Author {
    /// Name currently shown for the author.
    pub fn shown_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvent {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub guild_id: Option<GuildId>,
    #[serde(deserialize_with = "de_id")]
    pub channel_id: ChannelId,
    pub author: Author,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

impl PresenceStatus {
    /// Whether this status counts as an activity signal.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PresenceStatus::Online | PresenceStatus::Idle | PresenceStatus::Dnd
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceEvent {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub guild_id: Option<GuildId>,
    #[serde(deserialize_with = "de_id")]
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub status: PresenceStatus,
    #[serde(default)]
    pub bot: bool,
}

/// Diagnostics exposed by `!status` and `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub tracked_users: usize,
    pub scheduler_phase: SchedulerPhase,
    pub glyph_registry_version: u32,
    pub duel_sessions: Vec<DuelSummary>,
}

pub struct Relay {
    ledger: ActivityLedger,
    backend: Arc<dyn Backend>,
    chat: Arc<dyn ChatBoundary>,
    duels: DuelManager,
    identity: NicknameReconciler,
    presence: Arc<PresenceScheduler>,
}

impl Relay {
    pub fn new(
        ledger: ActivityLedger,
        backend: Arc<dyn Backend>,
        chat: Arc<dyn ChatBoundary>,
        duels: DuelManager,
        identity: NicknameReconciler,
        presence: Arc<PresenceScheduler>,
    ) -> Self {
        Self {
            ledger,
            backend,
            chat,
            duels,
            identity,
            presence,
        }
    }

    pub fn ledger(&self) -> &ActivityLedger {
        &self.ledger
    }

    pub fn duels(&self) -> &DuelManager {
        &self.duels
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            tracked_users: self.ledger.len(),
            scheduler_phase: self.presence.phase(),
            glyph_registry_version: self.identity.registry().version(),
            duel_sessions: self.duels.sessions(),
        }
    }

    async fn say(&self, channel_id: ChannelId, text: &str) {
        if let Err(e) = self.chat.send_text(channel_id, text).await {
            tracing::warn!("Could not send to channel {channel_id}: {e}");
        }
    }

    pub async fn handle_presence(&self, event: PresenceEvent, now: DateTime<Utc>) {
        if event.bot || !event.status.is_active() {
            return;
        }
        let name = event
            .display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&event.username);
        self.ledger.touch(event.user_id, name, now);
    }

    pub async fn handle_message(&self, event: MessageEvent, now: DateTime<Utc>) {
        if event.author.bot || event.author.id == self.chat.bot_user_id() {
            return;
        }
        self.ledger
            .touch(event.author.id, event.author.shown_name(), now);

        if event.content.starts_with(COMMAND_PREFIX) {
            tracing::info!(
                "Command '{}' from {} ({})",
                event.content,
                event.author.shown_name(),
                event.author.id
            );
            self.handle_command(&event).await;
        } else {
            self.reward_message(&event).await;
        }
    }

    async fn reward_message(&self, event: &MessageEvent) {
        let outcome = self
            .backend
            .request_reward(
                ActionKind::MessageActivity,
                event.author.id,
                event.author.shown_name(),
            )
            .await;
        match outcome {
            RewardOutcome::Granted {
                leveled_up: true,
                announce_text,
                ..
            } => {
                let text = announce_text
                    .unwrap_or_else(|| format!("🎉 {} leveled up!", event.author.shown_name()));
                self.say(event.channel_id, &text).await;
            }
            RewardOutcome::Unreachable => {
                tracing::debug!("Message reward for {} skipped, backend unreachable", event.author.id);
            }
            _ => {}
        }
    }

    async fn handle_command(&self, event: &MessageEvent) {
        match event.content.trim() {
            "!test" => self.say(event.channel_id, TEST_REPLY).await,
            "!status" => {
                let body = serde_json::to_string_pretty(&self.status())
                    .unwrap_or_else(|e| format!("status unavailable: {e}"));
                self.say(event.channel_id, &format!("```json\n{body}\n```"))
                    .await;
            }
            _ => self.relay_command(event).await,
        }
    }

    async fn relay_command(&self, event: &MessageEvent) {
        let author = &event.author;
        let request = CommandRequest {
            command: event.content.clone(),
            user_id: author.id.to_string(),
            username: author.shown_name().to_string(),
            duel_id: self.duels.duel_for_channel(event.channel_id),
        };

        let reply = match self.backend.run_command(&request).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Command '{}' failed: {e}", event.content);
                self.say(event.channel_id, CONNECTION_ERROR).await;
                return;
            }
        };

        let text = reply
            .user_text()
            .unwrap_or_else(|| NO_RESPONSE.to_string());
        self.say(event.channel_id, &text).await;

        if reply.create_duel_channel {
            match (event.guild_id, &reply.channel_data) {
                (Some(guild_id), Some(data)) => match self.duels.create_duel(guild_id, data).await {
                    Ok(summary) => {
                        self.say(
                            event.channel_id,
                            &format!("⚔️ Duel channel ready: <#{}>", summary.channel_id),
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::warn!("Duel channel for duel {} not created: {e}", data.duel_id);
                        self.say(event.channel_id, DUEL_CHANNEL_FAILED).await;
                    }
                },
                _ => {
                    tracing::warn!("Duel channel requested without guild or channel data");
                    self.say(event.channel_id, DUEL_CHANNEL_FAILED).await;
                }
            }
        }

        if reply.schedule_channel_delete {
            let target = reply
                .duel_id
                .and_then(|id| self.duels.channel_for_duel(id))
                .unwrap_or(event.channel_id);
            let delay = reply
                .delete_delay
                .map(Duration::from_secs)
                .unwrap_or(self.duels.settings().default_delete_delay);
            if let Err(e) = self.duels.schedule_expiry(target, delay) {
                tracing::warn!("Could not schedule deletion of channel {target}: {e}");
            }
        }

        if reply.error.is_none() {
            if let Some(guild_id) = event.guild_id {
                self.identity
                    .reconcile(
                        guild_id,
                        author.id,
                        &author.username,
                        author.shown_name(),
                        Some(event.channel_id),
                    )
                    .await;
            }
        }
    }
}
