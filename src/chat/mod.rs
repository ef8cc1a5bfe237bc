// Chat platform boundary: the operations the relay needs from the chat client.

pub mod discord;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub type UserId = u64;
pub type ChannelId = u64;
pub type GuildId = u64;

/// Snowflake ids arrive as JSON strings or numbers depending on the producer.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Num(u64),
    Str(String),
}

impl IdRepr {
    fn into_id<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            IdRepr::Num(n) => Ok(n),
            IdRepr::Str(s) => s.trim().parse().map_err(E::custom),
        }
    }
}

pub fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    IdRepr::deserialize(deserializer)?.into_id()
}

pub fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Option::<IdRepr>::deserialize(deserializer)?
        .map(IdRepr::into_id)
        .transpose()
}

pub fn de_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u64>, D::Error> {
    Vec::<IdRepr>::deserialize(deserializer)?
        .into_iter()
        .map(IdRepr::into_id)
        .collect()
}

/// Failure of a chat-boundary call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// The bot lacks the rank or permission for this mutation.
    #[error("missing permission: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other mutation or transport failure.
    #[error("chat boundary error: {0}")]
    Boundary(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Category,
    Other,
}

/// A channel as seen by the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub kind: ChannelKind,
    pub parent_id: Option<ChannelId>,
    /// Whether the guild-wide default role may post here.
    pub everyone_can_send: bool,
}

/// A guild member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: UserId,
    pub username: String,
    /// Guild nickname if set, else the global display name or username.
    pub display_name: String,
}

/// Who a permission overwrite applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverwriteTarget {
    /// The guild-wide default role.
    Everyone,
    Member(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

/// View/send access for one target on a private channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionOverwrite {
    pub target: OverwriteTarget,
    pub access: Access,
}

/// Request to create a restricted-visibility text channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateChannelSpec {
    pub guild_id: GuildId,
    pub name: String,
    pub parent_id: Option<ChannelId>,
    pub overwrites: Vec<PermissionOverwrite>,
}

#[async_trait]
pub trait ChatBoundary: Send + Sync {
    /// The bot's own user id.
    fn bot_user_id(&self) -> UserId;

    async fn send_text(&self, channel_id: ChannelId, text: &str) -> Result<(), ChatError>;

    /// Guilds the bot is connected to.
    async fn guilds(&self) -> Result<Vec<GuildId>, ChatError>;

    /// Channels of one guild, in platform order.
    async fn channels(&self, guild_id: GuildId) -> Result<Vec<ChannelInfo>, ChatError>;

    async fn member(&self, guild_id: GuildId, user_id: UserId) -> Result<MemberInfo, ChatError>;

    async fn create_category(&self, guild_id: GuildId, name: &str)
        -> Result<ChannelId, ChatError>;

    async fn create_private_channel(
        &self,
        spec: &PrivateChannelSpec,
    ) -> Result<ChannelId, ChatError>;

    /// Set a member's guild nickname.
    async fn rename_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        nickname: &str,
    ) -> Result<(), ChatError>;

    async fn delete_channel(&self, channel_id: ChannelId) -> Result<(), ChatError>;
}

/// Pick the channel for announcements in a guild: the first text channel named
/// `preferred`, else the first text channel everyone may write to.
pub fn pick_announcement_channel(channels: &[ChannelInfo], preferred: &str) -> Option<ChannelId> {
    let text = || channels.iter().filter(|c| c.kind == ChannelKind::Text);
    text()
        .find(|c| c.name == preferred)
        .or_else(|| text().find(|c| c.everyone_can_send))
        .map(|c| c.id)
}

/// Resolve the announcement channel of every connected guild.
/// Guilds whose channel list cannot be fetched are skipped silently.
pub async fn announcement_channels(chat: &dyn ChatBoundary, preferred: &str) -> Vec<ChannelId> {
    let guilds = match chat.guilds().await {
        Ok(g) => g,
        Err(e) => {
            tracing::debug!("Could not list guilds for announcements: {e}");
            return Vec::new();
        }
    };

    let mut targets = Vec::new();
    for guild_id in guilds {
        match chat.channels(guild_id).await {
            Ok(channels) => {
                if let Some(id) = pick_announcement_channel(&channels, preferred) {
                    targets.push(id);
                }
            }
            Err(e) => tracing::debug!("Could not list channels of guild {guild_id}: {e}"),
        }
    }
    targets
}
