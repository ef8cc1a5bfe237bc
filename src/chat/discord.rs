// Chat boundary over the Discord REST API (v10 shapes: snowflake strings,
// bitfield permission overwrites, bot token auth).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    Access, ChannelId, ChannelInfo, ChannelKind, ChatBoundary, ChatError, GuildId, MemberInfo,
    OverwriteTarget, PermissionOverwrite, PrivateChannelSpec, UserId,
};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

const VIEW_CHANNEL: u64 = 1 << 10;
const SEND_MESSAGES: u64 = 1 << 11;

const CHANNEL_TYPE_TEXT: u8 = 0;
const CHANNEL_TYPE_CATEGORY: u8 = 4;

const OVERWRITE_ROLE: u8 = 0;
const OVERWRITE_MEMBER: u8 = 1;

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawGuild {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    user: RawUser,
    #[serde(default)]
    nick: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    permission_overwrites: Vec<RawOverwrite>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct RawOverwrite {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    allow: String,
    deny: String,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

fn parse_snowflake(raw: &str) -> Result<u64, ChatError> {
    raw.parse()
        .map_err(|_| ChatError::Boundary(format!("invalid snowflake '{raw}'")))
}

fn parse_bits(raw: &str) -> u64 {
    raw.parse().unwrap_or(0)
}

/// Convert a raw channel into a `ChannelInfo`, or `None` if its id is malformed.
fn channel_from_raw(guild_id: GuildId, raw: RawChannel) -> Option<ChannelInfo> {
    let id = parse_snowflake(&raw.id).ok()?;
    let kind = match raw.kind {
        CHANNEL_TYPE_TEXT => ChannelKind::Text,
        CHANNEL_TYPE_CATEGORY => ChannelKind::Category,
        _ => ChannelKind::Other,
    };
    // The @everyone role shares the guild's id.
    let everyone = guild_id.to_string();
    let everyone_can_send = !raw.permission_overwrites.iter().any(|o| {
        o.kind == OVERWRITE_ROLE
            && o.id == everyone
            && parse_bits(&o.deny) & (VIEW_CHANNEL | SEND_MESSAGES) != 0
    });
    Some(ChannelInfo {
        id,
        guild_id,
        name: raw.name.unwrap_or_default(),
        kind,
        parent_id: raw.parent_id.and_then(|p| parse_snowflake(&p).ok()),
        everyone_can_send,
    })
}

fn overwrite_to_raw(guild_id: GuildId, overwrite: &PermissionOverwrite) -> RawOverwrite {
    let (id, kind) = match overwrite.target {
        OverwriteTarget::Everyone => (guild_id.to_string(), OVERWRITE_ROLE),
        OverwriteTarget::Member(user_id) => (user_id.to_string(), OVERWRITE_MEMBER),
    };
    let bits = (VIEW_CHANNEL | SEND_MESSAGES).to_string();
    let (allow, deny) = match overwrite.access {
        Access::Allow => (bits, "0".to_string()),
        Access::Deny => ("0".to_string(), bits),
    };
    RawOverwrite {
        id,
        kind,
        allow,
        deny,
    }
}

fn status_error(status: StatusCode, context: &str) -> ChatError {
    match status {
        StatusCode::FORBIDDEN => ChatError::PermissionDenied(context.to_string()),
        StatusCode::NOT_FOUND => ChatError::NotFound(context.to_string()),
        s => ChatError::Boundary(format!("{context}: HTTP {s}")),
    }
}

/// REST client authenticated as the bot user.
pub struct DiscordRest {
    http: Client,
    api_base: String,
    token: String,
    bot_id: UserId,
}

impl DiscordRest {
    /// Build the client and look up the bot's own user id.
    pub async fn connect(api_base: &str, token: &str, timeout: Duration) -> Result<Self, ChatError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Boundary(format!("http client: {e}")))?;
        let mut client = Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            bot_id: 0,
        };
        let me: RawUser = client
            .send_json(client.http.get(client.url("/users/@me")), "current user")
            .await?;
        client.bot_id = parse_snowflake(&me.id)?;
        tracing::info!("Connected to chat platform as {} ({})", me.username, client.bot_id);
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send(&self, req: RequestBuilder, context: &str) -> Result<reqwest::Response, ChatError> {
        let resp = req
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| ChatError::Boundary(format!("{context}: {e}")))?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), context));
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        context: &str,
    ) -> Result<T, ChatError> {
        self.send(req, context)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ChatError::Boundary(format!("{context}: {e}")))
    }
}

#[async_trait]
impl ChatBoundary for DiscordRest {
    fn bot_user_id(&self) -> UserId {
        self.bot_id
    }

    async fn send_text(&self, channel_id: ChannelId, text: &str) -> Result<(), ChatError> {
        let req = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/messages")))
            .json(&json!({ "content": text }));
        self.send(req, &format!("channel {channel_id}")).await?;
        Ok(())
    }

    async fn guilds(&self) -> Result<Vec<GuildId>, ChatError> {
        let raw: Vec<RawGuild> = self
            .send_json(self.http.get(self.url("/users/@me/guilds")), "guild list")
            .await?;
        raw.iter().map(|g| parse_snowflake(&g.id)).collect()
    }

    async fn channels(&self, guild_id: GuildId) -> Result<Vec<ChannelInfo>, ChatError> {
        let raw: Vec<RawChannel> = self
            .send_json(
                self.http.get(self.url(&format!("/guilds/{guild_id}/channels"))),
                &format!("guild {guild_id}"),
            )
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|c| channel_from_raw(guild_id, c))
            .collect())
    }

    async fn member(&self, guild_id: GuildId, user_id: UserId) -> Result<MemberInfo, ChatError> {
        let raw: RawMember = self
            .send_json(
                self.http
                    .get(self.url(&format!("/guilds/{guild_id}/members/{user_id}"))),
                &format!("member {user_id}"),
            )
            .await?;
        let display_name = raw
            .nick
            .or(raw.user.global_name)
            .unwrap_or_else(|| raw.user.username.clone());
        Ok(MemberInfo {
            user_id: parse_snowflake(&raw.user.id)?,
            username: raw.user.username,
            display_name,
        })
    }

    async fn create_category(
        &self,
        guild_id: GuildId,
        name: &str,
    ) -> Result<ChannelId, ChatError> {
        let req = self
            .http
            .post(self.url(&format!("/guilds/{guild_id}/channels")))
            .json(&json!({ "name": name, "type": CHANNEL_TYPE_CATEGORY }));
        let created: Created = self.send_json(req, &format!("category '{name}'")).await?;
        parse_snowflake(&created.id)
    }

    async fn create_private_channel(
        &self,
        spec: &PrivateChannelSpec,
    ) -> Result<ChannelId, ChatError> {
        let overwrites: Vec<RawOverwrite> = spec
            .overwrites
            .iter()
            .map(|o| overwrite_to_raw(spec.guild_id, o))
            .collect();
        let mut body = json!({
            "name": spec.name,
            "type": CHANNEL_TYPE_TEXT,
            "permission_overwrites": overwrites,
        });
        if let Some(parent) = spec.parent_id {
            body["parent_id"] = json!(parent.to_string());
        }
        let req = self
            .http
            .post(self.url(&format!("/guilds/{}/channels", spec.guild_id)))
            .json(&body);
        let created: Created = self
            .send_json(req, &format!("channel '{}'", spec.name))
            .await?;
        parse_snowflake(&created.id)
    }

    async fn rename_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        nickname: &str,
    ) -> Result<(), ChatError> {
        let req = self
            .http
            .patch(self.url(&format!("/guilds/{guild_id}/members/{user_id}")))
            .json(&json!({ "nick": nickname }));
        self.send(req, &format!("rename member {user_id}")).await?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: ChannelId) -> Result<(), ChatError> {
        let req = self
            .http
            .delete(self.url(&format!("/channels/{channel_id}")));
        self.send(req, &format!("channel {channel_id}")).await?;
        Ok(())
    }
}
