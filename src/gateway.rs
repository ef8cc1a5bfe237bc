// Client for the remote scoring backend: reward requests, trait lookups,
// duel commands and the expired-duel query used by the orphan sweep.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::chat::{de_ids, UserId};
use crate::identity::TraitSet;
use crate::metrics;

/// Command sent to the duel boundary when the orphan sweep asks for expired duels.
pub const EXPIRED_DUELS_COMMAND: &str = "!expired_duels";

/// Actions understood by the scoring endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    MessageActivity,
    PresenceActivity,
    GetStats,
    GetCooldowns,
    Leaderboard,
    GetUserData,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::MessageActivity => "message_activity",
            ActionKind::PresenceActivity => "presence_activity",
            ActionKind::GetStats => "get_stats",
            ActionKind::GetCooldowns => "get_cooldowns",
            ActionKind::Leaderboard => "leaderboard",
            ActionKind::GetUserData => "get_user_data",
        }
    }
}

/// What the backend decided about an activity reward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewardOutcome {
    Granted {
        amount: i64,
        leveled_up: bool,
        announce_text: Option<String>,
    },
    OnCooldown {
        remaining_seconds: u64,
    },
    Denied {
        reason: String,
    },
    /// Transport failure, timeout, non-2xx or non-JSON reply. Never surfaced to users.
    Unreachable,
}

impl RewardOutcome {
    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RewardOutcome::Granted { .. } => "granted",
            RewardOutcome::OnCooldown { .. } => "cooldown",
            RewardOutcome::Denied { .. } => "denied",
            RewardOutcome::Unreachable => "unreachable",
        }
    }
}

/// Failure talking to the backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("backend returned HTTP {0}")]
    Status(u16),
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

#[derive(Debug, Serialize)]
struct ScoringRequest<'a> {
    user_id: String,
    username: &'a str,
    action: ActionKind,
}

/// Reply of the scoring endpoint. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct ScoringReply {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub level_up: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub xp_gained: Option<i64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub remaining: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub user_data: Option<Value>,
}

impl ScoringReply {
    /// Map a scoring reply onto a reward outcome.
    pub fn into_outcome(self) -> RewardOutcome {
        if self.kind.as_deref() == Some("cooldown") {
            return RewardOutcome::OnCooldown {
                remaining_seconds: self.remaining.unwrap_or(0),
            };
        }
        if let Some(reason) = self.error {
            return RewardOutcome::Denied { reason };
        }
        if self.success == Some(true) {
            return RewardOutcome::Granted {
                amount: self.xp_gained.unwrap_or(0),
                leveled_up: self.level_up.unwrap_or(false),
                announce_text: self.message,
            };
        }
        RewardOutcome::Denied {
            reason: "no reward".to_string(),
        }
    }
}

/// Request to the duel command endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRequest {
    pub command: String,
    pub user_id: String,
    pub username: String,
    pub duel_id: Option<i64>,
}

/// Channel the backend wants created for a new duel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelData {
    pub name: String,
    pub duel_id: i64,
    #[serde(deserialize_with = "de_ids")]
    pub players: Vec<UserId>,
}

/// A duel the backend considers over.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExpiredDuel {
    pub duel_id: i64,
    #[serde(default)]
    pub channel_name: Option<String>,
}

impl ExpiredDuel {
    /// Name of the duel's channel, defaulting to `duel-{id}`.
    pub fn channel_name(&self) -> String {
        self.channel_name
            .clone()
            .unwrap_or_else(|| format!("duel-{}", self.duel_id))
    }
}

/// Reply of the duel command endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandReply {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub create_duel_channel: bool,
    #[serde(default)]
    pub channel_data: Option<ChannelData>,
    #[serde(default)]
    pub schedule_channel_delete: bool,
    #[serde(default)]
    pub delete_delay: Option<u64>,
    #[serde(default)]
    pub duel_id: Option<i64>,
    #[serde(default)]
    pub expired_duels: Vec<ExpiredDuel>,
}

impl CommandReply {
    /// Text to post back to the user, if any.
    pub fn user_text(&self) -> Option<String> {
        self.response
            .clone()
            .or_else(|| self.message.clone())
            .or_else(|| self.error.as_ref().map(|e| format!("❌ {e}")))
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Ask for an activity reward. Never fails: transport problems become `Unreachable`.
    async fn request_reward(
        &self,
        action: ActionKind,
        user_id: UserId,
        display_name: &str,
    ) -> RewardOutcome;

    /// Current trait snapshot for a user, `None` if the backend has no record.
    async fn fetch_traits(
        &self,
        user_id: UserId,
        username: &str,
    ) -> Result<Option<TraitSet>, BackendError>;

    async fn run_command(&self, request: &CommandRequest) -> Result<CommandReply, BackendError>;

    /// Duels the backend considers finished whose channels may still exist.
    async fn expired_duels(&self) -> Result<Vec<ExpiredDuel>, BackendError>;
}

/// HTTP implementation of `Backend`.
pub struct HttpBackend {
    http: Client,
    scoring_url: String,
    duel_url: String,
}

impl HttpBackend {
    /// Build the client. Every request is bounded by `timeout`.
    pub fn new(scoring_url: &str, duel_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("http client: {e}")))?;
        Ok(Self {
            http,
            scoring_url: scoring_url.to_string(),
            duel_url: duel_url.to_string(),
        })
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn scoring(
        &self,
        action: ActionKind,
        user_id: UserId,
        username: &str,
    ) -> Result<ScoringReply, BackendError> {
        let body = ScoringRequest {
            user_id: user_id.to_string(),
            username,
            action,
        };
        self.post_json(&self.scoring_url, &body).await
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn request_reward(
        &self,
        action: ActionKind,
        user_id: UserId,
        display_name: &str,
    ) -> RewardOutcome {
        let outcome = match self.scoring(action, user_id, display_name).await {
            Ok(reply) => reply.into_outcome(),
            Err(e) => {
                tracing::warn!("Reward request {} for {user_id} failed: {e}", action.as_str());
                RewardOutcome::Unreachable
            }
        };
        metrics::REWARD_REQUESTS_TOTAL
            .with_label_values(&[action.as_str(), outcome.label()])
            .inc();
        outcome
    }

    async fn fetch_traits(
        &self,
        user_id: UserId,
        username: &str,
    ) -> Result<Option<TraitSet>, BackendError> {
        let reply = self
            .scoring(ActionKind::GetUserData, user_id, username)
            .await?;
        match reply.user_data {
            Some(Value::Null) | None => Ok(None),
            Some(data) => serde_json::from_value(data)
                .map(Some)
                .map_err(|e| BackendError::Malformed(e.to_string())),
        }
    }

    async fn run_command(&self, request: &CommandRequest) -> Result<CommandReply, BackendError> {
        self.post_json(&self.duel_url, request).await
    }

    async fn expired_duels(&self) -> Result<Vec<ExpiredDuel>, BackendError> {
        let request = CommandRequest {
            command: EXPIRED_DUELS_COMMAND.to_string(),
            user_id: "0".to_string(),
            username: "system".to_string(),
            duel_id: None,
        };
        let reply: CommandReply = self.post_json(&self.duel_url, &request).await?;
        if let Some(error) = reply.error {
            return Err(BackendError::Malformed(error));
        }
        Ok(reply.expired_duels)
    }
}
