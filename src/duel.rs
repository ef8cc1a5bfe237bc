// Duel channel lifecycle: private channels created for one duel, expired on a
// timer, and swept when the backend reports the duel over.
//
// Table slots are either a live session or a `Deleting` marker. Teardown swaps
// a session for the marker before asking the chat platform to delete the
// channel, so no observer of the table ever sees a session pointing at a
// channel that is already gone.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chat::{
    Access, ChannelId, ChannelKind, ChatBoundary, ChatError, GuildId, OverwriteTarget,
    PermissionOverwrite, PrivateChannelSpec, UserId,
};
use crate::gateway::{Backend, ChannelData};
use crate::metrics;

pub const DEFAULT_CATEGORY: &str = "Duels";
pub const DEFAULT_WARNING_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_DELETE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuelSettings {
    /// Category that groups duel channels.
    pub category_name: String,
    /// Pause between the deletion warning and the deletion itself.
    pub warning_grace: Duration,
    pub sweep_interval: Duration,
    /// Used when the backend schedules a deletion without a delay.
    pub default_delete_delay: Duration,
}

impl Default for DuelSettings {
    fn default() -> Self {
        Self {
            category_name: DEFAULT_CATEGORY.to_string(),
            warning_grace: DEFAULT_WARNING_GRACE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            default_delete_delay: DEFAULT_DELETE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelPhase {
    Active,
    ExpiryScheduled,
    Warned,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DuelError {
    #[error("invalid duel request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("missing permission: {0}")]
    PermissionDenied(String),
    #[error("chat boundary error: {0}")]
    Boundary(String),
}

impl From<ChatError> for DuelError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::PermissionDenied(m) => DuelError::PermissionDenied(m),
            ChatError::NotFound(m) => DuelError::NotFound(m),
            ChatError::Boundary(m) => DuelError::Boundary(m),
        }
    }
}

struct ArmedExpiry {
    token: Uuid,
    handle: JoinHandle<()>,
}

struct DuelSession {
    duel_id: i64,
    guild_id: GuildId,
    channel_id: ChannelId,
    channel_name: String,
    participants: [UserId; 2],
    phase: DuelPhase,
    expiry: Option<ArmedExpiry>,
}

impl DuelSession {
    fn holds_token(&self, token: Uuid) -> bool {
        self.expiry.as_ref().map(|e| e.token) == Some(token)
    }

    fn summary(&self) -> DuelSummary {
        DuelSummary {
            duel_id: self.duel_id,
            guild_id: self.guild_id,
            channel_id: self.channel_id,
            channel_name: self.channel_name.clone(),
            participants: self.participants,
            phase: self.phase,
            expiry_armed: self.expiry.is_some(),
        }
    }
}

/// Read-only view of a duel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuelSummary {
    pub duel_id: i64,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub participants: [UserId; 2],
    pub phase: DuelPhase,
    pub expiry_armed: bool,
}

enum Slot {
    Live(DuelSession),
    /// Channel deletion in flight; the session is already gone.
    Deleting,
}

/// Counts from one orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Duels the backend reported as expired.
    pub expired: usize,
    /// Channels deleted.
    pub deleted: usize,
    /// Local sessions dropped because their channel no longer exists.
    pub dropped: usize,
}

/// Overwrites for a duel channel: hidden from everyone except the two
/// participants and the bot.
pub fn duel_overwrites(players: [UserId; 2], bot: UserId) -> Vec<PermissionOverwrite> {
    let mut overwrites = vec![PermissionOverwrite {
        target: OverwriteTarget::Everyone,
        access: Access::Deny,
    }];
    for user in [players[0], players[1], bot] {
        overwrites.push(PermissionOverwrite {
            target: OverwriteTarget::Member(user),
            access: Access::Allow,
        });
    }
    overwrites
}

struct Inner {
    chat: Arc<dyn ChatBoundary>,
    backend: Arc<dyn Backend>,
    settings: DuelSettings,
    table: Mutex<HashMap<ChannelId, Slot>>,
    /// Last known duel category per guild. Held across the lookup and the
    /// creation so concurrent duels never create the category twice.
    categories: tokio::sync::Mutex<HashMap<GuildId, ChannelId>>,
}

/// Owns the duel session table and every expiry timer.
#[derive(Clone)]
pub struct DuelManager {
    inner: Arc<Inner>,
}

impl DuelManager {
    pub fn new(chat: Arc<dyn ChatBoundary>, backend: Arc<dyn Backend>, settings: DuelSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                chat,
                backend,
                settings,
                table: Mutex::new(HashMap::new()),
                categories: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &DuelSettings {
        &self.inner.settings
    }

    fn update_gauge(table: &HashMap<ChannelId, Slot>) {
        let live = table
            .values()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count();
        metrics::DUEL_SESSIONS.set(live as i64);
    }

    /// Create the private channel for a new duel and start tracking it.
    ///
    /// Nothing is recorded unless the channel was created, and nothing is
    /// created unless both players resolve as guild members.
    pub async fn create_duel(
        &self,
        guild_id: GuildId,
        data: &ChannelData,
    ) -> Result<DuelSummary, DuelError> {
        let players = match data.players.as_slice() {
            [a, b] if a != b => [*a, *b],
            _ => {
                return Err(DuelError::InvalidRequest(format!(
                    "duel {} needs exactly two distinct players, got {:?}",
                    data.duel_id, data.players
                )))
            }
        };

        let chat = &self.inner.chat;
        for user_id in players {
            chat.member(guild_id, user_id).await?;
        }

        let category = self.ensure_category(guild_id).await?;
        let spec = PrivateChannelSpec {
            guild_id,
            name: data.name.clone(),
            parent_id: Some(category),
            overwrites: duel_overwrites(players, chat.bot_user_id()),
        };
        let channel_id = chat.create_private_channel(&spec).await?;

        let session = DuelSession {
            duel_id: data.duel_id,
            guild_id,
            channel_id,
            channel_name: data.name.clone(),
            participants: players,
            phase: DuelPhase::Active,
            expiry: None,
        };
        let summary = session.summary();
        {
            let mut table = self.inner.table.lock().unwrap();
            table.insert(channel_id, Slot::Live(session));
            Self::update_gauge(&table);
        }

        metrics::DUEL_CHANNELS_CREATED_TOTAL.inc();
        tracing::info!(
            "Duel {} channel '{}' ({channel_id}) created for {} and {}",
            data.duel_id,
            data.name,
            players[0],
            players[1]
        );
        Ok(summary)
    }

    async fn ensure_category(&self, guild_id: GuildId) -> Result<ChannelId, DuelError> {
        let mut known = self.inner.categories.lock().await;
        let name = &self.inner.settings.category_name;
        let channels = self.inner.chat.channels(guild_id).await?;
        let mut categories = channels.iter().filter(|c| c.kind == ChannelKind::Category);

        let existing = match known.get(&guild_id) {
            Some(&id) if categories.clone().any(|c| c.id == id) => Some(id),
            _ => categories.find(|c| &c.name == name).map(|c| c.id),
        };
        let id = match existing {
            Some(id) => id,
            None => {
                tracing::info!("Creating duel category '{name}' in guild {guild_id}");
                self.inner.chat.create_category(guild_id, name).await?
            }
        };
        known.insert(guild_id, id);
        Ok(id)
    }

    /// Arm the expiry timer of a duel channel, replacing any timer already armed.
    pub fn schedule_expiry(&self, channel_id: ChannelId, delay: Duration) -> Result<(), DuelError> {
        let mut table = self.inner.table.lock().unwrap();
        let session = match table.get_mut(&channel_id) {
            Some(Slot::Live(s)) => s,
            _ => return Err(DuelError::NotFound(format!("duel channel {channel_id}"))),
        };

        if let Some(previous) = session.expiry.take() {
            previous.handle.abort();
            tracing::debug!("Replaced expiry timer of duel {}", session.duel_id);
        }

        let token = Uuid::new_v4();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.run_expiry(channel_id, token, delay).await;
        });
        session.expiry = Some(ArmedExpiry { token, handle });
        session.phase = DuelPhase::ExpiryScheduled;

        tracing::info!(
            "Duel {} channel {channel_id} expires in {}s",
            session.duel_id,
            delay.as_secs()
        );
        Ok(())
    }

    async fn run_expiry(&self, channel_id: ChannelId, token: Uuid, delay: Duration) {
        tokio::time::sleep(delay).await;

        let still_current = {
            let mut table = self.inner.table.lock().unwrap();
            match table.get_mut(&channel_id) {
                Some(Slot::Live(s)) if s.holds_token(token) => {
                    s.phase = DuelPhase::Warned;
                    true
                }
                _ => false,
            }
        };
        if !still_current {
            return;
        }

        let grace = self.inner.settings.warning_grace;
        let text = format!(
            "⏰ This duel channel will be deleted in {} seconds.",
            grace.as_secs()
        );
        if let Err(e) = self.inner.chat.send_text(channel_id, &text).await {
            tracing::warn!("Deletion warning for channel {channel_id} failed: {e}");
        }

        tokio::time::sleep(grace).await;
        self.teardown(channel_id, Some(token), "expired").await;
    }

    /// Remove the session (if any) and delete the channel.
    ///
    /// With `token` set, only proceeds if that timer is still the armed one.
    /// Returns true if the channel is gone afterwards.
    async fn teardown(&self, channel_id: ChannelId, token: Option<Uuid>, reason: &str) -> bool {
        let claimed = {
            let mut table = self.inner.table.lock().unwrap();
            match table.get(&channel_id) {
                Some(Slot::Deleting) => return false,
                Some(Slot::Live(s)) => {
                    if let Some(t) = token {
                        if !s.holds_token(t) {
                            return false;
                        }
                    }
                }
                None if token.is_some() => return false,
                None => {}
            }
            let previous = table.insert(channel_id, Slot::Deleting);
            Self::update_gauge(&table);
            previous
        };

        let session = match claimed {
            Some(Slot::Live(mut session)) => {
                if let Some(expiry) = session.expiry.take() {
                    if Some(expiry.token) != token {
                        expiry.handle.abort();
                    }
                }
                tracing::info!(
                    "Deleting duel {} channel {channel_id} ({reason})",
                    session.duel_id
                );
                Some(session)
            }
            _ => {
                tracing::info!("Deleting untracked duel channel {channel_id} ({reason})");
                None
            }
        };

        let result = self.inner.chat.delete_channel(channel_id).await;
        let kept = matches!(&result, Err(e) if !matches!(e, ChatError::NotFound(_)));
        {
            let mut table = self.inner.table.lock().unwrap();
            match session {
                // The channel survived: keep tracking it so a new expiry or the sweep can retry.
                Some(mut session) if kept => {
                    session.phase = DuelPhase::Active;
                    table.insert(channel_id, Slot::Live(session));
                }
                _ => {
                    table.remove(&channel_id);
                }
            }
            Self::update_gauge(&table);
        }

        match result {
            Ok(()) => {
                metrics::DUEL_CHANNELS_DELETED_TOTAL
                    .with_label_values(&[reason])
                    .inc();
                true
            }
            Err(ChatError::NotFound(_)) => {
                tracing::debug!("Duel channel {channel_id} was already gone");
                true
            }
            Err(e) => {
                tracing::error!(
                    "Failed to delete duel channel {channel_id}, a later expiry or the orphan sweep retries: {e}"
                );
                false
            }
        }
    }

    /// Delete channels of duels the backend reports as expired, tracked or not.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let expired = match self.inner.backend.expired_duels().await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Orphan sweep skipped, backend query failed: {e}");
                return report;
            }
        };
        report.expired = expired.len();
        if expired.is_empty() {
            return report;
        }

        let guilds = match self.inner.chat.guilds().await {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!("Orphan sweep skipped, guild list failed: {e}");
                return report;
            }
        };

        let mut located = HashSet::new();
        let mut complete = true;
        for guild_id in guilds {
            let channels = match self.inner.chat.channels(guild_id).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Orphan sweep could not list guild {guild_id}: {e}");
                    complete = false;
                    continue;
                }
            };
            for duel in &expired {
                let name = duel.channel_name();
                for channel in channels
                    .iter()
                    .filter(|c| c.kind == ChannelKind::Text && c.name == name)
                {
                    located.insert(duel.duel_id);
                    if self.teardown(channel.id, None, "orphan").await {
                        report.deleted += 1;
                    }
                }
            }
        }

        // Sessions whose channel vanished behind our back
        if complete {
            let gone: HashSet<i64> = expired
                .iter()
                .map(|d| d.duel_id)
                .filter(|id| !located.contains(id))
                .collect();
            report.dropped = self.drop_sessions(&gone);
        }

        tracing::info!(
            "Orphan sweep: {} expired, {} deleted, {} dropped",
            report.expired,
            report.deleted,
            report.dropped
        );
        report
    }

    fn drop_sessions(&self, duel_ids: &HashSet<i64>) -> usize {
        if duel_ids.is_empty() {
            return 0;
        }
        let mut table = self.inner.table.lock().unwrap();
        let mut dropped = 0;
        table.retain(|_, slot| match slot {
            Slot::Live(s) if duel_ids.contains(&s.duel_id) => {
                if let Some(expiry) = s.expiry.take() {
                    expiry.handle.abort();
                }
                dropped += 1;
                false
            }
            _ => true,
        });
        Self::update_gauge(&table);
        dropped
    }

    /// Spawn the periodic orphan sweep. Stops at the next sleep once `shutdown` turns true.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let interval = manager.inner.settings.sweep_interval;
            tracing::info!("Orphan sweep started: every {}s", interval.as_secs());
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                manager.sweep_once().await;
            }
            tracing::info!("Orphan sweep stopped");
        })
    }

    pub fn session(&self, channel_id: ChannelId) -> Option<DuelSummary> {
        let table = self.inner.table.lock().unwrap();
        match table.get(&channel_id) {
            Some(Slot::Live(s)) => Some(s.summary()),
            _ => None,
        }
    }

    /// All live sessions, ordered by duel id.
    pub fn sessions(&self) -> Vec<DuelSummary> {
        let table = self.inner.table.lock().unwrap();
        let mut sessions: Vec<DuelSummary> = table
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(s) => Some(s.summary()),
                Slot::Deleting => None,
            })
            .collect();
        sessions.sort_by_key(|s| s.duel_id);
        sessions
    }

    pub fn duel_for_channel(&self, channel_id: ChannelId) -> Option<i64> {
        self.session(channel_id).map(|s| s.duel_id)
    }

    pub fn channel_for_duel(&self, duel_id: i64) -> Option<ChannelId> {
        let table = self.inner.table.lock().unwrap();
        table.values().find_map(|slot| match slot {
            Slot::Live(s) if s.duel_id == duel_id => Some(s.channel_id),
            _ => None,
        })
    }

    /// Whether a channel is mid-deletion.
    pub fn is_deleting(&self, channel_id: ChannelId) -> bool {
        let table = self.inner.table.lock().unwrap();
        matches!(table.get(&channel_id), Some(Slot::Deleting))
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
