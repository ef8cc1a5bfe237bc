// In-memory chat and backend doubles shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use guild_relay::chat::{
    ChannelId, ChannelInfo, ChannelKind, ChatBoundary, ChatError, GuildId, MemberInfo,
    PrivateChannelSpec, UserId,
};
use guild_relay::duel::{DuelManager, DuelSettings};
use guild_relay::gateway::{
    ActionKind, Backend, BackendError, CommandReply, CommandRequest, ExpiredDuel, RewardOutcome,
};
use guild_relay::identity::{GlyphRegistry, NicknameReconciler, Trait, TraitSet};
use guild_relay::ledger::ActivityLedger;
use guild_relay::presence::{PresenceScheduler, PresenceSettings};
use guild_relay::relay::Relay;

pub const BOT_ID: UserId = 999;
pub const GUILD: GuildId = 1;

// ── Chat double ──────────────────────────────────────────────────────

#[derive(Default)]
struct ChatState {
    guilds: Vec<GuildId>,
    channels: Vec<ChannelInfo>,
    members: HashMap<(GuildId, UserId), MemberInfo>,
    sent: Vec<(ChannelId, String)>,
    renames: Vec<(UserId, String)>,
    deleted: Vec<ChannelId>,
    created: Vec<PrivateChannelSpec>,
    deny_rename: HashSet<UserId>,
    fail_create: bool,
    fail_delete: bool,
    delete_latency: Duration,
    list_latency: Duration,
    next_id: ChannelId,
}

pub struct MockChat {
    state: Mutex<ChatState>,
}

impl MockChat {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChatState {
                next_id: 1000,
                ..Default::default()
            }),
        }
    }

    pub fn add_guild(&self, guild_id: GuildId) {
        self.state.lock().unwrap().guilds.push(guild_id);
    }

    fn add_channel(&self, guild_id: GuildId, name: &str, kind: ChannelKind, writable: bool) -> ChannelId {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.channels.push(ChannelInfo {
            id,
            guild_id,
            name: name.to_string(),
            kind,
            parent_id: None,
            everyone_can_send: writable,
        });
        id
    }

    pub fn add_text_channel(&self, guild_id: GuildId, name: &str, writable: bool) -> ChannelId {
        self.add_channel(guild_id, name, ChannelKind::Text, writable)
    }

    /// Remove a channel without going through the bot.
    pub fn remove_channel(&self, channel_id: ChannelId) {
        self.state
            .lock()
            .unwrap()
            .channels
            .retain(|c| c.id != channel_id);
    }

    pub fn add_member(&self, guild_id: GuildId, user_id: UserId, name: &str) {
        self.state.lock().unwrap().members.insert(
            (guild_id, user_id),
            MemberInfo {
                user_id,
                username: name.to_string(),
                display_name: name.to_string(),
            },
        );
    }

    pub fn deny_rename(&self, user_id: UserId) {
        self.state.lock().unwrap().deny_rename.insert(user_id);
    }

    pub fn fail_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.state.lock().unwrap().fail_delete = fail;
    }

    pub fn set_list_latency(&self, latency: Duration) {
        self.state.lock().unwrap().list_latency = latency;
    }

    pub fn set_delete_latency(&self, latency: Duration) {
        self.state.lock().unwrap().delete_latency = latency;
    }

    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_to(&self, channel_id: ChannelId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(c, _)| *c == channel_id)
            .map(|(_, text)| text)
            .collect()
    }

    pub fn renames(&self) -> Vec<(UserId, String)> {
        self.state.lock().unwrap().renames.clone()
    }

    pub fn deleted(&self) -> Vec<ChannelId> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn created(&self) -> Vec<PrivateChannelSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn channel(&self, channel_id: ChannelId) -> Option<ChannelInfo> {
        self.state
            .lock()
            .unwrap()
            .channels
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
    }

    pub fn categories(&self) -> Vec<ChannelInfo> {
        self.state
            .lock()
            .unwrap()
            .channels
            .iter()
            .filter(|c| c.kind == ChannelKind::Category)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatBoundary for MockChat {
    fn bot_user_id(&self) -> UserId {
        BOT_ID
    }

    async fn send_text(&self, channel_id: ChannelId, text: &str) -> Result<(), ChatError> {
        self.state
            .lock()
            .unwrap()
            .sent
            .push((channel_id, text.to_string()));
        Ok(())
    }

    async fn guilds(&self) -> Result<Vec<GuildId>, ChatError> {
        Ok(self.state.lock().unwrap().guilds.clone())
    }

    async fn channels(&self, guild_id: GuildId) -> Result<Vec<ChannelInfo>, ChatError> {
        let latency = self.state.lock().unwrap().list_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .channels
            .iter()
            .filter(|c| c.guild_id == guild_id)
            .cloned()
            .collect())
    }

    async fn member(&self, guild_id: GuildId, user_id: UserId) -> Result<MemberInfo, ChatError> {
        self.state
            .lock()
            .unwrap()
            .members
            .get(&(guild_id, user_id))
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("member {user_id}")))
    }

    async fn create_category(&self, guild_id: GuildId, name: &str) -> Result<ChannelId, ChatError> {
        Ok(self.add_channel(guild_id, name, ChannelKind::Category, false))
    }

    async fn create_private_channel(&self, spec: &PrivateChannelSpec) -> Result<ChannelId, ChatError> {
        if self.state.lock().unwrap().fail_create {
            return Err(ChatError::PermissionDenied("manage channels".into()));
        }
        let id = self.add_text_channel(spec.guild_id, &spec.name, false);
        let mut state = self.state.lock().unwrap();
        if let Some(channel) = state.channels.iter_mut().find(|c| c.id == id) {
            channel.parent_id = spec.parent_id;
        }
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn rename_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        nickname: &str,
    ) -> Result<(), ChatError> {
        let mut state = self.state.lock().unwrap();
        if state.deny_rename.contains(&user_id) {
            return Err(ChatError::PermissionDenied("member outranks the bot".into()));
        }
        if let Some(member) = state.members.get_mut(&(guild_id, user_id)) {
            member.display_name = nickname.to_string();
        }
        state.renames.push((user_id, nickname.to_string()));
        Ok(())
    }

    async fn delete_channel(&self, channel_id: ChannelId) -> Result<(), ChatError> {
        let latency = self.state.lock().unwrap().delete_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_delete {
            return Err(ChatError::Boundary("gateway hiccup".into()));
        }
        let before = state.channels.len();
        state.channels.retain(|c| c.id != channel_id);
        if state.channels.len() == before {
            return Err(ChatError::NotFound(format!("channel {channel_id}")));
        }
        state.deleted.push(channel_id);
        Ok(())
    }
}

// ── Backend double ───────────────────────────────────────────────────

struct BackendState {
    rewards: HashMap<UserId, RewardOutcome>,
    reward_calls: Vec<(ActionKind, UserId, String)>,
    traits: HashMap<UserId, TraitSet>,
    command_reply: Result<CommandReply, BackendError>,
    commands: Vec<CommandRequest>,
    expired: Vec<ExpiredDuel>,
}

pub struct MockBackend {
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState {
                rewards: HashMap::new(),
                reward_calls: Vec::new(),
                traits: HashMap::new(),
                command_reply: Ok(CommandReply::default()),
                commands: Vec::new(),
                expired: Vec::new(),
            }),
        }
    }

    pub fn set_reward(&self, user_id: UserId, outcome: RewardOutcome) {
        self.state.lock().unwrap().rewards.insert(user_id, outcome);
    }

    pub fn set_traits(&self, user_id: UserId, traits: TraitSet) {
        self.state.lock().unwrap().traits.insert(user_id, traits);
    }

    pub fn set_command_reply(&self, reply: Result<CommandReply, BackendError>) {
        self.state.lock().unwrap().command_reply = reply;
    }

    pub fn set_expired(&self, expired: Vec<ExpiredDuel>) {
        self.state.lock().unwrap().expired = expired;
    }

    pub fn reward_calls(&self) -> Vec<(ActionKind, UserId, String)> {
        self.state.lock().unwrap().reward_calls.clone()
    }

    pub fn commands(&self) -> Vec<CommandRequest> {
        self.state.lock().unwrap().commands.clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn request_reward(
        &self,
        action: ActionKind,
        user_id: UserId,
        display_name: &str,
    ) -> RewardOutcome {
        let mut state = self.state.lock().unwrap();
        state
            .reward_calls
            .push((action, user_id, display_name.to_string()));
        state
            .rewards
            .get(&user_id)
            .cloned()
            .unwrap_or(RewardOutcome::Denied {
                reason: "no reward".into(),
            })
    }

    async fn fetch_traits(
        &self,
        user_id: UserId,
        _username: &str,
    ) -> Result<Option<TraitSet>, BackendError> {
        Ok(self.state.lock().unwrap().traits.get(&user_id).cloned())
    }

    async fn run_command(&self, request: &CommandRequest) -> Result<CommandReply, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(request.clone());
        state.command_reply.clone()
    }

    async fn expired_duels(&self) -> Result<Vec<ExpiredDuel>, BackendError> {
        Ok(self.state.lock().unwrap().expired.clone())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

pub fn granted(leveled_up: bool, announce_text: Option<&str>) -> RewardOutcome {
    RewardOutcome::Granted {
        amount: 10,
        leveled_up,
        announce_text: announce_text.map(str::to_string),
    }
}

pub fn faction(name: &str, glyph: &str) -> TraitSet {
    TraitSet {
        faction: Some(Trait {
            display_name: name.to_string(),
            glyph: glyph.to_string(),
        }),
        ..Default::default()
    }
}

/// Everything a relay needs, wired to the doubles.
pub struct Harness {
    pub chat: Arc<MockChat>,
    pub backend: Arc<MockBackend>,
    pub ledger: ActivityLedger,
    pub duels: DuelManager,
    pub presence: Arc<PresenceScheduler>,
    pub relay: Arc<Relay>,
}

impl Harness {
    pub fn new() -> Self {
        let chat = Arc::new(MockChat::new());
        chat.add_guild(GUILD);
        let backend = Arc::new(MockBackend::new());
        let ledger = ActivityLedger::new();
        let presence = Arc::new(PresenceScheduler::new(
            ledger.clone(),
            backend.clone(),
            chat.clone(),
            PresenceSettings::default(),
        ));
        let duels = DuelManager::new(chat.clone(), backend.clone(), DuelSettings::default());
        let identity = NicknameReconciler::new(backend.clone(), chat.clone(), GlyphRegistry::builtin());
        let relay = Arc::new(Relay::new(
            ledger.clone(),
            backend.clone(),
            chat.clone(),
            duels.clone(),
            identity,
            presence.clone(),
        ));
        Self {
            chat,
            backend,
            ledger,
            duels,
            presence,
            relay,
        }
    }
}
