// Nickname synthesis from backend-held traits, and reconciliation against the
// name currently shown on the chat platform.
//
// A synthesized nickname has the shape `<glyphs> <base name>`, where the glyph
// prefix comes from the user's faction, race and specialization. Recognising an
// existing prefix relies on a versioned registry of known glyphs rather than on
// "anything that looks like an emoji".

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::chat::{ChannelId, ChatBoundary, ChatError, GuildId, UserId};
use crate::gateway::Backend;
use crate::metrics;

/// Platform limit on nickname length, in UTF-16 code units.
pub const NICKNAME_LIMIT: usize = 32;

/// Bump when `BUILTIN_GLYPHS` changes.
pub const GLYPH_REGISTRY_VERSION: u32 = 1;

/// Glyphs the backend hands out for factions, races and specializations.
const BUILTIN_GLYPHS: &[&str] = &[
    "⚡", "🔥", "❄️", "🌊", "🌿", "🌑", "☀️", "🌙", "⭐", "🛡️", "⚔️", "🏹", "🗡️", "🔮", "🐉",
    "🧝", "🧙", "🧛", "🧟", "🐺", "🦅", "🤖", "👑", "💀", "🪓", "🩸",
];

const VARIATION_SELECTOR: char = '\u{FE0F}';

/// One backend trait: a name and the glyph shown in nicknames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Trait {
    #[serde(alias = "name")]
    pub display_name: String,
    #[serde(alias = "emoji")]
    pub glyph: String,
}

/// Backend snapshot of the facts that shape a user's nickname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TraitSet {
    #[serde(default)]
    pub faction: Option<Trait>,
    #[serde(default)]
    pub race: Option<Trait>,
    #[serde(default)]
    pub specialization: Option<Trait>,
    #[serde(default)]
    pub custom_nickname: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl TraitSet {
    /// Glyphs of the set traits, in faction, race, specialization order.
    pub fn glyphs(&self) -> impl Iterator<Item = &str> {
        [&self.faction, &self.race, &self.specialization]
            .into_iter()
            .flatten()
            .map(|t| t.glyph.trim())
            .filter(|g| !g.is_empty())
    }
}

/// Known nickname glyphs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphRegistry {
    version: u32,
    /// Longest first so multi-codepoint glyphs win over their prefixes.
    glyphs: Vec<String>,
}

impl GlyphRegistry {
    pub fn builtin() -> Self {
        Self::with_glyphs(GLYPH_REGISTRY_VERSION, BUILTIN_GLYPHS.iter().copied())
    }

    pub fn with_glyphs<'a>(version: u32, glyphs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut registry = Self {
            version,
            glyphs: Vec::new(),
        };
        for glyph in glyphs {
            registry.insert(glyph);
        }
        registry
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn contains(&self, glyph: &str) -> bool {
        self.glyphs.iter().any(|g| g == glyph)
    }

    /// Register a glyph, plus its bare form when it ends in a variation selector.
    fn insert(&mut self, glyph: &str) {
        let glyph = glyph.trim();
        if glyph.is_empty() {
            return;
        }
        let bare = glyph.trim_end_matches(VARIATION_SELECTOR);
        for g in [glyph, bare] {
            if !g.is_empty() && !self.contains(g) {
                self.glyphs.push(g.to_string());
            }
        }
        self.glyphs.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Copy of this registry that also knows the glyphs of `traits`.
    pub fn extended_with(&self, traits: &TraitSet) -> Self {
        let mut registry = self.clone();
        for glyph in traits.glyphs() {
            registry.insert(glyph);
        }
        registry
    }

    fn strip_one_glyph<'a>(&self, s: &'a str) -> Option<&'a str> {
        self.glyphs.iter().find_map(|g| s.strip_prefix(g.as_str()))
    }

    /// Remove synthesized prefixes: runs of known glyphs followed by one space.
    ///
    /// Repeats until no such prefix is left, so names that accumulated several
    /// prefixes collapse. Text starting with a glyph but no following space is
    /// kept as the user wrote it.
    pub fn strip_leading_glyphs<'a>(&self, name: &'a str) -> &'a str {
        let mut rest = name;
        loop {
            let mut cursor = rest;
            let mut matched = false;
            while let Some(after) = self.strip_one_glyph(cursor) {
                cursor = after;
                matched = true;
            }
            match cursor.strip_prefix(' ') {
                Some(after) if matched => rest = after,
                _ => return rest,
            }
        }
    }
}

impl Default for GlyphRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Longest prefix of `s` that fits in `max_units` UTF-16 code units.
fn truncate_units(s: &str, max_units: usize) -> &str {
    let mut used = 0;
    for (idx, ch) in s.char_indices() {
        used += ch.len_utf16();
        if used > max_units {
            return &s[..idx];
        }
    }
    s
}

fn non_blank(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Derive the nickname a user should carry.
pub fn compute_target_name(
    traits: &TraitSet,
    registry: &GlyphRegistry,
    currently_observed_name: &str,
) -> String {
    let registry = registry.extended_with(traits);
    let prefix: String = traits.glyphs().collect();

    let base_raw = non_blank(&traits.custom_nickname)
        .or_else(|| non_blank(&traits.username))
        .unwrap_or(currently_observed_name);
    let base = registry.strip_leading_glyphs(base_raw.trim()).trim();

    if prefix.is_empty() {
        return truncate_units(base, NICKNAME_LIMIT).trim_end().to_string();
    }
    if base.is_empty() {
        return truncate_units(&prefix, NICKNAME_LIMIT).to_string();
    }

    let room = NICKNAME_LIMIT.saturating_sub(utf16_len(&prefix) + 1);
    let name = truncate_units(base, room).trim_end();
    if name.is_empty() {
        return truncate_units(&prefix, NICKNAME_LIMIT).to_string();
    }
    format!("{prefix} {name}")
}

/// A rename is only issued when the names differ.
pub fn should_update(current: &str, target: &str) -> bool {
    current != target
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Renamed(String),
    /// The backend has no trait record for this user.
    NoTraits,
    Failed,
}

/// Keeps members' nicknames in line with their backend traits.
pub struct NicknameReconciler {
    backend: Arc<dyn Backend>,
    chat: Arc<dyn ChatBoundary>,
    registry: GlyphRegistry,
    /// Users already told that the bot cannot rename them.
    warned: Mutex<HashSet<UserId>>,
}

impl NicknameReconciler {
    pub fn new(backend: Arc<dyn Backend>, chat: Arc<dyn ChatBoundary>, registry: GlyphRegistry) -> Self {
        Self {
            backend,
            chat,
            registry,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &GlyphRegistry {
        &self.registry
    }

    /// Fetch the user's traits and rename them if their nickname is out of date.
    /// A permission failure is reported in `notify_channel` once per user.
    pub async fn reconcile(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        username: &str,
        observed_name: &str,
        notify_channel: Option<ChannelId>,
    ) -> ReconcileOutcome {
        let traits = match self.backend.fetch_traits(user_id, username).await {
            Ok(Some(t)) => t,
            Ok(None) => return ReconcileOutcome::NoTraits,
            Err(e) => {
                tracing::warn!("Trait lookup for {user_id} failed: {e}");
                return ReconcileOutcome::Failed;
            }
        };

        let target = compute_target_name(&traits, &self.registry, observed_name);
        if !should_update(observed_name, &target) {
            return ReconcileOutcome::Unchanged;
        }

        match self.chat.rename_member(guild_id, user_id, &target).await {
            Ok(()) => {
                tracing::info!("Renamed {user_id}: '{observed_name}' -> '{target}'");
                self.warned.lock().unwrap().remove(&user_id);
                metrics::NICKNAME_RENAMES_TOTAL
                    .with_label_values(&["renamed"])
                    .inc();
                ReconcileOutcome::Renamed(target)
            }
            Err(ChatError::PermissionDenied(e)) => {
                tracing::warn!("Cannot rename {user_id} in guild {guild_id}: {e}");
                metrics::NICKNAME_RENAMES_TOTAL
                    .with_label_values(&["permission_denied"])
                    .inc();
                let first = self.warned.lock().unwrap().insert(user_id);
                if let (true, Some(channel)) = (first, notify_channel) {
                    let text = format!(
                        "⚠️ I can't update the nickname of {observed_name}: my role needs to be above theirs."
                    );
                    if let Err(e) = self.chat.send_text(channel, &text).await {
                        tracing::debug!("Rename warning not delivered: {e}");
                    }
                }
                ReconcileOutcome::Failed
            }
            Err(e) => {
                tracing::error!("Rename of {user_id} failed: {e}");
                metrics::NICKNAME_RENAMES_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                ReconcileOutcome::Failed
            }
        }
    }
}
