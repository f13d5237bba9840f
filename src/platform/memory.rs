use super::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A message held by [`InMemoryPlatform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub id: String,
    pub channel_id: String,
    pub content: String,
}

/// One recorded call against [`InMemoryPlatform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformCall {
    pub method: &'static str,
    pub tenant_id: String,
    /// Whether the call changed remote state.
    pub mutated: bool,
}

#[derive(Debug, Default)]
struct Guild {
    owner_id: String,
    everyone_id: String,
    roles: BTreeMap<String, RoleSnapshot>,
    channels: BTreeMap<String, ChannelSnapshot>,
    overwrites: HashMap<String, Vec<Overwrite>>,
    messages: BTreeMap<String, MessageSnapshot>,
}

#[derive(Debug, Default)]
struct State {
    guilds: HashMap<String, Guild>,
    calls: Vec<PlatformCall>,
    failures: HashMap<&'static str, VecDeque<PlatformError>>,
    reasons: Vec<String>,
}

/// Process-local platform with adoption semantics, a call log and scripted failures.
///
/// Ids are decimal strings from one increasing counter, so later objects sort after earlier ones.
#[derive(Debug)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
    next_id: AtomicU64,
    latency: Duration,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()), next_id: AtomicU64::new(1000), latency: Duration::ZERO }
    }

    /// Delay every call by `latency` (on the tokio timer).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Register a tenant. Returns its everyone-role id.
    pub fn add_guild(&self, tenant_id: &str, owner_id: &str) -> String {
        let everyone_id = self.fresh_id();
        if let Ok(mut state) = self.state.lock() {
            state.guilds.insert(
                tenant_id.to_string(),
                Guild {
                    owner_id: owner_id.to_string(),
                    everyone_id: everyone_id.clone(),
                    ..Guild::default()
                },
            );
        }
        everyone_id
    }

    /// Create a role out of band (as a human admin would).
    pub fn seed_role(&self, tenant_id: &str, name: &str) -> Option<String> {
        let id = self.fresh_id();
        let mut state = self.state.lock().ok()?;
        let guild = state.guilds.get_mut(tenant_id)?;
        guild.roles.insert(
            id.clone(),
            RoleSnapshot { id: id.clone(), name: name.to_string(), color: 0, hoist: false, mentionable: false },
        );
        Some(id)
    }

    /// Create a category or text channel out of band.
    pub fn seed_channel(&self, tenant_id: &str, name: &str, channel_type: ChannelType) -> Option<String> {
        let id = self.fresh_id();
        let mut state = self.state.lock().ok()?;
        let guild = state.guilds.get_mut(tenant_id)?;
        guild.channels.insert(
            id.clone(),
            ChannelSnapshot { id: id.clone(), name: name.to_string(), channel_type, parent_id: None, topic: None },
        );
        Some(id)
    }

    /// Post a message out of band.
    pub fn seed_message(&self, tenant_id: &str, channel_id: &str, content: &str) -> Option<String> {
        let id = self.fresh_id();
        let mut state = self.state.lock().ok()?;
        let guild = state.guilds.get_mut(tenant_id)?;
        guild.messages.insert(
            id.clone(),
            MessageSnapshot { id: id.clone(), channel_id: channel_id.to_string(), content: content.to_string() },
        );
        Some(id)
    }

    /// Remove a role out of band. Returns whether it existed.
    pub fn delete_role(&self, tenant_id: &str, role_id: &str) -> bool {
        self.with_guild(tenant_id, |g| g.roles.remove(role_id).is_some()).unwrap_or(false)
    }

    /// Remove a channel or category out of band. Returns whether it existed.
    pub fn delete_channel(&self, tenant_id: &str, channel_id: &str) -> bool {
        self.with_guild(tenant_id, |g| g.channels.remove(channel_id).is_some()).unwrap_or(false)
    }

    /// Fail the next `times` calls of `method` with `error`.
    pub fn fail_next(&self, method: &'static str, error: PlatformError, times: usize) {
        if let Ok(mut state) = self.state.lock() {
            let queue = state.failures.entry(method).or_default();
            queue.extend(std::iter::repeat(error).take(times));
        }
    }

    pub fn roles(&self, tenant_id: &str) -> Vec<RoleSnapshot> {
        self.with_guild(tenant_id, |g| g.roles.values().cloned().collect()).unwrap_or_default()
    }

    pub fn channels(&self, tenant_id: &str) -> Vec<ChannelSnapshot> {
        self.with_guild(tenant_id, |g| g.channels.values().cloned().collect()).unwrap_or_default()
    }

    pub fn overwrites(&self, tenant_id: &str, channel_id: &str) -> Option<Vec<Overwrite>> {
        self.with_guild(tenant_id, |g| g.overwrites.get(channel_id).cloned()).flatten()
    }

    pub fn messages(&self, tenant_id: &str) -> Vec<MessageSnapshot> {
        self.with_guild(tenant_id, |g| g.messages.values().cloned().collect()).unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method == method).count()
    }

    /// Calls that changed remote state.
    pub fn mutation_count(&self) -> usize {
        self.calls().iter().filter(|c| c.mutated).count()
    }

    /// Audit reasons attached to mutating calls, in order.
    pub fn reasons(&self) -> Vec<String> {
        self.state.lock().map(|s| s.reasons.clone()).unwrap_or_default()
    }

    fn fresh_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn with_guild<R>(&self, tenant_id: &str, f: impl FnOnce(&mut Guild) -> R) -> Option<R> {
        let mut state = self.state.lock().ok()?;
        state.guilds.get_mut(tenant_id).map(f)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, PlatformError> {
        self.state.lock().map_err(|_| PlatformError::Transport("platform state poisoned".into()))
    }

    /// Common prologue: latency, call log, scripted failure.
    async fn enter(&self, method: &'static str, tenant_id: &str) -> Result<(), PlatformError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.lock()?;
        state.calls.push(PlatformCall { method, tenant_id: tenant_id.to_string(), mutated: false });
        if let Some(err) = state.failures.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if !state.guilds.contains_key(tenant_id) {
            return Err(PlatformError::http(404, "Unknown Guild"));
        }
        Ok(())
    }
}

fn guild_mut<'a>(state: &'a mut State, tenant_id: &str) -> Result<&'a mut Guild, PlatformError> {
    state.guilds.get_mut(tenant_id).ok_or_else(|| PlatformError::http(404, "Unknown Guild"))
}

fn record_mutation(state: &mut State, ctx: &RequestContext) {
    if let Some(last) = state.calls.last_mut() {
        last.mutated = true;
    }
    state.reasons.push(ctx.reason.clone());
}

fn conflict(message: String) -> PlatformError {
    PlatformError::Domain(DeployError::conflict(message))
}

/// Single channel of `channel_type` named `name`, or CONFLICT when ambiguous.
fn adopt_channel(guild: &Guild, channel_type: ChannelType, name: &str) -> Result<Option<String>, PlatformError> {
    let matches: Vec<&ChannelSnapshot> =
        guild.channels.values().filter(|c| c.channel_type == channel_type && c.name == name).collect();
    match matches.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(one.id.clone())),
        _ => Err(conflict(format!("multiple channels match managed name: {}", name))),
    }
}

/// Resolve `existing_id`, falling back to adoption by name; CONFLICT if the object has the wrong type.
fn locate_channel(
    guild: &Guild,
    existing_id: Option<&str>,
    channel_type: ChannelType,
    name: &str,
) -> Result<Option<String>, PlatformError> {
    let found = match existing_id.filter(|id| guild.channels.contains_key(*id)) {
        Some(id) => Some(id.to_string()),
        None => adopt_channel(guild, channel_type, name)?,
    };
    if let Some(id) = &found {
        let actual = guild.channels.get(id).map(|c| c.channel_type);
        if actual != Some(channel_type) {
            return Err(conflict(format!(
                "adopted channel is not a {}: {}",
                channel_type.as_str(),
                id
            )));
        }
    }
    Ok(found)
}

#[async_trait]
impl Platform for InMemoryPlatform {
    async fn owner_id(&self, tenant_id: &str) -> Result<String, PlatformError> {
        self.enter("owner_id", tenant_id).await?;
        let mut state = self.lock()?;
        Ok(guild_mut(&mut state, tenant_id)?.owner_id.clone())
    }

    async fn everyone_id(&self, tenant_id: &str) -> Result<String, PlatformError> {
        self.enter("everyone_id", tenant_id).await?;
        let mut state = self.lock()?;
        Ok(guild_mut(&mut state, tenant_id)?.everyone_id.clone())
    }

    async fn role_by_id(&self, tenant_id: &str, role_id: &str) -> Result<Option<RoleSnapshot>, PlatformError> {
        self.enter("role_by_id", tenant_id).await?;
        let mut state = self.lock()?;
        Ok(guild_mut(&mut state, tenant_id)?.roles.get(role_id).cloned())
    }

    async fn ensure_role(
        &self,
        tenant_id: &str,
        request: &RoleRequest,
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError> {
        self.enter("ensure_role", tenant_id).await?;
        let fresh = self.fresh_id();
        let mut state = self.lock()?;
        let guild = guild_mut(&mut state, tenant_id)?;

        let found = match request.existing_id.as_deref().filter(|id| guild.roles.contains_key(*id)) {
            Some(id) => Some(id.to_string()),
            None => {
                let matches: Vec<&RoleSnapshot> =
                    guild.roles.values().filter(|r| r.name == request.managed_name).collect();
                match matches.as_slice() {
                    [] => None,
                    [one] => Some(one.id.clone()),
                    _ => {
                        return Err(conflict(format!(
                            "multiple roles match managed name: {}",
                            request.managed_name
                        )))
                    }
                }
            }
        };

        let (id, changed) = match found.and_then(|id| guild.roles.get_mut(&id)) {
            None => {
                guild.roles.insert(
                    fresh.clone(),
                    RoleSnapshot {
                        id: fresh.clone(),
                        name: request.managed_name.clone(),
                        color: request.color.unwrap_or(0),
                        hoist: request.hoist.unwrap_or(false),
                        mentionable: request.mentionable.unwrap_or(false),
                    },
                );
                (fresh, true)
            }
            Some(role) => {
                let mut changed = false;
                if role.name != request.managed_name {
                    role.name = request.managed_name.clone();
                    changed = true;
                }
                if let Some(color) = request.color.filter(|c| *c != role.color) {
                    role.color = color;
                    changed = true;
                }
                if let Some(hoist) = request.hoist.filter(|h| *h != role.hoist) {
                    role.hoist = hoist;
                    changed = true;
                }
                if let Some(m) = request.mentionable.filter(|m| *m != role.mentionable) {
                    role.mentionable = m;
                    changed = true;
                }
                (role.id.clone(), changed)
            }
        };

        if changed {
            record_mutation(&mut state, ctx);
        }
        Ok(EnsureResult { id, changed })
    }

    async fn channel_by_id(
        &self,
        tenant_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelSnapshot>, PlatformError> {
        self.enter("channel_by_id", tenant_id).await?;
        let mut state = self.lock()?;
        Ok(guild_mut(&mut state, tenant_id)?.channels.get(channel_id).cloned())
    }

    async fn ensure_category(
        &self,
        tenant_id: &str,
        request: &CategoryRequest,
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError> {
        self.enter("ensure_category", tenant_id).await?;
        let fresh = self.fresh_id();
        let mut state = self.lock()?;
        let guild = guild_mut(&mut state, tenant_id)?;

        let found = locate_channel(
            guild,
            request.existing_id.as_deref(),
            ChannelType::Category,
            &request.managed_name,
        )?;
        let (id, changed) = match found.and_then(|id| guild.channels.get_mut(&id)) {
            None => {
                guild.channels.insert(
                    fresh.clone(),
                    ChannelSnapshot {
                        id: fresh.clone(),
                        name: request.managed_name.clone(),
                        channel_type: ChannelType::Category,
                        parent_id: None,
                        topic: None,
                    },
                );
                (fresh, true)
            }
            Some(cat) if cat.name == request.managed_name => (cat.id.clone(), false),
            Some(cat) => {
                cat.name = request.managed_name.clone();
                (cat.id.clone(), true)
            }
        };

        if changed {
            record_mutation(&mut state, ctx);
        }
        Ok(EnsureResult { id, changed })
    }

    async fn ensure_text_channel(
        &self,
        tenant_id: &str,
        request: &TextChannelRequest,
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError> {
        self.enter("ensure_text_channel", tenant_id).await?;
        let fresh = self.fresh_id();
        let mut state = self.lock()?;
        let guild = guild_mut(&mut state, tenant_id)?;

        if let Some(parent) = &request.parent_id {
            if !guild.channels.contains_key(parent) {
                return Err(PlatformError::http(404, format!("Unknown Channel {}", parent)));
            }
        }

        let found =
            locate_channel(guild, request.existing_id.as_deref(), ChannelType::Text, &request.managed_name)?;
        let (id, changed) = match found.and_then(|id| guild.channels.get_mut(&id)) {
            None => {
                guild.channels.insert(
                    fresh.clone(),
                    ChannelSnapshot {
                        id: fresh.clone(),
                        name: request.managed_name.clone(),
                        channel_type: ChannelType::Text,
                        parent_id: request.parent_id.clone(),
                        topic: request.topic.clone(),
                    },
                );
                (fresh, true)
            }
            Some(ch) => {
                let mut changed = false;
                if ch.name != request.managed_name {
                    ch.name = request.managed_name.clone();
                    changed = true;
                }
                if ch.topic != request.topic {
                    ch.topic = request.topic.clone();
                    changed = true;
                }
                if request.parent_id.is_some() && ch.parent_id != request.parent_id {
                    ch.parent_id = request.parent_id.clone();
                    changed = true;
                }
                (ch.id.clone(), changed)
            }
        };

        if changed {
            record_mutation(&mut state, ctx);
        }
        Ok(EnsureResult { id, changed })
    }

    async fn replace_overwrites(
        &self,
        tenant_id: &str,
        channel_id: &str,
        overwrites: &[Overwrite],
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError> {
        self.enter("replace_overwrites", tenant_id).await?;
        let mut state = self.lock()?;
        let guild = guild_mut(&mut state, tenant_id)?;
        if !guild.channels.contains_key(channel_id) {
            return Err(PlatformError::http(404, format!("Unknown Channel {}", channel_id)));
        }
        guild.overwrites.insert(channel_id.to_string(), overwrites.to_vec());
        record_mutation(&mut state, ctx);
        Ok(EnsureResult { id: channel_id.to_string(), changed: true })
    }

    async fn ensure_message_by_marker(
        &self,
        tenant_id: &str,
        request: &MessageRequest,
        ctx: &RequestContext,
    ) -> Result<EnsureResult, PlatformError> {
        self.enter("ensure_message_by_marker", tenant_id).await?;
        let fresh = self.fresh_id();
        let mut state = self.lock()?;
        let guild = guild_mut(&mut state, tenant_id)?;
        if !guild.channels.contains_key(&request.channel_id) {
            return Err(PlatformError::http(404, format!("Unknown Channel {}", request.channel_id)));
        }

        let in_channel = |m: &&MessageSnapshot| m.channel_id == request.channel_id;
        let found = match request
            .existing_id
            .as_deref()
            .and_then(|id| guild.messages.get(id))
            .filter(|m| in_channel(m))
        {
            Some(m) => Some(m.id.clone()),
            None => {
                let matches: Vec<&MessageSnapshot> = guild
                    .messages
                    .values()
                    .filter(|m| in_channel(m) && m.content.contains(&request.marker))
                    .collect();
                match matches.as_slice() {
                    [] => None,
                    [one] => Some(one.id.clone()),
                    _ => {
                        return Err(conflict(format!(
                            "multiple messages carry marker {}",
                            request.marker
                        )))
                    }
                }
            }
        };

        let (id, changed) = match found.and_then(|id| guild.messages.get_mut(&id)) {
            None => {
                guild.messages.insert(
                    fresh.clone(),
                    MessageSnapshot {
                        id: fresh.clone(),
                        channel_id: request.channel_id.clone(),
                        content: request.content.clone(),
                    },
                );
                (fresh, true)
            }
            Some(m) if m.content == request.content => (m.id.clone(), false),
            Some(m) => {
                m.content = request.content.clone();
                (m.id.clone(), true)
            }
        };

        if changed {
            record_mutation(&mut state, ctx);
        }
        Ok(EnsureResult { id, changed })
    }
}
