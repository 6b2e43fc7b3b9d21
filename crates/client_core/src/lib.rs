use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use shared::{
    domain::{
        ChannelId, ChannelSummary, Identity, Message, MessageId, MessageKind, MessageStatus,
        OrderKey, ParentSnapshot, PubKey,
    },
    error::{ErrorCode, OperationError},
    protocol::ChannelEvent,
};
use storage::{MessageRow, MessageStore};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, StreamExt};
use tracing::{debug, info, warn};

pub mod blocked;
pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod manager;
pub mod mutes;
pub mod pagination;
pub mod pins;
pub mod reactions;
pub mod timeline;

pub use blocked::BlockedEvents;
pub use bus::{BusError, EventBus, Subscription};
pub use codec::{Cipher, CodecError, MessageCodec, PassthroughCipher};
pub use config::EngineSettings;
pub use error::EngineError;
pub use identity::{CodenameResolver, IdentityCache, IdentityResolver};
pub use manager::{ChannelManager, MissingChannelManager};
pub use mutes::MuteTracker;
pub use pagination::{Direction, EdgeStatus, Pagination, Window};
pub use pins::PinTracker;
pub use reactions::{EmojiReactions, ReactionAggregator, Reactor};
pub use timeline::{Timeline, Timelines, Upsert};

const LOCAL_ID_PREFIX: &str = "local-";
const FALLBACK_LOCAL_PUBKEY: &str = "local";

/// Derived-state changes announced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EngineNotice {
    TimelineChanged {
        channel_id: ChannelId,
    },
    MessagePinned {
        channel_id: ChannelId,
        channel_name: String,
        message_id: MessageId,
        body: String,
    },
    ReactionsChanged {
        channel_id: ChannelId,
        message_id: Option<MessageId>,
    },
    MutedUsersChanged {
        channel_id: ChannelId,
    },
    /// Someone else replied to a message authored by the local identity.
    /// `sender` is the replier's nickname, or codename without one.
    ReplyReceived {
        channel_id: ChannelId,
        message_id: MessageId,
        parent_id: MessageId,
        sender: String,
        body: String,
    },
    UnreadChanged {
        channel_id: ChannelId,
        unread: usize,
    },
    ChannelsChanged,
    OperationFailed(OperationError),
}

/// Where an ingested row came from. Only live rows count as unread, raise
/// reply notices or move the pin tracker; history loads are baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Live,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { rows: usize },
    Exhausted,
    /// A fetch for the same edge is already running, or the channel's
    /// first page was loaded before.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollOutcome {
    pub window: Window,
    pub fetched: Option<LoadOutcome>,
}

pub struct ReconciliationEngine {
    store: Arc<dyn MessageStore>,
    codec: MessageCodec,
    manager: Arc<dyn ChannelManager>,
    bus: EventBus<ChannelEvent>,
    notices: EventBus<EngineNotice>,
    settings: EngineSettings,
    inner: Mutex<EngineState>,
    inbox: Mutex<Option<Subscription<ChannelEvent>>>,
    shutdown: watch::Sender<bool>,
}

struct EngineState {
    channels: BTreeMap<ChannelId, ChannelSummary>,
    active_channel: Option<ChannelId>,
    own_pubkey: Option<PubKey>,
    own_codeset: u8,
    identities: IdentityCache,
    codesets: HashMap<PubKey, u8>,
    timelines: Timelines,
    blocked: BlockedEvents,
    /// Reply parents fetched by id that sit outside the loaded pages.
    parent_cache: HashMap<(ChannelId, MessageId), ParentSnapshot>,
    reactions: ReactionAggregator,
    pins: PinTracker,
    mutes: MuteTracker,
    pagination: Pagination,
    nicknames: HashMap<ChannelId, String>,
    unread: HashMap<ChannelId, usize>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn MessageStore>, settings: EngineSettings) -> Arc<Self> {
        let bus = EventBus::new(settings.bus_capacity);
        Self::new_with_dependencies(
            store,
            Arc::new(PassthroughCipher),
            Arc::new(CodenameResolver),
            Arc::new(MissingChannelManager),
            bus,
            settings,
        )
    }

    /// Builds an engine for one session. The bus subscription is taken here,
    /// before any load can start, so no event published afterwards is missed.
    pub fn new_with_dependencies(
        store: Arc<dyn MessageStore>,
        cipher: Arc<dyn Cipher>,
        identity_resolver: Arc<dyn IdentityResolver>,
        manager: Arc<dyn ChannelManager>,
        bus: EventBus<ChannelEvent>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let inbox = bus.subscribe();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            store,
            codec: MessageCodec::new(cipher),
            manager,
            notices: EventBus::new(settings.bus_capacity),
            inner: Mutex::new(EngineState {
                channels: BTreeMap::new(),
                active_channel: None,
                own_pubkey: settings.own_pubkey.clone(),
                own_codeset: settings.own_codeset,
                identities: IdentityCache::new(identity_resolver),
                codesets: HashMap::new(),
                timelines: Timelines::new(),
                blocked: BlockedEvents::new(),
                parent_cache: HashMap::new(),
                reactions: ReactionAggregator::new(),
                pins: PinTracker::new(),
                mutes: MuteTracker::new(),
                pagination: Pagination::new(settings.page_size, settings.window_size),
                nicknames: HashMap::new(),
                unread: HashMap::new(),
            }),
            inbox: Mutex::new(Some(inbox)),
            shutdown,
            bus,
            settings,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Handle for the external layer to publish row change events.
    pub fn bus(&self) -> EventBus<ChannelEvent> {
        self.bus.clone()
    }

    pub fn subscribe_notices(&self) -> Subscription<EngineNotice> {
        self.notices.subscribe()
    }

    /// Processes bus events one at a time until [`Self::shutdown`] is called
    /// or the bus closes. Each event is handled to completion before the
    /// next one is taken.
    pub async fn run(&self) -> Result<(), EngineError> {
        let inbox = self
            .inbox
            .lock()
            .await
            .take()
            .ok_or(EngineError::NotRunnable)?;
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(EngineError::NotRunnable);
        }

        let mut events = inbox.into_stream();
        info!("engine: event loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        if let Err(err) = self.handle_event(event).await {
                            warn!("engine: event handling failed: {err}");
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "engine: event loop lagged; events dropped");
                    }
                    None => break,
                },
            }
        }
        info!("engine: event loop stopped");
        Ok(())
    }

    /// Typed dispatch for one inbound change event.
    pub async fn handle_event(&self, event: ChannelEvent) -> Result<(), EngineError> {
        debug!(?event, "engine: handling event");
        match event {
            ChannelEvent::MessageReceived {
                row_id,
                channel_id,
                update,
            } => {
                let Some(row) = self
                    .store
                    .get_message_row(row_id)
                    .await
                    .map_err(EngineError::storage)?
                else {
                    warn!(
                        channel_id = %channel_id,
                        row_id = row_id.0,
                        update,
                        "engine: change event for a row that is not in storage"
                    );
                    return Ok(());
                };
                let notices = {
                    let mut state = self.inner.lock().await;
                    let mut notices = Vec::new();
                    state.ingest_row(&self.codec, row, IngestSource::Live, &mut notices);
                    notices
                };
                self.publish_all(notices);
            }
            ChannelEvent::MessageDeleted { message_id } => {
                let notices = {
                    let mut state = self.inner.lock().await;
                    let mut notices = Vec::new();
                    let channels: Vec<ChannelId> = state
                        .channels
                        .keys()
                        .cloned()
                        .chain(state.timelines.channel_ids().cloned())
                        .collect::<HashSet<_>>()
                        .into_iter()
                        .collect();
                    for channel_id in channels {
                        state.forget_message(&channel_id, &message_id, None, &mut notices);
                    }
                    notices
                };
                self.publish_all(notices);
            }
            ChannelEvent::UserMuted {
                channel_id,
                pubkey,
                unmute,
            } => {
                debug!(channel_id = %channel_id, pubkey = %pubkey, unmute, "engine: mute change");
                if let Err(err) = self.refresh_mutes_for(&channel_id).await {
                    warn!(channel_id = %channel_id, "engine: mute refresh failed: {err}");
                }
            }
            ChannelEvent::NicknameUpdated {
                channel_id,
                nickname,
            } => {
                let mut state = self.inner.lock().await;
                match nickname.filter(|nick| !nick.is_empty()) {
                    Some(nick) => state.nicknames.insert(channel_id, nick),
                    None => state.nicknames.remove(&channel_id),
                };
            }
            ChannelEvent::PinChanged {
                channel_id,
                message_id,
                pinned,
            } => {
                let notices = {
                    let mut state = self.inner.lock().await;
                    let mut notices = Vec::new();
                    state.apply_pin_flag(&channel_id, &message_id, pinned, &mut notices);
                    notices
                };
                self.publish_all(notices);
            }
            ChannelEvent::ChannelUpdated {
                channel_id,
                deleted,
            } => {
                if deleted {
                    let notices = {
                        let mut state = self.inner.lock().await;
                        state.drop_channel(&channel_id)
                    };
                    self.publish_all(notices);
                } else {
                    self.reload_channel_summary(&channel_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Cold start: every channel's newest page, missing reply parents,
    /// reactions and pin baselines. Selects the first channel when none is
    /// active yet.
    pub async fn load_initial(&self) -> Result<(), EngineError> {
        let channels = self
            .store
            .list_channels()
            .await
            .map_err(EngineError::storage)?;
        {
            let mut state = self.inner.lock().await;
            for channel in &channels {
                state
                    .channels
                    .insert(channel.channel_id.clone(), channel.clone());
            }
        }
        self.notices.publish(EngineNotice::ChannelsChanged);

        let loads = join_all(
            channels
                .iter()
                .map(|channel| self.load_channel(&channel.channel_id)),
        )
        .await;
        for result in loads {
            result?;
        }

        for channel in &channels {
            self.hydrate_parents(&channel.channel_id).await?;
            self.rebuild_reactions(&channel.channel_id).await?;
            self.seed_pins(&channel.channel_id).await?;
        }
        info!(channels = channels.len(), "engine: initial load complete");

        let first = {
            let state = self.inner.lock().await;
            match state.active_channel {
                Some(_) => None,
                None => state.channels.keys().next().cloned(),
            }
        };
        if let Some(channel_id) = first {
            self.select_channel(&channel_id).await?;
        }
        Ok(())
    }

    /// First page of a channel, unless it was loaded before.
    pub async fn load_channel(&self, channel_id: &ChannelId) -> Result<LoadOutcome, EngineError> {
        let loaded = self
            .inner
            .lock()
            .await
            .pagination
            .first_page_loaded(channel_id);
        if loaded {
            return Ok(LoadOutcome::Skipped);
        }
        self.load_edge(channel_id, Direction::Older).await
    }

    /// Makes `channel_id` the active channel: window back to the tail,
    /// pagination back to `HasMore`, unread cleared, then mutes, pins and
    /// reactions refetched.
    pub async fn select_channel(&self, channel_id: &ChannelId) -> Result<(), EngineError> {
        let notices = {
            let mut state = self.inner.lock().await;
            if !state.channels.contains_key(channel_id) {
                return Err(EngineError::UnknownChannel(channel_id.clone()));
            }
            state.active_channel = Some(channel_id.clone());
            state.pagination.reset(channel_id);
            let mut notices = vec![EngineNotice::TimelineChanged {
                channel_id: channel_id.clone(),
            }];
            if state.unread.remove(channel_id).is_some_and(|count| count > 0) {
                notices.push(EngineNotice::UnreadChanged {
                    channel_id: channel_id.clone(),
                    unread: 0,
                });
            }
            notices
        };
        self.publish_all(notices);
        info!(channel_id = %channel_id, "engine: channel selected");

        self.load_channel(channel_id).await?;
        if let Err(err) = self.refresh_mutes_for(channel_id).await {
            warn!(channel_id = %channel_id, "engine: mute refresh failed: {err}");
        }
        self.refresh_pins(channel_id).await?;
        self.rebuild_reactions(channel_id).await?;
        Ok(())
    }

    /// Fetches the next older page for `channel_id`.
    pub async fn load_more(&self, channel_id: &ChannelId) -> Result<LoadOutcome, EngineError> {
        self.load_edge(channel_id, Direction::Older).await
    }

    /// Moves the visible window and fetches from storage when it comes
    /// within one window of the loaded edge.
    pub async fn scroll(
        &self,
        channel_id: &ChannelId,
        direction: Direction,
        rows: usize,
    ) -> Result<ScrollOutcome, EngineError> {
        let near_edge = {
            let mut state = self.inner.lock().await;
            let loaded = state.loaded_len(channel_id);
            state
                .pagination
                .scroll(channel_id, direction, rows, loaded);
            state.pagination.near_edge(channel_id, direction, loaded)
        };
        let fetched = if near_edge {
            Some(self.load_edge(channel_id, direction).await?)
        } else {
            None
        };
        Ok(ScrollOutcome {
            window: self.window(channel_id).await,
            fetched,
        })
    }

    /// One storage fetch for one edge. Storage failures propagate and leave
    /// the edge state untouched.
    pub async fn load_edge(
        &self,
        channel_id: &ChannelId,
        direction: Direction,
    ) -> Result<LoadOutcome, EngineError> {
        let (plan, newest) = {
            let mut state = self.inner.lock().await;
            let Some(plan) = state.pagination.begin_fetch(channel_id, direction) else {
                debug!(channel_id = %channel_id, ?direction, "engine: fetch suppressed");
                return Ok(match state.pagination.status(channel_id, direction) {
                    EdgeStatus::Exhausted => LoadOutcome::Exhausted,
                    EdgeStatus::HasMore => LoadOutcome::Skipped,
                });
            };
            let newest = state
                .timelines
                .channel(channel_id)
                .and_then(|timeline| timeline.last_key().cloned());
            (plan, newest)
        };

        let fetched = match direction {
            Direction::Older => {
                self.store
                    .list_channel_page(channel_id, plan.offset, plan.limit)
                    .await
            }
            Direction::Newer => {
                let after = newest.unwrap_or_else(|| OrderKey {
                    timestamp_ms: i64::MIN,
                    round: 0,
                    id: MessageId::new(""),
                });
                self.store
                    .list_channel_since(channel_id, &after, plan.limit)
                    .await
            }
        };

        let mut rows = match fetched {
            Ok(rows) => rows,
            Err(err) => {
                self.inner.lock().await.pagination.abort_fetch(&plan);
                warn!(channel_id = %channel_id, ?direction, "engine: page fetch failed: {err:#}");
                return Err(EngineError::storage(err));
            }
        };
        if direction == Direction::Older {
            rows.reverse();
        }
        let count = rows.len();

        let (status, notices) = {
            let mut state = self.inner.lock().await;
            let mut notices = Vec::new();
            let mut inserted = 0;
            for row in rows {
                if state.ingest_row(&self.codec, row, IngestSource::History, &mut notices) {
                    inserted += 1;
                }
            }
            if direction == Direction::Older {
                state.pagination.shift_anchor(channel_id, inserted);
            }
            (state.pagination.finish_fetch(&plan, count), notices)
        };
        self.publish_all(notices);
        debug!(channel_id = %channel_id, ?direction, rows = count, ?status, "engine: page loaded");

        if count == 0 {
            return Ok(LoadOutcome::Exhausted);
        }
        self.hydrate_parents(channel_id).await?;
        Ok(LoadOutcome::Loaded { rows: count })
    }

    /// Fetches blocked replies' parents by id so replies to messages outside
    /// the loaded pages can still be shown. Bounded by
    /// `parent_hydration_rounds` hops.
    async fn hydrate_parents(&self, channel_id: &ChannelId) -> Result<(), EngineError> {
        for _ in 0..self.settings.parent_hydration_rounds {
            let waiting = {
                let state = self.inner.lock().await;
                state.blocked.waiting_parents(channel_id)
            };
            if waiting.is_empty() {
                return Ok(());
            }
            let rows = self
                .store
                .list_rows_by_message_ids(channel_id, &waiting)
                .await
                .map_err(EngineError::storage)?;
            if rows.is_empty() {
                return Ok(());
            }
            let notices = {
                let mut state = self.inner.lock().await;
                let mut notices = Vec::new();
                for row in rows {
                    state.ingest_parent(&self.codec, row, &mut notices);
                }
                notices
            };
            self.publish_all(notices);
        }
        Ok(())
    }

    /// Recomputes a channel's reaction map from stored rows.
    pub async fn rebuild_reactions(&self, channel_id: &ChannelId) -> Result<(), EngineError> {
        let rows = self
            .store
            .list_reaction_rows(channel_id)
            .await
            .map_err(EngineError::storage)?;
        let mut state = self.inner.lock().await;
        let mut reactions = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(reaction) = state.decode(&self.codec, &row) {
                reactions.push(reaction);
            }
        }
        let (known, waiting): (Vec<Message>, Vec<Message>) =
            reactions.into_iter().partition(|reaction| {
                reaction
                    .parent_id
                    .as_ref()
                    .is_some_and(|target| state.parent_snapshot(channel_id, target).is_some())
            });
        state.reactions.rebuild(channel_id, &known);
        for reaction in waiting {
            state.blocked.hold(reaction);
        }
        drop(state);
        self.notices.publish(EngineNotice::ReactionsChanged {
            channel_id: channel_id.clone(),
            message_id: None,
        });
        Ok(())
    }

    /// Pinned-set refresh: announces pins that are new since the previous
    /// snapshot. Returns the announced ids.
    pub async fn refresh_pins(&self, channel_id: &ChannelId) -> Result<Vec<MessageId>, EngineError> {
        self.sync_pins(channel_id, false).await
    }

    async fn seed_pins(&self, channel_id: &ChannelId) -> Result<(), EngineError> {
        self.sync_pins(channel_id, true).await.map(|_| ())
    }

    async fn sync_pins(
        &self,
        channel_id: &ChannelId,
        baseline: bool,
    ) -> Result<Vec<MessageId>, EngineError> {
        let rows = self
            .store
            .list_pinned_rows(channel_id)
            .await
            .map_err(EngineError::storage)?;

        let notices = {
            let mut state = self.inner.lock().await;
            let mut bodies = HashMap::new();
            for row in &rows {
                if let Some(message) = state.decode(&self.codec, row) {
                    bodies.insert(message.id, message.body);
                }
            }
            let pinned: Vec<MessageId> = rows.iter().map(|row| row.message_id.clone()).collect();
            for id in &pinned {
                if let Some(message) = state.timelines.channel_mut(channel_id).get_mut(id) {
                    message.pinned = true;
                }
            }
            if baseline {
                state.pins.seed(channel_id, pinned);
                Vec::new()
            } else {
                let fresh = state.pins.observe(channel_id, pinned);
                let channel_name = state.channel_name(channel_id);
                fresh
                    .into_iter()
                    .map(|message_id| EngineNotice::MessagePinned {
                        channel_id: channel_id.clone(),
                        channel_name: channel_name.clone(),
                        body: bodies.remove(&message_id).unwrap_or_default(),
                        message_id,
                    })
                    .collect()
            }
        };
        let fresh = notices
            .iter()
            .filter_map(|notice| match notice {
                EngineNotice::MessagePinned { message_id, .. } => Some(message_id.clone()),
                _ => None,
            })
            .collect();
        self.publish_all(notices);
        Ok(fresh)
    }

    /// Periodic pin refresh for the active channel, compensating for pin
    /// changes that propagate without an event. Stops on shutdown.
    pub fn spawn_pin_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.settings.pin_refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let active = engine.inner.lock().await.active_channel.clone();
                if let Some(channel_id) = active {
                    if let Err(err) = engine.refresh_pins(&channel_id).await {
                        warn!(channel_id = %channel_id, "engine: periodic pin refresh failed: {err}");
                    }
                }
            }
        })
    }

    /// Refetches the active channel's muted set.
    pub async fn refresh_muted_users(&self) -> Result<(), EngineError> {
        let active = self.inner.lock().await.active_channel.clone();
        match active {
            Some(channel_id) => self.refresh_mutes_for(&channel_id).await,
            None => Err(EngineError::NoActiveChannel),
        }
    }

    async fn refresh_mutes_for(&self, channel_id: &ChannelId) -> Result<(), EngineError> {
        let muted = self
            .manager
            .muted_users(channel_id)
            .await
            .map_err(|err| operation_error("muted_users", err))?;
        let self_muted = self
            .manager
            .is_muted(channel_id)
            .await
            .map_err(|err| operation_error("is_muted", err))?;
        let codesets = self
            .store
            .list_pubkey_codesets(channel_id, &muted)
            .await
            .map_err(EngineError::storage)?;

        let changed = {
            let mut state = self.inner.lock().await;
            for (pubkey, codeset) in codesets {
                state.remember_codeset(&pubkey, codeset);
            }
            state.mutes.replace(channel_id, muted, self_muted)
        };
        if changed {
            self.notices.publish(EngineNotice::MutedUsersChanged {
                channel_id: channel_id.clone(),
            });
        }
        Ok(())
    }

    /// Sends a message, showing it immediately with status `Sending`. The
    /// entry is re-keyed to the network id once the send succeeds and is
    /// later replaced in place by the stored row.
    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        body: &str,
    ) -> Result<MessageId, EngineError> {
        self.send_optimistic("send_message", channel_id, body, None)
            .await
    }

    pub async fn send_reply(
        &self,
        channel_id: &ChannelId,
        parent_id: &MessageId,
        body: &str,
    ) -> Result<MessageId, EngineError> {
        self.send_optimistic("send_reply", channel_id, body, Some(parent_id))
            .await
    }

    async fn send_optimistic(
        &self,
        operation: &'static str,
        channel_id: &ChannelId,
        body: &str,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageId, EngineError> {
        let local_id = {
            let mut state = self.inner.lock().await;
            if state.mutes.self_muted(channel_id) {
                drop(state);
                return Err(self.reject(operation, ErrorCode::Validation, "muted in this channel"));
            }
            let replied_to = match parent_id {
                Some(parent_id) => match state.parent_snapshot(channel_id, parent_id) {
                    Some(snapshot) => Some(snapshot),
                    None => {
                        drop(state);
                        return Err(EngineError::UnknownMessage(parent_id.clone()));
                    }
                },
                None => None,
            };
            let message = state.local_message(channel_id, body, parent_id, replied_to);
            let local_id = message.id.clone();
            state.timelines.channel_mut(channel_id).upsert(message);
            local_id
        };
        self.notices.publish(EngineNotice::TimelineChanged {
            channel_id: channel_id.clone(),
        });

        let sent = match parent_id {
            Some(parent_id) => self.manager.send_reply(channel_id, parent_id, body).await,
            None => self.manager.send_message(channel_id, body).await,
        };

        let mut state = self.inner.lock().await;
        let optimistic = state.timelines.channel_mut(channel_id).remove(&local_id);
        match sent {
            Ok(message_id) => {
                let timeline = state.timelines.channel_mut(channel_id);
                if let Some(mut message) = optimistic {
                    if !timeline.contains(&message_id) {
                        message.id = message_id.clone();
                        message.status = MessageStatus::Sent;
                        timeline.upsert(message);
                    }
                }
                drop(state);
                self.notices.publish(EngineNotice::TimelineChanged {
                    channel_id: channel_id.clone(),
                });
                Ok(message_id)
            }
            Err(err) => {
                drop(state);
                self.notices.publish(EngineNotice::TimelineChanged {
                    channel_id: channel_id.clone(),
                });
                Err(self.facade_failure(operation, err))
            }
        }
    }

    pub async fn send_reaction(
        &self,
        channel_id: &ChannelId,
        target_id: &MessageId,
        emoji: &str,
    ) -> Result<MessageId, EngineError> {
        let emoji = emoji.trim();
        let len = emoji.chars().count();
        if len == 0 || len > codec::MAX_REACTION_LEN {
            return Err(self.reject("send_reaction", ErrorCode::Validation, "invalid reaction"));
        }
        self.manager
            .send_reaction(channel_id, target_id, emoji)
            .await
            .map_err(|err| self.facade_failure("send_reaction", err))
    }

    pub async fn pin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), EngineError> {
        self.manager
            .pin_message(channel_id, message_id, false)
            .await
            .map_err(|err| self.facade_failure("pin_message", err))
    }

    /// Unpins and waits until the matching `PinChanged { pinned: false }`
    /// event confirms propagation, bounded by `ack_timeout`.
    pub async fn unpin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), EngineError> {
        let mut ack = self.bus.subscribe();
        self.manager
            .pin_message(channel_id, message_id, true)
            .await
            .map_err(|err| self.facade_failure("unpin_message", err))?;

        ack.wait_for_timeout(
            |event| {
                matches!(
                    event,
                    ChannelEvent::PinChanged { channel_id: c, message_id: m, pinned: false }
                        if c == channel_id && m == message_id
                )
            },
            self.settings.ack_timeout,
        )
        .await
        .map_err(|err| {
            warn!(
                channel_id = %channel_id,
                message_id = %message_id,
                "engine: unpin acknowledgement not received: {err}"
            );
            let failure = OperationError::new("unpin_message", ErrorCode::Timeout, err.to_string());
            self.notices.publish(EngineNotice::OperationFailed(failure));
            EngineError::Bus(err)
        })?;
        Ok(())
    }

    pub async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), EngineError> {
        self.manager
            .delete_message(channel_id, message_id)
            .await
            .map_err(|err| self.facade_failure("delete_message", err))
    }

    pub async fn mute_user(
        &self,
        channel_id: &ChannelId,
        pubkey: &PubKey,
        unmute: bool,
    ) -> Result<(), EngineError> {
        self.manager
            .mute_user(channel_id, pubkey, unmute)
            .await
            .map_err(|err| self.facade_failure("mute_user", err))
    }

    pub async fn channels(&self) -> Vec<ChannelSummary> {
        self.inner.lock().await.channels.values().cloned().collect()
    }

    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.inner.lock().await.active_channel.clone()
    }

    /// Every loaded message of the channel in chronological order.
    pub async fn timeline(&self, channel_id: &ChannelId) -> Vec<Message> {
        let state = self.inner.lock().await;
        state
            .timelines
            .channel(channel_id)
            .map(|timeline| timeline.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages inside the current window.
    pub async fn visible_messages(&self, channel_id: &ChannelId) -> Vec<Message> {
        let state = self.inner.lock().await;
        let Some(timeline) = state.timelines.channel(channel_id) else {
            return Vec::new();
        };
        let window = state.pagination.window(channel_id, timeline.len());
        timeline.slice(window.start, window.end)
    }

    pub async fn window(&self, channel_id: &ChannelId) -> Window {
        let state = self.inner.lock().await;
        let loaded = state.loaded_len(channel_id);
        state.pagination.window(channel_id, loaded)
    }

    pub async fn pagination_status(&self, channel_id: &ChannelId, direction: Direction) -> EdgeStatus {
        self.inner
            .lock()
            .await
            .pagination
            .status(channel_id, direction)
    }

    pub async fn reactions(&self, channel_id: &ChannelId, message_id: &MessageId) -> EmojiReactions {
        self.inner
            .lock()
            .await
            .reactions
            .for_message(channel_id, message_id)
    }

    pub async fn channel_reactions(&self, channel_id: &ChannelId) -> HashMap<MessageId, EmojiReactions> {
        self.inner.lock().await.reactions.for_channel(channel_id)
    }

    pub async fn is_muted(&self, channel_id: &ChannelId, pubkey: &PubKey) -> bool {
        self.inner.lock().await.mutes.is_muted(channel_id, pubkey)
    }

    /// Whether the local identity may not post in `channel_id`.
    pub async fn self_muted(&self, channel_id: &ChannelId) -> bool {
        self.inner.lock().await.mutes.self_muted(channel_id)
    }

    /// Muted users with their display identity.
    pub async fn muted_users(&self, channel_id: &ChannelId) -> Vec<Identity> {
        let mut state = self.inner.lock().await;
        let muted = state.mutes.muted(channel_id);
        muted
            .into_iter()
            .map(|pubkey| {
                let codeset = state.codesets.get(&pubkey).copied().unwrap_or_default();
                state.identities.get(&pubkey, codeset)
            })
            .collect()
    }

    pub async fn pinned(&self, channel_id: &ChannelId) -> Vec<MessageId> {
        self.inner.lock().await.pins.pinned(channel_id)
    }

    pub async fn nickname(&self, channel_id: &ChannelId) -> Option<String> {
        self.inner.lock().await.nicknames.get(channel_id).cloned()
    }

    pub async fn unread(&self, channel_id: &ChannelId) -> usize {
        self.inner
            .lock()
            .await
            .unread
            .get(channel_id)
            .copied()
            .unwrap_or_default()
    }

    /// Replies and reactions still waiting for their parent.
    pub async fn blocked_len(&self) -> usize {
        self.inner.lock().await.blocked.len()
    }

    /// Ends the session: stops the event loop and pin refresher and drops
    /// all derived state.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut state = self.inner.lock().await;
        state.reset();
        info!("engine: session torn down");
    }

    async fn reload_channel_summary(&self, channel_id: &ChannelId) -> Result<(), EngineError> {
        let summary = self
            .store
            .get_channel(channel_id)
            .await
            .map_err(EngineError::storage)?;
        let Some(summary) = summary else {
            warn!(channel_id = %channel_id, "engine: channel update for unknown channel");
            return Ok(());
        };
        let is_new = {
            let mut state = self.inner.lock().await;
            state
                .channels
                .insert(channel_id.clone(), summary)
                .is_none()
        };
        self.notices.publish(EngineNotice::ChannelsChanged);
        if is_new {
            self.load_channel(channel_id).await?;
            self.rebuild_reactions(channel_id).await?;
            self.seed_pins(channel_id).await?;
        }
        Ok(())
    }

    fn publish_all(&self, notices: Vec<EngineNotice>) {
        let mut seen: Vec<EngineNotice> = Vec::with_capacity(notices.len());
        for notice in notices {
            if !seen.contains(&notice) {
                self.notices.publish(notice.clone());
                seen.push(notice);
            }
        }
    }

    fn facade_failure(&self, operation: &'static str, err: anyhow::Error) -> EngineError {
        warn!(operation, "engine: channel manager call failed: {err:#}");
        let failure = OperationError::new(operation, ErrorCode::Network, format!("{err:#}"));
        self.notices
            .publish(EngineNotice::OperationFailed(failure.clone()));
        EngineError::Operation(failure)
    }

    fn reject(&self, operation: &'static str, code: ErrorCode, message: &str) -> EngineError {
        let failure = OperationError::new(operation, code, message);
        self.notices
            .publish(EngineNotice::OperationFailed(failure.clone()));
        EngineError::Operation(failure)
    }
}

fn operation_error(operation: &'static str, err: anyhow::Error) -> EngineError {
    EngineError::Operation(OperationError::new(
        operation,
        ErrorCode::Network,
        format!("{err:#}"),
    ))
}

impl EngineState {
    fn loaded_len(&self, channel_id: &ChannelId) -> usize {
        self.timelines.channel(channel_id).map_or(0, Timeline::len)
    }

    fn channel_name(&self, channel_id: &ChannelId) -> String {
        self.channels
            .get(channel_id)
            .map(|channel| channel.name.clone())
            .unwrap_or_else(|| channel_id.to_string())
    }

    fn remember_codeset(&mut self, pubkey: &PubKey, codeset: u8) {
        let entry = self.codesets.entry(pubkey.clone()).or_insert(codeset);
        *entry = (*entry).max(codeset);
    }

    fn parent_snapshot(&self, channel_id: &ChannelId, id: &MessageId) -> Option<ParentSnapshot> {
        self.timelines
            .get(channel_id, id)
            .map(Message::snapshot)
            .or_else(|| {
                self.parent_cache
                    .get(&(channel_id.clone(), id.clone()))
                    .cloned()
            })
    }

    /// Decodes a row; failures are logged and the row is left out.
    fn decode(&mut self, codec: &MessageCodec, row: &MessageRow) -> Option<Message> {
        self.remember_codeset(&row.pubkey, row.codeset);
        let sender = self.identities.get(&row.pubkey, row.codeset);
        match codec.decode_row(row, sender) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(
                    channel_id = %row.channel_id,
                    message_id = %row.message_id,
                    "codec: dropping undecodable row: {err}"
                );
                None
            }
        }
    }

    /// Runs one stored row through decode, the blocked buffer and the
    /// derived structures. Returns true when a timeline entry was inserted.
    fn ingest_row(
        &mut self,
        codec: &MessageCodec,
        row: MessageRow,
        source: IngestSource,
        notices: &mut Vec<EngineNotice>,
    ) -> bool {
        if row.hidden {
            self.forget_message(
                &row.channel_id,
                &row.message_id,
                row.parent_message_id.as_ref(),
                notices,
            );
            return false;
        }
        let Some(message) = self.decode(codec, &row) else {
            return false;
        };

        let channel_id = message.channel_id.clone();
        let message_id = message.id.clone();
        let timelines = &self.timelines;
        let parent_cache = &self.parent_cache;
        let released = self.blocked.admit(message, |channel, id| {
            timelines.get(channel, id).map(Message::snapshot).or_else(|| {
                parent_cache.get(&(channel.clone(), id.clone())).cloned()
            })
        });
        if released.is_empty() {
            debug!(
                channel_id = %channel_id,
                message_id = %message_id,
                "engine: holding message until its parent arrives"
            );
            return false;
        }
        self.parent_cache
            .remove(&(channel_id.clone(), message_id.clone()));

        let mut inserted = false;
        for message in released {
            inserted |= self.place(message, source, notices);
        }
        inserted
    }

    /// Stores a reply parent fetched by id without adding it to the
    /// timeline, releasing whatever was waiting on it.
    fn ingest_parent(&mut self, codec: &MessageCodec, row: MessageRow, notices: &mut Vec<EngineNotice>) {
        let Some(parent) = self.decode(codec, &row) else {
            return;
        };
        let channel_id = parent.channel_id.clone();
        let snapshot = parent.snapshot();
        self.parent_cache
            .insert((channel_id.clone(), parent.id.clone()), snapshot.clone());
        for message in self.blocked.release(&channel_id, snapshot) {
            self.place(message, IngestSource::History, notices);
        }
    }

    /// Routes a released message to the reaction map or the timeline.
    fn place(&mut self, message: Message, source: IngestSource, notices: &mut Vec<EngineNotice>) -> bool {
        let channel_id = message.channel_id.clone();
        if message.kind == MessageKind::Reaction {
            let target = message.parent_id.clone();
            if self.reactions.apply(&message) {
                notices.push(EngineNotice::ReactionsChanged {
                    channel_id,
                    message_id: target,
                });
            }
            return false;
        }

        let live = source == IngestSource::Live;
        let own = self
            .own_pubkey
            .as_ref()
            .is_some_and(|own| own == &message.sender.pubkey);
        let reply_to_own = message.replied_to.as_ref().is_some_and(|parent| {
            self.own_pubkey
                .as_ref()
                .is_some_and(|own| own == &parent.sender.pubkey)
        });
        let message_id = message.id.clone();
        let parent_id = message.parent_id.clone();
        let pinned = message.pinned;
        let reply = (live && reply_to_own).then(|| {
            let sender = message
                .nickname
                .clone()
                .unwrap_or_else(|| message.sender.codename.clone());
            (sender, message.body.clone())
        });

        let outcome = self.timelines.channel_mut(&channel_id).upsert(message);
        notices.push(EngineNotice::TimelineChanged {
            channel_id: channel_id.clone(),
        });
        let inserted = outcome == Upsert::Inserted;

        if live && inserted && !own {
            if self.active_channel.as_ref() != Some(&channel_id) {
                let unread = self.unread.entry(channel_id.clone()).or_default();
                *unread += 1;
                notices.push(EngineNotice::UnreadChanged {
                    channel_id: channel_id.clone(),
                    unread: *unread,
                });
            }
            if let (Some(parent_id), Some((sender, body))) = (parent_id, reply) {
                notices.push(EngineNotice::ReplyReceived {
                    channel_id: channel_id.clone(),
                    message_id: message_id.clone(),
                    parent_id,
                    sender,
                    body,
                });
            }
        }
        if live && pinned != self.pins.is_pinned(&channel_id, &message_id) {
            self.apply_pin_flag(&channel_id, &message_id, pinned, notices);
        }
        inserted
    }

    fn apply_pin_flag(
        &mut self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        pinned: bool,
        notices: &mut Vec<EngineNotice>,
    ) {
        let body = self
            .timelines
            .channel_mut(channel_id)
            .get_mut(message_id)
            .map(|message| {
                message.pinned = pinned;
                message.body.clone()
            });
        if body.is_some() {
            notices.push(EngineNotice::TimelineChanged {
                channel_id: channel_id.clone(),
            });
        }
        if self.pins.observe_change(channel_id, message_id, pinned) {
            notices.push(EngineNotice::MessagePinned {
                channel_id: channel_id.clone(),
                channel_name: self.channel_name(channel_id),
                message_id: message_id.clone(),
                body: body.unwrap_or_default(),
            });
        }
    }

    /// Removes a hidden or deleted message from every derived view.
    fn forget_message(
        &mut self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        reaction_target: Option<&MessageId>,
        notices: &mut Vec<EngineNotice>,
    ) {
        let key = (channel_id.clone(), message_id.clone());
        self.parent_cache.remove(&key);
        self.blocked.remove(channel_id, message_id);

        if self
            .timelines
            .channel(channel_id)
            .is_some_and(|timeline| timeline.contains(message_id))
        {
            self.timelines.channel_mut(channel_id).remove(message_id);
            notices.push(EngineNotice::TimelineChanged {
                channel_id: channel_id.clone(),
            });
        }
        if self.reactions.retract(channel_id, message_id) {
            notices.push(EngineNotice::ReactionsChanged {
                channel_id: channel_id.clone(),
                message_id: reaction_target.cloned(),
            });
        }
        if self.reactions.drop_target(channel_id, message_id) {
            notices.push(EngineNotice::ReactionsChanged {
                channel_id: channel_id.clone(),
                message_id: Some(message_id.clone()),
            });
        }
        if self.pins.is_pinned(channel_id, message_id) {
            self.pins.observe_change(channel_id, message_id, false);
        }
    }

    fn drop_channel(&mut self, channel_id: &ChannelId) -> Vec<EngineNotice> {
        self.channels.remove(channel_id);
        self.timelines.drop_channel(channel_id);
        self.blocked.clear_channel(channel_id);
        self.parent_cache.retain(|(channel, _), _| channel != channel_id);
        self.reactions.forget(channel_id);
        self.pins.forget(channel_id);
        self.mutes.forget(channel_id);
        self.pagination.forget(channel_id);
        self.nicknames.remove(channel_id);
        self.unread.remove(channel_id);
        if self.active_channel.as_ref() == Some(channel_id) {
            self.active_channel = None;
        }
        info!(channel_id = %channel_id, "engine: channel removed");
        vec![EngineNotice::ChannelsChanged]
    }

    fn local_message(
        &mut self,
        channel_id: &ChannelId,
        body: &str,
        parent_id: Option<&MessageId>,
        replied_to: Option<ParentSnapshot>,
    ) -> Message {
        let pubkey = self
            .own_pubkey
            .clone()
            .unwrap_or_else(|| PubKey::from(FALLBACK_LOCAL_PUBKEY));
        let codeset = self.own_codeset;
        Message {
            id: MessageId::new(format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4())),
            row_id: None,
            channel_id: channel_id.clone(),
            sender: self.identities.get(&pubkey, codeset),
            nickname: self.nicknames.get(channel_id).cloned(),
            body: body.to_string(),
            kind: if parent_id.is_some() {
                MessageKind::Reply
            } else {
                MessageKind::Normal
            },
            parent_id: parent_id.cloned(),
            replied_to,
            status: MessageStatus::Sending,
            timestamp: Utc::now(),
            round: 0,
            pinned: false,
            hidden: false,
        }
    }

    fn reset(&mut self) {
        self.channels.clear();
        self.active_channel = None;
        self.identities.clear();
        self.codesets.clear();
        self.timelines.clear();
        self.blocked.clear();
        self.parent_cache.clear();
        self.reactions.clear();
        self.pins.clear();
        self.mutes.clear();
        self.pagination.clear();
        self.nicknames.clear();
        self.unread.clear();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
