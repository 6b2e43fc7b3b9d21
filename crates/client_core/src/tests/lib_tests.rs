use super::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::TimeZone;
use shared::domain::{RowId, REACTION_TAG, TEXT_TAG};
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::sync::Notify;

const ME: &str = "pk-me";

#[derive(Default)]
struct MemoryStore {
    channels: Mutex<Vec<ChannelSummary>>,
    rows: Mutex<Vec<MessageRow>>,
    page_calls: AtomicUsize,
    fail_pages: AtomicBool,
    page_gate: Mutex<Option<Arc<Notify>>>,
}

impl MemoryStore {
    async fn add_channel(&self, id: &str, name: &str) {
        self.channels.lock().await.push(ChannelSummary {
            channel_id: ChannelId::from(id),
            name: name.to_string(),
            description: String::new(),
        });
    }

    async fn put(&self, mut row: MessageRow) -> RowId {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows
            .iter_mut()
            .find(|r| r.channel_id == row.channel_id && r.message_id == row.message_id)
        {
            row.row_id = existing.row_id;
            *existing = row;
            return existing.row_id;
        }
        row.row_id = RowId(rows.len() as i64 + 1);
        let row_id = row.row_id;
        rows.push(row);
        row_id
    }

    async fn set_pinned(&self, id: &str, pinned: bool) {
        for row in self.rows.lock().await.iter_mut() {
            if row.message_id.as_str() == id {
                row.pinned = pinned;
            }
        }
    }

    fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

fn sort_key(row: &MessageRow) -> (i64, u64, MessageId) {
    (row.timestamp.timestamp_millis(), row.round, row.message_id.clone())
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn list_channels(&self) -> Result<Vec<ChannelSummary>> {
        Ok(self.channels.lock().await.clone())
    }

    async fn get_channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelSummary>> {
        Ok(self
            .channels
            .lock()
            .await
            .iter()
            .find(|c| &c.channel_id == channel_id)
            .cloned())
    }

    async fn get_message_row(&self, row_id: RowId) -> Result<Option<MessageRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|r| r.row_id == row_id)
            .cloned())
    }

    async fn list_channel_page(
        &self,
        channel_id: &ChannelId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.page_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_pages.load(Ordering::SeqCst) {
            return Err(anyhow!("disk I/O error"));
        }
        let mut rows: Vec<MessageRow> = self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| &r.channel_id == channel_id && !r.hidden && r.type_tag != REACTION_TAG)
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(sort_key(r)));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_channel_since(
        &self,
        channel_id: &ChannelId,
        after: &OrderKey,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        let after = (after.timestamp_ms, after.round, after.id.clone());
        let mut rows: Vec<MessageRow> = self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| &r.channel_id == channel_id && !r.hidden && r.type_tag != REACTION_TAG)
            .filter(|r| sort_key(r) > after)
            .cloned()
            .collect();
        rows.sort_by_key(sort_key);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_reaction_rows(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| &r.channel_id == channel_id && !r.hidden && r.type_tag == REACTION_TAG)
            .cloned()
            .collect())
    }

    async fn list_pinned_rows(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| &r.channel_id == channel_id && !r.hidden && r.pinned)
            .cloned()
            .collect())
    }

    async fn list_rows_by_message_ids(
        &self,
        channel_id: &ChannelId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| {
                &r.channel_id == channel_id && !r.hidden && message_ids.contains(&r.message_id)
            })
            .cloned()
            .collect())
    }

    async fn list_pubkey_codesets(
        &self,
        channel_id: &ChannelId,
        pubkeys: &[PubKey],
    ) -> Result<Vec<(PubKey, u8)>> {
        let mut found: BTreeMap<PubKey, u8> = BTreeMap::new();
        for row in self.rows.lock().await.iter() {
            if &row.channel_id == channel_id && pubkeys.contains(&row.pubkey) {
                let entry = found.entry(row.pubkey.clone()).or_default();
                *entry = (*entry).max(row.codeset);
            }
        }
        Ok(found.into_iter().collect())
    }
}

#[derive(Default)]
struct RecordingManager {
    sent: Mutex<Vec<(ChannelId, Option<MessageId>, String)>>,
    reactions: Mutex<Vec<(MessageId, String)>>,
    pins: Mutex<Vec<(MessageId, bool)>>,
    muted: Mutex<Vec<PubKey>>,
    self_muted: AtomicBool,
    fail_sends: AtomicBool,
    next_id: AtomicUsize,
    send_gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingManager {
    async fn record_send(
        &self,
        channel_id: &ChannelId,
        parent_id: Option<&MessageId>,
        body: &str,
    ) -> Result<MessageId> {
        let gate = self.send_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        self.sent
            .lock()
            .await
            .push((channel_id.clone(), parent_id.cloned(), body.to_string()));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessageId::new(format!("net-{n}")))
    }
}

#[async_trait]
impl ChannelManager for RecordingManager {
    async fn send_message(&self, channel_id: &ChannelId, body: &str) -> Result<MessageId> {
        self.record_send(channel_id, None, body).await
    }

    async fn send_reply(
        &self,
        channel_id: &ChannelId,
        parent_id: &MessageId,
        body: &str,
    ) -> Result<MessageId> {
        self.record_send(channel_id, Some(parent_id), body).await
    }

    async fn send_reaction(
        &self,
        _channel_id: &ChannelId,
        target_id: &MessageId,
        emoji: &str,
    ) -> Result<MessageId> {
        self.reactions
            .lock()
            .await
            .push((target_id.clone(), emoji.to_string()));
        Ok(MessageId::from("net-reaction"))
    }

    async fn pin_message(
        &self,
        _channel_id: &ChannelId,
        message_id: &MessageId,
        unpin: bool,
    ) -> Result<()> {
        self.pins.lock().await.push((message_id.clone(), unpin));
        Ok(())
    }

    async fn delete_message(&self, _channel_id: &ChannelId, _message_id: &MessageId) -> Result<()> {
        Ok(())
    }

    async fn mute_user(
        &self,
        _channel_id: &ChannelId,
        pubkey: &PubKey,
        unmute: bool,
    ) -> Result<()> {
        let mut muted = self.muted.lock().await;
        muted.retain(|p| p != pubkey);
        if !unmute {
            muted.push(pubkey.clone());
        }
        Ok(())
    }

    async fn muted_users(&self, _channel_id: &ChannelId) -> Result<Vec<PubKey>> {
        Ok(self.muted.lock().await.clone())
    }

    async fn is_muted(&self, _channel_id: &ChannelId) -> Result<bool> {
        Ok(self.self_muted.load(Ordering::SeqCst))
    }
}

fn settings() -> EngineSettings {
    EngineSettings {
        own_pubkey: Some(PubKey::from(ME)),
        ..EngineSettings::default()
    }
}

fn engine_with(
    store: &Arc<MemoryStore>,
    manager: &Arc<RecordingManager>,
    settings: EngineSettings,
) -> Arc<ReconciliationEngine> {
    ReconciliationEngine::new_with_dependencies(
        store.clone(),
        Arc::new(PassthroughCipher),
        Arc::new(CodenameResolver),
        manager.clone(),
        EventBus::new(64),
        settings,
    )
}

fn setup() -> (Arc<MemoryStore>, Arc<RecordingManager>, Arc<ReconciliationEngine>) {
    let store = Arc::new(MemoryStore::default());
    let manager = Arc::new(RecordingManager::default());
    let engine = engine_with(&store, &manager, settings());
    (store, manager, engine)
}

fn text(channel: &str, id: &str, ts: i64, pubkey: &str) -> MessageRow {
    MessageRow {
        row_id: RowId(0),
        message_id: MessageId::from(id),
        channel_id: ChannelId::from(channel),
        parent_message_id: None,
        nickname: None,
        text: PassthroughCipher::encode(&format!("{id} body")),
        type_tag: TEXT_TAG,
        status_tag: MessageStatus::Delivered.tag(),
        timestamp: Utc.timestamp_millis_opt(ts).single().expect("ts"),
        round: 0,
        pubkey: PubKey::from(pubkey),
        codeset: 0,
        pinned: false,
        hidden: false,
    }
}

fn reply(channel: &str, id: &str, ts: i64, pubkey: &str, parent: &str) -> MessageRow {
    let mut row = text(channel, id, ts, pubkey);
    row.parent_message_id = Some(MessageId::from(parent));
    row
}

fn reaction(channel: &str, id: &str, ts: i64, pubkey: &str, target: &str, emoji: &str) -> MessageRow {
    let mut row = reply(channel, id, ts, pubkey, target);
    row.type_tag = REACTION_TAG;
    row.text = PassthroughCipher::encode(emoji);
    row
}

async fn deliver(engine: &ReconciliationEngine, store: &MemoryStore, row: MessageRow) -> RowId {
    let channel_id = row.channel_id.clone();
    let row_id = store.put(row).await;
    engine
        .handle_event(ChannelEvent::MessageReceived {
            row_id,
            channel_id,
            update: false,
        })
        .await
        .expect("handle event");
    row_id
}

async fn ids(engine: &ReconciliationEngine, channel: &str) -> Vec<String> {
    engine
        .timeline(&ChannelId::from(channel))
        .await
        .into_iter()
        .map(|m| m.id.0)
        .collect()
}

fn drain(sub: &mut Subscription<EngineNotice>) -> Vec<EngineNotice> {
    let mut out = Vec::new();
    while let Some(notice) = sub.try_recv() {
        out.push(notice);
    }
    out
}

fn pinned_notices(notices: &[EngineNotice]) -> Vec<String> {
    notices
        .iter()
        .filter_map(|n| match n {
            EngineNotice::MessagePinned { message_id, .. } => Some(message_id.0.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn same_row_delivered_twice_yields_one_entry() {
    let (store, _manager, engine) = setup();
    let row_id = deliver(&engine, &store, text("c", "m1", 10, "bob")).await;
    engine
        .handle_event(ChannelEvent::MessageReceived {
            row_id,
            channel_id: ChannelId::from("c"),
            update: true,
        })
        .await
        .expect("handle");

    assert_eq!(ids(&engine, "c").await, vec!["m1"]);
}

#[tokio::test]
async fn messages_are_ordered_by_timestamp_then_round() {
    let (store, _manager, engine) = setup();
    let mut tie_late = text("c", "tie-late", 20, "bob");
    tie_late.round = 8;
    let mut tie_early = text("c", "tie-early", 20, "bob");
    tie_early.round = 3;

    deliver(&engine, &store, text("c", "m1", 10, "bob")).await;
    deliver(&engine, &store, tie_late).await;
    deliver(&engine, &store, text("c", "m2", 5, "bob")).await;
    deliver(&engine, &store, tie_early).await;

    assert_eq!(ids(&engine, "c").await, vec!["m2", "m1", "tie-early", "tie-late"]);
}

#[tokio::test]
async fn reply_waits_for_its_parent_then_lands_in_order() {
    let (store, _manager, engine) = setup();

    deliver(&engine, &store, reply("c", "r1", 7, "bob", "m2")).await;
    assert!(ids(&engine, "c").await.is_empty());
    assert_eq!(engine.blocked_len().await, 1);

    deliver(&engine, &store, text("c", "m1", 10, "bob")).await;
    assert_eq!(ids(&engine, "c").await, vec!["m1"]);

    deliver(&engine, &store, text("c", "m2", 5, "carol")).await;
    assert_eq!(ids(&engine, "c").await, vec!["m2", "r1", "m1"]);
    assert_eq!(engine.blocked_len().await, 0);

    let timeline = engine.timeline(&ChannelId::from("c")).await;
    let parent = timeline[1].replied_to.as_ref().expect("embedded parent");
    assert_eq!(parent.id, MessageId::from("m2"));
    assert_eq!(parent.body, "m2 body");
    assert_eq!(parent.sender.pubkey, PubKey::from("carol"));
}

#[tokio::test]
async fn orphaned_replies_stay_blocked() {
    let (store, _manager, engine) = setup();
    for n in 0..20 {
        deliver(&engine, &store, reply("c", &format!("r{n}"), n, "bob", "gone")).await;
    }
    deliver(&engine, &store, text("c", "m1", 100, "bob")).await;

    assert_eq!(engine.blocked_len().await, 20);
    assert_eq!(ids(&engine, "c").await, vec!["m1"]);
}

#[tokio::test]
async fn repeated_reaction_counts_once() {
    let (store, _manager, engine) = setup();
    deliver(&engine, &store, text("c", "m1", 1, "bob")).await;
    deliver(&engine, &store, reaction("c", "x1", 2, "alice", "m1", "👍")).await;
    deliver(&engine, &store, reaction("c", "x1", 2, "alice", "m1", "👍")).await;
    deliver(&engine, &store, reaction("c", "x2", 3, "alice", "m1", "👍")).await;

    let reactions = engine
        .reactions(&ChannelId::from("c"), &MessageId::from("m1"))
        .await;
    assert_eq!(reactions["👍"].len(), 1);
    assert_eq!(ids(&engine, "c").await, vec!["m1"], "reactions never enter the timeline");
}

#[tokio::test]
async fn reaction_before_target_is_held() {
    let (store, _manager, engine) = setup();
    deliver(&engine, &store, reaction("c", "x1", 2, "alice", "m1", "🎉")).await;
    assert!(engine
        .reactions(&ChannelId::from("c"), &MessageId::from("m1"))
        .await
        .is_empty());
    assert_eq!(engine.blocked_len().await, 1);

    deliver(&engine, &store, text("c", "m1", 1, "bob")).await;
    let reactions = engine
        .reactions(&ChannelId::from("c"), &MessageId::from("m1"))
        .await;
    assert_eq!(reactions["🎉"].len(), 1);
}

#[tokio::test]
async fn pin_transitions_notify_once_per_new_pin() {
    let (store, _manager, engine) = setup();
    let channel = ChannelId::from("c");
    store.put(text("c", "A", 1, "bob")).await;
    store.put(text("c", "B", 2, "bob")).await;
    let mut notices = engine.subscribe_notices();

    engine.refresh_pins(&channel).await.expect("refresh");
    store.set_pinned("A", true).await;
    engine.refresh_pins(&channel).await.expect("refresh");
    engine.refresh_pins(&channel).await.expect("refresh");
    store.set_pinned("B", true).await;
    engine.refresh_pins(&channel).await.expect("refresh");

    assert_eq!(pinned_notices(&drain(&mut notices)), vec!["A", "B"]);
    assert_eq!(
        engine.pinned(&channel).await,
        vec![MessageId::from("A"), MessageId::from("B")]
    );
}

#[tokio::test]
async fn pins_present_at_cold_start_are_not_announced() {
    let (store, _manager, engine) = setup();
    store.add_channel("c", "general").await;
    let mut pinned = text("c", "A", 1, "bob");
    pinned.pinned = true;
    store.put(pinned).await;
    let mut notices = engine.subscribe_notices();

    engine.load_initial().await.expect("load");
    assert!(pinned_notices(&drain(&mut notices)).is_empty());

    store.put(text("c", "B", 2, "bob")).await;
    store.set_pinned("B", true).await;
    let fresh = engine.refresh_pins(&ChannelId::from("c")).await.expect("refresh");
    assert_eq!(fresh, vec![MessageId::from("B")]);

    let announced = drain(&mut notices);
    assert!(announced.iter().any(|n| matches!(
        n,
        EngineNotice::MessagePinned { channel_name, body, .. }
            if channel_name == "general" && body == "B body"
    )));
}

#[tokio::test]
async fn pin_change_event_updates_flag_and_notifies() {
    let (store, _manager, engine) = setup();
    deliver(&engine, &store, text("c", "m1", 1, "bob")).await;
    let mut notices = engine.subscribe_notices();
    let event = ChannelEvent::PinChanged {
        channel_id: ChannelId::from("c"),
        message_id: MessageId::from("m1"),
        pinned: true,
    };

    engine.handle_event(event.clone()).await.expect("pin");
    engine.handle_event(event).await.expect("pin again");

    assert_eq!(pinned_notices(&drain(&mut notices)), vec!["m1"]);
    assert!(engine.timeline(&ChannelId::from("c")).await[0].pinned);
}

#[tokio::test]
async fn exhausted_edge_issues_no_more_queries_until_switch() {
    let store = Arc::new(MemoryStore::default());
    let manager = Arc::new(RecordingManager::default());
    let engine = engine_with(
        &store,
        &manager,
        EngineSettings {
            page_size: 2,
            ..settings()
        },
    );
    let channel = ChannelId::from("c");
    store.add_channel("c", "general").await;
    for n in 0..3 {
        store.put(text("c", &format!("m{n}"), n, "bob")).await;
    }

    engine.load_initial().await.expect("load");
    assert_eq!(store.page_calls(), 1);
    assert_eq!(ids(&engine, "c").await, vec!["m1", "m2"]);

    assert_eq!(
        engine.load_more(&channel).await.expect("more"),
        LoadOutcome::Loaded { rows: 1 }
    );
    assert_eq!(ids(&engine, "c").await, vec!["m0", "m1", "m2"]);
    assert_eq!(
        engine.load_more(&channel).await.expect("more"),
        LoadOutcome::Exhausted
    );
    assert_eq!(store.page_calls(), 3);

    for _ in 0..5 {
        engine.load_more(&channel).await.expect("more");
        engine
            .scroll(&channel, Direction::Older, 10)
            .await
            .expect("scroll");
    }
    assert_eq!(store.page_calls(), 3);
    assert_eq!(
        engine.pagination_status(&channel, Direction::Older).await,
        EdgeStatus::Exhausted
    );

    engine.select_channel(&channel).await.expect("switch");
    assert_eq!(
        engine.pagination_status(&channel, Direction::Older).await,
        EdgeStatus::HasMore
    );
    engine.load_more(&channel).await.expect("more");
    assert_eq!(store.page_calls(), 4);
}

#[tokio::test]
async fn concurrent_load_more_issues_one_query() {
    let (store, _manager, engine) = setup();
    let channel = ChannelId::from("c");
    store.put(text("c", "m1", 1, "bob")).await;
    let gate = Arc::new(Notify::new());
    *store.page_gate.lock().await = Some(gate.clone());

    let (first, second, _) = tokio::join!(
        engine.load_more(&channel),
        engine.load_more(&channel),
        async {
            tokio::task::yield_now().await;
            gate.notify_one();
        }
    );

    assert_eq!(first.expect("first"), LoadOutcome::Loaded { rows: 1 });
    assert_eq!(second.expect("second"), LoadOutcome::Skipped);
    assert_eq!(store.page_calls(), 1);
}

#[tokio::test]
async fn storage_failure_keeps_pagination_state() {
    let (store, _manager, engine) = setup();
    let channel = ChannelId::from("c");
    store.put(text("c", "m1", 1, "bob")).await;
    store.fail_pages.store(true, Ordering::SeqCst);

    let err = engine.load_more(&channel).await.expect_err("storage down");
    assert!(matches!(err, EngineError::Storage { .. }));
    assert_eq!(
        engine.pagination_status(&channel, Direction::Older).await,
        EdgeStatus::HasMore
    );

    store.fail_pages.store(false, Ordering::SeqCst);
    assert_eq!(
        engine.load_more(&channel).await.expect("retry"),
        LoadOutcome::Loaded { rows: 1 }
    );
}

#[tokio::test]
async fn cold_start_hydrates_parents_outside_first_page() {
    let store = Arc::new(MemoryStore::default());
    let manager = Arc::new(RecordingManager::default());
    let engine = engine_with(
        &store,
        &manager,
        EngineSettings {
            page_size: 2,
            ..settings()
        },
    );
    store.add_channel("c", "general").await;
    store.put(text("c", "p", 1, "carol")).await;
    store.put(text("c", "m", 2, "bob")).await;
    store.put(reply("c", "r", 3, "bob", "p")).await;

    engine.load_initial().await.expect("load");

    assert_eq!(ids(&engine, "c").await, vec!["m", "r"]);
    assert_eq!(engine.blocked_len().await, 0);
    let timeline = engine.timeline(&ChannelId::from("c")).await;
    assert_eq!(
        timeline[1].replied_to.as_ref().map(|p| p.body.as_str()),
        Some("p body")
    );

    engine.load_more(&ChannelId::from("c")).await.expect("more");
    assert_eq!(ids(&engine, "c").await, vec!["p", "m", "r"]);
}

#[tokio::test]
async fn load_initial_selects_first_channel_and_builds_reactions() {
    let (store, _manager, engine) = setup();
    store.add_channel("b", "beta").await;
    store.add_channel("a", "alpha").await;
    store.put(text("a", "m1", 1, "bob")).await;
    store.put(reaction("a", "x1", 2, "carol", "m1", "❤")).await;

    engine.load_initial().await.expect("load");

    assert_eq!(engine.active_channel().await, Some(ChannelId::from("a")));
    assert_eq!(engine.channels().await.len(), 2);
    let reactions = engine
        .reactions(&ChannelId::from("a"), &MessageId::from("m1"))
        .await;
    assert_eq!(reactions["❤"].len(), 1);
    assert_eq!(
        engine.visible_messages(&ChannelId::from("a")).await.len(),
        1
    );
}

#[tokio::test]
async fn undecodable_rows_are_dropped() {
    let (store, _manager, engine) = setup();
    let mut broken = text("c", "bad", 1, "bob");
    broken.text = "%%% not base64".to_string();
    deliver(&engine, &store, broken).await;
    deliver(&engine, &store, text("c", "good", 2, "bob")).await;

    assert_eq!(ids(&engine, "c").await, vec!["good"]);
}

#[tokio::test]
async fn hidden_and_deleted_messages_leave_every_view() {
    let (store, _manager, engine) = setup();
    let channel = ChannelId::from("c");
    deliver(&engine, &store, text("c", "m1", 1, "bob")).await;
    deliver(&engine, &store, text("c", "m2", 2, "bob")).await;
    deliver(&engine, &store, reaction("c", "x1", 3, "carol", "m1", "👍")).await;

    engine
        .handle_event(ChannelEvent::MessageDeleted {
            message_id: MessageId::from("m1"),
        })
        .await
        .expect("delete");
    assert_eq!(ids(&engine, "c").await, vec!["m2"]);
    assert!(engine
        .reactions(&channel, &MessageId::from("m1"))
        .await
        .is_empty());

    let mut hidden = text("c", "m2", 2, "bob");
    hidden.hidden = true;
    deliver(&engine, &store, hidden).await;
    assert!(ids(&engine, "c").await.is_empty());
}

#[tokio::test]
async fn hidden_reaction_row_retracts_reactor() {
    let (store, _manager, engine) = setup();
    let channel = ChannelId::from("c");
    deliver(&engine, &store, text("c", "m1", 1, "bob")).await;
    deliver(&engine, &store, reaction("c", "x1", 2, "carol", "m1", "👍")).await;

    let mut retracted = reaction("c", "x1", 2, "carol", "m1", "👍");
    retracted.hidden = true;
    deliver(&engine, &store, retracted).await;

    assert!(engine
        .reactions(&channel, &MessageId::from("m1"))
        .await
        .is_empty());
}

#[tokio::test]
async fn replies_to_own_messages_and_unread_counts() {
    let (store, _manager, engine) = setup();
    store.add_channel("a", "alpha").await;
    store.add_channel("b", "beta").await;
    engine.load_initial().await.expect("load");
    let mut notices = engine.subscribe_notices();

    deliver(&engine, &store, text("b", "mine", 1, ME)).await;
    deliver(&engine, &store, reply("b", "r1", 2, "bob", "mine")).await;
    deliver(&engine, &store, reaction("b", "x1", 3, "bob", "mine", "👍")).await;

    let seen = drain(&mut notices);
    let replies: Vec<_> = seen
        .iter()
        .filter(|n| matches!(n, EngineNotice::ReplyReceived { .. }))
        .collect();
    assert_eq!(replies.len(), 1);
    let bob = CodenameResolver.resolve(&PubKey::from("bob"), 0);
    assert!(matches!(
        replies[0],
        EngineNotice::ReplyReceived { parent_id, sender, body, .. }
            if parent_id.as_str() == "mine" && *sender == bob.codename && body == "r1 body"
    ));
    assert_eq!(engine.unread(&ChannelId::from("b")).await, 1, "own messages are not unread");

    engine
        .select_channel(&ChannelId::from("b"))
        .await
        .expect("select");
    assert_eq!(engine.unread(&ChannelId::from("b")).await, 0);
}

#[tokio::test]
async fn mute_events_refresh_the_muted_set() {
    let (store, manager, engine) = setup();
    let channel = ChannelId::from("c");
    let mut row = text("c", "m1", 1, "bob");
    row.codeset = 2;
    deliver(&engine, &store, row).await;
    manager.muted.lock().await.push(PubKey::from("bob"));
    let mut notices = engine.subscribe_notices();

    engine
        .handle_event(ChannelEvent::UserMuted {
            channel_id: channel.clone(),
            pubkey: PubKey::from("bob"),
            unmute: false,
        })
        .await
        .expect("mute event");

    assert!(engine.is_muted(&channel, &PubKey::from("bob")).await);
    assert!(!engine.is_muted(&channel, &PubKey::from("carol")).await);
    let muted = engine.muted_users(&channel).await;
    assert_eq!(muted.len(), 1);
    assert_eq!(muted[0], CodenameResolver.resolve(&PubKey::from("bob"), 2));
    assert!(drain(&mut notices)
        .iter()
        .any(|n| matches!(n, EngineNotice::MutedUsersChanged { .. })));
}

#[tokio::test]
async fn refresh_muted_users_needs_an_active_channel() {
    let (_store, _manager, engine) = setup();
    assert!(matches!(
        engine.refresh_muted_users().await,
        Err(EngineError::NoActiveChannel)
    ));
}

#[tokio::test]
async fn send_shows_optimistic_entry_then_reconciles() {
    let (store, manager, engine) = setup();
    let channel = ChannelId::from("c");
    let gate = Arc::new(Notify::new());
    *manager.send_gate.lock().await = Some(gate.clone());

    let (sent, during) = tokio::join!(engine.send_message(&channel, "hello"), async {
        tokio::task::yield_now().await;
        let during = engine.timeline(&channel).await;
        gate.notify_one();
        during
    });

    assert_eq!(during.len(), 1);
    assert_eq!(during[0].status, MessageStatus::Sending);
    assert!(during[0].id.as_str().starts_with(LOCAL_ID_PREFIX));

    let real_id = sent.expect("sent");
    let after = engine.timeline(&channel).await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, real_id);
    assert_eq!(after[0].status, MessageStatus::Sent);

    let mut stored = text("c", real_id.as_str(), after[0].timestamp.timestamp_millis(), ME);
    stored.text = PassthroughCipher::encode("hello");
    deliver(&engine, &store, stored).await;
    let settled = engine.timeline(&channel).await;
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].status, MessageStatus::Delivered);
}

#[tokio::test]
async fn failed_send_removes_entry_and_reports() {
    let (_store, manager, engine) = setup();
    let channel = ChannelId::from("c");
    manager.fail_sends.store(true, Ordering::SeqCst);
    let mut notices = engine.subscribe_notices();

    let err = engine
        .send_message(&channel, "hello")
        .await
        .expect_err("send fails");
    assert!(matches!(err, EngineError::Operation(ref op) if op.code == ErrorCode::Network));
    assert!(engine.timeline(&channel).await.is_empty());
    assert!(drain(&mut notices)
        .iter()
        .any(|n| matches!(n, EngineNotice::OperationFailed(op) if op.operation == "send_message")));
}

#[tokio::test]
async fn missing_manager_fails_every_operation() {
    let store = Arc::new(MemoryStore::default());
    let engine = ReconciliationEngine::new(store, settings());
    let channel = ChannelId::from("c");
    let id = MessageId::from("m1");

    assert!(engine.send_message(&channel, "hi").await.is_err());
    assert!(engine.pin_message(&channel, &id).await.is_err());
    assert!(engine.delete_message(&channel, &id).await.is_err());
    assert!(engine
        .mute_user(&channel, &PubKey::from("bob"), false)
        .await
        .is_err());
    assert!(engine.timeline(&channel).await.is_empty());
}

#[tokio::test]
async fn self_muted_user_cannot_send() {
    let (store, manager, engine) = setup();
    store.add_channel("c", "general").await;
    manager.self_muted.store(true, Ordering::SeqCst);
    engine.load_initial().await.expect("load");
    assert!(engine.self_muted(&ChannelId::from("c")).await);

    let err = engine
        .send_message(&ChannelId::from("c"), "hi")
        .await
        .expect_err("muted");
    assert!(matches!(err, EngineError::Operation(ref op) if op.code == ErrorCode::Validation));
    assert!(manager.sent.lock().await.is_empty());
}

#[tokio::test]
async fn reply_to_unknown_message_is_rejected() {
    let (_store, manager, engine) = setup();
    let err = engine
        .send_reply(&ChannelId::from("c"), &MessageId::from("nope"), "hi")
        .await
        .expect_err("unknown parent");
    assert!(matches!(err, EngineError::UnknownMessage(_)));
    assert!(manager.sent.lock().await.is_empty());
}

#[tokio::test]
async fn reaction_is_validated_before_forwarding() {
    let (_store, manager, engine) = setup();
    let channel = ChannelId::from("c");
    let target = MessageId::from("m1");

    assert!(engine.send_reaction(&channel, &target, "   ").await.is_err());
    engine
        .send_reaction(&channel, &target, " 👍 ")
        .await
        .expect("react");
    assert_eq!(
        manager.reactions.lock().await.clone(),
        vec![(target, "👍".to_string())]
    );
}

#[tokio::test]
async fn unpin_waits_for_acknowledgement() {
    let (_store, manager, engine) = setup();
    let channel = ChannelId::from("c");
    let message = MessageId::from("m1");
    let bus = engine.bus();

    let (result, _) = tokio::join!(engine.unpin_message(&channel, &message), async {
        tokio::task::yield_now().await;
        bus.publish(ChannelEvent::PinChanged {
            channel_id: ChannelId::from("other"),
            message_id: message.clone(),
            pinned: false,
        });
        bus.publish(ChannelEvent::PinChanged {
            channel_id: channel.clone(),
            message_id: message.clone(),
            pinned: false,
        });
    });

    result.expect("acknowledged");
    assert_eq!(manager.pins.lock().await.clone(), vec![(message, true)]);
}

#[tokio::test(start_paused = true)]
async fn unpin_times_out_without_acknowledgement() {
    let store = Arc::new(MemoryStore::default());
    let manager = Arc::new(RecordingManager::default());
    let engine = engine_with(
        &store,
        &manager,
        EngineSettings {
            ack_timeout: Duration::from_secs(2),
            ..settings()
        },
    );

    let err = engine
        .unpin_message(&ChannelId::from("c"), &MessageId::from("m1"))
        .await
        .expect_err("no ack");
    assert!(matches!(err, EngineError::Bus(BusError::TimedOut(_))));
}

#[tokio::test]
async fn nickname_events_are_tracked_per_channel() {
    let (_store, _manager, engine) = setup();
    let channel = ChannelId::from("c");
    engine
        .handle_event(ChannelEvent::NicknameUpdated {
            channel_id: channel.clone(),
            nickname: Some("zed".to_string()),
        })
        .await
        .expect("nick");
    assert_eq!(engine.nickname(&channel).await.as_deref(), Some("zed"));

    engine
        .handle_event(ChannelEvent::NicknameUpdated {
            channel_id: channel.clone(),
            nickname: None,
        })
        .await
        .expect("clear nick");
    assert!(engine.nickname(&channel).await.is_none());
}

#[tokio::test]
async fn channel_updates_add_and_drop_channels() {
    let (store, _manager, engine) = setup();
    store.add_channel("a", "alpha").await;
    engine.load_initial().await.expect("load");

    store.add_channel("b", "beta").await;
    store.put(text("b", "m1", 1, "bob")).await;
    engine
        .handle_event(ChannelEvent::ChannelUpdated {
            channel_id: ChannelId::from("b"),
            deleted: false,
        })
        .await
        .expect("add");
    assert_eq!(engine.channels().await.len(), 2);
    assert_eq!(ids(&engine, "b").await, vec!["m1"]);

    engine
        .handle_event(ChannelEvent::ChannelUpdated {
            channel_id: ChannelId::from("a"),
            deleted: true,
        })
        .await
        .expect("drop");
    assert_eq!(engine.channels().await.len(), 1);
    assert!(engine.active_channel().await.is_none());
    assert!(matches!(
        engine.select_channel(&ChannelId::from("a")).await,
        Err(EngineError::UnknownChannel(_))
    ));
}

#[tokio::test]
async fn run_loop_processes_bus_events_until_shutdown() {
    let (store, _manager, engine) = setup();
    let mut notices = engine.subscribe_notices();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    let row_id = store.put(text("c", "m1", 1, "bob")).await;
    engine.bus().publish(ChannelEvent::MessageReceived {
        row_id,
        channel_id: ChannelId::from("c"),
        update: false,
    });
    notices
        .wait_for_timeout(
            |n| matches!(n, EngineNotice::TimelineChanged { .. }),
            Duration::from_secs(5),
        )
        .await
        .expect("timeline notice");
    assert_eq!(ids(&engine, "c").await, vec!["m1"]);

    engine.shutdown().await;
    runner.await.expect("join").expect("run");
    assert!(ids(&engine, "c").await.is_empty(), "shutdown drops derived state");
    assert!(matches!(engine.run().await, Err(EngineError::NotRunnable)));
}

#[tokio::test]
async fn notices_serialize_as_tagged_json() {
    let notice = EngineNotice::UnreadChanged {
        channel_id: ChannelId::from("c"),
        unread: 3,
    };
    let json = serde_json::to_value(&notice).expect("json");
    assert_eq!(json["type"], "unread_changed");
    assert_eq!(json["payload"]["unread"], 3);
}

#[tokio::test]
async fn live_row_before_cold_start_does_not_hide_history() {
    let (store, _manager, engine) = setup();
    store.add_channel("c", "general").await;
    for n in 0..5 {
        store.put(text("c", &format!("h{n}"), n, "bob")).await;
    }
    deliver(&engine, &store, text("c", "live", 100, "carol")).await;
    assert_eq!(ids(&engine, "c").await, vec!["live"]);

    engine.load_initial().await.expect("load");

    assert_eq!(
        ids(&engine, "c").await,
        vec!["h0", "h1", "h2", "h3", "h4", "live"]
    );
    assert_eq!(store.page_calls(), 1);

    engine
        .select_channel(&ChannelId::from("c"))
        .await
        .expect("reselect");
    assert_eq!(store.page_calls(), 1, "the newest page is fetched once");
}

#[tokio::test]
async fn optimistic_entry_uses_configured_codeset() {
    let store = Arc::new(MemoryStore::default());
    let manager = Arc::new(RecordingManager::default());
    let engine = engine_with(
        &store,
        &manager,
        EngineSettings {
            own_codeset: 2,
            ..settings()
        },
    );
    let channel = ChannelId::from("c");
    let gate = Arc::new(Notify::new());
    *manager.send_gate.lock().await = Some(gate.clone());

    let (sent, during) = tokio::join!(engine.send_message(&channel, "hello"), async {
        tokio::task::yield_now().await;
        let during = engine.timeline(&channel).await;
        gate.notify_one();
        during
    });
    sent.expect("sent");

    assert_eq!(during.len(), 1);
    assert_eq!(during[0].sender, CodenameResolver.resolve(&PubKey::from(ME), 2));
}

#[tokio::test]
async fn hiding_a_repeat_reaction_keeps_the_earlier_one() {
    let (store, _manager, engine) = setup();
    let channel = ChannelId::from("c");
    let target = MessageId::from("m1");
    deliver(&engine, &store, text("c", "m1", 1, "bob")).await;
    deliver(&engine, &store, reaction("c", "x1", 2, "alice", "m1", "👍")).await;
    deliver(&engine, &store, reaction("c", "x2", 3, "alice", "m1", "👍")).await;

    let mut hidden = reaction("c", "x2", 3, "alice", "m1", "👍");
    hidden.hidden = true;
    deliver(&engine, &store, hidden).await;

    let incremental = engine.reactions(&channel, &target).await;
    assert_eq!(incremental["👍"].len(), 1);

    engine.rebuild_reactions(&channel).await.expect("rebuild");
    assert_eq!(engine.reactions(&channel, &target).await, incremental);
}

#[tokio::test]
async fn rewritten_reaction_row_matches_a_rebuild() {
    let (store, _manager, engine) = setup();
    let channel = ChannelId::from("c");
    let target = MessageId::from("m1");
    deliver(&engine, &store, text("c", "m1", 1, "bob")).await;
    deliver(&engine, &store, reaction("c", "x1", 2, "alice", "m1", "👍")).await;
    deliver(&engine, &store, reaction("c", "x1", 2, "alice", "m1", "🎉")).await;

    let incremental = engine.reactions(&channel, &target).await;
    assert_eq!(incremental.keys().collect::<Vec<_>>(), vec!["🎉"]);

    engine.rebuild_reactions(&channel).await.expect("rebuild");
    assert_eq!(engine.reactions(&channel, &target).await, incremental);
}
