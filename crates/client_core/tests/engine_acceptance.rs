use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use client_core::{
    EngineNotice, EngineSettings, LoadOutcome, PassthroughCipher, ReconciliationEngine,
};
use shared::{
    domain::{ChannelId, ChannelSummary, MessageId, PubKey, REACTION_TAG, TEXT_TAG},
    protocol::ChannelEvent,
};
use storage::{NewMessageRow, Storage};

fn row(channel: &ChannelId, id: &str, ts: i64, body: &str) -> NewMessageRow {
    NewMessageRow {
        message_id: MessageId::from(id),
        channel_id: channel.clone(),
        parent_message_id: None,
        nickname: None,
        text: PassthroughCipher::encode(body),
        type_tag: TEXT_TAG,
        status_tag: 3,
        timestamp: Utc.timestamp_millis_opt(ts).single().expect("ts"),
        round: 0,
        pubkey: PubKey::from("pk-bob"),
        codeset: 0,
        pinned: false,
        hidden: false,
    }
}

async fn open_storage(dir: &tempfile::TempDir) -> Storage {
    let url = format!(
        "sqlite://{}",
        dir.path().join("engine.db").to_string_lossy().replace('\\', "/")
    );
    Storage::new(&url).await.expect("open storage")
}

fn ids(messages: &[shared::domain::Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

#[tokio::test]
async fn engine_reconciles_history_and_live_rows_from_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = open_storage(&dir).await;
    let channel = ChannelId::from("ops");
    storage
        .upsert_channel(&ChannelSummary {
            channel_id: channel.clone(),
            name: "ops".into(),
            description: "operations".into(),
        })
        .await
        .expect("channel");

    storage
        .upsert_message_row(&row(&channel, "root", 100, "deploy at noon?"))
        .await
        .expect("root");
    for i in 0..3 {
        storage
            .upsert_message_row(&row(&channel, &format!("m{i}"), 200 + i, "chatter"))
            .await
            .expect("row");
    }
    let mut answer = row(&channel, "answer", 300, "yes");
    answer.parent_message_id = Some(MessageId::from("root"));
    storage.upsert_message_row(&answer).await.expect("reply");
    let mut thumbs = row(&channel, "x1", 301, "👍");
    thumbs.type_tag = REACTION_TAG;
    thumbs.parent_message_id = Some(MessageId::from("answer"));
    storage.upsert_message_row(&thumbs).await.expect("reaction");

    let engine = ReconciliationEngine::new(
        Arc::new(storage.clone()),
        EngineSettings {
            page_size: 3,
            own_pubkey: Some(PubKey::from("pk-me")),
            ..EngineSettings::default()
        },
    );
    engine.load_initial().await.expect("initial load");

    let timeline = engine.timeline(&channel).await;
    assert_eq!(ids(&timeline), vec!["m1", "m2", "answer"]);
    assert_eq!(
        timeline[2].replied_to.as_ref().map(|p| p.body.as_str()),
        Some("deploy at noon?")
    );
    assert_eq!(
        engine.reactions(&channel, &MessageId::from("answer")).await["👍"].len(),
        1
    );

    let mut notices = engine.subscribe_notices();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };
    let bus = engine.bus();

    let late = storage
        .upsert_message_row(&row(&channel, "late", 250, "sorry, lagging"))
        .await
        .expect("late row");
    bus.publish(ChannelEvent::MessageReceived {
        row_id: late,
        channel_id: channel.clone(),
        update: false,
    });
    notices
        .wait_for_timeout(
            |n| matches!(n, EngineNotice::TimelineChanged { .. }),
            Duration::from_secs(5),
        )
        .await
        .expect("timeline notice");
    assert_eq!(
        ids(&engine.timeline(&channel).await),
        vec!["m1", "m2", "late", "answer"]
    );

    storage
        .set_pinned(&channel, &MessageId::from("m2"), true)
        .await
        .expect("pin");
    bus.publish(ChannelEvent::PinChanged {
        channel_id: channel.clone(),
        message_id: MessageId::from("m2"),
        pinned: true,
    });
    let pinned = notices
        .wait_for_timeout(
            |n| matches!(n, EngineNotice::MessagePinned { .. }),
            Duration::from_secs(5),
        )
        .await
        .expect("pin notice");
    assert!(matches!(
        pinned,
        EngineNotice::MessagePinned { ref channel_name, ref body, .. }
            if channel_name == "ops" && body == "chatter"
    ));

    storage
        .set_hidden(&MessageId::from("late"), true)
        .await
        .expect("hide");
    bus.publish(ChannelEvent::MessageDeleted {
        message_id: MessageId::from("late"),
    });
    let mut gone = false;
    for _ in 0..50 {
        if !ids(&engine.timeline(&channel).await).contains(&"late") {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "hidden row should leave the timeline");

    assert_eq!(
        engine.load_more(&channel).await.expect("older page"),
        LoadOutcome::Loaded { rows: 2 }
    );
    assert_eq!(
        ids(&engine.timeline(&channel).await),
        vec!["root", "m0", "m1", "m2", "answer"]
    );

    engine.shutdown().await;
    runner.await.expect("join").expect("run");
}
