//! Cross-module index tests: edges, counters, and history ordering.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use chrono::Utc;
use quill_common::cursor::{deserialize_activity_cursor, serialize_activity_cursor};
use quill_index::{ObjectIndex, StatisticsMaintainer, User, UserIndex};
use quill_store::{MemoryKeyValueStore, StreamEventKind};
use quill_vocab::{Activity, ApObject, Note, PUBLIC_ADDRESS};
use serde_json::json;

fn harness() -> (
    Arc<MemoryKeyValueStore>,
    UserIndex,
    ObjectIndex,
    StatisticsMaintainer,
) {
    let kv = Arc::new(MemoryKeyValueStore::new());
    let users = UserIndex::new(kv.clone(), "users");
    let objects = ObjectIndex::new(kv.clone(), "objects");
    let statistics = StatisticsMaintainer::new(kv.clone(), "users", "objects");
    (kv, users, objects, statistics)
}

fn alice() -> User {
    let now = Utc::now();
    User {
        domain: "example.social".to_string(),
        username: "alice".to_string(),
        name: "Alice".to_string(),
        preferred_username: "alice".to_string(),
        summary: String::new(),
        url: String::new(),
        public_key_pem: String::new(),
        private_key_path: String::new(),
        follower_count: 0,
        following_count: 0,
        created_at: now,
        updated_at: now,
        last_activity_at: now,
    }
}

fn follow(actor: &str, n: u32) -> Activity {
    Activity::parse(json!({
        "id": format!("{actor}/follows/{n}"),
        "type": "Follow",
        "actor": actor,
        "object": "https://example.social/users/alice",
    }))
    .unwrap()
}

async fn drain(
    kv: &MemoryKeyValueStore,
    statistics: &StatisticsMaintainer,
) {
    let user_events = kv.drain_events("users");
    statistics.apply_user_events(&user_events).await.unwrap();
    let object_events = kv.drain_events("objects");
    statistics.apply_object_events(&object_events).await.unwrap();
}

#[tokio::test]
async fn test_follower_count_matches_edges_after_drain() {
    let (kv, users, _, statistics) = harness();
    users.put_user(&alice()).await.unwrap();
    kv.drain_events("users");

    for n in 0..4 {
        let follow = follow(&format!("https://r.example/users/u{n}"), n);
        users.add_user_follower("alice", &follow).await.unwrap();
    }
    // One unfollow, one duplicate follow.
    users
        .remove_user_follower("alice", &follow("https://r.example/users/u0", 0))
        .await
        .unwrap();
    users
        .add_user_follower("alice", &follow("https://r.example/users/u1", 1))
        .await
        .unwrap();
    drain(&kv, &statistics).await;

    let user = users
        .find_user_by_username("alice", "example.social")
        .await
        .unwrap()
        .unwrap();
    let mut walk = users.enumerate_followers("alice", 10, None, None).unwrap();
    let edges = walk.take(100).await.unwrap();
    assert_eq!(edges.len(), 3);
    assert_eq!(user.follower_count, edges.len() as i64);
}

#[tokio::test]
async fn test_reply_count_matches_edges_after_drain() {
    let (kv, _, objects, statistics) = harness();
    let note = Note::new(json!({
        "type": "Note",
        "id": "https://example.social/users/alice/posts/p1",
        "content": "hello",
        "published": "2024-04-01T00:00:00Z",
        "to": [PUBLIC_ADDRESS],
    }))
    .unwrap();
    objects.put_post(&note).await.unwrap();
    kv.drain_events("objects");

    for n in 0..5 {
        let reply = ApObject::new(json!({
            "type": "Note",
            "id": format!("https://r.example/notes/{n}"),
            "content": "re",
            "published": format!("2024-04-02T0{n}:00:00Z"),
        }))
        .unwrap();
        objects.add_reply_to_post("alice", "p1", &reply).await.unwrap();
    }
    drain(&kv, &statistics).await;

    let post = objects.find_user_post("alice", "p1").await.unwrap().unwrap();
    let mut walk = objects.enumerate_replies("alice", "p1", 2, None, None).unwrap();
    let edges = walk.take(100).await.unwrap();
    assert_eq!(edges.len(), 5);
    assert_eq!(post.reply_count, edges.len() as i64);
}

#[tokio::test]
async fn test_activity_sort_keys_are_chronological() {
    let (_, _, objects, _) = harness();
    let user = alice();
    let mut records = Vec::new();
    for _ in 0..6 {
        let unique = quill_common::ids::generate_unique_part();
        let activity = Activity::parse(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("https://example.social/users/alice/activities/{unique}"),
            "type": "Create",
            "actor": "https://example.social/users/alice",
            "to": [PUBLIC_ADDRESS],
            "published": "2024-04-01T00:00:00Z",
            "object": {
                "type": "Note",
                "id": format!("https://example.social/users/alice/posts/{unique}"),
                "content": "x",
            },
        }))
        .unwrap();
        objects.put_activity(&activity).await.unwrap();
        records.push(unique);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let mut walk = objects
        .enumerate_user_activities(&user, 3, None, None)
        .unwrap();
    let listed = walk.take(100).await.unwrap();
    assert_eq!(listed.len(), 6);
    // Reverse-chronological listing: sort-key order equals creation order.
    for window in listed.windows(2) {
        assert!(window[0].created_at >= window[1].created_at);
        assert!((window[0].pk.clone(), window[0].sk.clone())
            >= (window[1].pk.clone(), window[1].sk.clone()));
    }

    // Cursor round-trips point back at the same record.
    for record in &listed {
        let cursor = serialize_activity_cursor(&record.primary_key()).unwrap();
        let key = deserialize_activity_cursor(&cursor, "alice").unwrap();
        assert_eq!(key, record.primary_key());
    }
}

#[tokio::test]
async fn test_activity_walk_resumes_at_cursor() {
    let (_, _, objects, _) = harness();
    let user = alice();
    for _ in 0..5 {
        let unique = quill_common::ids::generate_unique_part();
        let activity = Activity::parse(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("https://example.social/users/alice/activities/{unique}"),
            "type": "Create",
            "actor": "https://example.social/users/alice",
            "to": [PUBLIC_ADDRESS],
            "published": "2024-04-01T00:00:00Z",
            "object": {
                "type": "Note",
                "id": format!("https://example.social/users/alice/posts/{unique}"),
                "content": "x",
            },
        }))
        .unwrap();
        objects.put_activity(&activity).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let mut walk = objects
        .enumerate_user_activities(&user, 2, None, None)
        .unwrap();
    let first_two = walk.take(2).await.unwrap();

    // Resuming before the second record yields the remaining three.
    let mut rest = objects
        .enumerate_user_activities(&user, 2, Some(first_two[1].primary_key()), None)
        .unwrap();
    let tail = rest.take(100).await.unwrap();
    assert_eq!(tail.len(), 3);
    assert!(tail.iter().all(|record| record.sk < first_two[1].sk));

    // And walking after the oldest of those three returns towards the head.
    let oldest = &tail[tail.len() - 1];
    let mut forward = objects
        .enumerate_user_activities(&user, 2, None, Some(oldest.primary_key()))
        .unwrap();
    let ahead = forward.take(100).await.unwrap();
    assert_eq!(ahead.len(), 4);
    assert!(ahead.iter().all(|record| record.sk > oldest.sk));
}

#[tokio::test]
async fn test_edge_insert_remove_events_pair_off() {
    let (kv, users, _, _) = harness();
    users.put_user(&alice()).await.unwrap();
    kv.drain_events("users");

    let follow = follow("https://r.example/users/bob", 7);
    users.add_user_follower("alice", &follow).await.unwrap();
    users.remove_user_follower("alice", &follow).await.unwrap();
    // Removing again produces no further events.
    users.remove_user_follower("alice", &follow).await.unwrap();

    let events = kv.drain_events("users");
    let kinds: Vec<StreamEventKind> = events.iter().map(|event| event.event).collect();
    assert_eq!(kinds, vec![StreamEventKind::Insert, StreamEventKind::Remove]);
}

#[tokio::test]
async fn test_last_activity_moves_forward() {
    let (_, users, _, _) = harness();
    users.put_user(&alice()).await.unwrap();
    let before = users
        .find_user_by_username("alice", "example.social")
        .await
        .unwrap()
        .unwrap()
        .last_activity_at;
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    users.update_last_activity("alice").await.unwrap();
    let after = users
        .find_user_by_username("alice", "example.social")
        .await
        .unwrap()
        .unwrap()
        .last_activity_at;
    assert!(after > before);
}
