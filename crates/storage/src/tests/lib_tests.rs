use super::*;

fn server_message(id: i64, conversation: i64, content: &str) -> CachedMessage {
    CachedMessage {
        key: MessageKey::Server(MessageId(id)),
        conversation_id: ConversationId(conversation),
        sender_id: UserId(1),
        receiver_id: Some(UserId(2)),
        kind: MessageKind::Text,
        content: content.to_string(),
        status: MessageStatus::Delivered,
        created_at: 1_700_000_000 + id,
    }
}

fn pending_message(local: i64, conversation: i64, content: &str) -> CachedMessage {
    CachedMessage {
        key: MessageKey::Local(LocalId(local)),
        conversation_id: ConversationId(conversation),
        sender_id: UserId(1),
        receiver_id: None,
        kind: MessageKind::Text,
        content: content.to_string(),
        status: MessageStatus::Pending,
        created_at: 1_700_000_500,
    }
}

async fn sqlite_cache() -> (SqliteCache, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!(
        "sqlite://{}",
        dir.path().join("cache.db").to_string_lossy().replace('\\', "/")
    );
    let cache = SqliteCache::new(&url).await.expect("db");
    (cache, dir)
}

async fn orders_server_before_local(cache: &dyn LocalCache) {
    cache
        .put_message(&pending_message(1, 7, "draft"))
        .await
        .expect("pending");
    cache
        .put_message(&server_message(12, 7, "second"))
        .await
        .expect("second");
    cache
        .put_message(&server_message(10, 7, "first"))
        .await
        .expect("first");
    cache
        .put_message(&server_message(11, 8, "elsewhere"))
        .await
        .expect("other conversation");

    let listed = cache
        .messages_by_conversation(ConversationId(7))
        .await
        .expect("list");
    let keys: Vec<MessageKey> = listed.iter().map(|m| m.key).collect();
    assert_eq!(
        keys,
        vec![
            MessageKey::Server(MessageId(10)),
            MessageKey::Server(MessageId(12)),
            MessageKey::Local(LocalId(1)),
        ]
    );

    let last = cache.last_message().await.expect("last").expect("some");
    assert_eq!(last.key, MessageKey::Server(MessageId(12)));
}

async fn replaces_pending_with_confirmed(cache: &dyn LocalCache) {
    let pending = pending_message(3, 7, "hello");
    cache.put_message(&pending).await.expect("pending");

    let confirmed = server_message(40, 7, "hello");
    cache
        .replace_message(pending.key, &confirmed)
        .await
        .expect("replace");

    assert!(cache.get_message(pending.key).await.expect("get").is_none());
    let stored = cache
        .get_message(confirmed.key)
        .await
        .expect("get")
        .expect("confirmed");
    assert_eq!(stored, confirmed);
    assert_eq!(
        cache
            .messages_by_conversation(ConversationId(7))
            .await
            .expect("list")
            .len(),
        1
    );
}

async fn cursor_never_moves_backwards(cache: &dyn LocalCache) {
    let conversation = ConversationId(5);
    assert_eq!(cache.sync_cursor(conversation).await.expect("cursor"), None);
    assert_eq!(
        cache
            .advance_sync_cursor(conversation, MessageId(20))
            .await
            .expect("advance"),
        MessageId(20)
    );
    assert_eq!(
        cache
            .advance_sync_cursor(conversation, MessageId(15))
            .await
            .expect("advance"),
        MessageId(20)
    );
    assert_eq!(
        cache.sync_cursor(conversation).await.expect("cursor"),
        Some(MessageId(20))
    );
}

async fn stores_conversations(cache: &dyn LocalCache) {
    let older = CachedConversation {
        id: ConversationId(1),
        participant: Participant {
            id: UserId(9),
            username: "bob".into(),
            nickname: String::new(),
        },
        unread_count: 0,
        updated_at: 100,
    };
    let newer = CachedConversation {
        id: ConversationId(2),
        participant: Participant {
            id: UserId(10),
            username: "carol".into(),
            nickname: "C".into(),
        },
        unread_count: 3,
        updated_at: 200,
    };
    cache.put_conversation(&older).await.expect("older");
    cache.put_conversation(&newer).await.expect("newer");

    let listed = cache.conversations().await.expect("list");
    assert_eq!(listed, vec![newer.clone(), older]);
    assert_eq!(
        cache
            .conversation(ConversationId(2))
            .await
            .expect("get")
            .expect("some"),
        newer
    );

    cache.clear().await.expect("clear");
    assert!(cache.conversations().await.expect("list").is_empty());
}

#[tokio::test]
async fn memory_cache_orders_server_before_local() {
    orders_server_before_local(&MemoryCache::new()).await;
}

#[tokio::test]
async fn sqlite_cache_orders_server_before_local() {
    let (cache, _dir) = sqlite_cache().await;
    orders_server_before_local(&cache).await;
}

#[tokio::test]
async fn memory_cache_replaces_pending_with_confirmed() {
    replaces_pending_with_confirmed(&MemoryCache::new()).await;
}

#[tokio::test]
async fn sqlite_cache_replaces_pending_with_confirmed() {
    let (cache, _dir) = sqlite_cache().await;
    replaces_pending_with_confirmed(&cache).await;
}

#[tokio::test]
async fn memory_cache_cursor_never_moves_backwards() {
    cursor_never_moves_backwards(&MemoryCache::new()).await;
}

#[tokio::test]
async fn sqlite_cache_cursor_never_moves_backwards() {
    let (cache, _dir) = sqlite_cache().await;
    cursor_never_moves_backwards(&cache).await;
}

#[tokio::test]
async fn memory_cache_stores_conversations() {
    stores_conversations(&MemoryCache::new()).await;
}

#[tokio::test]
async fn sqlite_cache_stores_conversations() {
    let (cache, _dir) = sqlite_cache().await;
    stores_conversations(&cache).await;
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let cache = SqliteCache::new("sqlite::memory:").await.expect("db");
    cache.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("cache.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let cache = SqliteCache::new(&database_url).await.expect("db");
    drop(cache);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[test]
fn sqlite_path_skips_memory_urls() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(
        sqlite_path("sqlite://data/cache.db?mode=rwc"),
        Some(PathBuf::from("data/cache.db"))
    );
}

#[test]
fn converts_server_record_into_cached_message() {
    let record = MessageRecord {
        id: MessageId(8),
        conversation_id: ConversationId(2),
        sender_id: UserId(4),
        receiver_id: UserId(5),
        kind: MessageKind::Voice,
        content: "clip".into(),
        status: MessageStatus::Read,
        created_at: 55,
    };
    let cached = CachedMessage::from(record);
    assert_eq!(cached.server_id(), Some(MessageId(8)));
    assert_eq!(cached.local_id(), None);
    assert_eq!(cached.receiver_id, Some(UserId(5)));
    assert_eq!(cached.status, MessageStatus::Read);
}
