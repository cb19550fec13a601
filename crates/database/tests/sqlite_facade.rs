use async_trait::async_trait;
use core_types::{BaseEntity, DatabaseError, Document, ErrorCode, FieldType, SortDirection};
use database::{
    BatchOperation, CollectionSchema, ConnectionSettings, Database, FieldDefinition, Filter, FindOptions,
    SqliteAdapter,
};
use futures::StreamExt;
use parking_lot::Mutex;
use resilience::{AdminNotifier, NotifyError, RecordingSleeper, ResilienceManager, RetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

const POSTS: &str = "posts";

/// Collects every alert instead of delivering it.
#[derive(Default)]
struct CapturingNotifier {
    alerts: Mutex<Vec<ErrorCode>>,
}

#[async_trait]
impl AdminNotifier for CapturingNotifier {
    async fn notify_admins(&self, error: &DatabaseError) -> Result<(), NotifyError> {
        self.alerts.lock().push(error.code.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct NewPost<'a> {
    title: &'a str,
    slug: &'a str,
    views: i64,
    tags: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(flatten)]
    base: BaseEntity,
    title: String,
    slug: String,
    views: i64,
    #[serde(default)]
    tags: Vec<String>,
}

fn posts_schema() -> CollectionSchema {
    CollectionSchema::new(POSTS)
        .field(FieldDefinition::new("title", FieldType::String).required())
        .field(FieldDefinition::new("slug", FieldType::String).unique())
        .field(FieldDefinition::new("views", FieldType::Integer))
        .field(FieldDefinition::new("tags", FieldType::Array))
}

fn post<'a>(title: &'a str, slug: &'a str, views: i64) -> NewPost<'a> {
    NewPost {
        title,
        slug,
        views,
        tags: vec!["rust"],
    }
}

async fn setup_db() -> Database {
    let adapter = Arc::new(SqliteAdapter::new(ConnectionSettings::new("sqlite::memory:")));
    let db = Database::new(adapter, Arc::new(CapturingNotifier::default()));
    db.connect().await.unwrap();
    db.initialize(&[posts_schema()]).await.unwrap();
    db
}

#[tokio::test]
async fn initialize_registers_auth_and_content_collections() {
    let db = setup_db().await;
    assert!(db.is_connected());
    let collections = db.collection().list();
    assert!(collections.contains(&"auth_users".to_string()));
    assert!(collections.contains(&POSTS.to_string()));
    assert_eq!(collections.len(), 4);
}

#[tokio::test]
async fn initialize_without_content_collections_fails() {
    let adapter = Arc::new(SqliteAdapter::new(ConnectionSettings::new("sqlite::memory:")));
    let db = Database::new(adapter, Arc::new(CapturingNotifier::default()));
    db.connect().await.unwrap();
    let err = db.initialize(&[]).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NO_COLLECTIONS);
}

#[tokio::test]
async fn insert_then_find_by_id_returns_the_stored_record() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();

    let created = posts.insert(&post("Hello", "hello", 3)).await.unwrap();
    assert!(db.utils().validate_id(&created.base.id));
    assert_eq!(created.base.created_at, created.base.updated_at);

    let found = posts.find_by_id(&created.base.id).await.unwrap().unwrap();
    assert_eq!(found.title, "Hello");
    assert_eq!(found.slug, "hello");
    assert_eq!(found.views, 3);
    assert_eq!(found.tags, vec!["rust".to_string()]);
}

#[tokio::test]
async fn find_by_id_rejects_malformed_ids() {
    let db = setup_db().await;
    let err = db.crud::<Post>(POSTS).unwrap().find_by_id("nope").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::INVALID_ID);
}

#[tokio::test]
async fn update_refreshes_updated_at_and_reports_missing_records() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    let created = posts.insert(&post("Draft", "draft", 0)).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let updated = posts.update(&created.base.id, &json!({ "views": 10 })).await.unwrap();
    assert_eq!(updated.views, 10);
    assert_eq!(updated.title, "Draft");
    assert_eq!(updated.base.created_at, created.base.created_at);
    assert!(updated.base.updated_at > created.base.updated_at);

    let missing = db.utils().generate_id();
    let err = posts.update(&missing, &json!({ "views": 1 })).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NOT_FOUND);
}

#[tokio::test]
async fn upserting_twice_leaves_a_single_record() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    let filter = Filter::eq("slug", "launch");

    let first = posts.upsert(&filter, &json!({ "title": "Launch", "views": 1 })).await.unwrap();
    assert!(first.inserted);
    assert_eq!(first.document.slug, "launch");

    let second = posts.upsert(&filter, &json!({ "title": "Launch!", "views": 2 })).await.unwrap();
    assert!(!second.inserted);
    assert_eq!(second.document.base.id, first.document.base.id);
    assert_eq!(second.document.title, "Launch!");

    assert_eq!(posts.count(&filter).await.unwrap(), 1);
}

#[tokio::test]
async fn upsert_by_existing_id_updates_in_place() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    let created = posts.insert(&post("Original", "original", 1)).await.unwrap();

    let outcome = posts
        .upsert(&Filter::id(&created.base.id), &json!({ "title": "Renamed" }))
        .await
        .unwrap();
    assert!(!outcome.inserted);
    assert_eq!(outcome.document.base.id, created.base.id);
    assert_eq!(outcome.document.title, "Renamed");
    assert_eq!(outcome.document.views, 1);
    assert_eq!(posts.count(&Filter::All).await.unwrap(), 1);
}

#[tokio::test]
async fn upsert_many_counts_updates_and_inserts_separately() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    posts.insert(&post("Existing", "existing", 1)).await.unwrap();

    let items = vec![
        (Filter::eq("slug", "existing"), json!({ "title": "Existing", "views": 10 })),
        (Filter::eq("slug", "fresh"), json!({ "title": "Fresh", "views": 1 })),
        (Filter::eq("slug", "newer"), json!({ "title": "Newer", "views": 2 })),
    ];
    let result = posts.upsert_many(&items).await.unwrap();
    assert_eq!(result.upserted_count, 2);
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);

    assert_eq!(posts.count(&Filter::All).await.unwrap(), 3);
    let existing = posts.find_one(&Filter::eq("slug", "existing")).await.unwrap().unwrap();
    assert_eq!(existing.views, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_of_one_key_create_a_single_record() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("upserts.db").display());
    let db = Database::new(
        Arc::new(SqliteAdapter::new(ConnectionSettings::new(url))),
        Arc::new(CapturingNotifier::default()),
    );
    db.connect().await.unwrap();
    db.initialize(&[posts_schema()]).await.unwrap();
    let posts = db.crud::<Post>(POSTS).unwrap();
    let filter = Filter::eq("slug", "contended");

    let outcomes = futures::future::join_all((0..16).map(|views| {
        let posts = &posts;
        let filter = &filter;
        async move { posts.upsert(filter, &json!({ "title": "Contended", "views": views })).await }
    }))
    .await;

    let outcomes: Vec<_> = outcomes.into_iter().map(Result::unwrap).collect();
    assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1);
    let id = &outcomes[0].document.base.id;
    assert!(outcomes.iter().all(|o| &o.document.base.id == id));
    assert_eq!(posts.count(&filter).await.unwrap(), 1);
}

#[tokio::test]
async fn exists_tracks_insert_and_delete() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    let created = posts.insert(&post("Ephemeral", "ephemeral", 0)).await.unwrap();
    let by_id = Filter::id(created.base.id.clone());

    assert!(posts.exists(&by_id).await.unwrap());
    assert!(posts.delete(&created.base.id).await.unwrap());
    assert!(!posts.exists(&by_id).await.unwrap());
    assert!(!posts.delete(&created.base.id).await.unwrap());
}

#[tokio::test]
async fn insert_many_reports_duplicates_by_index_and_keeps_the_rest() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();

    let result = posts
        .insert_many(&[post("One", "same", 1), post("Two", "same", 2), post("Three", "other", 3)])
        .await
        .unwrap();

    assert_eq!(result.inserted_count(), 2);
    assert!(!result.is_complete());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].index, 1);
    assert_eq!(result.failures[0].error.code, ErrorCode::DUPLICATE_KEY_ERROR);

    let stored = posts.find_many(&Filter::All, &FindOptions::default()).await.unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn missing_required_field_is_a_validation_error() {
    let db = setup_db().await;
    let err = db
        .crud::<Document>(POSTS)
        .unwrap()
        .insert(&json!({ "slug": "untitled" }))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::VALIDATION_ERROR);
}

#[tokio::test]
async fn unknown_collection_is_rejected() {
    let db = setup_db().await;
    let err = db.crud::<Document>("comments").err().unwrap();
    assert_eq!(err.code, ErrorCode::COLLECTION_NOT_FOUND);
}

#[tokio::test]
async fn failed_transaction_rolls_back_every_write() {
    let db = setup_db().await;

    let result: Result<(), DatabaseError> = db
        .transaction(|tx| async move {
            assert!(tx.is_native());
            let posts = tx.crud::<Post>(POSTS)?;
            posts.insert(&post("Doomed", "doomed", 0)).await?;
            Err(DatabaseError::new(ErrorCode::VALIDATION_ERROR, "abort"))
        })
        .await;
    assert_eq!(result.unwrap_err().code, ErrorCode::VALIDATION_ERROR);

    let posts = db.crud::<Post>(POSTS).unwrap();
    assert_eq!(posts.count(&Filter::All).await.unwrap(), 0);
}

#[tokio::test]
async fn successful_transaction_commits_and_invalidates_cached_reads() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    assert_eq!(posts.count(&Filter::All).await.unwrap(), 0);

    let id = db
        .transaction(|tx| async move {
            let created = tx.crud::<Post>(POSTS)?.insert(&post("Kept", "kept", 1)).await?;
            Ok(created.base.id)
        })
        .await
        .unwrap();

    assert_eq!(posts.count(&Filter::All).await.unwrap(), 1);
    assert!(posts.find_by_id(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn batch_failure_rolls_back_earlier_operations() {
    let db = setup_db().await;
    let missing = db.utils().generate_id();

    let err = db
        .batch()
        .execute(vec![
            BatchOperation::Insert {
                collection: POSTS.to_string(),
                data: serde_json::from_value(json!({ "title": "First", "slug": "first" })).unwrap(),
            },
            BatchOperation::Update {
                collection: POSTS.to_string(),
                id: missing,
                changes: serde_json::from_value(json!({ "views": 1 })).unwrap(),
            },
        ])
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::BATCH_ERROR);
    let details = err.details.unwrap();
    assert_eq!(details["failedIndex"], 1);
    assert_eq!(details["operation"], "update");
    assert_eq!(details["cause"], "NOT_FOUND");
    assert_eq!(db.crud::<Post>(POSTS).unwrap().count(&Filter::All).await.unwrap(), 0);
}

#[tokio::test]
async fn reads_are_cached_until_a_write_invalidates_them() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    posts.insert(&post("A", "a", 1)).await.unwrap();

    let all = FindOptions::default();
    assert_eq!(posts.find_many(&Filter::All, &all).await.unwrap().len(), 1);
    assert_eq!(posts.find_many(&Filter::All, &all).await.unwrap().len(), 1);
    assert!(db.cache().stats().hits >= 1);

    posts.insert(&post("B", "b", 2)).await.unwrap();
    assert_eq!(posts.find_many(&Filter::All, &all).await.unwrap().len(), 2);
}

#[tokio::test]
async fn pages_follow_the_sort_and_cursor() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    for views in 1..=5 {
        let slug = format!("post-{views}");
        posts.insert(&post("Paged", &slug, views)).await.unwrap();
    }

    let first = db
        .query::<Post>(POSTS)
        .unwrap()
        .sort("views", SortDirection::Asc)
        .paginate(1, 2)
        .include_total_count(true)
        .execute()
        .await
        .unwrap();
    assert_eq!(first.items.iter().map(|p| p.views).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(first.total_count, Some(5));
    assert!(first.has_next_page);
    assert!(!first.has_previous_page);

    let second = db
        .query::<Post>(POSTS)
        .unwrap()
        .sort("views", SortDirection::Asc)
        .after(first.next_cursor.unwrap())
        .limit(2)
        .execute()
        .await
        .unwrap();
    assert_eq!(second.items.iter().map(|p| p.views).collect::<Vec<_>>(), vec![3, 4]);

    let last = db
        .query::<Post>(POSTS)
        .unwrap()
        .sort("views", SortDirection::Desc)
        .paginate(3, 2)
        .execute()
        .await
        .unwrap();
    assert_eq!(last.items.len(), 1);
    assert!(!last.has_next_page);
    assert!(last.has_previous_page);
}

#[tokio::test]
async fn stream_yields_every_match_across_batches() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    for views in 0..7 {
        let slug = format!("s-{views}");
        posts.insert(&post("Streamed", &slug, views)).await.unwrap();
    }

    let views: Vec<i64> = db
        .query::<Post>(POSTS)
        .unwrap()
        .where_filter(Filter::gte("views", 2))
        .sort("views", SortDirection::Asc)
        .stream(2)
        .map(|item| item.unwrap().views)
        .collect()
        .await;
    assert_eq!(views, vec![2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn update_many_and_delete_many_report_counts() {
    let db = setup_db().await;
    let posts = db.crud::<Post>(POSTS).unwrap();
    posts
        .insert_many(&[post("x", "x", 1), post("y", "y", 1), post("z", "z", 9)])
        .await
        .unwrap();

    let updated = posts.update_many(&Filter::eq("views", 1), &json!({ "views": 2 })).await.unwrap();
    assert_eq!(updated.matched_count, 2);
    assert_eq!(posts.count(&Filter::eq("views", 2)).await.unwrap(), 2);

    let deleted = db.query::<Post>(POSTS).unwrap().where_eq("views", 2).delete_many().await.unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(posts.count(&Filter::All).await.unwrap(), 1);
}

#[tokio::test]
async fn health_check_reports_a_live_connection() {
    let db = setup_db().await;
    let report = db.health_check().await;
    assert!(report.healthy);
    assert!(report.error.is_none());
}

#[tokio::test]
async fn exhausted_connect_alerts_administrators() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/missing/strata.db", dir.path().display());
    let notifier = Arc::new(CapturingNotifier::default());
    let mut retry = RetryConfig::new(2);
    retry.initial_delay = std::time::Duration::from_millis(1);
    let resilience = Arc::new(ResilienceManager::new(retry, Arc::new(RecordingSleeper::new())));

    let db = Database::new(Arc::new(SqliteAdapter::new(ConnectionSettings::new(url))), notifier.clone())
        .with_resilience(resilience);

    assert!(db.connect().await.is_err());
    assert!(!db.is_connected());
    assert_eq!(notifier.alerts.lock().len(), 1);
    assert_eq!(db.resilience().metrics().failed_reconnections, 1);
}

#[tokio::test]
async fn file_backed_store_survives_reconnect_and_additive_schema_change() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("strata.db").display());

    let id = {
        let db = Database::new(
            Arc::new(SqliteAdapter::new(ConnectionSettings::new(url.clone()))),
            Arc::new(CapturingNotifier::default()),
        );
        db.connect().await.unwrap();
        db.initialize(&[posts_schema()]).await.unwrap();
        let created = db.crud::<Post>(POSTS).unwrap().insert(&post("Durable", "durable", 7)).await.unwrap();
        db.disconnect().await.unwrap();
        created.base.id
    };

    let db = Database::new(
        Arc::new(SqliteAdapter::new(ConnectionSettings::new(url))),
        Arc::new(CapturingNotifier::default()),
    );
    db.connect().await.unwrap();
    let extended = posts_schema().field(FieldDefinition::new("published", FieldType::Boolean));
    db.initialize(&[extended]).await.unwrap();

    let posts = db.crud::<Document>(POSTS).unwrap();
    let stored = posts.find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(stored["title"], "Durable");
    assert_eq!(stored["views"], 7);
    assert!(stored.get("published").is_none_or(|v| v.is_null()));

    let updated = posts.update(&id, &json!({ "published": true })).await.unwrap();
    assert_eq!(updated["published"], true);
}
