use serde_json::json;
use shared::protocol::{Patch, Query};
use storage::Storage;

#[tokio::test]
async fn documents_survive_reopening_an_on_disk_database() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}/nested/chat.db", dir.path().display());

    let id = {
        let storage = Storage::new(&url).await.expect("open");
        storage
            .add_document("chats", &Patch::new().set("members", json!(["alice", "bob"])))
            .await
            .expect("add")
    };

    let reopened = Storage::new(&url).await.expect("reopen");
    reopened.health_check().await.expect("healthy");
    let docs = reopened
        .query_documents(&Query::collection("chats").where_array_contains("members", "bob"))
        .await
        .expect("query");
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, id);
}
