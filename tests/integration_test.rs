use cushion_adapter::engine::{Fixtures, MemCluster};
use cushion_adapter::sdk::model::downcast;
use cushion_adapter::sdk::query::ViewKey;
use cushion_adapter::sdk::{Cushion, Installer, Keys, Model, ModelRegistry, OptionSet, Query, Search, Verb, ViewSearch};
use cushion_adapter::{DocumentReader, DocumentWriter, Error, SharedBucket};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
struct Post {
    id: u64,
    author: String,
    text: String,
    #[serde(default)]
    loc: Option<[f64; 2]>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
struct Setting {
    id: u64,
    name: String,
    value: u64,
}

fn options() -> OptionSet {
    let mut options = OptionSet::new();
    options.host = Some("couchbase://localhost".to_string());
    options.bucket = Some("posts".to_string());
    options
}

fn registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry.register_record::<Post>("Post");
    registry
}

async fn seeded(cluster: &MemCluster, options: OptionSet) -> Cushion {
    let cushion = Installer::new(options).connect(cluster, registry()).unwrap();
    let adapter = cushion.adapter();
    adapter
        .save("post::1", json!({"id": 1, "author": "ann", "text": "first", "loc": [4.9, 52.3]}))
        .await
        .unwrap();
    adapter
        .save("post::2", json!({"id": 2, "author": "bob", "text": "second", "loc": [13.4, 52.5]}))
        .await
        .unwrap();
    adapter
        .save("post::3", json!({"id": 3, "author": "ann", "text": "third"}))
        .await
        .unwrap();

    let bucket = cluster.bucket("posts").unwrap();
    bucket.define_field_view("posts", "by_author", "author").unwrap();
    bucket.define_field_view("posts", "by_id", "id").unwrap();
    bucket
        .define_spatial(
            "geo",
            "points",
            Arc::new(|_: &str, doc: &Value| -> Option<([f64; 2], Value)> {
                let loc = doc.get("loc")?.as_array()?;
                Some(([loc.first()?.as_f64()?, loc.get(1)?.as_f64()?], doc.clone()))
            }),
        )
        .unwrap();
    cushion
}

/// Serves one canned HTTP response and hands back the request line.
async fn serve_once(body: &'static str) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await.unwrap();
        loop {
            let mut header = String::new();
            let n = reader.read_line(&mut header).await.unwrap();
            if n == 0 || header == "\r\n" {
                break;
            }
        }

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        writer.write_all(response.as_bytes()).await.unwrap();
        writer.shutdown().await.unwrap();
        let _ = tx.send(request_line);
    });

    (format!("http://{}/query/service", addr), rx)
}

#[tokio::test]
async fn test_get_many_from_view() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let methods = cushion.methods().unwrap();

    let search = ViewSearch::new("by_author").design_doc("posts").key("ann");
    let found = methods.get_many("Post", search, None).await.unwrap();

    let texts: Vec<String> = found
        .models
        .into_iter()
        .map(|m| downcast::<Post>(m).unwrap().into_inner().text)
        .collect();
    assert_eq!(texts, vec!["first", "third"]);
    assert_eq!(found.response["total_rows"], json!(3));
}

#[tokio::test]
async fn test_get_one_by_model_key() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let methods = cushion.methods().unwrap();

    let bob = methods
        .one_from_view("Post", ViewSearch::new("by_author").design_doc("posts").key("bob"), None)
        .await
        .unwrap()
        .models
        .unwrap();

    let search = ViewSearch::new("by_id").design_doc("posts").key(ViewKey::Model(&*bob));
    let again = methods.get_one("Post", search, None).await.unwrap();
    assert_eq!(again.models.unwrap().id(), Some(json!(2)));
}

#[tokio::test]
async fn test_multi_key_view_search() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let methods = cushion.methods().unwrap();

    let search = ViewSearch::new("by_id").design_doc("posts").keys(vec![json!(3), json!(1)]);
    let found = methods.from_view("Post", search, None).await.unwrap();
    let ids: Vec<Option<Value>> = found.models.iter().map(|m| m.id()).collect();
    assert_eq!(ids, vec![Some(json!(1)), Some(json!(3))]);
}

#[tokio::test]
async fn test_spatial_search_from_plain_object() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let methods = cushion.methods().unwrap();

    let search = Search::classify(json!({"ddoc": "geo", "name": "points", "bbox": [0.0, 50.0, 10.0, 55.0]})).unwrap();
    let found = methods.get_many("Post", search, None).await.unwrap();
    assert_eq!(found.models.len(), 1);
    assert_eq!(found.models[0].id(), Some(json!(1)));
}

#[tokio::test]
async fn test_query_descriptor_from_builders() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let builders = cushion.builders().unwrap();
    let methods = cushion.methods().unwrap();

    let query = builders.view("posts", "by_author").key("ann").limit(1);
    let found = methods.from_query("Post", Query::View(query), None).await.unwrap();
    assert_eq!(found.models.len(), 1);
    assert_eq!(found.models[0].id(), Some(json!(1)));

    let query = builders.view("posts", "by_author").key("nobody");
    let none = methods.one_from_query("Post", query.into(), None).await.unwrap();
    assert!(none.models.is_none());
}

#[tokio::test]
async fn test_n1ql_against_bucket() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let methods = cushion.methods().unwrap();

    let statement = "SELECT p.* FROM posts p WHERE p.author = 'bob'";
    cluster
        .bucket("posts")
        .unwrap()
        .stub_statement(statement, vec![json!({"id": 2, "author": "bob", "text": "second"})])
        .unwrap();

    let found = methods.n1ql("Post", statement, None).await.unwrap();
    let post = downcast::<Post>(found.models.into_iter().next().unwrap()).unwrap();
    assert_eq!(post.data().author, "bob");
}

#[tokio::test]
async fn test_unknown_model_kind_fails_before_querying() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let methods = cushion.methods().unwrap();

    // The view does not exist, so reaching the bucket would be a query error.
    let res = methods.get_many("Comment", "no_such_view", None).await;
    assert!(matches!(res, Err(Error::ModelNotFound(name)) if name == "Comment"));

    let res = methods.get_many("Post", "no_such_view", None).await;
    assert!(matches!(res, Err(Error::Query(_))));
}

#[tokio::test]
async fn test_hydrated_model_saves_to_its_bucket() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let methods = cushion.methods().unwrap();

    let other = cluster.bucket("archive").unwrap();
    other.define_field_view("posts", "by_id", "id").unwrap();
    other
        .upsert("post::9", json!({"id": 9, "author": "cy", "text": "old"}))
        .await
        .unwrap();
    let archived: SharedBucket = other.clone();

    let found = methods
        .one_from_view("Post", ViewSearch::new("by_id").design_doc("posts").key(json!(9)), Some(&archived))
        .await
        .unwrap();
    let mut post = downcast::<Post>(found.models.unwrap()).unwrap();
    assert_eq!(post.bucket().name(), "archive");

    post.data_mut().text = "restored".to_string();
    post.save("post::9").await.unwrap();

    assert_eq!(other.get("post::9").await.unwrap().value["text"], json!("restored"));
    assert!(cushion.adapter().get("post::9").await.is_err());
}

#[tokio::test]
async fn test_n1ql_through_query_service() {
    let (endpoint, request) = serve_once(r#"{"results":[{"id":7,"author":"dee","text":"remote"}],"status":"success"}"#).await;
    let mut options = options();
    options.query_endpoints = vec![endpoint];

    let cluster = MemCluster::new();
    let cushion = Installer::new(options).connect(&cluster, registry()).unwrap();
    let methods = cushion.methods().unwrap();

    let found = methods.n1ql("Post", "SELECT * FROM posts", None).await.unwrap();
    assert_eq!(found.models.len(), 1);
    assert_eq!(found.models[0].id(), Some(json!(7)));

    let request_line = request.await.unwrap();
    assert!(request_line.starts_with("GET /query/service?statement=SELECT"));
}

#[tokio::test]
async fn test_query_service_text_body() {
    let (endpoint, _request) = serve_once("not json at all").await;
    let mut options = options();
    options.query_endpoints = vec![endpoint];

    let cluster = MemCluster::new();
    let cushion = Installer::new(options).connect(&cluster, registry()).unwrap();
    let raw = cushion.methods().unwrap().raw_query("SELECT 1", None).await.unwrap();
    assert_eq!(raw, Some(json!("not json at all")));
}

#[tokio::test]
async fn test_batches_persist_through_fixtures() {
    let dir = tempfile::tempdir().unwrap();
    let keys = Keys::from(["post::1", "post::2"]);

    {
        let cluster = MemCluster::with_fixtures(Arc::new(Fixtures::new(dir.path()).unwrap())).unwrap();
        let cushion = Installer::new(options()).connect(&cluster, registry()).unwrap();
        cushion
            .adapter()
            .save(keys.clone(), json!({"id": 0, "author": "batch", "text": "same"}))
            .await
            .unwrap();
        cluster.flush("posts").unwrap();
    }

    let cluster = MemCluster::with_fixtures(Arc::new(Fixtures::new(dir.path()).unwrap())).unwrap();
    let cushion = Installer::new(options()).connect(&cluster, registry()).unwrap();
    let fetched = serde_json::to_value(cushion.adapter().get(keys).await.unwrap()).unwrap();
    assert_eq!(fetched["post::1"]["value"]["author"], json!("batch"));
    assert_eq!(fetched["post::2"]["value"]["author"], json!("batch"));
}

#[tokio::test]
async fn test_documents_with_value_field_from_view_and_n1ql() {
    let cluster = MemCluster::new();
    let mut registry = ModelRegistry::new();
    registry.register_record::<Setting>("Setting");
    let cushion = Installer::new(options()).connect(&cluster, registry).unwrap();
    let methods = cushion.methods().unwrap();

    let doc = json!({"id": 1, "name": "retries", "value": 5});
    cushion.adapter().save("setting::1", doc.clone()).await.unwrap();
    let bucket = cluster.bucket("posts").unwrap();
    bucket.define_field_view("settings", "by_name", "name").unwrap();

    let search = ViewSearch::new("by_name").design_doc("settings").key("retries");
    let found = methods.get_many("Setting", search, None).await.unwrap();
    assert_eq!(found.models.len(), 1);
    let setting = downcast::<Setting>(found.models.into_iter().next().unwrap()).unwrap();
    assert_eq!(setting.data(), &Setting { id: 1, name: "retries".to_string(), value: 5 });

    let statement = "SELECT s.* FROM posts s WHERE s.name = 'retries'";
    bucket.stub_statement(statement, vec![doc]).unwrap();
    let found = methods.n1ql("Setting", statement, None).await.unwrap();
    let setting = downcast::<Setting>(found.models.into_iter().next().unwrap()).unwrap();
    assert_eq!(setting.data().value, 5);
}

#[tokio::test]
async fn test_opaque_view_query_end_to_end() {
    let cluster = MemCluster::new();
    let cushion = seeded(&cluster, options()).await;
    let methods = cushion.methods().unwrap();

    let search = Search::classify(json!({"from": ["posts", "by_author"], "key": "ann", "keys": null})).unwrap();
    let found = methods.get_many("Post", search, None).await.unwrap();
    let ids: Vec<Option<Value>> = found.models.iter().map(|m| m.id()).collect();
    assert_eq!(ids, vec![Some(json!(1)), Some(json!(3))]);

    let search = Search::classify(json!({"from": ["posts", "by_id"], "key": null, "keys": [2]})).unwrap();
    let found = methods.get_many("Post", search, None).await.unwrap();
    assert_eq!(found.models.len(), 1);
    assert_eq!(found.models[0].id(), Some(json!(2)));
}

#[tokio::test]
async fn test_query_endpoints_set_after_install() {
    let (endpoint, request) = serve_once(r#"{"results":[{"id":8,"author":"eve","text":"late"}],"status":"success"}"#).await;

    let cluster = MemCluster::new();
    let cushion = Installer::new(options()).connect(&cluster, registry()).unwrap();
    let methods = cushion.methods().unwrap();
    cushion.adapter().set_option("query_endpoints", json!([endpoint])).unwrap();

    let found = methods.n1ql("Post", "SELECT * FROM posts", None).await.unwrap();
    assert_eq!(found.models[0].id(), Some(json!(8)));
    assert!(request.await.unwrap().starts_with("GET /query/service?"));
}

#[tokio::test]
async fn test_failed_batch_still_persists_its_writes() {
    let dir = tempfile::tempdir().unwrap();

    {
        let cluster = MemCluster::with_fixtures(Arc::new(Fixtures::new(dir.path()).unwrap())).unwrap();
        let cushion = Installer::new(options()).connect(&cluster, registry()).unwrap();
        let adapter = cushion.adapter();
        adapter.save("post::2", json!({"id": 2, "author": "bob", "text": "kept"})).await.unwrap();

        let keys = Keys::from(["post::1", "post::2", "post::3"]);
        let res = adapter
            .run(Verb::Insert, keys, Some(json!({"id": 0, "author": "batch", "text": "new"})))
            .await;
        assert!(matches!(res, Err(Error::KeyExists(k)) if k == "post::2"));

        adapter.settle().await;
        cluster.flush("posts").unwrap();
    }

    let cluster = MemCluster::with_fixtures(Arc::new(Fixtures::new(dir.path()).unwrap())).unwrap();
    let bucket = cluster.bucket("posts").unwrap();
    assert_eq!(bucket.get("post::1").await.unwrap().value["author"], json!("batch"));
    assert_eq!(bucket.get("post::2").await.unwrap().value["text"], json!("kept"));
    assert_eq!(bucket.get("post::3").await.unwrap().value["author"], json!("batch"));
}
