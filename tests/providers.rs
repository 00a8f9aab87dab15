use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use catalogue_bot::cache::{CacheKind, ResponseCache};
use catalogue_bot::config::{ElasticConfig, OpenAiConfig};
use catalogue_bot::elastic::ElasticBackend;
use catalogue_bot::embedding::OpenAiProvider;
use catalogue_core::backend::{SearchBackend, SearchRequest};
use catalogue_core::embedding::EmbeddingProvider;
use catalogue_core::filter::Filter;
use catalogue_core::models::SearchMode;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Answers `fail_first` requests with `fail_status`, then with `ok_body`.
struct Mock {
    hits: AtomicUsize,
    fail_first: usize,
    fail_status: StatusCode,
    ok_body: Value,
    bodies: Mutex<Vec<Value>>,
}

impl Mock {
    fn new(fail_first: usize, fail_status: StatusCode, ok_body: Value) -> Arc<Self> {
        Arc::new(Self {
            hits: AtomicUsize::new(0),
            fail_first,
            fail_status,
            ok_body,
            bodies: Mutex::new(Vec::new()),
        })
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn mock_handler(State(mock): State<Arc<Mock>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let n = mock.hits.fetch_add(1, Ordering::SeqCst);
    mock.bodies.lock().unwrap().push(body);
    if n < mock.fail_first {
        return (mock.fail_status, Json(json!({"error": "try later"})));
    }
    (StatusCode::OK, Json(mock.ok_body.clone()))
}

async fn serve(path: &str, mock: Arc<Mock>) -> String {
    let app = Router::new()
        .route(path, post(mock_handler))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn openai_config(base_url: String) -> OpenAiConfig {
    OpenAiConfig {
        base_url,
        max_retries: 3,
        ..OpenAiConfig::default()
    }
}

fn embedding_response() -> Value {
    json!({"data": [{"index": 0, "embedding": [0.25, 0.5, -1.0]}]})
}

async fn open_cache(tmp: &TempDir) -> ResponseCache {
    ResponseCache::open(&tmp.path().join("data").join("cache.sqlite"))
        .await
        .unwrap()
}

// ============ OpenAI ============

#[tokio::test]
async fn test_embedding_retries_then_caches() {
    let tmp = TempDir::new().unwrap();
    let cache = open_cache(&tmp).await;
    let mock = Mock::new(2, StatusCode::SERVICE_UNAVAILABLE, embedding_response());
    let base = serve("/embeddings", mock.clone()).await;

    let provider = OpenAiProvider::new(&openai_config(base), "test-key".into())
        .unwrap()
        .with_backoff_base(Duration::from_millis(1))
        .with_cache(cache.clone());

    let vector = provider.embed("Goethe Faust").await.unwrap();
    assert_eq!(vector, vec![0.25, 0.5, -1.0]);
    assert_eq!(mock.hits(), 3, "two 503s, then success");

    let again = provider.embed("Goethe Faust").await.unwrap();
    assert_eq!(again, vector);
    assert_eq!(mock.hits(), 3, "second call is served from cache");
    assert_eq!(cache.count(CacheKind::Embedding).await.unwrap(), 1);

    let sent = mock.bodies.lock().unwrap()[0].clone();
    assert_eq!(sent["model"], "text-embedding-3-small");
    assert_eq!(sent["input"][0], "Goethe Faust");
}

#[tokio::test]
async fn test_client_error_fails_fast() {
    let mock = Mock::new(usize::MAX, StatusCode::BAD_REQUEST, embedding_response());
    let base = serve("/embeddings", mock.clone()).await;
    let provider = OpenAiProvider::new(&openai_config(base), "test-key".into())
        .unwrap()
        .with_backoff_base(Duration::from_millis(1));

    let err = provider.embed("x").await.unwrap_err();
    assert!(err.to_string().contains("400"), "{}", err);
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let mock = Mock::new(usize::MAX, StatusCode::TOO_MANY_REQUESTS, embedding_response());
    let base = serve("/embeddings", mock.clone()).await;
    let provider = OpenAiProvider::new(&openai_config(base), "test-key".into())
        .unwrap()
        .with_backoff_base(Duration::from_millis(1));

    assert!(provider.embed("x").await.is_err());
    assert_eq!(mock.hits(), 4, "first attempt plus max_retries");
}

#[tokio::test]
async fn test_rewrite_uses_system_prompt_and_cache() {
    let tmp = TempDir::new().unwrap();
    let cache = open_cache(&tmp).await;
    let mock = Mock::new(
        0,
        StatusCode::OK,
        json!({"choices": [{"message": {"role": "assistant", "content": " glaciers alps "}}]}),
    );
    let base = serve("/chat/completions", mock.clone()).await;
    let provider = OpenAiProvider::new(&openai_config(base), "test-key".into())
        .unwrap()
        .with_cache(cache.clone());

    assert_eq!(
        provider.rewrite_query("books about alpine glaciers").await.unwrap(),
        "glaciers alps"
    );
    assert_eq!(
        provider.rewrite_query("books about alpine glaciers").await.unwrap(),
        "glaciers alps"
    );
    assert_eq!(mock.hits(), 1);
    assert_eq!(cache.count(CacheKind::Rewrite).await.unwrap(), 1);

    let sent = mock.bodies.lock().unwrap()[0].clone();
    assert_eq!(sent["model"], "gpt-4o");
    assert_eq!(sent["messages"][0]["role"], "system");
    assert_eq!(sent["messages"][1]["content"], "books about alpine glaciers");
}

// ============ Elasticsearch ============

fn es_response() -> Value {
    json!({
        "hits": {
            "total": {"value": 42, "relation": "eq"},
            "hits": [{
                "_id": "991170525505504",
                "_score": 3.5,
                "_source": {
                    "title": ["Faust", "Faust. Eine Tragödie"],
                    "persons": {"author": [{"name": "Goethe", "date": "1749-1832"}]},
                    "mapping": {"recordIdentifier": ["(EXLNZ-41SLSP_NETWORK)991082852209791"]},
                    "embedding_marc": [0.1, 0.2]
                }
            }]
        }
    })
}

#[tokio::test]
async fn test_elastic_retries_gateway_errors() {
    let mock = Mock::new(1, StatusCode::BAD_GATEWAY, es_response());
    let url = serve("/ubcat/_search", mock.clone()).await;
    let backend = ElasticBackend::new(
        &ElasticConfig {
            url,
            index: "ubcat".into(),
            retries: 2,
        },
        None,
    )
    .unwrap()
    .with_backoff_base(Duration::from_millis(1));

    let filter: Filter = [("library".to_string(), "UBS".to_string())].into_iter().collect();
    let page = backend
        .search(&SearchRequest {
            query: "faust",
            filter: &filter,
            vector: None,
            mode: SearchMode::Simple,
            offset: 9,
            limit: 9,
        })
        .await
        .unwrap();

    assert_eq!(mock.hits(), 2);
    assert_eq!(page.total, 42);
    let doc = &page.docs[0];
    assert_eq!(doc.title, "Faust");
    assert_eq!(doc.score, 3.5);
    assert_eq!(doc.persons["author"][0].name, "Goethe");
    assert_eq!(doc.record_identifiers.len(), 1);
    assert_eq!(doc.embedding_marc.as_deref(), Some(&[0.1f32, 0.2][..]));

    let sent = mock.bodies.lock().unwrap()[1].clone();
    assert_eq!(sent["from"], 9);
    assert_eq!(sent["query"]["bool"]["filter"][0]["match"]["library"], "UBS");
}

#[tokio::test]
async fn test_elastic_bad_request_is_not_retried() {
    let mock = Mock::new(usize::MAX, StatusCode::BAD_REQUEST, es_response());
    let url = serve("/ubcat/_search", mock.clone()).await;
    let backend = ElasticBackend::new(
        &ElasticConfig {
            url,
            index: "ubcat".into(),
            retries: 3,
        },
        Some("secret".into()),
    )
    .unwrap()
    .with_backoff_base(Duration::from_millis(1));

    let err = backend.get_documents(&["x".to_string()]).await.unwrap_err();
    assert!(err.to_string().contains("400"), "{}", err);
    assert_eq!(mock.hits(), 1);
}

// ============ Cache ============

#[tokio::test]
async fn test_cache_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let cache = open_cache(&tmp).await;
        cache
            .put(CacheKind::Rewrite, "gpt-4o", "question", "answer")
            .await
            .unwrap();
        cache.close().await;
    }
    let cache = open_cache(&tmp).await;
    assert_eq!(
        cache.get(CacheKind::Rewrite, "gpt-4o", "question").await.unwrap(),
        Some("answer".to_string())
    );
    assert_eq!(
        cache.get(CacheKind::Rewrite, "gpt-4", "question").await.unwrap(),
        None,
        "model is part of the key"
    );
    assert_eq!(cache.get(CacheKind::Embedding, "gpt-4o", "question").await.unwrap(), None);
}
