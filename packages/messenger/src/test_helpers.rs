use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chat_hub::{Hub, HubConfig};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use crate::AppState;
use crate::config::{MessagesConfig, MessengerConfig, UploadsConfig, WebSocketConfig};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::reconcile::ReadReconciler;
use crate::repository::ChatRepository;
use crate::uploads::UploadService;

/// Build a fully-wired `AppState` backed by an in-memory SQLite database and
/// a running hub.
///
/// Returns `(AppState, TempDir)`; callers must hold the `TempDir` for the
/// lifetime of the test so the data directory stays valid.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = MessengerConfig::new(Some(tmp.path().to_path_buf())).expect("config");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("pragma");

    let db = Arc::new(Database { pool: pool.clone() });
    let repository = Arc::new(ChatRepository::new(pool));
    let hub = Hub::spawn(HubConfig::default());
    let reconciler = ReadReconciler::new(repository.clone(), hub.clone());
    let uploads = Arc::new(
        UploadService::new(&UploadsConfig::default(), repository.clone()).expect("uploads"),
    );

    let state = AppState {
        config: Arc::new(config),
        messages_config: Arc::new(MessagesConfig::default()),
        ws_config: Arc::new(WebSocketConfig::default()),
        metrics: Arc::new(ServerMetrics::new()),
        db,
        repository,
        hub,
        reconciler,
        uploads,
    };

    (state, tmp)
}

/// Send one request through `app`, as `user` when given, and decode the JSON
/// response body (`Value::Null` when empty).
pub async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<i64>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user_id) = user {
        builder = builder.header(header::COOKIE, format!("user_id={user_id}"));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

type Objects = Arc<Mutex<HashMap<String, (String, Vec<u8>)>>>;

/// Minimal path-style S3 stand-in: PUT, GET and HEAD on
/// `/{bucket}/uploads/{name}`. Signatures are not checked.
pub struct FakeObjectStore {
    pub addr: SocketAddr,
    objects: Objects,
}

impl FakeObjectStore {
    pub async fn start() -> Self {
        let objects: Objects = Arc::default();
        let app = Router::new()
            .route(
                "/{bucket}/uploads/{name}",
                get(get_object).head(head_object).put(put_object),
            )
            .with_state(objects.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, objects }
    }

    /// Store an object as if a client had PUT it.
    pub fn put(&self, key: &str, content_type: &str, body: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (content_type.to_string(), body));
    }

    /// A valid PNG of the given size.
    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        image::RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }
}

fn object_key(name: &str) -> String {
    format!("uploads/{name}")
}

async fn put_object(
    State(objects): State<Objects>,
    Path((_bucket, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    objects
        .lock()
        .unwrap()
        .insert(object_key(&name), (content_type, body.to_vec()));
    StatusCode::OK
}

async fn get_object(
    State(objects): State<Objects>,
    Path((_bucket, name)): Path<(String, String)>,
) -> Response {
    match objects.lock().unwrap().get(&object_key(&name)) {
        Some((content_type, body)) => {
            ([(header::CONTENT_TYPE, content_type.clone())], body.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn head_object(
    State(objects): State<Objects>,
    Path((_bucket, name)): Path<(String, String)>,
) -> Response {
    match objects.lock().unwrap().get(&object_key(&name)) {
        Some((content_type, body)) => [
            (header::CONTENT_TYPE, content_type.clone()),
            (header::CONTENT_LENGTH, body.len().to_string()),
        ]
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Point `state`'s upload service at `store`.
pub fn with_object_store(mut state: AppState, store: &FakeObjectStore) -> AppState {
    let config = UploadsConfig {
        endpoint: format!("http://{}", store.addr),
        access_key: "test".into(),
        secret_key: "test-secret".into(),
        ..Default::default()
    };
    state.uploads = Arc::new(UploadService::new(&config, state.repository.clone()).unwrap());
    state
}
