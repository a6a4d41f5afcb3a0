use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use sandpiper::auth::Hasher;
use sandpiper::config::ServerConfig;
use sandpiper::credentials::SyncKey;
use sandpiper::server::{AppState, create_router};
use sandpiper::store::{SqliteStore, Store};
use sandpiper::types::{Company, Role, ServerRole, Settings, User};
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const ADMIN_USER: &str = "admin";
pub const PASSWORD: &str = "correct horse battery staple";
pub const JWT_SECRET: &str = "integration-test-signing-secret-0123456789";

/// A server running in-process on an ephemeral port, backed by a throwaway
/// database.
pub struct TestServer {
    pub temp_dir: TempDir,
    pub base_url: String,
    pub store: Arc<SqliteStore>,
    pub settings: Settings,
    /// The company that runs this server; owns the super admin.
    pub company: Company,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(role: ServerRole) -> Self {
        Self::start_with_key(role, None).await
    }

    pub async fn start_with_key(role: ServerRole, sync_key: Option<&SyncKey>) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let config = ServerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            jwt_secret: JWT_SECRET.to_string(),
            sync_key: sync_key.map(SyncKey::to_base64),
            ..ServerConfig::default()
        };

        let store = Arc::new(SqliteStore::new(config.db_path()).expect("open store"));
        store.initialize().expect("initialize store");
        let settings = Settings {
            server_role: role,
            server_id: Uuid::new_v4(),
        };
        store.save_settings(&settings).expect("save settings");

        let name = match role {
            ServerRole::Primary => "Publisher",
            ServerRole::Secondary => "Receiver",
        };
        let company = new_company(name);
        store.create_company(&company).expect("create company");

        create_user(&store, company.id, ADMIN_USER, Role::SuperAdmin);

        let state = Arc::new(AppState::new(store.clone(), &config).expect("build app state"));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let app = create_router(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            temp_dir,
            base_url: format!("http://127.0.0.1:{port}"),
            store,
            settings,
            company,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    pub fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn add_company(&self, name: &str) -> Company {
        let company = new_company(name);
        self.store.create_company(&company).expect("create company");
        company
    }

    pub fn add_user(&self, company_id: Uuid, username: &str, role: Role) -> User {
        create_user(&self.store, company_id, username, role)
    }

    pub async fn login(&self, username: &str) -> String {
        let resp: Value = reqwest::Client::new()
            .post(self.url("/login"))
            .json(&serde_json::json!({ "username": username, "password": PASSWORD }))
            .send()
            .await
            .expect("login request")
            .json()
            .await
            .expect("parse login response");
        resp["token"].as_str().expect("token in response").to_string()
    }

    pub async fn admin_token(&self) -> String {
        self.login(ADMIN_USER).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn new_company(name: &str) -> Company {
    let now = Utc::now();
    Company {
        id: Uuid::new_v4(),
        name: name.to_string(),
        sync_addr: String::new(),
        sync_api_key: String::new(),
        active: true,
        created_at: now,
        updated_at: now,
    }
}

fn create_user(store: &SqliteStore, company_id: Uuid, username: &str, role: Role) -> User {
    let user = User {
        id: Uuid::new_v4(),
        company_id,
        username: username.to_string(),
        email: format!("{username}@example.com"),
        password_hash: Hasher::new().hash(PASSWORD).expect("hash password"),
        role,
        active: true,
        created_at: Utc::now(),
    };
    store.create_user(&user).expect("create user");
    user
}
