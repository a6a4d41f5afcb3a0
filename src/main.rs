use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sandpiper::auth::Hasher;
use sandpiper::config::ServerConfig;
use sandpiper::credentials::{Credentials, SyncKey};
use sandpiper::server::{AppState, create_router};
use sandpiper::store::{SqliteStore, Store};
use sandpiper::types::{Company, Role, ServerRole, Settings, Subscription, User};

#[derive(Parser)]
#[command(name = "sandpiper")]
#[command(about = "A federation server for syncing slices between partners", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(long, short, default_value = "8080")]
        port: u16,

        #[command(flatten)]
        data: DataDir,

        /// Allow remote calls to run for up to an hour
        #[arg(long)]
        debug: bool,

        /// Base64 AES-256 key sealing primaries' sync credentials
        #[arg(long, env = "SANDPIPER_KEY", hide_env_values = true)]
        sync_key: Option<String>,

        /// Secret used to sign access and refresh tokens
        #[arg(long, env = "SANDPIPER_JWT_SECRET", hide_env_values = true)]
        jwt_secret: String,
    },
}

#[derive(Args)]
struct DataDir {
    /// Data directory for the database
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
}

impl DataDir {
    fn open(&self) -> anyhow::Result<SqliteStore> {
        let config = ServerConfig {
            data_dir: self.data_dir.clone(),
            ..ServerConfig::default()
        };
        let db_path = config.db_path();
        if !db_path.exists() {
            bail!("Server not initialized. Run 'sandpiper admin init' first to create the database.");
        }
        let store = SqliteStore::new(&db_path)?;
        store.initialize()?;
        Ok(store)
    }
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Initialize the server (create database, settings, and first admin)
    Init {
        #[command(flatten)]
        data: DataDir,

        /// Whether this server publishes (primary) or subscribes (secondary)
        #[arg(long)]
        role: ServerRole,

        /// Name of the company running this server
        #[arg(long)]
        company: String,

        /// Username for the initial super admin
        #[arg(long, default_value = "admin")]
        username: String,

        /// Password for the initial super admin (prompted when omitted)
        #[arg(long)]
        password: Option<String>,

        /// Skip interactive prompts
        #[arg(long)]
        non_interactive: bool,
    },

    /// Register a company
    AddCompany {
        #[command(flatten)]
        data: DataDir,

        #[arg(long)]
        name: String,
    },

    /// Create a user within a company
    AddUser {
        #[command(flatten)]
        data: DataDir,

        /// Company the user belongs to
        #[arg(long)]
        company: String,

        #[arg(long)]
        username: String,

        /// One of super_admin, admin, company_admin, sync_user
        #[arg(long, default_value = "company_admin")]
        role: Role,

        #[arg(long, default_value = "")]
        email: String,

        /// Password (prompted when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Register a primary this secondary syncs from
    AddPrimary {
        #[command(flatten)]
        data: DataDir,

        /// Company name of the primary
        #[arg(long)]
        name: String,

        /// Base URL of the primary, e.g. https://sandpiper.example.com
        #[arg(long)]
        addr: String,

        /// Username this server logs into the primary with
        #[arg(long)]
        username: String,

        /// Password for that user (prompted when omitted)
        #[arg(long)]
        password: Option<String>,

        /// Base64 AES-256 key sealing the stored credentials
        #[arg(long, env = "SANDPIPER_KEY", hide_env_values = true)]
        sync_key: String,
    },

    /// Subscribe a company to a slice on this primary
    Subscribe {
        #[command(flatten)]
        data: DataDir,

        /// Subscribing company
        #[arg(long)]
        company: String,

        /// Slice name
        #[arg(long)]
        slice: String,

        /// Subscription name (defaults to "<company>-<slice>")
        #[arg(long)]
        name: Option<String>,
    },

    /// Print a fresh sync key
    GenKey,
}

fn prompt_password(given: Option<String>, non_interactive: bool) -> anyhow::Result<String> {
    if let Some(password) = given {
        return Ok(password);
    }
    if non_interactive {
        bail!("--password is required with --non-interactive");
    }
    let password = inquire::Password::new("Password:")
        .with_validator(|input: &str| {
            if input.is_empty() {
                Err("Password cannot be empty".into())
            } else {
                Ok(inquire::validator::Validation::Valid)
            }
        })
        .prompt()?;
    Ok(password)
}

fn new_company(name: &str) -> Company {
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

fn find_company(store: &SqliteStore, name: &str) -> anyhow::Result<Company> {
    store
        .company_by_name(name)?
        .with_context(|| format!("company '{name}' not found"))
}

fn create_user(
    store: &SqliteStore,
    company: &Company,
    username: &str,
    email: &str,
    role: Role,
    password: &str,
) -> anyhow::Result<User> {
    let user = User {
        id: Uuid::new_v4(),
        company_id: company.id,
        username: username.to_string(),
        email: email.to_string(),
        password_hash: Hasher::new().hash(password)?,
        role,
        active: true,
        created_at: Utc::now(),
    };
    store.create_user(&user)?;
    Ok(user)
}

fn run_init(
    data_dir: PathBuf,
    role: ServerRole,
    company: String,
    username: String,
    password: Option<String>,
    non_interactive: bool,
) -> anyhow::Result<()> {
    fs::create_dir_all(&data_dir)?;
    let config = ServerConfig {
        data_dir,
        ..ServerConfig::default()
    };
    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;

    if let Some(settings) = store.settings()? {
        bail!(
            "Server already initialized as {} ({}).",
            settings.server_role,
            settings.server_id
        );
    }

    let password = prompt_password(password, non_interactive)?;
    let company = new_company(&company);
    store.create_company(&company)?;
    create_user(&store, &company, &username, "", Role::SuperAdmin, &password)?;

    let settings = Settings {
        server_role: role,
        server_id: Uuid::new_v4(),
    };
    store.save_settings(&settings)?;

    println!();
    println!("========================================");
    println!("Initialized {role} server {}", settings.server_id);
    println!("Company:     {}", company.name);
    println!("Super admin: {username}");
    println!("Database:    {}", config.db_path().display());
    println!("========================================");
    println!();

    Ok(())
}

fn run_admin(command: AdminCommands) -> anyhow::Result<()> {
    match command {
        AdminCommands::Init {
            data,
            role,
            company,
            username,
            password,
            non_interactive,
        } => run_init(data.data_dir, role, company, username, password, non_interactive),
        AdminCommands::AddCompany { data, name } => {
            let store = data.open()?;
            let company = new_company(&name);
            store.create_company(&company)?;
            println!("Created company '{}' ({})", company.name, company.id);
            Ok(())
        }
        AdminCommands::AddUser {
            data,
            company,
            username,
            role,
            email,
            password,
        } => {
            let store = data.open()?;
            let company = find_company(&store, &company)?;
            let password = prompt_password(password, false)?;
            let user = create_user(&store, &company, &username, &email, role, &password)?;
            println!("Created {} '{}' in '{}'", user.role, user.username, company.name);
            Ok(())
        }
        AdminCommands::AddPrimary {
            data,
            name,
            addr,
            username,
            password,
            sync_key,
        } => {
            let store = data.open()?;
            let key = SyncKey::from_base64(&sync_key)?;
            let password = prompt_password(password, false)?;
            let mut company = new_company(&name);
            company.sync_addr = addr.trim_end_matches('/').to_string();
            company.sync_api_key = Credentials::new(username, password).encrypt(&key)?;
            store.create_company(&company)?;
            println!("Registered primary '{}' ({})", company.name, company.id);
            println!("Start a sync with: POST /v1/sync/{}", company.id);
            Ok(())
        }
        AdminCommands::Subscribe {
            data,
            company,
            slice,
            name,
        } => {
            let store = data.open()?;
            let company = find_company(&store, &company)?;
            let slice = store.slice_by_name(&slice)?;
            let name = name.unwrap_or_else(|| format!("{}-{}", company.name, slice.name));
            let sub = Subscription::new(slice.id, company.id, name);
            store.add_subscription(&sub, &slice)?;
            println!("Subscribed '{}' to '{}' ({})", company.name, slice.name, sub.sub_id);
            Ok(())
        }
        AdminCommands::GenKey => {
            println!("{}", SyncKey::generate().to_base64());
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sandpiper=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => run_admin(command)?,
        Commands::Serve {
            host,
            port,
            data,
            debug,
            sync_key,
            jwt_secret,
        } => {
            let store = data.open()?;
            let config = ServerConfig {
                host,
                port,
                data_dir: data.data_dir,
                debug,
                sync_key,
                jwt_secret,
            };

            let state = Arc::new(AppState::new(Arc::new(store), &config)?);
            info!(
                role = %state.settings.server_role,
                server_id = %state.settings.server_id,
                "Loaded settings"
            );

            let app = create_router(state);
            let addr = config.socket_addr()?;

            info!("Starting server on {}", addr);

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
