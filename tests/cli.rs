//! CLI integration tests for sandpiper admin commands.
//!
//! Each test uses an isolated temp directory for the database, ensuring tests
//! can run in parallel safely.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use std::path::Path;

use assert_cmd::Command;
use assert_fs::TempDir;
use predicates::prelude::*;
use sandpiper::credentials::{Credentials, SyncKey};
use sandpiper::store::{SqliteStore, Store};
use sandpiper::types::{Role, ServerRole, Slice, SliceType};

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    fn data_dir_str(&self) -> String {
        self.data_dir().to_string_lossy().to_string()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("sandpiper").expect("failed to find binary");
        cmd.env("NO_COLOR", "1").env_remove("SANDPIPER_KEY");
        cmd
    }

    fn admin(&self, args: &[&str]) -> Command {
        let mut cmd = self.cmd();
        cmd.arg("admin")
            .args(args)
            .args(["--data-dir", &self.data_dir_str()]);
        cmd
    }

    fn init(&self, role: &str) -> assert_cmd::assert::Assert {
        self.admin(&[
            "init",
            "--role",
            role,
            "--company",
            "Publisher",
            "--password",
            "s3cret",
            "--non-interactive",
        ])
        .assert()
    }

    fn store(&self) -> SqliteStore {
        SqliteStore::new(self.data_dir().join("sandpiper.db")).expect("open store")
    }
}

#[test]
fn test_gen_key_prints_usable_key() {
    let ctx = TestContext::new();
    let output = ctx
        .cmd()
        .args(["admin", "gen-key"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let key = String::from_utf8(output).unwrap();
    assert_eq!(key.trim().len(), 44);
    assert!(SyncKey::from_base64(key.trim()).is_ok());
}

#[test]
fn test_init_creates_settings_and_admin() {
    let ctx = TestContext::new();
    ctx.init("primary")
        .success()
        .stdout(predicate::str::contains("Initialized primary server"));

    let store = ctx.store();
    let settings = store.settings().unwrap().expect("settings row");
    assert_eq!(settings.server_role, ServerRole::Primary);

    let admin = store.user_by_username("admin").unwrap().expect("admin user");
    assert_eq!(admin.role, Role::SuperAdmin);
    assert!(store.company_by_name("publisher").unwrap().is_some());
}

#[test]
fn test_init_twice_fails() {
    let ctx = TestContext::new();
    ctx.init("secondary").success();
    ctx.init("secondary")
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn test_init_rejects_unknown_role() {
    let ctx = TestContext::new();
    ctx.init("tertiary")
        .failure()
        .stderr(predicate::str::contains("unknown server role"));
}

#[test]
fn test_init_non_interactive_requires_password() {
    let ctx = TestContext::new();
    ctx.admin(&[
        "init",
        "--role",
        "primary",
        "--company",
        "Publisher",
        "--non-interactive",
    ])
    .assert()
    .failure()
    .stderr(predicate::str::contains("--password is required"));
}

#[test]
fn test_commands_require_init() {
    let ctx = TestContext::new();
    ctx.admin(&["add-company", "--name", "Acme"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Server not initialized"));
}

#[test]
fn test_add_company_and_user() {
    let ctx = TestContext::new();
    ctx.init("primary").success();

    ctx.admin(&["add-company", "--name", "Acme"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created company 'Acme'"));
    ctx.admin(&[
        "add-user",
        "--company",
        "acme",
        "--username",
        "acme-sync",
        "--password",
        "pw",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("company_admin 'acme-sync'"));

    let user = ctx
        .store()
        .user_by_username("acme-sync")
        .unwrap()
        .expect("user");
    assert_eq!(user.role, Role::CompanyAdmin);

    ctx.admin(&[
        "add-user",
        "--company",
        "nobody",
        "--username",
        "x",
        "--password",
        "pw",
    ])
    .assert()
    .failure()
    .stderr(predicate::str::contains("company 'nobody' not found"));
}

#[test]
fn test_add_primary_seals_credentials() {
    let ctx = TestContext::new();
    ctx.init("secondary").success();
    let key = SyncKey::generate();

    ctx.cmd()
        .env("SANDPIPER_KEY", key.to_base64())
        .args(["admin", "add-primary", "--data-dir", &ctx.data_dir_str()])
        .args(["--name", "Upstream", "--addr", "https://upstream.example.com/"])
        .args(["--username", "me", "--password", "pw"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered primary 'Upstream'"));

    let company = ctx
        .store()
        .company_by_name("Upstream")
        .unwrap()
        .expect("company");
    assert_eq!(company.sync_addr, "https://upstream.example.com");
    assert_eq!(
        Credentials::decrypt(&company.sync_api_key, &key).unwrap(),
        Credentials::new("me", "pw")
    );
}

#[test]
fn test_subscribe() {
    let ctx = TestContext::new();
    ctx.init("primary").success();
    ctx.admin(&["add-company", "--name", "Acme"]).assert().success();
    let slice = Slice::new("Brakes", SliceType::AcesFile);
    ctx.store().create_slice(&slice).unwrap();

    ctx.admin(&["subscribe", "--company", "Acme", "--slice", "brakes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Subscribed 'Acme' to 'Brakes'"));

    let store = ctx.store();
    let acme = store.company_by_name("Acme").unwrap().expect("company");
    let subs = store.subscriptions(acme.id).unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].name, "Acme-Brakes");
    assert!(store.slice_access(acme.id, slice.id).is_ok());

    ctx.admin(&["subscribe", "--company", "Acme", "--slice", "missing"])
        .assert()
        .failure();
}
