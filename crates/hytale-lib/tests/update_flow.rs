//! End-to-end update engine tests against local HTTP fixtures and a stub
//! patch tool.

#![cfg(unix)]

use axum::extract::Path as AxumPath;
use axum::routing::get;
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use std::collections::HashMap;

use hytale_lib::auth::{Account, Auth, Patchline};
use hytale_lib::endpoints::Endpoints;
use hytale_lib::manifest::{Manifest, Release};
use hytale_lib::net::NetMonitor;
use hytale_lib::state::{ChannelState, Dep, StateStore, PKG_GAME, PKG_JRE};
use hytale_lib::storage::Storage;
use hytale_lib::update::types::{CancelToken, StatusCallback, UpdateStatus, STATE_COMPLETE};
use hytale_lib::update::{PatchTool, Update, UpdateKind, Updater};

struct Fixture {
    _tmp: tempfile::TempDir,
    storage: Storage,
    store: StateStore,
    updater: Updater,
    tool_log: PathBuf,
}

/// Bodies served for patch and signature downloads.
fn file_body(name: &str) -> Vec<u8> {
    format!("content-of-{}", name).into_bytes()
}

/// Build a zip holding a fake JRE whose `bin/java` exits 0.
fn jre_archive() -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let opts = zip::write::FileOptions::default().unix_permissions(0o755);
        zip.start_file("bin/java", opts).unwrap();
        zip.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stub patch tool that records its invocations and exits 0.
fn stub_patch_tool(dir: &Path, log: &Path) -> PatchTool {
    let bin = dir.join("patcher");
    let script = format!("#!/bin/sh\necho \"$1\" >> {}\nexit 0\n", log.display());
    std::fs::write(&bin, script).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
    PatchTool::new(bin)
}

/// Local server standing in for launcher/account-data backends.
///
/// `launcher_build` controls whether a launcher update exists; the patch
/// endpoint returns a chain from the requested build up to 42.
async fn serve_backend(launcher_build: u64, jre_zip: Vec<u8>, jre_checksum: String) -> String {
    let platform = hytale_lib::build::Platform::current();
    let os = platform.os.clone();
    let arch = platform.arch.clone();
    let jre_size = jre_zip.len() as u64;

    let manifest = move |component: String, base: String| -> Manifest {
        let (version, build, url, checksum, size) = match component.as_str() {
            "launcher" => (
                "2026.1.0".to_string(),
                launcher_build,
                format!("{}/files/launcher-bin", base),
                sha256_hex(&file_body("launcher-bin")),
                file_body("launcher-bin").len() as u64,
            ),
            "jre" => (
                "17.0.2".to_string(),
                17,
                format!("{}/files/jre.zip", base),
                jre_checksum.clone(),
                jre_size,
            ),
            other => panic!("unexpected component {}", other),
        };
        let mut arches = HashMap::new();
        arches.insert(arch.clone(), Release { url, checksum, size });
        let mut downloads = HashMap::new();
        downloads.insert(os.clone(), arches);
        Manifest {
            version,
            build,
            downloads,
        }
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let manifest_base = base.clone();
    let patch_base = base.clone();
    let jre_zip_route = jre_zip.clone();

    let router = Router::new()
        .route(
            "/version/:channel/:component",
            get(move |AxumPath((_channel, component)): AxumPath<(String, String)>| {
                let manifest = manifest.clone();
                let base = manifest_base.clone();
                async move {
                    let component = component.trim_end_matches(".json").to_string();
                    Json(manifest(component, base))
                }
            }),
        )
        .route(
            "/patches/:os/:arch/:channel/:from",
            get(
                move |AxumPath((_os, _arch, _channel, from)): AxumPath<(
                    String,
                    String,
                    String,
                    u64,
                )>| {
                    let base = patch_base.clone();
                    async move {
                        let mut steps = Vec::new();
                        let mut build = from;
                        while build < 42 {
                            let next = if build == 0 { 42 } else { build + 1 };
                            steps.push(serde_json::json!({
                                "from_build": build,
                                "to_build": next,
                                "patch_url": format!("{}/files/patch-{}-{}", base, build, next),
                                "patch_size": 0,
                                "sig_url": format!("{}/files/sig-{}", base, next),
                                "sig_size": 0,
                            }));
                            build = next;
                        }
                        Json(serde_json::json!({ "steps": steps }))
                    }
                },
            ),
        )
        .route(
            "/files/:name",
            get(move |AxumPath(name): AxumPath<String>| {
                let jre_zip = jre_zip_route.clone();
                async move {
                    if name == "jre.zip" {
                        jre_zip
                    } else {
                        file_body(&name)
                    }
                }
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    base
}

async fn fixture(launcher_build: u64) -> Fixture {
    fixture_with_jre(launcher_build, jre_archive(), None).await
}

async fn fixture_with_jre(
    launcher_build: u64,
    jre_zip: Vec<u8>,
    jre_checksum: Option<String>,
) -> Fixture {
    let checksum = jre_checksum.unwrap_or_else(|| sha256_hex(&jre_zip));
    let base = serve_backend(launcher_build, jre_zip, checksum).await;

    let tmp = tempfile::tempdir().unwrap();
    let storage = Storage::at(tmp.path().join("data"));
    storage.ensure_root().unwrap();
    let store = StateStore::new(&storage);

    let endpoints = Endpoints {
        launcher_base: base.clone(),
        account_base: base.clone(),
        oauth_base: base,
    };

    let client = reqwest::Client::new();
    let net = Arc::new(NetMonitor::new(client.clone(), "http://127.0.0.1:9/".into()));

    let mut updater = Updater::new(client, endpoints, storage.clone(), net);
    let tool_log = tmp.path().join("tool.log");
    updater.patch_tool = stub_patch_tool(tmp.path(), &tool_log);

    Fixture {
        _tmp: tmp,
        storage,
        store,
        updater,
        tool_log,
    }
}

fn auth_with_patchline(newest_build: u64) -> Auth {
    let mut account = Account::default();
    account.patchlines.insert(
        "release".into(),
        Patchline {
            name: "release".into(),
            version: format!("1.0.{}", newest_build),
            newest_build,
        },
    );
    Auth {
        token: "test-token".into(),
        account: Some(account),
    }
}

fn collecting_reporter() -> (Arc<Mutex<Vec<UpdateStatus>>>, StatusCallback) {
    let seen: Arc<Mutex<Vec<UpdateStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cb: StatusCallback = Arc::new(move |s| sink.lock().unwrap().push(s));
    (seen, cb)
}

fn tool_invocations(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn fresh_install_plans_jre_then_game_and_becomes_offline_ready() {
    let fx = fixture(0).await;
    let state = ChannelState::new("release", &fx.storage);
    let auth = auth_with_patchline(42);

    let updates = fx
        .updater
        .check_all(&CancelToken::none(), &state, &auth, "release")
        .await
        .unwrap();
    assert_eq!(
        updates.iter().map(Update::kind).collect::<Vec<_>>(),
        vec![UpdateKind::Jre, UpdateKind::Game]
    );

    let (seen, reporter) = collecting_reporter();
    let token = CancelToken::none();
    let mut state = state;
    fx.updater
        .apply_all(&token, &fx.store, &mut state, &updates, &reporter)
        .await
        .unwrap();

    // State invariants after a successful fresh install.
    assert!(!state.is_new);
    assert!(state.offline_ready);
    assert_eq!(state.first_dep(PKG_JRE).unwrap().build, 17);
    assert_eq!(state.first_dep(PKG_GAME).unwrap().build, 42);
    assert_eq!(state.get_deps(PKG_GAME).unwrap().len(), 1);

    // Signature committed into the install.
    let game_dir = fx.storage.package_dir(PKG_GAME, "release");
    assert!(game_dir.join(".signature").exists());

    // Persisted state matches memory.
    let loaded = fx.store.load("release").unwrap();
    assert_eq!(loaded, state);

    // Exactly one terminal complete report, monotonic progress before it.
    let events = seen.lock().unwrap();
    let terminal: Vec<_> = events
        .iter()
        .filter(|s| s.state == STATE_COMPLETE && s.progress >= 0.999)
        .collect();
    assert_eq!(terminal.len(), 1);
    for pair in events.windows(2) {
        assert!(pair[1].progress >= pair[0].progress - 1e-9);
    }

    // Download cache is empty again: patches and archives were scratch.
    let cache_entries = std::fs::read_dir(fx.storage.cache_dir())
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(cache_entries, 0);
}

#[tokio::test]
async fn incremental_game_update_applies_the_chain_and_commits_last_sig() {
    let fx = fixture(0).await;

    let mut state = ChannelState::new("release", &fx.storage);
    let jre_dir = fx.storage.package_dir(PKG_JRE, "release");
    std::fs::create_dir_all(&jre_dir).unwrap();
    state.set_dependency(
        PKG_JRE,
        "seed",
        Some(Dep {
            version: "17.0.2".into(),
            build: 17,
            path: jre_dir.to_string_lossy().into_owned(),
            ..Default::default()
        }),
    );
    state.set_dependency(
        PKG_GAME,
        "seed",
        Some(Dep {
            version: "1.0.40".into(),
            build: 40,
            ..Default::default()
        }),
    );

    let auth = auth_with_patchline(42);
    let updates = fx
        .updater
        .check_all(&CancelToken::none(), &state, &auth, "release")
        .await
        .unwrap();
    assert_eq!(
        updates.iter().map(Update::kind).collect::<Vec<_>>(),
        vec![UpdateKind::Game]
    );

    let token = CancelToken::none();
    fx.updater
        .apply_all(
            &token,
            &fx.store,
            &mut state,
            &updates,
            &hytale_lib::update::types::silent(),
        )
        .await
        .unwrap();

    // Two steps: 40->41 and 41->42, each applied then validated.
    let invocations = tool_invocations(&fx.tool_log);
    assert_eq!(
        invocations,
        vec!["apply", "verify", "apply", "verify"]
    );

    // The committed signature is byte-identical to step 2's sig file.
    let game_dir = fx.storage.package_dir(PKG_GAME, "release");
    assert_eq!(
        std::fs::read(game_dir.join(".signature")).unwrap(),
        file_body("sig-42")
    );

    // Exactly one dep remains and it is the target version.
    let deps = state.get_deps(PKG_GAME).unwrap();
    assert_eq!(deps.len(), 1);
    assert_eq!(state.first_dep(PKG_GAME).unwrap().version, "1.0.42");
}

#[tokio::test]
async fn launcher_update_preempts_everything_else() {
    // Launcher manifest advertises build 100; local build number is 0.
    let fx = fixture(100).await;
    let state = ChannelState::new("release", &fx.storage);
    let auth = auth_with_patchline(42);

    let updates = fx
        .updater
        .check_all(&CancelToken::none(), &state, &auth, "release")
        .await
        .unwrap();

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].kind(), UpdateKind::Launcher);
    assert_eq!(updates[0].target_version(), "2026.1.0");
}

#[tokio::test]
async fn corrupted_jre_download_fails_and_leaves_state_untouched() {
    // Serve the real archive but advertise a wrong checksum.
    let fx = fixture_with_jre(0, jre_archive(), Some("00".repeat(32))).await;
    let state = ChannelState::new("release", &fx.storage);
    let auth = auth_with_patchline(42);

    let updates = fx
        .updater
        .check_all(&CancelToken::none(), &state, &auth, "release")
        .await
        .unwrap();

    let token = CancelToken::none();
    let mut state = state;
    let err = fx
        .updater
        .apply_all(
            &token,
            &fx.store,
            &mut state,
            &updates,
            &hytale_lib::update::types::silent(),
        )
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("checksum mismatch"));

    // The partial download is gone and no dependency was recorded.
    let cache_entries = std::fs::read_dir(fx.storage.cache_dir())
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(cache_entries, 0);
    assert!(state.first_dep(PKG_JRE).is_none());

    // Nothing was persisted for the channel either.
    assert!(matches!(
        fx.store.load("release"),
        Err(hytale_lib::state::StateError::NotFound)
    ));
}

#[tokio::test]
async fn offline_mode_short_circuits_update_checks() {
    let fx = fixture(0).await;
    fx.updater.net.set_mode(hytale_lib::net::Mode::Offline);

    let state = ChannelState::new("release", &fx.storage);
    let auth = auth_with_patchline(42);

    let err = fx
        .updater
        .check_all(&CancelToken::none(), &state, &auth, "release")
        .await
        .unwrap_err();
    assert!(
        err.chain()
            .any(|e| e.downcast_ref::<hytale_lib::net::OfflineError>().is_some()),
        "expected offline sentinel, got {:#}",
        err
    );
}

#[tokio::test]
async fn cancellation_between_updates_is_a_hard_stop() {
    let fx = fixture(0).await;
    let mut state = ChannelState::new("release", &fx.storage);
    let auth = auth_with_patchline(42);

    let updates = fx
        .updater
        .check_all(&CancelToken::none(), &state, &auth, "release")
        .await
        .unwrap();
    assert_eq!(updates.len(), 2);

    let (tx, token) = CancelToken::pair();
    tx.send(true).unwrap();

    let err = fx
        .updater
        .apply_all(
            &token,
            &fx.store,
            &mut state,
            &updates,
            &hytale_lib::update::types::silent(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cancelled"));
    assert!(state.first_dep(PKG_JRE).is_none());
}
