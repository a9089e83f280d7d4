//! Application state and the operations the UI invokes over IPC.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hytale_lib::auth::{Account, Auth, Loopback};
use hytale_lib::build::{self, Platform};
use hytale_lib::endpoints::Endpoints;
use hytale_lib::net::{Mode, NetMonitor};
use hytale_lib::state::StateError;
use hytale_lib::storage::Storage;
use hytale_lib::update::types::{self, CancelToken};
use hytale_lib::{ChannelState, StateStore, Updater};

use crate::events::{
    EventSink, EVENT_HINT_NEWS, EVENT_HINT_UPDATES, EVENT_LOGIN_ERROR, EVENT_LOGIN_SUCCESS,
    EVENT_LOGOUT, EVENT_NETWORK_MODE, EVENT_PROFILE_CHANGED, EVENT_RELOAD, EVENT_UPDATE_STATUS,
};

/// Known release channels in fallback preference order.
pub const RELEASE_CHANNELS: &[&str] = &["release"];

const LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

fn refresh_cooldown() -> chrono::Duration {
    chrono::Duration::minutes(15)
}

const ACCOUNT_FILE: &str = "account.json";

pub struct App {
    storage: Storage,
    store: StateStore,
    endpoints: Endpoints,
    client: reqwest::Client,
    net: Arc<NetMonitor>,
    updater: Updater,
    events: Arc<dyn EventSink>,

    state: Mutex<Option<ChannelState>>,
    account: Mutex<Option<Account>>,
    loopback: tokio::sync::Mutex<Option<Arc<Loopback>>>,
    news_fingerprint: Mutex<Option<String>>,

    /// Serializes account refreshes (15-minute cooldown unless forced).
    refresh_gate: tokio::sync::Mutex<()>,
    /// Single-writer discipline: one coordinator invocation at a time.
    update_gate: tokio::sync::Mutex<()>,
    update_cancel: Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

impl App {
    pub fn new(events: Arc<dyn EventSink>) -> Result<Self> {
        let storage = Storage::resolve()?;
        Self::with_parts(storage, Endpoints::default(), events)
    }

    pub fn with_parts(
        storage: Storage,
        endpoints: Endpoints,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(build::user_agent())
            .build()
            .context("unable to build HTTP client")?;

        // The launcher manifest endpoint doubles as the connectivity probe.
        let probe_url = endpoints.launcher_version("release", "launcher");
        let net = Arc::new(NetMonitor::new(client.clone(), probe_url));

        let store = StateStore::new(&storage);
        let updater = Updater::new(client.clone(), endpoints.clone(), storage.clone(), net.clone());

        Ok(Self {
            storage,
            store,
            endpoints,
            client,
            net,
            updater,
            events,
            state: Mutex::new(None),
            account: Mutex::new(None),
            loopback: tokio::sync::Mutex::new(None),
            news_fingerprint: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            update_gate: tokio::sync::Mutex::new(()),
            update_cancel: Mutex::new(None),
        })
    }

    /// Backend initialization: storage, cached account, channel restore.
    pub fn startup(&self) -> Result<()> {
        self.storage.ensure_root()?;

        // Flush the transient download cache from previous runs.
        if let Err(err) = std::fs::remove_dir_all(self.storage.cache_dir()) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("unable to flush download cache: {}", err);
            }
        }

        if let Some(account) = self.load_account() {
            *self.account.lock().unwrap() = Some(account);
            self.user_init();
        }

        log::info!("app initialized");
        self.events.emit(EVENT_RELOAD, json!(null));
        Ok(())
    }

    /// Post-login setup: default profile and channel restore.
    fn user_init(&self) {
        self.select_default_profile();

        let selected = {
            let account = self.account.lock().unwrap();
            account.as_ref().and_then(|a| a.selected_channel.clone())
        };
        if let Some(channel) = selected {
            if self.user_channels().contains(&channel) {
                log::info!("restoring previously selected channel: {}", channel);
                self.set_channel(Some(&channel));
            }
        }
    }

    fn select_default_profile(&self) {
        let mut account = self.account.lock().unwrap();
        let Some(account) = account.as_mut() else {
            return;
        };
        if account.current_profile().is_none() {
            if let Some(uuid) = account.profiles.first().map(|p| p.uuid.clone()) {
                let _ = account.set_current_profile(&uuid);
            }
        }
    }

    // ----- channels -------------------------------------------------------

    pub fn current_channel(&self) -> Option<String> {
        self.state.lock().unwrap().as_ref().map(|s| s.channel.clone())
    }

    /// Load (or create) the state for a channel and make it current.
    pub fn set_channel(&self, channel: Option<&str>) {
        let current = self.current_channel();
        log::info!(
            "setting channel: channel={:?} current={:?}",
            channel,
            current
        );

        match channel {
            None => {
                *self.state.lock().unwrap() = None;
            }
            Some(channel) => {
                let state = self.load_env(channel);
                *self.state.lock().unwrap() = Some(state);
            }
        }

        if current.as_deref() != channel {
            let mut account = self.account.lock().unwrap();
            if let Some(account) = account.as_mut() {
                account.selected_channel = channel.map(str::to_string);
            }
            drop(account);
            self.save_account("channel_set");
        }
    }

    /// Load a channel's state, creating a fresh one when none was saved.
    /// A corrupt file is logged and left on disk untouched.
    fn load_env(&self, channel: &str) -> ChannelState {
        match self.store.load(channel) {
            Ok(state) => state,
            Err(StateError::NotFound) => ChannelState::new(channel, &self.storage),
            Err(err) => {
                log::error!("failed to load channel: channel={} error={}", channel, err);
                ChannelState::new(channel, &self.storage)
            }
        }
    }

    /// Channels available to the user right now: entitlements when online,
    /// offline-ready channels when offline.
    pub fn user_channels(&self) -> Vec<String> {
        let entitled = self.entitled_channels();
        if self.net.current() == Mode::Online {
            return entitled;
        }

        entitled
            .into_iter()
            .filter(|channel| match self.store.load(channel) {
                Ok(state) => state.offline_ready,
                Err(StateError::NotFound) => false,
                Err(err) => {
                    log::error!(
                        "failed to load channel for offline status: channel={} error={}",
                        channel,
                        err
                    );
                    false
                }
            })
            .collect()
    }

    fn entitled_channels(&self) -> Vec<String> {
        let account = self.account.lock().unwrap();
        let profile = account.as_ref().and_then(|a| a.current_profile());
        match profile {
            Some(profile) => profile.entitled_channels(),
            None => RELEASE_CHANNELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Drop to a fallback channel when the current one is no longer
    /// available to the user.
    pub fn ensure_valid_channel(&self) {
        let current = self.current_channel();
        let available = self.user_channels();
        log::debug!(
            "validating current channel access: current={:?} options={:?}",
            current,
            available
        );

        let valid = match &current {
            None => true,
            Some(channel) => available.contains(channel),
        };
        if valid {
            return;
        }

        for preferred in RELEASE_CHANNELS {
            if available.iter().any(|c| c == preferred) {
                self.set_channel(Some(preferred));
                return;
            }
        }
        self.set_channel(None);
    }

    // ----- network --------------------------------------------------------

    /// Probe connectivity and transition the mode machine. Returns true
    /// when the launcher is (still) offline.
    pub async fn check_network_mode(&self, can_go_online: bool, cause: &str) -> bool {
        log::debug!(
            "checking network mode: can_go_online={} cause={}",
            can_go_online,
            cause
        );

        let connected = self.net.check_connectivity().await;
        let mode = self.net.current();

        if connected && can_go_online && mode == Mode::Offline {
            self.transition(Mode::Online);
            return false;
        }
        if !connected && mode == Mode::Online {
            self.transition(Mode::Offline);
            return true;
        }

        self.net.current() == Mode::Offline
    }

    fn transition(&self, mode: Mode) {
        if self.net.set_mode(mode) {
            self.ensure_valid_channel();
            self.events.emit(EVENT_NETWORK_MODE, json!(mode));
        }
    }

    // ----- account --------------------------------------------------------

    fn account_path(&self) -> std::path::PathBuf {
        self.storage.in_storage(ACCOUNT_FILE)
    }

    fn load_account(&self) -> Option<Account> {
        let bytes = std::fs::read(self.account_path()).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(account) => Some(account),
            Err(err) => {
                log::error!("failed to decode stored account: {}", err);
                None
            }
        }
    }

    fn save_account(&self, cause: &str) {
        let account = self.account.lock().unwrap();
        let Some(account) = account.as_ref() else {
            return;
        };
        log::debug!("saving account: cause={}", cause);
        let result = serde_json::to_vec_pretty(account)
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                self.storage.ensure_root()?;
                std::fs::write(self.account_path(), json).map_err(Into::into)
            });
        if let Err(err) = result {
            log::error!("failed to save account: {:#}", err);
        }
    }

    /// Pull fresh account data, respecting the 15-minute cooldown unless
    /// forced.
    pub async fn refresh_user(&self, force: bool, cause: &str) {
        log::debug!("requested user account refresh: force={} cause={}", force, cause);

        let _gate = self.refresh_gate.lock().await;

        let mut working = {
            let account = self.account.lock().unwrap();
            match account.as_ref() {
                Some(account) => account.clone(),
                None => return,
            }
        };

        if !force {
            if let Some(last) = working.last_refresh {
                if chrono::Utc::now() - last < refresh_cooldown() {
                    return;
                }
            }
        }

        match working
            .refresh(
                &self.client,
                &self.endpoints,
                &self.net,
                &Platform::current(),
                cause,
            )
            .await
        {
            Ok(()) => {
                *self.account.lock().unwrap() = Some(working);
                self.select_default_profile();
                self.save_account("refresh_user");
            }
            Err(err) => {
                log::warn!("account refresh failed: {:#}", err);
            }
        }
    }

    /// Switch the active profile, then revalidate the channel against the
    /// new profile's entitlements.
    pub fn set_user_profile(&self, uuid: &str) -> Result<()> {
        {
            let mut account = self.account.lock().unwrap();
            let account = account.as_mut().context("no user logged in")?;

            let current = account.current_profile().map(|p| p.uuid.clone());
            log::debug!("requested set user profile: uuid={} current={:?}", uuid, current);
            if current.as_deref() == Some(uuid) {
                return Ok(());
            }
            account.set_current_profile(uuid)?;
        }

        self.ensure_valid_channel();
        self.save_account("set_user_profile");
        self.events.emit(EVENT_PROFILE_CHANGED, json!({ "uuid": uuid }));
        Ok(())
    }

    // ----- login ----------------------------------------------------------

    /// Begin a login attempt, stopping any prior one. Returns the
    /// authorization URL for the user's browser.
    pub async fn start_login(&self) -> Result<String> {
        let mut slot = self.loopback.lock().await;
        if let Some(prior) = slot.take() {
            prior.stop();
        }

        let (loopback, url) = Loopback::start(&self.endpoints).await?;
        *slot = Some(Arc::new(loopback));
        Ok(url)
    }

    /// Wait for the in-flight login attempt and install the result.
    pub async fn complete_login(&self) -> Result<()> {
        let loopback = {
            let slot = self.loopback.lock().await;
            slot.as_ref().cloned().context("no login in progress")?
        };

        match loopback.wait(LOGIN_TIMEOUT).await {
            Ok(token) => {
                {
                    let mut account = self.account.lock().unwrap();
                    let account = account.get_or_insert_with(Account::default);
                    account.token = token;
                }
                self.refresh_user(true, "login").await;
                self.user_init();
                self.save_account("login");
                self.events.emit(EVENT_LOGIN_SUCCESS, json!(null));
                Ok(())
            }
            Err(err) => {
                self.events
                    .emit(EVENT_LOGIN_ERROR, json!({ "error": err.to_string() }));
                Err(err)
            }
        }
    }

    pub async fn cancel_login(&self) {
        let mut slot = self.loopback.lock().await;
        if let Some(loopback) = slot.take() {
            loopback.stop();
        }
    }

    pub async fn logout(&self) {
        self.cancel_login().await;
        *self.account.lock().unwrap() = None;
        let _ = std::fs::remove_file(self.account_path());
        self.set_channel(None);
        self.events.emit(EVENT_LOGOUT, json!(null));
    }

    // ----- updates --------------------------------------------------------

    fn auth(&self) -> Auth {
        let account = self.account.lock().unwrap();
        Auth {
            token: account
                .as_ref()
                .map(|a| a.token.access_token.clone())
                .unwrap_or_default(),
            account: account.clone(),
        }
    }

    /// Count pending updates for the current channel. Returns -1 on error
    /// or when no channel is selected.
    pub async fn check_for_updates(&self, force: bool) -> i64 {
        let Some(state) = self.state.lock().unwrap().clone() else {
            log::warn!("cannot check for updates: no update environment configured");
            return -1;
        };

        if force {
            if self.check_network_mode(true, "check_for_updates").await {
                return -1;
            }
            self.updater.manifests.invalidate_all().await;
            self.refresh_user(true, "check_for_updates").await;
        }

        let auth = self.auth();
        let token = CancelToken::none();
        match self
            .updater
            .check_all(&token, &state, &auth, &state.channel)
            .await
        {
            Ok(updates) => {
                log::info!(
                    "update check complete: updates_found={} force={} channel={}",
                    updates.len(),
                    force,
                    state.channel
                );
                updates.len() as i64
            }
            Err(err) => {
                log::error!("error checking for updates: {:#}", err);
                -1
            }
        }
    }

    /// Plan and apply all pending updates for the current channel,
    /// streaming `update:status` events to the frontend.
    pub async fn apply_updates(&self) -> Result<()> {
        let _gate = self.update_gate.lock().await;

        let mut state = self
            .state
            .lock()
            .unwrap()
            .clone()
            .context("no channel selected")?;

        let auth = self.auth();
        let (cancel_tx, token) = CancelToken::pair();
        *self.update_cancel.lock().unwrap() = Some(cancel_tx);

        let updates = self
            .updater
            .check_all(&token, &state, &auth, &state.channel)
            .await?;
        if updates.is_empty() {
            *self.update_cancel.lock().unwrap() = None;
            return Ok(());
        }

        let events = self.events.clone();
        let reporter: types::StatusCallback = Arc::new(move |status| {
            let payload = serde_json::to_value(&status).unwrap_or(json!(null));
            events.emit(EVENT_UPDATE_STATUS, payload);
        });

        let result = self
            .updater
            .apply_all(&token, &self.store, &mut state, &updates, &reporter)
            .await;

        *self.update_cancel.lock().unwrap() = None;
        // The on-disk state advanced per package; mirror it in memory even
        // on failure so a retry replans from reality.
        *self.state.lock().unwrap() = Some(state);

        result
    }

    /// Request cancellation of the running update, if any.
    pub fn cancel_update(&self) {
        if let Some(tx) = self.update_cancel.lock().unwrap().as_ref() {
            let _ = tx.send(true);
        }
    }

    // ----- background refresh ---------------------------------------------

    /// Soft refresh used by the hourly refresher: surface hints, never
    /// force network state changes.
    pub async fn soft_refresh(&self) -> Result<()> {
        log::debug!("soft refreshing application state");

        let count = self.check_for_updates(false).await;
        if count > 0 {
            self.events.emit(EVENT_HINT_UPDATES, json!(null));
        }

        if self.refresh_news_feed().await? {
            self.events.emit(EVENT_HINT_NEWS, json!(null));
        }
        Ok(())
    }

    /// Fetch the news feed and report whether it changed since last seen.
    async fn refresh_news_feed(&self) -> Result<bool> {
        self.net.offline_error()?;

        let response = self
            .client
            .get(self.endpoints.feed())
            .send()
            .await
            .context("unable to refresh news feed")?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP error {} fetching news feed", response.status());
        }

        let body = response.bytes().await?;
        let fingerprint = {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            body.hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        };

        let mut last = self.news_fingerprint.lock().unwrap();
        let changed = last.as_deref() != Some(fingerprint.as_str());
        *last = Some(fingerprint);
        Ok(changed)
    }
}
