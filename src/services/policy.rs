//! Usage policy for anonymous sessions.
//!
//! Anonymous users get a daily message allowance, a cooldown between model
//! switches, and a once-a-day time window on the premium model. Every record
//! lives in client-local storage; authenticated sessions skip all of it.
//!
//! The records are read-modify-written without coordination, so two
//! processes sharing one data directory can race each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::{day_key, next_local_midnight, Clock};
use super::local_store::{load_json, save_json, KeyValueStore};

const USAGE_KEY: &str = "anonymous_chat_usage";
const COOLDOWN_KEY: &str = "model_change_info";
const PREMIUM_KEY: &str = "premium_window";
const MODEL_KEY: &str = "selected_model";
const WAITLIST_KEY: &str = "model_waitlist";

#[derive(Debug, Clone)]
pub struct PolicyLimits {
    pub daily_message_limit: u32,
    pub model_change_cooldown: chrono::Duration,
    pub premium_window: chrono::Duration,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            daily_message_limit: 10,
            model_change_cooldown: chrono::Duration::hours(1),
            premium_window: chrono::Duration::minutes(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub models: Vec<String>,
    /// Model subject to the daily time window.
    pub premium: String,
    /// Selection used when nothing was saved yet.
    pub initial: String,
    /// Model the session falls back to once the premium window is spent.
    pub fallback: String,
    /// Listed but not selectable; offered as a waitlist instead.
    pub unavailable: Vec<String>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let models = [
            "LPT-1", "LPT-1.5", "LPT-2", "LPT-2.5", "LPT-3", "LPT-3.5", "LPT-4", "LPT-4.5",
            "LPT-5",
        ];
        Self {
            models: models.iter().map(|m| m.to_string()).collect(),
            premium: "LPT-4".to_string(),
            initial: "LPT-4".to_string(),
            fallback: "LPT-3.5".to_string(),
            unavailable: Vec::new(),
        }
    }
}

impl ModelCatalog {
    pub fn contains(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn is_unavailable(&self, model: &str) -> bool {
        self.unavailable.iter().any(|m| m == model)
    }

    pub fn is_premium(&self, model: &str) -> bool {
        self.premium == model
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Daily message limit reached. Sign in to keep chatting or wait {}.", format_countdown(*resets_in))]
    QuotaExceeded { resets_in: Duration },

    #[error("Model change limit reached. Try again in {} minutes.", ceil_minutes(*remaining))]
    CooldownActive { remaining: Duration },

    #[error("Premium model time limit reached for today. Try again tomorrow.")]
    PremiumWindowExpired,

    #[error("{model} is not available yet")]
    ModelUnavailable { model: String },

    #[error("Unknown model: {model}")]
    UnknownModel { model: String },

    #[error("Local storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for PolicyError {
    fn from(e: anyhow::Error) -> Self {
        PolicyError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaStatus {
    Unlimited,
    Limited {
        used: u32,
        limit: u32,
        resets_at: DateTime<Local>,
    },
}

impl QuotaStatus {
    pub fn remaining(&self) -> Option<u32> {
        match self {
            QuotaStatus::Unlimited => None,
            QuotaStatus::Limited { used, limit, .. } => Some(limit.saturating_sub(*used)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChange {
    Unchanged,
    Changed {
        from: String,
        to: String,
        premium_window_started: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyNotice {
    PremiumWindowElapsed { premium: String, reverted_to: String },
}

impl std::fmt::Display for PolicyNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyNotice::PremiumWindowElapsed {
                premium,
                reverted_to,
            } => write!(f, "{premium} time limit reached. Switched to {reverted_to}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageCounter {
    count: u32,
    date: String,
    reset_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CooldownRecord {
    last_change_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum PremiumWindowState {
    Running { start_ms: i64 },
    Spent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PremiumWindowRecord {
    date: String,
    #[serde(flatten)]
    state: PremiumWindowState,
}

pub struct PolicyEngine {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    limits: PolicyLimits,
    catalog: ModelCatalog,
    authenticated: bool,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        limits: PolicyLimits,
        catalog: ModelCatalog,
        authenticated: bool,
    ) -> Self {
        Self {
            store,
            clock,
            limits,
            catalog,
            authenticated,
        }
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub async fn active_model(&self) -> Result<String, PolicyError> {
        let saved = self.store.get(MODEL_KEY).await?;
        Ok(saved
            .filter(|m| self.catalog.contains(m))
            .unwrap_or_else(|| self.catalog.initial.clone()))
    }

    /// Gate one outgoing message. Anonymous sessions consume one unit of the
    /// daily allowance; the counter starts over on a new local day.
    pub async fn check_and_consume_message_quota(&self) -> Result<QuotaStatus, PolicyError> {
        if self.authenticated {
            return Ok(QuotaStatus::Unlimited);
        }

        let now = self.clock.now();
        let usage = self.current_usage(now).await?;
        let limit = self.limits.daily_message_limit;

        if usage.count >= limit {
            let resets_at = next_local_midnight(now);
            return Err(PolicyError::QuotaExceeded {
                resets_in: to_std(resets_at - now),
            });
        }

        let updated = UsageCounter {
            count: usage.count + 1,
            date: day_key(now),
            reset_at_ms: next_local_midnight(now).timestamp_millis(),
        };
        save_json(self.store.as_ref(), USAGE_KEY, &updated).await?;
        tracing::debug!(used = updated.count, limit, "Anonymous message counted");

        Ok(QuotaStatus::Limited {
            used: updated.count,
            limit,
            resets_at: next_local_midnight(now),
        })
    }

    pub async fn quota_status(&self) -> Result<QuotaStatus, PolicyError> {
        if self.authenticated {
            return Ok(QuotaStatus::Unlimited);
        }
        let now = self.clock.now();
        let usage = self.current_usage(now).await?;
        Ok(QuotaStatus::Limited {
            used: usage.count,
            limit: self.limits.daily_message_limit,
            resets_at: next_local_midnight(now),
        })
    }

    pub async fn request_model_change(&self, target: &str) -> Result<ModelChange, PolicyError> {
        let current = self.active_model().await?;
        if current == target {
            return Ok(ModelChange::Unchanged);
        }
        if !self.catalog.contains(target) {
            return Err(PolicyError::UnknownModel {
                model: target.to_string(),
            });
        }
        if self.catalog.is_unavailable(target) {
            return Err(PolicyError::ModelUnavailable {
                model: target.to_string(),
            });
        }

        if self.authenticated {
            self.store.set(MODEL_KEY, target).await?;
            return Ok(ModelChange::Changed {
                from: current,
                to: target.to_string(),
                premium_window_started: false,
            });
        }

        let now = self.clock.now();
        let window = self.premium_record_for(now).await?;

        if self.catalog.is_premium(target) {
            if let Some(record) = &window {
                if self.window_spent(record, now) {
                    return Err(PolicyError::PremiumWindowExpired);
                }
            }
        }

        if let Some(remaining) = self.cooldown_remaining_at(now).await? {
            return Err(PolicyError::CooldownActive { remaining });
        }

        let premium_window_started = self.catalog.is_premium(target) && window.is_none();
        if premium_window_started {
            self.start_premium_window(now).await?;
        }

        self.store.set(MODEL_KEY, target).await?;
        save_json(
            self.store.as_ref(),
            COOLDOWN_KEY,
            &CooldownRecord {
                last_change_ms: Some(now.timestamp_millis()),
            },
        )
        .await?;

        tracing::info!(from = %current, to = %target, "Model changed");
        Ok(ModelChange::Changed {
            from: current,
            to: target.to_string(),
            premium_window_started,
        })
    }

    /// Start the premium window the first time the premium model is used on
    /// a given day. Returns whether a window was started.
    pub async fn note_model_used(&self, model: &str) -> Result<bool, PolicyError> {
        if self.authenticated || !self.catalog.is_premium(model) {
            return Ok(false);
        }
        let now = self.clock.now();
        if self.premium_record_for(now).await?.is_some() {
            return Ok(false);
        }
        self.start_premium_window(now).await?;
        Ok(true)
    }

    /// Poll the premium window. Once it has run its course the record is
    /// marked spent (exactly once) and, if the premium model is active, the
    /// session is moved to the fallback model.
    pub async fn tick_premium_window(&self) -> Result<Option<PolicyNotice>, PolicyError> {
        if self.authenticated {
            return Ok(None);
        }
        let now = self.clock.now();
        let Some(record) = self.premium_record_for(now).await? else {
            return Ok(None);
        };
        let PremiumWindowState::Running { .. } = record.state else {
            return Ok(None);
        };
        if !self.window_spent(&record, now) {
            return Ok(None);
        }

        save_json(
            self.store.as_ref(),
            PREMIUM_KEY,
            &PremiumWindowRecord {
                date: record.date,
                state: PremiumWindowState::Spent,
            },
        )
        .await?;

        let active = self.active_model().await?;
        if !self.catalog.is_premium(&active) {
            return Ok(None);
        }

        self.store.set(MODEL_KEY, &self.catalog.fallback).await?;
        tracing::info!(model = %self.catalog.fallback, "Premium window elapsed, model reverted");
        Ok(Some(PolicyNotice::PremiumWindowElapsed {
            premium: self.catalog.premium.clone(),
            reverted_to: self.catalog.fallback.clone(),
        }))
    }

    pub async fn cooldown_remaining(&self) -> Result<Option<Duration>, PolicyError> {
        if self.authenticated {
            return Ok(None);
        }
        self.cooldown_remaining_at(self.clock.now()).await
    }

    /// Time left in a running premium window, for the countdown display.
    pub async fn premium_remaining(&self) -> Result<Option<Duration>, PolicyError> {
        if self.authenticated {
            return Ok(None);
        }
        let now = self.clock.now();
        let Some(record) = self.premium_record_for(now).await? else {
            return Ok(None);
        };
        match record.state {
            PremiumWindowState::Running { start_ms } => {
                let left = self.limits.premium_window - (now - instant(start_ms));
                Ok((left > chrono::Duration::zero()).then(|| to_std(left)))
            }
            PremiumWindowState::Spent => Ok(None),
        }
    }

    /// Record interest in an unavailable model. Returns `false` when the
    /// address was already on that model's list.
    pub async fn join_waitlist(&self, model: &str, email: &str) -> Result<bool, PolicyError> {
        let mut waitlist: HashMap<String, Vec<String>> =
            load_json(self.store.as_ref(), WAITLIST_KEY)
                .await?
                .unwrap_or_default();
        let entries = waitlist.entry(model.to_string()).or_default();
        if entries.iter().any(|e| e == email) {
            return Ok(false);
        }
        entries.push(email.to_string());
        save_json(self.store.as_ref(), WAITLIST_KEY, &waitlist).await?;
        Ok(true)
    }

    async fn current_usage(&self, now: DateTime<Local>) -> Result<UsageCounter, PolicyError> {
        let today = day_key(now);
        let stored: Option<UsageCounter> = load_json(self.store.as_ref(), USAGE_KEY).await?;
        Ok(stored
            .filter(|u| u.date == today)
            .unwrap_or_else(|| UsageCounter {
                count: 0,
                date: today,
                reset_at_ms: next_local_midnight(now).timestamp_millis(),
            }))
    }

    async fn cooldown_remaining_at(
        &self,
        now: DateTime<Local>,
    ) -> Result<Option<Duration>, PolicyError> {
        let record: CooldownRecord = load_json(self.store.as_ref(), COOLDOWN_KEY)
            .await?
            .unwrap_or_default();
        let Some(last) = record.last_change_ms else {
            return Ok(None);
        };
        let cooldown = self.limits.model_change_cooldown;
        let elapsed = now - instant(last);
        if elapsed >= cooldown {
            return Ok(None);
        }
        Ok(Some(to_std((cooldown - elapsed).min(cooldown))))
    }

    async fn premium_record_for(
        &self,
        now: DateTime<Local>,
    ) -> Result<Option<PremiumWindowRecord>, PolicyError> {
        let today = day_key(now);
        let record: Option<PremiumWindowRecord> =
            load_json(self.store.as_ref(), PREMIUM_KEY).await?;
        Ok(record.filter(|r| r.date == today))
    }

    async fn start_premium_window(&self, now: DateTime<Local>) -> Result<(), PolicyError> {
        save_json(
            self.store.as_ref(),
            PREMIUM_KEY,
            &PremiumWindowRecord {
                date: day_key(now),
                state: PremiumWindowState::Running {
                    start_ms: now.timestamp_millis(),
                },
            },
        )
        .await?;
        tracing::info!(model = %self.catalog.premium, "Premium window started");
        Ok(())
    }

    fn window_spent(&self, record: &PremiumWindowRecord, now: DateTime<Local>) -> bool {
        match record.state {
            PremiumWindowState::Running { start_ms } => {
                now - instant(start_ms) >= self.limits.premium_window
            }
            PremiumWindowState::Spent => true,
        }
    }
}

fn instant(ms: i64) -> DateTime<Local> {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| DateTime::<Local>::from(DateTime::UNIX_EPOCH))
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or_default()
}

fn ceil_minutes(d: Duration) -> u64 {
    d.as_secs().div_ceil(60)
}

/// `"5h 3m 12s"`, as shown next to the daily allowance.
pub fn format_countdown(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// `"12:05"`, as shown next to the premium model.
pub fn format_clock(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::local_store::MemoryStore;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 10, h, m, s).unwrap()
    }

    fn engine(authenticated: bool) -> (PolicyEngine, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(at(9, 0, 0)));
        let store = Arc::new(MemoryStore::new());
        let engine = PolicyEngine::new(
            store.clone(),
            clock.clone(),
            PolicyLimits::default(),
            ModelCatalog::default(),
            authenticated,
        );
        (engine, clock, store)
    }

    #[tokio::test]
    async fn test_quota_rejects_past_ceiling_until_local_midnight() {
        let (engine, clock, _) = engine(false);

        for i in 1..=10 {
            let status = engine.check_and_consume_message_quota().await.unwrap();
            assert_eq!(status.remaining(), Some(10 - i));
        }
        assert!(matches!(
            engine.check_and_consume_message_quota().await,
            Err(PolicyError::QuotaExceeded { .. })
        ));

        clock.set(at(23, 59, 59));
        match engine.check_and_consume_message_quota().await {
            Err(PolicyError::QuotaExceeded { resets_in }) => {
                assert_eq!(resets_in, Duration::from_secs(1));
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }

        clock.set(Local.with_ymd_and_hms(2025, 3, 11, 0, 0, 0).unwrap());
        let status = engine.check_and_consume_message_quota().await.unwrap();
        assert!(matches!(status, QuotaStatus::Limited { used: 1, .. }));
    }

    #[tokio::test]
    async fn test_authenticated_quota_is_waived_without_writes() {
        let (engine, _, store) = engine(true);
        for _ in 0..20 {
            assert_eq!(
                engine.check_and_consume_message_quota().await.unwrap(),
                QuotaStatus::Unlimited
            );
        }
        assert!(store.get(USAGE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_remaining_decreases_with_time() {
        let (engine, clock, _) = engine(false);
        assert!(matches!(
            engine.request_model_change("LPT-3.5").await.unwrap(),
            ModelChange::Changed { .. }
        ));

        clock.advance(chrono::Duration::minutes(10));
        let first = match engine.request_model_change("LPT-2").await {
            Err(PolicyError::CooldownActive { remaining }) => remaining,
            other => panic!("expected CooldownActive, got {other:?}"),
        };
        assert_eq!(first, Duration::from_secs(50 * 60));

        clock.advance(chrono::Duration::seconds(90));
        let second = match engine.request_model_change("LPT-2").await {
            Err(PolicyError::CooldownActive { remaining }) => remaining,
            other => panic!("expected CooldownActive, got {other:?}"),
        };
        assert_eq!(second, first - Duration::from_secs(90));
        assert_eq!(engine.active_model().await.unwrap(), "LPT-3.5");

        clock.advance(chrono::Duration::minutes(49));
        engine.request_model_change("LPT-2").await.unwrap();
        assert_eq!(engine.active_model().await.unwrap(), "LPT-2");
    }

    #[tokio::test]
    async fn test_premium_window_reverts_exactly_once() {
        let (engine, clock, _) = engine(false);
        assert_eq!(engine.active_model().await.unwrap(), "LPT-4");
        assert!(engine.note_model_used("LPT-4").await.unwrap());
        assert!(!engine.note_model_used("LPT-4").await.unwrap());

        clock.advance(chrono::Duration::minutes(19));
        assert_eq!(engine.tick_premium_window().await.unwrap(), None);
        assert_eq!(
            engine.premium_remaining().await.unwrap(),
            Some(Duration::from_secs(60))
        );

        clock.advance(chrono::Duration::minutes(1));
        let notice = engine.tick_premium_window().await.unwrap();
        assert_eq!(
            notice,
            Some(PolicyNotice::PremiumWindowElapsed {
                premium: "LPT-4".to_string(),
                reverted_to: "LPT-3.5".to_string(),
            })
        );
        assert_eq!(engine.active_model().await.unwrap(), "LPT-3.5");
        assert_eq!(engine.premium_remaining().await.unwrap(), None);

        assert_eq!(engine.tick_premium_window().await.unwrap(), None);
        assert_eq!(engine.tick_premium_window().await.unwrap(), None);

        assert!(matches!(
            engine.request_model_change("LPT-4").await,
            Err(PolicyError::PremiumWindowExpired)
        ));
        assert!(!engine.note_model_used("LPT-4").await.unwrap());

        clock.set(Local.with_ymd_and_hms(2025, 3, 11, 8, 0, 0).unwrap());
        assert!(matches!(
            engine.request_model_change("LPT-4").await.unwrap(),
            ModelChange::Changed {
                premium_window_started: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_switching_to_premium_starts_window_once() {
        let (engine, clock, _) = engine(false);
        engine.request_model_change("LPT-3").await.unwrap();
        clock.advance(chrono::Duration::hours(1));
        let change = engine.request_model_change("LPT-4").await.unwrap();
        assert!(matches!(
            change,
            ModelChange::Changed {
                premium_window_started: true,
                ..
            }
        ));
        assert!(engine.premium_remaining().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_and_unknown_models() {
        let clock = Arc::new(ManualClock::new(at(9, 0, 0)));
        let catalog = ModelCatalog {
            unavailable: vec!["LPT-5".to_string()],
            ..ModelCatalog::default()
        };
        for authenticated in [false, true] {
            let engine = PolicyEngine::new(
                Arc::new(MemoryStore::new()),
                clock.clone(),
                PolicyLimits::default(),
                catalog.clone(),
                authenticated,
            );
            assert!(matches!(
                engine.request_model_change("LPT-5").await,
                Err(PolicyError::ModelUnavailable { .. })
            ));
            assert!(matches!(
                engine.request_model_change("GPT-9").await,
                Err(PolicyError::UnknownModel { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_authenticated_changes_skip_cooldown() {
        let (engine, _, _) = engine(true);
        engine.request_model_change("LPT-3.5").await.unwrap();
        engine.request_model_change("LPT-2").await.unwrap();
        engine.request_model_change("LPT-4").await.unwrap();
        assert_eq!(engine.active_model().await.unwrap(), "LPT-4");
        assert_eq!(engine.cooldown_remaining().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_waitlist_deduplicates_per_model() {
        let (engine, _, _) = engine(false);
        assert!(engine.join_waitlist("LPT-5", "a@b.c").await.unwrap());
        assert!(!engine.join_waitlist("LPT-5", "a@b.c").await.unwrap());
        assert!(engine.join_waitlist("LPT-4.5", "a@b.c").await.unwrap());
    }

    #[test]
    fn test_countdown_formats() {
        assert_eq!(format_countdown(Duration::from_secs(3 * 3600 + 61)), "3h 1m 1s");
        assert_eq!(format_clock(Duration::from_secs(605)), "10:05");
        let err = PolicyError::CooldownActive {
            remaining: Duration::from_secs(61),
        };
        assert_eq!(err.to_string(), "Model change limit reached. Try again in 2 minutes.");
    }
}
