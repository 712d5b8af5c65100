//! Rate-limited, escalating low-supply alerts.
//!
//! One episode runs from the first reading below the threshold until the
//! remaining supply recovers. Within an episode alert `k` (zero based) may
//! only fire once `k * interval` has elapsed since the first alert, up to the
//! configured maximum. Independently, nothing is sent within
//! [`GLOBAL_RATE_LIMIT_SECS`] of the previous alert.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{calendar::LocalCalendar, units};
use crate::{
    db::SettingsStore,
    domain::{NotificationState, NotifySettings},
    error::{SendError, StorageError},
};

pub const GLOBAL_RATE_LIMIT_SECS: i64 = 30;

/// Outbound text delivery to an operator channel.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &NotifySettings, message: &str) -> Result<(), SendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Alerts switched off or the channel lacks credentials.
    Disabled,
    /// Supply is at or above the threshold; the episode is over.
    Recovered,
    /// An alert went out less than the global rate limit ago.
    RateLimited,
    /// The next escalation step is not due yet.
    Waiting,
    /// Every allowed alert for this episode has been sent.
    Exhausted,
    /// Send alert number `tier` (0 for the first one of the episode).
    Notify { tier: i64 },
}

/// Pure policy: what should happen for `remaining` at `now` given `state`.
pub fn decide(
    state: &NotificationState,
    policy: &NotifySettings,
    remaining: Decimal,
    now: i64,
) -> ThrottleDecision {
    if !policy.enabled || !policy.is_configured() {
        return ThrottleDecision::Disabled;
    }
    if remaining >= policy.threshold {
        return ThrottleDecision::Recovered;
    }
    if state.last_notify_time > 0 && now - state.last_notify_time < GLOBAL_RATE_LIMIT_SECS {
        return ThrottleDecision::RateLimited;
    }

    let count = state.notify_count;
    if count == 0 {
        return ThrottleDecision::Notify { tier: 0 };
    }
    if count >= policy.max_count {
        return ThrottleDecision::Exhausted;
    }

    let required = policy.interval_seconds().saturating_mul(count);
    if now - state.first_notify_time >= required {
        ThrottleDecision::Notify { tier: count }
    } else {
        ThrottleDecision::Waiting
    }
}

fn tier_label(tier: i64) -> String {
    match tier {
        0 => "first alert".to_string(),
        1 => "second reminder".to_string(),
        n => format!("reminder #{}", n + 1),
    }
}

pub fn alert_message(tier: i64, remaining: Decimal, threshold: Decimal, sent_at: &str) -> String {
    format!(
        "🔥 <b>Low gas supply</b> [{}]\n\n\
         ⚠️ Remaining: <b>{} m³</b>\n\
         📉 Below threshold: <b>{} m³</b>\n\n\
         💡 Please top up soon.\n\n\
         ⏰ Sent at: {}",
        tier_label(tier),
        units::fixed3(remaining),
        units::fixed3(threshold),
        sent_at,
    )
}

const STATE_WRITE_ATTEMPTS: u32 = 3;
const STATE_WRITE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);

async fn persist_with_retry(store: &dyn SettingsStore, state: &NotificationState) -> Result<(), StorageError> {
    let mut attempt: u32 = 1;
    loop {
        match state.store(store).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < STATE_WRITE_ATTEMPTS => {
                tracing::warn!(error = %e, attempt, "notification state write failed, retrying");
                tokio::time::sleep(STATE_WRITE_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    notify_count = state.notify_count,
                    "notification state write failed, giving up"
                );
                return Err(e);
            }
        }
    }
}

pub struct NotificationThrottle {
    store: Arc<dyn SettingsStore>,
    notifier: Arc<dyn Notifier>,
    calendar: LocalCalendar,
    // Check-and-update must not interleave, or two callers could send the same tier.
    lock: Mutex<()>,
}

impl NotificationThrottle {
    pub fn new(store: Arc<dyn SettingsStore>, notifier: Arc<dyn Notifier>, calendar: LocalCalendar) -> Self {
        Self {
            store,
            notifier,
            calendar,
            lock: Mutex::new(()),
        }
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Fire-and-forget wrapper around [`Self::evaluate`]; failures are logged.
    pub async fn check_and_notify(&self, policy: &NotifySettings, remaining: Decimal, now: OffsetDateTime) {
        if let Err(e) = self.evaluate(policy, remaining, now).await {
            tracing::warn!(error = %e, "low supply notification check failed");
        }
    }

    pub async fn evaluate(
        &self,
        policy: &NotifySettings,
        remaining: Decimal,
        now: OffsetDateTime,
    ) -> Result<ThrottleDecision, StorageError> {
        let _guard = self.lock.lock().await;

        let store = self.store.as_ref();
        let state = NotificationState::load(store).await?;
        let ts = now.unix_timestamp();
        let decision = decide(&state, policy, remaining, ts);

        match decision {
            ThrottleDecision::Recovered if !state.is_cleared() => {
                state.cleared().store(store).await?;
                tracing::info!(remaining = %remaining, "supply recovered, low supply episode cleared");
            }
            ThrottleDecision::Notify { tier } => {
                // Claim the rate-limit slot before sending.
                let pending = NotificationState {
                    revision: state.revision + 1,
                    last_notify_time: ts,
                    ..state.clone()
                };
                pending.store(store).await?;

                let message = alert_message(tier, remaining, policy.threshold, &self.calendar.format(now));
                match self.notifier.send(policy, &message).await {
                    Ok(()) => {
                        let sent = NotificationState {
                            revision: pending.revision + 1,
                            notify_count: state.notify_count + 1,
                            first_notify_time: if state.notify_count == 0 {
                                ts
                            } else {
                                state.first_notify_time
                            },
                            last_notify_time: ts,
                        };
                        // The alert is out; losing this write would resend the same tier.
                        persist_with_retry(store, &sent).await?;
                        tracing::info!(tier, remaining = %remaining, "low supply alert sent");
                    }
                    Err(e) => {
                        let rolled_back = NotificationState {
                            revision: pending.revision + 1,
                            ..state
                        };
                        persist_with_retry(store, &rolled_back).await?;
                        tracing::warn!(error = %e, tier, "low supply alert failed, will retry");
                    }
                }
            }
            _ => {}
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use time::macros::datetime;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, _channel: &NotifySettings, _message: &str) -> Result<(), SendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SendError::Status(500));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn policy() -> NotifySettings {
        NotifySettings {
            enabled: true,
            bot_token: "t".to_string(),
            chat_id: "c".to_string(),
            threshold: Decimal::new(50, 1),
            max_count: 2,
            interval_hours: Decimal::new(2, 0),
            ..NotifySettings::default()
        }
    }

    fn fixture() -> (Arc<MemoryStore>, Arc<RecordingNotifier>, NotificationThrottle) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let throttle = NotificationThrottle::new(store.clone(), notifier.clone(), LocalCalendar::default());
        (store, notifier, throttle)
    }

    const T0: OffsetDateTime = datetime!(2024-06-01 00:00:00 UTC);

    fn at(secs: i64) -> OffsetDateTime {
        T0 + time::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn escalation_schedule_until_exhausted_then_recovery() {
        let (store, notifier, throttle) = fixture();
        let p = policy();
        let low = Decimal::new(4, 0);

        assert_eq!(
            throttle.evaluate(&p, low, at(0)).await.unwrap(),
            ThrottleDecision::Notify { tier: 0 }
        );
        let state = NotificationState::load(store.as_ref()).await.unwrap();
        assert_eq!(state.notify_count, 1);
        assert_eq!(state.first_notify_time, T0.unix_timestamp());

        assert_eq!(
            throttle.evaluate(&p, low, at(3_600)).await.unwrap(),
            ThrottleDecision::Waiting
        );
        assert_eq!(
            throttle.evaluate(&p, low, at(2 * 3_600 + 60)).await.unwrap(),
            ThrottleDecision::Notify { tier: 1 }
        );
        assert_eq!(
            throttle.evaluate(&p, low, at(5 * 3_600)).await.unwrap(),
            ThrottleDecision::Exhausted
        );
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 2);
        assert_eq!(NotificationState::load(store.as_ref()).await.unwrap().notify_count, 2);

        assert_eq!(
            throttle.evaluate(&p, Decimal::new(6, 0), at(6 * 3_600)).await.unwrap(),
            ThrottleDecision::Recovered
        );
        assert!(NotificationState::load(store.as_ref()).await.unwrap().is_cleared());
    }

    #[tokio::test]
    async fn global_rate_limit_spans_episodes() {
        let (_, notifier, throttle) = fixture();
        let p = policy();
        let low = Decimal::new(1, 0);

        throttle.evaluate(&p, low, at(0)).await.unwrap();
        // Recovery clears the episode, including the last send time.
        throttle.evaluate(&p, Decimal::new(10, 0), at(5)).await.unwrap();
        assert_eq!(
            throttle.evaluate(&p, low, at(10)).await.unwrap(),
            ThrottleDecision::Notify { tier: 0 }
        );
        assert_eq!(
            throttle.evaluate(&p, low, at(20)).await.unwrap(),
            ThrottleDecision::RateLimited
        );
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_send_rolls_back_and_retries_same_tier() {
        let (store, notifier, throttle) = fixture();
        let p = policy();
        let low = Decimal::new(3, 0);

        notifier.fail.store(true, Ordering::SeqCst);
        assert_eq!(
            throttle.evaluate(&p, low, at(0)).await.unwrap(),
            ThrottleDecision::Notify { tier: 0 }
        );
        let state = NotificationState::load(store.as_ref()).await.unwrap();
        assert_eq!(state.notify_count, 0);
        assert_eq!(state.last_notify_time, 0);

        notifier.fail.store(false, Ordering::SeqCst);
        assert_eq!(
            throttle.evaluate(&p, low, at(1)).await.unwrap(),
            ThrottleDecision::Notify { tier: 0 }
        );
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
        assert_eq!(NotificationState::load(store.as_ref()).await.unwrap().notify_count, 1);
    }

    #[tokio::test]
    async fn disabled_or_unconfigured_channel_never_sends() {
        let (_, notifier, throttle) = fixture();
        let mut p = policy();
        p.enabled = false;
        assert_eq!(
            throttle.evaluate(&p, Decimal::ZERO, at(0)).await.unwrap(),
            ThrottleDecision::Disabled
        );

        let mut p = policy();
        p.chat_id.clear();
        assert_eq!(
            throttle.evaluate(&p, Decimal::ZERO, at(0)).await.unwrap(),
            ThrottleDecision::Disabled
        );
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 0);
    }

    /// Memory store whose `set` fails for the listed write numbers (1-based).
    struct FlakyStore {
        inner: MemoryStore,
        writes: AtomicUsize,
        fail_on: Vec<usize>,
    }

    #[async_trait::async_trait]
    impl SettingsStore for FlakyStore {
        async fn get(&self, key: &str, default: &str) -> Result<String, StorageError> {
            self.inner.get(key, default).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&n) {
                return Err(StorageError::Unavailable("database is locked".to_string()));
            }
            self.inner.set(key, value).await
        }

        async fn set_many(&self, entries: &[(String, String)]) -> Result<(), StorageError> {
            self.inner.set_many(entries).await
        }
    }

    #[tokio::test]
    async fn state_write_after_successful_send_is_retried() {
        // Write 1 claims the slot, write 2 (the post-send commit) fails once.
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            writes: AtomicUsize::new(0),
            fail_on: vec![2],
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let throttle = NotificationThrottle::new(store.clone(), notifier.clone(), LocalCalendar::default());
        let p = policy();
        let low = Decimal::new(4, 0);

        assert_eq!(
            throttle.evaluate(&p, low, at(0)).await.unwrap(),
            ThrottleDecision::Notify { tier: 0 }
        );
        let state = NotificationState::load(store.as_ref()).await.unwrap();
        assert_eq!(state.notify_count, 1);
        assert_eq!(state.first_notify_time, T0.unix_timestamp());

        // Past the rate limit but before the interval: the first tier is not repeated.
        assert_eq!(
            throttle.evaluate(&p, low, at(60)).await.unwrap(),
            ThrottleDecision::Waiting
        );
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_evaluations_send_one_alert() {
        let (store, notifier, throttle) = fixture();
        let throttle = Arc::new(throttle);
        let p = policy();

        let mut handles = Vec::new();
        for i in 0..8 {
            let throttle = throttle.clone();
            let p = p.clone();
            handles.push(tokio::spawn(async move {
                throttle.evaluate(&p, Decimal::new(2, 0), at(i)).await.unwrap()
            }));
        }

        let mut notified = 0;
        for h in handles {
            if matches!(h.await.unwrap(), ThrottleDecision::Notify { .. }) {
                notified += 1;
            }
        }

        assert_eq!(notified, 1);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
        assert_eq!(NotificationState::load(store.as_ref()).await.unwrap().notify_count, 1);
    }

    #[test]
    fn threshold_is_inclusive_for_recovery() {
        let p = policy();
        let state = NotificationState::default();
        assert_eq!(decide(&state, &p, Decimal::new(50, 1), 0), ThrottleDecision::Recovered);
        assert_eq!(
            decide(&state, &p, Decimal::new(4999, 3), 0),
            ThrottleDecision::Notify { tier: 0 }
        );
    }

    #[test]
    fn message_names_the_tier() {
        let m = alert_message(2, Decimal::new(42, 1), Decimal::new(5, 0), "2024-01-01 00:00:00");
        assert!(m.contains("reminder #3"));
        assert!(m.contains("4.200 m³"));
        assert!(m.contains("5.000 m³"));
    }
}
