use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::executor::ClaimExecutor;
use crate::gateway::AuthenticatedRequester;
use crate::reporter;
use crate::state::{Eligibility, RaceStats};
use crate::timing::{
    HumanDelay, HumanDelayConfig, catchup_delay, elapsed_seconds, human_delay, secs_to_duration,
};
use crate::types::{Decision, FeedEventData, FeedMessage, PendingClaim, QuestionPayload, SkipReason};

/// Timing rules for the race.
#[derive(Debug, Clone, Copy)]
pub struct RaceSettings {
    pub max_age_secs: f64,
    pub min_lock_age_secs: f64,
    pub human: HumanDelayConfig,
    /// Re-read the eligibility flag right before firing.
    pub recheck_eligibility: bool,
}

/// Decide whether an event is worth racing for.
///
/// Actionable iff the session may lock, the question is unlocked and it is
/// younger than `max_age`.
pub fn classify(can_lock: bool, is_locked: bool, age: f64, max_age: f64) -> Decision {
    if !can_lock {
        Decision::Skip(SkipReason::NotEligible)
    } else if is_locked {
        Decision::Skip(SkipReason::AlreadyLocked)
    } else if age.is_nan() || age >= max_age {
        Decision::Skip(SkipReason::TooOld)
    } else {
        Decision::Dispatch
    }
}

/// Total wait before firing: catch-up to `min_lock_age`, then a human delay.
pub fn plan_wait<R: Rng>(rng: &mut R, age: f64, settings: &RaceSettings) -> (f64, HumanDelay) {
    let catchup = catchup_delay(age, settings.min_lock_age_secs);
    let human = human_delay(rng, &settings.human);
    (catchup + human.secs(), human)
}

/// Parse a raw feed frame. `Ok(None)` for frames that carry no event.
pub fn parse_frame(text: &str) -> Result<Option<QuestionPayload>> {
    let msg: FeedMessage = serde_json::from_str(text).context("feed frame is not JSON")?;
    if msg.kind != "event" {
        return Ok(None);
    }
    let data: FeedEventData =
        serde_json::from_value(msg.data).context("event frame without a question payload")?;
    debug!("Feed event {} [{}]", data.payload.id, data.events.join(", "));
    Ok(Some(data.payload))
}

/// Classifies feed events and turns actionable ones into delayed claims.
///
/// Every scheduled claim runs as its own task in a `JoinSet`, so feed
/// consumption never waits on a claim and shutdown can drain or abort them.
pub struct RaceController<R> {
    executor: Arc<ClaimExecutor<R>>,
    eligibility: Eligibility,
    stats: Arc<RaceStats>,
    settings: RaceSettings,
    claims: JoinSet<()>,
}

impl<R: AuthenticatedRequester> RaceController<R> {
    pub fn new(
        executor: Arc<ClaimExecutor<R>>,
        eligibility: Eligibility,
        stats: Arc<RaceStats>,
        settings: RaceSettings,
    ) -> Self {
        Self {
            executor,
            eligibility,
            stats,
            settings,
            claims: JoinSet::new(),
        }
    }

    /// Claims scheduled and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.claims.len()
    }

    /// Handle one raw text frame from the feed. Malformed frames are
    /// dropped; they never affect the connection.
    pub fn handle_frame(&mut self, text: &str) -> Option<Decision> {
        match parse_frame(text) {
            Ok(Some(payload)) => self.handle_event(&payload, Utc::now()),
            Ok(None) => {
                debug!("Ignoring non-event frame");
                None
            }
            Err(e) => {
                RaceStats::bump(&self.stats.events_malformed);
                warn!("Dropping malformed feed frame: {e:#}");
                None
            }
        }
    }

    /// Classify an event received at `now` and dispatch it if actionable.
    pub fn handle_event(&mut self, payload: &QuestionPayload, now: DateTime<Utc>) -> Option<Decision> {
        let age = match elapsed_seconds(&payload.created_at, now) {
            Ok(age) => age,
            Err(e) => {
                RaceStats::bump(&self.stats.events_malformed);
                warn!("Dropping event {}: {e:#}", payload.id);
                return None;
            }
        };
        RaceStats::bump(&self.stats.events_seen);
        info!("{} | age: {age:.2}s | locked: {}", payload.id, payload.is_locked);

        let decision = classify(
            self.eligibility.can_lock(),
            payload.is_locked,
            age,
            self.settings.max_age_secs,
        );
        match decision {
            Decision::Dispatch => {
                self.dispatch(&payload.id, age);
            }
            Decision::Skip(reason) => {
                self.stats.record_skip(reason);
                info!("Skipped {} ({})", payload.id, reason.label());
            }
        }
        Some(decision)
    }

    /// Schedule a claim for `question_id` and return immediately.
    pub fn dispatch(&mut self, question_id: &str, age: f64) -> PendingClaim {
        let (wait, human) = {
            let mut rng = rand::thread_rng();
            plan_wait(&mut rng, age, &self.settings)
        };
        match human {
            HumanDelay::Hesitation(s) => info!("Scheduling lock for {question_id} in {wait:.2}s (hesitation {s:.2}s)"),
            HumanDelay::Fast(s) => info!("Scheduling lock for {question_id} in {wait:.2}s (fast {s:.2}s)"),
        }

        let pending = PendingClaim {
            question_id: question_id.to_string(),
            age_secs: age,
            wait_secs: wait,
        };
        RaceStats::bump(&self.stats.claims_scheduled);

        let executor = self.executor.clone();
        let eligibility = self.eligibility.clone();
        let stats = self.stats.clone();
        let recheck = self.settings.recheck_eligibility;
        let id = pending.question_id.clone();
        self.claims.spawn(async move {
            tokio::time::sleep(secs_to_duration(wait)).await;
            if recheck && !eligibility.can_lock() {
                RaceStats::bump(&stats.claims_dropped);
                info!("Dropped lock for {id}: lock already held");
                return;
            }
            let outcome = executor.claim(&id).await;
            if outcome.dry_run {
                RaceStats::bump(&stats.claims_dry_run);
            } else if outcome.success {
                RaceStats::bump(&stats.claims_succeeded);
            } else {
                RaceStats::bump(&stats.claims_failed);
            }
            reporter::report_claim(&outcome);
        });

        pending
    }

    /// Collect finished claim tasks without waiting.
    pub fn reap(&mut self) {
        while let Some(result) = self.claims.try_join_next() {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!("Claim task failed: {e}");
                }
            }
        }
    }

    /// Consume frames until the feed channel closes or shutdown fires.
    pub async fn run(&mut self, mut frames: mpsc::Receiver<String>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(text) => {
                        self.handle_frame(&text);
                        self.reap();
                    }
                    None => {
                        warn!("Feed channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Wait up to `grace` for in-flight claims, then abort the rest.
    /// Returns the number of aborted claims.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        if self.claims.is_empty() {
            return 0;
        }
        info!("Waiting up to {grace:?} for {} in-flight claim(s)...", self.claims.len());
        let drained = tokio::time::timeout(grace, async {
            while self.claims.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }

        let aborted = self.claims.len();
        warn!("Aborting {aborted} pending claim(s)");
        self.claims.shutdown().await;
        self.stats
            .claims_aborted
            .fetch_add(aborted as u64, std::sync::atomic::Ordering::Relaxed);
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeRequester;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    const MAX_AGE: f64 = 20.0;
    const MIN_LOCK_AGE: f64 = 0.2;

    fn settings(hesitation_probability: f64) -> RaceSettings {
        RaceSettings {
            max_age_secs: MAX_AGE,
            min_lock_age_secs: MIN_LOCK_AGE,
            human: HumanDelayConfig {
                hesitation_probability,
                hesitation_secs: 2.0,
                fast_min_secs: 0.2,
                fast_max_secs: 0.5,
            },
            recheck_eligibility: false,
        }
    }

    fn controller(
        fake: FakeRequester,
        settings: RaceSettings,
    ) -> (Arc<FakeRequester>, Eligibility, RaceController<FakeRequester>) {
        let fake = Arc::new(fake);
        let executor = Arc::new(ClaimExecutor::new(
            fake.clone(),
            "https://example.test/v1/functions/lock-doubt/executions".into(),
            "proj".into(),
            false,
        ));
        let flag = Eligibility::new(true);
        let ctl = RaceController::new(executor, flag.clone(), Arc::new(RaceStats::new()), settings);
        (fake, flag, ctl)
    }

    fn event_frame(id: &str, locked: bool, created_at: DateTime<Utc>) -> String {
        json!({
            "type": "event",
            "data": {
                "events": [format!("databases.db.collections.c.documents.{id}.create")],
                "payload": {
                    "$id": id,
                    "isLocked": locked,
                    "$createdAt": created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                }
            }
        })
        .to_string()
    }

    fn claimed_ids(fake: &FakeRequester) -> Vec<String> {
        fake.requests()
            .iter()
            .filter_map(|r| r.body.as_deref())
            .map(|b| {
                let outer: serde_json::Value = serde_json::from_str(b).unwrap();
                let inner: serde_json::Value =
                    serde_json::from_str(outer["data"].as_str().unwrap()).unwrap();
                inner["questionId"].as_str().unwrap().to_string()
            })
            .collect()
    }

    // ── classify ───────────────────────────────────────────────────

    #[test]
    fn fresh_unlocked_eligible_dispatches() {
        assert_eq!(classify(true, false, 0.0, MAX_AGE), Decision::Dispatch);
        assert_eq!(classify(true, false, 19.99, MAX_AGE), Decision::Dispatch);
        assert_eq!(classify(true, false, -2.0, MAX_AGE), Decision::Dispatch);
    }

    #[test]
    fn old_events_never_dispatch() {
        for age in [20.0, 20.01, 25.0, 1e6] {
            for can_lock in [true, false] {
                for locked in [true, false] {
                    assert_ne!(classify(can_lock, locked, age, MAX_AGE), Decision::Dispatch);
                }
            }
        }
        assert_eq!(
            classify(true, false, 25.0, MAX_AGE),
            Decision::Skip(SkipReason::TooOld)
        );
        assert_ne!(classify(true, false, f64::NAN, MAX_AGE), Decision::Dispatch);
    }

    #[test]
    fn locked_events_never_dispatch() {
        for age in [-1.0, 0.0, 5.0, 30.0] {
            for can_lock in [true, false] {
                assert_ne!(classify(can_lock, true, age, MAX_AGE), Decision::Dispatch);
            }
        }
    }

    #[test]
    fn ineligible_never_dispatches() {
        for age in [-1.0, 0.0, 0.1, 19.0] {
            assert_eq!(
                classify(false, false, age, MAX_AGE),
                Decision::Skip(SkipReason::NotEligible)
            );
        }
    }

    // ── plan_wait ──────────────────────────────────────────────────

    #[test]
    fn wait_covers_catchup() {
        let mut rng = StdRng::seed_from_u64(11);
        let s = settings(0.10);
        for i in 0..2_000 {
            let age = -0.5 + (i as f64) * 0.001;
            let (wait, _) = plan_wait(&mut rng, age, &s);
            assert!(wait >= MIN_LOCK_AGE - age, "age {age} wait {wait}");
        }
    }

    #[test]
    fn wait_is_catchup_plus_human() {
        let mut rng = StdRng::seed_from_u64(5);
        let s = settings(1.0);
        let (wait, human) = plan_wait(&mut rng, 0.05, &s);
        assert_eq!(human, HumanDelay::Hesitation(2.0));
        assert!((wait - 2.15).abs() < 1e-9);
    }

    // ── parse_frame ────────────────────────────────────────────────

    #[test]
    fn non_event_frames_are_ignored() {
        let frame = json!({ "type": "connected", "data": { "channels": [], "user": null } });
        assert!(parse_frame(&frame.to_string()).unwrap().is_none());
        let frame = json!({ "type": "response", "data": { "to": "authentication" } });
        assert!(parse_frame(&frame.to_string()).unwrap().is_none());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"type":"event","data":{}}"#).is_err());
    }

    #[test]
    fn event_names_are_optional() {
        let frame = json!({
            "type": "event",
            "data": { "payload": { "$id": "q1", "$createdAt": "2024-05-01T12:00:00Z" } }
        });
        let payload = parse_frame(&frame.to_string()).unwrap().unwrap();
        assert_eq!(payload.id, "q1");
    }

    // ── controller ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn fresh_event_claims_within_window() {
        let (fake, _, mut ctl) = controller(FakeRequester::always(201, "{}"), settings(0.0));
        let decision = ctl.handle_frame(&event_frame("q1", false, Utc::now()));
        assert_eq!(decision, Some(Decision::Dispatch));
        assert_eq!(ctl.in_flight(), 1);

        // Catch-up (~0.2s) plus at least 0.2s fast delay.
        tokio::time::sleep(Duration::from_millis(390)).await;
        assert!(fake.requests().is_empty());

        tokio::time::sleep(Duration::from_millis(320)).await;
        assert_eq!(claimed_ids(&fake), vec!["q1".to_string()]);
        assert_eq!(ctl.shutdown(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn locked_event_is_never_claimed() {
        let (fake, _, mut ctl) = controller(FakeRequester::always(201, "{}"), settings(0.1));
        let decision = ctl.handle_frame(&event_frame("q2", true, Utc::now()));
        assert_eq!(decision, Some(Decision::Skip(SkipReason::AlreadyLocked)));
        assert_eq!(ctl.in_flight(), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fake.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_event_is_skipped() {
        let (fake, _, mut ctl) = controller(FakeRequester::always(201, "{}"), settings(0.1));
        let created = Utc::now() - chrono::Duration::seconds(25);
        let decision = ctl.handle_frame(&event_frame("q3", false, created));
        assert_eq!(decision, Some(Decision::Skip(SkipReason::TooOld)));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fake.requests().is_empty());
        assert_eq!(ctl.stats.summary().skipped_too_old, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_skips_fresh_event() {
        let (fake, flag, mut ctl) = controller(FakeRequester::always(201, "{}"), settings(0.1));
        flag.set(false);
        let decision = ctl.handle_frame(&event_frame("q4", false, Utc::now()));
        assert_eq!(decision, Some(Decision::Skip(SkipReason::NotEligible)));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fake.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_is_not_retried_and_listening_continues() {
        let (fake, _, mut ctl) = controller(FakeRequester::always(409, "taken"), settings(0.1));
        let (tx, rx) = mpsc::channel(16);
        let (_stop, shutdown) = watch::channel(false);

        tx.send(event_frame("q5", false, Utc::now())).await.unwrap();
        let run = async move {
            ctl.run(rx, shutdown).await;
            ctl
        };
        let feeder = async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            tx.send(event_frame("q6", false, Utc::now())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(tx);
        };
        let (ctl, ()) = tokio::join!(run, feeder);

        assert_eq!(claimed_ids(&fake), vec!["q5".to_string(), "q6".to_string()]);
        let summary = ctl.stats.summary();
        assert_eq!(summary.claims_failed, 2);
        assert_eq!(summary.claims_succeeded, 0);
        assert_eq!(ctl.shutdown(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn claims_run_concurrently() {
        let (fake, _, mut ctl) = controller(FakeRequester::always(201, "{}"), settings(1.0));
        for id in ["a", "b", "c"] {
            ctl.handle_frame(&event_frame(id, false, Utc::now()));
        }
        assert_eq!(ctl.in_flight(), 3);
        // All three hesitate 2s; serial execution would need 6s.
        tokio::time::sleep(Duration::from_millis(2_300)).await;
        assert_eq!(fake.requests().len(), 3);
        ctl.reap();
        assert_eq!(ctl.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_drops_claim_when_paused() {
        let mut s = settings(1.0);
        s.recheck_eligibility = true;
        let (fake, flag, mut ctl) = controller(FakeRequester::always(201, "{}"), s);
        ctl.handle_frame(&event_frame("q7", false, Utc::now()));
        flag.set(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(fake.requests().is_empty());
        assert_eq!(ctl.stats.summary().claims_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn without_recheck_claim_fires_after_pause() {
        let (fake, flag, mut ctl) = controller(FakeRequester::always(201, "{}"), settings(1.0));
        ctl.handle_frame(&event_frame("q8", false, Utc::now()));
        flag.set(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(claimed_ids(&fake), vec!["q8".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_claims_past_grace() {
        let mut s = settings(1.0);
        s.human.hesitation_secs = 30.0;
        let (fake, _, mut ctl) = controller(FakeRequester::always(201, "{}"), s);
        ctl.handle_frame(&event_frame("q9", false, Utc::now()));
        let stats = ctl.stats.clone();
        assert_eq!(ctl.shutdown(Duration::from_secs(1)).await, 1);
        assert!(fake.requests().is_empty());
        assert_eq!(stats.summary().claims_aborted, 1);
    }

    #[tokio::test]
    async fn malformed_frames_are_counted() {
        let (_, _, mut ctl) = controller(FakeRequester::always(201, "{}"), settings(0.1));
        assert!(ctl.handle_frame("{not json").is_none());
        assert!(ctl.handle_frame(r#"{"type":"event","data":{"payload":{"$id":"x","$createdAt":"nope"}}}"#).is_none());
        let summary = ctl.stats.summary();
        assert_eq!(summary.events_malformed, 2);
        assert_eq!(summary.events_seen, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_signal() {
        let (_, _, mut ctl) = controller(FakeRequester::always(201, "{}"), settings(0.1));
        let (tx, rx) = mpsc::channel::<String>(16);
        let (stop, shutdown) = watch::channel(false);

        let run = tokio::spawn(async move {
            ctl.run(rx, shutdown).await;
            ctl
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!run.is_finished());

        stop.send(true).unwrap();
        let ctl = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run returns after shutdown")
            .unwrap();
        // The feed side is still open.
        assert!(!tx.is_closed());
        assert_eq!(ctl.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_claims_are_not_counted_as_locked() {
        let fake = Arc::new(FakeRequester::always(201, "{}"));
        let executor = Arc::new(ClaimExecutor::new(
            fake.clone(),
            "https://example.test/v1/functions/lock-doubt/executions".into(),
            "proj".into(),
            true,
        ));
        let mut ctl = RaceController::new(
            executor,
            Eligibility::new(true),
            Arc::new(RaceStats::new()),
            settings(0.0),
        );
        ctl.handle_frame(&event_frame("q10", false, Utc::now()));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(fake.requests().is_empty());
        let summary = ctl.stats.summary();
        assert_eq!(summary.claims_dry_run, 1);
        assert_eq!(summary.claims_succeeded, 0);
        assert_eq!(summary.claims_failed, 0);
    }
}
