use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{count_locked_by, fetch_identity};
use crate::gateway::AuthenticatedRequester;
use crate::state::{Eligibility, RaceStats};
use crate::timing::{secs_to_duration, uniform_delay};

/// Periodically asks the server whether this session already holds a lock
/// and publishes the answer as the eligibility flag.
pub struct LockMonitor<R> {
    requester: Arc<R>,
    account_url: String,
    questions_url: String,
    project_id: String,
    eligibility: Eligibility,
    stats: Arc<RaceStats>,
    interval_min_secs: f64,
    interval_max_secs: f64,
}

impl<R: AuthenticatedRequester> LockMonitor<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requester: Arc<R>,
        account_url: String,
        questions_url: String,
        project_id: String,
        eligibility: Eligibility,
        stats: Arc<RaceStats>,
        interval_min_secs: f64,
        interval_max_secs: f64,
    ) -> Self {
        Self {
            requester,
            account_url,
            questions_url,
            project_id,
            eligibility,
            stats,
            interval_min_secs,
            interval_max_secs,
        }
    }

    /// Number of questions locked by the current identity.
    pub async fn query_locks(&self) -> Result<u64> {
        let user_id =
            fetch_identity(self.requester.as_ref(), &self.account_url, &self.project_id).await?;
        count_locked_by(
            self.requester.as_ref(),
            &self.questions_url,
            &self.project_id,
            &user_id,
        )
        .await
    }

    /// Run one check and update the flag. On error the flag keeps its
    /// previous value.
    pub async fn check_once(&self) {
        RaceStats::bump(&self.stats.monitor_checks);
        match self.query_locks().await {
            Ok(total) => {
                let can_lock = total == 0;
                let previous = self.eligibility.set(can_lock);
                if previous != can_lock {
                    if can_lock {
                        info!("No lock held, bot active");
                    } else {
                        info!("{total} question(s) already locked, paused until next check");
                    }
                } else {
                    debug!("Lock check unchanged (locked: {total}, can_lock: {can_lock})");
                }
            }
            Err(e) => {
                RaceStats::bump(&self.stats.monitor_failures);
                warn!(
                    "Lock monitor check failed: {e:#} (keeping can_lock={})",
                    self.eligibility.can_lock()
                );
            }
        }
    }

    /// Check at random intervals (60-90s by default) until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Lock monitor started (every {:.0}-{:.0}s)",
            self.interval_min_secs, self.interval_max_secs
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = {
                let mut rng = rand::thread_rng();
                uniform_delay(&mut rng, self.interval_min_secs, self.interval_max_secs)
            };
            tokio::select! {
                _ = tokio::time::sleep(secs_to_duration(wait)) => self.check_once().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("Lock monitor stopped");
    }
}
