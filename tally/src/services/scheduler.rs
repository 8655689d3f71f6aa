/// Scheduler Service
/// Runs periodic sync and recurring materialization on a cron schedule
use crate::error::{AppError, Result};
use crate::session::Session;
use crate::sync::{MaterializeReport, RecurringMaterializer, SyncManager, SyncReport};
use chrono::Local;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Auto-sync frequency options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFrequency {
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

/// When a scheduled job fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Cron(String),
    /// Fixed interval from when the job was added
    Every(Duration),
}

impl SyncFrequency {
    /// Minute and hour steps divide the next unit evenly, so the cron step
    /// never resets early at the top of the hour or day. Multi-day
    /// frequencies run on a fixed interval instead.
    pub fn trigger(self) -> Trigger {
        match self {
            SyncFrequency::Minutes(1) => Trigger::Cron("0 * * * * *".to_string()),
            SyncFrequency::Minutes(m) => Trigger::Cron(format!("0 */{} * * * *", m)),
            SyncFrequency::Hours(1) => Trigger::Cron("0 0 * * * *".to_string()),
            SyncFrequency::Hours(h) => Trigger::Cron(format!("0 0 */{} * * *", h)),
            // Daily at 3 AM
            SyncFrequency::Days(1) => Trigger::Cron("0 0 3 * * *".to_string()),
            SyncFrequency::Days(d) => {
                Trigger::Every(Duration::from_secs(u64::from(d) * 24 * 60 * 60))
            }
        }
    }
}

impl FromStr for SyncFrequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Supports "15m", "2h", "1d" plus "hourly" and "daily"
        let s = s.trim().to_lowercase();

        match s.as_str() {
            "hourly" => return Ok(SyncFrequency::Hours(1)),
            "daily" => return Ok(SyncFrequency::Days(1)),
            _ => {}
        }

        let Some(unit) = s.chars().last() else {
            return Err("Empty frequency string".to_string());
        };
        let number_part = &s[..s.len() - unit.len_utf8()];

        let value: u32 = number_part
            .parse()
            .map_err(|_| format!("Invalid number in frequency: {}", s))?;

        if value == 0 {
            return Err("Frequency value must be greater than 0".to_string());
        }

        match unit {
            'm' if 60 % value == 0 && value < 60 => Ok(SyncFrequency::Minutes(value)),
            'm' => Err(format!(
                "Minute frequency must divide 60 evenly (1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30), got {}",
                value
            )),
            'h' if 24 % value == 0 && value < 24 => Ok(SyncFrequency::Hours(value)),
            'h' => Err(format!(
                "Hour frequency must divide 24 evenly (1, 2, 3, 4, 6, 8, 12), got {}",
                value
            )),
            'd' => Ok(SyncFrequency::Days(value)),
            _ => Err(format!(
                "Invalid frequency unit '{}'. Use 'm' (minutes), 'h' (hours), or 'd' (days)",
                unit
            )),
        }
    }
}

/// One scheduled cycle: sync, then catch up recurring templates to today.
///
/// Materialization is skipped when nobody is signed in.
pub async fn run_cycle(
    manager: &SyncManager,
    materializer: &RecurringMaterializer,
    session: &Session,
) -> Result<(SyncReport, Option<MaterializeReport>)> {
    if !manager.is_online() && manager.check_connectivity().await {
        tracing::info!("Remote reachable again");
    }

    let sync = manager.sync().await?;

    let materialized = match session.actor() {
        Some(actor) => Some(
            materializer
                .materialize_due(Local::now().date_naive(), &actor)
                .await?,
        ),
        None => None,
    };

    Ok((sync, materialized))
}

fn sync_job(
    manager: SyncManager,
    materializer: RecurringMaterializer,
    session: Session,
) -> impl FnMut(Uuid, JobScheduler) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static
{
    move |_uuid: Uuid, _l: JobScheduler| -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let manager = manager.clone();
        let materializer = materializer.clone();
        let session = session.clone();
        Box::pin(async move {
            tracing::info!("Running scheduled sync");

            match run_cycle(&manager, &materializer, &session).await {
                Ok((sync, materialized)) => {
                    tracing::info!(
                        "Scheduled sync done: {} replayed, {} materialized",
                        sync.drain.succeeded,
                        materialized.map_or(0, |m| m.generated)
                    );
                }
                Err(e) => {
                    tracing::error!("Scheduled sync failed: {}", e);
                }
            }
        })
    }
}

/// Scheduler service for periodic sync
pub struct SyncScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    manager: SyncManager,
    materializer: RecurringMaterializer,
    session: Session,
    current_job_id: Arc<RwLock<Option<Uuid>>>,
}

impl SyncScheduler {
    /// Create new scheduler service
    pub async fn new(
        manager: SyncManager,
        materializer: RecurringMaterializer,
        session: Session,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            manager,
            materializer,
            session,
            current_job_id: Arc::new(RwLock::new(None)),
        })
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.read().await;
        scheduler
            .start()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to start scheduler: {}", e)))?;
        tracing::info!("Sync scheduler started");
        Ok(())
    }

    /// Schedule periodic sync, replacing any existing schedule
    pub async fn schedule_sync(&self, frequency: SyncFrequency, enabled: bool) -> Result<()> {
        self.cancel_sync().await?;

        if !enabled {
            tracing::info!("Automatic sync disabled");
            return Ok(());
        }

        let trigger = frequency.trigger();
        let run = sync_job(
            self.manager.clone(),
            self.materializer.clone(),
            self.session.clone(),
        );

        let job = match &trigger {
            Trigger::Cron(expr) => Job::new_async(expr.as_str(), run),
            Trigger::Every(interval) => Job::new_repeated_async(*interval, run),
        }
        .map_err(|e| AppError::Scheduler(format!("Failed to create sync job: {}", e)))?;

        let job_id = job.guid();

        let scheduler = self.scheduler.write().await;
        scheduler
            .add(job)
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to schedule job: {}", e)))?;

        let mut current_job = self.current_job_id.write().await;
        *current_job = Some(job_id);

        tracing::info!("Automatic sync scheduled: {:?} ({:?})", frequency, trigger);
        Ok(())
    }

    /// Cancel scheduled sync
    pub async fn cancel_sync(&self) -> Result<()> {
        let mut current_job = self.current_job_id.write().await;

        if let Some(job_id) = *current_job {
            let scheduler = self.scheduler.write().await;
            scheduler
                .remove(&job_id)
                .await
                .map_err(|e| AppError::Scheduler(format!("Failed to remove job: {}", e)))?;

            *current_job = None;
            tracing::info!("Automatic sync schedule cancelled");
        }

        Ok(())
    }

    /// Shutdown scheduler gracefully
    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.write().await;
        scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to shutdown scheduler: {}", e)))?;
        tracing::info!("Sync scheduler shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frequencies() {
        assert_eq!("15m".parse::<SyncFrequency>().unwrap(), SyncFrequency::Minutes(15));
        assert_eq!(" 2H ".parse::<SyncFrequency>().unwrap(), SyncFrequency::Hours(2));
        assert_eq!("1d".parse::<SyncFrequency>().unwrap(), SyncFrequency::Days(1));
        assert_eq!("hourly".parse::<SyncFrequency>().unwrap(), SyncFrequency::Hours(1));
        assert_eq!("daily".parse::<SyncFrequency>().unwrap(), SyncFrequency::Days(1));
    }

    #[test]
    fn test_reject_invalid_frequencies() {
        for bad in ["", "0m", "90m", "45m", "7m", "30h", "5h", "5w", "m", "sometimes"] {
            assert!(bad.parse::<SyncFrequency>().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_triggers() {
        let cron = |f: SyncFrequency| match f.trigger() {
            Trigger::Cron(expr) => expr,
            other => panic!("expected cron, got {:?}", other),
        };
        assert_eq!(cron(SyncFrequency::Minutes(1)), "0 * * * * *");
        assert_eq!(cron(SyncFrequency::Minutes(15)), "0 */15 * * * *");
        assert_eq!(cron(SyncFrequency::Hours(1)), "0 0 * * * *");
        assert_eq!(cron(SyncFrequency::Hours(6)), "0 0 */6 * * *");
        assert_eq!(cron(SyncFrequency::Days(1)), "0 0 3 * * *");

        assert_eq!(
            SyncFrequency::Days(3).trigger(),
            Trigger::Every(Duration::from_secs(3 * 24 * 60 * 60))
        );
    }

    #[test]
    fn test_every_accepted_step_divides_its_unit() {
        for m in 1..60 {
            if let Ok(SyncFrequency::Minutes(m)) = format!("{}m", m).parse() {
                assert_eq!(60 % m, 0, "{}m", m);
            }
        }
        for h in 1..24 {
            if let Ok(SyncFrequency::Hours(h)) = format!("{}h", h).parse() {
                assert_eq!(24 % h, 0, "{}h", h);
            }
        }
        assert!("20m".parse::<SyncFrequency>().is_ok());
        assert!("8h".parse::<SyncFrequency>().is_ok());
    }
}
