//! One-shot maintenance jobs, run from cron via `suitectl jobs <job>`.
//!
//! A job returns an error when it could not run or when any individual step failed, so the
//! process exits non-zero and cron surfaces it.

pub mod org_assignments;
pub mod seasonal_credits;

use chrono::Utc;
use tracing::info;

use crate::{config::{Config, JobCommand}, email::EmailService, identity};

pub use org_assignments::{OrgAssignmentFixer, OrgAssignmentReport};
pub use seasonal_credits::{SeasonalCreditJob, SeasonalReport};

pub async fn run(command: &JobCommand, config: &Config) -> anyhow::Result<()> {
    let pool = crate::connect_database(config).await?;

    match command {
        JobCommand::SeasonalCredits { dry_run } => {
            let email = EmailService::new(config)?;
            let report = SeasonalCreditJob::new(&pool, config, &email, None).run(Utc::now(), *dry_run).await?;
            info!(report = %serde_json::to_string(&report)?, "Seasonal credit job finished");
            if report.failures > 0 {
                anyhow::bail!("seasonal credit job finished with {} failures", report.failures);
            }
        }
        JobCommand::FixOrgAssignments(args) => {
            let provider = identity::create_provider(&config.identity)?;
            let report = OrgAssignmentFixer::new(&pool, provider.as_ref(), &config.identity, args).run().await?;
            info!(report = %serde_json::to_string(&report)?, "Organization assignment job finished");
            if report.has_failures() {
                anyhow::bail!("organization assignment job finished with {} failures", report.failures);
            }
        }
    }

    pool.close().await;
    Ok(())
}
