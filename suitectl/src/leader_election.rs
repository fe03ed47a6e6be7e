use sqlx::{PgPool, Postgres, pool::PoolConnection};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Advisory lock key shared by every replica.
pub const LEADER_LOCK_ID: i64 = 0x5017_ec71;

/// Background task for leader election
/// Runs periodically to maintain leadership or attempt to acquire it
///
/// The leader runs the in-server seasonal credit schedule. PostgreSQL advisory locks are
/// session-based, so we keep a dedicated connection for as long as we hold the lock.
#[instrument(skip(pool, is_leader, shutdown))]
pub async fn leader_election_task(pool: PgPool, interval: Duration, is_leader: Arc<AtomicBool>, lock_id: i64, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    let mut leader_conn: Option<PoolConnection<Postgres>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match leader_conn.as_mut() {
            None => {
                if let Some(conn) = try_acquire(&pool, lock_id).await {
                    info!("Gained leadership");
                    leader_conn = Some(conn);
                    is_leader.store(true, Ordering::Relaxed);
                } else {
                    debug!("Following - will retry");
                }
            }
            Some(conn) => {
                // The lock lives as long as the session, so a live connection means we still hold it
                if let Err(e) = sqlx::query("SELECT 1").execute(&mut **conn).await {
                    warn!(error = %e, "Lost leadership (connection died)");
                    is_leader.store(false, Ordering::Relaxed);
                    leader_conn = None;
                }
            }
        }
    }

    if let Some(mut conn) = leader_conn {
        is_leader.store(false, Ordering::Relaxed);
        match sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(_) => info!("Released leadership"),
            Err(e) => warn!(error = %e, "Failed to release leader lock, it is dropped with the connection"),
        }
        // Do not return a session that may still hold the lock to the pool
        drop(conn.detach());
    }
}

async fn try_acquire(pool: &PgPool, lock_id: i64) -> Option<PoolConnection<Postgres>> {
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "Failed to acquire connection for leader election");
            return None;
        }
    };
    match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
        .bind(lock_id)
        .fetch_one(&mut *conn)
        .await
    {
        Ok(true) => Some(conn),
        Ok(false) => None,
        Err(e) => {
            error!(error = %e, "Failed to check leader lock");
            None
        }
    }
}
