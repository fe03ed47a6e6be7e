//! Database layer for data persistence and access.
//!
//! Uses SQLx with PostgreSQL and follows the repository pattern:
//!
//! ```text
//! ┌─────────────┐
//! │  Handlers   │  (API request handlers, jobs, onboarding)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │ Repositories│  (db::handlers - queries)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │   Models    │  (db::models - database records)
//! └──────┬──────┘
//!        ↓
//! ┌─────────────┐
//! │  PostgreSQL │
//! └─────────────┘
//! ```
//!
//! # Transactions
//!
//! Repositories wrap a `&mut PgConnection`, so they work equally on a pooled connection or an
//! open transaction. Multi-step writes (onboarding, usage recording) should create every
//! repository from the same transaction:
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//! let tenant = Tenants::new(&mut tx).create(&request).await?;
//! Credits::new(&mut tx).grant(&grant).await?;
//! tx.commit().await?;
//! ```
//!
//! Repository methods that write to several tables open a nested transaction (a savepoint when
//! the connection is already inside one).
//!
//! # Migrations
//!
//! Migrations live in `migrations/` and are embedded via [`crate::migrator`].

pub mod errors;
pub mod handlers;
pub mod models;
