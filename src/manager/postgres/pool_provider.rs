//! Read/write pool routing for [`PostgresStorage`](super::PostgresStorage).
//!
//! Verifier queues, request lookups and dashboard counts go to `read()`. Request
//! creation, stage transitions and issuance claims go to `write()`, as does any
//! query that locks rows. A bare `PgPool` serves both.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Source of the pools a storage backend runs its queries on.
///
/// # Example
///
/// ```ignore
/// use clearance::PoolProvider;
/// use sqlx::PgPool;
///
/// #[derive(Clone)]
/// struct Pools {
///     primary: PgPool,
///     replica: Option<PgPool>,
/// }
///
/// impl PoolProvider for Pools {
///     fn read(&self) -> &PgPool {
///         self.replica.as_ref().unwrap_or(&self.primary)
///     }
///
///     fn write(&self) -> &PgPool {
///         &self.primary
///     }
/// }
/// ```
pub trait PoolProvider: Clone + Send + Sync + 'static {
    /// Pool for reads that tolerate replica lag.
    fn read(&self) -> &PgPool;

    /// Primary pool: writes, transactions, `SELECT ... FOR UPDATE`, and reads that
    /// must observe a write made moments earlier.
    fn write(&self) -> &PgPool;
}

impl PoolProvider for PgPool {
    fn read(&self) -> &PgPool {
        self
    }

    fn write(&self) -> &PgPool {
        self
    }
}

/// Primary pool plus a read-only sibling on the same database, for tests.
///
/// Every connection in the sibling starts with `default_transaction_read_only`
/// set as a startup parameter, so a write misrouted through `read()` fails with
/// "cannot execute ... in a read-only transaction" instead of passing silently.
///
/// ```ignore
/// #[sqlx::test]
/// async fn test_something(pool: PgPool) {
///     let storage = PostgresStorage::new(TestDbPools::new(pool).await.unwrap());
/// }
/// ```
#[derive(Clone, Debug)]
pub struct TestDbPools {
    primary: PgPool,
    read_only: PgPool,
}

impl TestDbPools {
    pub async fn new(primary: PgPool) -> Result<Self, sqlx::Error> {
        let options = primary
            .connect_options()
            .as_ref()
            .clone()
            .options([("default_transaction_read_only", "on")]);
        let read_only = PgPoolOptions::new()
            .max_connections(primary.options().get_max_connections())
            .connect_with(options)
            .await?;
        Ok(Self { primary, read_only })
    }
}

impl PoolProvider for TestDbPools {
    fn read(&self) -> &PgPool {
        &self.read_only
    }

    fn write(&self) -> &PgPool {
        &self.primary
    }
}
