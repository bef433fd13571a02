// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Pooled database access with per session settings and query tracing.

use sqlx::{
    pool::PoolOptions,
    postgres::PgRow,
    Executor,
    PgConnection,
    Pool,
    Postgres,
    Transaction,
};
use tracing::info;

use crate::{config::Config, ddl::quote_literal, Error};

pub(crate) struct Db {
    pool: Pool<Postgres>,
    show_queries: bool,
}

impl Db {
    /// Opens a pool of `jobs` connections.
    ///
    /// Every connection runs with the configured `lock_timeout`, `work_mem`
    /// and `maintenance_work_mem`, no matter which task ends up using it.
    pub(crate) async fn connect(config: &Config) -> Result<Self, Error> {
        let session_setup = format!(
            "SET lock_timeout = {};\nSET work_mem = {};\nSET maintenance_work_mem = {};",
            quote_literal(&format!("{}s", config.lock_timeout)),
            quote_literal(&config.work_mem),
            quote_literal(&config.work_mem),
        );
        let jobs = config.jobs.max(1) as u32;

        let pool = PoolOptions::new()
            .min_connections(jobs)
            .max_connections(jobs)
            .after_connect(move |connection: &mut PgConnection, _meta| {
                let session_setup = session_setup.clone();
                Box::pin(async move {
                    connection.execute(session_setup.as_str()).await?;
                    Ok(())
                })
            })
            .connect_with(config.to_connect_options())
            .await?;

        Ok(Self {
            pool,
            show_queries: config.show_queries,
        })
    }

    pub(crate) fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub(crate) fn trace(&self, sql: &str) {
        if self.show_queries && !sql.is_empty() {
            info!("query: {sql}");
        }
    }

    /// Runs one or more statements, discarding any results.
    ///
    /// Empty input is a no-op so that optional pre-rendered fragments can be
    /// passed through unchecked.
    pub(crate) async fn execute(&self, sql: &str) -> Result<(), Error> {
        if sql.is_empty() {
            return Ok(());
        }
        self.trace(sql);
        self.pool.execute(sql).await?;
        Ok(())
    }

    pub(crate) async fn fetch_all(&self, sql: &str) -> Result<Vec<PgRow>, Error> {
        self.trace(sql);
        Ok(self.pool.fetch_all(sql).await?)
    }

    pub(crate) async fn fetch_optional(&self, sql: &str) -> Result<Option<PgRow>, Error> {
        self.trace(sql);
        Ok(self.pool.fetch_optional(sql).await?)
    }

    pub(crate) async fn fetch_scalar<T>(&self, sql: &str) -> Result<T, Error>
    where
        T: Send + Unpin,
        (T,): for<'r> sqlx::FromRow<'r, PgRow>,
    {
        self.trace(sql);
        Ok(sqlx::query_scalar(sql).fetch_one(&self.pool).await?)
    }

    /// Starts a transaction on a dedicated connection.
    ///
    /// The transaction rolls back when the scope is left without an explicit
    /// [`DbTransaction::commit()`].
    pub(crate) async fn begin(&self) -> Result<DbTransaction, Error> {
        Ok(DbTransaction {
            inner: self.pool.begin().await?,
            show_queries: self.show_queries,
        })
    }
}

pub(crate) struct DbTransaction {
    inner: Transaction<'static, Postgres>,
    show_queries: bool,
}

impl DbTransaction {
    fn trace(&self, sql: &str) {
        if self.show_queries && !sql.is_empty() {
            info!("query: {sql}");
        }
    }

    pub(crate) async fn execute(&mut self, sql: &str) -> Result<(), Error> {
        if sql.is_empty() {
            return Ok(());
        }
        self.trace(sql);
        (&mut *self.inner).execute(sql).await?;
        Ok(())
    }

    pub(crate) async fn fetch_all(&mut self, sql: &str) -> Result<Vec<PgRow>, Error> {
        self.trace(sql);
        Ok((&mut *self.inner).fetch_all(sql).await?)
    }

    pub(crate) async fn fetch_scalar<T>(&mut self, sql: &str) -> Result<T, Error>
    where
        T: Send + Unpin,
        (T,): for<'r> sqlx::FromRow<'r, PgRow>,
    {
        self.trace(sql);
        Ok(sqlx::query_scalar(sql).fetch_one(&mut *self.inner).await?)
    }

    pub(crate) async fn commit(self) -> Result<(), Error> {
        Ok(self.inner.commit().await?)
    }
}

/// The error classes the orchestrator reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SqlErrorKind {
    LockNotAvailable,
    DeadlockDetected,
    QueryCanceled,
    Other,
}

impl SqlErrorKind {
    pub(crate) fn of(error: &Error) -> Self {
        error
            .downcast_ref::<sqlx::Error>()
            .and_then(|error| match error {
                sqlx::Error::Database(error) => error.code().map(|code| code.into_owned()),
                _ => None,
            })
            .map_or(Self::Other, |code| Self::from_sqlstate(&code))
    }

    fn from_sqlstate(code: &str) -> Self {
        match code {
            "55P03" => Self::LockNotAvailable,
            "40P01" => Self::DeadlockDetected,
            "57014" => Self::QueryCanceled,
            _ => Self::Other,
        }
    }

    /// Lock contention is recovered locally by the retry loop, everything
    /// else propagates.
    pub(crate) fn is_lock_contention(self) -> bool {
        matches!(self, Self::LockNotAvailable | Self::DeadlockDetected)
    }
}
