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

//! Pausing the connection pooler around the exclusive lock.
//!
//! With client traffic held back by the pooler the access exclusive lock is
//! acquired against an idle server, which makes the retry loop converge much
//! faster on busy systems.

use std::time::Duration;

use sqlx::{postgres::PgConnectOptions, Connection, Executor, PgConnection};
use tokio::{sync::Mutex, time::timeout};
use tracing::{info, warn};

use crate::config::Config;

/// The admin console speaks the wire protocol but runs commands of its own
/// language, only `PAUSE` and `RESUME` are used here.
pub(crate) struct PgBouncer {
    options: PgConnectOptions,
    pause_timeout: Duration,
    connection: Mutex<Option<PgConnection>>,
}

impl PgBouncer {
    pub(crate) fn new(config: &Config) -> Option<Self> {
        Some(Self {
            options: config.pgbouncer_connect_options()?,
            pause_timeout: config.pgbouncer_pause_timeout(),
            connection: Mutex::new(None),
        })
    }

    /// Asks the pooler to hold back client traffic.
    ///
    /// Returns whether the pooler is paused now. A `PAUSE` which neither
    /// returns nor fails within the timeout is abandoned together with its
    /// connection, waiting longer would stretch the client visible stall
    /// without improving the chance to lock.
    pub(crate) async fn pause(&self) -> bool {
        info!("try pgbouncer pause");
        let mut guard = self.connection.lock().await;
        let connection = match guard.as_mut() {
            Some(connection) => connection,
            None => match PgConnection::connect_with(&self.options).await {
                Ok(connection) => guard.insert(connection),
                Err(error) => {
                    warn!("pgbouncer connect failed: {error}");
                    return false;
                }
            },
        };

        match timeout(self.pause_timeout, connection.execute("PAUSE;")).await {
            Ok(Ok(_)) => {
                info!("pgbouncer paused");
                true
            }
            Ok(Err(error)) => {
                if is_already_paused(&error) {
                    info!("pgbouncer paused");
                    true
                } else {
                    warn!("pgbouncer pause failed: {error}");
                    false
                }
            }
            Err(_) => {
                // dropping the connection aborts the in-flight request
                warn!("pgbouncer pause timed out: cancel pause");
                *guard = None;
                false
            }
        }
    }

    /// Failures are logged only, a resume problem must never mask the error
    /// which led here.
    pub(crate) async fn resume(&self) {
        info!("pgbouncer resume");
        let mut guard = self.connection.lock().await;
        let connection = match guard.as_mut() {
            Some(connection) => connection,
            None => match PgConnection::connect_with(&self.options).await {
                Ok(connection) => guard.insert(connection),
                Err(error) => {
                    warn!("pgbouncer connect failed: {error}");
                    return;
                }
            },
        };
        if let Err(error) = connection.execute("RESUME;").await {
            warn!("pgbouncer resume failed: {error}");
        }
    }
}

fn is_already_paused(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(error) if error.message().trim_end() == "already suspended/paused"
    )
}
