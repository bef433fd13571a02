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

use std::{convert::Infallible, str::FromStr, time::Duration};

use clap::Parser;
use displaydoc::Display;
use secrecy::{ExposeSecret, Secret};
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

/// A requested `column:new_type` change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnChange {
    pub column: String,
    pub new_type: String,
}

/// Expected a column:new_type pair, got {value:?}.
#[derive(Debug, Display, Error)]
pub struct InvalidColumnChange {
    value: String,
}

impl FromStr for ColumnChange {
    type Err = InvalidColumnChange;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((column, new_type)) if !column.is_empty() && !new_type.is_empty() => Ok(Self {
                column: column.into(),
                new_type: new_type.into(),
            }),
            _ => Err(InvalidColumnChange {
                value: value.into(),
            }),
        }
    }
}

/// Changes column types of large Postgres tables without long exclusive locks.
#[derive(Parser, Debug)]
#[command(name = "tat", version, disable_help_flag = true)]
pub struct Config {
    /// Print help.
    #[arg(long, action = clap::ArgAction::Help, value_parser = clap::value_parser!(bool))]
    help: Option<bool>,

    /// Database server host.
    #[arg(short = 'h', long)]
    pub host: String,

    /// Database server port.
    #[arg(short = 'p', long)]
    pub port: u16,

    /// Database name.
    #[arg(short = 'd', long)]
    pub dbname: String,

    /// Database user.
    #[arg(short = 'U', long, default_value = "postgres")]
    pub user: String,

    /// Database password, falls back to $PGPASSWORD.
    #[arg(short = 'W', long, value_parser = parse_secret)]
    password: Option<Secret<String>>,

    /// Schema qualified table to alter.
    #[arg(short = 't', long = "table_name")]
    pub table_name: String,

    /// A column:new_type pair, may be given multiple times.
    #[arg(short = 'c', long = "column", required_unless_present = "cleanup")]
    pub columns: Vec<ColumnChange>,

    /// Parallel jobs, used for index builds and as the connection pool size.
    #[arg(short = 'j', long)]
    pub jobs: usize,

    /// Alter columns even if they already have the requested type.
    #[arg(long)]
    pub force: bool,

    /// Drop leftover migration objects and exit.
    #[arg(long)]
    pub cleanup: bool,

    /// Session lock_timeout in seconds.
    #[arg(long, default_value_t = 5)]
    pub lock_timeout: u64,

    /// Seconds to wait before retrying a failed exclusive lock.
    #[arg(long, default_value_t = 10)]
    pub time_between_locks: u64,

    /// Session work_mem and maintenance_work_mem.
    #[arg(long, default_value = "1GB")]
    pub work_mem: String,

    /// Stop replaying the delta outside the lock once one pass handles at
    /// most this many rows.
    #[arg(long, default_value_t = 10_000)]
    pub min_delta_rows: i64,

    /// Copy the initial data in primary key ordered batches of this size,
    /// 0 copies everything in one statement.
    #[arg(long, default_value_t = 0)]
    pub batch_size: u32,

    /// Skip the VALIDATE CONSTRAINT phase after the switchover.
    #[arg(long)]
    pub skip_fk_validation: bool,

    /// Log every statement before it is executed.
    #[arg(long)]
    pub show_queries: bool,

    /// Pgbouncer admin host, enables pausing the pooler around the cutover.
    #[arg(long)]
    pub pgbouncer_host: Option<String>,

    /// Pgbouncer admin port.
    #[arg(long)]
    pub pgbouncer_port: Option<u16>,

    /// Seconds to wait for PAUSE before cancelling it.
    #[arg(long, default_value_t = 2)]
    pub pgbouncer_pause_timeout: u64,

    /// Seconds to wait before retrying a failed PAUSE.
    #[arg(long, default_value_t = 10)]
    pub pgbouncer_time_between_pause: u64,
}

fn parse_secret(value: &str) -> Result<Secret<String>, Infallible> {
    Ok(Secret::new(value.into()))
}

impl Config {
    pub(crate) fn password(&self) -> Option<Secret<String>> {
        self.password
            .clone()
            .or_else(|| std::env::var("PGPASSWORD").ok().map(Secret::new))
    }

    pub(crate) fn to_connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user)
            .application_name("tat")
            // pgbouncer in transaction pooling mode can sit between us and
            // the server and server side prepared statements don't survive it
            .statement_cache_capacity(0);
        if let Some(password) = self.password() {
            options = options.password(password.expose_secret());
        }
        options
    }

    pub(crate) fn pgbouncer_connect_options(&self) -> Option<PgConnectOptions> {
        let host = self.pgbouncer_host.as_deref()?;
        let port = self.pgbouncer_port?;
        let mut options = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database("pgbouncer")
            .username(&self.user)
            .application_name("tat")
            .statement_cache_capacity(0);
        if let Some(password) = self.password() {
            options = options.password(password.expose_secret());
        }
        Some(options)
    }

    pub(crate) fn time_between_locks(&self) -> Duration {
        Duration::from_secs(self.time_between_locks)
    }

    pub(crate) fn pgbouncer_pause_timeout(&self) -> Duration {
        Duration::from_secs(self.pgbouncer_pause_timeout)
    }

    pub(crate) fn pgbouncer_time_between_pause(&self) -> Duration {
        Duration::from_secs(self.pgbouncer_time_between_pause)
    }
}
