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

//! Online column type changes for large Postgres tables.
//!
//! The table stays readable and writable while a retyped shadow copy is
//! built and caught up through a trigger fed delta log, only the final
//! name swap needs an exclusive lock and takes seconds.

mod acl;
mod config;
mod copy;
mod db;
mod ddl;
mod index;
mod introspect;
pub mod logging;
mod migration;
mod pgbouncer;
mod util;

use anyhow::anyhow;

pub use crate::{
    config::{ColumnChange, Config, InvalidColumnChange},
    introspect::PreflightError,
};

pub type Error = anyhow::Error;

/// Runs one migration (or cleanup) from start to finish.
///
/// Ctrl-C cancels the run like any other error would end it, the pooler is
/// resumed and autovacuum switched back on, while the `__tat_` objects stay
/// behind for a later `--cleanup` invocation.
pub async fn run(config: Config) -> Result<(), Error> {
    let db = db::Db::connect(&config).await?;
    let Some(migration) = migration::Migration::prepare(&config, db).await? else {
        return Ok(());
    };
    if config.cleanup {
        return migration.cleanup().await;
    }

    let result = tokio::select! {
        result = migration.execute() => result,
        result = tokio::signal::ctrl_c() => Err(match result {
            Ok(()) => anyhow!("interrupted"),
            Err(error) => error.into(),
        }),
    };
    if let Err(error) = result {
        migration.recover().await;
        return Err(error);
    }
    Ok(())
}
