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

//! Parallel index creation on the shadow tables.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Instant,
};

use futures_util::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::{db::Db, util::format_duration, Error};

/// Runs the statements on `jobs` workers over a shared queue.
///
/// The introspector hands the statements over largest index first, so the
/// longest builds start earliest. On a failure the other workers finish the
/// statement they are on and stop, the first error is propagated.
pub(crate) async fn create_indexes(
    db: &Db,
    jobs: usize,
    statements: Vec<String>,
) -> Result<(), Error> {
    let started = Instant::now();
    let jobs = jobs.max(1).min(statements.len().max(1));
    info!("create {} indexes on {} jobs", statements.len(), jobs);
    if statements.is_empty() {
        return Ok(());
    }

    let queue = Mutex::new(VecDeque::from(statements));
    let failed = AtomicBool::new(false);

    let workers = (0..jobs).map(|_| async {
        loop {
            if failed.load(Ordering::Relaxed) {
                return Ok(());
            }
            let statement = queue.lock().unwrap().pop_front();
            let Some(statement) = statement else {
                return Ok(());
            };
            let name = index_name(&statement);
            let index_started = Instant::now();
            info!("start {name}");
            if let Err(error) = db.execute(&statement).await {
                failed.store(true, Ordering::Relaxed);
                return Err(error);
            }
            info!("done {name} in {}", format_duration(index_started.elapsed()));
        }
    });
    join_all(workers)
        .await
        .into_iter()
        .collect::<Result<(), _>>()?;

    info!("create indexes done in {}", format_duration(started.elapsed()));
    Ok(())
}

static INDEX_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("CREATE (?:UNIQUE )?INDEX (\\S+) ON ").unwrap());

fn index_name(statement: &str) -> &str {
    INDEX_NAME
        .captures(statement)
        .and_then(|captures| captures.get(1))
        .map_or("index", |name| name.as_str())
}
