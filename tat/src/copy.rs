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

//! The initial bulk copy into the shadow table.
//!
//! `from only` matters for hierarchies, children are copied by their own
//! nodes and must not be copied again through the parent.

use std::time::Instant;

use itertools::Itertools;
use sqlx::Row;
use tracing::info;

use crate::{db::Db, ddl::quote_ident, introspect::TableInfo, util::format_duration, Error};

pub(crate) struct DataCopier<'a> {
    db: &'a Db,
    table: &'a TableInfo,
    batch_size: u32,
    last_pk: Option<Vec<String>>,
}

impl<'a> DataCopier<'a> {
    pub(crate) fn new(db: &'a Db, table: &'a TableInfo, batch_size: u32) -> Self {
        Self {
            db,
            table,
            batch_size,
            last_pk: None,
        }
    }

    pub(crate) async fn copy_data(&mut self) -> Result<(), Error> {
        let started = Instant::now();
        info!(
            "{}: copy data: start ({})",
            self.table.name, self.table.pretty_data_size,
        );
        if self.batch_size == 0 {
            self.copy_direct().await?;
        } else {
            self.copy_batches().await?;
        }
        info!(
            "{}: copy data: done in {}",
            self.table.name,
            format_duration(started.elapsed()),
        );
        Ok(())
    }

    async fn copy_direct(&self) -> Result<(), Error> {
        self.db
            .execute(&format!(
                "insert into {name}__tat_new\n  select *\n    from only {name};",
                name = self.table.name,
            ))
            .await
    }

    /// Walks the primary key range upwards, one `limit batch_size` insert at
    /// a time, remembering the highest key each batch returned.
    async fn copy_batches(&mut self) -> Result<(), Error> {
        loop {
            let copied = self.copy_next_batch().await?;
            if copied < i64::from(self.batch_size) {
                return Ok(());
            }
        }
    }

    async fn copy_next_batch(&mut self) -> Result<i64, Error> {
        let query = next_batch_query(self.table, self.batch_size, self.last_pk.as_deref());
        let Some(row) = self.db.fetch_optional(&query).await? else {
            return Ok(0);
        };
        let copied = row.try_get::<i64, _>("n")?;
        if copied == 0 {
            return Ok(0);
        }
        self.last_pk = Some(
            (0..self.table.pk_columns.len())
                .map(|position| row.try_get(format!("v{position}").as_str()))
                .collect::<Result<_, _>>()?,
        );
        Ok(copied)
    }
}

fn next_batch_query(table: &TableInfo, batch_size: u32, last_pk: Option<&[String]>) -> String {
    let pk_columns = table
        .pk_columns
        .iter()
        .map(|column| quote_ident(column))
        .join(", ");

    let tail = if table.pk_columns.len() == 1 {
        format!("select max({pk_columns})::text as v0, count(1) as n\n  from batch")
    } else {
        let pk_texts = table
            .pk_columns
            .iter()
            .enumerate()
            .map(|(position, column)| format!("{}::text as v{position}", quote_ident(column)))
            .join(", ");
        format!(
            "select {pk_texts}, cnt as n\n  \
               from (select {pk_columns}, row_number() over () as rn, count(1) over () as cnt\n          \
                       from batch) batch_tail\n \
              where rn = cnt",
        )
    };

    format!(
        "with batch as (\n  \
           insert into {name}__tat_new\n    \
             select *\n      \
               from only {name}\n     \
              where {predicate}\n     \
              order by {pk_columns}\n     \
              limit {batch_size}\n  \
           returning {pk_columns}\n\
         )\n\
         {tail}",
        name = table.name,
        predicate = predicate(table, last_pk),
    )
}

fn predicate(table: &TableInfo, last_pk: Option<&[String]>) -> String {
    let Some(last_pk) = last_pk else {
        return "true".into();
    };
    if table.pk_columns.len() == 1 {
        format!(
            "{} > {}",
            quote_ident(&table.pk_columns[0]),
            literal(table, 0, &last_pk[0]),
        )
    } else {
        format!(
            "({}) > ({})",
            table
                .pk_columns
                .iter()
                .map(|column| quote_ident(column))
                .join(", "),
            last_pk
                .iter()
                .enumerate()
                .map(|(position, value)| literal(table, position, value))
                .join(", "),
        )
    }
}

/// Integer family keys render bare, everything else as a typed literal.
fn literal(table: &TableInfo, position: usize, value: &str) -> String {
    let pk_type = &table.pk_types[position];
    if matches!(pk_type.as_str(), "smallint" | "integer" | "bigint") {
        value.into()
    } else {
        format!("'{}'::{pk_type}", value.replace('\'', "''"))
    }
}
