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

//! Catalog introspection.
//!
//! One pass over the catalogs renders every statement the later phases will
//! need, the orchestrator never goes back to the catalogs. Objects living in
//! the reserved `__tat_` namespace are filtered out inside the query so a
//! rerun never picks up leftovers of an aborted one.

use std::collections::HashMap;

use anyhow::anyhow;
use displaydoc::Display;
use serde::Deserialize;
use sqlx::{
    error::BoxDynError,
    postgres::{PgTypeInfo, PgValueRef},
    types::Json,
    FromRow,
    Postgres,
};
use thiserror::Error;

use crate::{db::Db, Error};

const GET_CHILD_TABLES: &str = include_str!("queries/get_child_tables.sql");
const GET_TABLE_INFO: &str = include_str!("queries/get_table_info.sql");

/// Fatal findings before anything is written to the database.
#[derive(Debug, Display, Error)]
pub enum PreflightError {
    /// table {table} not found
    TableNotFound { table: String },
    /// table {table} is a child of {parent}, alter the parent table instead
    AlterParentInstead { table: String, parent: String },
    /// table {table} inherits from more than one parent, this is not supported
    MultipleInheritance { table: String },
    /// table {table} does not have a primary key or a not null unique constraint
    NoPrimaryKey { table: String },
    /// table {table} has no column {column}
    UnknownColumn { table: String, column: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TableKind {
    Regular,
    Foreign,
    Partitioned,
}

impl sqlx::Type<Postgres> for TableKind {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for TableKind {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match <&str as sqlx::Decode<'r, Postgres>>::decode(value)? {
            "regular" => Ok(Self::Regular),
            "foreign" => Ok(Self::Foreign),
            "partitioned" => Ok(Self::Partitioned),
            kind => Err(format!("unexpected table kind {kind:?}").into()),
        }
    }
}

/// The input records of the acl to grants conversion, opaque until then.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct AclParams {
    pub(crate) obj_name: String,
    pub(crate) obj_type: String,
    pub(crate) acl: Vec<String>,
}

/// Everything the migration will ever need to know about one table.
///
/// All DDL around dependent objects is pre-rendered, the fields hold ready
/// to run statements in the order they have to run in.
#[derive(Clone, Debug, FromRow)]
pub(crate) struct TableInfo {
    pub(crate) oid: i64,
    /// Schema qualified name as rendered by `regclass`.
    pub(crate) name: String,
    /// Bare name, for `rename to`.
    pub(crate) local_name: String,
    pub(crate) kind: TableKind,
    pub(crate) pretty_size: String,
    pub(crate) pretty_data_size: String,
    pub(crate) all_columns: Vec<String>,
    pub(crate) column_types: Json<HashMap<String, String>>,
    pub(crate) pk_columns: Vec<String>,
    pub(crate) pk_types: Vec<String>,
    pub(crate) comment: Option<String>,
    pub(crate) create_indexes: Vec<String>,
    pub(crate) rename_indexes: Vec<String>,
    pub(crate) create_check_constraints: Vec<String>,
    pub(crate) create_constraints: Vec<String>,
    pub(crate) validate_constraints: Vec<String>,
    pub(crate) drop_constraints: Vec<String>,
    pub(crate) grant_privileges: Vec<String>,
    pub(crate) create_triggers: Vec<String>,
    pub(crate) drop_views: Vec<String>,
    pub(crate) create_views: Vec<String>,
    pub(crate) comment_views: Vec<String>,
    pub(crate) view_acl_to_grants_params: Json<Vec<AclParams>>,
    pub(crate) drop_functions: Vec<String>,
    pub(crate) create_functions: Vec<String>,
    pub(crate) function_acl_to_grants_params: Json<Vec<AclParams>>,
    pub(crate) alter_sequences: Vec<String>,
    pub(crate) storage_parameters: Vec<String>,
    pub(crate) replica_identity: Option<String>,
    pub(crate) publications: Vec<String>,
    pub(crate) partition_expr: Option<String>,
    pub(crate) attach_expr: Option<String>,
    pub(crate) inherit_expr: Option<String>,
    pub(crate) detach_foreign_expr: Option<String>,
    pub(crate) attach_foreign_expr: Option<String>,
    pub(crate) inherits: Vec<String>,
}

impl TableInfo {
    #[cfg(test)]
    pub(crate) fn stub(name: &str) -> Self {
        Self {
            oid: 0,
            name: name.into(),
            local_name: name.rsplit('.').next().unwrap().into(),
            kind: TableKind::Regular,
            pretty_size: "0 bytes".into(),
            pretty_data_size: "0 bytes".into(),
            all_columns: Vec::new(),
            column_types: Json(HashMap::new()),
            pk_columns: Vec::new(),
            pk_types: Vec::new(),
            comment: None,
            create_indexes: Vec::new(),
            rename_indexes: Vec::new(),
            create_check_constraints: Vec::new(),
            create_constraints: Vec::new(),
            validate_constraints: Vec::new(),
            drop_constraints: Vec::new(),
            grant_privileges: Vec::new(),
            create_triggers: Vec::new(),
            drop_views: Vec::new(),
            create_views: Vec::new(),
            comment_views: Vec::new(),
            view_acl_to_grants_params: Json(Vec::new()),
            drop_functions: Vec::new(),
            create_functions: Vec::new(),
            function_acl_to_grants_params: Json(Vec::new()),
            alter_sequences: Vec::new(),
            storage_parameters: Vec::new(),
            replica_identity: None,
            publications: Vec::new(),
            partition_expr: None,
            attach_expr: None,
            inherit_expr: None,
            detach_foreign_expr: None,
            attach_foreign_expr: None,
            inherits: Vec::new(),
        }
    }
}

pub(crate) async fn resolve_table(db: &Db, name: &str) -> Result<i64, Error> {
    let query = "select to_regclass($1)::oid::bigint";
    db.trace(query);
    sqlx::query_scalar::<_, Option<i64>>(query)
        .bind(name)
        .fetch_one(db.pool())
        .await?
        .ok_or_else(|| {
            PreflightError::TableNotFound {
                table: name.into(),
            }
            .into()
        })
}

#[derive(Debug, FromRow)]
pub(crate) struct ChildTable {
    pub(crate) oid: i64,
    pub(crate) parent_oid: i64,
}

/// All descendants of the root, every parent ordered before its children.
pub(crate) async fn child_tables(db: &Db, root: i64) -> Result<Vec<ChildTable>, Error> {
    db.trace(GET_CHILD_TABLES);
    Ok(sqlx::query_as(GET_CHILD_TABLES)
        .bind(root)
        .fetch_all(db.pool())
        .await?)
}

pub(crate) async fn table_infos(db: &Db, oids: &[i64]) -> Result<Vec<TableInfo>, Error> {
    db.trace(GET_TABLE_INFO);
    Ok(sqlx::query_as(GET_TABLE_INFO)
        .bind(oids)
        .fetch_all(db.pool())
        .await?)
}

/// Resolves a user supplied type name to its canonical spelling.
pub(crate) async fn normalize_type(db: &Db, new_type: &str) -> Result<String, Error> {
    let query = "select to_regtype($1)::text";
    db.trace(query);
    sqlx::query_scalar::<_, Option<String>>(query)
        .bind(new_type)
        .fetch_one(db.pool())
        .await?
        .ok_or_else(|| anyhow!("unknown type {new_type}"))
}
