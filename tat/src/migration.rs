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

//! The migration itself, from introspection to the rename under lock.
//!
//! A hierarchy is handled as a flat list of per table migrations in parent
//! before child order, iterating forwards builds parents first, iterating
//! backwards tears children down first.

use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use anyhow::{anyhow, Context};
use futures_util::future::join_all;
use itertools::Itertools;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    acl,
    config::{ColumnChange, Config},
    copy::DataCopier,
    db::{Db, DbTransaction, SqlErrorKind},
    ddl::{self, quote_ident, quote_literal},
    index,
    introspect::{self, AclParams, ChildTable, PreflightError, TableInfo, TableKind},
    pgbouncer::PgBouncer,
    util::format_duration,
    Error,
};

pub(crate) struct TableMigration {
    table: TableInfo,
    depth: usize,
}

pub(crate) struct Migration<'a> {
    config: &'a Config,
    db: Db,
    pgbouncer: Option<PgBouncer>,
    changes: Vec<ColumnChange>,
    nodes: Vec<TableMigration>,
}

impl<'a> Migration<'a> {
    /// Introspects the target and its descendants and checks the request.
    ///
    /// Returns `None` when every requested column already has its requested
    /// type, there is nothing to do then.
    pub(crate) async fn prepare(config: &'a Config, db: Db) -> Result<Option<Migration<'a>>, Error> {
        let root_oid = introspect::resolve_table(&db, &config.table_name).await?;
        let children = introspect::child_tables(&db, root_oid).await?;

        let mut oids = vec![root_oid];
        for child in &children {
            if !oids.contains(&child.oid) {
                oids.push(child.oid);
            }
        }
        let infos = introspect::table_infos(&db, &oids).await?;
        let nodes = assemble_nodes(&oids, &children, infos)?;
        preflight(&nodes)?;

        let root = &nodes[0].table;
        let mut changes = config.columns.clone();
        if !config.cleanup {
            let mut to_alter = Vec::new();
            for change in changes {
                let Some(current) = root.column_types.get(&change.column) else {
                    return Err(PreflightError::UnknownColumn {
                        table: root.name.clone(),
                        column: change.column,
                    }
                    .into());
                };
                let normalized = introspect::normalize_type(&db, &change.new_type).await?;
                if current == &normalized && !config.force {
                    info!(
                        "column {}.{} has already type {normalized}",
                        root.name, change.column,
                    );
                } else {
                    to_alter.push(change);
                }
            }
            if to_alter.is_empty() {
                info!("no column to alter, use --force to alter anyway");
                return Ok(None);
            }
            changes = to_alter;
        }

        Ok(Some(Migration {
            pgbouncer: PgBouncer::new(config),
            config,
            db,
            changes,
            nodes,
        }))
    }

    fn root(&self) -> &TableInfo {
        &self.nodes[0].table
    }

    fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.nodes.iter().map(|node| &node.table)
    }

    fn regular_tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables().filter(|table| table.kind == TableKind::Regular)
    }

    fn foreign_tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables().filter(|table| table.kind == TableKind::Foreign)
    }

    pub(crate) async fn execute(&self) -> Result<(), Error> {
        let started = Instant::now();
        info!("{} ({})", self.root().name, self.root().pretty_size);

        self.create_shadow_tables().await?;
        self.create_delta_logs().await?;
        self.copy_data().await?;
        self.create_indexes().await?;
        self.analyze().await?;
        self.switch_tables().await?;
        if !self.config.skip_fk_validation {
            self.validate_constraints().await?;
        }

        info!(
            "{} done in {}",
            self.root().name,
            format_duration(started.elapsed()),
        );
        Ok(())
    }

    /// Best effort rollback of the session level side effects.
    ///
    /// The `__tat_` objects stay behind on purpose, a later `--cleanup` run
    /// removes them, but the pooler must not stay paused and autovacuum must
    /// not stay off.
    pub(crate) async fn recover(&self) {
        self.resume_pooler().await;
        if let Err(error) = self.restore_storage_parameters().await {
            error!("restoring table settings failed: {error:#}");
        }
    }

    async fn restore_storage_parameters(&self) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;
        self.cancel_autovacuum(&mut tx, Some(self.root())).await?;
        for table in self.regular_tables() {
            tx.execute(&format!(
                "alter table {} reset (autovacuum_enabled);",
                table.name,
            ))
            .await?;
            tx.execute(&table.storage_parameters.join("\n")).await?;
        }
        tx.commit().await
    }

    async fn create_shadow_tables(&self) -> Result<(), Error> {
        for table in self.tables() {
            if table.kind == TableKind::Foreign {
                continue;
            }
            info!("{0}: create {0}__tat_new", table.name);
            let mut tx = self.db.begin().await?;
            tx.execute(&ddl::create_shadow_table(table)).await?;
            tx.execute(&ddl::retype_columns(table, &self.changes)).await?;
            tx.execute(&table.create_check_constraints.join("\n")).await?;
            tx.execute(&table.grant_privileges.join("\n")).await?;
            if let Some(comment) = &table.comment {
                tx.execute(comment).await?;
            }
            self.cancel_autovacuum(&mut tx, Some(table)).await?;
            if table.kind == TableKind::Regular {
                tx.execute(&format!(
                    "alter table {name} set (autovacuum_enabled = false);\n\
                     alter table {name}__tat_new set (autovacuum_enabled = false);",
                    name = table.name,
                ))
                .await?;
            }
            // the shadow joins its parent's shadow right away, a partition
            // must be in place before the copy into the parent level starts
            if let Some(attach) = &table.attach_expr {
                tx.execute(attach).await?;
            } else if let Some(inherit) = &table.inherit_expr {
                tx.execute(inherit).await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn create_delta_logs(&self) -> Result<(), Error> {
        for table in self.regular_tables() {
            info!("{0}: create {0}__tat_delta", table.name);
            let mut tx = self.db.begin().await?;
            tx.execute(&ddl::create_delta_table(table)).await?;
            tx.execute(&ddl::store_delta_function(table)).await?;
            tx.execute(&ddl::apply_delta_function(table)).await?;
            self.cancel_autovacuum(&mut tx, Some(table)).await?;
            tx.execute(&ddl::create_delta_trigger(table)).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    async fn copy_data(&self) -> Result<(), Error> {
        for table in self.regular_tables() {
            DataCopier::new(&self.db, table, self.config.batch_size)
                .copy_data()
                .await?;
        }
        Ok(())
    }

    /// Builds the shadow indexes, children before parents.
    ///
    /// A partitioned parent index then picks up the matching child indexes
    /// instead of rebuilding them partition by partition.
    async fn create_indexes(&self) -> Result<(), Error> {
        let max_depth = self.nodes.iter().map(|node| node.depth).max().unwrap_or(0);
        let mut any = false;
        for depth in (0..=max_depth).rev() {
            let statements = self
                .nodes
                .iter()
                .filter(|node| node.depth == depth && node.table.kind != TableKind::Foreign)
                .flat_map(|node| node.table.create_indexes.iter().cloned())
                .collect_vec();
            if statements.is_empty() {
                continue;
            }
            any = true;
            index::create_indexes(&self.db, self.config.jobs, statements).await?;
        }
        if !any {
            info!("no indexes");
        }
        Ok(())
    }

    async fn analyze(&self) -> Result<(), Error> {
        for table in self.regular_tables() {
            let started = Instant::now();
            self.db
                .execute(&format!("analyze {}__tat_new;", table.name))
                .await?;
            info!(
                "{}: analyze done in {}",
                table.name,
                format_duration(started.elapsed()),
            );
        }
        Ok(())
    }

    /// One replay pass over the whole tree, root first, children fanned out
    /// over the pool.
    async fn apply_delta(&self) -> Result<i64, Error> {
        let root_oid = self.root().oid;
        let mut total = 0;
        if self.root().kind == TableKind::Regular {
            total += self.apply_delta_table(self.root()).await?;
        }
        let children = self
            .regular_tables()
            .filter(|table| table.oid != root_oid)
            .collect_vec();
        for result in join_all(
            children
                .into_iter()
                .map(|table| self.apply_delta_table(table)),
        )
        .await
        {
            total += result?;
        }
        Ok(total)
    }

    async fn apply_delta_table(&self, table: &TableInfo) -> Result<i64, Error> {
        let started = Instant::now();
        let rows = self
            .db
            .fetch_scalar::<i32>(&ddl::apply_delta_call(table))
            .await?;
        info!(
            "{}: apply delta: {rows} rows in {}",
            table.name,
            format_duration(started.elapsed()),
        );
        Ok(rows.into())
    }

    /// Same pass but serially on the locking connection.
    async fn apply_delta_locked(&self, tx: &mut DbTransaction) -> Result<i64, Error> {
        let mut total = 0;
        for table in self.regular_tables() {
            let rows = tx.fetch_scalar::<i32>(&ddl::apply_delta_call(table)).await?;
            total += i64::from(rows);
        }
        Ok(total)
    }

    async fn switch_tables(&self) -> Result<(), Error> {
        info!("switch table: start");

        // converge first so the final in-lock replay is small
        loop {
            if self.apply_delta().await? <= self.config.min_delta_rows {
                break;
            }
        }

        loop {
            if !self.pause_pooler().await {
                sleep(self.config.pgbouncer_time_between_pause()).await;
                self.apply_delta().await?;
                continue;
            }
            match self.try_switch().await {
                Ok(true) => break,
                Ok(false) => {
                    self.resume_pooler().await;
                    sleep(self.config.time_between_locks()).await;
                    self.apply_delta().await?;
                }
                Err(error) => {
                    self.resume_pooler().await;
                    return Err(error);
                }
            }
        }

        info!("switch table: done");
        Ok(())
    }

    /// One attempt to take the exclusive lock and switch under it.
    ///
    /// `Ok(false)` means the lock could not be taken and the attempt may be
    /// repeated. Errors after the lock was held are not retried, the state
    /// of the attempt is unknown then.
    async fn try_switch(&self) -> Result<bool, Error> {
        let root = self.root();
        let mut tx = self.db.begin().await?;
        self.cancel_autovacuum(&mut tx, Some(root)).await?;
        info!("lock table {}", root.name);
        if let Err(error) = tx
            .execute(&format!(
                "lock table {} in access exclusive mode;",
                root.name,
            ))
            .await
        {
            if SqlErrorKind::of(&error).is_lock_contention() {
                warn!("lock table {} failed: {error:#}", root.name);
                return Ok(false);
            }
            return Err(error);
        }

        self.cut_over(&mut tx)
            .await
            .context("switchover failed, all changes were rolled back")?;
        tx.commit().await?;
        self.resume_pooler().await;
        Ok(true)
    }

    async fn cut_over(&self, tx: &mut DbTransaction) -> Result<(), Error> {
        self.apply_delta_locked(tx).await?;

        // dependents referencing the rowtype must not outlive the table,
        // views can sit on top of functions so they go first
        let mut seen = HashSet::new();
        tx.execute(&dedup(self.tables().flat_map(|table| &table.drop_views), &mut seen))
            .await?;
        tx.execute(&dedup(
            self.tables().flat_map(|table| &table.drop_functions),
            &mut seen,
        ))
        .await?;

        // foreign keys owned by outside tables still point at the old rows
        let drop_constraints = dedup(
            self.tables().flat_map(|table| &table.drop_constraints),
            &mut seen,
        );
        if !drop_constraints.is_empty() {
            self.cancel_autovacuum(tx, None).await?;
            tx.execute(&drop_constraints).await?;
        }

        // dropping the table would cascade into its owned sequences
        tx.execute(
            &self
                .tables()
                .flat_map(|table| &table.alter_sequences)
                .join("\n"),
        )
        .await?;

        for table in self.regular_tables() {
            tx.execute(&ddl::drop_delta_objects(table)).await?;
        }

        for table in self.foreign_tables() {
            if let Some(detach) = &table.detach_foreign_expr {
                tx.execute(detach).await?;
            }
        }

        for node in self.nodes.iter().rev() {
            if node.table.kind == TableKind::Foreign {
                continue;
            }
            info!("drop table {}", node.table.name);
            tx.execute(&format!("drop table {};", node.table.name)).await?;
        }

        for table in self.tables() {
            if table.kind == TableKind::Foreign {
                continue;
            }
            info!("rename table {0}__tat_new -> {0}", table.name);
            tx.execute(&format!(
                "alter table {}__tat_new rename to {};",
                table.name,
                quote_ident(&table.local_name),
            ))
            .await?;
            tx.execute(&table.rename_indexes.join("\n")).await?;
            tx.execute(&table.create_constraints.join("\n")).await?;
            tx.execute(&table.create_triggers.join("\n")).await?;
            if let Some(replica_identity) = &table.replica_identity {
                tx.execute(replica_identity).await?;
            }
            tx.execute(&table.publications.join("\n")).await?;
            if table.kind == TableKind::Regular {
                tx.execute(&format!(
                    "alter table {} reset (autovacuum_enabled);",
                    table.name,
                ))
                .await?;
            }
            tx.execute(&table.storage_parameters.join("\n")).await?;
        }

        // foreign members cannot be rewritten, they are retyped in place
        // and rejoined, the server only has to update its metadata
        for table in self.foreign_tables() {
            for change in &self.changes {
                tx.execute(&format!(
                    "alter table {} alter column {} type {};",
                    table.name,
                    quote_ident(&change.column),
                    change.new_type,
                ))
                .await?;
            }
            if let Some(attach) = &table.attach_foreign_expr {
                tx.execute(attach).await?;
            }
        }

        tx.execute(&dedup(
            self.tables().flat_map(|table| &table.create_functions),
            &mut seen,
        ))
        .await?;
        let function_grants = collect_grants(
            self.tables()
                .flat_map(|table| table.function_acl_to_grants_params.iter()),
        )?;
        tx.execute(&dedup(function_grants.iter(), &mut seen)).await?;
        tx.execute(&dedup(
            self.tables().flat_map(|table| &table.create_views),
            &mut seen,
        ))
        .await?;
        let view_grants = collect_grants(
            self.tables()
                .flat_map(|table| table.view_acl_to_grants_params.iter()),
        )?;
        tx.execute(&dedup(view_grants.iter(), &mut seen)).await?;
        tx.execute(&dedup(
            self.tables().flat_map(|table| &table.comment_views),
            &mut seen,
        ))
        .await?;

        Ok(())
    }

    /// Validation takes only a share update exclusive lock per statement,
    /// running them one by one keeps the background load bounded.
    async fn validate_constraints(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        let statements = self
            .tables()
            .flat_map(|table| &table.validate_constraints)
            .filter(|statement| seen.insert((*statement).clone()))
            .cloned()
            .collect_vec();
        if statements.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        info!("validate {} constraints", statements.len());
        for statement in &statements {
            let statement_started = Instant::now();
            let mut tx = self.db.begin().await?;
            tx.execute(statement).await?;
            tx.commit().await?;
            info!(
                "{} done in {}",
                statement.trim_end_matches(';'),
                format_duration(statement_started.elapsed()),
            );
        }
        info!(
            "validate constraints done in {}",
            format_duration(started.elapsed()),
        );
        Ok(())
    }

    /// Drops whatever an earlier run left behind, in reverse creation order,
    /// and switches autovacuum back on. Safe to run repeatedly.
    pub(crate) async fn cleanup(&self) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;
        self.cancel_autovacuum(&mut tx, Some(self.root())).await?;
        for node in self.nodes.iter().rev() {
            let table = &node.table;
            match table.kind {
                TableKind::Foreign => continue,
                TableKind::Regular => {
                    tx.execute(&ddl::drop_delta_objects(table)).await?;
                    tx.execute(&ddl::drop_shadow_table(table)).await?;
                    tx.execute(&format!(
                        "alter table {} reset (autovacuum_enabled);",
                        table.name,
                    ))
                    .await?;
                }
                TableKind::Partitioned => {
                    tx.execute(&ddl::drop_shadow_table(table)).await?;
                }
            }
        }
        tx.commit().await?;
        info!("cleanup done");
        Ok(())
    }

    async fn cancel_autovacuum(
        &self,
        tx: &mut DbTransaction,
        table: Option<&TableInfo>,
    ) -> Result<(), Error> {
        let filter = table
            .map(|table| format!(" and\n       query ~ {}", quote_literal(&table.name)))
            .unwrap_or_default();
        let cancelled = tx
            .fetch_all(&format!(
                "select pg_cancel_backend(pid)\n  \
                   from pg_stat_activity\n \
                  where state = 'active' and\n       \
                        backend_type = 'autovacuum worker'{filter};",
            ))
            .await?;
        if !cancelled.is_empty() {
            info!("autovacuum canceled");
        }
        Ok(())
    }

    async fn pause_pooler(&self) -> bool {
        match &self.pgbouncer {
            Some(pgbouncer) => pgbouncer.pause().await,
            None => true,
        }
    }

    async fn resume_pooler(&self) {
        if let Some(pgbouncer) = &self.pgbouncer {
            pgbouncer.resume().await;
        }
    }
}

fn assemble_nodes(
    oids: &[i64],
    children: &[ChildTable],
    infos: Vec<TableInfo>,
) -> Result<Vec<TableMigration>, Error> {
    let mut infos = infos
        .into_iter()
        .map(|info| (info.oid, info))
        .collect::<HashMap<_, _>>();
    let mut depth_of = HashMap::new();
    let mut nodes = Vec::with_capacity(oids.len());
    for oid in oids {
        let table = infos
            .remove(oid)
            .ok_or_else(|| anyhow!("table {oid} vanished during introspection"))?;
        let depth = children
            .iter()
            .find(|child| child.oid == *oid)
            .and_then(|child| depth_of.get(&child.parent_oid))
            .map_or(0, |parent_depth| parent_depth + 1);
        depth_of.insert(*oid, depth);
        nodes.push(TableMigration { table, depth });
    }
    Ok(nodes)
}

fn preflight(nodes: &[TableMigration]) -> Result<(), PreflightError> {
    let root = &nodes[0].table;
    if let Some(parent) = root.inherits.first() {
        return Err(PreflightError::AlterParentInstead {
            table: root.name.clone(),
            parent: parent.clone(),
        });
    }
    for node in nodes {
        if node.table.inherits.len() > 1 {
            return Err(PreflightError::MultipleInheritance {
                table: node.table.name.clone(),
            });
        }
        if node.table.kind == TableKind::Regular && node.table.pk_columns.is_empty() {
            return Err(PreflightError::NoPrimaryKey {
                table: node.table.name.clone(),
            });
        }
    }
    Ok(())
}

fn dedup<'a>(statements: impl Iterator<Item = &'a String>, seen: &mut HashSet<String>) -> String {
    statements
        .filter(|statement| seen.insert((*statement).clone()))
        .join("\n")
}

fn collect_grants<'a>(params: impl Iterator<Item = &'a AclParams>) -> Result<Vec<String>, Error> {
    let mut grants = Vec::new();
    for params in params {
        grants.extend(acl::acl_to_grants(params)?);
    }
    Ok(grants)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_node(name: &str, kind: TableKind) -> TableInfo {
        let mut table = TableInfo::stub(name);
        table.kind = kind;
        table
    }

    #[test]
    fn test_nodes_keep_parent_before_child_order() {
        let mut parent = stub_node("public.p", TableKind::Partitioned);
        parent.oid = 1;
        let mut child = stub_node("public.p1", TableKind::Regular);
        child.oid = 2;
        child.pk_columns = vec!["id".into()];
        let mut grandchild = stub_node("public.p1_1", TableKind::Regular);
        grandchild.oid = 3;
        grandchild.pk_columns = vec!["id".into()];

        let children = [
            ChildTable {
                oid: 2,
                parent_oid: 1,
            },
            ChildTable {
                oid: 3,
                parent_oid: 2,
            },
        ];
        let nodes =
            assemble_nodes(&[1, 2, 3], &children, vec![child, grandchild, parent]).unwrap();

        assert_eq!(
            nodes.iter().map(|node| node.table.name.as_str()).collect_vec(),
            ["public.p", "public.p1", "public.p1_1"],
        );
        assert_eq!(nodes.iter().map(|node| node.depth).collect_vec(), [0, 1, 2]);
    }

    #[test]
    fn test_preflight_rejects_a_child_as_target() {
        let mut root = stub_node("public.p1", TableKind::Regular);
        root.pk_columns = vec!["id".into()];
        root.inherits = vec!["public.p".into()];
        let error = preflight(&[TableMigration {
            table: root,
            depth: 0,
        }])
        .unwrap_err();
        assert!(matches!(error, PreflightError::AlterParentInstead { .. }));
    }

    #[test]
    fn test_preflight_rejects_regular_tables_without_key() {
        let error = preflight(&[TableMigration {
            table: stub_node("public.t", TableKind::Regular),
            depth: 0,
        }])
        .unwrap_err();
        assert!(matches!(error, PreflightError::NoPrimaryKey { .. }));
    }

    #[test]
    fn test_preflight_accepts_partitioned_parents_without_key() {
        let parent = stub_node("public.p", TableKind::Partitioned);
        let mut child = stub_node("public.p1", TableKind::Regular);
        child.pk_columns = vec!["id".into()];
        child.inherits = vec!["public.p".into()];
        preflight(&[
            TableMigration {
                table: parent,
                depth: 0,
            },
            TableMigration {
                table: child,
                depth: 1,
            },
        ])
        .unwrap();
    }

    #[test]
    fn test_preflight_rejects_multiple_inheritance() {
        let mut parent = stub_node("public.p", TableKind::Regular);
        parent.pk_columns = vec!["id".into()];
        let mut child = stub_node("public.c", TableKind::Regular);
        child.pk_columns = vec!["id".into()];
        child.inherits = vec!["public.p".into(), "public.q".into()];
        let error = preflight(&[
            TableMigration {
                table: parent,
                depth: 0,
            },
            TableMigration {
                table: child,
                depth: 1,
            },
        ])
        .unwrap_err();
        assert!(matches!(error, PreflightError::MultipleInheritance { .. }));
    }

    #[test]
    fn test_dedup_keeps_first_occurrence_only() {
        let first = vec!["drop view a;".to_string(), "drop view b;".to_string()];
        let second = vec!["drop view b;".to_string(), "drop view c;".to_string()];
        let mut seen = HashSet::new();
        assert_eq!(
            dedup(first.iter().chain(second.iter()), &mut seen),
            "drop view a;\ndrop view b;\ndrop view c;",
        );
        assert_eq!(dedup(first.iter(), &mut seen), "");
    }
}
