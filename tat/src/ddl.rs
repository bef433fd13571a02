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

//! Statement fragments which depend on runtime choices.
//!
//! Everything derivable from the catalogs alone is already rendered by the
//! introspection query, these builders cover the rest, the retype clauses
//! and the delta capture machinery built around the primary key.

use itertools::Itertools;

use crate::{config::ColumnChange, introspect::TableInfo};

/// Quotes an identifier, `$` binds are not accepted in identifier position.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The shadow table, same rows and defaults but no indexes or constraints
/// yet, they arrive after the copy when they are cheapest to build.
pub(crate) fn create_shadow_table(table: &TableInfo) -> String {
    let partition = table
        .partition_expr
        .as_deref()
        .map(|expr| format!(" {expr}"))
        .unwrap_or_default();
    format!(
        "create table {name}__tat_new (\n  \
           like {name}\n  \
           including all\n  \
           excluding indexes\n  \
           excluding constraints\n  \
           excluding statistics){partition};",
        name = table.name,
    )
}

pub(crate) fn retype_columns(table: &TableInfo, changes: &[ColumnChange]) -> String {
    changes
        .iter()
        .map(|change| {
            let column = quote_ident(&change.column);
            format!(
                "alter table {name}__tat_new\n  \
                   alter column {column}\n    \
                     type {new_type} using ({column}::{new_type});",
                name = table.name,
                new_type = change.new_type,
            )
        })
        .join("\n")
}

/// The delta log is unlogged on purpose, after a crash the migration has to
/// restart from scratch anyway, so WAL for the capture buffer is wasted.
pub(crate) fn create_delta_table(table: &TableInfo) -> String {
    format!(
        "create unlogged table {name}__tat_delta (\n  \
           like {name} excluding all);\n\
         alter table {name}__tat_delta add column tat_delta_id serial;\n\
         alter table {name}__tat_delta add column tat_delta_op \"char\";",
        name = table.name,
    )
}

pub(crate) fn store_delta_function(table: &TableInfo) -> String {
    format!(
        r#"create or replace function "{name}__store_delta"() returns trigger as $$
begin
  if tg_op = 'INSERT' then
    insert into {name}__tat_delta
      values (new.*, default, 'i');

  elsif tg_op = 'UPDATE' then
    insert into {name}__tat_delta
      values (new.*, default, 'u');

  elsif tg_op = 'DELETE' then
    insert into {name}__tat_delta
      values (old.*, default, 'd');

    return old;
  end if;

  return new;
end;
$$ language plpgsql security definer;"#,
        name = table.name,
    )
}

/// Replays and empties the delta log in one call.
///
/// The `on conflict do nothing` on inserts absorbs rows which were caught
/// both by the initial copy and by the trigger. Replaying in `tat_delta_id`
/// order keeps the per row operation order, a delete logged after an insert
/// of the same key must win.
pub(crate) fn apply_delta_function(table: &TableInfo) -> String {
    let columns = table.all_columns.iter().map(|c| quote_ident(c)).join(", ");
    let val_columns = table
        .all_columns
        .iter()
        .map(|c| format!("r.{}", quote_ident(c)))
        .join(", ");
    let where_pk = table
        .pk_columns
        .iter()
        .map(|c| format!("t.{column} = r.{column}", column = quote_ident(c)))
        .join(" and ");
    let set_columns = table
        .all_columns
        .iter()
        .filter(|column| !table.pk_columns.contains(*column))
        .map(|column| format!("{column} = r.{column}", column = quote_ident(column)))
        .join(", ");

    // a table where every column is part of the key has nothing to update
    let update_branch = if set_columns.is_empty() {
        String::new()
    } else {
        format!(
            "\n    elsif r.tat_delta_op = 'u' then
      update {name}__tat_new t
         set {set_columns}
       where {where_pk};\n",
            name = table.name,
        )
    };

    format!(
        r#"create or replace function "{name}__apply_delta"() returns integer as $$
declare
  r record;
  rows integer := 0;
begin
  for r in with d as (
             delete from {name}__tat_delta returning *
           )
           select *
             from d
            order by tat_delta_id
  loop
    if r.tat_delta_op = 'i' then
      insert into {name}__tat_new({columns})
        values ({val_columns})
        on conflict do nothing;
{update_branch}
    elsif r.tat_delta_op = 'd' then
      delete from {name}__tat_new t
       where {where_pk};
    end if;

    rows := rows + 1;
  end loop;

  return rows;
end;
$$ language plpgsql security definer;"#,
        name = table.name,
    )
}

pub(crate) fn create_delta_trigger(table: &TableInfo) -> String {
    format!(
        "create trigger store__tat_delta\n  \
           after insert or delete or update on {name}\n  \
           for each row execute procedure \"{name}__store_delta\"();",
        name = table.name,
    )
}

pub(crate) fn apply_delta_call(table: &TableInfo) -> String {
    format!("select \"{name}__apply_delta\"() as rows;", name = table.name)
}

/// Tear-down of the capture machinery, the shadow table survives.
///
/// Rendered with `if exists` throughout so that the same statements serve
/// both the switchover and an idempotent cleanup run.
pub(crate) fn drop_delta_objects(table: &TableInfo) -> String {
    format!(
        "drop trigger if exists store__tat_delta on {name};\n\
         drop function if exists \"{name}__store_delta\"();\n\
         drop function if exists \"{name}__apply_delta\"();\n\
         drop table if exists {name}__tat_delta;",
        name = table.name,
    )
}

pub(crate) fn drop_shadow_table(table: &TableInfo) -> String {
    format!("drop table if exists {name}__tat_new;", name = table.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::TableInfo;

    fn table() -> TableInfo {
        let mut table = TableInfo::stub("public.events");
        table.all_columns = vec!["id".into(), "kind".into(), "payload".into()];
        table.pk_columns = vec!["id".into()];
        table
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("plain"), r#""plain""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(quote_literal("1GB"), "'1GB'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_shadow_table_for_a_plain_table() {
        let sql = create_shadow_table(&table());
        assert!(sql.starts_with("create table public.events__tat_new"));
        assert!(sql.contains("like public.events"));
        assert!(sql.contains("excluding statistics);"));
        assert!(!sql.contains("partition by"));
    }

    #[test]
    fn test_shadow_table_for_a_partitioned_parent() {
        let mut table = table();
        table.partition_expr = Some("partition by range (created_at)".into());
        let sql = create_shadow_table(&table);
        assert!(sql.ends_with(") partition by range (created_at);"));
    }

    #[test]
    fn test_retype_renders_a_using_cast() {
        let changes = [ColumnChange {
            column: "payload".into(),
            new_type: "jsonb".into(),
        }];
        assert_eq!(
            retype_columns(&table(), &changes),
            "alter table public.events__tat_new\n  \
               alter column \"payload\"\n    \
                 type jsonb using (\"payload\"::jsonb);",
        );
    }

    #[test]
    fn test_apply_delta_function_body() {
        let sql = apply_delta_function(&table());
        assert!(sql.contains(r#"create or replace function "public.events__apply_delta"()"#));
        assert!(sql.contains("delete from public.events__tat_delta returning *"));
        assert!(sql.contains("order by tat_delta_id"));
        assert!(sql.contains(
            "insert into public.events__tat_new(\"id\", \"kind\", \"payload\")\n        \
               values (r.\"id\", r.\"kind\", r.\"payload\")\n        \
               on conflict do nothing;"
        ));
        assert!(sql.contains("set \"kind\" = r.\"kind\", \"payload\" = r.\"payload\""));
        assert!(sql.contains("where t.\"id\" = r.\"id\";"));
        assert!(sql.contains("security definer"));
    }

    #[test]
    fn test_apply_delta_without_non_key_columns_skips_the_update_branch() {
        let mut table = table();
        table.all_columns = vec!["id".into()];
        let sql = apply_delta_function(&table);
        assert!(!sql.contains("tat_delta_op = 'u'"));
        assert!(sql.contains("tat_delta_op = 'i'"));
        assert!(sql.contains("tat_delta_op = 'd'"));
    }

    #[test]
    fn test_composite_key_predicates() {
        let mut table = table();
        table.pk_columns = vec!["id".into(), "kind".into()];
        let sql = apply_delta_function(&table);
        assert!(sql.contains("where t.\"id\" = r.\"id\" and t.\"kind\" = r.\"kind\""));
        assert!(sql.contains("set \"payload\" = r.\"payload\""));
    }

    #[test]
    fn test_delta_table_columns() {
        let sql = create_delta_table(&table());
        assert!(sql.contains("create unlogged table public.events__tat_delta"));
        assert!(sql.contains("add column tat_delta_id serial;"));
        assert!(sql.contains("add column tat_delta_op \"char\";"));
    }

    #[test]
    fn test_delta_objects_cleanup_is_reusable_as_is() {
        let sql = drop_delta_objects(&table());
        assert!(sql.contains("drop trigger if exists store__tat_delta on public.events;"));
        assert!(sql.contains(r#"drop function if exists "public.events__store_delta"();"#));
        assert!(sql.contains("drop table if exists public.events__tat_delta;"));
        assert!(!sql.contains("__tat_new"));
    }
}
