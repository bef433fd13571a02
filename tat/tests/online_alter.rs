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

//! End to end runs against a live Postgres.
//!
//! These tests are ignored by default, they need a reachable server:
//!
//! ```text
//! TAT_TEST_PG_HOST=localhost TAT_TEST_PG_DBNAME=tat_test \
//!     cargo test -p tat -- --ignored
//! ```
//!
//! The connection defaults to `localhost:5432/tat_test` as the `postgres`
//! user, `PGPASSWORD` is honored. Every test owns its tables and recreates
//! them on entry, so reruns are safe.

use std::{env, time::Duration};

use clap::Parser;
use sqlx::{postgres::PgConnectOptions, Connection, Executor, PgConnection, PgPool, Row};
use tat::Config;

fn pg_host() -> String {
    env::var("TAT_TEST_PG_HOST").unwrap_or_else(|_| "localhost".into())
}

fn pg_port() -> String {
    env::var("TAT_TEST_PG_PORT").unwrap_or_else(|_| "5432".into())
}

fn pg_dbname() -> String {
    env::var("TAT_TEST_PG_DBNAME").unwrap_or_else(|_| "tat_test".into())
}

fn pg_user() -> String {
    env::var("TAT_TEST_PG_USER").unwrap_or_else(|_| "postgres".into())
}

async fn pool() -> PgPool {
    let options = PgConnectOptions::new()
        .host(&pg_host())
        .port(pg_port().parse().unwrap())
        .database(&pg_dbname())
        .username(&pg_user());
    PgPool::connect_with(options).await.unwrap()
}

fn config(extra: &[&str]) -> Config {
    let host = pg_host();
    let port = pg_port();
    let dbname = pg_dbname();
    let user = pg_user();
    let mut args: Vec<&str> = vec![
        "tat", "-h", &host, "-p", &port, "-d", &dbname, "-U", &user, "-j", "2",
        "--lock-timeout", "1", "--time-between-locks", "1",
    ];
    args.extend_from_slice(extra);
    Config::try_parse_from(args).unwrap()
}

async fn column_type(pool: &PgPool, table: &str, column: &str) -> String {
    sqlx::query_scalar(
        "select format_type(a.atttypid, a.atttypmod)
           from pg_attribute a
          where a.attrelid = $1::regclass and a.attname = $2",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn leftover_artifacts(pool: &PgPool, prefix: &str) -> i64 {
    sqlx::query_scalar("select count(*) from pg_class where relname like $1 || '%__tat_%'")
        .bind(prefix)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn test_simple_retype_keeps_the_rows() {
    let pool = pool().await;
    pool.execute(
        "drop table if exists t_simple cascade;
         create table t_simple (id int primary key, v text);
         insert into t_simple values (1, 'a'), (2, 'b');",
    )
    .await
    .unwrap();

    tat::run(config(&["-t", "t_simple", "-c", "v:varchar(10)"]))
        .await
        .unwrap();

    assert_eq!(
        column_type(&pool, "t_simple", "v").await,
        "character varying(10)",
    );
    let rows: Vec<(i32, String)> = sqlx::query_as("select id, v from t_simple order by id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows, [(1, "a".into()), (2, "b".into())]);
    assert_eq!(leftover_artifacts(&pool, "t_simple").await, 0);
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn test_concurrent_inserts_all_survive() {
    let pool = pool().await;
    pool.execute(
        "drop table if exists t_busy cascade;
         create table t_busy (id int primary key, v text);
         insert into t_busy values (1, 'a'), (2, 'b');",
    )
    .await
    .unwrap();

    let writer = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for id in 3..=1000_i32 {
                sqlx::query("insert into t_busy values ($1, $2)")
                    .bind(id)
                    .bind(format!("c{id}"))
                    .execute(&pool)
                    .await
                    .unwrap();
            }
        })
    };

    tat::run(config(&["-t", "t_busy", "-c", "v:varchar(20)"]))
        .await
        .unwrap();
    writer.await.unwrap();

    let (count, distinct): (i64, i64) =
        sqlx::query_as("select count(*), count(distinct id) from t_busy")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1000);
    assert_eq!(distinct, 1000);
    let v3: String = sqlx::query_scalar("select v from t_busy where id = 3")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(v3, "c3");
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn test_batched_copy_matches_the_direct_one() {
    let pool = pool().await;
    pool.execute(
        "drop table if exists t_batched cascade;
         create table t_batched (id int primary key, v text);
         insert into t_batched select n, 'v' || n from generate_series(1, 257) n;",
    )
    .await
    .unwrap();

    tat::run(config(&[
        "-t",
        "t_batched",
        "-c",
        "v:varchar(20)",
        "--batch-size",
        "100",
    ]))
    .await
    .unwrap();

    let count: i64 = sqlx::query_scalar("select count(*) from t_batched")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 257);
    assert_eq!(
        column_type(&pool, "t_batched", "v").await,
        "character varying(20)",
    );
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn test_partitioned_table_with_a_view() {
    let pool = pool().await;
    pool.execute(
        "drop table if exists p_events cascade;
         create table p_events (id int not null, ts timestamp not null, primary key (id, ts))
           partition by range (ts);
         create table p_events_q1 partition of p_events
           for values from ('2023-01-01') to ('2023-04-01');
         create table p_events_q2 partition of p_events
           for values from ('2023-04-01') to ('2023-07-01');
         create table p_events_q3 partition of p_events
           for values from ('2023-07-01') to ('2023-10-01');
         create table p_events_q4 partition of p_events
           for values from ('2023-10-01') to ('2024-01-01');
         insert into p_events
           select n, timestamp '2023-01-01' + n * interval '24 hours'
             from generate_series(1, 300) n;
         create view v_events as select id, ts from p_events;",
    )
    .await
    .unwrap();

    tat::run(config(&["-t", "p_events", "-c", "ts:timestamptz"]))
        .await
        .unwrap();

    assert_eq!(
        column_type(&pool, "p_events", "ts").await,
        "timestamp with time zone",
    );
    for partition in ["p_events_q1", "p_events_q2", "p_events_q3", "p_events_q4"] {
        assert_eq!(
            column_type(&pool, partition, "ts").await,
            "timestamp with time zone",
        );
    }
    let count: i64 = sqlx::query_scalar("select count(*) from v_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 300);
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn test_foreign_keys_are_recreated_and_validated() {
    let pool = pool().await;
    pool.execute(
        "drop table if exists fk_ref cascade;
         drop table if exists t_referenced cascade;
         create table t_referenced (id int primary key, v text);
         insert into t_referenced values (1, 'a'), (2, 'b');
         create table fk_ref (id serial primary key,
                              t_id int references t_referenced (id));
         insert into fk_ref (t_id) values (1), (2);",
    )
    .await
    .unwrap();

    tat::run(config(&["-t", "t_referenced", "-c", "v:varchar(10)"]))
        .await
        .unwrap();

    let validated: bool = sqlx::query_scalar(
        "select convalidated
           from pg_constraint
          where conrelid = 'fk_ref'::regclass and contype = 'f'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(validated);
    let joined: i64 = sqlx::query_scalar(
        "select count(*) from fk_ref r inner join t_referenced t on t.id = r.t_id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(joined, 2);
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn test_lock_contention_is_retried() {
    let pool = pool().await;
    pool.execute(
        "drop table if exists t_locked cascade;
         create table t_locked (id int primary key, v text);
         insert into t_locked values (1, 'a'), (2, 'b');",
    )
    .await
    .unwrap();

    // a row lock held longer than lock_timeout forces at least one retry
    let blocker = tokio::spawn(async move {
        let options = PgConnectOptions::new()
            .host(&pg_host())
            .port(pg_port().parse().unwrap())
            .database(&pg_dbname())
            .username(&pg_user());
        let mut connection = PgConnection::connect_with(&options).await.unwrap();
        let mut tx = connection.begin().await.unwrap();
        tx.execute("select * from t_locked where id = 1 for update")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.commit().await.unwrap();
    });

    tat::run(config(&["-t", "t_locked", "-c", "v:varchar(10)"]))
        .await
        .unwrap();
    blocker.await.unwrap();

    let count: i64 = sqlx::query_scalar("select count(*) from t_locked")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(
        column_type(&pool, "t_locked", "v").await,
        "character varying(10)",
    );
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn test_cleanup_removes_leftovers_and_reenables_autovacuum() {
    let pool = pool().await;
    pool.execute(
        "drop table if exists t_aborted cascade;
         drop table if exists t_aborted__tat_new cascade;
         drop table if exists t_aborted__tat_delta cascade;
         create table t_aborted (id int primary key, v text);
         alter table t_aborted set (autovacuum_enabled = false);
         create table t_aborted__tat_new (like t_aborted including all);
         create unlogged table t_aborted__tat_delta (like t_aborted excluding all);
         create function \"t_aborted__store_delta\"() returns trigger as
           $$ begin return new; end; $$ language plpgsql;
         create function \"t_aborted__apply_delta\"() returns integer as
           $$ begin return 0; end; $$ language plpgsql;
         create trigger store__tat_delta after insert on t_aborted
           for each row execute procedure \"t_aborted__store_delta\"();",
    )
    .await
    .unwrap();

    for _ in 0..2 {
        tat::run(config(&["-t", "t_aborted", "--cleanup"])).await.unwrap();

        assert_eq!(leftover_artifacts(&pool, "t_aborted").await, 0);
        let row = sqlx::query("select reloptions from pg_class where relname = 't_aborted'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let options: Option<Vec<String>> = row.get("reloptions");
        assert!(options
            .unwrap_or_default()
            .iter()
            .all(|option| !option.starts_with("autovacuum_enabled")));
    }
}
