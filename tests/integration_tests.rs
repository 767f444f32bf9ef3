//! Integration tests for the executor over real drivers
//!
//! These tests verify end-to-end behaviour against SQLite:
//! - Transactions commit on success and roll back on failure
//! - Parameters bind by name, by position and with declared types
//! - Scalars coerce to the requested type
//! - Concurrent callers each get their own transaction

#[cfg(feature = "sqlite")]
mod sqlite_tests {
    use chrono::{DateTime, Utc};
    use rust_database_executor::core::{
        execute_scalar, BlockingConnection, BlockingTransaction, ExecutorConfig,
    };
    use rust_database_executor::prelude::*;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn memory() -> Blocking<SqliteConnection> {
        Blocking::new(SqliteConnection::new(":memory:"))
    }

    async fn with_users_table() -> Blocking<SqliteConnection> {
        let mut connection = memory();
        connection
            .leave_open()
            .execute(CommandRequest::new(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER)",
            ))
            .await
            .expect("Failed to create table");
        connection
    }

    struct TempDb(PathBuf);

    impl TempDb {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "rust_database_executor_{}_{}.db",
                name,
                std::process::id()
            ));
            let _ = std::fs::remove_file(&path);
            Self(path)
        }

        fn connection(&self) -> Blocking<SqliteConnection> {
            let path = self.0.to_string_lossy().into_owned();
            Blocking::with_config(
                SqliteConnection::new(path).with_busy_timeout(Duration::from_secs(5)),
                ExecutorConfig::new().with_operation_timeout(Duration::from_secs(10)),
            )
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[tokio::test]
    async fn test_select_one_commits() {
        let affected = memory()
            .execute(CommandRequest::new("SELECT 1;"))
            .await
            .expect("SELECT 1 failed");
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let mut connection = with_users_table().await;

        for (name, age) in [("Alice", 30), ("Bob", 25), ("Carol", 41)] {
            let affected = connection
                .leave_open()
                .execute(
                    CommandRequest::new("INSERT INTO users (name, age) VALUES (:name, :age)")
                        .param("name", name)
                        .param("age", age),
                )
                .await
                .expect("Insert failed");
            assert_eq!(affected, 1);
        }

        let rows = connection
            .execute_reader(CommandRequest::new(
                "SELECT name, age, id FROM users ORDER BY age",
            ))
            .await
            .expect("Query failed");

        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0].column_names().collect::<Vec<_>>(),
            vec!["name", "age", "id"]
        );
        let names: Vec<String> = rows
            .iter()
            .map(|row| row.get_as::<String>("name").expect("name"))
            .collect();
        assert_eq!(names, vec!["Bob", "Alice", "Carol"]);
        assert_eq!(rows[2].get_as::<i32>("age").expect("age"), 41);
    }

    #[tokio::test]
    async fn test_scalar_value_is_uncoerced() {
        let mut connection = memory();
        let value = connection
            .leave_open()
            .execute_scalar_value(CommandRequest::new("SELECT 'forty-two'"))
            .await
            .expect("Scalar failed");
        assert_eq!(value.as_str(), Some("forty-two"));

        let value = connection
            .execute_scalar_value(CommandRequest::new("SELECT NULL"))
            .await
            .expect("Scalar failed");
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn test_reader_empty_result() {
        let rows = with_users_table()
            .await
            .execute_reader(CommandRequest::new("SELECT * FROM users"))
            .await
            .expect("Query failed");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_positional_parameters() {
        let mut connection = with_users_table().await;
        connection
            .leave_open()
            .execute(
                CommandRequest::new("INSERT INTO users (name, age) VALUES (?, ?)")
                    .params([("p1", DatabaseValue::from("Dave")), ("p2", 52.into())]),
            )
            .await
            .expect("Insert failed");

        let age: i64 = connection
            .execute_scalar(CommandRequest::new("SELECT age FROM users WHERE name = 'Dave'"))
            .await
            .expect("Scalar failed");
        assert_eq!(age, 52);
    }

    #[tokio::test]
    async fn test_typed_parameter_coerces_before_binding() {
        let mut connection = with_users_table().await;
        connection
            .leave_open()
            .execute(
                CommandRequest::new("INSERT INTO users (name, age) VALUES (@name, @age)")
                    .param("@name", "Eve")
                    .typed_param("@age", "33", ParameterType::Long),
            )
            .await
            .expect("Insert failed");

        let kind: String = connection
            .execute_scalar(CommandRequest::new(
                "SELECT typeof(age) FROM users WHERE name = 'Eve'",
            ))
            .await
            .expect("Scalar failed");
        assert_eq!(kind, "integer");
    }

    #[tokio::test]
    async fn test_uncoercible_typed_parameter_is_wrapped() {
        let mut connection = with_users_table().await;
        let err = connection
            .leave_open()
            .execute(
                CommandRequest::new("INSERT INTO users (name, age) VALUES ('x', :age)")
                    .typed_param("age", "thirty", ParameterType::Int),
            )
            .await
            .expect_err("Insert should fail");

        assert!(matches!(err, DatabaseError::CommandFailed { .. }));
        assert!(matches!(err.cause(), Some(DatabaseError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_failed_body_rolls_back() {
        let mut connection = with_users_table().await;

        let result: Result<()> = connection
            .leave_open()
            .run_with_transaction(
                CommandRequest::new("INSERT INTO users (name) VALUES ('Mallory')"),
                |command| {
                    Box::pin(async move {
                        command.execute_non_query().await?;
                        Err::<(), _>(DatabaseError::other("abort after insert"))
                    })
                },
            )
            .await;
        let err = result.expect_err("Body should fail");
        assert_eq!(
            err.cause().map(ToString::to_string).as_deref(),
            Some("abort after insert")
        );

        let count: i64 = connection
            .execute_scalar(CommandRequest::new("SELECT COUNT(*) FROM users"))
            .await
            .expect("Count failed");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_invalid_sql_is_wrapped() {
        let err = memory()
            .execute(CommandRequest::new("SELEC 1"))
            .await
            .expect_err("Invalid SQL should fail");

        assert_eq!(err.to_string(), "Command execution failed");
        assert!(matches!(err.cause(), Some(DatabaseError::SqliteError(_))));
    }

    #[tokio::test]
    async fn test_constraint_violation_rolls_back_whole_command() {
        let mut connection = with_users_table().await;
        let err = connection
            .leave_open()
            .execute(CommandRequest::new(
                "INSERT INTO users (name) VALUES ('ok'), (NULL)",
            ))
            .await
            .expect_err("NOT NULL should fail");
        assert!(matches!(err, DatabaseError::CommandFailed { .. }));

        let count: i64 = connection
            .execute_scalar(CommandRequest::new("SELECT COUNT(*) FROM users"))
            .await
            .expect("Count failed");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_scalar_current_timestamp() {
        let now: DateTime<Utc> = execute_scalar(
            memory(),
            CommandRequest::new("SELECT CURRENT_TIMESTAMP"),
        )
        .await
        .expect("Scalar failed");

        let drift = (Utc::now() - now).num_seconds().abs();
        assert!(drift < 60, "timestamp drifted {}s", drift);
    }

    #[tokio::test]
    async fn test_scalar_null_and_empty_yield_default() {
        let value: i64 = memory()
            .execute_scalar(CommandRequest::new("SELECT NULL"))
            .await
            .expect("Scalar failed");
        assert_eq!(value, 0);

        let value: String = with_users_table()
            .await
            .execute_scalar(CommandRequest::new("SELECT name FROM users"))
            .await
            .expect("Scalar failed");
        assert_eq!(value, "");
    }

    #[tokio::test]
    async fn test_scalar_type_mismatch_is_not_wrapped() {
        let err = memory()
            .execute_scalar::<i64>(CommandRequest::new("SELECT 'abc'"))
            .await
            .expect_err("Coercion should fail");
        assert!(matches!(err, DatabaseError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_timestamp_parameter_round_trip() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T08:15:30.250Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);

        let back: DateTime<Utc> = memory()
            .execute_scalar(CommandRequest::new("SELECT :at").param("at", at))
            .await
            .expect("Scalar failed");
        assert_eq!(back, at);
    }

    #[tokio::test]
    async fn test_blob_data() {
        let mut connection = memory();
        connection
            .leave_open()
            .execute(CommandRequest::new("CREATE TABLE files (data BLOB)"))
            .await
            .expect("Failed to create table");

        let payload: Vec<u8> = (0..=255).collect();
        connection
            .leave_open()
            .execute(CommandRequest::new("INSERT INTO files VALUES (?)").param("data", payload.clone()))
            .await
            .expect("Insert failed");

        let back: Vec<u8> = connection
            .execute_scalar(CommandRequest::new("SELECT data FROM files"))
            .await
            .expect("Scalar failed");
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn test_every_isolation_level_runs() {
        for level in [
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
            IsolationLevel::Snapshot,
        ] {
            let value: i64 = memory()
                .execute_scalar(CommandRequest::new("SELECT 7").isolation_level(level))
                .await
                .unwrap_or_else(|e| panic!("{} failed: {}", level, e));
            assert_eq!(value, 7);
        }
    }

    #[tokio::test]
    async fn test_connection_reopens_between_calls() {
        let db = TempDb::new("reopen");

        db.connection()
            .execute(CommandRequest::new("CREATE TABLE t (v INTEGER)"))
            .await
            .expect("Failed to create table");
        db.connection()
            .execute(CommandRequest::new("INSERT INTO t VALUES (1)"))
            .await
            .expect("Insert failed");

        let count: i64 = db
            .connection()
            .execute_scalar(CommandRequest::new("SELECT COUNT(*) FROM t"))
            .await
            .expect("Count failed");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_commands() {
        let db = TempDb::new("concurrent");
        db.connection()
            .execute(CommandRequest::new(
                "CREATE TABLE test (id INTEGER PRIMARY KEY, value INTEGER)",
            ))
            .await
            .expect("Failed to create table");

        let mut handles = vec![];
        for i in 0..10 {
            let connection = db.connection();
            handles.push(tokio::spawn(async move {
                connection
                    .execute(
                        CommandRequest::new("INSERT INTO test (id, value) VALUES (?, ?)")
                            .isolation_level(IsolationLevel::Serializable)
                            .param("id", i)
                            .param("value", i * 10),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("Task panicked").expect("Insert failed");
        }

        let total: i64 = db
            .connection()
            .execute_scalar(CommandRequest::new("SELECT SUM(value) FROM test"))
            .await
            .expect("Sum failed");
        assert_eq!(total, 450);
    }

    #[tokio::test]
    async fn test_cancelled_request_never_opens() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();

        let mut connection = memory();
        let err = connection
            .leave_open()
            .execute(CommandRequest::new("SELECT 1").cancellation(token))
            .await
            .expect_err("Cancelled request should fail");

        assert!(matches!(err, DatabaseError::Cancelled));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_every_statement_in_text_runs() {
        let mut connection = memory();
        connection
            .leave_open()
            .execute(CommandRequest::new(
                "CREATE TABLE a (x INTEGER); CREATE TABLE b (y INTEGER)",
            ))
            .await
            .expect("Create failed");

        let rows = connection
            .execute_reader(CommandRequest::new(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
            ))
            .await
            .expect("Query failed");
        let tables: Vec<String> = rows
            .iter()
            .map(|row| row.get_as::<String>("name").expect("name"))
            .collect();
        assert_eq!(tables, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_insert_then_select_scalar() {
        let mut connection = with_users_table().await;
        for (expected, name) in [(1i64, "Alice"), (2, "Bob")] {
            let id: i64 = connection
                .leave_open()
                .execute_scalar(
                    CommandRequest::new(
                        "INSERT INTO users (name) VALUES (:name); SELECT last_insert_rowid();",
                    )
                    .param("name", name),
                )
                .await
                .expect("Insert failed");
            assert_eq!(id, expected);
        }
    }

    #[tokio::test]
    async fn test_failing_later_statement_rolls_back_earlier_ones() {
        let mut connection = with_users_table().await;
        let err = connection
            .leave_open()
            .execute(CommandRequest::new(
                "INSERT INTO users (name) VALUES ('kept?'); INSERT INTO users (name) VALUES (NULL)",
            ))
            .await
            .expect_err("NOT NULL should fail");
        assert!(matches!(err.cause(), Some(DatabaseError::SqliteError(_))));

        let count: i64 = connection
            .execute_scalar(CommandRequest::new("SELECT COUNT(*) FROM users"))
            .await
            .expect("Count failed");
        assert_eq!(count, 0);
    }

    const LONG_COUNT: &str = "WITH RECURSIVE c(x) AS \
        (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 2000000000) SELECT count(*) FROM c";

    #[tokio::test]
    async fn test_timed_out_command_returns_promptly() {
        let mut connection = Blocking::with_config(
            SqliteConnection::new(":memory:"),
            ExecutorConfig::new().with_operation_timeout(Duration::from_millis(100)),
        );

        let started = Instant::now();
        let err = connection
            .leave_open()
            .execute_scalar_value(CommandRequest::new(LONG_COUNT))
            .await
            .expect_err("Command should time out");
        let elapsed = started.elapsed();

        assert!(matches!(err, DatabaseError::CommandFailed { .. }));
        assert!(matches!(
            err.cause(),
            Some(DatabaseError::OperationTimeout { timeout_ms: 100 })
        ));
        assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
        assert_ne!(connection.state(), ConnectionState::Open);

        // The abandoned connection is replaced on the next call
        let value: i64 = connection
            .execute_scalar(CommandRequest::new("SELECT 5"))
            .await
            .expect("Reuse after timeout failed");
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_lock() {
        let db = TempDb::new("cancel_wait");
        db.connection()
            .execute(CommandRequest::new("CREATE TABLE t (v INTEGER)"))
            .await
            .expect("Failed to create table");

        let mut holder = SqliteConnection::new(db.0.to_string_lossy().into_owned());
        holder.open().expect("Holder open failed");
        let mut lock = holder
            .begin_transaction(IsolationLevel::Serializable)
            .expect("Holder begin failed");

        let token = tokio_util::sync::CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let waiting = Blocking::with_config(
            SqliteConnection::new(db.0.to_string_lossy().into_owned())
                .with_busy_timeout(Duration::from_secs(3)),
            ExecutorConfig::new().with_operation_timeout(Duration::from_millis(200)),
        );
        let started = Instant::now();
        let err = waiting
            .execute(
                CommandRequest::new("INSERT INTO t VALUES (1)")
                    .isolation_level(IsolationLevel::Serializable)
                    .cancellation(token),
            )
            .await
            .expect_err("Cancelled request should fail");
        let elapsed = started.elapsed();

        assert!(matches!(err, DatabaseError::Cancelled));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);

        lock.rollback().expect("Holder rollback failed");
    }
}

#[cfg(feature = "postgres")]
mod postgres_tests {
    use rust_database_executor::prelude::*;

    // Requires a running server; set DATABASE_URL to enable
    #[tokio::test]
    #[ignore]
    async fn test_postgres_round_trip() {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "host=localhost user=postgres".to_string());

        let mut connection = PostgresConnection::new(url);
        connection
            .leave_open()
            .execute(CommandRequest::new(
                "CREATE TEMP TABLE items (id BIGINT, label TEXT, seen TIMESTAMPTZ)",
            ))
            .await
            .expect("Failed to create table");

        connection
            .leave_open()
            .execute(
                CommandRequest::new("INSERT INTO items VALUES ($1, $2, now())")
                    .isolation_level(IsolationLevel::Serializable)
                    .param("id", 1i64)
                    .param("label", "first"),
            )
            .await
            .expect("Insert failed");

        let rows = connection
            .execute_reader(CommandRequest::new("SELECT id, label, seen FROM items"))
            .await
            .expect("Query failed");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_as::<i64>("id").expect("id"), 1);
        assert!(rows[0].get("seen").and_then(DatabaseValue::as_datetime).is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_reads_date_numeric_and_uuid() {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "host=localhost user=postgres".to_string());

        let rows = PostgresConnection::new(url)
            .execute_reader(CommandRequest::new(
                "SELECT DATE '2024-02-29' AS day, 12.50::numeric AS amount, \
                 '00010203-0405-0607-0809-0a0b0c0d0e0f'::uuid AS id, '{}'::jsonb AS doc",
            ))
            .await
            .expect("Query failed");

        let row = &rows[0];
        let day = row.get_as::<chrono::NaiveDateTime>("day").expect("day");
        assert_eq!(day.to_string(), "2024-02-29 00:00:00");
        assert_eq!(row.get_as::<String>("amount").expect("amount"), "12.50");
        assert_eq!(
            row.get_as::<String>("id").expect("id"),
            "00010203-0405-0607-0809-0a0b0c0d0e0f"
        );
        assert_eq!(row.get_as::<String>("doc").expect("doc"), "{}");
    }
}
