//! End-to-end session tests against the scripted mock server.

use std::time::Duration;

use tds_conn::{
    Config, Connection, ConnectionEvent, ErrorCode, IsolationLevel, State, TdsVersion,
};
use tds_mock::{MockTdsServer, Step, tokens};
use tokio::sync::mpsc;

fn config_for(server: &MockTdsServer) -> Config {
    Config::new("127.0.0.1", "sa", "password").with_port(server.addr().port())
}

#[tokio::test]
async fn plaintext_login_happy_path() {
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0))) // initial SQL batch
        .start()
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::connect_with_events(config_for(&server), Some(tx))
        .await
        .unwrap();

    assert_eq!(conn.state(), State::LoggedIn);
    assert_eq!(conn.tds_version(), TdsVersion::V7_4);
    assert_eq!(conn.transaction_descriptor_depth(), 1);
    assert_eq!(conn.current_transaction_descriptor(), 0);

    // Database change from the login response, then the single connect.
    let mut saw_database_change = false;
    loop {
        match rx.recv().await.unwrap() {
            ConnectionEvent::DatabaseChange(db) => {
                assert_eq!(db, "master");
                saw_database_change = true;
            }
            ConnectionEvent::Connect(err) => {
                assert!(err.is_none());
                break;
            }
            _ => {}
        }
    }
    assert!(saw_database_change);

    conn.close();
    assert!(matches!(rx.recv().await.unwrap(), ConnectionEvent::End));
    // End fires exactly once.
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn login_failure_surfaces_the_server_error() {
    let server = MockTdsServer::builder()
        .login_tokens(tokens::login_failure(18456, "Login failed for user 'sa'."))
        .start()
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = Connection::connect_with_events(config_for(&server), Some(tx))
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::ELogin);
    assert!(err.message.contains("Login failed"));

    // The connect event carries the same error, then the session ends.
    let mut saw_connect_error = false;
    let mut saw_end = false;
    while let Some(event) = rx.recv().await {
        match event {
            ConnectionEvent::Connect(Some(e)) => {
                assert_eq!(e.code, ErrorCode::ELogin);
                saw_connect_error = true;
            }
            ConnectionEvent::End => saw_end = true,
            _ => {}
        }
    }
    assert!(saw_connect_error);
    assert!(saw_end);
}

#[tokio::test]
async fn connect_timeout_fires() {
    // A listener that accepts and then goes silent.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hold = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let config = Config::new("127.0.0.1", "sa", "password")
        .with_port(port)
        .with_connect_timeout(Duration::from_millis(200));

    let err = Connection::connect(config).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ETimeout);
    hold.abort();
}

#[tokio::test]
async fn query_returns_rows_and_row_count() {
    let response = tokens::stream(&[
        tokens::col_metadata_int(&["id", "score"]),
        tokens::int_row(&[1, 10]),
        tokens::int_row(&[2, 20]),
        tokens::int_row(&[3, 30]),
        tokens::done_count(3),
    ]);
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(response))
        .start()
        .await
        .unwrap();

    let mut config = config_for(&server);
    config.row_collection_on_request_completion = true;

    let mut conn = Connection::connect(config).await.unwrap();
    let outcome = conn
        .exec_sql_batch("SELECT id, score FROM t")
        .await
        .unwrap();

    assert!(outcome.is_ok());
    assert_eq!(outcome.row_count, 3);
    assert_eq!(outcome.rows.len(), 3);
    assert_eq!(outcome.columns.len(), 2);
    assert_eq!(outcome.columns[0].name, "id");

    let first = outcome.rows[0].values[0].as_ref().unwrap();
    assert_eq!(&first[..], &1i32.to_le_bytes());

    assert_eq!(conn.state(), State::LoggedIn);
}

#[tokio::test]
async fn rows_are_not_collected_without_the_option() {
    let response = tokens::stream(&[
        tokens::col_metadata_int(&["id"]),
        tokens::int_row(&[1]),
        tokens::int_row(&[2]),
        tokens::done_count(2),
    ]);
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(response))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();
    let outcome = conn.exec_sql_batch("SELECT id FROM t").await.unwrap();

    assert_eq!(outcome.row_count, 2);
    assert!(outcome.rows.is_empty());
}

#[tokio::test]
async fn row_count_sums_over_all_completion_tokens() {
    let response = tokens::stream(&[tokens::done_more(2), tokens::done_count(3)]);
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(response))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();
    let outcome = conn.exec_sql_batch("UPDATE a; UPDATE b").await.unwrap();
    assert_eq!(outcome.row_count, 5);
}

#[tokio::test]
async fn server_error_is_scoped_to_the_request() {
    let failing = tokens::stream(&[
        tokens::server_error(102, 15, "Incorrect syntax near 'FORM'."),
        tokens::done_count(0),
    ]);
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(failing))
        .step(Step::reply(tokens::done_count(1)))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();

    let outcome = conn.exec_sql_batch("SELECT * FORM t").await.unwrap();
    let err = outcome.error.unwrap();
    assert_eq!(err.code, ErrorCode::ERequest);
    assert_eq!(err.number, Some(102));

    // The connection survives and accepts the next request.
    assert_eq!(conn.state(), State::LoggedIn);
    let outcome = conn.exec_sql_batch("DELETE FROM t").await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outcome.row_count, 1);
}

#[tokio::test]
async fn cancel_round_trip() {
    let intermediate = tokens::stream(&[
        tokens::col_metadata_int(&["n"]),
        tokens::int_row(&[1]),
        tokens::done_count(1),
    ]);
    let ack = tokens::done_attention();
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::attention_reply(vec![intermediate, ack]))
        .start()
        .await
        .unwrap();

    let mut config = config_for(&server);
    config.row_collection_on_request_completion = true;

    let mut conn = Connection::connect(config).await.unwrap();
    let handle = conn.cancel_handle().unwrap();

    let (outcome, cancel_sent) = tokio::join!(
        conn.exec_sql_batch("waitfor delay '00:00:30'"),
        async move {
            loop {
                match handle.cancel().await {
                    Ok(true) => return true,
                    Ok(false) => tokio::time::sleep(Duration::from_millis(5)).await,
                    Err(_) => return false,
                }
            }
        }
    );

    assert!(cancel_sent);
    let outcome = outcome.unwrap();
    let err = outcome.error.unwrap();
    assert_eq!(err.code, ErrorCode::ECancel);
    assert_eq!(err.message, "Canceled.");

    // Rows seen before the acknowledgment are still reported.
    assert_eq!(outcome.row_count, 1);
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(conn.state(), State::LoggedIn);
}

#[tokio::test]
async fn cancel_outside_a_request_has_no_effect() {
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();
    assert!(!conn.cancel().await.unwrap());
    assert_eq!(conn.state(), State::LoggedIn);
}

#[tokio::test]
async fn nested_transactions_wind_and_unwind_the_descriptor_stack() {
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(tokens::stream(&[
            tokens::env_begin_transaction(0x1111),
            tokens::done_count(0),
        ])))
        .step(Step::reply(tokens::stream(&[
            tokens::env_begin_transaction(0x2222),
            tokens::done_count(0),
        ])))
        .step(Step::reply(tokens::stream(&[
            tokens::env_commit_transaction(0x2222),
            tokens::done_count(0),
        ])))
        .step(Step::reply(tokens::stream(&[
            tokens::env_commit_transaction(0x1111),
            tokens::done_count(0),
        ])))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();
    assert_eq!(conn.transaction_descriptor_depth(), 1);

    let outcome = conn.begin_transaction("outer", None).await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(conn.transaction_descriptor_depth(), 2);
    assert_eq!(conn.current_transaction_descriptor(), 0x1111);
    assert_eq!(conn.open_transaction_count(), 1);

    let outcome = conn
        .begin_transaction("inner", Some(IsolationLevel::Serializable))
        .await
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(conn.transaction_descriptor_depth(), 3);
    assert_eq!(conn.current_transaction_descriptor(), 0x2222);

    let outcome = conn.commit_transaction().await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(conn.transaction_descriptor_depth(), 2);
    assert_eq!(conn.current_transaction_descriptor(), 0x1111);

    let outcome = conn.commit_transaction().await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(conn.transaction_descriptor_depth(), 1);
    assert_eq!(conn.current_transaction_descriptor(), 0);
    assert_eq!(conn.open_transaction_count(), 0);
}

#[tokio::test]
async fn commit_without_a_transaction_fails_synchronously() {
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();

    let outcome = conn.commit_transaction().await.unwrap();
    assert_eq!(outcome.error.unwrap().code, ErrorCode::ENoTrnInProg);

    let outcome = conn.rollback_transaction().await.unwrap();
    assert_eq!(outcome.error.unwrap().code, ErrorCode::ENoTrnInProg);
}

#[tokio::test]
async fn transactions_are_rejected_below_tds_7_2() {
    let server = MockTdsServer::builder()
        .login_tokens(tokens::stream(&[
            tokens::login_ack(TdsVersion::V7_1),
            tokens::done_count(0),
        ]))
        .step(Step::reply(tokens::done_count(0)))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();
    assert_eq!(conn.tds_version(), TdsVersion::V7_1);

    let outcome = conn.begin_transaction("t", None).await.unwrap();
    assert_eq!(outcome.error.unwrap().code, ErrorCode::EInvalidState);
    assert_eq!(conn.open_transaction_count(), 0);
}

#[tokio::test]
async fn prepared_statement_round_trip() {
    let prepare_response = tokens::stream(&[
        tokens::return_value_int("handle", 42),
        tokens::return_status(0),
        tokens::done_proc(0),
    ]);
    let execute_response = tokens::stream(&[
        tokens::col_metadata_int(&["id"]),
        tokens::int_row(&[7]),
        tokens::done_count(1),
    ]);
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(prepare_response))
        .step(Step::reply(execute_response))
        .step(Step::reply(tokens::done_count(0)))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();

    let outcome = conn
        .prepare("SELECT id FROM t WHERE id = @p1", &[tds_conn::RpcParam::int("@p1", 0)])
        .await
        .unwrap();
    assert!(outcome.is_ok());
    let handle = outcome.int_return_value("@handle").unwrap();
    assert_eq!(handle, 42);
    assert_eq!(outcome.return_status, Some(0));

    let outcome = conn
        .execute(handle, vec![tds_conn::RpcParam::int("@p1", 7)])
        .await
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outcome.row_count, 1);

    let outcome = conn.unprepare(handle).await.unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn reset_reissues_session_options() {
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(tokens::done_count(0)))
        .start()
        .await
        .unwrap();

    let mut conn = Connection::connect(config_for(&server)).await.unwrap();
    let outcome = conn.reset().await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(conn.state(), State::LoggedIn);
}

#[tokio::test]
async fn abrupt_close_is_fatal_and_requests_are_refused_afterwards() {
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .start()
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = Connection::connect_with_events(config_for(&server), Some(tx))
        .await
        .unwrap();

    // Drain the connect-phase events.
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, ConnectionEvent::End));
    }

    server.shutdown();
    let err = conn.exec_sql_batch("SELECT 1").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ESocket);
    assert_eq!(conn.state(), State::Final);

    // Cleanup ran once; nothing further goes out.
    let outcome = conn.exec_sql_batch("SELECT 1").await.unwrap();
    assert_eq!(outcome.error.unwrap().code, ErrorCode::EInvalidState);

    let mut end_count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ConnectionEvent::End) {
            end_count += 1;
        }
    }
    assert_eq!(end_count, 1);
}

#[tokio::test]
async fn info_messages_are_forwarded() {
    let response = tokens::stream(&[
        tokens::server_info(50000, "heads up"),
        tokens::done_count(0),
    ]);
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(response))
        .start()
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = Connection::connect_with_events(config_for(&server), Some(tx))
        .await
        .unwrap();

    let outcome = conn.exec_sql_batch("PRINT 'heads up'").await.unwrap();
    assert!(outcome.is_ok());

    let mut saw_info = false;
    while let Ok(event) = rx.try_recv() {
        if let ConnectionEvent::InfoMessage(msg) = event {
            assert_eq!(msg.number, 50000);
            assert_eq!(msg.message, "heads up");
            saw_info = true;
        }
    }
    assert!(saw_info);
}

#[tokio::test]
async fn duplicate_columns_are_deduplicated_by_name_when_configured() {
    let response = tokens::stream(&[
        tokens::col_metadata_int(&["id", "id", "other"]),
        tokens::int_row(&[1, 2, 3]),
        tokens::done_count(1),
    ]);
    let server = MockTdsServer::builder()
        .step(Step::reply(tokens::done_count(0)))
        .step(Step::reply(response))
        .start()
        .await
        .unwrap();

    let mut config = config_for(&server);
    config.use_column_names = true;
    config.row_collection_on_request_completion = true;

    let mut conn = Connection::connect(config).await.unwrap();
    let outcome = conn.exec_sql_batch("SELECT ...").await.unwrap();

    let names: Vec<_> = outcome.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "other"]);
    // Row values are untouched by the dedup.
    assert_eq!(outcome.rows[0].values.len(), 3);
}
