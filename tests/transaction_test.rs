//! Transaction controller tests against the scripted connector.

mod common;

use common::{DB_NAME, FakeConnector, MASTER_HOST, registry};
use dbroute::config::RouterOptions;
use dbroute::error::DbError;
use dbroute::models::{NamedParams, TransactionState};

#[tokio::test]
async fn test_begin_commit_on_master() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    assert_eq!(db.transaction_state(), TransactionState::Idle);
    db.begin().await.unwrap();
    assert!(db.in_transaction());
    assert_eq!(db.transaction_state(), TransactionState::Active);

    db.write("UPDATE users SET a = 1", &NamedParams::new())
        .await
        .unwrap();
    db.commit().await.unwrap();
    assert!(!db.in_transaction());

    assert_eq!(
        connector.sql_log(),
        vec!["START TRANSACTION", "UPDATE users SET a = 1", "COMMIT"]
    );
    assert!(connector.hosts().iter().all(|h| h == MASTER_HOST));
}

#[tokio::test]
async fn test_nested_begin_strict() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    db.begin().await.unwrap();
    let err = db.begin().await.unwrap_err();
    assert!(matches!(err, DbError::TransactionAlreadyActive { .. }));
    assert!(db.in_transaction());
    assert_eq!(connector.count_sql("START TRANSACTION"), 1);
}

#[tokio::test]
async fn test_nested_begin_lenient() {
    let connector = FakeConnector::new();
    let options = RouterOptions::default().with_strict_transactions(false);
    let registry = registry(&connector, 1, options);
    let db = registry.get(DB_NAME).await.unwrap();

    db.begin().await.unwrap();
    db.begin().await.unwrap();
    assert!(db.in_transaction());
    assert_eq!(connector.count_sql("START TRANSACTION"), 1);

    db.commit().await.unwrap();
    assert!(!db.in_transaction());
}

#[tokio::test]
async fn test_commit_without_transaction_fails() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    let err = db.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    assert!(connector.statements().is_empty());
}

#[tokio::test]
async fn test_rollback_when_idle_is_noop() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    db.rollback().await.unwrap();
    db.rollback().await.unwrap();
    assert!(connector.statements().is_empty());
    assert!(connector.connect_attempts().is_empty());
}

#[tokio::test]
async fn test_explicit_rollback() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    db.begin().await.unwrap();
    db.rollback().await.unwrap();
    db.rollback().await.unwrap();
    assert!(!db.in_transaction());
    assert_eq!(connector.sql_log(), vec!["START TRANSACTION", "ROLLBACK"]);
}

#[tokio::test]
async fn test_failed_begin_stays_idle() {
    let connector = FakeConnector::new();
    connector.fail_statements("START TRANSACTION");
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    let err = db.begin().await.unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    assert!(!db.in_transaction());

    connector.clear_failures();
    db.begin().await.unwrap();
    assert!(db.in_transaction());
}

#[tokio::test]
async fn test_failed_begin_connect_stays_idle() {
    let connector = FakeConnector::new();
    connector.refuse(MASTER_HOST);
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    assert!(matches!(
        db.begin().await,
        Err(DbError::Connection { .. })
    ));
    assert!(!db.in_transaction());
}

#[tokio::test]
async fn test_failed_commit_clears_state() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    db.begin().await.unwrap();
    connector.fail_statements("COMMIT");
    assert!(db.commit().await.is_err());
    assert!(!db.in_transaction());
    assert_eq!(connector.count_sql("ROLLBACK"), 0);
}

#[tokio::test]
async fn test_transaction_helper_commits_on_ok() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    let affected = db
        .transaction(|db| async move {
            let a = db.write("UPDATE users SET a = 1", &NamedParams::new()).await?;
            let b = db.write("UPDATE users SET b = 1", &NamedParams::new()).await?;
            Ok(a + b)
        })
        .await
        .unwrap();

    assert_eq!(affected, 2);
    assert!(!db.in_transaction());
    assert_eq!(
        connector.sql_log(),
        vec![
            "START TRANSACTION",
            "UPDATE users SET a = 1",
            "UPDATE users SET b = 1",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_transaction_helper_rolls_back_on_err() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    let result: Result<(), DbError> = db
        .transaction(|db| async move {
            db.write("UPDATE users SET a = 1", &NamedParams::new()).await?;
            Err(DbError::invalid_input("business rule violated"))
        })
        .await;

    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert!(!db.in_transaction());
    assert_eq!(connector.count_sql("ROLLBACK"), 1);
    assert_eq!(connector.count_sql("COMMIT"), 0);
}

#[tokio::test]
async fn test_transaction_helper_statement_failure_rolls_back_once() {
    let connector = FakeConnector::new();
    connector.fail_statements("nope");
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    let result = db
        .transaction(|db| async move {
            db.write("UPDATE nope SET a = 1", &NamedParams::new()).await
        })
        .await;

    assert!(matches!(result, Err(DbError::Statement { .. })));
    assert_eq!(connector.count_sql("ROLLBACK"), 1);
}

#[tokio::test]
async fn test_lost_master_abandons_transaction() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    db.begin().await.unwrap();
    connector.drop_connections(MASTER_HOST);

    let err = db
        .write("UPDATE users SET a = 1", &NamedParams::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));
    assert!(!db.in_transaction());
    assert_eq!(connector.count_sql("ROLLBACK"), 0);

    // A fresh transaction runs on a new master connection
    db.begin().await.unwrap();
    db.commit().await.unwrap();
    assert_eq!(connector.connect_attempts(), vec![MASTER_HOST, MASTER_HOST]);
    assert_eq!(
        connector.sql_log(),
        vec!["START TRANSACTION", "START TRANSACTION", "COMMIT"]
    );
}

#[tokio::test]
async fn test_slave_timeout_rolls_back_on_master() {
    let connector = FakeConnector::new();
    let registry = registry(&connector, 1, RouterOptions::default());
    let db = registry.get(DB_NAME).await.unwrap();

    db.begin().await.unwrap();
    connector.time_out_statements("FROM reports");
    let err = db
        .read("SELECT * FROM reports", &NamedParams::new(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(!db.in_transaction());

    let rollbacks: Vec<_> = connector
        .statements()
        .into_iter()
        .filter(|r| r.sql == "ROLLBACK")
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].host, MASTER_HOST);

    connector.clear_failures();
    db.read("SELECT * FROM reports", &NamedParams::new(), false)
        .await
        .unwrap();
    assert_eq!(
        connector.connect_attempts(),
        vec![MASTER_HOST, "slave0", "slave0"]
    );
}
