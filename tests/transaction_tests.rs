/// Session and transaction scope tests
///
/// Commit on success, abort on failure and on cancellation
/// Run with: cargo test --test transaction_tests

mod common;

use common::{Note, Person, template};
use futures::TryStreamExt;
use rustdocmap::driver::OperationKind;
use rustdocmap::{DbError, InMemoryDriver, Query, ScopeState, SessionSource, TransactionState};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

#[tokio::test]
async fn test_transaction_commits_all_writes() {
    let driver = InMemoryDriver::new();
    let scope = template(&driver).in_transaction(SessionSource::default());

    let saved = scope
        .execute(|tx| async move {
            let person = tx.save(Person::new("Ada", 36)).await?;
            tx.save(Note::new("joined")).await?;

            // Staged writes are visible inside the transaction only
            let inside: Vec<Person> = tx.find(&Query::all()).try_collect().await?;
            assert_eq!(inside.len(), 1);
            Ok(person)
        })
        .await
        .unwrap();

    assert_eq!(scope.state(), ScopeState::TransactionCommitted);
    assert_eq!(saved.version, Some(0));
    assert_eq!(driver.documents("test.person").len(), 1);
    assert_eq!(driver.documents("test.note").len(), 1);
    assert_eq!(driver.count_operations(OperationKind::StartTransaction), 1);
    assert_eq!(driver.count_operations(OperationKind::CommitTransaction), 1);
}

#[tokio::test]
async fn test_failed_action_aborts() {
    let driver = InMemoryDriver::new();
    let scope = template(&driver).in_transaction(SessionSource::default());

    let err = scope
        .execute(|tx| async move {
            tx.save(Person::new("Ada", 36)).await?;
            Err::<(), _>(DbError::InvalidUsage("business rule violated".to_string()))
        })
        .await
        .unwrap_err();

    assert!(err.is_usage_error());
    assert_eq!(scope.state(), ScopeState::TransactionAborted);
    assert!(driver.documents("test.person").is_empty());
    assert_eq!(driver.count_operations(OperationKind::AbortTransaction), 1);
    assert_eq!(driver.count_operations(OperationKind::CommitTransaction), 0);
}

#[tokio::test]
async fn test_cancelled_scope_aborts() {
    let driver = InMemoryDriver::new();
    let scope = template(&driver).in_transaction(SessionSource::default());
    let (written_tx, written_rx) = oneshot::channel();
    let finalized: Arc<Mutex<Vec<TransactionState>>> = Arc::new(Mutex::new(Vec::new()));

    // step 1: run two writes, then park until cancelled
    let running = scope.clone();
    let seen = finalized.clone();
    let handle = tokio::spawn(async move {
        running
            .execute_with_finalizer(
                |tx| async move {
                    tx.save(Person::new("Ada", 36)).await?;
                    tx.save(Person::new("Grace", 45)).await?;
                    let _ = written_tx.send(());
                    futures::future::pending::<rustdocmap::Result<()>>().await
                },
                move |session| seen.lock().unwrap().push(session.transaction_state()),
            )
            .await
    });

    // step 2: cancel once both writes are staged
    written_rx.await.unwrap();
    assert_eq!(scope.state(), ScopeState::TransactionActive);
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    // step 3: the abort and the finalizer run on a spawned task
    for _ in 0..100 {
        if !finalized.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*finalized.lock().unwrap(), vec![TransactionState::Aborted]);
    assert_eq!(scope.state(), ScopeState::TransactionAborted);
    assert!(driver.documents("test.person").is_empty());
    assert_eq!(driver.count_operations(OperationKind::AbortTransaction), 1);
    assert_eq!(driver.count_operations(OperationKind::CommitTransaction), 0);

    // step 4: nothing runs the finalizer a second time
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(finalized.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_commit_keeps_concurrent_writes() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    let scope = template.in_transaction(SessionSource::default());

    let outside = template.clone();
    scope
        .execute(|tx| async move {
            tx.save(Note::new("inside")).await?;
            // committed directly while the transaction is still open
            outside.save(Note::new("outside")).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(scope.state(), ScopeState::TransactionCommitted);
    let mut texts: Vec<String> = driver
        .documents("test.note")
        .iter()
        .map(|doc| doc["text"].as_str().unwrap_or_default().to_string())
        .collect();
    texts.sort();
    assert_eq!(texts, vec!["inside".to_string(), "outside".to_string()]);
}

#[tokio::test]
async fn test_commit_conflict_aborts_scope() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    let ada = template.save(Person::new("Ada", 36)).await.unwrap();
    let scope = template.in_transaction(SessionSource::default());

    let outside = template.clone();
    let err = scope
        .execute(|tx| async move {
            let mut staged = ada.clone();
            staged.age = 37;
            tx.save(staged).await?;
            let mut concurrent = ada;
            concurrent.age = 40;
            outside.save(concurrent).await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::TransientFailure(_)));
    assert_eq!(scope.state(), ScopeState::TransactionAborted);
    let stored = driver.documents("test.person");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["age"], serde_json::json!(40));
}

#[tokio::test]
async fn test_session_scope_binds_one_session() {
    let driver = InMemoryDriver::new();
    let scope = template(&driver).with_session(SessionSource::default());
    assert_eq!(scope.state(), ScopeState::NoSession);

    scope
        .execute(|bound| async move {
            let saved = bound.save(Person::new("Ada", 36)).await?;
            bound.save(saved).await?;
            Ok(())
        })
        .await
        .unwrap();
    scope
        .execute(|bound| async move { bound.count::<Person>(&Query::all()).await })
        .await
        .unwrap();

    assert_eq!(scope.state(), ScopeState::SessionBound);
    let sessions: HashSet<Option<String>> = driver
        .operations()
        .into_iter()
        .filter(|op| op.kind != OperationKind::StartSession)
        .map(|op| op.session_id)
        .collect();
    assert_eq!(sessions.len(), 1);
    assert!(sessions.iter().all(Option::is_some));
    assert_eq!(driver.count_operations(OperationKind::StartSession), 1);
    // Without a transaction writes are immediately visible
    assert_eq!(driver.documents("test.person")[0]["version"], serde_json::json!(1));
}

#[tokio::test]
async fn test_provided_session_joins_open_transaction() {
    let driver = InMemoryDriver::new();
    let template = template(&driver);
    let outer = template.in_transaction(SessionSource::default());

    outer
        .execute(|tx| async move {
            let session = tx.session().cloned().expect("bound session");
            let inner = tx.in_transaction(session);
            inner
                .execute(|joined| async move { joined.save(Note::new("nested")).await })
                .await?;
            // still staged: the outer scope owns the transaction
            assert_eq!(inner.state(), ScopeState::SessionBound);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(outer.state(), ScopeState::TransactionCommitted);
    assert_eq!(driver.documents("test.note").len(), 1);
    assert_eq!(driver.count_operations(OperationKind::StartTransaction), 1);
    assert_eq!(driver.count_operations(OperationKind::CommitTransaction), 1);
}
