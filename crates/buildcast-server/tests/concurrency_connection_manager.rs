//! Concurrency tests for the WebSocket ConnectionManager.
//!
//! These tests verify that the ConnectionManager handles concurrent
//! connection and session churn without deadlocks or orphaned entries.

use buildcast_server::api_ws::{ConnectionManager, SessionOpen, SessionStatus};
use std::net::SocketAddr;
use std::sync::Arc;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_session_churn_no_orphans() {
    let cm = Arc::new(ConnectionManager::new());
    let mut connections = Vec::new();
    for i in 0..10 {
        connections.push(cm.add_connection(addr(5000 + i)).await);
    }

    let mut handles = Vec::new();
    for i in 0..200 {
        let cm = cm.clone();
        let conn = connections[i % 10];
        let pattern = format!("logs:build-{}", i % 7);

        handles.push(tokio::spawn(async move {
            if let Some(SessionOpen::New(session)) = cm.open_session(conn, &pattern).await {
                cm.set_status(conn, session, SessionStatus::Active).await;
                cm.set_status(conn, session, SessionStatus::Draining).await;
                cm.set_status(conn, session, SessionStatus::Closed).await;
            }
        }));
    }

    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(cm.session_count().await, 0);
    for conn in &connections {
        assert!(cm.patterns(*conn).await.is_empty());
    }
    assert_eq!(cm.connection_count().await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_open_same_pattern_yields_one_session() {
    let cm = Arc::new(ConnectionManager::new());
    let conn = cm.add_connection(addr(6000)).await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let cm = cm.clone();
        handles.push(tokio::spawn(async move {
            cm.open_session(conn, "logs:shared").await
        }));
    }

    let mut new_sessions = 0;
    for handle in handles {
        if let Some(SessionOpen::New(_)) = handle.await.unwrap() {
            new_sessions += 1;
        }
    }
    assert_eq!(new_sessions, 1);
    assert_eq!(cm.session_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_connection_during_session_updates() {
    let cm = Arc::new(ConnectionManager::new());
    let conn = cm.add_connection(addr(7000)).await;

    let mut sessions = Vec::new();
    for i in 0..20 {
        if let Some(SessionOpen::New(id)) = cm.open_session(conn, &format!("logs:{i}")).await {
            sessions.push(id);
        }
    }

    let updater = {
        let cm = cm.clone();
        tokio::spawn(async move {
            for session in sessions {
                cm.set_status(conn, session, SessionStatus::Active).await;
            }
        })
    };
    let remover = {
        let cm = cm.clone();
        tokio::spawn(async move { cm.remove_connection(conn).await })
    };

    updater.await.expect("updater should not panic");
    remover.await.expect("remover should not panic");

    assert_eq!(cm.connection_count().await, 0);
    assert_eq!(cm.session_count().await, 0);
    assert_eq!(cm.open_session(conn, "logs:late").await, None);
}
