//! Relational backend tests against live PostgreSQL and MySQL servers.
//!
//! Run with `cargo test --features postgres,mysql,test -- --ignored` and
//! `DATABASE_URL` / `MYSQL_DATABASE_URL` pointing at scratch databases.

#![cfg(any(feature = "postgres", feature = "mysql"))]


use test_utils::contract;

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use crate::test_utils::setup_postgres_queue;
    use queuework::queue::JobTable;

    #[tokio::test]
    #[ignore]
    async fn test_postgres_pops_in_order_and_deletes() {
        let queue = setup_postgres_queue(90).await;
        contract::pops_in_push_order_and_deletes(&queue).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_release_waits_for_delay() {
        let queue = setup_postgres_queue(90).await;
        contract::release_waits_for_delay(&queue).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_abandoned_reservation_expires() {
        let queue = setup_postgres_queue(2).await;
        contract::abandoned_reservation_expires(&queue, 2).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_later_is_hidden_until_due() {
        let queue = setup_postgres_queue(90).await;
        contract::later_is_hidden_until_due(&queue).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_create_table_is_idempotent() {
        let queue = setup_postgres_queue(90).await;
        queue.create_table().await.unwrap();
        assert_eq!(queue.count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_concurrent_pops_never_share_a_job() {
        use queuework::{Payload, Queue};
        use serde_json::json;
        use std::{collections::HashSet, sync::Arc};

        let queue = Arc::new(setup_postgres_queue(90).await);
        for n in 0..20 {
            queue
                .push(&Payload::new("race", json!({ "n": n })), None)
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = queue.pop(None).await.unwrap() {
                    ids.push(job.job_id());
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }
}

#[cfg(feature = "mysql")]
mod mysql {
    use super::*;
    use crate::test_utils::setup_mysql_queue;

    #[tokio::test]
    #[ignore]
    async fn test_mysql_pops_in_order_and_deletes() {
        let queue = setup_mysql_queue(90).await;
        contract::pops_in_push_order_and_deletes(&queue).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_mysql_release_waits_for_delay() {
        let queue = setup_mysql_queue(90).await;
        contract::release_waits_for_delay(&queue).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_mysql_abandoned_reservation_expires() {
        let queue = setup_mysql_queue(2).await;
        contract::abandoned_reservation_expires(&queue, 2).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_mysql_later_is_hidden_until_due() {
        let queue = setup_mysql_queue(90).await;
        contract::later_is_hidden_until_due(&queue).await;
    }
}
