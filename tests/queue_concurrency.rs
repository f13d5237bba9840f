mod common;

use common::fast_queue;
use guildforge::{DeployError, ErrorCode, Operation, OperationBudget, OperationKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

fn budget() -> OperationBudget {
    OperationBudget::within(Duration::from_secs(5), 3)
}

#[tokio::test]
async fn duplicate_keys_share_one_execution() {
    let queue = fast_queue(3);
    let calls = Arc::new(AtomicUsize::new(0));

    let op = |calls: Arc<AtomicUsize>| {
        Operation::new("g1", OperationKind::RoleEnsure, "tenant:g1/deploy:abc/RoleEnsure/R1/fp", budget(), move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, DeployError>("role-9".to_string())
            }
        })
    };

    let (a, b, c) = tokio::join!(
        queue.submit(op(calls.clone())),
        queue.submit(op(calls.clone())),
        queue.submit(op(calls.clone())),
    );
    assert_eq!(a.unwrap(), "role-9");
    assert_eq!(b.unwrap(), "role-9");
    assert_eq!(c.unwrap(), "role-9");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.in_flight_count(), 0);

    // Settled keys run again.
    queue.submit(op(calls.clone())).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn joined_callers_observe_the_same_failure() {
    let queue = fast_queue(1);
    let op = || {
        Operation::new("g1", OperationKind::ChannelEnsure, "same-key", budget(), || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<String, _>(DeployError::forbidden("Missing Permissions"))
        })
    };
    let (a, b) = tokio::join!(queue.submit(op()), queue.submit(op()));
    assert_eq!(a.unwrap_err().code, ErrorCode::Forbidden);
    assert_eq!(b.unwrap_err().code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn one_tenant_runs_in_submission_order() {
    let queue = fast_queue(4);
    let order = Arc::new(Mutex::new(Vec::new()));

    let submissions = (0..6).map(|i| {
        let order = order.clone();
        queue.submit(Operation::new("g1", OperationKind::Read, format!("op-{i}"), budget(), move || {
            let order = order.clone();
            async move {
                // Later operations finish faster; order must still hold.
                tokio::time::sleep(Duration::from_millis(12 - 2 * i as u64)).await;
                order.lock().unwrap().push(i);
                Ok::<_, DeployError>(i)
            }
        }))
    });
    let results = futures::future::join_all(submissions).await;

    assert_eq!(results.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn global_cap_bounds_concurrency_across_tenants() {
    let queue = fast_queue(2);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let submissions = (0..6).map(|i| {
        let (running, peak) = (running.clone(), peak.clone());
        queue.submit(Operation::new(format!("g{i}"), OperationKind::Read, format!("g{i}/read"), budget(), move || {
            let (running, peak) = (running.clone(), peak.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, DeployError>(())
            }
        }))
    });
    for result in futures::future::join_all(submissions).await {
        result.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(queue.executing(), 0);
}

#[tokio::test]
async fn a_blocked_tenant_does_not_stall_others() {
    let queue = fast_queue(2);
    let release = Arc::new(Notify::new());

    let blocked = {
        let release = release.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .submit(Operation::new("slow", OperationKind::Read, "slow/read", budget(), move || {
                    let release = release.clone();
                    async move {
                        release.notified().await;
                        Ok::<_, DeployError>("slow")
                    }
                }))
                .await
        })
    };

    let fast = queue
        .submit(Operation::new("fast", OperationKind::Read, "fast/read", budget(), || async {
            Ok::<_, DeployError>("fast")
        }))
        .await
        .unwrap();
    assert_eq!(fast, "fast");
    assert!(!blocked.is_finished());

    release.notify_one();
    assert_eq!(blocked.await.unwrap().unwrap(), "slow");
}

#[tokio::test]
async fn shutdown_rejects_new_work() {
    let queue = fast_queue(1);
    queue.shutdown();
    let result = queue
        .submit(Operation::new("g1", OperationKind::Read, "after-shutdown", budget(), || async {
            Ok::<_, DeployError>(())
        }))
        .await;
    assert!(result.is_err());
}
