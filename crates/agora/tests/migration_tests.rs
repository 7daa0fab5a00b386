//! Migration protocol end to end: state transfer, queued-request handoff,
//! atomic abort, forwarding shims, and epoch monotonicity.

mod common;

use agora::{
    CallMode, DispatchError, MigrationOutcome, Node, NodeConfig, NodeAddress, RequestEnvelope,
    RuntimeEvent, Transport, WireMessage,
};
use common::{open_gate, recorded, test_fabric, wait_until};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[test_log::test(tokio::test)]
async fn migration_preserves_state_and_existing_handles() {
    let fabric = test_fabric();
    let node_a = Node::join("a", NodeConfig::default(), fabric.clone());
    let _node_b = Node::join("b", NodeConfig::default(), fabric.clone());
    let mut events = node_a.subscribe_events();

    let counter = node_a
        .create("counter", &serde_json::json!({ "value": 0 }))
        .unwrap();
    assert_eq!(counter.call::<_, i64>("add", &5i64).await.unwrap(), 5);

    let ticket = node_a.migrate(counter.id(), &"b".into()).await.unwrap();
    assert!(ticket.succeeded());
    assert_eq!(ticket.source, "a".into());
    assert_eq!(ticket.destination, "b".into());

    // Identity, state, and the old surrogate all survive the move.
    let record = fabric.directory().lookup(counter.id()).unwrap();
    assert_eq!(record.address, "b".into());
    assert_eq!(record.epoch, 1);
    assert_eq!(counter.call::<_, i64>("add", &3i64).await.unwrap(), 8);

    let mut saw_started = false;
    let mut saw_completed = false;
    while !(saw_started && saw_completed) {
        match events.recv().await.unwrap().event {
            RuntimeEvent::MigrationStarted { id, .. } if id == counter.id() => saw_started = true,
            RuntimeEvent::MigrationCompleted { ticket } if ticket.id == counter.id() => {
                saw_completed = true
            }
            _ => {}
        }
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn queued_requests_execute_exactly_once_in_order_at_the_destination() {
    let fabric = test_fabric();
    let node_a = Node::join("a", NodeConfig::default(), fabric.clone());
    let _node_b = Node::join("b", NodeConfig::default(), fabric.clone());

    let recorder = node_a
        .create("recorder", &serde_json::json!({ "probe": "mid-queue" }))
        .unwrap();

    // Hold the body mid-call and stack requests up behind it.
    let gated = recorder.invoke("gated_record", &"a").unwrap();
    wait_until("gated call to start", || {
        recorded("mid-queue").contains(&"begin:a".to_string())
    })
    .await;
    let queued: Vec<_> = ["b", "c", "d"]
        .iter()
        .map(|v| recorder.invoke("record", v).unwrap())
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Migrate while the gated call is in flight; the coordinator must wait
    // it out before snapshotting. The gate opens from a side task once the
    // cutover is underway.
    let opener = tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        open_gate("mid-queue");
    });
    let ticket = node_a.migrate(recorder.id(), &"b".into()).await.unwrap();
    opener.await.unwrap();
    assert_eq!(ticket.outcome, MigrationOutcome::Completed);
    assert_eq!(ticket.pending_at_cutover, 3);

    gated.await_bytes().await.unwrap();
    for future in &queued {
        future.await_bytes().await.unwrap();
    }
    assert_eq!(
        recorded("mid-queue"),
        vec!["begin:a", "a", "b", "c", "d"]
    );
    assert_eq!(fabric.directory().lookup(recorder.id()).unwrap().epoch, 1);

    // New calls keep flowing to the new host through the old handle.
    recorder.invoke("record", &"e").unwrap().await_bytes().await.unwrap();
    assert_eq!(recorded("mid-queue").last().unwrap(), "e");
}

#[test_log::test(tokio::test)]
async fn failed_migration_aborts_atomically() {
    let fabric = test_fabric();
    let node_a = Node::join("a", NodeConfig::default(), fabric.clone());
    let mut events = node_a.subscribe_events();

    let counter = node_a
        .create("counter", &serde_json::json!({ "value": 7 }))
        .unwrap();

    // No node is bound at this address, so the transfer send fails.
    let ticket = node_a
        .migrate(counter.id(), &"nowhere".into())
        .await
        .unwrap();
    assert!(matches!(ticket.outcome, MigrationOutcome::Failed { .. }));

    // Source resumed unchanged: same address, same epoch, state intact.
    let record = fabric.directory().lookup(counter.id()).unwrap();
    assert_eq!(record.address, "a".into());
    assert_eq!(record.epoch, 0);
    assert_eq!(counter.call::<_, i64>("add", &1i64).await.unwrap(), 8);

    loop {
        if let RuntimeEvent::MigrationFailed { ticket } = events.recv().await.unwrap().event {
            assert_eq!(ticket.id, counter.id());
            break;
        }
    }
}

#[test_log::test(tokio::test)]
async fn stale_requests_forward_during_the_grace_period() {
    let fabric = test_fabric();
    let node_a = Node::join("a", NodeConfig::default(), fabric.clone());
    let _node_b = Node::join("b", NodeConfig::default(), fabric.clone());

    let recorder = node_a
        .create("recorder", &serde_json::json!({ "probe": "forward" }))
        .unwrap();
    node_a.migrate(recorder.id(), &"b".into()).await.unwrap();

    // A request sent to the old address with the old epoch, as a caller
    // with a stale cached record would.
    let stale = WireMessage::Request {
        target: recorder.id(),
        epoch: 0,
        envelope: RequestEnvelope::new(
            "record",
            serde_json::to_vec("straggler").unwrap(),
            None,
            0,
            CallMode::OneWay,
        ),
    };
    fabric.transport().send(&"a".into(), stale).unwrap();

    wait_until("straggler to be forwarded and served", || {
        recorded("forward") == vec!["straggler".to_string()]
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn stale_requests_fail_after_the_grace_period_expires() {
    let fabric = test_fabric();
    let config = NodeConfig {
        forwarding_grace_ms: 0,
        ..NodeConfig::default()
    };
    let node_a = Node::join("a", config, fabric.clone());
    let _node_b = Node::join("b", NodeConfig::default(), fabric.clone());

    let recorder = node_a
        .create("recorder", &serde_json::json!({ "probe": "expired" }))
        .unwrap();
    node_a.migrate(recorder.id(), &"b".into()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stale = WireMessage::Request {
        target: recorder.id(),
        epoch: 0,
        envelope: RequestEnvelope::new(
            "record",
            serde_json::to_vec("too-late").unwrap(),
            None,
            0,
            CallMode::OneWay,
        ),
    };
    fabric.transport().send(&"a".into(), stale).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorded("expired").is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn migration_refused_by_termination_leaves_one_service_loop() {
    let fabric = test_fabric();
    let node_a = Node::join("a", NodeConfig::default(), fabric.clone());
    let _node_b = Node::join("b", NodeConfig::default(), fabric.clone());
    let mut events = node_a.subscribe_events();

    let recorder = node_a
        .create("recorder", &serde_json::json!({ "probe": "drain-race" }))
        .unwrap();

    let gated = recorder.invoke("gated_record", &"a").unwrap();
    wait_until("gated call to start", || {
        recorded("drain-race").contains(&"begin:a".to_string())
    })
    .await;
    let queued = recorder.invoke("record", &"b").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The queue is draining toward termination, so the cutover is refused
    // and the still-running service loop must be left alone.
    node_a.terminate(recorder.id(), false).await.unwrap();
    let ticket = node_a.migrate(recorder.id(), &"b".into()).await.unwrap();
    assert!(matches!(ticket.outcome, MigrationOutcome::Failed { .. }));

    open_gate("drain-race");
    gated.await_bytes().await.unwrap();
    queued.await_bytes().await.unwrap();
    // A duplicate loop would race the drain and could reorder it.
    assert_eq!(recorded("drain-race"), vec!["begin:a", "a", "b"]);

    loop {
        let event = events.recv().await.unwrap();
        if matches!(event.event, RuntimeEvent::BodyTerminated { id } if id == recorder.id()) {
            break;
        }
    }
    // One loop, one exit: no second termination event may follow.
    let second = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match events.recv().await {
                Some(event) => {
                    if matches!(
                        event.event,
                        RuntimeEvent::BodyTerminated { id } if id == recorder.id()
                    ) {
                        return;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(second.is_err(), "body terminated twice");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn termination_during_a_cutover_follows_the_object() {
    let fabric = test_fabric();
    let node_a = Node::join("a", NodeConfig::default(), fabric.clone());
    let _node_b = Node::join("b", NodeConfig::default(), fabric.clone());

    let recorder = node_a
        .create("recorder", &serde_json::json!({ "probe": "term-follow" }))
        .unwrap();

    // Hold the body mid-call so the cutover stays open while the
    // termination arrives.
    let gated = recorder.invoke("gated_record", &"a").unwrap();
    wait_until("gated call to start", || {
        recorded("term-follow").contains(&"begin:a".to_string())
    })
    .await;

    let opener = tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        open_gate("term-follow");
    });
    let dest: NodeAddress = "b".into();
    let (ticket, termination) = tokio::join!(
        node_a.migrate(recorder.id(), &dest),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            node_a.terminate(recorder.id(), false).await
        }
    );
    opener.await.unwrap();

    // The migration wins the race and commits; the termination is retried
    // behind it and lands at the destination instead of being lost.
    assert_eq!(ticket.unwrap().outcome, MigrationOutcome::Completed);
    termination.unwrap();
    gated.await_bytes().await.unwrap();
    assert!(recorded("term-follow").contains(&"a".to_string()));

    wait_until("migrated body to finish terminating", || {
        fabric.directory().lookup(recorder.id()).is_none()
    })
    .await;
    assert!(recorder.invoke("record", &"late").is_err());
}

#[test_log::test(tokio::test)]
async fn migrate_requires_the_owning_node() {
    let fabric = test_fabric();
    let node_a = Node::join("a", NodeConfig::default(), fabric.clone());
    let node_b = Node::join("b", NodeConfig::default(), fabric.clone());

    let counter = node_a
        .create("counter", &serde_json::json!({ "value": 0 }))
        .unwrap();

    let err = node_b
        .migrate(counter.id(), &"a".into())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotLocal { .. }));

    let err = node_a
        .migrate(counter.id(), &"a".into())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::MigrationFailed { .. }));
}

#[test_log::test(tokio::test)]
async fn epochs_increase_across_repeated_migrations() {
    let fabric = test_fabric();
    let node_a = Node::join("a", NodeConfig::default(), fabric.clone());
    let node_b = Node::join("b", NodeConfig::default(), fabric.clone());

    let counter = node_a
        .create("counter", &serde_json::json!({ "value": 1 }))
        .unwrap();

    node_a.migrate(counter.id(), &"b".into()).await.unwrap();
    assert_eq!(fabric.directory().lookup(counter.id()).unwrap().epoch, 1);

    node_b.migrate(counter.id(), &"a".into()).await.unwrap();
    let record = fabric.directory().lookup(counter.id()).unwrap();
    assert_eq!(record.epoch, 2);
    assert_eq!(record.address, "a".into());

    assert_eq!(counter.call::<_, i64>("add", &1i64).await.unwrap(), 2);
}
