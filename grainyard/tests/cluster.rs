//! Multi-silo end-to-end behavior: activation, routing, churn.

mod support;

use grainyard::error::CallError;
use grainyard::grain::DeactivationReason;
use grainyard::messaging::RejectionKind;
use grainyard::prelude::*;
use std::time::Duration;
use support::{counter_methods, run_local, Counter, Flaky, Ghost, TestCluster};

fn register(builder: grainyard::runtime::SiloBuilder) -> grainyard::runtime::SiloBuilder {
    builder
        .register_grain::<Counter>()
        .register_grain::<Flaky>()
}

#[test]
fn test_first_call_activates_once_and_second_call_hits_cache() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(3, 5100, register).await;
        let thermostat = cluster.silos[0].grain_ref::<Counter>("roomA");

        let reading: i64 = thermostat.call(counter_methods::ADD, &22i64).await.unwrap();
        assert_eq!(reading, 22);
        assert_eq!(support::activation_count(), 1);

        let id_before: String = thermostat.call(counter_methods::WHOAMI, &()).await.unwrap();

        // Second call routes via the cached resolution to the same
        // activation; no new activation appears anywhere.
        let reading: i64 = thermostat.call(counter_methods::ADD, &1i64).await.unwrap();
        assert_eq!(reading, 23);
        let id_after: String = thermostat.call(counter_methods::WHOAMI, &()).await.unwrap();
        assert_eq!(id_before, id_after);
        assert_eq!(support::activation_count(), 1);

        let grain = GrainId::from_parts("default", "Counter", "roomA").unwrap();
        assert_eq!(cluster.activation_records(&grain), 1);
    });
}

#[test]
fn test_stale_cache_recovers_with_fresh_activation() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(3, 5110, register).await;
        let caller = cluster.silos[2].grain_ref::<Counter>("thermo");

        let id_before: String = caller.call(counter_methods::WHOAMI, &()).await.unwrap();
        let grain = GrainId::from_parts("default", "Counter", "thermo").unwrap();

        // A second call resolves through the owner's directory and leaves
        // a cached address on the caller silo.
        let _: String = caller.call(counter_methods::WHOAMI, &()).await.unwrap();
        assert!(cluster.silos[2].directory().lookup_cached(&grain).is_some());

        // The host deactivates the grain; the cache on the caller stays
        // stale.
        let host = cluster.host_of(&grain).expect("grain is hosted somewhere");
        assert!(host
            .catalog()
            .deactivate(&grain, DeactivationReason::ExplicitRequest));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cluster.host_of(&grain).is_none());

        // The next call takes at most one nonexistent-activation round
        // trip, evicts the entry, and lands on a fresh activation.
        let id_after: String = caller.call(counter_methods::WHOAMI, &()).await.unwrap();
        assert_ne!(id_before, id_after);
        assert_eq!(cluster.activation_records(&grain), 1);
    });
}

#[test]
fn test_single_activation_race_has_one_winner() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(3, 5120, register).await;

        let from_a = cluster.silos[0].grain_ref::<Counter>("contested");
        let from_b = cluster.silos[1].grain_ref::<Counter>("contested");

        let (id_a, id_b) = futures::join!(
            from_a.call::<_, String>(counter_methods::WHOAMI, &()),
            from_b.call::<_, String>(counter_methods::WHOAMI, &()),
        );
        let id_a = id_a.unwrap();
        let id_b = id_b.unwrap();

        // Both callers observe the same winning activation, user code ran
        // exactly once, and only one record exists cluster-wide.
        assert_eq!(id_a, id_b);
        assert_eq!(support::activation_count(), 1);
        let grain = GrainId::from_parts("default", "Counter", "contested").unwrap();
        assert_eq!(cluster.activation_records(&grain), 1);
    });
}

#[test]
fn test_directory_consistency_at_rest() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(3, 5130, register).await;

        let keys: Vec<String> = (0..20).map(|i| format!("grain-{i}")).collect();
        for key in &keys {
            let reference = cluster.silos[0].grain_ref::<Counter>(key.clone());
            let _: i64 = reference.call(counter_methods::ADD, &1i64).await.unwrap();
        }

        for key in &keys {
            let grain = GrainId::from_parts("default", "Counter", key.as_str()).unwrap();

            // Exactly one Valid activation cluster-wide.
            assert_eq!(cluster.activation_records(&grain), 1, "{key}");
            let host = cluster.host_of(&grain).expect("hosted");

            // The hash owner's partition holds exactly that activation.
            let owner = cluster.silos[0]
                .directory()
                .owner_of(&grain)
                .expect("owner exists");
            let owner_silo = cluster
                .silos
                .iter()
                .find(|silo| silo.address() == &owner)
                .expect("owner is in the cluster");
            let entry: Vec<_> = owner_silo
                .directory()
                .partition_items()
                .into_iter()
                .filter(|address| address.grain == grain)
                .collect();
            assert_eq!(entry.len(), 1, "{key}");
            assert_eq!(&entry[0].silo, host.address(), "{key}");
        }
    });
}

#[test]
fn test_graceful_shutdown_reactivates_elsewhere() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(3, 5140, register).await;

        let keys: Vec<String> = (0..10).map(|i| format!("grain-{i}")).collect();
        let mut before = Vec::new();
        for key in &keys {
            let reference = cluster.silos[0].grain_ref::<Counter>(key.clone());
            let id: String = reference.call(counter_methods::WHOAMI, &()).await.unwrap();
            let grain = GrainId::from_parts("default", "Counter", key.as_str()).unwrap();
            let host = cluster.host_of(&grain).expect("hosted").address().clone();
            before.push((grain, id, host));
        }

        let leaving = cluster.silos[1].clone();
        leaving.shutdown().await.unwrap();
        cluster.network.detach(leaving.address());
        tokio::time::sleep(Duration::from_millis(50)).await;

        for (grain, id_before, host_before) in &before {
            let reference = cluster.silos[2].grain_ref::<Counter>(grain.key.clone());
            let id_after: String = reference.call(counter_methods::WHOAMI, &()).await.unwrap();
            if host_before == leaving.address() {
                assert_ne!(&id_after, id_before, "{grain}: reactivated elsewhere");
            } else {
                assert_eq!(&id_after, id_before, "{grain}: undisturbed");
            }
            // Never on the departed silo, never duplicated.
            assert_eq!(cluster.activation_records(grain), 1);
            let host = cluster.host_of(grain).expect("hosted");
            assert_ne!(host.address(), leaving.address());
        }
    });
}

#[test]
fn test_application_error_is_a_failed_call() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(2, 5150, register).await;
        let counter = cluster.silos[0].grain_ref::<Counter>("failing");

        let result: Result<i64, _> = counter.call(counter_methods::FAIL, &()).await;
        match result {
            Err(CallError::Application(message)) => {
                assert!(message.contains("deliberate failure"));
            }
            other => panic!("expected application error, got {other:?}"),
        }

        // The activation survives an application error.
        let value: i64 = counter.call(counter_methods::ADD, &5i64).await.unwrap();
        assert_eq!(value, 5);
    });
}

#[test]
fn test_unknown_grain_kind_is_unrecoverable() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(2, 5160, register).await;
        let ghost = cluster.silos[0].grain_ref::<Ghost>("nobody");

        let result: Result<i64, _> = ghost.call(1, &()).await;
        match result {
            Err(CallError::RemoteRejection {
                kind: RejectionKind::Unrecoverable,
                reason,
            }) => assert!(reason.contains("unknown grain kind")),
            other => panic!("expected unrecoverable rejection, got {other:?}"),
        }
    });
}

#[test]
fn test_failed_activation_surfaces_and_tears_down() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(2, 5170, register).await;
        let flaky = cluster.silos[0].grain_ref::<Flaky>("wont-start");

        let result: Result<i64, _> = flaky.call(1, &()).await;
        assert!(result.is_err(), "activation failure must fail the call");

        // The reserved slot is gone and the directory holds no entry.
        let grain = GrainId::from_parts("default", "Flaky", "wont-start").unwrap();
        assert_eq!(cluster.activation_records(&grain), 0);
        for silo in &cluster.silos {
            assert!(!silo
                .directory()
                .partition_items()
                .iter()
                .any(|address| address.grain == grain));
        }
    });
}

#[test]
fn test_idle_collection_reactivates_on_next_call() {
    run_local(async {
        support::reset_probes();
        let mut config = support::test_config();
        config
            .collection_age_per_kind
            .insert("Counter".to_string(), Duration::from_millis(40));

        let membership = SharedMembership::new();
        let network = InProcessNetwork::new();
        let silo = grainyard::runtime::SiloBuilder::new(support::silo_address(5180))
            .config(config)
            .membership(membership)
            .network(network)
            .register_grain::<Counter>()
            .build()
            .unwrap();
        silo.start().await.unwrap();

        let counter = silo.grain_ref::<Counter>("ephemeral");
        let id_before: String = counter.call(counter_methods::WHOAMI, &()).await.unwrap();
        let grain = GrainId::from_parts("default", "Counter", "ephemeral").unwrap();
        assert!(silo.catalog().get(&grain).is_some());

        // Idle past the age limit: the sweep collects it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(silo.catalog().get(&grain).is_none(), "collected while idle");

        // The next call activates a fresh incarnation.
        let id_after: String = counter.call(counter_methods::WHOAMI, &()).await.unwrap();
        assert_ne!(id_before, id_after);
    });
}

#[test]
fn test_monotone_membership_versions_under_churn() {
    run_local(async {
        support::reset_probes();
        let cluster = TestCluster::start(3, 5190, register).await;

        let mut receiver = cluster.membership.subscribe();
        let mut observed = vec![receiver.borrow().version];

        cluster.silos[1].shutdown().await.unwrap();
        while receiver.changed().await.is_ok() {
            observed.push(receiver.borrow().version);
            if cluster
                .membership
                .current()
                .status_of(cluster.silos[1].address())
                == Some(SiloStatus::Dead)
            {
                break;
            }
        }

        for pair in observed.windows(2) {
            assert!(pair[0] <= pair[1], "versions never regress: {observed:?}");
        }
    });
}
