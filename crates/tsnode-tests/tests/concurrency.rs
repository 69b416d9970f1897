//! Several processes (simulated with threads holding separate handles) sharing
//! one installation directory.

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tsnode_identity::KnownHosts;
use tsnode_provision::UpRequest;
use tsnode_state::{NodeId, StateStore};
use tsnode_tests::Harness;

const WRITERS: usize = 8;
const PER_WRITER: usize = 12;

#[test]
fn test_concurrent_add_node_loses_no_update() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let store = StateStore::new(path);
                barrier.wait();
                (0..PER_WRITER)
                    .map(|_| {
                        store
                            .add_node(&format!("region-{w}"), "t2.micro", "ami-1")
                            .expect("add")
                            .id
                    })
                    .collect::<Vec<NodeId>>()
            })
        })
        .collect();

    let mut ids = BTreeSet::new();
    for handle in handles {
        for id in handle.join().expect("writer thread") {
            assert!(ids.insert(id), "id {id} handed out twice");
        }
    }

    let total = WRITERS * PER_WRITER;
    let state = StateStore::new(&path).load().expect("load");
    assert_eq!(state.len(), total);
    assert_eq!(usize::from(state.last_id), total);
    let expected: BTreeSet<NodeId> = (0..total as NodeId).collect();
    assert_eq!(ids, expected);
    assert_eq!(state.nodes.keys().copied().collect::<BTreeSet<_>>(), expected);
}

#[test]
fn test_readers_never_see_a_torn_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");

    let writer = {
        let path = path.clone();
        thread::spawn(move || {
            let store = StateStore::new(path);
            for _ in 0..50 {
                store.add_node("eu-west-1", "t2.micro", "ami-1").expect("add");
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || {
                let store = StateStore::new(path);
                let mut last = 0;
                for _ in 0..50 {
                    let state = store.load().expect("load");
                    assert!(state.len() >= last, "snapshot went backwards");
                    assert_eq!(usize::from(state.last_id), state.len());
                    last = state.len();
                }
            })
        })
        .collect();

    writer.join().expect("writer");
    for reader in readers {
        reader.join().expect("reader");
    }
}

#[test]
fn test_concurrent_host_identity_records_stay_intact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("known_hosts");

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let hosts = KnownHosts::new(&path);
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let host = format!("10.0.{w}.{i}");
                    hosts
                        .record(&host, "ssh-ed25519", host.as_bytes())
                        .expect("record");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let content = std::fs::read_to_string(&path).expect("read");
    assert_eq!(content.lines().count(), WRITERS * PER_WRITER);
    assert!(content.lines().all(|l| l.split_whitespace().count() == 3));
    assert_eq!(
        KnownHosts::new(&path).entries_for("10.0.3.7").expect("entries").len(),
        1
    );
}

#[tokio::test]
async fn test_interleaved_ups_get_distinct_records() {
    let h = Harness::new();
    let request = |region: &str| UpRequest {
        region: region.to_string(),
        instance_type: "t2.micro".to_string(),
        image_id: "ami-0jammy".to_string(),
        exit_node: false,
        auth_token: "tskey-auth-test".to_string(),
    };
    let (west, east) = (request("eu-west-1"), request("us-east-1"));

    let (a, b) = tokio::join!(h.lifecycle.up(&west), h.lifecycle.up(&east));
    let (a, b) = (a.expect("west"), b.expect("east"));

    assert_ne!(a.record.id, b.record.id);
    assert_ne!(a.record.name, b.record.name);
    assert_eq!(h.state().load().expect("load").len(), 2);
}
