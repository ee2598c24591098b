//! # Command Buffer Playback Tests
//!
//! Verifies deterministic deferred structural changes:
//!
//! 1. **Determinism**: producers recording under keys 3, 1 and 2 in any
//!    real-time interleaving leave the store in the same final state
//! 2. **Jobs**: buffers recorded inside parallel jobs replay after a sync point
//! 3. **Consumption**: single-use buffers reject further recording
//!
//! Run with: cargo test --test command_buffer_playback

use std::sync::Arc;
use std::thread;

use bytemuck::{Pod, Zeroable};
use crossbeam_channel::bounded;
use stratum_core::ecs::Store;
use stratum_core::prelude::*;
use stratum_core::PlaybackPolicy;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Spawned {
    producer: u32,
}

impl Component for Spawned {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Counter {
    value: u32,
}

impl Component for Counter {}

fn store() -> (Store, ComponentTypeId, ComponentTypeId) {
    let mut store = Store::new(StoreConfig::default()).unwrap();
    let spawned = store.register::<Spawned>().unwrap();
    let counter = store.register::<Counter>().unwrap();
    (store, spawned, counter)
}

/// Every live entity in creation-slot order with its recorded producer.
fn snapshot(store: &Store, spawned: ComponentTypeId) -> Vec<(u32, u32, Spawned)> {
    let query = store.build_query(QueryDesc::new().with(spawned)).unwrap();
    let scope = AccessScope::unchecked(store);
    let mut rows = Vec::new();
    for chunk in scope.chunks(query, &ChunkFilter::all()).unwrap() {
        let values = chunk.column::<Spawned>().unwrap();
        for (entity, value) in chunk.entities().iter().zip(values) {
            rows.push((entity.index(), entity.generation(), *value));
        }
    }
    rows.sort_unstable_by_key(|row| (row.0, row.1));
    rows
}

/// Records one producer's work: create a temp entity, then tag it.
fn produce(buffer: &CommandBuffer, key: u64, spawned: ComponentTypeId, counter: ComponentTypeId, shared: Entity) {
    let temp = buffer.create_temp(key, &[spawned]).unwrap();
    buffer
        .set_component(key, temp, spawned, Spawned { producer: key as u32 })
        .unwrap();
    buffer
        .set_component(key, shared, counter, Counter { value: key as u32 })
        .unwrap();
}

// ============================================================================
// DETERMINISM
// ============================================================================

#[test]
fn verify_playback_order_ignores_recording_order() {
    let orders: [[u64; 3]; 3] = [[3, 1, 2], [1, 2, 3], [2, 3, 1]];
    let mut results = Vec::new();

    for order in orders {
        let (mut store, spawned, counter) = store();
        let shared = store.create_entity(&[counter]).unwrap();
        let buffer = CommandBuffer::new();
        for key in order {
            produce(&buffer, key, spawned, counter, shared);
        }
        buffer.playback(&mut store).unwrap();
        results.push((snapshot(&store, spawned), store.get::<Counter>(shared).unwrap()));
    }

    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    let (rows, last) = &results[0];
    let producers: Vec<u32> = rows.iter().map(|row| row.2.producer).collect();
    assert_eq!(producers, vec![1, 2, 3]);
    assert_eq!(*last, Counter { value: 3 });
}

#[test]
fn verify_concurrent_producers_are_deterministic() {
    let mut baseline = None;

    // Each round releases the producers in a different order.
    for release in [[0usize, 1, 2], [2, 1, 0], [1, 0, 2], [2, 0, 1]] {
        let (mut store, spawned, counter) = store();
        let shared = store.create_entity(&[counter]).unwrap();
        let buffer = Arc::new(CommandBuffer::new());
        let keys = [3u64, 1, 2];

        let mut gates = Vec::new();
        let mut done = Vec::new();
        let producers: Vec<_> = keys
            .iter()
            .map(|&key| {
                let (gate_tx, gate_rx) = bounded::<()>(0);
                let (done_tx, done_rx) = bounded::<()>(1);
                gates.push(gate_tx);
                done.push(done_rx);
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    gate_rx.recv().unwrap();
                    produce(&buffer, key, spawned, counter, shared);
                    done_tx.send(()).unwrap();
                })
            })
            .collect();

        for index in release {
            gates[index].send(()).unwrap();
            done[index].recv().unwrap();
        }
        for producer in producers {
            producer.join().unwrap();
        }

        buffer.playback(&mut store).unwrap();
        let state = (snapshot(&store, spawned), store.get::<Counter>(shared).unwrap());
        match &baseline {
            None => baseline = Some(state),
            Some(expected) => assert_eq!(&state, expected),
        }
    }
}

// ============================================================================
// JOBS
// ============================================================================

#[test]
fn verify_jobs_record_into_shared_buffer() {
    let mut world = World::new(StoreConfig::default().with_worker_threads(3)).unwrap();
    let spawned = world.register::<Spawned>().unwrap();
    let counter = world.register::<Counter>().unwrap();
    let shared = world.create_entity(&[counter]).unwrap();
    let buffer = Arc::new(CommandBuffer::new());

    for key in [3u64, 1, 2] {
        let buffer = Arc::clone(&buffer);
        world.schedule(AccessSet::new(), move |_| produce(&buffer, key, spawned, counter, shared));
    }
    world.complete_all().unwrap();

    let stats = buffer.playback(&mut world).unwrap();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.applied, 9);
    assert_eq!(world.entity_count(), 4);
    assert_eq!(world.get::<Counter>(shared).unwrap(), Counter { value: 3 });
}

// ============================================================================
// CONSUMPTION
// ============================================================================

#[test]
fn verify_consumed_buffer_rejects_recording() {
    let (mut store, spawned, counter) = store();
    let shared = store.create_entity(&[counter]).unwrap();
    let buffer = CommandBuffer::new();
    produce(&buffer, 0, spawned, counter, shared);
    buffer.playback(&mut store).unwrap();

    assert_eq!(
        buffer.create_temp(1, &[spawned]),
        Err(StoreError::BufferAlreadyPlayedBack)
    );
    assert_eq!(buffer.destroy(1, shared), Err(StoreError::BufferAlreadyPlayedBack));
    assert_eq!(store.entity_count(), 2);
}

#[test]
fn verify_multi_playback_buffer_replays_every_time() {
    let (mut store, spawned, counter) = store();
    let shared = store.create_entity(&[counter]).unwrap();
    let buffer = CommandBuffer::with_policy(PlaybackPolicy::Multi);
    produce(&buffer, 0, spawned, counter, shared);

    for round in 1..=3 {
        buffer.playback(&mut store).unwrap();
        assert_eq!(store.entity_count(), 1 + round);
    }
    assert_eq!(buffer.len(), 3);
}

#[test]
fn verify_failed_entry_keeps_earlier_entries() {
    let (mut store, spawned, counter) = store();
    let shared = store.create_entity(&[counter]).unwrap();
    let buffer = CommandBuffer::new();
    buffer.create_temp(1, &[spawned]).unwrap();
    buffer.set_component(2, shared, spawned, Spawned { producer: 2 }).unwrap();
    buffer.create_temp(3, &[spawned]).unwrap();

    assert_eq!(
        buffer.playback(&mut store),
        Err(StoreError::ComponentMissing {
            entity: shared,
            type_id: spawned,
        })
    );
    assert_eq!(store.entity_count(), 2);
}
