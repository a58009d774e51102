//! Performance benchmarks for the hot paths of the session server

use server::scheduler::Scheduler;
use server::store::{AttributeStore, MemoryAttributeStore};
use shared::messages::{BattleSync, CombatState, LoginRequest};
use shared::{decode_payload, encode_frame, encode_message, encode_payload, FrameDecoder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Benchmarks frame encoding plus incremental decoding
#[test]
fn benchmark_frame_codec() {
    let payload = vec![0xA5u8; 256];
    let iterations = 100_000;
    let start = Instant::now();

    let mut decoder = FrameDecoder::new();
    for i in 0..iterations {
        let bytes = encode_frame((i % 18 + 1) as u16, &payload).unwrap();
        decoder.extend(&bytes);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.len(), payload.len());
    }

    let duration = start.elapsed();
    println!(
        "Frame codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks decoding a stream of coalesced frames
#[test]
fn benchmark_coalesced_stream_decoding() {
    let frame = encode_message(&LoginRequest {
        uid: 7,
        passwd: "password".to_string(),
    })
    .unwrap();
    let frames = 10_000;
    let stream: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * frames).collect();

    let start = Instant::now();
    let mut decoder = FrameDecoder::new();
    let mut decoded = 0;
    for chunk in stream.chunks(1500) {
        decoder.extend(chunk);
        while let Some(frame) = decoder.next_frame().unwrap() {
            let _: LoginRequest = decode_payload(&frame.payload).unwrap();
            decoded += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Coalesced decoding: {} frames in {:?} ({:.2} μs/frame)",
        decoded,
        duration,
        duration.as_micros() as f64 / decoded as f64
    );

    assert_eq!(decoded, frames);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks battle sync serialization for a full room
#[test]
fn benchmark_battle_sync_serialization() {
    let sync = BattleSync {
        roomid: 1,
        states: (0..16)
            .map(|uid| CombatState {
                uid,
                hp: 100,
                mp: 50,
            })
            .collect(),
        timestamp: 1_700_000_000_000,
    };

    let iterations = 50_000;
    let start = Instant::now();
    for _ in 0..iterations {
        let bytes = encode_payload(&sync).unwrap();
        let back: BattleSync = decode_payload(&bytes).unwrap();
        assert_eq!(back.states.len(), 16);
    }

    let duration = start.elapsed();
    println!(
        "Battle sync serialization: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Stress test: many keyed tasks pushed through the scheduler
#[test]
fn stress_test_scheduler_throughput() {
    let scheduler = Scheduler::new(4).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks = 100_000;

    let start = Instant::now();
    for i in 0..tasks {
        let counter = Arc::clone(&counter);
        scheduler
            .submit(i as u64 % 64, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }
    scheduler.shutdown();
    let duration = start.elapsed();

    println!(
        "Scheduler: {} tasks in {:?} ({:.2} ns/task)",
        tasks,
        duration,
        duration.as_nanos() as f64 / tasks as f64
    );

    assert_eq!(counter.load(Ordering::SeqCst), tasks);
    // Should complete in under 5 seconds
    assert!(duration.as_secs() < 5);
}

/// Benchmarks cached batch lookups against the attribute store
#[test]
fn benchmark_attribute_batch_get() {
    let store = MemoryAttributeStore::new();
    let uids: Vec<u32> = (1..=100).collect();
    for uid in &uids {
        store.load_or_create(*uid).unwrap();
    }

    let iterations = 10_000;
    let start = Instant::now();
    for _ in 0..iterations {
        let found = store.batch_get(&uids);
        assert_eq!(found.len(), uids.len());
    }

    let duration = start.elapsed();
    println!(
        "Attribute batch get: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}
