//! End-to-end facade scenarios: allocation round trips, JSON surfaces,
//! sink delivery, and reports.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arenascope::{layout_of, Arena, ArenaConfig, CollectingSink};

fn single_shard(arena_size: usize) -> Arena {
    Arena::create(ArenaConfig {
        arena_size,
        shard_count: 1,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn allocation_survives_round_trip() {
    let arena = single_shard(64 * 1024);
    let p = arena.alloc_raw(256, 16, "payload") as *mut u8;
    assert!(!p.is_null());
    unsafe {
        for i in 0..256 {
            p.add(i).write(i as u8);
        }
        for i in 0..256 {
            assert_eq!(p.add(i).read(), i as u8);
        }
    }
    arena.dealloc_raw(p, 256);
    assert_eq!(arena.bytes_allocated(), 0);
    assert_eq!(arena.active_block_count(), 0);
}

#[test]
fn oversized_request_returns_null() {
    let arena = single_shard(4096);
    assert!(arena.alloc_raw(1 << 20, 16, "too-big").is_null());
    assert_eq!(arena.bytes_allocated(), 0);
}

#[test]
fn exhaustion_recovers_after_release() {
    let arena = single_shard(16 * 1024);
    let mut live = Vec::new();
    loop {
        let p = arena.alloc_raw(512, 16, "fill");
        if p.is_null() {
            break;
        }
        live.push(p);
    }
    assert!(!live.is_empty());
    assert!(arena.alloc_raw(512, 16, "over").is_null());
    for p in live {
        arena.dealloc_raw(p, 512);
    }
    assert_eq!(arena.bytes_allocated(), 0);
    assert!(!arena.alloc_raw(512, 16, "again").is_null());
}

#[test]
fn snapshot_reports_live_blocks() {
    let arena = single_shard(64 * 1024);
    let a = arena.alloc_raw(100, 16, "first");
    let b = arena.alloc_raw(300, 32, "second");
    assert!(!a.is_null() && !b.is_null());

    let v: serde_json::Value = serde_json::from_str(&arena.snapshot_json()).unwrap();
    assert_eq!(v["type"], "snapshot");
    assert_eq!(v["capacity"], 64 * 1024);
    assert_eq!(v["total_allocated"], arena.bytes_allocated());
    assert_eq!(v["total_free"], arena.bytes_free());
    let blocks = v["blocks"].as_array().unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0]["size"], 100);
    assert_eq!(blocks[0]["alignment"], 16);
    assert_eq!(blocks[0]["tag"], "first");
    assert_eq!(blocks[1]["size"], 300);
    assert_eq!(blocks[1]["tag"], "second");
    assert!(blocks[0]["offset"].as_u64() < blocks[1]["offset"].as_u64());
    assert!(blocks[0]["actual_size"].as_u64().unwrap() >= 100);
    assert!(blocks[0]["timestamp_us"].is_u64());

    arena.dealloc_raw(a, 100);
    arena.dealloc_raw(b, 300);
    let v: serde_json::Value = serde_json::from_str(&arena.snapshot_json()).unwrap();
    assert_eq!(v["total_allocated"], 0);
    assert!(v["blocks"].as_array().unwrap().is_empty());
}

#[test]
fn snapshot_is_deterministic_without_mutation() {
    let arena = single_shard(64 * 1024);
    let _a = arena.alloc_raw(128, 16, "steady");
    let _b = arena.alloc_raw(64, 16, "state");
    let first = arena.snapshot_json();
    let second = arena.snapshot_json();
    assert_eq!(first, second);
}

#[test]
fn tag_is_truncated_and_sanitized() {
    let arena = single_shard(64 * 1024);
    let long = "y".repeat(80);
    let p = arena.alloc_raw(64, 16, &long);
    assert!(!p.is_null());
    let v: serde_json::Value = serde_json::from_str(&arena.snapshot_json()).unwrap();
    let tag = v["blocks"][0]["tag"].as_str().unwrap();
    assert_eq!(tag.len(), 31);
    assert!(tag.chars().all(|c| c == 'y'));
    arena.dealloc_raw(p, 64);
}

#[test]
fn sink_receives_allocation_events() {
    let sink = Arc::new(CollectingSink::new());
    let arena = Arena::create(ArenaConfig {
        arena_size: 64 * 1024,
        shard_count: 1,
        enable_sink: true,
        sink: Some(sink.clone()),
        ..Default::default()
    })
    .unwrap();

    let p = arena.alloc_raw(128, 16, "streamed");
    arena.dealloc_raw(p, 128);

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut events: Vec<serde_json::Value> = Vec::new();
    while events.len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(8));
        events = sink
            .payloads()
            .iter()
            .flat_map(|payload| {
                serde_json::from_str::<serde_json::Value>(payload)
                    .unwrap()
                    .as_array()
                    .unwrap()
                    .clone()
            })
            .collect();
    }
    assert!(events.len() >= 2, "expected both events to be broadcast");
    assert_eq!(events[0]["type"], "allocate");
    assert_eq!(events[0]["tag"], "streamed");
    assert_eq!(events[0]["size"], 128);
    assert!(events[0]["total_allocated"].as_u64().unwrap() > 0);
    assert_eq!(events[1]["type"], "deallocate");
    assert_eq!(events[1]["total_allocated"], 0);
    assert!(events[1]["event_id"].as_u64() > events[0]["event_id"].as_u64());
}

#[test]
fn snapshot_provider_answers_new_subscribers() {
    let sink = Arc::new(CollectingSink::new());
    let arena = Arena::create(ArenaConfig {
        arena_size: 64 * 1024,
        shard_count: 1,
        enable_sink: true,
        sink: Some(sink.clone()),
        ..Default::default()
    })
    .unwrap();
    let _p = arena.alloc_raw(64, 16, "attach");
    let snapshot = sink.request_snapshot().unwrap();
    let v: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(v["type"], "snapshot");
    assert_eq!(v["blocks"].as_array().unwrap().len(), 1);
}

#[test]
fn command_handler_is_forwarded_to_the_sink() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let sink = Arc::new(CollectingSink::new());
    let arena = Arena::create(ArenaConfig {
        arena_size: 64 * 1024,
        shard_count: 1,
        enable_sink: true,
        sink: Some(sink.clone()),
        ..Default::default()
    })
    .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&hits);
    arena.set_command_handler(Box::new(move |_| {
        observed.fetch_add(1, Ordering::Relaxed);
    }));
    sink.deliver_command("reset");
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn event_log_is_available_without_a_sink() {
    let arena = single_shard(64 * 1024);
    let p = arena.alloc_raw(64, 16, "logged");
    arena.dealloc_raw(p, 64);
    let log: serde_json::Value = serde_json::from_str(&arena.event_log_json()).unwrap();
    let events = log.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["type"], "allocate");
    assert_eq!(events[0]["tag"], "logged");
    assert_eq!(events[1]["type"], "deallocate");
}

#[test]
fn sampling_thins_the_event_stream() {
    let arena = Arena::create(ArenaConfig {
        arena_size: 64 * 1024,
        shard_count: 1,
        sampling: 4,
        ..Default::default()
    })
    .unwrap();
    let mut live = Vec::new();
    for _ in 0..16 {
        live.push(arena.alloc_raw(64, 16, "sampled"));
    }
    let log: serde_json::Value = serde_json::from_str(&arena.event_log_json()).unwrap();
    assert_eq!(log.as_array().unwrap().len(), 4);
    // Counters stayed exact even though events were thinned.
    assert_eq!(arena.active_block_count(), 16);
    for p in live {
        arena.dealloc_raw(p, 64);
    }
}

#[test]
fn padding_report_measures_header_and_rounding_waste() {
    let arena = single_shard(64 * 1024);
    let p = arena.alloc_raw(100, 16, "padded");
    let report = arena.padding_report();
    assert_eq!(report.blocks.len(), 1);
    assert_eq!(report.total_requested, 100);
    assert!(report.total_actual > 100);
    assert_eq!(
        report.total_wasted,
        report.total_actual - report.total_requested
    );
    assert!(report.efficiency > 0.0 && report.efficiency < 1.0);
    assert_eq!(report.blocks[0].tag, "padded");
    arena.dealloc_raw(p, 100);
    assert_eq!(arena.padding_report().total_actual, 0);
}

#[test]
fn cache_report_tracks_live_lines() {
    let arena = Arena::create(ArenaConfig {
        arena_size: 64 * 1024,
        shard_count: 1,
        cache_line_size: 64,
        ..Default::default()
    })
    .unwrap();
    let p = arena.alloc_raw(256, 16, "lines");
    let report = arena.cache_report();
    assert_eq!(report.cache_line_size, 64);
    assert_eq!(report.total_lines, 64 * 1024 / 64);
    assert!(report.active_lines > 0);
    assert!(report.lines.windows(2).all(|w| w[0].line_index < w[1].line_index));
    assert!(report
        .lines
        .iter()
        .any(|line| line.tags.iter().any(|t| t == "lines")));
    arena.dealloc_raw(p, 256);
    assert_eq!(arena.cache_report().active_lines, 0);
}

#[test]
fn layout_macro_reports_field_geometry() {
    #[repr(C)]
    struct Record {
        id: u32,
        value: u64,
        flag: bool,
    }
    let info = layout_of!(Record { id, value, flag });
    assert_eq!(info.total_size, 24);
    assert_eq!(info.fields[0].name, "id");
    assert_eq!(info.fields[1].padding_before, 4);
    assert_eq!(info.tail_padding, 7);
    assert!(info.efficiency < 1.0);
}

#[test]
fn realloc_grows_and_preserves_payload() {
    let arena = single_shard(64 * 1024);
    let p = arena.alloc_raw(64, 16, "growing");
    unsafe {
        for i in 0..64 {
            p.add(i).write(i as u8);
        }
    }
    let q = arena.realloc_raw(p, 4096, "grown");
    assert!(!q.is_null());
    unsafe {
        for i in 0..64 {
            assert_eq!(q.add(i).read(), i as u8);
        }
    }
    assert_eq!(arena.active_block_count(), 1);
    arena.dealloc_raw(q, 4096);
    assert_eq!(arena.bytes_allocated(), 0);
}

#[test]
fn realloc_shrink_keeps_the_pointer() {
    let arena = single_shard(64 * 1024);
    let p = arena.alloc_raw(512, 16, "shrinking");
    let q = arena.realloc_raw(p, 64, "shrunk");
    assert_eq!(p, q);
    let v: serde_json::Value = serde_json::from_str(&arena.snapshot_json()).unwrap();
    assert_eq!(v["blocks"][0]["size"], 64);
    arena.dealloc_raw(q, 64);
    assert_eq!(arena.bytes_allocated(), 0);
}

#[test]
fn realloc_of_null_allocates() {
    let arena = single_shard(64 * 1024);
    let p = arena.realloc_raw(std::ptr::null_mut(), 128, "fresh");
    assert!(!p.is_null());
    arena.dealloc_raw(p, 128);
}

#[test]
fn counters_stay_exact_under_sampling() {
    let arena = Arena::create(ArenaConfig {
        arena_size: 64 * 1024,
        shard_count: 1,
        sampling: 8,
        ..Default::default()
    })
    .unwrap();
    let mut live = Vec::new();
    for _ in 0..10 {
        live.push(arena.alloc_raw(64, 16, "counted"));
    }
    for p in live.drain(..3) {
        arena.dealloc_raw(p, 64);
    }
    assert!(arena.alloc_raw(1 << 20, 16, "nope").is_null());
    let counters = arena.allocation_counters();
    assert_eq!(counters.allocations, 10);
    assert_eq!(counters.deallocations, 3);
    assert_eq!(counters.failed_allocations, 1);
    assert_eq!(counters.live_blocks, 7);
    assert_eq!(
        counters
            .size_histogram
            .iter()
            .find(|b| b.max_bytes == 64)
            .unwrap()
            .count,
        10
    );
    for p in live {
        arena.dealloc_raw(p, 64);
    }
}

#[test]
fn cross_thread_deallocation_balances() {
    let arena = single_shard(64 * 1024);
    let p = arena.alloc_raw(512, 16, "migrating") as usize;
    assert_ne!(p, 0);
    thread::scope(|scope| {
        scope.spawn(|| {
            arena.dealloc_raw(p as *mut u8, 512);
        });
    });
    assert_eq!(arena.bytes_allocated(), 0);
}

#[test]
fn independent_arenas_do_not_interfere() {
    let first = single_shard(64 * 1024);
    let second = single_shard(64 * 1024);
    let a = first.alloc_raw(128, 16, "one");
    // Rebinding between facades on the same thread must keep both usable.
    let b = second.alloc_raw(256, 16, "two");
    let c = first.alloc_raw(128, 16, "three");
    assert!(!a.is_null() && !b.is_null() && !c.is_null());
    assert_eq!(second.active_block_count(), 1);
    first.dealloc_raw(a, 128);
    first.dealloc_raw(c, 128);
    second.dealloc_raw(b, 256);
    assert_eq!(first.bytes_allocated(), 0);
    assert_eq!(second.bytes_allocated(), 0);
}

#[test]
fn pointer_from_one_arena_is_ignored_by_another() {
    let first = single_shard(64 * 1024);
    let second = single_shard(64 * 1024);
    let p = first.alloc_raw(128, 16, "owned");
    second.dealloc_raw(p, 128);
    assert!(first.bytes_allocated() > 0);
    first.dealloc_raw(p, 128);
    assert_eq!(first.bytes_allocated(), 0);
}

#[test]
fn shards_serve_threads_concurrently() {
    let arena = Arena::create(ArenaConfig {
        arena_size: 1 << 20,
        shard_count: 8,
        ..Default::default()
    })
    .unwrap();
    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let mut live = Vec::new();
                for _ in 0..200 {
                    let p = arena.alloc_raw(256, 16, "worker");
                    if !p.is_null() {
                        live.push(p);
                    }
                }
                for p in live {
                    arena.dealloc_raw(p, 256);
                }
            });
        }
    });
    assert_eq!(arena.bytes_allocated(), 0);
    assert_eq!(arena.active_block_count(), 0);
}

#[test]
fn per_shard_exhaustion_does_not_spill() {
    // One thread is bound to one shard; filling it must fail even though
    // the other shards are empty.
    let arena = Arena::create(ArenaConfig {
        arena_size: 64 * 1024,
        shard_count: 4,
        ..Default::default()
    })
    .unwrap();
    let mut live = Vec::new();
    loop {
        let p = arena.alloc_raw(1024, 16, "pin");
        if p.is_null() {
            break;
        }
        live.push(p);
    }
    assert!(arena.bytes_free() > 0, "other shards must remain untouched");
    for p in live {
        arena.dealloc_raw(p, 1024);
    }
    assert_eq!(arena.bytes_allocated(), 0);
}
