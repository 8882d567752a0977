//! End-to-end two-process test for the MPSC queue over POSIX shared memory.
//!
//! The same test executable is spawned twice with a role in the environment.
//! The producer creates the backend, formats a stack allocator on it, builds
//! a queue and publishes the queue's offset in the allocator's custom
//! header. The consumer attaches by URL, finds the queue through the custom
//! header and drains it while the producer is still writing.
//!
//! ```text
//! [Producer] --[shm_init]--[create queue]--[publish offset]--[emplace...]------[wait drained]--[destroy]
//!                  |                            |                 |   |   |          ^
//!                  v                            v                 v   v   v          |
//! [Consumer] ----[attach (retry)]--------[find queue]--------[pop...]--------[mark drained]
//! ```
//!
//! The queue depth is much smaller than the event count, so the producer
//! regularly blocks on a full ring and the consumer regularly finds it empty.
//!
//! ```bash
//! cargo test -p tessera-ipc --test e2e_shm -- --nocapture
//! ```

use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tessera_ipc::{MpscQueue, ShmContainer};
use tessera_memory::{
    Allocator, AllocatorId, MemoryBackendId, MemoryBackendType, MemoryManager, OffsetPointer,
};

macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "TESSERA_E2E_ROLE";
const ENV_URL: &str = "TESSERA_E2E_URL";
const ROLE_PRODUCER: &str = "producer";
const ROLE_CONSUMER: &str = "consumer";

const EVENT_COUNT: u64 = 100_000;
const QUEUE_DEPTH: usize = 256;
const BACKEND_SIZE: usize = 1 << 20;
const ALLOCATOR_ID: AllocatorId = AllocatorId::new(7, 1);

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct Tick {
    seq: u64,
    px: i64,
}

/// Lives in the allocator's custom header.
#[repr(C)]
struct BusRoot {
    /// Queue header offset; 0 until published (the allocator header owns offset 0).
    queue: AtomicU64,
    /// Set by the consumer once it has read every event.
    drained: AtomicU32,
}

fn test_url() -> String {
    format!("/tessera_e2e_bus_{}", std::process::id())
}

fn run_producer(url: &str) {
    log!("[PRODUCER] Creating backend {url} ({BACKEND_SIZE} bytes)");
    let mm = MemoryManager::with_root_size(1 << 16).expect("producer: manager");
    let backend = mm
        .create_backend(MemoryBackendType::PosixShmMmap, MemoryBackendId::get(7), BACKEND_SIZE, url)
        .expect("producer: backend");
    let alloc = mm
        .create_stack_allocator(backend, ALLOCATOR_ID, size_of::<BusRoot>())
        .expect("producer: allocator");
    let root = unsafe { &*alloc.convert::<BusRoot>(alloc.custom_header()) };

    let queue = MpscQueue::<Tick>::new_in(&alloc, QUEUE_DEPTH).expect("producer: queue");
    root.queue.store(queue.header_offset().get(), Ordering::Release);
    log!("[PRODUCER] Queue published at {}", queue.header_offset());

    let start = Instant::now();
    for seq in 0..EVENT_COUNT {
        queue.emplace(Tick { seq, px: 1000 + seq as i64 });
    }
    let elapsed = start.elapsed();
    log!(
        "[PRODUCER] {EVENT_COUNT} events in {elapsed:?} ({:.0} ev/s)",
        EVENT_COUNT as f64 / elapsed.as_secs_f64()
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while root.drained.load(Ordering::Acquire) == 0 {
        assert!(Instant::now() < deadline, "[PRODUCER] consumer never drained the queue");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(queue.is_empty());
    log!("[PRODUCER] Consumer drained the queue; destroying backend");
}

fn run_consumer(url: &str) {
    let mm = MemoryManager::with_root_size(1 << 16).expect("consumer: manager");

    // The producer may still be creating or formatting the region.
    let attach_deadline = Instant::now() + Duration::from_secs(5);
    let alloc = loop {
        let attached = mm
            .attach_backend(MemoryBackendType::PosixShmMmap, url)
            .and_then(|backend| mm.attach_stack_allocator(backend));
        match attached {
            Ok(alloc) => break alloc,
            Err(_) if Instant::now() < attach_deadline => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("[CONSUMER] failed to attach {url}: {e}"),
        }
    };
    assert_eq!(alloc.id(), ALLOCATOR_ID);
    let root = unsafe { &*alloc.convert::<BusRoot>(alloc.custom_header()) };

    let queue_off = loop {
        let off = root.queue.load(Ordering::Acquire);
        if off != 0 {
            break off;
        }
        assert!(Instant::now() < attach_deadline, "[CONSUMER] queue never published");
        std::thread::sleep(Duration::from_millis(1));
    };
    let mut queue = MpscQueue::<Tick>::shm_deserialize(&alloc, OffsetPointer::new(queue_off))
        .expect("consumer: queue header");
    log!("[CONSUMER] Attached; queue depth {}", queue.depth());

    let read_deadline = Instant::now() + Duration::from_secs(20);
    let start = Instant::now();
    let mut expect = 0u64;
    while expect < EVENT_COUNT {
        assert!(Instant::now() < read_deadline, "[CONSUMER] timed out at {expect}");
        assert!(queue.size() <= QUEUE_DEPTH as u64);
        match queue.try_pop() {
            Some(tick) => {
                assert_eq!(tick.seq, expect, "events out of order");
                assert_eq!(tick.px, 1000 + expect as i64);
                expect += 1;
            }
            None => std::hint::spin_loop(),
        }
    }
    let elapsed = start.elapsed();
    log!(
        "[CONSUMER] {EVENT_COUNT} events in {elapsed:?} ({:.0} ev/s)",
        EVENT_COUNT as f64 / elapsed.as_secs_f64()
    );
    root.drained.store(1, Ordering::Release);
}

#[test]
fn e2e_two_process_shm_queue() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let url = env::var(ENV_URL).expect("TESSERA_E2E_URL not set");
        match role.as_str() {
            ROLE_PRODUCER => run_producer(&url),
            ROLE_CONSUMER => run_consumer(&url),
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let url = test_url();
    let exe = env::current_exe().expect("current executable");
    log!("[ORCHESTRATOR] url {url}, {EVENT_COUNT} events, depth {QUEUE_DEPTH}");

    let spawn = |role: &str| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_two_process_shm_queue")
            .env(ENV_ROLE, role)
            .env(ENV_URL, &url)
            .stderr(Stdio::inherit())
            .spawn()
            .expect("spawn child")
    };
    let mut producer = spawn(ROLE_PRODUCER);
    std::thread::sleep(Duration::from_millis(5));
    let mut consumer = spawn(ROLE_CONSUMER);

    let producer_status = producer.wait().expect("wait producer");
    let consumer_status = consumer.wait().expect("wait consumer");

    // Normally the producer already unlinked it.
    let _ = tessera_mmap::ShmObject::unlink(&url);

    assert!(producer_status.success(), "producer failed: {producer_status}");
    assert!(consumer_status.success(), "consumer failed: {consumer_status}");
}
