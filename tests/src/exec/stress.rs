//! Background compilation racing with execution and stores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tcg_core::{GuestFault, TcgConfig, Trap};
use tcg_exec::{guest_store, ExitReason};

use crate::rv::*;

fn background_config() -> TcgConfig {
    TcgConfig {
        background_compile: true,
        ..test_config()
    }
}

#[test]
fn test_background_worker_promotes_loop() {
    let mut m = Machine::new(background_config());
    m.load(0xd000, &[addi(1, 1, 1), bne(1, 2, -4), ECALL]);
    m.cpu.gpr[2] = 1_000_000;
    m.cpu.pc = 0xd000;

    let deadline = Instant::now() + Duration::from_secs(10);
    while m.env.stats().compiled_blocks == 0 && Instant::now() < deadline {
        if m.run(Some(1)) != ExitReason::BlockLimit {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(m.env.stats().compiled_blocks > 0, "worker never installed");
    assert_eq!(m.env.cache().stats_snapshot().installs, 1);

    assert_eq!(
        m.run(None),
        ExitReason::Halted(Trap::Exception(GuestFault::EnvironmentCall))
    );
    assert_eq!(m.cpu.gpr[1], 1_000_000);
}

#[test]
fn test_stores_race_compilation() {
    const N: u64 = 200_000;
    let program = [addi(1, 1, 1), bne(1, 2, -4), ECALL];
    let mut m = Machine::new(background_config());
    m.load(0x1000, &program);
    m.cpu.gpr[2] = N;
    m.cpu.pc = 0x1000;

    // Rewrite the loop with identical bytes as fast as possible:
    // every block gets invalidated and recompiled, never changed.
    let bytes: Vec<u8> = program[..2].iter().flat_map(|i| i.to_le_bytes()).collect();
    let shared = Arc::clone(m.env.shared());
    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut stores = 0u64;
            loop {
                guest_store(&shared, 0x1000, &bytes, None).unwrap();
                stores += 1;
                if stop.load(Ordering::Relaxed) {
                    break stores;
                }
                thread::sleep(Duration::from_micros(50));
            }
        })
    };

    let r = m.run(None);
    stop.store(true, Ordering::Relaxed);
    let stores = writer.join().unwrap();

    assert_eq!(r, ExitReason::Halted(Trap::Exception(GuestFault::EnvironmentCall)));
    assert_eq!(m.cpu.gpr[1], N);
    assert!(stores > 0);
    assert_eq!(m.env.cache().pages().version(1), stores);

    // Whatever is still installed matches the current page.
    if let Some(b) = m.env.cache().lookup(0x1000) {
        assert!(b.is_valid());
        assert_eq!(b.stamp.first().version, stores);
    }
}
