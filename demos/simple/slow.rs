// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

#[inline(never)]
fn busy_loop(iterations: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..iterations {
        acc = acc.wrapping_mul(31).wrapping_add(std::hint::black_box(i));
    }
    acc
}

#[inline(never)]
fn accidentally_slow() -> u64 {
    busy_loop(5_000_000)
}

#[inline(never)]
fn short_burst() -> u64 {
    busy_loop(50_000)
}

#[inline(never)]
fn short_sleep() {
    std::thread::sleep(Duration::from_micros(100));
}

/// Burns cpu on `threads` threads for `duration`, with a rare slow path.
pub fn run(threads: usize, duration: Duration) {
    let handles: Vec<_> = (0..threads)
        .map(|n| {
            std::thread::spawn(move || {
                let start = Instant::now();
                let mut round = 0u64;
                while start.elapsed() < duration {
                    round += 1;
                    // most time goes to `short_burst`, with an occasional long call
                    if (round + n as u64) % 1000 == 0 {
                        std::hint::black_box(accidentally_slow());
                    } else {
                        std::hint::black_box(short_burst());
                        short_sleep();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().ok();
    }
}
