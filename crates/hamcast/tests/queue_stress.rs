// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Randomized interleavings of the concurrent primitives.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hamcast::queue::single_reader_queue;
use hamcast::semaphore::StorageSemaphore;

const PRODUCERS: usize = 6;
const PER_PRODUCER: u32 = 20_000;

#[test]
fn test_queue_keeps_each_producers_order() {
    let (writer, mut reader) = single_reader_queue::<(usize, u32)>();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let writer = writer.clone();
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(id as u64);
                let mut seq = 0;
                while seq < PER_PRODUCER {
                    if rng.u8(..) < 8 {
                        thread::yield_now();
                    }
                    // Mix single and batched pushes.
                    let batch = rng.u32(1..=4).min(PER_PRODUCER - seq);
                    if batch == 1 {
                        writer.push((id, seq));
                    } else {
                        writer.push_batch((seq..seq + batch).map(|s| (id, s)));
                    }
                    seq += batch;
                }
            })
        })
        .collect();
    drop(writer);

    let mut next = [0u32; PRODUCERS];
    let total = PRODUCERS * PER_PRODUCER as usize;
    for _ in 0..total {
        let (id, seq) = reader
            .try_pop_for(Duration::from_secs(10))
            .expect("producer stalled");
        assert_eq!(seq, next[id], "producer {} out of order", id);
        next[id] += 1;
    }
    for p in producers {
        p.join().unwrap();
    }
    assert!(reader.try_pop().is_none());
    assert!(next.iter().all(|&n| n == PER_PRODUCER));
}

#[test]
fn test_semaphore_never_overcommits() {
    const MAX: usize = 1 << 16;
    let sem = Arc::new(StorageSemaphore::new(MAX));

    let workers: Vec<_> = (0..4)
        .map(|id| {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(100 + id);
                for _ in 0..5_000 {
                    let n = rng.usize(1..=MAX / 4);
                    sem.acquire(n);
                    assert!(sem.acquired() <= MAX);
                    if rng.bool() {
                        thread::yield_now();
                    }
                    sem.release(n);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(sem.available(), MAX);
    assert_eq!(sem.acquired(), 0);
}
