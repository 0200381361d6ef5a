use std::thread;
use std::time::Duration;

use crate::allocator::ShmAllocator;
use crate::errors::IpcError;
use crate::queue::SharedQueue;
use crate::tests::test_config;

const ROUNDS: usize = 100;

#[test]
fn fill_until_exhausted_then_drain() {
    let alloc = ShmAllocator::create(&test_config("stress_fill", 64 * 1024)).unwrap();
    let queue = SharedQueue::create("fill", &alloc).unwrap();
    let baseline = alloc.stats().unwrap();

    for round in 0..ROUNDS {
        let mut queued = 0usize;
        loop {
            match alloc.malloc(32) {
                Ok(mut block) => {
                    block[..8].copy_from_slice(&(queued as u64).to_le_bytes());
                    queue.enqueue(block).unwrap();
                    queued += 1;
                }
                Err(IpcError::OutOfMemory { .. }) => break,
                Err(e) => panic!("round {}: unexpected error {}", round, e),
            }
        }
        assert!(queued > 0);

        let mut expected = 0u64;
        while let Some(block) = queue.dequeue_timed(Duration::from_millis(100)).unwrap() {
            assert_eq!(&block[..8], &expected.to_le_bytes());
            expected += 1;
            alloc.free(block).unwrap();
        }
        assert_eq!(expected as usize, queued);
        assert_eq!(alloc.stats().unwrap(), baseline, "round {}", round);
    }
}

#[test]
fn producer_and_consumer_threads_balance() {
    let cfg = test_config("stress_threads", 1024 * 1024);
    let alloc = ShmAllocator::create(&cfg).unwrap();
    let _queue = SharedQueue::create("pc", &alloc).unwrap();

    let consumer_cfg = cfg.clone();
    let consumer = thread::spawn(move || {
        let alloc = ShmAllocator::attach(&consumer_cfg).unwrap();
        let queue = SharedQueue::attach("pc", &alloc).unwrap();
        let mut received = Vec::with_capacity(ROUNDS);
        while received.len() < ROUNDS {
            match queue.dequeue_timed(Duration::from_secs(5)).unwrap() {
                Some(block) => {
                    received.push(u64::from_le_bytes(block[..8].try_into().unwrap()));
                    alloc.free(block).unwrap();
                }
                None => panic!("consumer starved after {} items", received.len()),
            }
        }
        received
    });

    let producer_cfg = cfg.clone();
    let producer = thread::spawn(move || {
        let alloc = ShmAllocator::attach(&producer_cfg).unwrap();
        let queue = SharedQueue::attach("pc", &alloc).unwrap();
        for i in 0..ROUNDS as u64 {
            let mut block = alloc.malloc(32).unwrap();
            block[..8].copy_from_slice(&i.to_le_bytes());
            queue.enqueue(block).unwrap();
            if i % 10 == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    });

    producer.join().unwrap();
    let received = consumer.join().unwrap();
    assert_eq!(received, (0..ROUNDS as u64).collect::<Vec<_>>());
    // Only the queue header is still allocated.
    assert_eq!(alloc.stats().unwrap().allocated_blocks, 1);
}

#[test]
fn interleaved_loops_leave_nothing_outstanding() {
    let cfg = test_config("stress_interleave", 1024 * 1024);
    let alloc = ShmAllocator::create(&cfg).unwrap();
    let peer = ShmAllocator::attach(&cfg).unwrap();
    let producer = SharedQueue::create("il", &alloc).unwrap();
    let consumer = SharedQueue::attach("il", &peer).unwrap();

    let mut outstanding = 0isize;
    for i in 0..ROUNDS {
        for _ in 0..=(i % 3) {
            producer.enqueue(alloc.malloc(32).unwrap()).unwrap();
            outstanding += 1;
        }
        for _ in 0..(i % 2 + 1) {
            if let Some(block) = consumer.try_dequeue().unwrap() {
                peer.free(block).unwrap();
                outstanding -= 1;
            }
        }
    }
    while let Some(block) = consumer.dequeue_timed(Duration::from_millis(50)).unwrap() {
        peer.free(block).unwrap();
        outstanding -= 1;
    }
    assert_eq!(outstanding, 0);
    assert_eq!(alloc.stats().unwrap().allocated_blocks, 1);
}
