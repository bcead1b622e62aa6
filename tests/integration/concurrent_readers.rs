#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Barrier;
use std::thread;

use mvbtree::{
    run_atomic, Key, KeyDefinition, KeyType, MemPager, MultiValueTree, PagerOptions, Result,
    Rid, TreeOptions,
};

const VALUES_PER_KEY: i64 = 3;
const KEYS: i64 = 3_000;
const READERS: usize = 4;

fn values_for(key: i64) -> Vec<Rid> {
    (0..VALUES_PER_KEY)
        .map(|n| Rid::new((key % 7) as i16, key * 10 + n))
        .collect()
}

#[test]
fn readers_see_whole_keys_while_a_writer_splits() -> Result<()> {
    let pager = MemPager::new(PagerOptions { page_size: 4096 })?;
    let options = TreeOptions {
        prefetch_size: 16,
        ..TreeOptions::default()
    };
    let tree = run_atomic(&pager, |op| {
        MultiValueTree::create(op, "live", KeyDefinition::scalar(KeyType::Long), options)
    })?;
    // keys below this bound are committed
    let committed = AtomicI64::new(0);
    let finished = AtomicBool::new(false);
    let barrier = Barrier::new(READERS + 1);

    thread::scope(|scope| -> Result<()> {
        let mut readers = Vec::new();
        for reader in 0..READERS {
            let (pager, tree, committed, finished, barrier) =
                (&pager, &tree, &committed, &finished, &barrier);
            readers.push(scope.spawn(move || -> Result<u64> {
                barrier.wait();
                let mut scans = 0u64;
                loop {
                    let done = finished.load(Ordering::Acquire);
                    let floor = committed.load(Ordering::Acquire);
                    let read = pager.begin_read();
                    if floor > 0 {
                        let probe = (scans as i64 * 31 + reader as i64) % floor;
                        let mut got = tree.get(&read, Some(&Key::Long(probe)))?;
                        got.sort();
                        assert_eq!(got, values_for(probe), "key {probe}");
                    }
                    let ascending = reader % 2 == 0;
                    let mut last: Option<Key> = None;
                    let mut run = 0i64;
                    let mut seen = 0i64;
                    for item in tree.iterate_all(&read, ascending)? {
                        let (key, _) = item?;
                        if last.as_ref() == Some(&key) {
                            run += 1;
                            continue;
                        }
                        if let Some(previous) = &last {
                            assert_eq!(run, VALUES_PER_KEY, "partial key {previous}");
                            if ascending {
                                assert!(*previous < key, "{previous} then {key}");
                            } else {
                                assert!(*previous > key, "{previous} then {key}");
                            }
                        }
                        last = Some(key);
                        run = 1;
                        seen += 1;
                    }
                    assert!(seen >= floor, "scan saw {seen} keys, {floor} were committed");
                    scans += 1;
                    if done {
                        break;
                    }
                }
                Ok(scans)
            }));
        }

        barrier.wait();
        for chunk in (0..KEYS).collect::<Vec<_>>().chunks(25) {
            run_atomic(&pager, |op| {
                for &key in chunk {
                    for rid in values_for(key) {
                        tree.put(op, Some(&Key::Long(key)), rid)?;
                    }
                }
                Ok(())
            })?;
            if let Some(&last) = chunk.last() {
                committed.store(last + 1, Ordering::Release);
            }
        }
        finished.store(true, Ordering::Release);

        for handle in readers {
            let scans = handle.join().expect("reader thread panicked")?;
            assert!(scans > 0);
        }
        Ok(())
    })?;

    let read = pager.begin_read();
    assert_eq!(tree.size(&read)?, (KEYS * VALUES_PER_KEY) as u64);
    let report = tree.verify(&read)?;
    assert!(report.is_ok(), "verify issues: {:?}", report.issues);
    assert!(report.depth >= 2);
    Ok(())
}
