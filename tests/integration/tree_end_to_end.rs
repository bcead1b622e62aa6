#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use mvbtree::storage::mvbtree::EMBEDDED_ITEMS_THRESHOLD;
use mvbtree::types::IndexError;
use mvbtree::{
    run_atomic, Key, KeyDefinition, KeyType, MemPager, MultiValueTree, PagerOptions, Result,
    Rid, TreeOptions,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

fn definition() -> KeyDefinition {
    KeyDefinition::composite(vec![KeyType::Text, KeyType::Long]).with_null_key(true)
}

fn key(user: &str, n: i64) -> Key {
    Key::Composite(vec![Key::Text(user.to_string()), Key::Long(n)])
}

fn collect(
    pager: &MemPager,
    tree: &MultiValueTree,
) -> Result<BTreeMap<Key, BTreeSet<Rid>>> {
    let read = pager.begin_read();
    let mut out: BTreeMap<Key, BTreeSet<Rid>> = BTreeMap::new();
    for item in tree.iterate_all(&read, true)? {
        let (key, rid) = item?;
        out.entry(key).or_default().insert(rid);
    }
    Ok(out)
}

#[test]
fn snapshot_round_trip_preserves_tree() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("index.snap");
    let pager = MemPager::new(PagerOptions { page_size: 4096 })?;
    let tree = run_atomic(&pager, |op| {
        MultiValueTree::create(op, "events", definition(), TreeOptions::default())
    })?;

    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut reference: BTreeMap<Key, BTreeSet<Rid>> = BTreeMap::new();
    run_atomic(&pager, |op| {
        for n in 0..2_000i64 {
            let user = ["ada", "grace", "alan", "barbara"][rng.gen_range(0..4)];
            let k = key(user, rng.gen_range(0..300));
            let rid = Rid::new(rng.gen_range(0..8), n);
            tree.put(op, Some(&k), rid)?;
            reference.entry(k).or_default().insert(rid);
        }
        for n in 0..(EMBEDDED_ITEMS_THRESHOLD as i64 + 20) {
            tree.put(op, Some(&key("hot", 0)), Rid::new(1, n))?;
            reference
                .entry(key("hot", 0))
                .or_default()
                .insert(Rid::new(1, n));
        }
        tree.put(op, None, Rid::new(0, 42))?;
        Ok(())
    })?;
    pager.checkpoint(&path)?;
    tree.close();
    drop(pager);

    let reopened = MemPager::open(&path, PagerOptions::default())?;
    assert_eq!(reopened.options().page_size, 4096);
    let tree = {
        let read = reopened.begin_read();
        MultiValueTree::load(&read, "events", definition(), TreeOptions::default())?
    };
    assert_eq!(collect(&reopened, &tree)?, reference);
    {
        let read = reopened.begin_read();
        assert_eq!(tree.get(&read, None)?, vec![Rid::new(0, 42)]);
        let expected: u64 = reference.values().map(|rids| rids.len() as u64).sum();
        assert_eq!(tree.size(&read)?, expected + 1);
        let report = tree.verify(&read)?;
        assert!(report.is_ok(), "verify issues: {:?}", report.issues);
        assert_eq!(report.overflow_rows, 20);
    }

    // overflow ids handed out after the reload must not collide with persisted ones
    run_atomic(&reopened, |op| {
        for n in 0..(EMBEDDED_ITEMS_THRESHOLD as i64 + 5) {
            tree.put(op, Some(&key("fresh", 7)), Rid::new(2, n))?;
        }
        Ok(())
    })?;
    let read = reopened.begin_read();
    let report = tree.verify(&read)?;
    assert!(report.is_ok(), "verify issues: {:?}", report.issues);
    assert_eq!(tree.get(&read, Some(&key("hot", 0)))?.len(), EMBEDDED_ITEMS_THRESHOLD + 20);
    Ok(())
}

#[test]
fn prefix_range_returns_one_user() -> Result<()> {
    let pager = MemPager::new(PagerOptions::default())?;
    let tree = run_atomic(&pager, |op| {
        MultiValueTree::create(op, "by_user", definition(), TreeOptions::default())
    })?;
    run_atomic(&pager, |op| {
        for user in ["ada", "alan", "grace"] {
            for n in 0..50 {
                tree.put(op, Some(&key(user, n)), Rid::new(0, n))?;
            }
        }
        Ok(())
    })?;

    let read = pager.begin_read();
    let prefix = Key::Composite(vec![Key::Text("alan".into())]);
    let pairs: Vec<(Key, Rid)> = tree
        .iterate_entries_between(&read, &prefix, true, &prefix, true, false)?
        .collect::<Result<_>>()?;
    assert_eq!(pairs.len(), 50);
    assert_eq!(pairs.first().map(|(k, _)| k.clone()), Some(key("alan", 49)));
    assert_eq!(pairs.last().map(|(k, _)| k.clone()), Some(key("alan", 0)));

    let above: Vec<(Key, Rid)> = tree
        .iterate_entries_major(&read, &prefix, false, true)?
        .collect::<Result<_>>()?;
    assert!(above.iter().all(|(k, _)| *k >= key("grace", 0)));
    assert_eq!(above.len(), 50);
    Ok(())
}

#[test]
fn missing_tree_is_not_found() -> Result<()> {
    let pager = MemPager::new(PagerOptions::default())?;
    let read = pager.begin_read();
    let err = match MultiValueTree::load(&read, "ghost", definition(), TreeOptions::default()) {
        Ok(_) => panic!("loading an absent tree must fail"),
        Err(err) => err,
    };
    assert!(matches!(err.root_cause(), IndexError::NotFound), "{err}");
    Ok(())
}
