//! Convergence properties of the replicated text across several sites.
//!
//! Each test drives independent replicas, exchanges their updates in
//! different orders and checks that every replica materializes the same text.

use livecode_core::{ElementId, Op, ReplicatedText, Update};
use uuid::Uuid;

fn replica(n: u128) -> ReplicatedText {
    ReplicatedText::new(Uuid::from_u128(n))
}

/// Tiny deterministic generator so the tests stay reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound.max(1)
    }
}

/// Random local edits; returns every update produced, one per edit.
fn random_session(text: &mut ReplicatedText, rng: &mut Lcg, edits: usize) -> Vec<Update> {
    let mut updates = Vec::new();
    for _ in 0..edits {
        let len = text.len();
        if len > 0 && rng.next(4) == 0 {
            let at = rng.next(len);
            text.delete_range(at, 1).unwrap();
        } else {
            let at = rng.next(len + 1);
            let ch = char::from(b'a' + rng.next(26) as u8);
            text.insert_str_at(at, &ch.to_string()).unwrap();
        }
        updates.extend(text.take_update());
    }
    updates
}

#[test]
fn test_two_sites_concurrent_start_insert() {
    let mut one = replica(1);
    let mut two = replica(2);
    one.insert_str_at(0, "ab").unwrap();
    two.insert_str_at(0, "xy").unwrap();
    let a = one.take_update().unwrap();
    let b = two.take_update().unwrap();

    one.apply_update(&b);
    two.apply_update(&a);

    assert_eq!(one.materialize().len(), 4);
    assert_eq!(one.materialize(), two.materialize());
}

#[test]
fn test_apply_order_does_not_matter() {
    let mut rng = Lcg(7);
    let mut sites: Vec<ReplicatedText> = (1..=3).map(replica).collect();
    let mut all = Vec::new();
    for site in &mut sites {
        all.extend(random_session(site, &mut rng, 40));
    }

    let mut forward = replica(10);
    for update in &all {
        forward.apply_update(update);
    }
    let mut backward = replica(11);
    for update in all.iter().rev() {
        backward.apply_update(update);
    }

    assert_eq!(forward.deferred_count(), 0);
    assert_eq!(backward.deferred_count(), 0);
    assert_eq!(forward.materialize(), backward.materialize());
}

#[test]
fn test_concurrent_sessions_converge_after_exchange() {
    let mut rng = Lcg(42);
    let mut sites: Vec<ReplicatedText> = (1..=4).map(replica).collect();

    // Three rounds of concurrent editing followed by a full exchange
    for _ in 0..3 {
        let produced: Vec<Vec<Update>> = sites
            .iter_mut()
            .map(|site| random_session(site, &mut rng, 15))
            .collect();

        for (target, site) in sites.iter_mut().enumerate() {
            for (source, updates) in produced.iter().enumerate() {
                if source == target {
                    continue;
                }
                for update in updates {
                    site.apply_update(update);
                }
            }
        }
    }

    let expected = sites[0].materialize();
    for site in &sites[1..] {
        assert_eq!(site.materialize(), expected);
        assert_eq!(site.element_count(), sites[0].element_count());
    }
}

#[test]
fn test_duplicated_and_shuffled_delivery() {
    let mut rng = Lcg(99);
    let mut author = replica(1);
    let updates = random_session(&mut author, &mut rng, 60);

    let mut shuffled: Vec<&Update> = updates.iter().chain(updates.iter()).collect();
    for i in (1..shuffled.len()).rev() {
        let j = rng.next(i + 1);
        shuffled.swap(i, j);
    }

    let mut replica_site = replica(2);
    for update in shuffled {
        let report = replica_site.apply_update(update);
        assert!(report.rejected.is_empty());
    }

    assert_eq!(replica_site.materialize(), author.materialize());
    assert_eq!(replica_site.deferred_count(), 0);
}

#[test]
fn test_idempotent_application() {
    let mut author = replica(1);
    author.insert_str_at(0, "idempotent").unwrap();
    author.delete_range(0, 4).unwrap();
    let update = author.snapshot();

    let mut once = replica(2);
    once.apply_update(&update);
    let mut twice = replica(3);
    twice.apply_update(&update);
    twice.apply_update(&update);

    assert_eq!(once.materialize(), "potent");
    assert_eq!(once.materialize(), twice.materialize());
    assert_eq!(once.element_count(), twice.element_count());
    assert_eq!(once.tombstone_count(), twice.tombstone_count());
}

#[test]
fn test_tombstones_never_revive() {
    let mut one = replica(1);
    let ids = one.insert_str_at(0, "abc").unwrap();
    let inserts = one.take_update().unwrap();
    one.delete(ids[1]).unwrap();
    let delete = one.take_update().unwrap();

    let mut two = replica(2);
    two.apply_update(&delete);
    two.apply_update(&inserts);
    // Replaying the original insert must not bring 'b' back
    two.apply_update(&inserts);
    one.apply_update(&inserts);

    assert_eq!(one.materialize(), "ac");
    assert_eq!(two.materialize(), "ac");
    assert_eq!(two.is_deleted(&ids[1]), Some(true));
}

#[test]
fn test_concurrent_insert_at_deleted_anchor() {
    let mut one = replica(1);
    let ids = one.insert_str_at(0, "ab").unwrap();
    let base = one.take_update().unwrap();
    let mut two = replica(2);
    two.apply_update(&base);

    // Site 1 deletes 'a' while site 2 types right after it
    one.delete(ids[0]).unwrap();
    two.insert(Some(ids[0]), 'X').unwrap();
    let from_one = one.take_update().unwrap();
    let from_two = two.take_update().unwrap();

    one.apply_update(&from_two);
    two.apply_update(&from_one);

    assert_eq!(one.materialize(), "Xb");
    assert_eq!(two.materialize(), "Xb");
}

#[test]
fn test_compressed_snapshot_transfer() {
    let mut rng = Lcg(3);
    let mut author = replica(1);
    random_session(&mut author, &mut rng, 200);

    let bytes = author.snapshot().encode_compressed().unwrap();
    let snapshot = Update::decode_compressed(&bytes).unwrap();

    let mut joiner = replica(2);
    joiner.apply_update(&snapshot);
    assert_eq!(joiner.materialize(), author.materialize());
    assert_eq!(joiner.tombstone_count(), author.tombstone_count());
}

#[test]
fn test_malformed_op_leaves_state_untouched() {
    let mut text = replica(1);
    text.insert_str_at(0, "safe").unwrap();
    let before = text.materialize();
    let count = text.element_count();

    let remote = Uuid::from_u128(5);
    let own = ElementId::new(3, remote);
    let mut bad = Update::new(remote);
    bad.push(Op::Insert { id: own, origin: Some(own), ch: '!' });

    let report = text.apply_update(&bad);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(text.materialize(), before);
    assert_eq!(text.element_count(), count);
    assert_eq!(text.deferred_count(), 0);
}
