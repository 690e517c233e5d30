//! Property tests for the goal scheduler and the store's public behavior.

use factflow::fact::{Fact, Goal, PredId};
use factflow::goals::GoalQueue;
use factflow::registry::Registry;
use factflow::store::Stores;
use factflow::term::{Term, Value};
use proptest::prelude::*;

fn goal(priority: i32, tag: i64) -> Goal {
    Goal {
        priority,
        pred: PredId(0),
        values: vec![Value::Int(tag)].into_boxed_slice(),
    }
}

proptest! {
    #[test]
    fn pop_all_is_sorted_by_priority(
        priorities in prop::collection::vec(-1000i32..1000, 0..120)
    ) {
        let mut q = GoalQueue::new();
        q.push_many(priorities.iter().enumerate().map(|(i, &p)| goal(p, i as i64)));
        let drained = q.pop_all();
        prop_assert_eq!(drained.len(), priorities.len());
        for pair in drained.windows(2) {
            prop_assert!(pair[0].priority <= pair[1].priority);
        }
    }

    #[test]
    fn arrival_order_is_invisible_in_the_drained_multiset(
        priorities in prop::collection::vec(-5i32..5, 1..60),
        seed in any::<u64>(),
    ) {
        let goals: Vec<Goal> = priorities
            .iter()
            .enumerate()
            .map(|(i, &p)| goal(p, i as i64))
            .collect();
        let mut shuffled = goals.clone();
        // cheap deterministic shuffle
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            shuffled.swap(i, (state as usize) % (i + 1));
        }

        let mut qa = GoalQueue::new();
        qa.push_many(goals);
        let mut qb = GoalQueue::new();
        qb.push_many(shuffled);

        let key = |g: &Goal| (g.priority, format!("{:?}", g.values));
        let mut a = qa.pop_all();
        let mut b = qb.pop_all();
        a.sort_by_key(key);
        b.sort_by_key(key);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn store_add_remove_bookkeeping(
        script in prop::collection::vec((any::<bool>(), 0i64..6, 0i64..6), 1..80)
    ) {
        let mut reg = Registry::new();
        let pred = reg.register_pred("cell", 2);
        let mut stores = Stores::new(&reg);

        // force an index to exist so removals exercise bucket pruning
        let x = Term::var();
        x.bind(Value::Int(0));
        let probe = Fact::new(pred, [x, Term::var()]);
        let lookup = stores.store_mut(pred).generate_lookup(&probe);

        let mut live: Vec<u64> = Vec::new();
        let mut adds = 0usize;
        for (is_add, a, b) in script {
            if is_add || live.is_empty() {
                let id = stores.add(pred, vec![Value::Int(a), Value::Int(b)].into_boxed_slice());
                live.push(id);
                adds += 1;
            } else {
                let victim = live.remove((a as usize) % live.len());
                stores.remove(pred, victim);
            }
        }
        prop_assert_eq!(stores.store(pred).len(), live.len());
        prop_assert!(adds >= live.len());

        // every live fact with first value v is reachable through the index
        for v in 0i64..6 {
            probe.args[0].bind(Value::Int(v));
            let hits = stores.store(pred).candidate_ids(&lookup, &probe);
            let expected = live
                .iter()
                .filter(|id| {
                    stores.store(pred).get(**id).map(|f| f.values[0] == Value::Int(v))
                        == Some(true)
                })
                .count();
            prop_assert_eq!(hits.len(), expected);
        }
    }
}
