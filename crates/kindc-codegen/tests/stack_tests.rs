//! Virtual evaluation stack tests.
//!
//! Tests validate:
//! - Consuming every counted use in any order leaves the stack empty
//! - Load offsets always point inside the stack, counted from the top
//! - Call arguments are dropped together with exhausted values above them

use kindc_codegen::ir::SharedId;
use kindc_codegen::stack::{Access, VirtualStack};
use proptest::prelude::*;

/// Use counts per value, and one shuffled sequence naming each use once.
fn uses() -> impl Strategy<Value = (Vec<u32>, Vec<usize>)> {
    prop::collection::vec(1u32..4, 1..8).prop_flat_map(|counts| {
        let order: Vec<usize> = counts
            .iter()
            .enumerate()
            .flat_map(|(i, &n)| std::iter::repeat(i).take(n as usize))
            .collect();
        (Just(counts), Just(order).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn every_counted_use_balances((counts, order) in uses()) {
        let mut s = VirtualStack::new();
        for (i, &n) in counts.iter().enumerate() {
            s.push(SharedId(i as u32), n);
        }

        let mut words = 0;
        for &i in &order {
            let depth = s.depth();
            match s.take(SharedId(i as u32)).unwrap() {
                Access::Pop => words += 1,
                Access::Load(off) => prop_assert!(off < depth),
            }
            words += s.collapse();
        }

        prop_assert!(s.is_empty());
        prop_assert_eq!(words, counts.len());
    }

    #[test]
    fn over_use_is_refused(n in 1u32..5) {
        let mut s = VirtualStack::new();
        s.push(SharedId(0), n);
        s.push_temp();
        for _ in 0..n {
            prop_assert!(matches!(s.take(SharedId(0)), Ok(Access::Load(_))));
        }
        prop_assert!(s.take(SharedId(0)).is_err());
    }
}

#[test]
fn buried_values_load_relative_to_the_top() {
    let mut s = VirtualStack::new();
    s.push(SharedId(0), 2);
    s.push(SharedId(1), 1);
    s.push_temp();
    assert_eq!(s.take(SharedId(0)), Ok(Access::Load(2)));
    assert_eq!(s.take(SharedId(1)), Ok(Access::Load(1)));
    s.pop_temp().unwrap();
    assert_eq!(s.collapse(), 1);
    // Last use, now on top.
    assert_eq!(s.take(SharedId(0)), Ok(Access::Pop));
    assert!(s.is_empty());
}

#[test]
fn arguments_leave_with_exhausted_values() {
    let mut s = VirtualStack::new();
    s.push(SharedId(1), 1);
    s.push_arg();
    s.push(SharedId(2), 1);
    s.push_arg();
    // The callee's second argument was the last use of SH2.
    assert_eq!(s.take(SharedId(2)), Ok(Access::Load(1)));
    assert_eq!(s.pop_args(2), Ok(3));
    // SH1 still has a use below the arguments.
    assert_eq!(s.depth(), 1);
    assert_eq!(s.take(SharedId(1)), Ok(Access::Pop));
    assert!(s.is_empty());
}

#[test]
fn popping_arguments_over_live_values_is_internal() {
    let mut s = VirtualStack::new();
    s.push_arg();
    s.push(SharedId(7), 2);
    assert!(s.pop_args(1).is_err());
}
