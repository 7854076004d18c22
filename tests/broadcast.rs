use groupcast::{Frame, GroupSet, MapError, Representation};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashSet;

fn array(shape: &[usize], values: Vec<f64>) -> ArrayD<f64> {
    ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
}

/// Six rows with a global root, three mutually unrelated mid-level columns ("a", "c", "d"), a
/// bijective pair ("e"/"f"), and a per-row observation axis.
fn mixed() -> GroupSet {
    let mut frame = Frame::new();
    frame
        .push_column("a", &["0", "0", "0", "1", "1", "1"])
        .push_column("c", &["0", "0", "1", "1", "1", "1"])
        .push_column("d", &["0", "0", "0", "1", "2", "2"])
        .push_column("e", &["4", "4", "4", "4", "5", "4"])
        .push_column("f", &["6", "6", "6", "6", "0", "6"])
        .push_constant_column("root", "all")
        .push_index_column("obs");
    GroupSet::build(&frame).unwrap()
}

/// Six rows where "obs" is exactly the cross product of "block" and "slot".
fn crossed() -> GroupSet {
    let mut frame = Frame::new();
    frame
        .push_column("block", &["0", "0", "0", "1", "1", "1"])
        .push_column("slot", &["0", "1", "2", "0", "1", "2"])
        .push_index_column("obs");
    GroupSet::build(&frame).unwrap()
}

#[test]
fn reduction_is_insertion_order_independent() {
    let set = mixed();
    let ids: Vec<_> = ["a", "c", "e", "f"]
        .iter()
        .map(|name| set.get(name).unwrap().id())
        .collect();

    let reference = Representation::new(&set, ids.iter().copied());
    assert_eq!(reference.shape(), vec![2, 2, 2]);

    // Try every rotation and the reverse; twins collapse to one axis either way.
    for start in 0..ids.len() {
        let rotated = ids[start..].iter().chain(&ids[..start]).copied();
        assert_eq!(Representation::new(&set, rotated), reference);
    }
    let reversed = Representation::new(&set, ids.iter().rev().copied());
    assert_eq!(reversed, reference);
    assert_eq!(reversed.shape(), vec![2, 2, 2]);
}

#[test]
fn merge_equals_bulk_reduction() {
    let set = mixed();
    let ac = set.representation(&["a", "c"]).unwrap();
    let ef = set.representation(&["e", "f"]).unwrap();
    let merged = ac.merge(&ef);
    assert_eq!(merged, set.representation(&["a", "c", "e", "f"]).unwrap());
    assert_eq!(merged.shape(), vec![2, 2, 2]);
}

#[test]
fn twin_representations_are_interchangeable() {
    let set = mixed();
    let with_e = set.representation(&["a", "c", "e"]).unwrap();
    let with_f = set.representation(&["a", "c", "f"]).unwrap();
    assert_eq!(with_e, with_f);

    let mut seen = HashSet::new();
    seen.insert(with_e);
    seen.insert(with_f);
    assert_eq!(seen.len(), 1);
}

#[test]
fn adding_a_parent_of_a_present_group_is_a_no_op() {
    let set = mixed();
    let repr = set.representation(&["obs", "a", "root", "d"]).unwrap();
    // "obs" subsumes everything else in this table.
    assert_eq!(repr.shape(), vec![6]);
    assert!(repr.contains(set.get("obs").unwrap().id()));
}

#[test]
fn unrelated_groups_form_a_product_shape() {
    let set = mixed();
    let cd = set.representation(&["c", "d"]).unwrap();
    assert_eq!(cd.shape(), vec![2, 3]);

    let per_c = set.representation(&["c"]).unwrap();
    let per_d = set.representation(&["d"]).unwrap();

    let from_c = per_c.map(&array(&[2], vec![10.0, 20.0]), &cd).unwrap();
    assert_eq!(from_c, array(&[2, 3], vec![10.0, 10.0, 10.0, 20.0, 20.0, 20.0]));

    let from_d = per_d.map(&array(&[3], vec![1.0, 2.0, 3.0]), &cd).unwrap();
    assert_eq!(from_d, array(&[2, 3], vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]));

    // Values defined on different axes combine elementwise once broadcast to the union.
    let sum = &from_c + &from_d;
    assert_eq!(sum, array(&[2, 3], vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]));
}

#[test]
fn twin_mapping_round_trips() {
    let set = mixed();
    let per_e = set.representation(&["e"]).unwrap();
    let per_f = set.representation(&["f"]).unwrap();

    let value = array(&[2], vec![0.5, 1.5]);
    let there = per_e.map(&value, &per_f).unwrap();
    assert_eq!(there.shape(), &[2]);
    let back = per_f.map(&there, &per_e).unwrap();
    assert_eq!(back, value);
}

#[test]
fn repeating_down_the_hierarchy() {
    let set = mixed();
    let per_a = set.representation(&["a"]).unwrap();
    let per_obs = set.representation(&["obs"]).unwrap();

    let value = array(&[2], vec![7.0, 9.0]);
    let spread = per_a.map(&value, &per_obs).unwrap();
    assert_eq!(spread, array(&[6], vec![7.0, 7.0, 7.0, 9.0, 9.0, 9.0]));

    // "d" is below "a" through the diamond: members 0, 1, 2 sit inside a=0, a=1, a=1.
    let per_d = set.representation(&["d"]).unwrap();
    let narrowed = per_a.map(&value, &per_d).unwrap();
    assert_eq!(narrowed, array(&[3], vec![7.0, 9.0, 9.0]));
}

#[test]
fn coarsening_is_refused() {
    let set = mixed();
    let per_obs = set.representation(&["obs"]).unwrap();
    let per_d = set.representation(&["d"]).unwrap();
    let value = array(&[6], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    match per_obs.map(&value, &per_d) {
        Err(MapError::AmbiguousBroadcast { group, .. }) => assert_eq!(group, "obs"),
        other => panic!("expected AmbiguousBroadcast, got {:?}", other),
    }

    let per_root = set.representation(&["root"]).unwrap();
    let per_c = set.representation(&["c"]).unwrap();
    assert!(matches!(
        per_c.map(&array(&[2], vec![1.0, 2.0]), &per_root),
        Err(MapError::AmbiguousBroadcast { .. })
    ));
}

#[test]
fn unrelated_groups_are_unreachable() {
    let set = mixed();
    let per_c = set.representation(&["c"]).unwrap();
    let per_d = set.representation(&["d"]).unwrap();
    match per_c.map(&array(&[2], vec![1.0, 2.0]), &per_d) {
        Err(MapError::Unreachable { group, .. }) => assert_eq!(group, "c"),
        other => panic!("expected Unreachable, got {:?}", other),
    }
}

#[test]
fn mismatched_values_are_rejected_before_mapping() {
    let set = mixed();
    let per_c = set.representation(&["c"]).unwrap();
    let per_obs = set.representation(&["obs"]).unwrap();
    match per_c.map(&array(&[3], vec![1.0, 2.0, 3.0]), &per_obs) {
        Err(MapError::ShapeMismatch { expected, actual }) => {
            assert_eq!(expected, vec![2]);
            assert_eq!(actual, vec![3]);
        }
        other => panic!("expected ShapeMismatch, got {:?}", other),
    }
}

#[test]
fn scalars_broadcast_anywhere() {
    let set = mixed();
    let scalar = Representation::new(&set, std::iter::empty());
    assert_eq!(scalar.shape(), Vec::<usize>::new());

    let cd = set.representation(&["c", "d"]).unwrap();
    let value = ArrayD::from_elem(IxDyn(&[]), 7.0);
    let spread = scalar.map(&value, &cd).unwrap();
    assert_eq!(spread, ArrayD::from_elem(IxDyn(&[2, 3]), 7.0));
}

#[test]
fn observation_axis_factors_into_its_ancestors() {
    let set = crossed();
    let per_obs = set.representation(&["obs"]).unwrap();
    let product = set.representation(&["block", "slot"]).unwrap();
    assert_eq!(product.shape(), vec![2, 3]);

    // "obs" is in bijection with (block, slot) tuples, so its value unravels exactly.
    let value = array(&[6], (0..6).map(f64::from).collect());
    let unraveled = per_obs.map(&value, &product).unwrap();
    assert_eq!(unraveled, array(&[2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]));

    // And a product-shaped value reads back through the per-row links.
    let back = product.map(&unraveled, &per_obs).unwrap();
    assert_eq!(back, value);
}

#[test]
fn combination_requires_an_exact_product() {
    // "pick" has four members but its only ancestor in the target holds two.
    let mut frame = Frame::new();
    frame
        .push_column("block", &["0", "0", "0", "0", "1", "1", "1", "1"])
        .push_column("pick", &["p", "p", "q", "q", "r", "r", "s", "s"])
        .push_index_column("obs");
    let set = GroupSet::build(&frame).unwrap();

    let per_pick = set.representation(&["pick"]).unwrap();
    let per_block = set.representation(&["block"]).unwrap();
    let value = array(&[4], vec![1.0, 2.0, 3.0, 4.0]);
    assert!(matches!(
        per_pick.map(&value, &per_block),
        Err(MapError::AmbiguousBroadcast { .. })
    ));
}

#[test]
fn index_arrays_match_the_stored_links() {
    let set = mixed();
    let per_a = set.representation(&["a"]).unwrap();
    let per_obs = set.representation(&["obs"]).unwrap();

    let arrays = per_a.index_arrays(&per_obs).unwrap();
    assert_eq!(arrays.len(), 1);
    assert_eq!(
        arrays[0],
        ArrayD::from_shape_vec(IxDyn(&[6]), vec![0, 0, 0, 1, 1, 1]).unwrap()
    );

    let per_c = set.representation(&["c"]).unwrap();
    let cd = set.representation(&["c", "d"]).unwrap();
    let arrays = per_c.index_arrays(&cd).unwrap();
    assert_eq!(
        arrays[0],
        ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![0, 0, 0, 1, 1, 1]).unwrap()
    );
}
