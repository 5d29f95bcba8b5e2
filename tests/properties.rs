use aflow::filter::{and, eq, gt, in_set, not, or, range};
use aflow::{Field, FilterNode, QueryRequest, RawRecord, compile, materialize, properties};
use proptest::prelude::*;
use serde_json::Value as Json;

fn leaf() -> impl Strategy<Value = FilterNode> {
    prop_oneof![
        (0.0f64..10.0, 0.0f64..10.0)
            .prop_map(|(a, b)| range("density", a.min(b), a.max(b)).unwrap()),
        (0.0f64..5.0).prop_map(|g| gt("band_gap", g).unwrap()),
        proptest::sample::subsequence(vec!["Fe", "Ni", "Al", "O"], 1..4)
            .prop_map(|s| in_set("species", s).unwrap()),
        any::<bool>().prop_map(|b| eq("is_metal", b).unwrap()),
    ]
}

fn tree() -> impl Strategy<Value = FilterNode> {
    leaf().prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 1..4).prop_map(|v| and(v)),
            proptest::collection::vec(inner.clone(), 1..4).prop_map(|v| or(v)),
            inner.prop_map(not),
        ]
    })
}

fn json() -> impl Strategy<Value = Json> {
    let leaf = prop_oneof![
        Just(Json::Null),
        any::<bool>().prop_map(Json::Bool),
        any::<f64>().prop_filter_map("finite", |f| serde_json::Number::from_f64(f).map(Json::Number)),
        "[a-zA-Z0-9 ,.]{0,8}".prop_map(Json::String),
    ];
    leaf.prop_recursive(2, 12, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Json::Array),
            proptest::collection::btree_map("[a-z]{1,4}", inner, 0..3)
                .prop_map(|m| Json::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn compile_is_deterministic(filter in tree(), page_size in 1usize..500) {
        let request = QueryRequest::new()
            .select(["auid", "compound"])
            .unwrap()
            .filter(filter)
            .page_size(page_size);
        let first = compile(&request).unwrap();
        let second = compile(&request.clone()).unwrap();
        prop_assert_eq!(first.matchbook(), second.matchbook());
        prop_assert_eq!(first.fingerprint(), second.fingerprint());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn and_grouping_compiles_identically(a in tree(), b in tree(), c in tree()) {
        let flat = compile(&QueryRequest::new().filter(and([a.clone(), b.clone(), c.clone()]))).unwrap();
        let left = compile(&QueryRequest::new().filter(and([and([a.clone(), b.clone()]), c.clone()]))).unwrap();
        let right = compile(&QueryRequest::new().filter(and([a, and([b, c])]))).unwrap();
        prop_assert_eq!(flat.matchbook(), left.matchbook());
        prop_assert_eq!(flat.matchbook(), right.matchbook());
    }

    #[test]
    fn materialize_is_total(
        entries in proptest::collection::vec((0usize..64, json()), 0..8)
    ) {
        let selected = properties().collect::<Vec<_>>();
        let mut raw = RawRecord::new();
        for (i, value) in entries {
            raw.insert(selected[i % selected.len()].remote_key.to_string(), value);
        }

        let record = materialize(&raw, &selected);

        prop_assert_eq!(record.fields().count(), selected.len());
        let mut unparseable = 0;
        for property in &selected {
            let field = record.get(property.name).unwrap();
            match raw.get(property.remote_key) {
                None | Some(Json::Null) => prop_assert_eq!(field, &Field::Absent),
                Some(_) => prop_assert!(!field.is_absent()),
            }
            if matches!(field, Field::Unparseable(_)) {
                unparseable += 1;
            }
        }
        prop_assert_eq!(record.warnings().len(), unparseable);
    }
}
