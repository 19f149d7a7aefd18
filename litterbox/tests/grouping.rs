//! Protection key grouping over generated domain views.
use litterbox::{
    engine::IsolationEngine,
    package::PackageId,
    pkey::KeyGroups,
    Error,
};
use proptest::prelude::*;
use serde_json::json;

/// Access of one domain to one package: none, read, read-write.
fn arb_views() -> impl Strategy<Value = Vec<Vec<u8>>> {
    (1..7usize, 1..5usize).prop_flat_map(|(packages, domains)| {
        prop::collection::vec(prop::collection::vec(0..3u8, packages), domains)
    })
}

fn engine(views: &[Vec<u8>]) -> IsolationEngine {
    let packages: Vec<_> = (0..views[0].len())
        .map(|p| json!({ "name": format!("p{}", p), "id": p + 1 }))
        .collect();
    let domains: Vec<_> = views
        .iter()
        .enumerate()
        .map(|(d, view)| {
            let view: serde_json::Map<String, serde_json::Value> = view
                .iter()
                .enumerate()
                .filter(|(_, a)| **a != 0)
                .map(|(p, a)| (format!("p{}", p), json!(if *a == 1 { "r" } else { "rw" })))
                .collect();
            json!({ "id": d + 1, "entry": format!("main.f{}", d), "view": view })
        })
        .collect();
    IsolationEngine::from_json(
        &serde_json::to_string(&packages).unwrap(),
        &serde_json::to_string(&domains).unwrap(),
    )
    .unwrap()
}

proptest! {
    #[test]
    fn same_group_iff_same_access_everywhere(views in arb_views()) {
        let engine = engine(&views);
        let groups = KeyGroups::compute(&engine, 15).unwrap();
        let packages = views[0].len();
        let column = |p: usize| views.iter().map(|v| v[p]).collect::<Vec<_>>();

        for a in 0..packages {
            for b in 0..packages {
                let ga = groups.group_of(PackageId(a as i64 + 1));
                let gb = groups.group_of(PackageId(b as i64 + 1));
                prop_assert!(ga.is_some());
                prop_assert_eq!(ga == gb, column(a) == column(b));
            }
        }

        let distinct: std::collections::BTreeSet<_> = (0..packages).map(column).collect();
        prop_assert_eq!(groups.len(), distinct.len());
    }

    #[test]
    fn budget_is_enforced(views in arb_views()) {
        let engine = engine(&views);
        let needed = KeyGroups::compute(&engine, 15).unwrap().len();
        match KeyGroups::compute(&engine, needed - 1) {
            Err(Error::KeyExhaustion { groups, budget }) => {
                prop_assert_eq!(groups, needed);
                prop_assert_eq!(budget, needed - 1);
            }
            other => prop_assert!(false, "expected exhaustion, got {:?}", other.map(|g| g.len())),
        }
    }
}

#[test]
fn shared_package_gets_its_own_key() {
    let engine = IsolationEngine::from_json(
        r#"[{"name":"p1","id":1,"sections":[{"addr":4096,"size":4096,"prot":"rw"}]},
            {"name":"p2","id":2,"sections":[{"addr":8192,"size":4096,"prot":"r"}]}]"#,
        r#"[{"id":1,"entry":"main.a","packages":["p1","p2"]},
            {"id":2,"entry":"main.b","packages":["p1"]}]"#,
    )
    .unwrap();
    let groups = KeyGroups::compute(&engine, 15).unwrap();
    assert_eq!(groups.len(), 2);
    assert_ne!(groups.group_of(PackageId(1)), groups.group_of(PackageId(2)));
    assert_eq!(groups.group_of(PackageId::RUNTIME), None);
    assert_eq!(groups.group_of(PackageId::CGO), None);
}
