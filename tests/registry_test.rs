use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use flagwatch_lib::{
    FeatureError, FeatureType, Flag, InvalidReason, ParseError, Parameters, Registry, Value,
    MAX_DEPTH,
};

fn seeded() -> Registry {
    Registry::from_features(HashMap::from([
        ("existing".to_string(), Flag::constant("", true)),
        (
            "geo".to_string(),
            Flag::expression_based("", "country in ('NZ', 'AU')").with_description("ANZ only"),
        ),
    ]))
    .unwrap()
}

#[test]
fn test_reload_rejects_whole_map() {
    let registry = seeded();
    let before = registry.snapshot();

    let err = registry
        .reload([
            ("flag1".to_string(), Flag::constant("", true)),
            ("flag2".to_string(), Flag::percentage_based("", 150)),
        ])
        .unwrap_err();

    match err {
        FeatureError::InvalidFeature { name, reason } => {
            assert_eq!(name, "flag2");
            assert_eq!(reason, InvalidReason::PercentageOutOfRange(150));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(registry.snapshot(), before);
    assert!(registry.get("flag1").is_err());
}

#[test]
fn test_deeply_nested_expression_rejected() {
    let registry = seeded();
    let depth = 5000;
    let deep = format!("{}country == 'NZ'{}", "(".repeat(depth), ")".repeat(depth));

    let err = registry.set(Flag::expression_based("deep", &deep)).unwrap_err();
    match err {
        FeatureError::InvalidFeature { name, reason } => {
            assert_eq!(name, "deep");
            assert_eq!(
                reason,
                InvalidReason::Uncompilable(ParseError::TooDeep { limit: MAX_DEPTH })
            );
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(registry.get("deep").is_err());

    let body = format!(r#"{{"deep": {{"type": "EXPRESSION", "expression": "{deep}"}}}}"#);
    assert!(registry.reload_from_slice(body.as_bytes(), Path::new("features.json")).is_err());
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_set_then_get() {
    let registry = Registry::new();
    let first = registry.set(Flag::constant("f", true)).unwrap();
    assert!(first.before.is_none());
    assert_eq!(registry.get("f").unwrap(), Flag::constant("f", true));

    let second = registry.set(Flag::constant("f", false)).unwrap();
    assert!(second.before.unwrap().enabled());
    assert!(!second.after.enabled());
    assert!(!registry.get("f").unwrap().enabled());
}

#[test]
fn test_delete_missing_is_not_an_error() {
    let registry = seeded();
    assert!(registry.delete("missing").is_none());
    assert_eq!(registry.len(), 2);

    let removed = registry.delete("existing").unwrap();
    assert_eq!(removed.name(), "existing");
    assert!(matches!(registry.get("existing"), Err(FeatureError::NotFound(_))));
}

#[test]
fn test_snapshot_round_trip() {
    let registry = seeded();
    registry
        .set(Flag::percentage_based("half", 50).with_description("a & b < c"))
        .unwrap();
    registry.set(Flag::percentage_based("none", 0)).unwrap();
    registry.set(Flag::constant("off", false)).unwrap();

    let encoded = registry.encode_snapshot().unwrap();
    let text = std::str::from_utf8(&encoded).unwrap();
    assert!(text.contains("a & b < c"));
    assert!(text.contains("\"type\": \"PERCENTAGE_BASED\""));

    let copy = Registry::new();
    copy.reload_from_slice(&encoded, Path::new("snapshot.json"))
        .unwrap();
    assert_eq!(copy.snapshot(), registry.snapshot());
    assert_eq!(copy.get("half").unwrap().percentage(), 50);
    assert_eq!(copy.get("off").unwrap().kind(), FeatureType::Constant);
}

#[test]
fn test_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("features.json");
    std::fs::write(
        &path,
        r#"{
  "checkout": {"type": "EXPRESSION", "expression": "cart_total > 100 and not blocked"},
  "legacy": {"type": "constant", "enabled": true}
}"#,
    )
    .unwrap();

    let registry = Registry::new();
    let err = registry.load_file(&path).unwrap_err();
    // type names in the file are case sensitive
    assert!(matches!(err, FeatureError::UnknownType { ref name } if name == "legacy"));
    assert!(registry.is_empty());

    std::fs::write(
        &path,
        r#"{"checkout": {"type": "EXPRESSION", "expression": "cart_total > 100 and not blocked"}}"#,
    )
    .unwrap();
    registry.load_file(&path).unwrap();

    let params = Parameters::from([
        ("cart_total".to_string(), Value::from(120)),
        ("blocked".to_string(), Value::from(false)),
    ]);
    assert!(registry.is_enabled("checkout", &params).unwrap());

    std::fs::write(&path, "\n").unwrap();
    assert!(matches!(
        registry.load_file(&path),
        Err(FeatureError::EmptyConfig(p)) if p == path
    ));
    assert!(matches!(
        registry.load_file(&dir.path().join("absent.json")),
        Err(FeatureError::Io(_))
    ));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_concurrent_readers_and_writers() {
    let registry = Arc::new(seeded());
    let params = Parameters::from([("country".to_string(), Value::from("NZ"))]);

    let writers: Vec<_> = (0..4)
        .map(|n| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..200 {
                    registry
                        .set(Flag::constant(format!("w{n}-{}", i % 10), i % 2 == 0))
                        .unwrap();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let params = params.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    assert!(registry.is_enabled("geo", &params).unwrap());
                    assert!(registry.list(true).names.contains(&"existing".to_string()));
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }
    assert_eq!(registry.len(), 2 + 4 * 10);
}
