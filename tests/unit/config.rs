use super::*;

#[test]
fn empty_object_yields_defaults() {
    let cfg = EngineConfig::from_reader("{}".as_bytes()).unwrap();
    assert_eq!(cfg, EngineConfig::default());
    assert_eq!(cfg.pool.max_surfaces, 4);
    assert_eq!(cfg.timeouts.render(), Duration::from_millis(20_000));
}

#[test]
fn partial_sections_merge_with_defaults() {
    let cfg = EngineConfig::from_reader(
        r#"{ "pool": { "max_surfaces": 2 }, "retry": { "backoff_ms": 50 } }"#.as_bytes(),
    )
    .unwrap();
    assert_eq!(cfg.pool.max_surfaces, 2);
    assert_eq!(cfg.pool.drain_timeout_ms, 10_000);
    assert_eq!(cfg.retry.backoff(), Duration::from_millis(50));
    assert!(cfg.retry.prefer_different_surface);
}

#[test]
fn unknown_keys_are_rejected() {
    let err = EngineConfig::from_reader(r#"{ "pool": { "size": 2 } }"#.as_bytes()).unwrap_err();
    assert!(err.to_string().contains("serialization error:"));
}

#[test]
fn zero_surfaces_fails_validation() {
    let err = EngineConfig::from_reader(r#"{ "pool": { "max_surfaces": 0 } }"#.as_bytes())
        .unwrap_err();
    assert!(err.to_string().contains("max_surfaces"));
}

#[test]
fn upscale_floor_below_one_fails_validation() {
    let mut cfg = EngineConfig::default();
    cfg.assembly.max_upscale = 0.5;
    assert!(cfg.validate().is_err());
}
