use super::*;

#[test]
fn display_prefixes_are_stable() {
    assert!(
        MailError::acquisition_timeout("x")
            .to_string()
            .contains("acquisition timeout:")
    );
    assert!(
        MailError::engine_fault("x")
            .to_string()
            .contains("engine fault:")
    );
    assert!(
        MailError::missing_required_field("zip")
            .to_string()
            .contains("missing required field: zip")
    );
    assert!(
        MailError::unknown_format("x")
            .to_string()
            .contains("unknown format:")
    );
    assert!(
        MailError::validation("x")
            .to_string()
            .contains("validation error:")
    );
}

#[test]
fn other_preserves_source() {
    let base = std::io::Error::other("boom");
    let err = MailError::Other(anyhow::Error::new(base));
    assert!(err.to_string().contains("boom"));
    assert_eq!(err.kind(), ErrorKind::EngineFault);
}

#[test]
fn kinds_separate_data_problems_from_capacity_problems() {
    assert!(MailError::acquisition_timeout("x").kind().is_retryable_class());
    assert!(MailError::render_timeout("x").kind().is_retryable_class());
    assert!(
        !MailError::missing_required_field("x")
            .kind()
            .is_retryable_class()
    );
    assert!(!MailError::image_too_small("x").kind().is_retryable_class());
}

#[test]
fn only_engine_level_failures_poison_the_surface() {
    assert!(MailError::engine_fault("x").poisons_surface());
    assert!(MailError::render_timeout("x").poisons_surface());
    assert!(!MailError::missing_required_field("x").poisons_surface());
    assert!(!MailError::acquisition_timeout("x").poisons_surface());
}

#[test]
fn error_kind_serializes_snake_case() {
    let s = serde_json::to_string(&ErrorKind::MissingRequiredField).unwrap();
    assert_eq!(s, "\"missing_required_field\"");
}
