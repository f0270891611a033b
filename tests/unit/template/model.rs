use super::*;

const POSTCARD: &str = r##"{
    "id": "spring-promo",
    "canvas": { "width": 600, "height": 400 },
    "fields": [
        { "name": "first_name", "required": true },
        { "name": "store", "default": "our store" }
    ],
    "nodes": [
        { "id": "band", "type": "rect", "x": 0, "y": 0, "width": 600, "height": 80, "fill": "#1d3557" },
        { "id": "greet", "type": "text", "x": 20, "y": 120, "width": 560, "height": 40,
          "content": "Hi {{first_name}}, visit {{ store }}!", "font_size": 28 },
        { "id": "photo", "type": "image", "x": 400, "y": 200, "width": 180, "height": 180,
          "source": { "field": "photo" } }
    ]
}"##;

#[test]
fn parses_scene_graph_and_fields() {
    let t = Template::from_reader(POSTCARD.as_bytes()).unwrap();
    assert_eq!(t.id.as_str(), "spring-promo");
    assert_eq!(t.canvas, Canvas { width: 600, height: 400 });
    assert_eq!(t.background_color, Color::WHITE);
    assert_eq!(t.nodes.len(), 3);
    assert!(matches!(t.nodes[0].kind, NodeKind::Rect { .. }));
    assert!(t.field("first_name").unwrap().required);
    assert_eq!(
        t.field("store").unwrap().default.as_deref(),
        Some("our store")
    );
}

#[test]
fn referenced_fields_cover_placeholders_and_image_fields() {
    let t = Template::from_reader(POSTCARD.as_bytes()).unwrap();
    let names: Vec<String> = t.referenced_fields().into_iter().collect();
    assert_eq!(names, vec!["first_name", "photo", "store"]);
}

#[test]
fn duplicate_field_declarations_are_rejected() {
    let json = r#"{ "id": "t", "canvas": { "width": 1, "height": 1 },
        "fields": [ { "name": "a" }, { "name": "a" } ] }"#;
    let err = Template::from_reader(json.as_bytes()).unwrap_err();
    assert!(err.to_string().contains("twice"));
}

#[test]
fn zero_canvas_is_rejected() {
    let json = r#"{ "id": "t", "canvas": { "width": 0, "height": 10 } }"#;
    assert!(Template::from_reader(json.as_bytes()).is_err());
}

#[test]
fn placeholders_are_filled_and_unknown_names_vanish() {
    let mut fields = BTreeMap::new();
    fields.insert("name".to_owned(), "Ada".to_owned());
    assert_eq!(
        fill_placeholders("Dear {{ name }},{{missing}} hello", &fields),
        "Dear Ada, hello"
    );
    assert_eq!(fill_placeholders("no braces", &fields), "no braces");
    assert_eq!(fill_placeholders("open {{ name", &fields), "open {{ name");
}

#[test]
fn recipient_scalars_are_stringified_and_nulls_dropped() {
    let r: RecipientRecord =
        serde_json::from_str(r#"{ "name": "Ada", "zip": 94107, "vip": true, "note": null }"#)
            .unwrap();
    assert_eq!(r.get("name"), Some("Ada"));
    assert_eq!(r.get("zip"), Some("94107"));
    assert_eq!(r.get("vip"), Some("true"));
    assert_eq!(r.get("note"), None);
}

#[test]
fn recipient_nested_values_are_rejected() {
    assert!(serde_json::from_str::<RecipientRecord>(r#"{ "a": [1, 2] }"#).is_err());
}
