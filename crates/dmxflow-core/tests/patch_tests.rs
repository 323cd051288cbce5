use dmxflow_core::{PatchMap, UniversePatch, PLUGIN_NONE};

#[test]
fn test_unpatched_plugin_serializes_as_sentinel() {
    let map = PatchMap::new(2);
    let json = serde_json::to_string(&map).unwrap();

    assert_eq!(json.matches(&format!("\"{}\"", PLUGIN_NONE)).count(), 2);
}

#[test]
fn test_patch_json_roundtrip() {
    let mut map = PatchMap::new(3);
    map.set(0, Some("USB DMX Output"), Some(1)).unwrap();

    let json = serde_json::to_string_pretty(&map).unwrap();
    let restored: PatchMap = serde_json::from_str(&json).unwrap();

    assert_eq!(map, restored);
    assert_eq!(restored.get(1), Some(&UniversePatch::unpatched(1)));
}

#[test]
fn test_patch_ron_roundtrip() {
    let mut map = PatchMap::new(2);
    map.set(1, Some("USB DMX Output"), Some(0)).unwrap();

    let text = ron::ser::to_string_pretty(&map, ron::ser::PrettyConfig::default()).unwrap();
    assert!(text.contains("\"None\""));

    let restored: PatchMap = ron::from_str(&text).unwrap();
    assert_eq!(map, restored);
}

#[test]
fn test_sentinel_reads_back_as_unpatched() {
    let json = r#"{"universe":0,"plugin":"None","output":2}"#;
    let patch: UniversePatch = serde_json::from_str(json).unwrap();

    assert_eq!(patch.plugin, None);
    assert!(!patch.is_patched());
}
