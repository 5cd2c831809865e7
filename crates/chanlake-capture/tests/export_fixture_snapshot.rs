use std::path::Path;

use chanlake_capture::{CaptureContext, CaptureSource, ExportDirSource};

#[tokio::test]
async fn export_fixture_parses_with_photo_attached() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/capture");
    assert!(root.join("chemedapp.json").exists());
    assert!(root.join("expected_units.json").exists());

    let source = ExportDirSource::new(&root);
    let messages = source
        .fetch_channel(&CaptureContext::now(), "chemedapp")
        .await
        .expect("fixture export");

    let ids: Vec<_> = messages.iter().map(|m| m.record_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    let with_photo: Vec<_> = messages
        .iter()
        .filter(|m| m.photo.is_some())
        .map(|m| m.record_id.as_str())
        .collect();
    assert_eq!(with_photo, vec!["2"]);
}
