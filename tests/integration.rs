//! End-to-end session flows over an in-memory source and a real ledger
//! file: prefetch window movement, mark durability, undo compensation,
//! and session resume.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burstsift::config::Config;
use burstsift::controller::{Command, SiftController, SiftState};
use burstsift::error::SiftError;
use burstsift::ledger::DeletionLedger;
use burstsift::models::{CacheStatus, ImageRef, PixelBuffer, SourceKind};
use burstsift::progress::NoProgress;
use burstsift::source::ImageSource;

/// In-memory source with per-identifier fetch counting.
struct CountingSource {
    names: Vec<String>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl CountingSource {
    fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            fetches: Mutex::new(HashMap::new()),
        })
    }

    fn fetch_count(&self, identifier: &str) -> usize {
        *self.fetches.lock().unwrap().get(identifier).unwrap_or(&0)
    }
}

#[async_trait]
impl ImageSource for CountingSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn describe(&self) -> String {
        "in-memory test source".to_string()
    }

    async fn list(&self) -> Result<Vec<ImageRef>, SiftError> {
        Ok(self
            .names
            .iter()
            .enumerate()
            .map(|(ordinal, name)| ImageRef {
                identifier: name.clone(),
                ordinal,
                captured_at: None,
                product_url: None,
                download_url: None,
                kind: SourceKind::Local,
            })
            .collect())
    }

    async fn fetch(&self, image: &ImageRef) -> Result<PixelBuffer, SiftError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(image.identifier.clone())
            .or_insert(0) += 1;

        let mut data = Vec::with_capacity(8 * 8 * 3);
        for y in 0..8u32 {
            for x in 0..8u32 {
                let v = if (x + y) % 2 == 0 { 0 } else { 200 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Ok(PixelBuffer {
            width: 8,
            height: 8,
            data: Arc::new(data),
            content_hash: image.identifier.clone(),
        })
    }
}

fn session_config(dir: &std::path::Path) -> Config {
    toml::from_str(&format!(
        r#"
        [cache]
        window_radius = 1
        fetch_workers = 2
        fetch_retries = 0
        retry_backoff_ms = 1

        [ledger]
        path = "{}/ledger.sqlite"

        [source]
        kind = "local"
        "#,
        dir.display()
    ))
    .unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn full_session_flow() {
    let tmp = tempfile::tempdir().unwrap();
    let config = session_config(tmp.path());
    let source = CountingSource::new(&["img1", "img2", "img3"]);

    let mut controller = SiftController::new(
        Arc::clone(&source) as Arc<dyn ImageSource>,
        &config,
        Box::new(NoProgress),
    )
    .await
    .unwrap();

    // Start at cursor 0, radius 1: the window is {0, 1}.
    assert_eq!(controller.state(), SiftState::Browsing);
    wait_until(|| controller.image_at(0).is_ready() && controller.image_at(1).is_ready())
        .await;
    assert_eq!(source.fetch_count("img3"), 0);
    assert!(matches!(controller.image_at(2), CacheStatus::Absent));

    // Advance: window grows to {0, 1, 2}. img2 was already resident and
    // is reused without a refetch.
    controller.apply(Command::Advance).await.unwrap();
    assert_eq!(controller.cursor(), 1);
    wait_until(|| controller.image_at(2).is_ready()).await;
    assert_eq!(source.fetch_count("img1"), 1);
    assert_eq!(source.fetch_count("img2"), 1);
    assert_eq!(source.fetch_count("img3"), 1);

    // Mark img2: exactly one ledger record.
    controller.apply(Command::Mark).await.unwrap();
    assert!(controller.is_marked("img2"));
    let export = controller.export_marks().await.unwrap();
    assert_eq!(export.len(), 1);
    assert_eq!(export[0].identifier, "img2");

    // Jump back to 0: the window recenters to {0, 1} and img3's entry
    // is evicted.
    controller.apply(Command::JumpTo(0)).await.unwrap();
    assert_eq!(controller.cursor(), 0);
    wait_until(|| matches!(controller.image_at(2), CacheStatus::Absent)).await;

    // Undo the jump, then undo the mark. The mark set no longer
    // contains img2 and the ledger folds to empty: the compensating
    // tombstone superseded the mark without erasing history.
    controller.apply(Command::Undo).await.unwrap();
    assert_eq!(controller.cursor(), 1);
    controller.apply(Command::Undo).await.unwrap();
    assert!(!controller.is_marked("img2"));
    assert!(controller.export_marks().await.unwrap().is_empty());

    // And one more undo reverses the original advance.
    controller.apply(Command::Undo).await.unwrap();
    assert_eq!(controller.cursor(), 0);

    controller.close().await;
}

#[tokio::test]
async fn marks_survive_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let config = session_config(tmp.path());

    {
        let source = CountingSource::new(&["img1", "img2"]);
        let mut controller = SiftController::new(
            Arc::clone(&source) as Arc<dyn ImageSource>,
            &config,
            Box::new(NoProgress),
        )
        .await
        .unwrap();

        controller.apply(Command::Advance).await.unwrap();
        controller.apply(Command::Mark).await.unwrap();
        assert!(controller.is_marked("img2"));
        controller.close().await;
    }

    // A new session over the same ledger resumes the surviving marks.
    let source = CountingSource::new(&["img1", "img2"]);
    let controller = SiftController::new(
        Arc::clone(&source) as Arc<dyn ImageSource>,
        &config,
        Box::new(NoProgress),
    )
    .await
    .unwrap();

    assert!(controller.is_marked("img2"));
    assert!(!controller.is_marked("img1"));
    controller.close().await;
}

#[tokio::test]
async fn export_artifact_round_trips_through_ledger() {
    let tmp = tempfile::tempdir().unwrap();
    let config = session_config(tmp.path());
    let source = CountingSource::new(&["img1", "img2", "img3"]);

    let mut controller = SiftController::new(
        Arc::clone(&source) as Arc<dyn ImageSource>,
        &config,
        Box::new(NoProgress),
    )
    .await
    .unwrap();

    controller.apply(Command::Mark).await.unwrap();
    controller.apply(Command::Advance).await.unwrap();
    controller.apply(Command::Advance).await.unwrap();
    controller.apply(Command::Mark).await.unwrap();
    controller.close().await;

    // The artifact is readable through a fresh ledger handle, in
    // surviving-mark order.
    let ledger = DeletionLedger::open(&config.ledger.path).await.unwrap();
    let export = ledger.export().await.unwrap();
    let ids: Vec<&str> = export.iter().map(|e| e.identifier.as_str()).collect();
    assert_eq!(ids, vec!["img1", "img3"]);
    ledger.close().await;
}
