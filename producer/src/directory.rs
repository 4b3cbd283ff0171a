use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};

use crate::relay::RelayLink;
use crate::ProducerError;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Image files in `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, ProducerError> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| ProducerError::Io(dir.display().to_string(), e))?;

    let mut images: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        IMAGE_EXTENSIONS
                            .iter()
                            .any(|known| ext.eq_ignore_ascii_case(known))
                    })
        })
        .collect();
    images.sort();
    Ok(images)
}

/// Replay a directory of still images in a loop, one per tick. Stands in
/// for a camera when testing a relay deployment.
pub async fn run_directory_producer(
    dir: &Path,
    link: &mut RelayLink,
    interval: Duration,
) -> Result<(), ProducerError> {
    let images = list_images(dir)?;
    if images.is_empty() {
        return Err(ProducerError::EmptyDirectory(dir.display().to_string()));
    }
    info!(dir = %dir.display(), count = images.len(), "replaying images");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    for path in images.iter().cycle() {
        ticker.tick().await;
        match tokio::fs::read(path).await {
            Ok(data) => link.forward_or_drop(Bytes::from(data)).await,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read image, skipping"),
        }
    }

    Ok(())
}
