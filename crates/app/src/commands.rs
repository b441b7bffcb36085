use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use trapex_camera::{CaptureSession, SessionOptions, StillImageCamera};
use trapex_core::{Facing, NormalizedImage, ScanConfig};
use trapex_ocr::{compress, engine_from_config, ContentDigest, TextRecognitionClient};
use trapex_scanner::{ScanState, ScanningController, StateStream};

use crate::{watcher, AppState, OutputFormat};

/// Time given to a new intake file to finish being written.
const INTAKE_SETTLE: Duration = Duration::from_millis(250);

/// How many recently scanned receipts the intake loop remembers.
const RECENT_RECEIPTS: usize = 512;

#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub source: PathBuf,
    pub captured_at: DateTime<Utc>,
    pub facing: Facing,
    #[serde(flatten)]
    pub outcome: ScanState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<PathBuf>,
}

impl ScanReport {
    fn new(source: PathBuf, facing: Facing, outcome: ScanState) -> Self {
        Self { source, captured_at: Utc::now(), facing, outcome, attachment: None }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ScanState::Succeeded { .. })
    }

    pub fn render(&self, format: OutputFormat) -> anyhow::Result<String> {
        Ok(match format {
            OutputFormat::Json => serde_json::to_string_pretty(self)?,
            OutputFormat::Text => match &self.outcome {
                ScanState::Succeeded { text } => text.clone(),
                ScanState::Failed { reason } => format!("Error: {reason}"),
                other => format!("Scan ended in unexpected state: {}", other.kind()),
            },
        })
    }
}

async fn build_controller(
    config: &ScanConfig,
    camera: StillImageCamera,
    facing: Facing,
) -> anyhow::Result<ScanningController> {
    let session = CaptureSession::open(
        Arc::new(camera),
        facing,
        SessionOptions { capture_timeout: config.camera.capture_timeout() },
    )
    .await
    .context("Failed to open camera")?;

    let engine = engine_from_config(&config.ocr).context("Failed to start OCR engine")?;
    let recognizer =
        TextRecognitionClient::new(engine).with_timeout(config.ocr.recognition_timeout());
    Ok(ScanningController::new(session, recognizer))
}

fn still_camera(config: &ScanConfig) -> StillImageCamera {
    StillImageCamera::new(&[Facing::Back, Facing::Front], config.camera.sensor_rotation)
}

/// Print progress the way a viewfinder overlay would show it.
fn spawn_progress(mut stream: StateStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(transition) = stream.next().await {
            match transition.state {
                ScanState::Capturing => eprintln!("Capturing receipt..."),
                ScanState::Processing => eprintln!("Processing receipt..."),
                _ => {}
            }
        }
    })
}

fn print_report(report: &ScanReport, format: OutputFormat) -> anyhow::Result<()> {
    let rendered = report.render(format)?;
    if format == OutputFormat::Text && !report.succeeded() {
        eprintln!("{rendered}");
    } else {
        println!("{rendered}");
    }
    Ok(())
}

/// Compress the image a scan was read from and store it in the archive.
async fn export_image(state: &AppState, image: NormalizedImage) -> anyhow::Result<PathBuf> {
    let quality = state.config.export.jpeg_quality;
    let jpeg = tokio::task::spawn_blocking(move || compress(&image, quality)).await??;
    let stored = state.archive.store(&jpeg, "jpg").await?;
    Ok(stored.path)
}

/// One-shot scan of `image`. Returns whether the attempt succeeded.
pub async fn scan(
    state: &AppState,
    image: &Path,
    facing: Facing,
    output: OutputFormat,
    export: bool,
) -> anyhow::Result<bool> {
    let camera = still_camera(&state.config);
    camera.enqueue(image);
    let controller = build_controller(&state.config, camera, facing).await?;

    let progress = (output == OutputFormat::Text).then(|| spawn_progress(controller.subscribe()));
    let outcome = controller.start_capture()?.await;
    let upright = controller.take_image();
    controller.close();
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    let outcome = outcome.context("Scan attempt was aborted")?;
    let mut report = ScanReport::new(image.to_path_buf(), facing, outcome);
    if let (true, Some(upright)) = (export, upright) {
        report.attachment = Some(export_image(state, upright).await?);
    }

    print_report(&report, output)?;
    Ok(report.succeeded())
}

/// Digests of recently scanned receipts. The oldest is forgotten first once
/// the limit is reached.
struct RecentReceipts {
    order: VecDeque<ContentDigest>,
    known: HashSet<ContentDigest>,
    limit: usize,
}

impl RecentReceipts {
    fn new(limit: usize) -> Self {
        Self { order: VecDeque::new(), known: HashSet::new(), limit }
    }

    fn contains(&self, digest: &ContentDigest) -> bool {
        self.known.contains(digest)
    }

    fn remember(&mut self, digest: ContentDigest) {
        if !self.known.insert(digest) {
            return;
        }
        self.order.push_back(digest);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.known.remove(&oldest);
            }
        }
    }
}

/// Watch-folder scanning state: one controller fed by a file-backed camera.
struct Intake {
    controller: ScanningController,
    camera: StillImageCamera,
    recent: RecentReceipts,
    settle: Duration,
}

impl Intake {
    fn new(controller: ScanningController, camera: StillImageCamera) -> Self {
        Self {
            controller,
            camera,
            recent: RecentReceipts::new(RECENT_RECEIPTS),
            settle: INTAKE_SETTLE,
        }
    }

    /// Scan one intake file. `None` when it was skipped. Only a successful
    /// scan marks the content as seen, so a failed receipt can be dropped in
    /// again.
    async fn scan_file(&mut self, path: PathBuf) -> anyhow::Result<Option<ScanReport>> {
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping {}: {e}", path.display());
                return Ok(None);
            }
        };
        let digest = ContentDigest::of(&bytes);
        if self.recent.contains(&digest) {
            info!("Skipping duplicate receipt: {}", path.display());
            return Ok(None);
        }

        self.camera.enqueue(&path);
        let outcome = self.controller.start_capture()?.await;
        self.controller.reset();

        let Some(outcome) = outcome else {
            return Ok(None);
        };
        let report = ScanReport::new(path, self.controller.facing(), outcome);
        if report.succeeded() {
            self.recent.remember(digest);
        }
        Ok(Some(report))
    }

    /// Scan paths from `rx` until it closes or `shutdown` resolves, which is
    /// honoured in the middle of a scan too.
    async fn run(
        &mut self,
        rx: &mut mpsc::Receiver<PathBuf>,
        shutdown: impl Future<Output = ()>,
        mut on_report: impl FnMut(ScanReport) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        loop {
            let path = tokio::select! {
                biased;
                _ = &mut shutdown => return Ok(()),
                next = rx.recv() => match next {
                    Some(path) => path,
                    None => return Ok(()),
                },
            };

            let settle = self.settle;
            let work = async {
                tokio::time::sleep(settle).await;
                self.scan_file(path).await
            };
            let scanned = tokio::select! {
                biased;
                _ = &mut shutdown => return Ok(()),
                scanned = work => scanned?,
            };
            if let Some(report) = scanned {
                on_report(report)?;
            }
        }
    }

    fn close(&self) {
        self.controller.close();
    }
}

/// Scan every image that lands in `intake` until interrupted.
pub async fn watch(state: &AppState, intake: &Path, output: OutputFormat) -> anyhow::Result<()> {
    std::fs::create_dir_all(intake)
        .with_context(|| format!("Failed to create intake directory {}", intake.display()))?;

    // The channel bridges the notify watcher thread and the async scan loop.
    let (tx, mut rx) = mpsc::channel::<PathBuf>(64);
    let _watcher = watcher::spawn_intake_watcher(intake, tx)
        .context("Failed to start intake folder watcher")?;

    let camera = still_camera(&state.config);
    let facing = state.config.camera.facing;
    let controller = build_controller(&state.config, camera.clone(), facing).await?;
    let mut scanner = Intake::new(controller, camera);

    info!("Watching intake folder: {}", intake.display());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    let result = scanner.run(&mut rx, shutdown, |report| print_report(&report, output)).await;

    scanner.close();
    info!("Stopped watching {}", intake.display());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
    use trapex_ocr::ReceiptArchive;
    use trapex_scanner::{FailureReason, StateKind};

    fn app_state(dir: &Path, mock_text: &str) -> AppState {
        let mut config = ScanConfig::default();
        config.ocr.mock_text = mock_text.to_string();
        config.camera.capture_timeout_ms = 2_000;
        AppState {
            config,
            data_dir: dir.to_path_buf(),
            archive: ReceiptArchive::new(dir.join("attachments")),
        }
    }

    fn write_receipt(path: &Path, shade: u8) {
        let img: RgbImage = ImageBuffer::from_fn(10, 6, |x, _| Rgb([(x * 20) as u8, shade, 0]));
        DynamicImage::ImageRgb8(img).save(path).unwrap();
    }

    async fn intake(state: &AppState) -> Intake {
        let camera = still_camera(&state.config);
        let controller = build_controller(&state.config, camera.clone(), Facing::Back).await.unwrap();
        let mut intake = Intake::new(controller, camera);
        intake.settle = Duration::ZERO;
        intake
    }

    fn report(outcome: ScanState) -> ScanReport {
        ScanReport::new(PathBuf::from("/intake/r.jpg"), Facing::Back, outcome)
    }

    fn archived_files(root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for shard in std::fs::read_dir(root).unwrap() {
            for entry in std::fs::read_dir(shard.unwrap().path()).unwrap() {
                files.push(entry.unwrap().path());
            }
        }
        files
    }

    #[test]
    fn text_render_shows_text_or_error() {
        let ok = report(ScanState::Succeeded { text: "TOTAL $12.34".into() });
        assert_eq!(ok.render(OutputFormat::Text).unwrap(), "TOTAL $12.34");

        let reason = FailureReason::Capture("timed out".into());
        let failed = report(ScanState::Failed { reason });
        assert_eq!(failed.render(OutputFormat::Text).unwrap(), "Error: capture: timed out");
    }

    #[test]
    fn json_render_flattens_state() {
        let ok = report(ScanState::Succeeded { text: "hi".into() });
        let value: serde_json::Value =
            serde_json::from_str(&ok.render(OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(value["state"], "succeeded");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["facing"], "back");
        assert!(value["captured_at"].is_string());
        assert!(value.get("attachment").is_none());
    }

    #[tokio::test]
    async fn scan_exports_the_upright_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("receipt.png");
        write_receipt(&image, 0);
        let state = app_state(dir.path(), "TOTAL $12.34");

        let ok = scan(&state, &image, Facing::Front, OutputFormat::Json, true).await.unwrap();
        assert!(ok);

        let files = archived_files(&dir.path().join("attachments"));
        assert_eq!(files.len(), 1);
        // The 10x6 front-camera source is archived after rotation.
        let exported = image::open(&files[0]).unwrap();
        assert_eq!((exported.width(), exported.height()), (6, 10));
    }

    #[tokio::test]
    async fn scan_of_unreadable_image_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("broken.jpg");
        std::fs::write(&image, b"garbage").unwrap();
        let state = app_state(dir.path(), "unused");

        let ok = scan(&state, &image, Facing::Back, OutputFormat::Text, true).await.unwrap();
        assert!(!ok);
        assert!(!dir.path().join("attachments").exists());
    }

    #[test]
    fn recent_receipts_forget_the_oldest() {
        let (a, b, c) = (ContentDigest::of(b"a"), ContentDigest::of(b"b"), ContentDigest::of(b"c"));
        let mut recent = RecentReceipts::new(2);
        recent.remember(a);
        recent.remember(b);
        recent.remember(b);
        assert!(recent.contains(&a));

        recent.remember(c);
        assert!(!recent.contains(&a));
        assert!(recent.contains(&b));
        assert!(recent.contains(&c));
    }

    #[tokio::test]
    async fn failed_intake_file_can_be_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "TOTAL");
        let mut intake = intake(&state).await;

        let broken = dir.path().join("broken.jpg");
        std::fs::write(&broken, b"not an image").unwrap();
        let first = intake.scan_file(broken.clone()).await.unwrap().unwrap();
        assert_eq!(first.outcome.kind(), StateKind::Failed);

        let retry = intake.scan_file(broken).await.unwrap().unwrap();
        assert!(!retry.succeeded());
        assert_eq!(intake.controller.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn scanned_intake_content_is_skipped_next_time() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "TOTAL");
        let mut intake = intake(&state).await;

        let original = dir.path().join("a.png");
        write_receipt(&original, 40);
        let copy = dir.path().join("a-copy.png");
        std::fs::copy(&original, &copy).unwrap();

        let first = intake.scan_file(original).await.unwrap().unwrap();
        assert_eq!(first.outcome, ScanState::Succeeded { text: "TOTAL".into() });
        assert!(intake.scan_file(copy).await.unwrap().is_none());
        assert!(intake.scan_file(dir.path().join("vanished.png")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn intake_loop_scans_queued_paths_until_the_queue_closes() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "LINE");
        let mut intake = intake(&state).await;

        let (tx, mut rx) = mpsc::channel(4);
        for (name, shade) in [("one.png", 1), ("two.png", 2)] {
            let path = dir.path().join(name);
            write_receipt(&path, shade);
            tx.send(path).await.unwrap();
        }
        drop(tx);

        let mut reports = Vec::new();
        intake
            .run(&mut rx, std::future::pending(), |report| {
                reports.push(report);
                Ok(())
            })
            .await
            .unwrap();

        let sources: Vec<_> = reports.iter().map(|r| r.source.clone()).collect();
        assert_eq!(sources, vec![dir.path().join("one.png"), dir.path().join("two.png")]);
        assert!(reports.iter().all(ScanReport::succeeded));
    }

    #[tokio::test]
    async fn intake_loop_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "LINE");
        let mut intake = intake(&state).await;

        let (tx, mut rx) = mpsc::channel(4);
        let path = dir.path().join("late.png");
        write_receipt(&path, 5);
        tx.send(path).await.unwrap();

        let mut reports = 0;
        intake
            .run(&mut rx, std::future::ready(()), |_| {
                reports += 1;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(reports, 0);
        assert!(rx.try_recv().is_ok());
        intake.close();
        assert!(intake.controller.is_closed());
    }

    #[tokio::test]
    async fn intake_loop_stops_on_shutdown_mid_scan() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), "LINE");
        let mut intake = intake(&state).await;
        intake.settle = Duration::from_secs(60);

        let (tx, mut rx) = mpsc::channel(4);
        let path = dir.path().join("slow.png");
        write_receipt(&path, 7);
        tx.send(path).await.unwrap();

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        let mut reports = 0;
        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            intake.run(&mut rx, shutdown, |_| {
                reports += 1;
                Ok(())
            }),
        )
        .await;

        assert!(matches!(stopped, Ok(Ok(()))));
        assert_eq!(reports, 0);
        assert!(rx.try_recv().is_err());
    }
}
