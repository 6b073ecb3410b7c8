use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use assert_matches::assert_matches;

use kira_image_downloader::app::{ProgressEvent, ProgressSink};
use kira_image_downloader::domain::{Color, DownloadTask, FailureRecord};
use kira_image_downloader::download::{
    CopyFetcher, FakeDownloader, Fetcher, HttpFetcher, ImageDownloader, PoolDownloader,
    SkipExisting,
};
use kira_image_downloader::error::ImageDownloaderError;

struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Writes the source string into the destination and counts calls.
#[derive(Default)]
struct WritingFetcher {
    calls: Arc<AtomicUsize>,
}

impl Fetcher for WritingFetcher {
    fn fetch(&self, task: &DownloadTask) -> Result<Option<FailureRecord>, ImageDownloaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::write(&task.destination, task.source.as_bytes())
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        Ok(None)
    }

    fn describe(&self) -> String {
        "writing".to_string()
    }
}

fn channel_tasks(root: &Path, names: &[&str], source_dir: &Path) -> Vec<DownloadTask> {
    let mut tasks = Vec::new();
    for name in names {
        for color in Color::ALL {
            let dir = root.join(color.as_str());
            fs::create_dir_all(&dir).unwrap();
            tasks.push(DownloadTask::new(
                source_dir
                    .join(format!("{name}{color}.jpg"))
                    .to_string_lossy()
                    .to_string(),
                dir.join(format!("{name}{color}.jpg")),
            ));
        }
    }
    tasks
}

#[test]
fn skip_existing_makes_second_run_free() {
    let temp = tempfile::tempdir().unwrap();
    let tasks = channel_tasks(temp.path(), &["1_A1_1_", "1_A1_2_"], Path::new("/remote"));

    let pool = PoolDownloader::new(SkipExisting::new(WritingFetcher::default()), 3);
    assert!(pool.download_images(tasks.clone(), &NoopSink).unwrap().is_empty());
    let first: Vec<Vec<u8>> = tasks
        .iter()
        .map(|task| fs::read(&task.destination).unwrap())
        .collect();

    let counter = WritingFetcher::default();
    let calls = counter.calls.clone();
    let second_pool = PoolDownloader::new(SkipExisting::new(counter), 3);
    assert!(second_pool.download_images(tasks.clone(), &NoopSink).unwrap().is_empty());
    let second: Vec<Vec<u8>> = tasks
        .iter()
        .map(|task| fs::read(&task.destination).unwrap())
        .collect();
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(second_pool.describe().contains("skip existing"));
}

#[test]
fn skip_existing_refetches_empty_files() {
    let temp = tempfile::tempdir().unwrap();
    let task = DownloadTask::new("payload", temp.path().join("1_A1_1_red.jpg"));
    fs::write(&task.destination, b"").unwrap();

    let inner = WritingFetcher::default();
    let calls = inner.calls.clone();
    let fetcher = SkipExisting::new(inner);
    assert_eq!(fetcher.fetch(&task).unwrap(), None);
    assert_eq!(fs::read(&task.destination).unwrap(), b"payload");
    assert_eq!(fetcher.fetch(&task).unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn fake_downloader_copies_first_sample() {
    let source = tempfile::tempdir().unwrap();
    for color in Color::ALL {
        fs::write(
            source.path().join(format!("1_A1_1_{color}.jpg")),
            color.as_str().as_bytes(),
        )
        .unwrap();
    }
    let out = tempfile::tempdir().unwrap();
    let tasks = channel_tasks(
        out.path(),
        &["1_A1_1_", "1_A1_2_", "2_B3_1_"],
        source.path(),
    );

    let downloader = FakeDownloader::new(CopyFetcher);
    let failures = downloader.download_images(tasks.clone(), &NoopSink).unwrap();
    assert!(failures.is_empty());
    for task in &tasks {
        let channel = task
            .destination
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .unwrap()
            .to_string();
        assert_eq!(fs::read_to_string(&task.destination).unwrap(), channel);
    }
}

#[test]
fn fake_downloader_handles_multi_dot_suffix() {
    let source = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut tasks = Vec::new();
    for name in ["1_A1_1_", "1_A1_2_"] {
        for color in Color::ALL {
            let file = format!("{name}{color}.ome.tif");
            fs::write(source.path().join(&file), color.as_str().as_bytes()).unwrap();
            let dir = out.path().join(color.as_str());
            fs::create_dir_all(&dir).unwrap();
            tasks.push(DownloadTask::new(
                source.path().join(&file).to_string_lossy().to_string(),
                dir.join(&file),
            ));
        }
    }

    let failures = FakeDownloader::new(CopyFetcher)
        .download_images(tasks.clone(), &NoopSink)
        .unwrap();
    assert!(failures.is_empty());
    assert_eq!(
        fs::read_to_string(out.path().join("yellow").join("1_A1_2_yellow.ome.tif")).unwrap(),
        "yellow"
    );
}

#[test]
fn fake_downloader_fails_when_first_sample_is_missing() {
    let source = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let tasks = channel_tasks(out.path(), &["1_A1_1_", "1_A1_2_"], source.path());
    let err = FakeDownloader::new(CopyFetcher)
        .download_images(tasks, &NoopSink)
        .unwrap_err();
    assert_matches!(err, ImageDownloaderError::FakeDownload(_));
}

#[test]
fn copy_fetcher_copies_existing_source() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("src.jpg");
    fs::write(&source, b"jpeg").unwrap();
    let task = DownloadTask::new(
        source.to_string_lossy().to_string(),
        temp.path().join("red").join("1_A1_1_red.jpg"),
    );
    assert_eq!(CopyFetcher.fetch(&task).unwrap(), None);
    assert_eq!(fs::read(&task.destination).unwrap(), b"jpeg");
}

/// Serves `connections` requests: `/ok*` gets 200 with the path as body,
/// anything else 404.
fn serve(connections: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming().take(connections) {
            let mut stream = stream.unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut header = String::new();
                let read = reader.read_line(&mut header).unwrap();
                if read == 0 || header == "\r\n" {
                    break;
                }
            }
            let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
            let (status, body) = if path.starts_with("/ok") {
                ("200 OK", path)
            } else {
                ("404 Not Found", "no such image".to_string())
            };
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            stream.flush().unwrap();
        }
    });
    format!("http://{address}")
}

#[test]
fn http_fetcher_reports_status_failures() {
    let base = serve(2);
    let client = reqwest::blocking::Client::builder()
        .no_proxy()
        .build()
        .unwrap();
    let pool = PoolDownloader::new(HttpFetcher::with_client(client), 1);

    let temp = tempfile::tempdir().unwrap();
    let found = temp.path().join("1_A1_1_blue.jpg");
    let missing = temp.path().join("1_A1_1_red.jpg");
    let tasks = vec![
        DownloadTask::new(format!("{base}/ok/1_A1_1_blue.jpg"), found.clone()),
        DownloadTask::new(format!("{base}/gone/1_A1_1_red.jpg"), missing.clone()),
    ];

    let failures = pool.download_images(tasks, &NoopSink).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].status, 404);
    assert_eq!(failures[0].message, "no such image");
    assert_eq!(failures[0].task.destination, missing);
    assert!(!missing.exists());

    assert_eq!(fs::read_to_string(&found).unwrap(), "/ok/1_A1_1_blue.jpg");
    let partial = PathBuf::from(format!("{}.part", found.display()));
    assert!(!partial.exists());
}

#[test]
fn http_transport_error_aborts() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let client = reqwest::blocking::Client::builder()
        .no_proxy()
        .build()
        .unwrap();
    let temp = tempfile::tempdir().unwrap();
    let task = DownloadTask::new(
        format!("http://{address}/ok.jpg"),
        temp.path().join("1_A1_1_blue.jpg"),
    );
    let err = HttpFetcher::with_client(client).fetch(&task).unwrap_err();
    assert_matches!(err, ImageDownloaderError::DownloadHttp(_));
}

#[test]
#[ignore]
fn http_fetcher_downloads_atlas_image() {
    let temp = tempfile::tempdir().unwrap();
    let task = DownloadTask::new(
        "https://images.proteinatlas.org/992/1_A1_1_red.jpg",
        temp.path().join("1_A1_1_red.jpg"),
    );
    let fetcher = HttpFetcher::new(None).unwrap();
    assert_eq!(fetcher.fetch(&task).unwrap(), None);
    assert!(fs::metadata(&task.destination).unwrap().len() > 0);
}
