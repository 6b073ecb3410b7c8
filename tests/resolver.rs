use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;

use kira_image_downloader::app::{ProgressEvent, ProgressSink};
use kira_image_downloader::atlas::{
    AtlasReader, IndexSampleQuery, LineSource, samples_from_index,
};
use kira_image_downloader::domain::{Color, Sample};
use kira_image_downloader::error::ImageDownloaderError;
use kira_image_downloader::resolver::{
    ImageSourceResolver, ImageTasks, IndexScanResolver, LinkPrefixResolver, LocalCopyResolver,
};
use kira_image_downloader::store::OutputStore;

struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<proteinAtlas>
  <entry>
    <antibody id="HPA000992">
      <imageUrl>http://images.proteinatlas.org/992/1_A1_1_blue_red_green.jpg</imageUrl>
      <imageUrl>http://images.proteinatlas.org/992/1_A1_1_red.jpg</imageUrl>
      <imageUrl>http://images.proteinatlas.org/992/7_H9_3_cr57a_blue_red_green.jpg</imageUrl>
    </antibody>
  </entry>
</proteinAtlas>
"#;

fn sample(plate: &str, position: &str, index: &str, linkprefix: Option<&str>) -> Sample {
    Sample {
        filename: format!("{plate}_{position}_{index}_"),
        if_plate_id: plate.to_string(),
        position: position.to_string(),
        sample: index.to_string(),
        status: "35".to_string(),
        locations: String::new(),
        antibody: "HPA000992".to_string(),
        ensembl_ids: "ENSG00000066455".to_string(),
        gene_names: "GOLGA5".to_string(),
        linkprefix: linkprefix.map(str::to_string),
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

fn store() -> OutputStore {
    OutputStore::new(Utf8PathBuf::from("/data/run"))
}

fn write_gz(path: &Path, content: &str) {
    let mut encoder = GzEncoder::new(std::fs::File::create(path).unwrap(), Compression::fast());
    encoder.write_all(content.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

fn gz_bytes(content: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(content.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Answers one request: `/proteinatlas.xml.gz` with `body`, anything else 404.
fn serve_index(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
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
        let path = request_line.split_whitespace().nth(1).unwrap_or("/");
        let (status, body) = if path.starts_with("/proteinatlas.xml.gz") {
            ("200 OK", body)
        } else {
            ("404 Not Found", b"no index here".to_vec())
        };
        write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .unwrap();
        stream.write_all(&body).unwrap();
        stream.flush().unwrap();
    });
    format!("http://{address}")
}

fn local_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .no_proxy()
        .build()
        .unwrap()
}

#[test]
fn index_url_is_fetched_into_workdir() {
    let body = gz_bytes(INDEX);
    let base = serve_index(body.clone());
    let workdir = tempfile::tempdir().unwrap();
    let reader = AtlasReader::with_client(
        format!("{base}/proteinatlas.xml.gz?format=gz"),
        workdir.path(),
        local_client(),
    );
    let mut resolver = IndexScanResolver::new(Box::new(reader));
    let samples = vec![sample("1", "A1", "1", None), sample("7", "H9", "3", None)];
    let sink = RecordingSink::default();
    resolver.prepare(&samples, &sink).unwrap();

    assert_eq!(resolver.url_count(), 2);
    let fetched = workdir.path().join("proteinatlas.xml.gz");
    assert_eq!(std::fs::read(&fetched).unwrap(), body);
    assert_eq!(
        resolver.base_source(&samples[1]).as_deref(),
        Some("http://images.proteinatlas.org/992/7_H9_3_cr57a_blue_red_green.jpg")
    );
    let messages = sink.messages.lock().unwrap();
    assert!(
        messages
            .iter()
            .any(|message| message.starts_with("phase=Resolve; fetching image index"))
    );
}

#[test]
fn index_url_error_status_is_reported() {
    let base = serve_index(Vec::new());
    let workdir = tempfile::tempdir().unwrap();
    let reader = AtlasReader::with_client(
        format!("{base}/moved/atlas.xml.gz"),
        workdir.path(),
        local_client(),
    );
    let mut resolver = IndexScanResolver::new(Box::new(reader));
    let err = resolver
        .prepare(&[sample("1", "A1", "1", None)], &NoopSink)
        .unwrap_err();
    assert_matches!(
        err,
        ImageDownloaderError::IndexStatus { status: 404, ref message } if message == "no index here"
    );
    assert!(!workdir.path().join("atlas.xml.gz").exists());
}

#[test]
fn index_scan_yields_four_tasks_or_none() {
    let temp = tempfile::tempdir().unwrap();
    let index = temp.path().join("proteinatlas.xml.gz");
    write_gz(&index, INDEX);

    let reader = AtlasReader::new(index.to_string_lossy().to_string(), temp.path()).unwrap();
    let mut resolver = IndexScanResolver::new(Box::new(reader));
    let samples = vec![
        sample("1", "A1", "1", None),
        sample("1", "A1", "2", None),
        sample("7", "H9", "3", None),
    ];
    resolver.prepare(&samples, &NoopSink).unwrap();
    assert_eq!(resolver.url_count(), 2);

    let store = store();
    let mut generator = ImageTasks::new(&resolver, &samples, &store, ".jpg");
    let tasks: Vec<_> = generator.by_ref().collect();
    assert_eq!(tasks.len(), 8);
    assert_eq!(generator.skipped(), 1);

    let sources: Vec<&str> = tasks[..4].iter().map(|task| task.source.as_str()).collect();
    assert_eq!(
        sources,
        vec![
            "http://images.proteinatlas.org/992/1_A1_1_red.jpg",
            "http://images.proteinatlas.org/992/1_A1_1_green.jpg",
            "http://images.proteinatlas.org/992/1_A1_1_blue.jpg",
            "http://images.proteinatlas.org/992/1_A1_1_yellow.jpg",
        ]
    );
    assert_eq!(
        tasks[4].source,
        "http://images.proteinatlas.org/992/7_H9_3_cr57a_red.jpg"
    );
    for (task, color) in tasks.iter().zip(Color::ALL.iter().cycle()) {
        let dir = store.color_dir(*color).into_std_path_buf();
        assert_eq!(task.destination.parent(), Some(dir.as_path()));
    }
    assert_eq!(
        tasks[7].destination,
        PathBuf::from("/data/run/yellow/7_H9_3_yellow.jpg")
    );
}

#[test]
fn plain_index_file_is_read_too() {
    let temp = tempfile::tempdir().unwrap();
    let index = temp.path().join("proteinatlas.xml");
    std::fs::write(&index, INDEX).unwrap();

    let reader = AtlasReader::new(index.to_string_lossy().to_string(), temp.path()).unwrap();
    let lines: Vec<String> = reader
        .open(&NoopSink)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(lines.len(), INDEX.lines().count());
}

#[test]
fn missing_index_is_unavailable() {
    let temp = tempfile::tempdir().unwrap();
    let reader = AtlasReader::new(
        temp.path().join("nope.xml.gz").to_string_lossy().to_string(),
        temp.path(),
    )
    .unwrap();
    let mut resolver = IndexScanResolver::new(Box::new(reader));
    let err = resolver
        .prepare(&[sample("1", "A1", "1", None)], &NoopSink)
        .unwrap_err();
    assert_matches!(err, ImageDownloaderError::SourceUnavailable(_));
}

#[test]
fn link_prefix_resolves_only_linked_samples() {
    let samples = vec![
        sample("1", "A1", "1", Some("https://images.proteinatlas.org/992/1_A1_1_")),
        sample("1", "A1", "2", Some("  ")),
    ];
    let mut resolver = LinkPrefixResolver::new();
    resolver.prepare(&samples, &NoopSink).unwrap();

    let store = store();
    let mut generator = ImageTasks::new(&resolver, &samples, &store, ".png");
    let tasks: Vec<_> = generator.by_ref().collect();
    assert_eq!(generator.skipped(), 1);
    assert_eq!(tasks.len(), 4);
    assert_eq!(
        tasks[1].source,
        "https://images.proteinatlas.org/992/1_A1_1_green.jpg"
    );
    assert_eq!(
        tasks[1].destination,
        PathBuf::from("/data/run/green/1_A1_1_green.png")
    );
}

#[test]
fn local_copy_points_into_color_directories() {
    let samples = vec![Sample {
        filename: "untreated_C1_R1_".to_string(),
        if_plate_id: "untreated".to_string(),
        position: "C1".to_string(),
        sample: "R1".to_string(),
        status: String::new(),
        locations: String::new(),
        antibody: "CAB079904".to_string(),
        ensembl_ids: "ENSG00000187555".to_string(),
        gene_names: "USP7".to_string(),
        linkprefix: Some("/data/crate".to_string()),
    }];
    let mut resolver = LocalCopyResolver::new(".jpg");
    resolver.prepare(&samples, &NoopSink).unwrap();

    let store = store();
    let tasks: Vec<_> = ImageTasks::new(&resolver, &samples, &store, ".jpg").collect();
    assert_eq!(tasks.len(), 4);
    assert_eq!(
        PathBuf::from(&tasks[3].source),
        PathBuf::from("/data/crate/yellow/untreated_C1_R1_yellow.jpg")
    );
    assert_eq!(
        tasks[3].destination,
        PathBuf::from("/data/run/yellow/untreated_C1_R1_yellow.jpg")
    );
}

#[test]
fn no_samples_no_tasks() {
    let mut resolver = LinkPrefixResolver::new();
    resolver.prepare(&[], &NoopSink).unwrap();
    let store = store();
    let mut generator = ImageTasks::new(&resolver, &[], &store, ".jpg");
    assert_eq!(generator.next(), None);
    assert_eq!(generator.skipped(), 0);
}

const CELL_LINE_INDEX: &str = r#"<proteinAtlas>
  <entry version="23" url="https://www.proteinatlas.org/ENSG00000066455-GOLGA5">
    <name>GOLGA5</name>
    <identifier id="ENSG00000066455" db="Ensembl" version="103.38"/>
    <antibody id="HPA000992" releaseDate="2006-03-13">
      <cellExpression source="HPA" technology="ICC/IF">
        <subAssay type="human">
          <data>
            <cellLine cellosaurusID="CVCL_0042" organ="Bone">U-2 OS</cellLine>
            <location GOid="GO:0005794">Golgi apparatus</location>
            <assayImage>
              <image>
                <imageUrl>http://images.proteinatlas.org/992/1_A1_1_blue_red_green.jpg</imageUrl>
              </image>
              <image>
                <imageUrl>http://images.proteinatlas.org/992/1_A1_1_blue_red_green.jpg</imageUrl>
              </image>
            </assayImage>
          </data>
          <data>
            <cellLine cellosaurusID="CVCL_0037" organ="Skin">A-431</cellLine>
            <assayImage>
              <image>
                <imageUrl>http://images.proteinatlas.org/992/2_B1_1_blue_red_green.jpg</imageUrl>
              </image>
            </assayImage>
          </data>
        </subAssay>
      </cellExpression>
    </antibody>
  </entry>
  <entry version="23" url="https://www.proteinatlas.org/ENSG00000183092-BEGAIN">
    <name>BEGAIN</name>
    <identifier id="ENSG00000183092" db="Ensembl" version="103.16"/>
    <antibody id="HPA040086">
      <cellExpression source="HPA" technology="ICC/IF">
        <subAssay type="human">
          <data>
            <cellLine cellosaurusID="CVCL_0042" organ="Bone">U-2 OS</cellLine>
            <location GOid="GO:0005634">Nucleoplasm</location>
            <location GOid="GO:0005829">Cytosol</location>
            <assayImage>
              <image>
                <imageUrl>http://images.proteinatlas.org/40086/1795_C4_2_cr5af971a263864_blue_red_green.jpg</imageUrl>
              </image>
            </assayImage>
          </data>
        </subAssay>
      </cellExpression>
    </antibody>
  </entry>
</proteinAtlas>
"#;

fn index_lines(content: &str) -> impl Iterator<Item = Result<String, ImageDownloaderError>> + '_ {
    content.lines().map(|line| Ok(line.to_string()))
}

#[test]
fn cell_line_selects_samples_from_index() {
    let samples =
        samples_from_index(index_lines(CELL_LINE_INDEX), &IndexSampleQuery::new(None, None))
            .unwrap();
    assert_eq!(samples.len(), 2);

    let golga5 = &samples[0];
    assert_eq!(golga5.filename, "/archive/1/1_A1_1_");
    assert_eq!(golga5.image_id(), "992/1_A1_1_");
    assert_eq!(golga5.antibody, "HPA000992");
    assert_eq!(golga5.ensembl_ids, "ENSG00000066455");
    assert_eq!(golga5.gene_names, "GOLGA5");
    assert_eq!(golga5.locations, "Golgi apparatus");

    let begain = &samples[1];
    assert_eq!(begain.image_name(), "1795_C4_2_");
    assert_eq!(begain.locations, "Nucleoplasm,Cytosol");

    let mut resolver = LinkPrefixResolver::new();
    resolver.prepare(&samples, &NoopSink).unwrap();
    let store = store();
    let tasks: Vec<_> = ImageTasks::new(&resolver, &samples, &store, ".jpg").collect();
    assert_eq!(tasks.len(), 8);
    assert_eq!(
        tasks[4].source,
        "http://images.proteinatlas.org/40086/1795_C4_2_cr5af971a263864_red.jpg"
    );
    assert_eq!(
        tasks[4].destination,
        PathBuf::from("/data/run/red/1795_C4_2_red.jpg")
    );
}

#[test]
fn protein_list_and_other_cell_line() {
    let query = IndexSampleQuery::new(Some(vec!["golga5".to_string()]), Some("A431"));
    let samples = samples_from_index(index_lines(CELL_LINE_INDEX), &query).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].image_name(), "2_B1_1_");
    assert_eq!(samples[0].locations, "");

    let query = IndexSampleQuery::new(Some(vec!["ENSG00000183092".to_string()]), None);
    let samples = samples_from_index(index_lines(CELL_LINE_INDEX), &query).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].gene_names, "BEGAIN");

    let query = IndexSampleQuery::new(Some(vec!["TSPAN6".to_string()]), None);
    assert!(samples_from_index(index_lines(CELL_LINE_INDEX), &query).unwrap().is_empty());
}

#[test]
fn index_samples_read_through_atlas_reader() {
    let temp = tempfile::tempdir().unwrap();
    let index = temp.path().join("proteinatlas.xml.gz");
    write_gz(&index, CELL_LINE_INDEX);
    let reader = AtlasReader::new(index.to_string_lossy().to_string(), temp.path()).unwrap();
    let samples =
        samples_from_index(reader.open(&NoopSink).unwrap(), &IndexSampleQuery::new(None, Some("U2OS")))
            .unwrap();
    assert_eq!(samples.len(), 2);
}
