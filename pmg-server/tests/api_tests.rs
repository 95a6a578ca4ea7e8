//! Integration tests for pmg-server API endpoints
//!
//! Tests cover:
//! - Health, build info and UI routes
//! - Upload: parsing, temp file cleanup, parse failures, missing field
//! - Generate: default sequence, continuation of an upload, chained generation,
//!   model failure fallback, unquantizable uploads, concurrent requests
//! - Download of generated files and file name validation
//! - Session inspection, clearing and persistence

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use pmg_common::config::{GenerationConfig, RootFolderInitializer};
use pmg_common::midi::{midi_to_sequence, sequence_to_midi};
use pmg_common::{Error, Note, NoteSequence, Tempo};
use pmg_server::generator::{Continuation, MarkovMelodyModel};
use pmg_server::{build_router, AppState, ServerConfig};
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot` method

const BOUNDARY: &str = "pmg-test-boundary";

/// Continuation that always fails, to exercise the fallback path
struct BrokenModel;

impl Continuation for BrokenModel {
    fn name(&self) -> &str {
        "broken"
    }

    fn continue_sequence(&self, _: &NoteSequence, _: u32, _: f64) -> pmg_common::Result<NoteSequence> {
        Err(Error::Internal("model unavailable".to_string()))
    }
}

/// Continuation that takes a while and adds nothing
struct SlowModel;

impl Continuation for SlowModel {
    fn name(&self) -> &str {
        "slow"
    }

    fn continue_sequence(&self, seed: &NoteSequence, steps: u32, _: f64) -> pmg_common::Result<NoteSequence> {
        std::thread::sleep(std::time::Duration::from_millis(300));
        let mut continuation = NoteSequence::new();
        continuation.tempos = seed.tempos.clone();
        continuation.quantization_info = seed.quantization_info;
        continuation.total_quantized_steps = Some(steps);
        Ok(continuation)
    }
}

struct TestApp {
    router: Router,
    root: RootFolderInitializer,
    _dir: TempDir,
}

impl TestApp {
    fn with_model(continuation: Arc<dyn Continuation>) -> Self {
        let dir = TempDir::new().expect("Should create temp dir");
        let root = RootFolderInitializer::new(dir.path().join("pmg"));
        root.ensure_directories().expect("Should create folders");

        let generation = GenerationConfig {
            seed: Some(11),
            ..Default::default()
        };
        let config = ServerConfig::from_root(&root, 1024 * 1024, generation);
        let state = AppState::new(config, continuation);

        Self {
            router: build_router(state),
            root,
            _dir: dir,
        }
    }

    fn new() -> Self {
        Self::with_model(Arc::new(MarkovMelodyModel::with_seed(11)))
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Should read body");
        (status, bytes.to_vec())
    }

    async fn json(&self, request: Request<Body>) -> (StatusCode, Value) {
        let (status, bytes) = self.send(request).await;
        (status, serde_json::from_slice(&bytes).expect("Should parse JSON"))
    }

    fn upload_dir_entries(&self) -> usize {
        std::fs::read_dir(self.root.upload_dir()).unwrap().count()
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

fn post_generate() -> Request<Body> {
    // The original client posts a JSON body; it must be ignored
    Request::builder()
        .method("POST")
        .uri("/api/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"sequence":"song.mid"}"#))
        .unwrap()
}

fn multipart_upload(field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{f}\"; filename=\"{n}\"\r\n\
             Content-Type: audio/midi\r\n\r\n",
            b = BOUNDARY,
            f = field,
            n = file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn single_note_midi(pitch: u8) -> Vec<u8> {
    let mut seq = NoteSequence::new();
    seq.push_note(Note::new(pitch, 90, 0.0, 1.0));
    sequence_to_midi(&seq).unwrap()
}

fn marker_count(sequence: &Value) -> usize {
    sequence["notes"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|n| n["velocity"] == 121 && n["instrument"] == 8)
        .count()
}

/// A one-bar scale fragment at 120 qpm, 0..2s
fn scale_midi() -> Vec<u8> {
    let mut seq = NoteSequence::new();
    seq.tempos.push(Tempo { time: 0.0, qpm: 120.0 });
    for (i, pitch) in [60u8, 62, 64, 65].iter().enumerate() {
        let start = i as f64 * 0.5;
        seq.push_note(Note::new(*pitch, 90, start, start + 0.5));
    }
    sequence_to_midi(&seq).unwrap()
}

// =============================================================================
// Service endpoints
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = TestApp::new();
    let (status, body) = app.json(get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "pmg-server");
    assert!(body["version"].is_string());
    assert!(body["uptime_seconds"].is_number());
    assert!(body.get("last_error").is_none());
}

#[tokio::test]
async fn test_build_info() {
    let app = TestApp::new();
    let (status, body) = app.json(get("/build_info")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["git_hash"].is_string());
}

#[tokio::test]
async fn test_ui_served() {
    let app = TestApp::new();

    let (status, page) = app.send(get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(page).unwrap().contains("/static/app.js"));

    let (status, script) = app.send(get("/static/app.js")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(script).unwrap().contains("/api/upload"));
}

// =============================================================================
// Upload
// =============================================================================

#[tokio::test]
async fn test_upload_parses_and_stores_sequence() {
    let app = TestApp::new();

    let (status, body) = app.json(multipart_upload("file", "scale.mid", &scale_midi())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "File uploaded and parsed");
    assert_eq!(body["filePath"], "scale.mid");
    assert_eq!(body["noteCount"], 4);

    // Temp file is deleted after parsing
    assert_eq!(app.upload_dir_entries(), 0);

    let (status, sequence) = app.json(get("/api/sequence")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sequence["notes"].as_array().unwrap().len(), 4);
    assert_eq!(sequence["notes"][0]["pitch"], 60);
}

#[tokio::test]
async fn test_upload_invalid_file_returns_500() {
    let app = TestApp::new();

    let (status, body) = app
        .json(multipart_upload("file", "notes.txt", b"this is not a midi file"))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to parse the file");

    assert_eq!(app.upload_dir_entries(), 0);

    let (status, _) = app.json(get("/api/sequence")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, health) = app.json(get("/health")).await;
    assert!(health["last_error"].as_str().unwrap().contains("upload parse failed"));
}

#[tokio::test]
async fn test_upload_without_file_field_is_rejected() {
    let app = TestApp::new();

    let (status, body) = app
        .json(multipart_upload("attachment", "scale.mid", &scale_midi()))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

// =============================================================================
// Generate
// =============================================================================

#[tokio::test]
async fn test_generate_without_upload_writes_default_sequence() {
    let app = TestApp::new();

    let (status, body) = app.json(post_generate()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "File generated");
    assert_eq!(body["kind"], "default");
    assert_eq!(body["noteCount"], 2);
    assert_eq!(body["generatedNotes"], 0);

    let file_path = PathBuf::from(body["filePath"].as_str().unwrap());
    assert!(file_path.starts_with(app.root.output_dir()));
    assert!(file_path.to_string_lossy().ends_with("_new.mid"));

    let written = midi_to_sequence(&std::fs::read(&file_path).unwrap()).unwrap();
    let pitches: Vec<u8> = written.notes.iter().map(|n| n.pitch).collect();
    assert_eq!(pitches, vec![60, 62]);
    assert!((written.total_time - 5.0).abs() < 0.01);
    assert!((written.qpm() - 103.333).abs() < 0.01);
}

#[tokio::test]
async fn test_generate_extends_uploaded_sequence() {
    let app = TestApp::new();
    app.json(multipart_upload("file", "scale.mid", &scale_midi())).await;

    let (status, body) = app.json(post_generate()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "extended");
    assert!(body["filePath"].as_str().unwrap().ends_with("_extended.mid"));

    let generated = body["generatedNotes"].as_u64().unwrap() as usize;
    assert_eq!(body["noteCount"].as_u64().unwrap() as usize, 4 + 1 + generated);

    let (_, sequence) = app.json(get("/api/sequence")).await;
    let notes = sequence["notes"].as_array().unwrap();

    // Marker note follows the upload
    assert_eq!(notes[4]["pitch"], 60);
    assert_eq!(notes[4]["velocity"], 121);
    assert_eq!(notes[4]["instrument"], 8);
    assert!((notes[4]["startTime"].as_f64().unwrap() - 2.0).abs() < 1e-6);
    assert!((notes[4]["endTime"].as_f64().unwrap() - 5.0).abs() < 1e-6);

    // Generated notes start after the quantized seed (5s at 120 qpm)
    for note in &notes[5..] {
        assert!(note["startTime"].as_f64().unwrap() >= 5.0 - 1e-6);
        assert!(note.get("quantizedStartStep").is_none());
    }
}

#[tokio::test]
async fn test_generate_chains_on_previous_result() {
    let app = TestApp::new();

    let (_, first) = app.json(post_generate()).await;
    assert_eq!(first["kind"], "default");

    // The default result became the session sequence, so this one extends it
    let (status, second) = app.json(post_generate()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["kind"], "extended");
    assert!(second["noteCount"].as_u64().unwrap() >= 3);
    assert_ne!(first["filePath"], second["filePath"]);
}

#[tokio::test]
async fn test_generate_survives_model_failure() {
    let app = TestApp::with_model(Arc::new(BrokenModel));
    app.json(multipart_upload("file", "scale.mid", &scale_midi())).await;

    let (status, body) = app.json(post_generate()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "extended");
    assert_eq!(body["generatedNotes"], 0);
    assert_eq!(body["noteCount"], 5);

    let (_, health) = app.json(get("/health")).await;
    assert!(health["last_error"].as_str().unwrap().contains("model unavailable"));
}

#[tokio::test]
async fn test_generate_persists_session() {
    let app = TestApp::new();
    app.json(post_generate()).await;

    let saved = std::fs::read_to_string(app.root.session_path()).unwrap();
    let sequence = NoteSequence::from_json(&saved).unwrap();
    assert_eq!(sequence.notes.len(), 2);
}

// =============================================================================
// Files and session
// =============================================================================

#[tokio::test]
async fn test_download_generated_file() {
    let app = TestApp::new();
    let (_, body) = app.json(post_generate()).await;
    let url = body["downloadUrl"].as_str().unwrap().to_string();

    let response = app.router.clone().oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/midi");
    assert!(response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .starts_with("attachment"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(midi_to_sequence(&bytes).unwrap().notes.len(), 2);
}

#[tokio::test]
async fn test_download_rejects_bad_names() {
    let app = TestApp::new();

    let (status, _) = app.json(get("/api/files/notes.txt")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.json(get("/api/files/1_missing.mid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_clear_sequence_resets_to_default() {
    let app = TestApp::new();
    app.json(multipart_upload("file", "scale.mid", &scale_midi())).await;
    app.json(post_generate()).await;
    assert!(app.root.session_path().exists());

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/sequence")
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], true);
    assert!(!app.root.session_path().exists());

    let (_, body) = app.json(post_generate()).await;
    assert_eq!(body["kind"], "default");
}

#[tokio::test]
async fn test_upload_persists_session() {
    let app = TestApp::new();
    app.json(post_generate()).await;

    let (status, _) = app.json(multipart_upload("file", "solo.mid", &single_note_midi(77))).await;
    assert_eq!(status, StatusCode::OK);

    // A restart restores the upload, not the earlier generated result
    let saved = std::fs::read_to_string(app.root.session_path()).unwrap();
    let sequence = NoteSequence::from_json(&saved).unwrap();
    let pitches: Vec<u8> = sequence.notes.iter().map(|n| n.pitch).collect();
    assert_eq!(pitches, vec![77]);
}

#[tokio::test]
async fn test_concurrent_generates_both_extend() {
    let app = TestApp::with_model(Arc::new(SlowModel));
    app.json(multipart_upload("file", "scale.mid", &scale_midi())).await;

    let ((first, _), (second, _)) = tokio::join!(app.json(post_generate()), app.json(post_generate()));
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);

    let (_, sequence) = app.json(get("/api/sequence")).await;
    assert_eq!(marker_count(&sequence), 2);
    assert_eq!(sequence["notes"].as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_generate_with_tempo_change_skips_continuation() {
    let app = TestApp::new();

    let mut seq = NoteSequence::new();
    seq.tempos.push(Tempo { time: 0.0, qpm: 120.0 });
    seq.tempos.push(Tempo { time: 1.0, qpm: 90.0 });
    seq.push_note(Note::new(60, 90, 0.0, 1.0));
    seq.push_note(Note::new(64, 90, 1.0, 2.0));
    let (status, _) = app
        .json(multipart_upload("file", "two-tempos.mid", &sequence_to_midi(&seq).unwrap()))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.json(post_generate()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "extended");
    assert_eq!(body["generatedNotes"], 0);
    assert_eq!(body["noteCount"], 3);
    assert!(PathBuf::from(body["filePath"].as_str().unwrap()).exists());

    let (_, health) = app.json(get("/health")).await;
    assert!(health["last_error"].as_str().unwrap().contains("multiple tempos"));
}

#[tokio::test]
async fn test_generate_with_enormous_upload_span_skips_continuation() {
    let app = TestApp::new();

    // One tick per quarter keeps the far-off note end inside a valid MIDI delta
    let mut seq = NoteSequence::new();
    seq.ticks_per_quarter = 1;
    seq.push_note(Note::new(60, 90, 0.0, 100_000_000.0));
    let (status, _) = app
        .json(multipart_upload("file", "long.mid", &sequence_to_midi(&seq).unwrap()))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.json(post_generate()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["generatedNotes"], 0);
    assert_eq!(body["noteCount"], 2);

    let (_, health) = app.json(get("/health")).await;
    assert!(health["last_error"].as_str().unwrap().contains("step limit"));
}
