mod common;

use common::{spawn_server, test_config, write_file};
use doc_convertd::{
    client::{self, path_request},
    codec::{self, Framing, Request, Response, SUCCESS_INLINE_MSG, SUCCESS_PATH_MSG},
    listener::OriginPolicy,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::time::Duration;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

// Local file header of a zip container, enough to stand in for a .docx.
const DOCX_BYTES: &[u8] = b"PK\x03\x04\x14\x00\x06\x00\x08\x00word/document.xml<w:document/>";

fn inline(input: &str, output: &str, bytes: &[u8]) -> Request {
    Request {
        output_filename: output.into(),
        input_filename: input.into(),
        input_base64_file_contents: Some(codec::encode_content(bytes)),
        output_format: None,
    }
}

#[test]
fn inline_docx_to_pdf_returns_pdf_bytes() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());

    let response = client::submit(
        server.addr,
        &inline("a.docx", "a.pdf", DOCX_BYTES),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, SUCCESS_INLINE_MSG);
    assert_eq!(response.output_filename.as_deref(), Some("a.pdf"));
    let pdf = codec::decode_content(response.output_base64_file_contents.as_deref().unwrap()).unwrap();
    assert!(pdf.starts_with(b"%PDF-"));
    assert!(pdf.ends_with(b"%%EOF\n"));
    assert_eq!(server.temp_entries(), 0);
}

#[test]
fn inline_content_survives_the_round_trip() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    let sample: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

    let response = client::submit(
        server.addr,
        &inline("sample.txt", "sample.txt", &sample),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    let back = codec::decode_content(response.output_base64_file_contents.as_deref().unwrap()).unwrap();
    assert_eq!(back, sample);
}

#[test]
fn missing_path_without_content_reports_no_input() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());

    let response = client::submit(
        server.addr,
        &path_request("missing.docx", "missing.pdf"),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(
        response,
        Response {
            msg: "No encoded input file content, nor path provided with input filename.".into(),
            output_filename: None,
            output_base64_file_contents: None,
        }
    );
    assert_eq!(server.script.executions(), 0);
}

#[test]
fn path_requests_leave_caller_files_in_place() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    let work = tempfile::tempdir().unwrap();
    let input = write_file(work.path(), "report.docx", DOCX_BYTES);
    let output = work.path().join("report.pdf");

    let response = client::submit(
        server.addr,
        &path_request(input.to_str().unwrap(), output.to_str().unwrap()),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, SUCCESS_PATH_MSG);
    assert_eq!(response.output_filename.as_deref(), output.to_str());
    assert!(response.output_base64_file_contents.is_none());
    assert_eq!(std::fs::read(&input).unwrap(), DOCX_BYTES);
    assert!(std::fs::read(&output).unwrap().starts_with(b"%PDF-"));
}

#[test]
fn oversize_payload_is_refused_without_leftovers() {
    let mut cfg = test_config();
    cfg.server.max_upload_bytes = 16;
    let server = spawn_server(cfg, OriginPolicy::local_only());

    let response = client::submit(
        server.addr,
        &inline("big.docx", "big.pdf", &[7u8; 100]),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, "Fail; File too big to process.");
    assert!(response.output_filename.is_none());
    assert_eq!(server.temp_entries(), 0);
    assert_eq!(server.script.executions(), 0);
}

#[test]
fn remote_peers_get_the_rejection_only() {
    let denied = OriginPolicy {
        allow_loopback: false,
        allowed: Vec::new(),
    };
    let server = spawn_server(test_config(), denied);

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(TIMEOUT).unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let response: Response = serde_json::from_slice(&raw).unwrap();

    assert_eq!(response, Response::rejected());
    assert_eq!(response.msg, "Remote connections not allowed.");
    assert_eq!(server.script.executions(), 0);
    assert_eq!(server.temp_entries(), 0);
}

#[test]
fn malformed_json_gets_an_error_response() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(TIMEOUT).unwrap();
    stream.write_all(b"{not json}").unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let response: Response = serde_json::from_slice(&raw).unwrap();

    assert!(response.msg.starts_with("Fail; malformed request"), "{}", response.msg);
    assert!(response.output_filename.is_none());
}

#[test]
fn request_split_across_writes_is_reassembled() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    let body = serde_json::to_vec(&inline("odd}.txt", "odd}.txt", b"brace")).unwrap();
    let cut = body.iter().position(|&b| b == b'}').unwrap() + 1;

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(TIMEOUT).unwrap();
    stream.write_all(&body[..cut]).unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    stream.write_all(&body[cut..]).unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let response: Response = serde_json::from_slice(&raw).unwrap();

    assert_eq!(response.msg, SUCCESS_INLINE_MSG);
    assert_eq!(response.output_filename.as_deref(), Some("odd}.txt"));
}

#[test]
fn mime_wrapped_base64_is_accepted() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    let sample = vec![b'x'; 200];
    let encoded = codec::encode_content(&sample);
    let wrapped = encoded
        .as_bytes()
        .chunks(60)
        .map(|c| std::str::from_utf8(c).unwrap())
        .collect::<Vec<_>>()
        .join("\n");
    let mut request = inline("notes.txt", "notes.txt", b"");
    request.input_base64_file_contents = Some(wrapped + "\n");

    let response = client::submit(server.addr, &request, Framing::Brace, TIMEOUT).unwrap();

    let back = codec::decode_content(response.output_base64_file_contents.as_deref().unwrap()).unwrap();
    assert_eq!(back, sample);
}

#[test]
fn explicit_output_format_wins_over_extension() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    let mut request = inline("a.docx", "a.out", DOCX_BYTES);
    request.output_format = Some("PDF".into());

    let response = client::submit(server.addr, &request, Framing::Brace, TIMEOUT).unwrap();

    let out = codec::decode_content(response.output_base64_file_contents.as_deref().unwrap()).unwrap();
    assert!(out.starts_with(b"%PDF-"));
}

#[test]
fn missing_extension_is_unsupported() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());

    let response = client::submit(
        server.addr,
        &inline("a.docx", "noextension", DOCX_BYTES),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, "Fail; unsupported document type: noextension");
    assert_eq!(server.script.executions(), 0);
    assert_eq!(server.temp_entries(), 0);
}

#[test]
fn invalid_base64_is_reported() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    let mut request = inline("a.docx", "a.pdf", b"");
    request.input_base64_file_contents = Some("***".into());

    let response = client::submit(server.addr, &request, Framing::Brace, TIMEOUT).unwrap();

    assert!(
        response.msg.starts_with("Fail; input content is not valid Base64"),
        "{}",
        response.msg
    );
}

#[test]
fn transient_failures_are_retried_until_success() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    server.script.transient_failures.store(2, Ordering::SeqCst);

    let response = client::submit(
        server.addr,
        &inline("a.docx", "a.pdf", DOCX_BYTES),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, SUCCESS_INLINE_MSG);
    assert_eq!(server.script.executions(), 3);
}

#[test]
fn exhausted_retries_surface_and_clean_up() {
    let mut cfg = test_config();
    cfg.retry.max_attempts = 2;
    let server = spawn_server(cfg, OriginPolicy::local_only());
    server.script.transient_failures.store(10, Ordering::SeqCst);

    let response = client::submit(
        server.addr,
        &inline("a.docx", "a.pdf", DOCX_BYTES),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(
        response.msg,
        "Fail; conversion engine failed after 2 attempts: office connection reset"
    );
    assert!(response.output_base64_file_contents.is_none());
    assert_eq!(server.script.executions(), 2);
    assert_eq!(server.temp_entries(), 0);
}

#[test]
fn fatal_engine_errors_are_not_retried() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    *server.script.fatal.lock().unwrap() = Some("document is password protected".into());

    let response = client::submit(
        server.addr,
        &inline("a.docx", "a.pdf", DOCX_BYTES),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, "Fail; conversion failed: document is password protected");
    assert_eq!(server.script.executions(), 1);
}

#[test]
fn length_prefixed_framing_round_trip() {
    let mut cfg = test_config();
    cfg.server.framing = Framing::LengthPrefixed;
    let server = spawn_server(cfg, OriginPolicy::local_only());

    let response = client::submit(
        server.addr,
        &inline("a.docx", "a.pdf", DOCX_BYTES),
        Framing::LengthPrefixed,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, SUCCESS_INLINE_MSG);
}

#[test]
fn pooled_workers_serve_concurrent_clients() {
    let mut cfg = test_config();
    cfg.server.max_workers = 2;
    let server = spawn_server(cfg, OriginPolicy::local_only());
    let addr = server.addr;

    let handles: Vec<_> = (0..6)
        .map(|i| {
            std::thread::spawn(move || {
                let body = format!("document {i}");
                let request = inline(&format!("d{i}.txt"), &format!("d{i}.txt"), body.as_bytes());
                let response = client::submit(addr, &request, Framing::Brace, TIMEOUT).unwrap();
                let back =
                    codec::decode_content(response.output_base64_file_contents.as_deref().unwrap()).unwrap();
                assert_eq!(back, body.as_bytes());
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(server.script.executions(), 6);
}

#[test]
fn silent_client_gets_no_response_and_server_keeps_going() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());

    drop(TcpStream::connect(server.addr).unwrap());

    let response = client::submit(
        server.addr,
        &inline("a.txt", "a.txt", b"still here"),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();
    assert_eq!(response.msg, SUCCESS_INLINE_MSG);
}

fn exchange_raw(addr: std::net::SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(TIMEOUT).unwrap();
    stream.write_all(bytes).unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    raw
}

#[test]
fn unbalanced_braces_are_answered_without_closing_the_write_side() {
    let mut cfg = test_config();
    cfg.server.read_timeout_seconds = 0;
    let server = spawn_server(cfg, OriginPolicy::local_only());

    let raw = exchange_raw(
        server.addr,
        br#"{"outputFilename":"a.pdf","inputFilename":"a.docx","x":{}"#,
    );
    let response: Response = serde_json::from_slice(&raw).unwrap();

    assert!(response.msg.starts_with("Fail; malformed request"), "{}", response.msg);
    assert!(response.output_filename.is_none());
    assert_eq!(server.script.executions(), 0);
}

#[test]
fn stalled_request_is_answered_after_read_timeout() {
    let mut cfg = test_config();
    cfg.server.read_timeout_seconds = 1;
    let server = spawn_server(cfg, OriginPolicy::local_only());

    let started = std::time::Instant::now();
    let raw = exchange_raw(server.addr, br#"{"inputFilename":"a}"#);
    let response: Response = serde_json::from_slice(&raw).unwrap();

    assert!(response.msg.starts_with("Fail; malformed request"), "{}", response.msg);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(server.temp_entries(), 0);
}

#[test]
fn silent_client_is_dropped_after_read_timeout() {
    let mut cfg = test_config();
    cfg.server.read_timeout_seconds = 1;
    let server = spawn_server(cfg, OriginPolicy::local_only());

    let raw = exchange_raw(server.addr, b"");

    assert!(raw.is_empty());
}

#[test]
fn oversize_frame_is_answered_with_too_big() {
    let mut cfg = test_config();
    cfg.server.max_upload_bytes = 16;
    let limit = codec::frame_limit(16);
    let server = spawn_server(cfg, OriginPolicy::local_only());

    // Exactly one byte over the limit, never completing the object, so the
    // server has consumed everything by the time it answers.
    let mut body = br#"{"inputFilename":""#.to_vec();
    body.resize(limit + 1, b'x');
    let raw = exchange_raw(server.addr, &body);
    let response: Response = serde_json::from_slice(&raw).unwrap();

    assert_eq!(response.msg, "Fail; File too big to process.");
    assert_eq!(server.script.executions(), 0);
    assert_eq!(server.temp_entries(), 0);
}

#[test]
fn oversize_length_prefix_is_answered_with_too_big() {
    let mut cfg = test_config();
    cfg.server.framing = Framing::LengthPrefixed;
    cfg.server.max_upload_bytes = 16;
    let server = spawn_server(cfg, OriginPolicy::local_only());

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(TIMEOUT).unwrap();
    stream.write_all(&u32::MAX.to_be_bytes()).unwrap();
    let frame = codec::read_frame(&mut stream, Framing::LengthPrefixed, usize::MAX).unwrap();
    let response: Response = serde_json::from_slice(&frame).unwrap();

    assert_eq!(response.msg, "Fail; File too big to process.");
}

#[test]
fn open_circuit_fails_fast() {
    let mut cfg = test_config();
    cfg.retry.max_attempts = 1;
    cfg.retry.failure_threshold = 1;
    cfg.retry.cooldown_seconds = 3600;
    let server = spawn_server(cfg, OriginPolicy::local_only());
    server.script.transient_failures.store(1, Ordering::SeqCst);

    let first = client::submit(
        server.addr,
        &inline("a.docx", "a.pdf", DOCX_BYTES),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();
    assert_eq!(
        first.msg,
        "Fail; conversion engine failed after 1 attempts: office connection reset"
    );

    let second = client::submit(
        server.addr,
        &inline("a.docx", "a.pdf", DOCX_BYTES),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();
    assert_eq!(second.msg, "Fail; conversion engine unavailable, retry later");
    assert!(second.output_filename.is_none());
    assert_eq!(server.script.executions(), 1);
    assert_eq!(server.temp_entries(), 0);
}

#[test]
fn dead_engine_is_rebuilt_for_the_next_request() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    server.script.alive.store(false, Ordering::SeqCst);

    let response = client::submit(
        server.addr,
        &inline("a.docx", "a.pdf", DOCX_BYTES),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, SUCCESS_INLINE_MSG);
    assert_eq!(server.script.builds.load(Ordering::SeqCst), 2);
    assert_eq!(server.script.kills.load(Ordering::SeqCst), 1);
    assert_eq!(server.script.executions(), 1);
}

#[test]
fn failed_rebuild_is_retried_by_the_gateway() {
    let server = spawn_server(test_config(), OriginPolicy::local_only());
    server.script.alive.store(false, Ordering::SeqCst);
    server.script.start_failures.store(1, Ordering::SeqCst);

    let response = client::submit(
        server.addr,
        &inline("a.txt", "a.txt", b"after a crash"),
        Framing::Brace,
        TIMEOUT,
    )
    .unwrap();

    assert_eq!(response.msg, SUCCESS_INLINE_MSG);
    assert_eq!(server.script.builds.load(Ordering::SeqCst), 3);
    assert_eq!(server.script.executions(), 1);
}
