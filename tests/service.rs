//! The tokio driver over in-memory duplex pipes.

use fcgi_engine::lowlevel::{read_record, write_record};
use fcgi_engine::params::encode_params;
use fcgi_engine::s11n::EndRequestBody;
use fcgi_engine::*;

use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use std::io::Read;
use std::sync::Arc;

fn wire(records: &[FastcgiRecord]) -> Vec<u8> {
    let mut out: Vec<u8> = vec![];
    for record in records {
        write_record(&mut out, record, false).unwrap();
    }
    out
}

fn records(mut bytes: &[u8]) -> Vec<FastcgiRecord> {
    let mut out = vec![];
    while let Some(record) = read_record(&mut bytes).unwrap() {
        out.push(record);
    }
    out
}

fn request(id: u16, keep_connection: bool, body: &'static [u8]) -> Vec<FastcgiRecord> {
    let params: Params = vec![("REQUEST_URI", "/hello")].into_iter().collect();
    vec![
        FastcgiRecord::begin_request(id, Role::Responder, keep_connection),
        FastcgiRecord::new(RecordType::Params, id, encode_params(&params).unwrap()),
        FastcgiRecord::new(RecordType::Params, id, Bytes::new()),
        FastcgiRecord::new(RecordType::Stdin, id, body),
        FastcgiRecord::new(RecordType::Stdin, id, Bytes::new()),
    ]
}

struct Echo;

impl FastcgiRequestHandler for Echo {
    fn call(&self, request: &mut FastcgiRequest<'_>, response: &mut FastcgiResponse<'_>)
        -> std::result::Result<i32, HandlerError>
    {
        let mut body = vec![];
        request.read_to_end(&mut body)?;
        let uri = request.param("REQUEST_URI").unwrap_or("").to_owned();
        response.print(&uri)?;
        response.print(":")?;
        response.write_stdout(&body)?;
        Ok(0)
    }
}

/// Runs a whole conversation and returns what the service wrote plus how it ended.
async fn converse(config: EngineConfig, input: Vec<u8>) -> (Result<()>, Vec<FastcgiRecord>) {
    let (mut client, server) = duplex(1 << 20);
    let service = FastcgiService::new(Arc::new(Echo), config);
    let server_task = tokio::spawn(async move { service.serve_connection(server).await });

    client.write_all(&input).await.unwrap();
    client.shutdown().await.unwrap();
    let mut output = vec![];
    client.read_to_end(&mut output).await.unwrap();

    let result = server_task.await.unwrap();
    (result, records(&output))
}

#[tokio::test]
async fn buffered_echo() {
    let (result, out) = converse(EngineConfig::default(), wire(&request(1, false, b"hi"))).await;
    result.unwrap();

    assert_eq!(out.len(), 4);
    assert_eq!(&out[0].content[..], b"/hello:hi");
    assert!(out[1].is_empty() && out[2].is_empty());
    let end = EndRequestBody::parse(&out[3].content).unwrap();
    assert_eq!(end.app_status, 0);
    assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete);
}

#[tokio::test]
async fn streaming_echo_with_kept_connection() {
    let config = EngineConfig { body_mode: BodyMode::Streaming, ..EngineConfig::default() };
    let mut input = request(1, true, b"first");
    input.extend(request(2, true, b"second"));
    let (result, out) = converse(config, wire(&input)).await;
    result.unwrap();

    let stdout: Vec<(u16, Bytes)> = out.iter()
        .filter(|r| r.kind() == Some(RecordType::Stdout) && !r.is_empty())
        .map(|r| (r.request_id, r.content.clone()))
        .collect();
    assert_eq!(stdout, vec![
        (1, Bytes::from_static(b"/hello:first")),
        (2, Bytes::from_static(b"/hello:second")),
    ]);
}

#[tokio::test]
async fn large_body_and_output() {
    let config = EngineConfig { output_threshold: 1024, ..EngineConfig::default() };
    let body = vec![b'q'; 100_000];
    let mut input = vec![
        FastcgiRecord::begin_request(1, Role::Responder, false),
        FastcgiRecord::new(RecordType::Params, 1, Bytes::new()),
    ];
    // write_record splits the body across as many STDIN records as it needs.
    input.push(FastcgiRecord::new(RecordType::Stdin, 1, body.clone()));
    input.push(FastcgiRecord::new(RecordType::Stdin, 1, Bytes::new()));
    let (result, out) = converse(config, wire(&input)).await;
    result.unwrap();

    let stdout: Vec<u8> = out.iter()
        .filter(|r| r.kind() == Some(RecordType::Stdout))
        .flat_map(|r| r.content.to_vec())
        .collect();
    assert_eq!(stdout.len(), 1 + body.len());
    assert!(out.iter().all(|r| r.content.len() <= 65535));
}

#[tokio::test]
async fn abort_and_unknown_role() {
    let mut bad_begin = FastcgiRecord::begin_request(3, Role::Responder, true);
    bad_begin.content = Bytes::from_static(&[0, 99, 1, 0, 0, 0, 0, 0]);
    let mut input = vec![bad_begin];
    input.extend(vec![
        FastcgiRecord::begin_request(4, Role::Responder, false),
        FastcgiRecord::new(RecordType::Params, 4, Bytes::new()),
        FastcgiRecord::new(RecordType::AbortRequest, 4, Bytes::new()),
    ]);
    let (result, out) = converse(EngineConfig::default(), wire(&input)).await;
    result.unwrap();

    assert_eq!(out.len(), 2);
    assert_eq!(out[0].request_id, 3);
    assert_eq!(EndRequestBody::parse(&out[0].content).unwrap().protocol_status,
               ProtocolStatus::UnknownRole);
    assert_eq!(out[1].request_id, 4);
    assert_eq!(EndRequestBody::parse(&out[1].content).unwrap().protocol_status,
               ProtocolStatus::RequestComplete);
}

#[tokio::test]
async fn stragglers_of_ended_requests_are_ignored() {
    let mut bad_begin = FastcgiRecord::begin_request(1, Role::Responder, true);
    bad_begin.content = Bytes::from_static(&[0, 99, 1, 0, 0, 0, 0, 0]);
    let mut input = vec![
        bad_begin,
        FastcgiRecord::new(RecordType::Params, 1, Bytes::new()),
        FastcgiRecord::new(RecordType::Stdin, 1, Bytes::new()),
    ];
    input.extend(request(2, true, b"two"));
    input.push(FastcgiRecord::new(RecordType::AbortRequest, 2, Bytes::new()));
    input.extend(request(2, false, b"again"));
    let (result, out) = converse(EngineConfig::default(), wire(&input)).await;
    result.unwrap();

    let ends: Vec<(u16, ProtocolStatus)> = out.iter()
        .filter(|r| r.kind() == Some(RecordType::EndRequest))
        .map(|r| (r.request_id, EndRequestBody::parse(&r.content).unwrap().protocol_status))
        .collect();
    assert_eq!(ends, vec![
        (1, ProtocolStatus::UnknownRole),
        (2, ProtocolStatus::RequestComplete),
        (2, ProtocolStatus::RequestComplete),
    ]);
}

#[tokio::test]
async fn truncated_stream_is_an_error() {
    let mut input = wire(&request(1, false, b"hi"));
    input.truncate(20);
    let (result, _out) = converse(EngineConfig::default(), input).await;
    assert!(matches!(result, Err(FastcgiError::TruncatedStream(_))));
}
