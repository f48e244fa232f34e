use std::io::{self, Read};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zlv_core::RecordKind;

use crate::{
    ObjectStorageSource, RecordStream, RowDecoder, SourceError, SourceItem, SourceRepository,
    StreamOptions,
};

type HmacSha256 = Hmac<Sha256>;

/// Body chunks buffered between the HTTP task and the decoder.
const CHUNK_BUFFER: usize = 8;

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AwsCredentials {
    /// Explicit keys win. When neither key is configured fall back to
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`.
    pub fn resolve(source: &ObjectStorageSource) -> Result<Self, SourceError> {
        if source.access_key_id.is_some() || source.secret_access_key.is_some() {
            let access_key_id = source
                .access_key_id
                .clone()
                .ok_or_else(|| SourceError::Credentials("access key id not set".into()))?;
            let secret_access_key = source
                .secret_access_key
                .clone()
                .ok_or_else(|| SourceError::Credentials("secret access key not set".into()))?;
            return Ok(Self {
                access_key_id,
                secret_access_key,
                session_token: source.session_token.clone(),
            });
        }
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, SourceError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| SourceError::Credentials("AWS_ACCESS_KEY_ID not set".into()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| SourceError::Credentials("AWS_SECRET_ACCESS_KEY not set".into()))?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

/// Streams a single object with a signed `GetObject` request.
#[derive(Debug, Clone)]
pub struct ObjectStorageRepository {
    source: ObjectStorageSource,
    kind: RecordKind,
    capacity: usize,
}

impl ObjectStorageRepository {
    pub fn new(source: ObjectStorageSource, kind: RecordKind, capacity: usize) -> Self {
        Self {
            source,
            kind,
            capacity: capacity.max(1),
        }
    }
}

impl SourceRepository for ObjectStorageRepository {
    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.source.bucket, self.source.key)
    }

    fn stream(&self, options: &StreamOptions) -> RecordStream {
        let (tx, rx) = mpsc::channel::<SourceItem>(self.capacity);
        let creds = match AwsCredentials::resolve(&self.source) {
            Ok(creds) => creds,
            Err(err) => {
                // capacity is at least one and nothing else has been sent
                let _ = tx.try_send(Err(err));
                return RecordStream::new(rx);
            }
        };

        let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Vec<u8>>>(CHUNK_BUFFER);
        let source = self.source.clone();
        let pump = tokio::spawn(async move {
            if let Err(err) = pump_object(&source, &creds, &chunk_tx).await {
                warn!(bucket = %source.bucket, key = %source.key, error = %err, "object download failed");
                let _ = chunk_tx.send(Err(io::Error::other(err))).await;
            }
        });

        let decoder = RowDecoder {
            location: self.location(),
            kind: self.kind,
            format: self.source.format,
            delimiter: self.source.delimiter,
            options: options.clone(),
        };
        tokio::task::spawn_blocking(move || {
            decoder.run(ChunkReader::new(chunk_rx), &tx);
        });

        RecordStream::new(rx).with_task(pump.abort_handle())
    }
}

async fn pump_object(
    source: &ObjectStorageSource,
    creds: &AwsCredentials,
    chunks: &mpsc::Sender<io::Result<Vec<u8>>>,
) -> Result<(), SourceError> {
    let timeout = Duration::from_secs(source.timeout_secs.max(1));
    let client = reqwest::Client::builder()
        .connect_timeout(timeout)
        .build()
        .map_err(|e| SourceError::Http(e.to_string()))?;

    let target = ObjectUrl::for_source(source);
    let headers = sign_get(&target, creds, &source.region, Utc::now());
    let mut request = client.get(&target.url);
    for (name, value) in &headers {
        if name != "host" {
            request = request.header(name.as_str(), value.as_str());
        }
    }

    let mut response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| SourceError::Http(format!("GET {} timed out", target.url)))?
        .map_err(|e| SourceError::Http(format!("GET {}: {e}", target.url)))?;
    if !response.status().is_success() {
        return Err(SourceError::Http(format!(
            "GET {} returned HTTP {}",
            target.url,
            response.status()
        )));
    }

    let mut received = 0usize;
    loop {
        let chunk = tokio::time::timeout(timeout, response.chunk())
            .await
            .map_err(|_| SourceError::Http(format!("reading {} timed out", target.url)))?
            .map_err(|e| SourceError::Http(format!("reading {}: {e}", target.url)))?;
        let Some(chunk) = chunk else { break };
        received += chunk.len();
        if chunks.send(Ok(chunk.to_vec())).await.is_err() {
            debug!(url = %target.url, "decoder went away, stopping download");
            return Ok(());
        }
    }
    debug!(url = %target.url, bytes = received, "object downloaded");
    Ok(())
}

/// Blocking [`Read`] over body chunks sent by the HTTP task.
struct ChunkReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    current: Vec<u8>,
    pos: usize,
}

impl ChunkReader {
    fn new(rx: mpsc::Receiver<io::Result<Vec<u8>>>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let remaining = &self.current[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObjectUrl {
    url: String,
    host: String,
    canonical_uri: String,
}

impl ObjectUrl {
    /// Virtual-hosted style on AWS, path style on custom endpoints.
    fn for_source(source: &ObjectStorageSource) -> Self {
        let encoded_key = source
            .key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        match &source.endpoint_url {
            Some(endpoint) => {
                let endpoint = endpoint.trim_end_matches('/');
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                let canonical_uri = format!("/{}/{}", uri_encode(&source.bucket), encoded_key);
                let base = if endpoint.contains("://") {
                    endpoint.to_string()
                } else {
                    format!("https://{endpoint}")
                };
                Self {
                    url: format!("{base}{canonical_uri}"),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", source.bucket, source.region);
                let canonical_uri = format!("/{encoded_key}");
                Self {
                    url: format!("https://{host}{canonical_uri}"),
                    host,
                    canonical_uri,
                }
            }
        }
    }
}

/// SigV4 headers for a GET with an empty body.
fn sign_get(
    target: &ObjectUrl,
    creds: &AwsCredentials,
    region: &str,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let payload_hash = hex_sha256(b"");

    let mut headers = vec![
        ("host".to_string(), target.host.clone()),
        ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(token) = &creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect();
    let canonical_request = format!(
        "GET\n{}\n\n{}\n{}\n{}",
        target.canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{date_stamp}/{region}/s3/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex_sha256(canonical_request.as_bytes())
    );
    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    headers.push((
        "authorization".to_string(),
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            creds.access_key_id
        ),
    ));
    headers
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only unreserved characters pass through.
fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{collect, SourceFormat};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn source(endpoint: Option<String>) -> ObjectStorageSource {
        ObjectStorageSource {
            bucket: "zlv-extracts".into(),
            key: "lovac/2024 owners.csv".into(),
            region: "eu-west-3".into(),
            endpoint_url: endpoint,
            access_key_id: Some("AKIDEXAMPLE".into()),
            secret_access_key: Some("secret".into()),
            session_token: None,
            format: Some(SourceFormat::Csv),
            delimiter: ',',
            timeout_secs: 5,
        }
    }

    #[test]
    fn signing_key_matches_published_vector() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn keys_are_encoded_per_segment() {
        assert_eq!(uri_encode("2024 owners.csv"), "2024%20owners.csv");
        let aws = ObjectUrl::for_source(&source(None));
        assert_eq!(
            aws.url,
            "https://zlv-extracts.s3.eu-west-3.amazonaws.com/lovac/2024%20owners.csv"
        );
        let minio = ObjectUrl::for_source(&source(Some("http://localhost:9000/".into())));
        assert_eq!(minio.host, "localhost:9000");
        assert_eq!(minio.canonical_uri, "/zlv-extracts/lovac/2024%20owners.csv");
        assert_eq!(
            minio.url,
            "http://localhost:9000/zlv-extracts/lovac/2024%20owners.csv"
        );
    }

    #[test]
    fn signed_headers_carry_scope_and_token() {
        let mut creds = AwsCredentials::resolve(&source(None)).expect("creds");
        creds.session_token = Some("token".into());
        let now = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .expect("date")
            .with_timezone(&Utc);
        let headers = sign_get(&ObjectUrl::for_source(&source(None)), &creds, "eu-west-3", now);
        let auth = headers
            .iter()
            .find(|(k, _)| k == "authorization")
            .map(|(_, v)| v.clone())
            .expect("authorization");
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240301/eu-west-3/s3/aws4_request"
        ));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-security-token"));
        assert!(headers.iter().any(|(k, v)| k == "x-amz-date" && v == "20240301T100000Z"));
    }

    #[test]
    fn half_configured_credentials_are_rejected() {
        let mut config = source(None);
        config.secret_access_key = None;
        assert!(matches!(
            AwsCredentials::resolve(&config),
            Err(SourceError::Credentials(_))
        ));
    }

    #[tokio::test]
    async fn missing_credentials_surface_as_stream_error() {
        let mut config = source(None);
        config.access_key_id = None;
        let repo = ObjectStorageRepository::new(config, RecordKind::Owner, 4);
        let err = collect(&repo, &StreamOptions::all())
            .await
            .expect_err("credentials");
        assert!(matches!(err, SourceError::Credentials(_)));
    }

    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn streams_object_body_from_custom_endpoint() {
        let (endpoint, server) = serve_once(
            "200 OK",
            "idpersonne,full_name\n01000001,DUPONT JEAN\n75000001,MARTIN ANNE\n",
        )
        .await;
        let repo = ObjectStorageRepository::new(source(Some(endpoint)), RecordKind::Owner, 2);
        let rows = collect(&repo, &StreamOptions::parse("01"))
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("full_name"), Some("DUPONT JEAN"));

        let request = server.await.expect("server");
        assert!(request.starts_with("GET /zlv-extracts/lovac/2024%20owners.csv HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: aws4-hmac-sha256"));
    }

    #[tokio::test]
    async fn http_failure_status_is_a_source_error() {
        let (endpoint, _server) = serve_once("403 Forbidden", "denied").await;
        let repo = ObjectStorageRepository::new(source(Some(endpoint)), RecordKind::Owner, 2);
        let err = collect(&repo, &StreamOptions::all()).await.expect_err("403");
        assert!(matches!(err, SourceError::Http(ref m) if m.contains("403")), "{err}");
    }
}
