//! Amazon SQS queue service over the HTTPS Query API.
//!
//! Requests are plain HTTP POSTs to the queue URL, signed with AWS Signature
//! Version 4. No AWS SDK is involved, which keeps request building and
//! response parsing testable without network access.
//!
//! ## Operation Mapping
//!
//! | QueueService      | SQS action              |
//! |-------------------|-------------------------|
//! | `enqueue`         | SendMessage             |
//! | `dequeue_batch`   | ReceiveMessage          |
//! | `delete_message`  | DeleteMessage           |
//! | `extend_lease`    | ChangeMessageVisibility |
//!
//! ## Credentials
//!
//! Taken from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and, for temporary
//! credentials, `AWS_SESSION_TOKEN`. The region comes from the queue URL.

use crate::error::{ConfigurationError, ServiceError};
use crate::message::{LeaseToken, QueueRef, RawMessage};
use crate::service::QueueService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";

/// SQS refuses long polls over 20 seconds
const MAX_WAIT_SECONDS: u32 = 20;

/// SQS returns at most 10 messages per receive
const MAX_RECEIVE_COUNT: u32 = 10;

/// SQS refuses bodies over 256 KiB
const MAX_BODY_BYTES: usize = 256 * 1024;

// ============================================================================
// Credentials
// ============================================================================

/// Static AWS credentials
#[derive(Clone)]
pub struct SqsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl SqsCredentials {
    /// Create long-term credentials
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Attach a session token for temporary credentials
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Read credentials from the standard AWS environment variables
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let access_key_id = non_empty_env("AWS_ACCESS_KEY_ID")?;
        let secret_access_key = non_empty_env("AWS_SECRET_ACCESS_KEY")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl fmt::Debug for SqsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn non_empty_env(key: &str) -> Result<String, ConfigurationError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigurationError::Missing {
            key: key.to_string(),
        })
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for SQS requests
///
/// 1. Canonical request (method, path, empty query, signed headers, body hash)
/// 2. String to sign (algorithm, timestamp, scope, request hash)
/// 3. Signing key from the date/region/service HMAC chain
/// 4. Authorization header
#[derive(Clone)]
struct SigV4Signer {
    credentials: SqsCredentials,
    region: String,
    service: &'static str,
}

impl SigV4Signer {
    fn new(credentials: SqsCredentials, region: String) -> Self {
        Self {
            credentials,
            region,
            service: "sqs",
        }
    }

    /// Headers to attach to a POST of `body` to `host` + `path`
    fn sign_request(
        &self,
        host: &str,
        path: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(ref token) = self.credentials.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));
        let canonical_uri = if path.is_empty() { "/" } else { path };

        let canonical_request = format!(
            "POST\n{}\n\n{}\n{}\n{}",
            canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{:x}",
            algorithm,
            amz_date,
            credential_scope,
            Sha256::digest(canonical_request.as_bytes())
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization),
            ("x-amz-date".to_string(), amz_date),
        ];
        if let Some(ref token) = self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        headers
    }

    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");

        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ============================================================================
// SQS Queue Service
// ============================================================================

/// Queue service backed by Amazon SQS (or anything speaking its Query API)
///
/// Queue references must be full queue URLs; requests go to the URL's host.
pub struct SqsQueueService {
    http_client: HttpClient,
    signer: SigV4Signer,
}

impl SqsQueueService {
    /// Create a service for one region with explicit credentials
    pub fn new(
        region: impl Into<String>,
        credentials: SqsCredentials,
    ) -> Result<Self, ConfigurationError> {
        let region = region.into();
        if region.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "region cannot be empty".to_string(),
            });
        }

        // Long polls last up to 20 seconds; leave headroom over that
        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(
                u64::from(MAX_WAIT_SECONDS) + 10,
            ))
            .build()
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            signer: SigV4Signer::new(credentials, region),
        })
    }

    /// Derive a service from a queue URL and the environment's credentials
    pub fn from_queue_ref(queue: &QueueRef) -> Result<Self, ConfigurationError> {
        let region = queue.region().ok_or_else(|| ConfigurationError::Invalid {
            message: format!("cannot derive a region from queue reference '{}'", queue),
        })?;

        Self::new(region, SqsCredentials::from_env()?)
    }

    /// Region every request is signed for
    pub fn region(&self) -> &str {
        &self.signer.region
    }

    /// POST one Query API action to the queue URL and return the response body
    async fn call(
        &self,
        queue: &QueueRef,
        action: &str,
        params: &[(&str, String)],
    ) -> Result<String, ServiceError> {
        let url = url::Url::parse(queue.as_str()).map_err(|e| ServiceError::QueueNotFound {
            queue: format!("{} ({})", queue, e),
        })?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ServiceError::QueueNotFound {
                    queue: queue.to_string(),
                })
            }
        };

        let body = encode_form(action, params);
        let headers = self
            .signer
            .sign_request(&host, url.path(), &body, &Utc::now());

        let mut request = self
            .http_client
            .post(url.as_str())
            .header("content-type", "application/x-www-form-urlencoded");
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::ConnectionFailed {
                    message: format!("request timeout: {}", e),
                }
            } else {
                ServiceError::ConnectionFailed {
                    message: format!("HTTP request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| ServiceError::ConnectionFailed {
                message: format!("failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            let error = parse_error_response(&response_body, status.as_u16());
            warn!(queue = %queue, action, status = status.as_u16(), error = %error, "SQS request failed");
            return Err(error);
        }

        Ok(response_body)
    }
}

impl fmt::Debug for SqsQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsQueueService")
            .field("region", &self.signer.region)
            .field("credentials", &self.signer.credentials)
            .finish()
    }
}

#[async_trait]
impl QueueService for SqsQueueService {
    async fn enqueue(
        &self,
        queue: &QueueRef,
        body: String,
        delay_seconds: u32,
    ) -> Result<(), ServiceError> {
        if body.len() > MAX_BODY_BYTES {
            return Err(ServiceError::Provider {
                code: "MessageTooLong".to_string(),
                message: format!("{} bytes (max: {})", body.len(), MAX_BODY_BYTES),
            });
        }

        self.call(
            queue,
            "SendMessage",
            &[
                ("MessageBody", body),
                ("DelaySeconds", delay_seconds.to_string()),
            ],
        )
        .await?;

        debug!(queue = %queue, delay_seconds, "Message sent");
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        queue: &QueueRef,
        max_count: u32,
        lease_seconds: u32,
        wait_seconds: u32,
    ) -> Result<Vec<RawMessage>, ServiceError> {
        let response = self
            .call(
                queue,
                "ReceiveMessage",
                &[
                    (
                        "MaxNumberOfMessages",
                        max_count.clamp(1, MAX_RECEIVE_COUNT).to_string(),
                    ),
                    ("VisibilityTimeout", lease_seconds.to_string()),
                    (
                        "WaitTimeSeconds",
                        wait_seconds.min(MAX_WAIT_SECONDS).to_string(),
                    ),
                    ("AttributeName.1", "ApproximateReceiveCount".to_string()),
                ],
            )
            .await?;

        parse_receive_message_response(&response)
    }

    async fn delete_message(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
    ) -> Result<(), ServiceError> {
        self.call(
            queue,
            "DeleteMessage",
            &[("ReceiptHandle", lease_token.as_str().to_string())],
        )
        .await?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        queue: &QueueRef,
        lease_token: &LeaseToken,
        lease_seconds: u32,
    ) -> Result<(), ServiceError> {
        self.call(
            queue,
            "ChangeMessageVisibility",
            &[
                ("ReceiptHandle", lease_token.as_str().to_string()),
                ("VisibilityTimeout", lease_seconds.to_string()),
            ],
        )
        .await?;
        Ok(())
    }
}

// ============================================================================
// Request and Response Encoding
// ============================================================================

fn encode_form(action: &str, params: &[(&str, String)]) -> String {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    form.append_pair("Action", action);
    form.append_pair("Version", API_VERSION);
    for (key, value) in params {
        form.append_pair(key, value);
    }
    form.finish()
}

/// Parse a ReceiveMessage XML response
fn parse_receive_message_response(xml: &str) -> Result<Vec<RawMessage>, ServiceError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut in_message = false;
    let mut current_receipt_handle: Option<String> = None;
    let mut current_body: Option<String> = None;
    let mut current_receive_count: u32 = 1;

    let mut in_receipt_handle = false;
    let mut in_body = false;
    let mut in_attribute_name = false;
    let mut in_attribute_value = false;
    let mut current_attribute_name: Option<String> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = true;
                    current_receipt_handle = None;
                    current_body = None;
                    current_receive_count = 1;
                }
                b"ReceiptHandle" if in_message => in_receipt_handle = true,
                b"Body" if in_message => in_body = true,
                b"Name" if in_message => in_attribute_name = true,
                b"Value" if in_message => in_attribute_value = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) if in_message && e.name().as_ref() == b"Body" => {
                current_body = Some(String::new());
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map(|s| s.into_owned())
                    .map_err(|e| ServiceError::Provider {
                        code: "MalformedResponse".to_string(),
                        message: format!("XML unescape failed: {}", e),
                    })?;
                if in_receipt_handle {
                    current_receipt_handle = Some(text);
                    in_receipt_handle = false;
                } else if in_body {
                    current_body = Some(text);
                    in_body = false;
                } else if in_attribute_name {
                    current_attribute_name = Some(text);
                    in_attribute_name = false;
                } else if in_attribute_value {
                    if current_attribute_name.as_deref() == Some("ApproximateReceiveCount") {
                        current_receive_count = text.parse().unwrap_or(1);
                    }
                    in_attribute_value = false;
                    current_attribute_name = None;
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = false;
                    if let Some(receipt_handle) = current_receipt_handle.take() {
                        messages.push(RawMessage::new(
                            current_body.take().unwrap_or_default(),
                            LeaseToken::new(receipt_handle),
                            current_receive_count,
                        ));
                    }
                }
                b"Body" => in_body = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ServiceError::Provider {
                    code: "MalformedResponse".to_string(),
                    message: format!("XML parsing error: {}", e),
                })
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

/// Parse an SQS error response into a service error
fn parse_error_response(xml: &str, status_code: u16) -> ServiceError {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut error_code = None;
    let mut error_message = None;
    let mut in_error = false;
    let mut in_code = false;
    let mut in_message = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Error" => in_error = true,
                b"Code" if in_error => in_code = true,
                b"Message" if in_error => in_message = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_code {
                    error_code = e.unescape().ok().map(|s| s.into_owned());
                    in_code = false;
                } else if in_message {
                    error_message = e.unescape().ok().map(|s| s.into_owned());
                    in_message = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Error" => {
                in_error = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    let code = error_code.unwrap_or_else(|| "Unknown".to_string());
    let message = error_message.unwrap_or_else(|| format!("HTTP status {}", status_code));

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            ServiceError::QueueNotFound { queue: message }
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch"
        | "ExpiredToken" | "AccessDenied" => ServiceError::AuthenticationFailed {
            message: format!("{}: {}", code, message),
        },
        "ReceiptHandleIsInvalid" | "InvalidReceiptHandle" | "MessageNotInflight" => {
            ServiceError::InvalidLeaseToken {
                lease_token: message,
            }
        }
        "Throttling" | "ThrottlingException" | "RequestThrottled" => {
            ServiceError::Throttled { message }
        }
        _ if status_code == 401 || status_code == 403 => ServiceError::AuthenticationFailed {
            message: format!("{}: {}", code, message),
        },
        _ => ServiceError::Provider { code, message },
    }
}
