use crate::network::errors::{
    outcome_for_status, FailureReason, FetchFailure, FetchOutcome, FetchedImage, NetworkError,
};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::time::Duration;

// * Content-type fragments that mark a page or API response instead of an image
const NON_IMAGE_MARKERS: &[&str] = &["text/", "html", "json", "xml", "javascript"];

// * How a response head is treated before the body is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    // * 2xx with image/*
    Image,
    // * 2xx with no or a generic content type; the decoder decides
    Speculative,
    // * 2xx that is clearly not an image
    UnsupportedMedia,
    // * Any non-2xx status
    HttpFailure,
}

// * Classifies a response from its status and Content-Type alone.
pub fn classify_response(status: u16, content_type: Option<&str>) -> ResponseClass {
    if !(200..300).contains(&status) {
        return ResponseClass::HttpFailure;
    }
    let content_type = match content_type {
        Some(ct) => ct.trim().to_ascii_lowercase(),
        None => return ResponseClass::Speculative,
    };
    if content_type.starts_with("image/") {
        ResponseClass::Image
    } else if NON_IMAGE_MARKERS.iter().any(|m| content_type.contains(m)) {
        ResponseClass::UnsupportedMedia
    } else {
        ResponseClass::Speculative
    }
}

// * The HTTP engine for image downloads.
// * One shared client; connection pooling is per host inside reqwest.
#[derive(Debug, Clone)]
pub struct ImageClient {
    inner: Client,
    max_body_bytes: usize,
}

impl ImageClient {
    // * @param timeout - whole-request timeout, connect included
    // * @param max_body_bytes - responses larger than this are dropped; 0 disables the cap
    pub fn new(timeout: Duration, max_body_bytes: usize) -> Result<Self, NetworkError> {
        let inner = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            inner,
            max_body_bytes,
        })
    }

    // * Performs one GET and turns every result into a FetchOutcome. Never errors.
    pub async fn fetch(&self, url: &str, headers: HeaderMap) -> FetchOutcome {
        let resp = match self.inner.get(url).headers(headers).send().await {
            Ok(resp) => resp,
            Err(e) => return transport_outcome(&e),
        };

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match classify_response(status.as_u16(), content_type.as_deref()) {
            ResponseClass::HttpFailure => return outcome_for_status(status.as_u16()),
            ResponseClass::UnsupportedMedia => {
                return FetchOutcome::Retryable(FetchFailure::new(
                    FailureReason::UnsupportedMedia,
                    Some(status.as_u16()),
                ))
            }
            ResponseClass::Image | ResponseClass::Speculative => {}
        }

        if self.max_body_bytes > 0 {
            if let Some(len) = resp.content_length() {
                if len > self.max_body_bytes as u64 {
                    return too_large(status);
                }
            }
        }

        self.read_body(resp, status, content_type).await
    }

    // * Reads the body chunk by chunk so an unbounded response cannot exhaust memory
    async fn read_body(
        &self,
        mut resp: reqwest::Response,
        status: StatusCode,
        content_type: Option<String>,
    ) -> FetchOutcome {
        let mut bytes = Vec::new();
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    if self.max_body_bytes > 0 && bytes.len() + chunk.len() > self.max_body_bytes {
                        return too_large(status);
                    }
                    bytes.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return transport_outcome(&e),
            }
        }

        FetchOutcome::Success(FetchedImage {
            bytes,
            status: status.as_u16(),
            content_type,
        })
    }
}

fn too_large(status: StatusCode) -> FetchOutcome {
    FetchOutcome::Permanent(FetchFailure::new(
        FailureReason::TooLarge,
        Some(status.as_u16()),
    ))
}

// * Transport errors are all worth retrying; the reason is kept for stats
fn transport_outcome(e: &reqwest::Error) -> FetchOutcome {
    let reason = if e.is_timeout() {
        FailureReason::Timeout
    } else if e.is_connect() {
        FailureReason::Connect
    } else {
        FailureReason::Transport
    };
    FetchOutcome::Retryable(FetchFailure::new(reason, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_response() {
        assert_eq!(classify_response(200, Some("image/jpeg")), ResponseClass::Image);
        assert_eq!(classify_response(200, Some("IMAGE/PNG")), ResponseClass::Image);
        assert_eq!(classify_response(200, None), ResponseClass::Speculative);
        assert_eq!(
            classify_response(200, Some("application/octet-stream")),
            ResponseClass::Speculative
        );
        assert_eq!(
            classify_response(200, Some("text/html; charset=utf-8")),
            ResponseClass::UnsupportedMedia
        );
        assert_eq!(
            classify_response(200, Some("application/json")),
            ResponseClass::UnsupportedMedia
        );
        assert_eq!(classify_response(404, Some("image/png")), ResponseClass::HttpFailure);
        assert_eq!(classify_response(301, None), ResponseClass::HttpFailure);
    }
}
