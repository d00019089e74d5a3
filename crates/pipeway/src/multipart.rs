// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multipart pre-stage: substitute a sender's body with its first part
//!
//! A browser form upload wraps the interesting bytes in a multipart
//! envelope. Receivers want the file, not the envelope, so the transfer
//! engine swaps the source for the first part's payload and takes content
//! metadata from the part's own headers.

use anyhow::Context;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};

use crate::body::{BodyStream, RelayBody};

/// True when a sender's `Content-Type` carries the `multipart/form-data`
/// token.
pub fn is_multipart(content_type: Option<&HeaderValue>) -> bool {
    content_type
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("multipart/form-data"))
}

/// The first part of a multipart upload: content metadata plus payload.
pub struct FirstPart {
    pub content_type: Option<HeaderValue>,
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, anyhow::Error>>,
}

impl std::fmt::Debug for FirstPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstPart")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Read the multipart envelope up to the first part.
///
/// The returned stream yields only the part's payload; the envelope never
/// reaches receivers, and any later parts are ignored. Parse failures
/// surface to the caller as source errors.
pub async fn first_part(
    body: RelayBody,
    content_type: &HeaderValue,
) -> Result<FirstPart, anyhow::Error> {
    let content_type = content_type
        .to_str()
        .context("multipart content type is not valid UTF-8")?;
    let boundary =
        multer::parse_boundary(content_type).context("multipart content type has no boundary")?;

    let mut parts = multer::Multipart::new(BodyStream(body), boundary);
    let field = parts
        .next_field()
        .await
        .context("reading the first multipart part")?
        .context("multipart upload contains no parts")?;

    let part_content_type = field.headers().get(CONTENT_TYPE).cloned();
    let part_content_length = field
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok());

    // The Multipart travels with the field's chunks so the parser state
    // stays alive for exactly as long as the payload is being read.
    let stream = futures::stream::unfold((field, parts), |(mut field, parts)| async move {
        let item = match field.chunk().await {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(err) => Some(Err(anyhow::Error::from(err))),
        };
        item.map(|item| (item, (field, parts)))
    })
    .boxed();

    Ok(FirstPart {
        content_type: part_content_type,
        content_length: part_content_length,
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::Full;

    use crate::body;

    fn envelope_body(envelope: &'static str) -> RelayBody {
        body::erase(Full::new(Bytes::from(envelope)))
    }

    #[test]
    fn multipart_detection_is_token_based() {
        let multipart = HeaderValue::from_static("multipart/form-data; boundary=abc");
        let uppercase = HeaderValue::from_static("MULTIPART/FORM-DATA; boundary=abc");
        let plain = HeaderValue::from_static("text/plain");
        assert!(is_multipart(Some(&multipart)));
        assert!(is_multipart(Some(&uppercase)));
        assert!(!is_multipart(Some(&plain)));
        assert!(!is_multipart(None));
    }

    #[tokio::test]
    async fn extracts_the_first_part_payload_and_type() {
        let envelope = concat!(
            "--sep\r\n",
            "Content-Disposition: form-data; name=\"input_file\"; filename=\"a.bin\"\r\n",
            "Content-Type: application/octet-stream\r\n",
            "\r\n",
            "binary\0payload\r\n",
            "--sep--\r\n",
        );
        let content_type = HeaderValue::from_static("multipart/form-data; boundary=sep");

        let part = first_part(envelope_body(envelope), &content_type)
            .await
            .unwrap();
        assert_eq!(
            part.content_type.as_ref().unwrap(),
            "application/octet-stream"
        );
        assert_eq!(part.content_length, None);

        let chunks: Vec<_> = part.stream.collect().await;
        let payload: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(payload, b"binary\0payload");
    }

    #[tokio::test]
    async fn later_parts_are_ignored() {
        let envelope = concat!(
            "--sep\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "first\r\n",
            "--sep\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>second</p>\r\n",
            "--sep--\r\n",
        );
        let content_type = HeaderValue::from_static("multipart/form-data; boundary=sep");

        let part = first_part(envelope_body(envelope), &content_type)
            .await
            .unwrap();
        let payload = part
            .stream
            .map(|chunk| chunk.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(payload, b"first");
    }

    #[tokio::test]
    async fn missing_boundary_is_an_error() {
        let content_type = HeaderValue::from_static("multipart/form-data");
        let err = first_part(envelope_body("whatever"), &content_type)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boundary"));
    }

    #[tokio::test]
    async fn empty_envelope_is_an_error() {
        let content_type = HeaderValue::from_static("multipart/form-data; boundary=sep");
        assert!(first_part(envelope_body(""), &content_type).await.is_err());
    }
}
