// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Static endpoints on the reserved paths

use hyper::header::{HeaderMap, HOST};
use hyper::StatusCode;

use minhttp::response::{html, text, GenericResponse};

const LANDING: &str = concat!(
    "<!DOCTYPE html>\n",
    "<html>\n",
    "<head>\n",
    "  <title>pipeway</title>\n",
    "  <meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">\n",
    "</head>\n",
    "<body>\n",
    "  <h1>pipeway</h1>\n",
    "  <p>Streaming HTTP rendezvous relay. Pick any path; one sender and one\n",
    "  or more receivers meet there and bytes flow straight through.</p>\n",
    "  <pre>\n",
    "  # send\n",
    "  curl -T myfile https://example.com/mypath\n",
    "\n",
    "  # receive\n",
    "  curl https://example.com/mypath &gt; myfile\n",
    "  </pre>\n",
    "  <p>See <a href=\"/help\">/help</a> for more examples.</p>\n",
    "</body>\n",
    "</html>\n",
);

/// `GET /` landing page.
pub fn index() -> GenericResponse {
    html(StatusCode::OK, LANDING)
}

/// `GET /version` version string.
pub fn version() -> GenericResponse {
    text(StatusCode::OK, concat!(env!("CARGO_PKG_VERSION"), "\n"))
}

/// `GET /help` usage text, built around the externally visible base URL.
///
/// The scheme is `https` iff a proxy says so via `X-Forwarded-Proto`; the
/// host comes from the `Host` header, falling back to the bind address.
pub fn help(headers: &HeaderMap, fallback_host: &str) -> GenericResponse {
    let scheme = if headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("https"))
    {
        "https"
    } else {
        "http"
    };
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(fallback_host);
    let base = format!("{scheme}://{host}");

    text(
        StatusCode::OK,
        format!(
            "Usage\n\
             =====\n\
             Transfer a byte stream between machines that can both reach this relay.\n\
             Pick any path; it becomes a one-shot meeting point.\n\
             \n\
             Send a file:         curl -T myfile {base}/mypath\n\
             Receive it:          curl {base}/mypath > myfile\n\
             \n\
             Send to 3 receivers: curl -T myfile '{base}/mypath?n=3'\n\
             Each receiver runs:  curl '{base}/mypath?n=3' > copy\n\
             \n\
             Pipes work too:\n\
             \n\
                 tar czf - ./dir | curl -T - {base}/dir.tgz\n\
                 curl {base}/dir.tgz | tar xzf -\n\
             \n\
             Nothing is stored: the sender blocks until the receivers have\n\
             taken every byte, and the path is forgotten afterwards.\n"
        ),
    )
}
