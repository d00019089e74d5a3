// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed client-visible rejections

use minhttp::response::{text, GenericResponse, StatusCode};

/// Reasons a sender or receiver registration is refused.
///
/// The exact message text, including the `[ERROR]`/`Error:` prefix split, is
/// part of the wire contract and matched by client tooling; don't edit the
/// strings.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Reject {
    #[error("[ERROR] Cannot send to a reserved path '{path}'. (e.g. '/mypath123')")]
    ReservedPath { path: String },

    #[error("[ERROR] n should > 0, but n = {n}.")]
    BadCount { n: i64 },

    #[error("[ERROR] Connection on '{path}' has been established already.")]
    SenderAlreadyEstablished { path: String },

    #[error("Error: Connection on '{path}' has been established already.")]
    ReceiverAlreadyEstablished { path: String },

    #[error("Error: The number of receivers should be {expected} but {requested}.")]
    CountMismatch { expected: u64, requested: i64 },

    #[error("[ERROR] Another sender has been registered on '{path}'.")]
    DuplicateSender { path: String },

    #[error("Error: The number of receivers has reached limits.")]
    ReceiversFull,
}

impl Reject {
    /// Render as the 400 plain-text response the client sees.
    pub fn into_response(self) -> GenericResponse {
        text(StatusCode::BAD_REQUEST, format!("{self}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_the_wire_contract() {
        let cases = [
            (
                Reject::ReservedPath {
                    path: "/version".into(),
                },
                "[ERROR] Cannot send to a reserved path '/version'. (e.g. '/mypath123')",
            ),
            (
                Reject::BadCount { n: -1 },
                "[ERROR] n should > 0, but n = -1.",
            ),
            (
                Reject::SenderAlreadyEstablished { path: "/p".into() },
                "[ERROR] Connection on '/p' has been established already.",
            ),
            (
                Reject::ReceiverAlreadyEstablished { path: "/p".into() },
                "Error: Connection on '/p' has been established already.",
            ),
            (
                Reject::CountMismatch {
                    expected: 2,
                    requested: 3,
                },
                "Error: The number of receivers should be 2 but 3.",
            ),
            (
                Reject::DuplicateSender { path: "/p".into() },
                "[ERROR] Another sender has been registered on '/p'.",
            ),
            (
                Reject::ReceiversFull,
                "Error: The number of receivers has reached limits.",
            ),
        ];
        for (reject, expected) in cases {
            assert_eq!(reject.to_string(), expected);
        }
    }

    #[test]
    fn responses_are_400_with_a_trailing_newline() {
        let response = Reject::ReceiversFull.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = futures::executor::block_on(http_body_util::BodyExt::collect(
            response.into_body(),
        ))
        .unwrap()
        .to_bytes();
        assert_eq!(body, "Error: The number of receivers has reached limits.\n");
    }
}
