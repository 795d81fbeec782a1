use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kernel::ErrorBody;

use crate::error::UploadError;

pub const UPLOAD_FAILED: &str = "upload failed, please retry";

/// Error response of the API.
#[derive(Debug)]
pub struct ErrorReply {
    status: StatusCode,
    body: ErrorBody,
}

impl ErrorReply {
    #[must_use]
    pub fn new(status: StatusCode, user_message: &str, error_code: &str, details: String) -> Self {
        Self {
            status,
            body: ErrorBody {
                user_message: user_message.to_owned(),
                error_code: error_code.to_owned(),
                error_details: details,
            },
        }
    }

    #[must_use]
    pub fn not_found(details: String) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found", "NOT_FOUND", details)
    }

    #[must_use]
    pub fn internal<E: ToString>(e: &E) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error",
            "INTERNAL_ERROR",
            e.to_string(),
        )
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn body(&self) -> &ErrorBody {
        &self.body
    }
}

impl From<&UploadError> for ErrorReply {
    fn from(e: &UploadError) -> Self {
        let status = if e.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let details = match e {
            UploadError::CriticalStorageFailure {
                asset_id, attempted, ..
            } => format!(
                "asset: {}; attempted disks: {}; {e}",
                asset_id.map_or_else(|| String::from("none"), |id| id.to_string()),
                attempted.join(", ")
            ),
            UploadError::TransactionCommit { asset_id, .. } => format!("asset: {asset_id}; {e}"),
            _ => e.to_string(),
        };
        Self::new(status, UPLOAD_FAILED, e.code(), details)
    }
}

impl IntoResponse for ErrorReply {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DiskError, DiskErrorKind};
    use rstest::rstest;
    use uuid::Uuid;

    #[rstest]
    #[case(UploadError::invalid_input("no extension"), StatusCode::BAD_REQUEST, "INVALID_INPUT")]
    #[case(
        UploadError::SourceRead { source: std::io::Error::other("reset") },
        StatusCode::BAD_REQUEST,
        "SOURCE_READ_FAILED"
    )]
    #[case(
        UploadError::CriticalStorageFailure { asset_id: None, attempted: vec![], failures: vec![] },
        StatusCode::INTERNAL_SERVER_ERROR,
        "CRITICAL_STORAGE_FAILURE"
    )]
    #[case(
        UploadError::Database { source: anyhow::anyhow!("locked") },
        StatusCode::INTERNAL_SERVER_ERROR,
        "DATABASE_ERROR"
    )]
    #[trace]
    fn upload_errors_map_to_status(
        #[case] e: UploadError,
        #[case] status: StatusCode,
        #[case] code: &str,
    ) {
        // Act
        let reply = ErrorReply::from(&e);

        // Assert
        assert_eq!(reply.status(), status);
        assert_eq!(reply.body().error_code, code);
        assert_eq!(reply.body().user_message, UPLOAD_FAILED);
    }

    #[test]
    fn storage_failure_details_name_asset_and_disks() {
        let id = Uuid::new_v4();
        let e = UploadError::CriticalStorageFailure {
            asset_id: Some(id),
            attempted: vec!["public".to_owned(), "local".to_owned()],
            failures: vec![DiskError::new("public", DiskErrorKind::IoFailure, "down")],
        };

        let reply = ErrorReply::from(&e);

        let details = &reply.body().error_details;
        assert!(details.contains(&id.to_string()));
        assert!(details.contains("attempted disks: public, local"));
        assert!(details.contains("down"));
    }
}
