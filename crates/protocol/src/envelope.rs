use serde::{Deserialize, Serialize};

/// Envelope code for a successful call.
pub const CODE_OK: i32 = 0;

/// Envelope code used by the service for a generic rejection.
pub const CODE_REJECTED: i32 = 1;

/// Envelope returned by every upload service call: `{code, data, message}`.
///
/// `code == 0` means success; any other value is a server-side rejection
/// and `data` may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default)]
    pub message: String,
}

impl<T> ApiResponse<T> {
    /// Creates a successful response carrying `data`.
    pub fn ok(data: T) -> Self {
        Self {
            code: CODE_OK,
            data: Some(data),
            message: "ok".into(),
        }
    }

    /// Creates a rejection with the given code and message.
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            message: message.into(),
        }
    }

    /// Returns `true` if the code signals success.
    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }

    /// Returns the payload of a successful response.
    ///
    /// A non-zero code or a missing payload yields `Err` with a
    /// human-readable reason.
    pub fn into_data(self) -> Result<T, String> {
        if !self.is_success() {
            return Err(format!("code {}: {}", self.code, self.message));
        }
        self.data
            .ok_or_else(|| "response carried no data".to_string())
    }
}
