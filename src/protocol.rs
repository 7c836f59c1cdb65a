//! Request and response envelopes exchanged between client and server.

use serde::{Deserialize, Serialize};

use crate::sqlite::{Params, Row};

/// A statement (or script) to execute remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Identity of the issuing worker.
    pub client_id: String,
    /// One statement, or a multi-statement script when `execute_script` is set.
    pub query: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub execute_many: bool,
    #[serde(default)]
    pub execute_script: bool,
}

impl Request {
    pub fn new(client_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            query: query.into(),
            params: Params::default(),
            execute_many: false,
            execute_script: false,
        }
    }

    pub fn with_params(mut self, params: impl Into<Params>) -> Self {
        self.params = params.into();
        self
    }

    pub fn execute_many(mut self, execute_many: bool) -> Self {
        self.execute_many = execute_many;
        self
    }

    pub fn execute_script(mut self, execute_script: bool) -> Self {
        self.execute_script = execute_script;
        self
    }

    /// `execute_many` and `execute_script` are mutually exclusive.
    pub fn has_conflicting_modes(&self) -> bool {
        self.execute_many && self.execute_script
    }
}

/// A query failure summarized for the wire, without a stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Result of executing a [`Request`].
///
/// When `error` is set, `items` is empty and `rowcount`/`lastrowid` are
/// absent. Callers branch on [`Response::error`] rather than catching
/// anything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub items: Vec<Row>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rowcount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastrowid: Option<i64>,
}

impl Response {
    pub fn rows(items: Vec<Row>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn failure(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_rowcount(mut self, rowcount: Option<i64>) -> Self {
        self.rowcount = rowcount;
        self
    }

    pub fn with_lastrowid(mut self, lastrowid: Option<i64>) -> Self {
        self.lastrowid = lastrowid;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }
}
