//! Request accumulation and outcomes.
//!
//! At most one request is in flight per connection. While it runs, token
//! dispatch mutates the [`ActiveRequest`] accumulator; when the response's
//! final message boundary arrives the accumulator is consumed into a
//! [`RequestOutcome`] handed back to the caller.

use tds_wire::token::{ColumnDef, ReturnValue, Row};

use crate::error::RequestError;

/// The single in-flight request.
#[derive(Debug, Default)]
pub(crate) struct ActiveRequest {
    /// Rows kept until completion (`row_collection_on_request_completion`).
    pub rows: Vec<Row>,
    /// Rows kept per completion token (`row_collection_on_done`).
    pub rst: Vec<Row>,
    /// Sum of row counts over all completion tokens.
    pub row_count: u64,
    /// First request-scoped error observed.
    pub error: Option<RequestError>,
    /// Set by a DONE token carrying the attention bit.
    pub canceled: bool,
    /// Result-set columns, deduplicated when configured.
    pub columns: Option<Vec<ColumnDef>>,
    /// Output parameters from the procedure.
    pub return_values: Vec<ReturnValue>,
    /// Return status of the procedure, from the last DONEPROC.
    pub return_status: Option<i32>,
}

impl ActiveRequest {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a request-scoped error, keeping the first one.
    pub(crate) fn record_error(&mut self, error: RequestError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// The result of a completed request.
///
/// Mirrors the completion callback contract: even a failed or canceled
/// request reports the row count and collected rows observed before its
/// terminal token.
#[derive(Debug)]
pub struct RequestOutcome {
    /// Request-scoped error, if any. The connection survives these.
    pub error: Option<RequestError>,
    /// Sum of row counts across all completion tokens.
    pub row_count: u64,
    /// Collected rows, when row collection was enabled.
    pub rows: Vec<Row>,
    /// Result-set columns as forwarded to the request.
    pub columns: Vec<ColumnDef>,
    /// Procedure output parameters.
    pub return_values: Vec<ReturnValue>,
    /// Procedure return status.
    pub return_status: Option<i32>,
}

impl RequestOutcome {
    /// Outcome of a request that was rejected before anything was sent.
    #[must_use]
    pub(crate) fn rejected(error: RequestError) -> Self {
        Self {
            error: Some(error),
            row_count: 0,
            rows: Vec::new(),
            columns: Vec::new(),
            return_values: Vec::new(),
            return_status: None,
        }
    }

    pub(crate) fn from_request(request: ActiveRequest, error: Option<RequestError>) -> Self {
        Self {
            error: error.or(request.error),
            row_count: request.row_count,
            rows: request.rows,
            columns: request.columns.unwrap_or_default(),
            return_values: request.return_values,
            return_status: request.return_status,
        }
    }

    /// Whether the request completed without a request-scoped error.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Extract a 4-byte integer output parameter by name.
    ///
    /// The name comparison ignores a leading `@`, matching how the server
    /// reports prepared-statement handles.
    #[must_use]
    pub fn int_return_value(&self, name: &str) -> Option<i32> {
        let wanted = name.trim_start_matches('@');
        self.return_values.iter().find_map(|rv| {
            if rv.name.trim_start_matches('@') != wanted {
                return None;
            }
            let value = rv.value.as_ref()?;
            if value.len() == 4 {
                Some(i32::from_le_bytes([value[0], value[1], value[2], value[3]]))
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use bytes::Bytes;
    use tds_wire::types::TypeId;

    #[test]
    fn first_error_wins() {
        let mut request = ActiveRequest::new();
        request.record_error(RequestError::server("first", 100, 16));
        request.record_error(RequestError::server("second", 200, 16));
        assert_eq!(request.error.as_ref().map(|e| e.number), Some(Some(100)));
    }

    #[test]
    fn explicit_completion_error_overrides() {
        let mut request = ActiveRequest::new();
        request.row_count = 5;
        request.record_error(RequestError::server("boom", 1, 16));

        let outcome = RequestOutcome::from_request(request, Some(RequestError::canceled()));
        assert_eq!(outcome.error.map(|e| e.code), Some(ErrorCode::ECancel));
        assert_eq!(outcome.row_count, 5);
    }

    #[test]
    fn handle_extraction() {
        let mut request = ActiveRequest::new();
        request.return_values.push(ReturnValue {
            ordinal: 1,
            name: "handle".to_string(),
            type_id: TypeId::IntN,
            value: Some(Bytes::copy_from_slice(&7i32.to_le_bytes())),
        });

        let outcome = RequestOutcome::from_request(request, None);
        assert_eq!(outcome.int_return_value("@handle"), Some(7));
        assert_eq!(outcome.int_return_value("missing"), None);
    }
}
