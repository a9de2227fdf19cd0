//! Translation of FormBD status codes into the bridge's symbolic vocabulary.

use std::ffi::CStr;
use std::fmt;

use crate::engine::StatusCode;

/// Symbolic outcome of a native call, as exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidArg,
    NotFound,
    PermissionDenied,
    AlreadyExists,
    ConstraintViolation,
    TypeMismatch,
    OutOfMemory,
    IoError,
    Corruption,
    Conflict,
    InternalError,
}

/// The FormBD ABI status table. Must stay in lockstep with the engine's
/// headers; entries are in declaration order of [`Status`].
const STATUS_TABLE: [(StatusCode, Status, &CStr); 12] = [
    (0, Status::Ok, c"ok"),
    (1, Status::InvalidArg, c"invalid_arg"),
    (2, Status::NotFound, c"not_found"),
    (3, Status::PermissionDenied, c"permission_denied"),
    (4, Status::AlreadyExists, c"already_exists"),
    (5, Status::ConstraintViolation, c"constraint_violation"),
    (6, Status::TypeMismatch, c"type_mismatch"),
    (7, Status::OutOfMemory, c"out_of_memory"),
    (8, Status::IoError, c"io_error"),
    (9, Status::Corruption, c"corruption"),
    (10, Status::Conflict, c"conflict"),
    (11, Status::InternalError, c"internal_error"),
];

impl Status {
    /// Every status, in ABI order.
    pub const ALL: [Status; 12] = [
        Status::Ok,
        Status::InvalidArg,
        Status::NotFound,
        Status::PermissionDenied,
        Status::AlreadyExists,
        Status::ConstraintViolation,
        Status::TypeMismatch,
        Status::OutOfMemory,
        Status::IoError,
        Status::Corruption,
        Status::Conflict,
        Status::InternalError,
    ];

    /// Maps a native code to its status. Unknown codes are never guessed at:
    /// they all become [`Status::InternalError`].
    pub fn from_code(code: StatusCode) -> Self {
        STATUS_TABLE
            .iter()
            .find(|(known, _, _)| *known == code)
            .map(|(_, status, _)| *status)
            .unwrap_or(Status::InternalError)
    }

    /// The native code for this status.
    pub fn code(self) -> StatusCode {
        STATUS_TABLE[self as usize].0
    }

    /// Symbolic name, e.g. `"not_found"`.
    pub fn as_str(self) -> &'static str {
        // Table names are ASCII.
        self.as_c_str().to_str().unwrap_or_default()
    }

    /// [`as_str`](Self::as_str) as a NUL-terminated string, for C callers.
    pub fn as_c_str(self) -> &'static CStr {
        STATUS_TABLE[self as usize].2
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
