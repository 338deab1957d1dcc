// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Each component reports failures through its own small enum (`ListError`,
//! `SemError`, ...). The facades fold those into a single composite
//! [`Error`] carrying a coarse [`ErrorKind`] plus the originating component
//! error as its [`Cause`], so a caller can branch on the kind without losing
//! the root cause. `Error::code` flattens the pair into one word for trace
//! records and debugger inspection.

use crate::list::ListError;
use crate::mq::QueueError;
use crate::mutex::MutexError;
use crate::ring::RingError;
use crate::sched::SchedError;
use crate::sem::SemError;
use crate::table::TableError;

/// Coarse classification of a kernel error, the part callers usually branch
/// on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A fixed capacity (registry slots, queue depth, duplicate id) was
    /// exhausted. Recoverable by the caller.
    CapacityExceeded,
    /// An id named something that does not exist.
    NotFound,
    /// The resource is momentarily unavailable (no tokens, owned elsewhere,
    /// ring full/empty). The blocking facades translate this into parking;
    /// callers only see it from the non-blocking variants.
    Contention,
    /// An internal invariant broke. The kernel status machine has moved to
    /// `Error`; this is a developer bug, not an operational condition.
    StructuralViolation,
    /// A state-machine transition was refused (e.g. `start` before `init`).
    UnexpectedState,
    /// An event wait ran out its timeout.
    Timeout,
}

/// The component error an [`Error`] was built from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Cause {
    List(ListError),
    Table(TableError),
    Ring(RingError),
    Sem(SemError),
    Mutex(MutexError),
    Queue(QueueError),
    Sched(SchedError),
}

/// Composite kernel error: classification plus originating component error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    cause: Option<Cause>,
}

impl Error {
    pub const fn new(kind: ErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub const fn with_cause(kind: ErrorKind, cause: Cause) -> Self {
        Self {
            kind,
            cause: Some(cause),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn cause(&self) -> Option<Cause> {
        self.cause
    }

    /// Packs this error into a single word: kind in the top byte, component
    /// in the next, component-specific reason in the low half. Zero never
    /// encodes an error.
    pub fn code(&self) -> u32 {
        let kind = match self.kind {
            ErrorKind::CapacityExceeded => 1u32,
            ErrorKind::NotFound => 2,
            ErrorKind::Contention => 3,
            ErrorKind::StructuralViolation => 4,
            ErrorKind::UnexpectedState => 5,
            ErrorKind::Timeout => 6,
        };
        let (component, reason) = match self.cause {
            None => (0u32, 0u32),
            Some(Cause::List(e)) => (1, e.reason()),
            Some(Cause::Table(e)) => (2, e.reason()),
            Some(Cause::Ring(e)) => (3, e.reason()),
            Some(Cause::Sem(e)) => (4, e.reason()),
            Some(Cause::Mutex(e)) => (5, e.reason()),
            Some(Cause::Queue(e)) => (6, e.reason()),
            Some(Cause::Sched(e)) => (7, e.reason()),
        };
        kind << 24 | component << 16 | reason
    }
}

impl From<TableError> for Error {
    fn from(e: TableError) -> Self {
        let kind = match e {
            TableError::Overflow => ErrorKind::CapacityExceeded,
            TableError::NullValue => ErrorKind::NotFound,
        };
        Error::with_cause(kind, Cause::Table(e))
    }
}

impl From<ListError> for Error {
    fn from(e: ListError) -> Self {
        // Both list failures indicate the kernel mismanaged its own lists.
        Error::with_cause(ErrorKind::StructuralViolation, Cause::List(e))
    }
}

impl From<RingError> for Error {
    fn from(e: RingError) -> Self {
        let kind = match e {
            RingError::PreventedOverwrite | RingError::NoElement => {
                ErrorKind::Contention
            }
            RingError::Oversize => ErrorKind::CapacityExceeded,
        };
        Error::with_cause(kind, Cause::Ring(e))
    }
}

impl From<SemError> for Error {
    fn from(e: SemError) -> Self {
        let kind = match e {
            SemError::NoTokens | SemError::ReachedMax => ErrorKind::Contention,
            SemError::TokenOverflow => ErrorKind::StructuralViolation,
            SemError::List(_) => ErrorKind::StructuralViolation,
        };
        Error::with_cause(kind, Cause::Sem(e))
    }
}

impl From<MutexError> for Error {
    fn from(e: MutexError) -> Self {
        let kind = match e {
            MutexError::OwnedByOtherTask => ErrorKind::Contention,
            MutexError::MissingOwner => ErrorKind::StructuralViolation,
            MutexError::Sem(inner) => return Error::from(inner),
        };
        Error::with_cause(kind, Cause::Mutex(e))
    }
}

impl From<QueueError> for Error {
    fn from(e: QueueError) -> Self {
        let kind = match e {
            QueueError::UnableToSend | QueueError::UnableToReceive => {
                ErrorKind::Contention
            }
            QueueError::List(_) | QueueError::Sched(_) => {
                ErrorKind::StructuralViolation
            }
        };
        Error::with_cause(kind, Cause::Queue(e))
    }
}

impl From<SchedError> for Error {
    fn from(e: SchedError) -> Self {
        let kind = match e {
            SchedError::NoCurrentTask | SchedError::NoNextTask => {
                ErrorKind::UnexpectedState
            }
            SchedError::InvalidTransition => ErrorKind::UnexpectedState,
            SchedError::DuplicateTask => ErrorKind::CapacityExceeded,
            SchedError::Table(TableError::Overflow) => {
                ErrorKind::CapacityExceeded
            }
            SchedError::Table(TableError::NullValue) => ErrorKind::NotFound,
            SchedError::List(_) => ErrorKind::StructuralViolation,
        };
        Error::with_cause(kind, Cause::Sched(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrips_kind_and_component() {
        let e = Error::from(TableError::NullValue);
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.code() >> 24, 2);
        assert_eq!(e.code() >> 16 & 0xFF, 2);
    }

    #[test]
    fn contention_errors_classify_as_contention() {
        assert_eq!(
            Error::from(SemError::NoTokens).kind(),
            ErrorKind::Contention
        );
        assert_eq!(
            Error::from(MutexError::OwnedByOtherTask).kind(),
            ErrorKind::Contention
        );
        assert_eq!(
            Error::from(QueueError::UnableToSend).kind(),
            ErrorKind::Contention
        );
    }

    #[test]
    fn structural_errors_never_encode_as_zero() {
        let e = Error::from(ListError::IrregularStructure);
        assert_eq!(e.kind(), ErrorKind::StructuralViolation);
        assert_ne!(e.code(), 0);
    }
}
