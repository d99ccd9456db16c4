use crate::Id;
use nom::error::ErrorKind;
use std::io;
use thiserror::Error;

/// Fatal problems with a heap dump. No partial snapshot is produced when one of these occurs.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A read needed more bytes than the buffer (or the enclosing record) holds.
    #[error("truncated input at offset {offset} while reading {context}")]
    TruncatedInput { offset: usize, context: &'static str },
    #[error("malformed {context} at offset {offset}: {reason}")]
    MalformedRecord {
        offset: usize,
        context: &'static str,
        reason: String,
    },
    #[error("could not read heap dump")]
    Io(#[from] io::Error),
}

impl ParseError {
    /// Convert a record-layer error into an absolute-offset error.
    ///
    /// `base` must be the buffer that the failing parser's input was sliced from.
    pub fn from_nom(err: nom::Err<RecordError<'_>>, base: &[u8], context: &'static str) -> ParseError {
        match err {
            nom::Err::Incomplete(_) => ParseError::TruncatedInput {
                offset: base.len(),
                context,
            },
            nom::Err::Error(e) | nom::Err::Failure(e) => e.into_parse_error(base, context),
        }
    }

    pub fn offset(&self) -> Option<usize> {
        match self {
            ParseError::TruncatedInput { offset, .. } => Some(*offset),
            ParseError::MalformedRecord { offset, .. } => Some(*offset),
            ParseError::Io(_) => None,
        }
    }
}

/// Error threaded through the nom parsers of the record layer.
///
/// Holds the input slice at the failure point so that the absolute offset can be recovered
/// later from the buffer it was sliced from.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordError<'a> {
    Nom { input: &'a [u8], kind: ErrorKind },
    UnknownTag {
        input: &'a [u8],
        context: &'static str,
        tag: u8,
    },
    Invalid {
        input: &'a [u8],
        context: &'static str,
        reason: String,
    },
}

impl<'a> RecordError<'a> {
    pub(crate) fn unknown_tag(input: &'a [u8], context: &'static str, tag: u8) -> nom::Err<Self> {
        nom::Err::Failure(RecordError::UnknownTag {
            input,
            context,
            tag,
        })
    }

    pub(crate) fn invalid(input: &'a [u8], context: &'static str, reason: String) -> nom::Err<Self> {
        nom::Err::Failure(RecordError::Invalid {
            input,
            context,
            reason,
        })
    }

    pub fn input(&self) -> &'a [u8] {
        match self {
            RecordError::Nom { input, .. } => input,
            RecordError::UnknownTag { input, .. } => input,
            RecordError::Invalid { input, .. } => input,
        }
    }

    fn into_parse_error(self, base: &[u8], outer_context: &'static str) -> ParseError {
        let offset = offset_in(base, self.input());
        match self {
            RecordError::Nom {
                kind: ErrorKind::Eof,
                ..
            } => ParseError::TruncatedInput {
                offset,
                context: outer_context,
            },
            RecordError::Nom { kind, .. } => ParseError::MalformedRecord {
                offset,
                context: outer_context,
                reason: format!("{} failed", kind.description()),
            },
            RecordError::UnknownTag { context, tag, .. } => ParseError::MalformedRecord {
                offset,
                context,
                reason: format!("unknown tag {:#04X}", tag),
            },
            RecordError::Invalid {
                context, reason, ..
            } => ParseError::MalformedRecord {
                offset,
                context,
                reason,
            },
        }
    }
}

impl<'a> nom::error::ParseError<&'a [u8]> for RecordError<'a> {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        RecordError::Nom { input, kind }
    }

    fn append(_input: &'a [u8], _kind: ErrorKind, other: Self) -> Self {
        // the innermost failure point is the useful one
        other
    }
}

/// Offset of `input` within `base`, or `base.len()` when it isn't a sub-slice.
pub(crate) fn offset_in(base: &[u8], input: &[u8]) -> usize {
    let base_start = base.as_ptr() as usize;
    let start = input.as_ptr() as usize;
    if start >= base_start && start <= base_start + base.len() {
        start - base_start
    } else {
        base.len()
    }
}

pub type ParseResult<'e, T> = Result<T, nom::Err<RecordError<'e>>>;

pub(crate) type RecordResult<'a, T> = nom::IResult<&'a [u8], T, RecordError<'a>>;

/// A reference that pointed at an id not present in the dump.
///
/// Not fatal: the value reads as null and the reference is recorded on the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedReference {
    /// The object holding the reference, if any (roots have none)
    pub from: Option<Id>,
    pub to: Id,
    pub context: ReferenceContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ReferenceContext {
    #[strum(serialize = "instance field")]
    InstanceField,
    #[strum(serialize = "static field")]
    StaticField,
    #[strum(serialize = "array element")]
    ArrayElement,
    #[strum(serialize = "instance class")]
    InstanceClass,
    #[strum(serialize = "super class")]
    SuperClass,
    #[strum(serialize = "class loader")]
    ClassLoader,
    #[strum(serialize = "gc root")]
    Root,
}
