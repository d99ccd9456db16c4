use crate::error::{ParseError, RecordResult};
use crate::parsing_iterator::StatelessParserWithId;
use crate::{Id, IdSize};
use nom::bytes::complete as bytes;
use nom::number::complete as number;
use std::borrow::Cow;

/// A cursor over a heap dump buffer.
///
/// Readers are `Copy` and never modify the buffer, so any number of them can walk the same
/// bytes independently (e.g. to resolve a string while the main cursor is mid-segment).
#[derive(Clone, Copy, Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    id_size: IdSize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], id_size: IdSize) -> Reader<'a> {
        Reader {
            buf,
            pos: 0,
            id_size,
        }
    }

    /// `pos` must be within `buf`
    pub(crate) fn at(buf: &'a [u8], pos: usize, id_size: IdSize) -> Reader<'a> {
        debug_assert!(pos <= buf.len());
        Reader { buf, pos, id_size }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn id_size(&self) -> IdSize {
        self.id_size
    }

    pub fn with_id_size(&self, id_size: IdSize) -> Reader<'a> {
        Reader { id_size, ..*self }
    }

    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    /// A new reader at `offset`, leaving this one untouched
    pub fn position_at(&self, offset: usize) -> Result<Reader<'a>, ParseError> {
        if offset > self.buf.len() {
            return Err(ParseError::TruncatedInput {
                offset,
                context: "seek",
            });
        }

        Ok(Reader::at(self.buf, offset, self.id_size))
    }

    pub fn read_u1(&mut self) -> Result<u8, ParseError> {
        self.parse("u1", number::be_u8)
    }

    pub fn read_u2(&mut self) -> Result<u16, ParseError> {
        self.parse("u2", number::be_u16)
    }

    pub fn read_u4(&mut self) -> Result<u32, ParseError> {
        self.parse("u4", number::be_u32)
    }

    pub fn read_u8(&mut self) -> Result<u64, ParseError> {
        self.parse("u8", number::be_u64)
    }

    pub fn read_id(&mut self) -> Result<Id, ParseError> {
        let id_size = self.id_size;
        self.parse("id", |input| Id::parse(input, id_size))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        self.parse("bytes", bytes::take(len))
    }

    /// Invalid UTF-8 is replaced rather than rejected; real dumps contain some.
    pub fn read_string(&mut self, len: usize) -> Result<Cow<'a, str>, ParseError> {
        self.parse("string", bytes::take(len))
            .map(String::from_utf8_lossy)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ParseError> {
        self.parse("skipped bytes", bytes::take(len)).map(|_| ())
    }

    /// Run a record-layer parser at the cursor, advancing past whatever it consumed.
    ///
    /// On failure the cursor does not move.
    pub fn parse<T, P>(&mut self, context: &'static str, parser: P) -> Result<T, ParseError>
    where
        P: FnOnce(&'a [u8]) -> RecordResult<'a, T>,
    {
        let input = &self.buf[self.pos..];
        match parser(input) {
            Ok((rest, value)) => {
                self.pos = self.buf.len() - rest.len();
                Ok(value)
            }
            Err(e) => Err(ParseError::from_nom(e, self.buf, context)),
        }
    }
}
