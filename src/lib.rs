//! Heap dump (hprof) parsing and retained-memory analysis.
//!
//! The record layer ([parse_hprof], [Records], [heap_dump]) gives zero-copy access to the
//! binary records of a dump. [Snapshot] builds on it: every object becomes an entry in an
//! arena that can be queried for dominators, retained sizes, allocation sites, and paths to
//! gc roots.

use getset::CopyGetters;
use nom::bytes::complete as bytes;
use nom::number::complete as number;
use std::cmp::Ordering;
use std::fmt::{Error, Formatter};
use std::{cmp, fmt};
use strum_macros::EnumIter;

pub mod dominator;
mod error;
pub mod external_size;
pub mod heap_dump;
mod parsing_iterator;
pub mod proguard;
mod reader;
pub mod snapshot;
#[cfg(test)]
mod test_dump;

use parsing_iterator::*;

pub use error::{ParseError, ParseResult, RecordError, ReferenceContext, UnresolvedReference};
pub use external_size::{
    ClassPattern, ExternalSizeModel, NativeAllocationModel, PixelBufferModel, SizeFieldModel,
};
pub use proguard::{ProguardMap, ProguardMapError};
pub use reader::Reader;
pub use snapshot::{
    InstanceIndex, InstanceRef, NativeAllocation, ObjectsInfo, PathElement, SiteRef, Size,
    Snapshot, SnapshotBuilder, Value,
};

use error::RecordResult;

#[derive(CopyGetters, Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Id {
    // inflate 4-byte ids to 8-byte since if we have a small 32-bit heap, no worries about memory anyway
    #[get_copy = "pub"]
    id: u64,
}

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Id { id }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.id)
    }
}

impl fmt::UpperHex for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        fmt::UpperHex::fmt(&self.id, f)
    }
}

impl fmt::LowerHex for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        fmt::LowerHex::fmt(&self.id, f)
    }
}

pub type Serial = u32;

impl StatelessParserWithId for Id {
    fn parse(input: &[u8], id_size: IdSize) -> RecordResult<Self> {
        let (input, id) = match id_size {
            IdSize::U32 => number::be_u32(input).map(|(i, id)| (i, id as u64))?,
            IdSize::U64 => number::be_u64(input)?,
        };

        Ok((input, Id { id }))
    }
}

/// Object ids of 0 are null references
impl StatelessParserWithId for Option<Id> {
    fn parse(input: &[u8], id_size: IdSize) -> RecordResult<Self> {
        let (input, id) = Id::parse(input, id_size)?;

        Ok((input, if id.id == 0 { None } else { Some(id) }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSize {
    U32,
    U64,
}

impl IdSize {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            IdSize::U32 => 4,
            IdSize::U64 => 8,
        }
    }
}

// https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp

#[derive(CopyGetters)]
pub struct Hprof<'a> {
    #[get_copy = "pub"]
    header: Header<'a>,
    buffer: &'a [u8],
    records_offset: usize,
}

impl<'a> Hprof<'a> {
    pub fn records_iter(&self) -> Records<'a> {
        Records {
            reader: Reader::at(self.buffer, self.records_offset, self.header.id_size),
            done: false,
        }
    }

    /// The whole dump, header included. Offsets in errors and records are relative to this.
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }
}

pub fn parse_hprof(input: &[u8]) -> Result<Hprof, ParseError> {
    // id size isn't known until the header is read
    let mut reader = Reader::new(input, IdSize::U32);
    let header = reader.parse("header", Header::parse)?;

    Ok(Hprof {
        header,
        buffer: input,
        records_offset: reader.position(),
    })
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Header<'a> {
    label: &'a [u8],
    #[get_copy = "pub"]
    id_size: IdSize,
    /// The timestamp for the hprof as the number of millis since epoch
    #[get_copy = "pub"]
    timestamp_millis: u64,
}

impl<'a> Header<'a> {
    pub fn label(&self) -> Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.label)
    }

    fn parse(input: &'a [u8]) -> RecordResult<'a, Header<'a>> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L63
        let (input, label) = bytes::take_until(&b"\0"[..])(input)?;
        let (input, _) = bytes::tag(&b"\0"[..])(input)?;

        let id_size_input = input;
        let (input, id_size_num) = number::be_u32(input)?;
        let (input, epoch_hi) = number::be_u32(input)?;
        let (input, epoch_lo) = number::be_u32(input)?;

        let epoch_timestamp = ((epoch_hi as u64) << 32) + (epoch_lo as u64);

        let id_size = match id_size_num {
            4 => IdSize::U32,
            8 => IdSize::U64,
            _ => {
                return Err(RecordError::invalid(
                    id_size_input,
                    "header",
                    format!("unsupported id size {}", id_size_num),
                ))
            }
        };

        Ok((
            input,
            Header {
                label,
                id_size,
                timestamp_millis: epoch_timestamp,
            },
        ))
    }
}

impl<'a> fmt::Debug for Header<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("Header")
            .field("label", &self.label())
            .field("timestamp_millis", &self.timestamp_millis())
            .field("id_size", &self.id_size())
            .finish()
    }
}

const RECORD_HEADER_LEN: usize = 9;

/// Iterates over top-level records, skipping tags it doesn't know.
///
/// After an error no further records are produced.
pub struct Records<'a> {
    reader: Reader<'a>,
    done: bool,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.reader.is_empty() {
                return None;
            }

            let start = self.reader.position();
            let id_size = self.reader.id_size();
            match self.reader.parse("record", Record::parse) {
                Ok((Some(tag), micros, body)) => {
                    return Some(Ok(Record {
                        tag,
                        micros_since_header_ts: micros,
                        id_size,
                        offset: start + RECORD_HEADER_LEN,
                        body,
                    }))
                }
                Ok((None, _, body)) => {
                    log::debug!(
                        "Skipping record with unknown tag {:#04X} at offset {} ({} bytes)",
                        self.reader.buffer()[start],
                        start,
                        body.len()
                    );
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Record<'a> {
    #[get_copy = "pub"]
    tag: RecordTag,
    #[get_copy = "pub"]
    micros_since_header_ts: u32,
    id_size: IdSize,
    /// Offset of the body within the dump
    #[get_copy = "pub"]
    offset: usize,
    #[get_copy = "pub"]
    body: &'a [u8],
}

impl<'a> Record<'a> {
    pub fn as_utf_8(&self) -> Option<ParseResult<'a, Utf8<'a>>> {
        match self.tag {
            RecordTag::Utf8 => Some(Utf8::parse(self.body, self.id_size)),
            _ => None,
        }
    }

    pub fn as_load_class(&self) -> Option<ParseResult<'a, LoadClass>> {
        match self.tag {
            RecordTag::LoadClass => Some(LoadClass::parse(self.body, self.id_size)),
            _ => None,
        }
    }

    pub fn as_stack_frame(&self) -> Option<ParseResult<'a, StackFrame>> {
        match self.tag {
            RecordTag::StackFrame => Some(StackFrame::parse(self.body, self.id_size)),
            _ => None,
        }
    }

    pub fn as_stack_trace(&self) -> Option<ParseResult<'a, StackTrace<'a>>> {
        match self.tag {
            RecordTag::StackTrace => Some(StackTrace::parse(self.body, self.id_size)),
            _ => None,
        }
    }

    pub fn as_heap_dump_segment(&self) -> Option<ParseResult<'a, HeapDumpSegment<'a>>> {
        match self.tag {
            RecordTag::HeapDump | RecordTag::HeapDumpSegment => {
                Some(HeapDumpSegment::parse(self.body, self.id_size))
            }
            _ => None,
        }
    }

    /// A tag of `None` means an unrecognized record that should be skipped
    fn parse(input: &'a [u8]) -> RecordResult<'a, (Option<RecordTag>, u32, &'a [u8])> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L76
        let (input, tag_byte) = number::be_u8(input)?;
        let (input, micros) = number::be_u32(input)?;
        let (input, len) = number::be_u32(input)?;
        let (input, body) = bytes::take(len)(input)?;

        Ok((input, (RecordTag::from_tag_byte(tag_byte), micros, body)))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter)]
pub enum RecordTag {
    Utf8,
    LoadClass,
    UnloadClass,
    StackFrame,
    StackTrace,
    AllocSites,
    StartThread,
    EndThread,
    HeapSummary,
    HeapDump,
    CpuSamples,
    ControlSettings,
    HeapDumpSegment,
    HeapDumpEnd,
}

impl RecordTag {
    pub fn tag_byte(&self) -> u8 {
        match self {
            RecordTag::Utf8 => 0x01,
            RecordTag::LoadClass => 0x02,
            RecordTag::UnloadClass => 0x03,
            RecordTag::StackFrame => 0x04,
            RecordTag::StackTrace => 0x05,
            RecordTag::AllocSites => 0x06,
            RecordTag::HeapSummary => 0x07,
            RecordTag::StartThread => 0x0A,
            RecordTag::EndThread => 0x0B,
            RecordTag::HeapDump => 0x0C,
            RecordTag::CpuSamples => 0x0D,
            RecordTag::ControlSettings => 0x0E,
            RecordTag::HeapDumpSegment => 0x1C,
            RecordTag::HeapDumpEnd => 0x2C,
        }
    }

    pub fn from_tag_byte(tag: u8) -> Option<RecordTag> {
        let tag = match tag {
            0x01 => RecordTag::Utf8,
            0x02 => RecordTag::LoadClass,
            0x03 => RecordTag::UnloadClass,
            0x04 => RecordTag::StackFrame,
            0x05 => RecordTag::StackTrace,
            0x06 => RecordTag::AllocSites,
            0x07 => RecordTag::HeapSummary,
            0x0A => RecordTag::StartThread,
            0x0B => RecordTag::EndThread,
            0x0C => RecordTag::HeapDump,
            0x0D => RecordTag::CpuSamples,
            0x0E => RecordTag::ControlSettings,
            0x1C => RecordTag::HeapDumpSegment,
            0x2C => RecordTag::HeapDumpEnd,
            _ => return None,
        };

        Some(tag)
    }
}

impl cmp::Ord for RecordTag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag_byte().cmp(&other.tag_byte())
    }
}

impl cmp::PartialOrd for RecordTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Utf8<'a> {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    text: &'a [u8],
}

impl<'a> Utf8<'a> {
    fn parse(input: &'a [u8], id_size: IdSize) -> ParseResult<'a, Utf8<'a>> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L88
        let (input, id) = Id::parse(input, id_size)?;

        Ok(Utf8 {
            name_id: id,
            text: input,
        })
    }

    /// Note that in practice, there are nonzero Utf8 records with invalid UTF-8 bytes.
    pub fn text_as_str(&self) -> Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.text)
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct LoadClass {
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    class_obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    class_name_id: Id,
}

impl LoadClass {
    fn parse(input: &[u8], id_size: IdSize) -> ParseResult<LoadClass> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L93
        let (input, class_serial) = number::be_u32(input)?;
        let (input, class_obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (_input, class_name_id) = Id::parse(input, id_size)?;

        Ok(LoadClass {
            class_serial,
            class_obj_id,
            stack_trace_serial,
            class_name_id,
        })
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct StackFrame {
    #[get_copy = "pub"]
    id: Id,
    #[get_copy = "pub"]
    method_name_id: Id,
    #[get_copy = "pub"]
    method_signature_id: Id,
    #[get_copy = "pub"]
    source_file_name_id: Id,
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    line_num: LineNum,
}

impl StackFrame {
    fn parse(input: &[u8], id_size: IdSize) -> ParseResult<Self> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L104
        let (input, id) = Id::parse(input, id_size)?;
        let (input, method_name_id) = Id::parse(input, id_size)?;
        let (input, method_signature_id) = Id::parse(input, id_size)?;
        let (input, source_file_name_id) = Id::parse(input, id_size)?;
        let (input, class_serial) = number::be_u32(input)?;
        let (_input, line_num) = LineNum::parse(input)?;

        Ok(StackFrame {
            id,
            method_name_id,
            method_signature_id,
            source_file_name_id,
            class_serial,
            line_num,
        })
    }
}

#[derive(CopyGetters, Clone)]
pub struct StackTrace<'a> {
    id_size: IdSize,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    thread_serial: Serial,
    #[get_copy = "pub"]
    num_frame_ids: u32,
    frame_ids: &'a [u8],
}

impl<'a> StackTrace<'a> {
    fn parse(input: &'a [u8], id_size: crate::IdSize) -> ParseResult<'a, StackTrace<'a>> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L116
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, thread_serial) = number::be_u32(input)?;
        let (input, num_frame_ids) = number::be_u32(input)?;

        Ok(StackTrace {
            id_size,
            stack_trace_serial,
            thread_serial,
            num_frame_ids,
            frame_ids: input,
        })
    }

    /// Innermost frame first
    pub fn frame_ids(&self) -> Ids<'a> {
        Ids {
            iter: ParsingIterator::new_stateless_id_size(
                self.id_size,
                self.frame_ids,
                self.num_frame_ids,
            ),
        }
    }
}

/// Represents either a HPROF_HEAP_DUMP or HPROF_HEAP_DUMP_SEGMENT
pub struct HeapDumpSegment<'a> {
    id_size: IdSize,
    records: &'a [u8],
}

impl<'a> HeapDumpSegment<'a> {
    fn parse(input: &'a [u8], id_size: IdSize) -> ParseResult<'a, HeapDumpSegment<'a>> {
        Ok(HeapDumpSegment {
            id_size,
            records: input,
        })
    }

    pub fn sub_records(&self) -> SubRecords<'a> {
        SubRecords {
            id_size: self.id_size,
            remaining: self.records,
        }
    }
}

/// Sub-records have no length prefix, so iteration ends at the first error.
pub struct SubRecords<'a> {
    id_size: IdSize,
    remaining: &'a [u8],
}

impl<'a> Iterator for SubRecords<'a> {
    type Item = ParseResult<'a, heap_dump::SubRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        let res = heap_dump::SubRecord::parse(self.remaining, self.id_size);
        match res {
            Ok((input, record)) => {
                self.remaining = input;
                Some(Ok(record))
            }
            Err(e) => {
                self.remaining = &[];
                Some(Err(e))
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineNum {
    Normal(u32),
    Unknown,
    CompiledMethod,
    NativeMethod,
}

impl LineNum {
    fn parse(input: &[u8]) -> RecordResult<Self> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L111
        let (input, num) = number::be_i32(input)?;

        Ok((
            input,
            match num {
                num if num > 0 => LineNum::Normal(num as u32),
                -2 => LineNum::CompiledMethod,
                -3 => LineNum::NativeMethod,
                // 0 shows up in android dumps for frames without line info
                _ => LineNum::Unknown,
            },
        ))
    }
}

impl fmt::Display for LineNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            LineNum::Normal(n) => write!(f, "{}", n),
            LineNum::Unknown => write!(f, "Unknown"),
            LineNum::CompiledMethod => write!(f, "CompiledMethod"),
            LineNum::NativeMethod => write!(f, "NativeMethod"),
        }
    }
}

pub struct Ids<'a> {
    iter: ParsingIterator<'a, Id, IdSizeParserWrapper<Id>>,
}

impl<'a> Iterator for Ids<'a> {
    type Item = ParseResult<'a, Id>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}
