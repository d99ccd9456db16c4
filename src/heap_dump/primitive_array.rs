use crate::error::{RecordError, RecordResult};
use crate::*;

/// Methods for accessing the contents of the array return Some only for the method matching
/// the array type (e.g. if it's a PrimitiveArrayType::Float, floats() will be Some), and only
/// when the dump included the contents.
#[derive(CopyGetters, Copy, Clone)]
pub struct PrimitiveArray<'a> {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    primitive_type: PrimitiveArrayType,
    #[get_copy = "pub"]
    num_elements: u32,
    contents: Option<&'a [u8]>,
}

macro_rules! iterator_method {
    ($method_name:tt, $type_variant:tt, $iter_struct:tt) => {
        pub fn $method_name(&self) -> Option<$iter_struct<'a>> {
            match (self.primitive_type, self.contents) {
                (PrimitiveArrayType::$type_variant, Some(contents)) => Some($iter_struct {
                    iter: ParsingIterator::new_stateless(contents, self.num_elements),
                }),
                _ => None,
            }
        }
    };
}

impl<'a> PrimitiveArray<'a> {
    /// `has_contents` is false for android's PRIMITIVE ARRAY NODATA
    pub(crate) fn parse(
        input: &'a [u8],
        id_size: IdSize,
        has_contents: bool,
    ) -> RecordResult<'a, PrimitiveArray<'a>> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L279
        let (input, obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, num_elements) = number::be_u32(input)?;
        let type_input = input;
        let (input, type_byte) = number::be_u8(input)?;

        let array_type = match PrimitiveArrayType::from_type_byte(type_byte) {
            Some(t) => t,
            None => {
                return Err(RecordError::unknown_tag(
                    type_input,
                    "primitive array type",
                    type_byte,
                ))
            }
        };

        let (input, contents) = if has_contents {
            let len = num_elements as usize * array_type.element_size();
            let (input, contents) = bytes::take(len)(input)?;
            (input, Some(contents))
        } else {
            (input, None)
        };

        Ok((
            input,
            PrimitiveArray {
                obj_id,
                stack_trace_serial,
                primitive_type: array_type,
                num_elements,
                contents,
            },
        ))
    }

    pub fn has_contents(&self) -> bool {
        self.contents.is_some()
    }

    /// Raw big-endian element data
    pub fn contents(&self) -> Option<&'a [u8]> {
        self.contents
    }

    iterator_method!(booleans, Boolean, Booleans);
    iterator_method!(chars, Char, Chars);
    iterator_method!(floats, Float, Floats);
    iterator_method!(doubles, Double, Doubles);
    iterator_method!(bytes, Byte, Bytes);
    iterator_method!(shorts, Short, Shorts);
    iterator_method!(ints, Int, Ints);
    iterator_method!(longs, Long, Longs);
}

impl StatelessParser for bool {
    fn parse(input: &[u8]) -> RecordResult<bool> {
        number::be_u8(input).map(|(input, b)| (input, b != 0))
    }
}

macro_rules! parser_impl {
    ($prim_type:tt, $parser_method:tt) => {
        impl StatelessParser for $prim_type {
            fn parse(input: &[u8]) -> RecordResult<$prim_type> {
                number::$parser_method(input)
            }
        }
    };
}

parser_impl!(u16, be_u16);
parser_impl!(f32, be_f32);
parser_impl!(f64, be_f64);
parser_impl!(i8, be_i8);
parser_impl!(i16, be_i16);
parser_impl!(i32, be_i32);
parser_impl!(i64, be_i64);

macro_rules! iter_struct {
    ($struct_name:ident, $item_type:ty) => {
        pub struct $struct_name<'a> {
            iter: ParsingIterator<'a, $item_type, StatelessParserWrapper<$item_type>>,
        }

        impl<'a> Iterator for $struct_name<'a> {
            type Item = ParseResult<'a, $item_type>;

            fn next(&mut self) -> Option<Self::Item> {
                self.iter.next()
            }
        }
    };
}

iter_struct!(Booleans, bool);
iter_struct!(Chars, u16);
iter_struct!(Floats, f32);
iter_struct!(Doubles, f64);
iter_struct!(Bytes, i8);
iter_struct!(Shorts, i16);
iter_struct!(Ints, i32);
iter_struct!(Longs, i64);

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, EnumIter)]
pub enum PrimitiveArrayType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl PrimitiveArrayType {
    pub fn from_type_byte(type_byte: u8) -> Option<PrimitiveArrayType> {
        let t = match type_byte {
            0x04 => PrimitiveArrayType::Boolean,
            0x05 => PrimitiveArrayType::Char,
            0x06 => PrimitiveArrayType::Float,
            0x07 => PrimitiveArrayType::Double,
            0x08 => PrimitiveArrayType::Byte,
            0x09 => PrimitiveArrayType::Short,
            0x0A => PrimitiveArrayType::Int,
            0x0B => PrimitiveArrayType::Long,
            _ => return None,
        };

        Some(t)
    }

    pub fn type_byte(&self) -> u8 {
        match self {
            PrimitiveArrayType::Boolean => 0x04,
            PrimitiveArrayType::Char => 0x05,
            PrimitiveArrayType::Float => 0x06,
            PrimitiveArrayType::Double => 0x07,
            PrimitiveArrayType::Byte => 0x08,
            PrimitiveArrayType::Short => 0x09,
            PrimitiveArrayType::Int => 0x0A,
            PrimitiveArrayType::Long => 0x0B,
        }
    }

    pub fn element_size(&self) -> usize {
        match self {
            PrimitiveArrayType::Boolean | PrimitiveArrayType::Byte => 1,
            PrimitiveArrayType::Char | PrimitiveArrayType::Short => 2,
            PrimitiveArrayType::Float | PrimitiveArrayType::Int => 4,
            PrimitiveArrayType::Double | PrimitiveArrayType::Long => 8,
        }
    }

    pub fn java_type_name(&self) -> &'static str {
        match self {
            PrimitiveArrayType::Boolean => "boolean",
            PrimitiveArrayType::Char => "char",
            PrimitiveArrayType::Float => "float",
            PrimitiveArrayType::Double => "double",
            PrimitiveArrayType::Byte => "byte",
            PrimitiveArrayType::Short => "short",
            PrimitiveArrayType::Int => "int",
            PrimitiveArrayType::Long => "long",
        }
    }

    /// Name of the array class holding this element type, e.g. `int[]`
    pub fn array_class_name(&self) -> String {
        format!("{}[]", self.java_type_name())
    }
}
