//! Memory held outside the managed heap on behalf of an object (bitmap pixels, direct
//! buffers, ...), attributed to that object so it shows up in retained sizes.

use crate::snapshot::InstanceRef;
use std::convert::TryFrom;
use std::fmt;

/// Which classes a model applies to: an exact name, or a `prefix.*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassPattern {
    Exact(String),
    /// Stored without the trailing `*`
    Prefix(String),
}

impl ClassPattern {
    pub fn matches(&self, class_name: &str) -> bool {
        match self {
            ClassPattern::Exact(name) => name == class_name,
            ClassPattern::Prefix(prefix) => class_name.starts_with(prefix.as_str()),
        }
    }
}

impl From<&str> for ClassPattern {
    fn from(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => ClassPattern::Prefix(prefix.to_owned()),
            None => ClassPattern::Exact(pattern.to_owned()),
        }
    }
}

impl fmt::Display for ClassPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassPattern::Exact(name) => write!(f, "{}", name),
            ClassPattern::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

/// Computes the external size of instances of the classes matching `pattern()`.
///
/// Subclasses of a matching class use the model too. Sizes are computed once while the
/// snapshot is built, before any analysis has run, so a model should only look at the
/// instance's own fields and whatever they reference.
pub trait ExternalSizeModel: Send + Sync {
    fn pattern(&self) -> &ClassPattern;

    fn external_size(&self, instance: &InstanceRef<'_>) -> u64;
}

/// Pixel storage sized from width and height fields.
///
/// When the pixels live in a managed array (referenced by `managed_buffer_field`) they are
/// already on the heap, and the external size is 0.
#[derive(Debug, Clone)]
pub struct PixelBufferModel {
    pattern: ClassPattern,
    width_field: String,
    height_field: String,
    bytes_per_pixel: u64,
    managed_buffer_field: Option<String>,
}

impl PixelBufferModel {
    pub fn new<P: Into<ClassPattern>>(
        pattern: P,
        width_field: &str,
        height_field: &str,
        bytes_per_pixel: u64,
    ) -> PixelBufferModel {
        PixelBufferModel {
            pattern: pattern.into(),
            width_field: width_field.to_owned(),
            height_field: height_field.to_owned(),
            bytes_per_pixel,
            managed_buffer_field: None,
        }
    }

    pub fn with_managed_buffer_field(mut self, field: &str) -> PixelBufferModel {
        self.managed_buffer_field = Some(field.to_owned());
        self
    }

    /// `android.graphics.Bitmap` with 4 bytes per pixel
    pub fn android_bitmap() -> PixelBufferModel {
        PixelBufferModel::new("android.graphics.Bitmap", "mWidth", "mHeight", 4)
            .with_managed_buffer_field("mBuffer")
    }
}

impl ExternalSizeModel for PixelBufferModel {
    fn pattern(&self) -> &ClassPattern {
        &self.pattern
    }

    fn external_size(&self, instance: &InstanceRef<'_>) -> u64 {
        if let Some(field) = &self.managed_buffer_field {
            if instance.ref_field(field).is_some() {
                return 0;
            }
        }

        let dimension = |name: &str| {
            instance
                .int_field(name)
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0)
        };

        dimension(&self.width_field)
            .saturating_mul(dimension(&self.height_field))
            .saturating_mul(self.bytes_per_pixel)
    }
}

/// Reads a byte count straight from a numeric field, e.g. a direct buffer's capacity.
#[derive(Debug, Clone)]
pub struct SizeFieldModel {
    pattern: ClassPattern,
    field: String,
}

impl SizeFieldModel {
    pub fn new<P: Into<ClassPattern>>(pattern: P, field: &str) -> SizeFieldModel {
        SizeFieldModel {
            pattern: pattern.into(),
            field: field.to_owned(),
        }
    }
}

impl ExternalSizeModel for SizeFieldModel {
    fn pattern(&self) -> &ClassPattern {
        &self.pattern
    }

    fn external_size(&self, instance: &InstanceRef<'_>) -> u64 {
        instance
            .long_field(&self.field)
            .or_else(|| instance.int_field(&self.field).map(i64::from))
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(0)
    }
}

const CLEANER_THUNK: &str = "libcore.util.NativeAllocationRegistry$CleanerThunk";
const NATIVE_ALLOCATION_REGISTRY: &str = "libcore.util.NativeAllocationRegistry";

/// What a cleaner thunk says about the native allocation it frees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegisteredNative {
    pub(crate) pointer: u64,
    pub(crate) size: u64,
}

/// Reads `nativePtr` from a cleaner thunk and `size` from the registry it refers to
pub(crate) fn registered_native(thunk: &InstanceRef<'_>) -> Option<RegisteredNative> {
    if !thunk.is_instance_of_class(CLEANER_THUNK) {
        return None;
    }
    let pointer = thunk.long_field("nativePtr")?;

    let registry = thunk
        .fields()
        .filter_map(|(_, v)| v.as_instance())
        .filter_map(|i| thunk.snapshot().get(i))
        .find(|i| i.is_instance_of_class(NATIVE_ALLOCATION_REGISTRY))?;
    let size = u64::try_from(registry.long_field("size")?).ok()?;

    Some(RegisteredNative {
        pointer: pointer as u64,
        size,
    })
}

/// Charges a `NativeAllocationRegistry` cleaner thunk with the size its registry declares.
///
/// Not part of the defaults: a bitmap whose pixels are registered this way would be counted
/// by both models.
#[derive(Debug, Clone)]
pub struct NativeAllocationModel {
    pattern: ClassPattern,
}

impl NativeAllocationModel {
    pub fn new() -> NativeAllocationModel {
        NativeAllocationModel {
            pattern: ClassPattern::from(CLEANER_THUNK),
        }
    }
}

impl Default for NativeAllocationModel {
    fn default() -> Self {
        NativeAllocationModel::new()
    }
}

impl ExternalSizeModel for NativeAllocationModel {
    fn pattern(&self) -> &ClassPattern {
        &self.pattern
    }

    fn external_size(&self, instance: &InstanceRef<'_>) -> u64 {
        registered_native(instance).map_or(0, |n| n.size)
    }
}

pub fn default_models() -> Vec<Box<dyn ExternalSizeModel>> {
    vec![Box::new(PixelBufferModel::android_bitmap())]
}

/// The model for a class, given its name and the names of its superclasses (nearest first).
///
/// The nearest class with any matching model wins; among models matching the same class the
/// first registered wins.
pub(crate) fn select_model<'m, 'n, I>(
    models: &'m [Box<dyn ExternalSizeModel>],
    class_and_supers: I,
) -> Option<&'m dyn ExternalSizeModel>
where
    I: IntoIterator<Item = &'n str>,
{
    if models.is_empty() {
        return None;
    }

    class_and_supers.into_iter().find_map(|name| {
        models
            .iter()
            .find(|m| m.pattern().matches(name))
            .map(|m| m.as_ref())
    })
}
