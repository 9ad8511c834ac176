//! Interleaved vertex layouts and typed attribute cursors.
//!
//! An [`ArrayDescriptor`] is an ordered list of named attributes. Each
//! attribute's byte offset within an element is the running total of the
//! sizes of the attributes declared before it, so a descriptor fully
//! determines the layout of an interleaved vertex buffer:
//!
//! ```text
//! position: 3 x f32 | normal: 3 x f32 | uv: 2 x f32
//! offset 0           offset 12         offset 24      (element size 32)
//! ```
//!
//! Cursors ([`ArrayCursorWritable`], [`ArrayCursorReadable`]) walk one
//! attribute across every element of a mapped region. Cursors over different
//! attributes of the same region may be interleaved freely; each only ever
//! touches its own attribute's bytes.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use bytemuck::Pod;
use thiserror::Error;

use crate::cursor::{CursorError, ElementCursor, write_cells};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
}

impl ScalarType {
    pub fn size_bytes(self) -> u64 {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::I8 => "i8",
            ScalarType::U8 => "u8",
            ScalarType::I16 => "i16",
            ScalarType::U16 => "u16",
            ScalarType::I32 => "i32",
            ScalarType::U32 => "u32",
            ScalarType::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// A host value that can be stored in one element of an attribute.
///
/// Implemented for every scalar and for arrays of one to four of them, so
/// `[f32; 3]` reads and writes a three-component float attribute.
pub trait AttributeValue: Pod {
    const SCALAR: ScalarType;
    const COMPONENTS: u32;
}

macro_rules! attribute_values {
    ($($scalar:ty => $variant:ident),* $(,)?) => {
        $(
            impl AttributeValue for $scalar {
                const SCALAR: ScalarType = ScalarType::$variant;
                const COMPONENTS: u32 = 1;
            }
            impl AttributeValue for [$scalar; 1] {
                const SCALAR: ScalarType = ScalarType::$variant;
                const COMPONENTS: u32 = 1;
            }
            impl AttributeValue for [$scalar; 2] {
                const SCALAR: ScalarType = ScalarType::$variant;
                const COMPONENTS: u32 = 2;
            }
            impl AttributeValue for [$scalar; 3] {
                const SCALAR: ScalarType = ScalarType::$variant;
                const COMPONENTS: u32 = 3;
            }
            impl AttributeValue for [$scalar; 4] {
                const SCALAR: ScalarType = ScalarType::$variant;
                const COMPONENTS: u32 = 4;
            }
        )*
    };
}

attribute_values!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    f32 => F32,
);

// ---- Error types ----

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArrayDescriptorError {
    #[error("An array descriptor needs at least one attribute")]
    Empty,

    #[error("Attribute '{0}' is declared more than once")]
    DuplicateAttribute(String),

    #[error("Attribute '{name}' has {components} components (expected 1 to 4)")]
    InvalidComponents { name: String, components: u32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttributeError {
    #[error("No attribute named '{0}'")]
    UnknownAttribute(String),

    #[error(
        "Attribute '{name}' is {expected_components} x {expected}, not \
         {actual_components} x {actual}"
    )]
    TypeMismatch {
        name: String,
        expected: ScalarType,
        expected_components: u32,
        actual: ScalarType,
        actual_components: u32,
    },

    #[error("Attribute '{name}' has no component {component}")]
    NoSuchComponent { name: String, component: u32 },
}

// ---- Descriptors ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    name: String,
    scalar: ScalarType,
    components: u32,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, scalar: ScalarType, components: u32) -> Self {
        Self {
            name: name.into(),
            scalar,
            components,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scalar(&self) -> ScalarType {
        self.scalar
    }

    pub fn components(&self) -> u32 {
        self.components
    }

    pub fn size_bytes(&self) -> u64 {
        self.scalar.size_bytes() * u64::from(self.components)
    }
}

/// Immutable, validated layout of one interleaved array element.
#[derive(Debug, Clone)]
pub struct ArrayDescriptor {
    attributes: Vec<AttributeDescriptor>,
    offsets: Vec<u64>,
    by_name: HashMap<String, usize>,
    element_size: u64,
}

impl PartialEq for ArrayDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.attributes == other.attributes
    }
}

impl Eq for ArrayDescriptor {}

impl ArrayDescriptor {
    pub fn builder() -> ArrayDescriptorBuilder {
        ArrayDescriptorBuilder::new()
    }

    /// Validate `attributes` and compute their offsets in declaration
    /// order.
    pub fn build(
        attributes: impl IntoIterator<Item = AttributeDescriptor>,
    ) -> Result<Self, ArrayDescriptorError> {
        let attributes: Vec<AttributeDescriptor> = attributes.into_iter().collect();
        if attributes.is_empty() {
            return Err(ArrayDescriptorError::Empty);
        }

        let mut offsets = Vec::with_capacity(attributes.len());
        let mut by_name = HashMap::with_capacity(attributes.len());
        let mut running = 0;
        for (index, attribute) in attributes.iter().enumerate() {
            if !(1..=4).contains(&attribute.components) {
                return Err(ArrayDescriptorError::InvalidComponents {
                    name: attribute.name.clone(),
                    components: attribute.components,
                });
            }
            if by_name.insert(attribute.name.clone(), index).is_some() {
                return Err(ArrayDescriptorError::DuplicateAttribute(
                    attribute.name.clone(),
                ));
            }
            offsets.push(running);
            running += attribute.size_bytes();
        }

        Ok(Self {
            attributes,
            offsets,
            by_name,
            element_size: running,
        })
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(AttributeDescriptor::name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn attribute(&self, name: &str) -> Result<&AttributeDescriptor, AttributeError> {
        self.index_of(name).map(|index| &self.attributes[index])
    }

    /// Byte offset of `name` from the start of each element.
    pub fn attribute_offset(&self, name: &str) -> Result<u64, AttributeError> {
        self.index_of(name).map(|index| self.offsets[index])
    }

    /// Byte offset of component `component` of `name` from the start of
    /// each element.
    pub fn element_offset(&self, name: &str, component: u32) -> Result<u64, AttributeError> {
        let index = self.index_of(name)?;
        let attribute = &self.attributes[index];
        if component >= attribute.components {
            return Err(AttributeError::NoSuchComponent {
                name: name.to_owned(),
                component,
            });
        }
        Ok(self.offsets[index] + attribute.scalar.size_bytes() * u64::from(component))
    }

    /// Size of one element: the sum of every attribute's size.
    pub fn element_size_bytes(&self) -> u64 {
        self.element_size
    }

    /// Offset of `name`, provided `T` matches its scalar type and arity.
    pub(crate) fn typed_offset<T: AttributeValue>(
        &self,
        name: &str,
    ) -> Result<u64, AttributeError> {
        let index = self.index_of(name)?;
        let attribute = &self.attributes[index];
        if attribute.scalar != T::SCALAR || attribute.components != T::COMPONENTS {
            return Err(AttributeError::TypeMismatch {
                name: name.to_owned(),
                expected: attribute.scalar,
                expected_components: attribute.components,
                actual: T::SCALAR,
                actual_components: T::COMPONENTS,
            });
        }
        Ok(self.offsets[index])
    }

    fn index_of(&self, name: &str) -> Result<usize, AttributeError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| AttributeError::UnknownAttribute(name.to_owned()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArrayDescriptorBuilder {
    attributes: Vec<AttributeDescriptor>,
}

impl ArrayDescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(
        mut self,
        name: impl Into<String>,
        scalar: ScalarType,
        components: u32,
    ) -> Self {
        self.push(AttributeDescriptor::new(name, scalar, components));
        self
    }

    pub fn push(&mut self, attribute: AttributeDescriptor) {
        self.attributes.push(attribute);
    }

    pub fn build(self) -> Result<ArrayDescriptor, ArrayDescriptorError> {
        ArrayDescriptor::build(self.attributes)
    }
}

// ---- Cursors ----

/// Writes one attribute of successive elements.
pub struct ArrayCursorWritable<'a, T> {
    cells: &'a [Cell<u8>],
    cursor: ElementCursor,
    _value: PhantomData<fn(T)>,
}

impl<T> fmt::Debug for ArrayCursorWritable<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayCursorWritable")
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl<'a, T: AttributeValue> ArrayCursorWritable<'a, T> {
    pub(crate) fn new(
        cells: &'a [Cell<u8>],
        descriptor: &ArrayDescriptor,
        name: &str,
        element_count: u64,
    ) -> Result<Self, AttributeError> {
        let offset = descriptor.typed_offset::<T>(name)?;
        Ok(Self {
            cells,
            cursor: ElementCursor::new(
                offset,
                descriptor.element_size_bytes(),
                size_of::<T>() as u64,
                element_count,
            ),
            _value: PhantomData,
        })
    }

    /// Write `value` at the current element and advance.
    pub fn put(&mut self, value: T) -> Result<(), CursorError> {
        let range = self.cursor.current_range(self.cells.len())?;
        write_cells(&self.cells[range], bytemuck::bytes_of(&value));
        self.cursor.advance();
        Ok(())
    }

    pub fn seek_to(&mut self, element: u64) -> Result<(), CursorError> {
        self.cursor.seek_to(element)
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn element_count(&self) -> u64 {
        self.cursor.count()
    }

    pub fn has_next(&self) -> bool {
        self.cursor.has_next()
    }
}

/// Reads one attribute of successive elements.
pub struct ArrayCursorReadable<'a, T> {
    bytes: &'a [u8],
    cursor: ElementCursor,
    _value: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for ArrayCursorReadable<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayCursorReadable")
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl<'a, T: AttributeValue> ArrayCursorReadable<'a, T> {
    pub(crate) fn new(
        bytes: &'a [u8],
        descriptor: &ArrayDescriptor,
        name: &str,
        element_count: u64,
    ) -> Result<Self, AttributeError> {
        let offset = descriptor.typed_offset::<T>(name)?;
        Ok(Self {
            bytes,
            cursor: ElementCursor::new(
                offset,
                descriptor.element_size_bytes(),
                size_of::<T>() as u64,
                element_count,
            ),
            _value: PhantomData,
        })
    }

    /// Read the value at the current element and advance.
    pub fn get(&mut self) -> Result<T, CursorError> {
        let range = self.cursor.current_range(self.bytes.len())?;
        let value = bytemuck::pod_read_unaligned(&self.bytes[range]);
        self.cursor.advance();
        Ok(value)
    }

    pub fn seek_to(&mut self, element: u64) -> Result<(), CursorError> {
        self.cursor.seek_to(element)
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn element_count(&self) -> u64 {
        self.cursor.count()
    }

    pub fn has_next(&self) -> bool {
        self.cursor.has_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::read_cells;

    fn mesh_descriptor() -> ArrayDescriptor {
        ArrayDescriptor::builder()
            .attribute("position", ScalarType::F32, 3)
            .attribute("normal", ScalarType::F32, 3)
            .attribute("color", ScalarType::U8, 4)
            .attribute("uv", ScalarType::F32, 2)
            .build()
            .unwrap()
    }

    #[test]
    fn offsets_are_running_sums_of_prior_sizes() {
        let descriptor = mesh_descriptor();

        assert_eq!(descriptor.attribute_offset("position"), Ok(0));
        assert_eq!(descriptor.attribute_offset("normal"), Ok(12));
        assert_eq!(descriptor.attribute_offset("color"), Ok(24));
        assert_eq!(descriptor.attribute_offset("uv"), Ok(28));
        assert_eq!(descriptor.element_size_bytes(), 36);

        let total: u64 = descriptor
            .attributes()
            .iter()
            .map(AttributeDescriptor::size_bytes)
            .sum();
        assert_eq!(total, descriptor.element_size_bytes());
        assert_eq!(
            descriptor.attribute_names().collect::<Vec<_>>(),
            ["position", "normal", "color", "uv"]
        );
    }

    #[test]
    fn element_offset_addresses_single_components() {
        let descriptor = mesh_descriptor();

        assert_eq!(descriptor.element_offset("normal", 2), Ok(20));
        assert_eq!(descriptor.element_offset("color", 3), Ok(27));
        assert!(matches!(
            descriptor.element_offset("uv", 2),
            Err(AttributeError::NoSuchComponent { component: 2, .. })
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ArrayDescriptor::builder()
            .attribute("position", ScalarType::F32, 3)
            .attribute("position", ScalarType::F32, 2)
            .build();

        assert_eq!(
            result,
            Err(ArrayDescriptorError::DuplicateAttribute("position".into()))
        );
    }

    #[test]
    fn empty_and_malformed_descriptors_are_rejected() {
        assert_eq!(
            ArrayDescriptor::builder().build(),
            Err(ArrayDescriptorError::Empty)
        );
        assert!(matches!(
            ArrayDescriptor::builder()
                .attribute("weights", ScalarType::F32, 5)
                .build(),
            Err(ArrayDescriptorError::InvalidComponents { components: 5, .. })
        ));
    }

    #[test]
    fn cursor_requires_matching_type_and_arity() {
        let descriptor = mesh_descriptor();
        let cells = vec![Cell::new(0u8); 36];

        assert!(matches!(
            ArrayCursorWritable::<[f32; 2]>::new(&cells, &descriptor, "position", 1),
            Err(AttributeError::TypeMismatch {
                expected_components: 3,
                actual_components: 2,
                ..
            })
        ));
        assert!(matches!(
            ArrayCursorWritable::<[u32; 3]>::new(&cells, &descriptor, "position", 1),
            Err(AttributeError::TypeMismatch {
                expected: ScalarType::F32,
                actual: ScalarType::U32,
                ..
            })
        ));
        assert!(matches!(
            ArrayCursorWritable::<f32>::new(&cells, &descriptor, "tangent", 1),
            Err(AttributeError::UnknownAttribute(name)) if name == "tangent"
        ));
    }

    #[test]
    fn interleaved_cursors_touch_only_their_own_attribute() {
        let descriptor = mesh_descriptor();
        let count = 3;
        let cells =
            vec![Cell::new(0xAAu8); (descriptor.element_size_bytes() * count) as usize];

        let mut positions =
            ArrayCursorWritable::<[f32; 3]>::new(&cells, &descriptor, "position", count)
                .unwrap();
        let mut uvs =
            ArrayCursorWritable::<[f32; 2]>::new(&cells, &descriptor, "uv", count).unwrap();

        for i in 0..count {
            let f = i as f32;
            positions.put([f, f + 0.5, f + 1.0]).unwrap();
            uvs.put([f * 0.25, 1.0 - f * 0.25]).unwrap();
        }
        assert!(!positions.has_next());
        assert_eq!(
            positions.put([0.0; 3]),
            Err(CursorError::OutOfBounds { index: 3, count: 3 })
        );

        let bytes = read_cells(&cells);
        let mut positions =
            ArrayCursorReadable::<[f32; 3]>::new(&bytes, &descriptor, "position", count)
                .unwrap();
        let mut colors =
            ArrayCursorReadable::<[u8; 4]>::new(&bytes, &descriptor, "color", count).unwrap();
        let mut uvs =
            ArrayCursorReadable::<[f32; 2]>::new(&bytes, &descriptor, "uv", count).unwrap();

        for i in 0..count {
            let f = i as f32;
            assert_eq!(positions.get().unwrap(), [f, f + 0.5, f + 1.0]);
            assert_eq!(uvs.get().unwrap(), [f * 0.25, 1.0 - f * 0.25]);
            // Untouched attribute keeps its fill bytes.
            assert_eq!(colors.get().unwrap(), [0xAA; 4]);
        }
    }

    #[test]
    fn seek_is_checked_against_element_count() {
        let descriptor = mesh_descriptor();
        let bytes = vec![0u8; 72];
        let mut normals =
            ArrayCursorReadable::<[f32; 3]>::new(&bytes, &descriptor, "normal", 2).unwrap();

        assert!(normals.seek_to(1).is_ok());
        assert_eq!(normals.position(), 1);
        assert_eq!(
            normals.seek_to(2),
            Err(CursorError::OutOfBounds { index: 2, count: 2 })
        );
    }

    #[test]
    fn short_region_fails_at_byte_level() {
        let descriptor = mesh_descriptor();
        // Two declared elements, only one and a bit in the region.
        let bytes = vec![0u8; 40];
        let mut uvs =
            ArrayCursorReadable::<[f32; 2]>::new(&bytes, &descriptor, "uv", 2).unwrap();

        assert!(uvs.get().is_ok());
        assert_eq!(
            uvs.get(),
            Err(CursorError::RegionOutOfBounds {
                offset: 64,
                end: 72,
                len: 40
            })
        );
    }
}
