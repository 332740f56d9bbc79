//! Describing data
//!
//! The matching engine moves bytes, but receives are expressed in terms of typed elements: a
//! count of some `Datatype`. A datatype describes the layout of one element in memory as a list
//! of primitive segments at byte offsets (its *typemap*) plus the distance between consecutive
//! elements (its *extent*). The engine only ever asks a datatype three things: how many bytes an
//! element occupies on the wire, whether it can be copied as one block, and where its primitive
//! pieces live so that the codec can gather, scatter and convert them.
//!
//! There are predefined datatypes which directly correspond to Rust primitive types, such as
//! `f64`. A direct relationship between a Rust type and a datatype is covered by the
//! `Equivalence` trait. Starting from those, `Datatype::contiguous()`, `Datatype::vector()` and
//! `Datatype::structured()` build derived layouts. `Datatype::packed()` describes raw bytes that
//! carry their own one byte data format header.
//!
//! Datatypes are reference counted. A posted receive holds a reference until its completion
//! cleanup has run, which `Datatype::ref_count()` makes observable.

use std::fmt;
use std::mem;
use std::slice;
use std::sync::Arc;

use conv::ConvUtil;
use once_cell::sync::Lazy;
use smallvec::SmallVec;

use crate::error::{try_alloc_bytes, Error, Result};
use crate::transmute::EquivalenceFromAnyBytes;
use crate::Count;

/// Datatype traits
pub mod traits {
    pub use super::Equivalence;
}

/// The primitive pieces a datatype is made of.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Uninterpreted byte, never converted
    Byte,
    /// A one byte boolean that must be `0` or `1`
    Bool,
    /// `i8`
    I8,
    /// `u8`
    U8,
    /// `i16`
    I16,
    /// `u16`
    U16,
    /// `i32`
    I32,
    /// `u32`
    U32,
    /// `i64`
    I64,
    /// `u64`
    U64,
    /// `f32`
    F32,
    /// `f64`
    F64,
}

impl ElementKind {
    /// Size in bytes of one element of this kind.
    pub fn size(self) -> usize {
        use self::ElementKind::*;
        match self {
            Byte | Bool | I8 | U8 => 1,
            I16 | U16 => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 => 8,
        }
    }

    /// Whether byte order matters for this kind.
    pub fn is_multibyte(self) -> bool {
        self.size() > 1
    }
}

/// The representation used for multi-byte elements on the wire.
///
/// An endpoint packs outgoing data in its own format and the envelope carries that format, so the
/// receiver knows what to convert from. The format also travels as the single header byte of a
/// `Datatype::packed()` buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Format {
    /// Little endian
    Little = 1,
    /// Big endian
    Big = 2,
}

impl Format {
    /// The format of the machine this code runs on.
    pub fn native() -> Format {
        if cfg!(target_endian = "big") {
            Format::Big
        } else {
            Format::Little
        }
    }

    /// `true` if no conversion is needed to use this format in memory.
    pub fn is_native(self) -> bool {
        self == Format::native()
    }

    /// The one byte header value of this format.
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Decode a one byte header value.
    pub fn from_byte(byte: u8) -> Option<Format> {
        match byte {
            1 => Some(Format::Little),
            2 => Some(Format::Big),
            _ => None,
        }
    }
}

impl Default for Format {
    fn default() -> Self {
        Format::native()
    }
}

/// One primitive piece of a datatype, `offset` bytes from the start of the element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Byte offset within the element
    pub offset: usize,
    /// Primitive kind stored there
    pub kind: ElementKind,
}

struct Layout {
    name: String,
    segments: SmallVec<[Segment; 4]>,
    size: usize,
    extent: usize,
    contiguous: bool,
    packed: bool,
}

/// A reference counted description of the memory layout of one element.
///
/// # Examples
///
/// ```
/// use mpi_match::datatype::Datatype;
/// use mpi_match::traits::*;
///
/// // every other f32 out of a row of 8
/// let strided = Datatype::vector(4, 1, 2, &f32::equivalent_datatype()).unwrap();
/// assert_eq!(strided.size(), 16);
/// assert_eq!(strided.extent(), 28);
/// assert!(!strided.is_contiguous());
/// ```
#[derive(Clone)]
pub struct Datatype(Arc<Layout>);

impl Datatype {
    fn from_segments(name: String, segments: SmallVec<[Segment; 4]>, extent: usize) -> Datatype {
        let size = segments.iter().map(|s| s.kind.size()).sum();
        let mut next = 0;
        let mut tiled = true;
        for segment in &segments {
            if segment.offset != next {
                tiled = false;
                break;
            }
            next += segment.kind.size();
        }
        Datatype(Arc::new(Layout {
            name,
            contiguous: tiled && size == extent,
            segments,
            size,
            extent,
            packed: false,
        }))
    }

    pub(crate) fn primitive(kind: ElementKind) -> Datatype {
        let mut segments = SmallVec::new();
        segments.push(Segment { offset: 0, kind });
        Datatype::from_segments(format!("{:?}", kind), segments, kind.size())
    }

    /// Raw bytes preceded by a one byte `Format` header.
    ///
    /// A count of a packed datatype is a count of bytes, header included. Sending from a packed
    /// buffer strips the header and announces its format; receiving into one prepends the
    /// sender's format.
    pub fn packed() -> Datatype {
        static PACKED: Lazy<Datatype> = Lazy::new(|| {
            let mut segments = SmallVec::new();
            segments.push(Segment {
                offset: 0,
                kind: ElementKind::Byte,
            });
            Datatype(Arc::new(Layout {
                name: "Packed".to_owned(),
                segments,
                size: 1,
                extent: 1,
                contiguous: true,
                packed: true,
            }))
        });
        PACKED.clone()
    }

    /// Constructs a new datatype by concatenating `count` repetitions of `oldtype`
    pub fn contiguous(count: Count, oldtype: &Datatype) -> Result<Datatype> {
        Datatype::vector(count, 1, 1, oldtype)
    }

    /// Construct a new datatype out of `count` blocks of `blocklength` elements of `oldtype`
    /// concatenated with the start of consecutive blocks placed `stride` elements apart.
    pub fn vector(
        count: Count,
        blocklength: Count,
        stride: Count,
        oldtype: &Datatype,
    ) -> Result<Datatype> {
        let count = count
            .value_as::<usize>()
            .map_err(|_| Error::Count("negative vector count"))?;
        let blocklength = blocklength
            .value_as::<usize>()
            .map_err(|_| Error::Count("negative vector block length"))?;
        let stride = stride
            .value_as::<usize>()
            .map_err(|_| Error::Count("negative vector stride"))?;
        if count > 1 && stride < blocklength {
            return Err(Error::Count("vector blocks overlap"));
        }
        if oldtype.is_packed() {
            return Err(Error::Type("packed data cannot be nested"));
        }

        let old_extent = oldtype.extent();
        let mut segments = SmallVec::new();
        for block in 0..count {
            for item in 0..blocklength {
                let base = (block * stride + item) * old_extent;
                segments.extend(oldtype.segments().iter().map(|s| Segment {
                    offset: base + s.offset,
                    kind: s.kind,
                }));
            }
        }
        let extent = if count == 0 {
            0
        } else {
            ((count - 1) * stride + blocklength) * old_extent
        };
        let name = format!("Vector({}, {}, {}, {})", count, blocklength, stride, oldtype.name());
        Ok(Datatype::from_segments(name, segments, extent))
    }

    /// Constructs a new datatype out of blocks of different length, displacement and datatypes.
    ///
    /// Block `i` is `blocklengths[i]` consecutive elements of `types[i]` placed
    /// `displacements[i]` bytes from the start. The extent is the end of the last block, rounded
    /// up to the largest primitive in the layout, the way a `#[repr(C)]` struct is padded.
    pub fn structured(
        blocklengths: &[Count],
        displacements: &[usize],
        types: &[&Datatype],
    ) -> Result<Datatype> {
        if blocklengths.len() != displacements.len() || blocklengths.len() != types.len() {
            return Err(Error::Count("struct arguments differ in length"));
        }

        let mut segments: SmallVec<[Segment; 4]> = SmallVec::new();
        let mut end = 0;
        let mut align = 1;
        for ((&blocklength, &displacement), oldtype) in
            blocklengths.iter().zip(displacements).zip(types)
        {
            if oldtype.is_packed() {
                return Err(Error::Type("packed data cannot be nested"));
            }
            let blocklength = blocklength
                .value_as::<usize>()
                .map_err(|_| Error::Count("negative struct block length"))?;
            for item in 0..blocklength {
                let base = displacement + item * oldtype.extent();
                segments.extend(oldtype.segments().iter().map(|s| Segment {
                    offset: base + s.offset,
                    kind: s.kind,
                }));
            }
            end = end.max(displacement + blocklength * oldtype.extent());
            align = oldtype
                .segments()
                .iter()
                .map(|s| s.kind.size())
                .fold(align, usize::max);
        }
        segments.sort_by_key(|s| s.offset);
        for pair in segments.windows(2) {
            if pair[0].offset + pair[0].kind.size() > pair[1].offset {
                return Err(Error::Type("struct blocks overlap"));
            }
        }

        let extent = (end + align - 1) / align * align;
        let name = format!(
            "Struct[{}]",
            types
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Datatype::from_segments(name, segments, extent))
    }

    /// A readable description of the layout.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Number of bytes one element occupies once packed.
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// Distance in bytes between the start of consecutive elements in memory.
    pub fn extent(&self) -> usize {
        self.0.extent
    }

    /// `true` if elements can be copied as one block of memory.
    pub fn is_contiguous(&self) -> bool {
        self.0.contiguous
    }

    /// `true` for `Datatype::packed()`.
    pub fn is_packed(&self) -> bool {
        self.0.packed
    }

    /// `true` if the layout contains elements whose byte order depends on the data format.
    pub fn is_format_sensitive(&self) -> bool {
        self.0.segments.iter().any(|s| s.kind.is_multibyte())
    }

    /// The primitive pieces of one element, ordered by offset.
    pub fn segments(&self) -> &[Segment] {
        &self.0.segments
    }

    /// Number of live references to this datatype.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datatype")
            .field("name", &self.0.name)
            .field("size", &self.0.size)
            .field("extent", &self.0.extent)
            .finish()
    }
}

impl PartialEq for Datatype {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.packed == other.0.packed
                && self.0.extent == other.0.extent
                && self.0.segments == other.0.segments)
    }
}

impl Eq for Datatype {}

/// A direct equivalence exists between the implementing type and a datatype
///
/// # Safety
///
/// The datatype must describe every byte of the Rust type that carries data, with the offsets
/// and primitive kinds the type actually has, and its extent must equal `size_of::<Self>()`.
pub unsafe trait Equivalence {
    /// The datatype that is equivalent to this Rust type
    fn equivalent_datatype() -> Datatype;
}

macro_rules! equivalent_system_datatype {
    ($rstype:path, $kind:ident) => {
        unsafe impl Equivalence for $rstype {
            fn equivalent_datatype() -> Datatype {
                static DATATYPE: Lazy<Datatype> =
                    Lazy::new(|| Datatype::primitive(ElementKind::$kind));
                DATATYPE.clone()
            }
        }
    };
}

equivalent_system_datatype!(bool, Bool);

equivalent_system_datatype!(f32, F32);
equivalent_system_datatype!(f64, F64);

equivalent_system_datatype!(i8, I8);
equivalent_system_datatype!(i16, I16);
equivalent_system_datatype!(i32, I32);
equivalent_system_datatype!(i64, I64);

equivalent_system_datatype!(u8, U8);
equivalent_system_datatype!(u16, U16);
equivalent_system_datatype!(u32, U32);
equivalent_system_datatype!(u64, U64);

#[cfg(target_pointer_width = "32")]
equivalent_system_datatype!(usize, U32);
#[cfg(target_pointer_width = "32")]
equivalent_system_datatype!(isize, I32);

#[cfg(target_pointer_width = "64")]
equivalent_system_datatype!(usize, U64);
#[cfg(target_pointer_width = "64")]
equivalent_system_datatype!(isize, I64);

#[cfg(feature = "complex")]
macro_rules! equivalent_complex_datatype {
    ($rstype:ty, $part:ty) => {
        unsafe impl Equivalence for $rstype {
            fn equivalent_datatype() -> Datatype {
                static DATATYPE: Lazy<Datatype> = Lazy::new(|| {
                    let part = <$part>::equivalent_datatype();
                    Datatype::structured(&[2], &[0], &[&part])
                        .unwrap_or_else(|_| unreachable!("two floats always form a struct"))
                });
                DATATYPE.clone()
            }
        }
    };
}

#[cfg(feature = "complex")]
equivalent_complex_datatype!(num_complex::Complex<f32>, f32);
#[cfg(feature = "complex")]
equivalent_complex_datatype!(num_complex::Complex<f64>, f64);

/// Describes a receive buffer: storage for `count` elements of `datatype`.
///
/// The storage is laid out the way the datatype describes memory, i.e. `count * extent` bytes.
/// A descriptor without storage is only valid for an empty receive.
#[derive(Debug)]
pub struct BufferDesc {
    storage: Option<Vec<u8>>,
    count: usize,
    datatype: Datatype,
}

impl BufferDesc {
    /// Allocate zeroed storage for `count` elements of `datatype`.
    pub fn new(count: usize, datatype: Datatype) -> Result<BufferDesc> {
        let len = count
            .checked_mul(datatype.extent())
            .ok_or(Error::Count("buffer size overflows"))?;
        Ok(BufferDesc {
            storage: Some(try_alloc_bytes(len)?),
            count,
            datatype,
        })
    }

    /// Use `bytes` as storage for `count` elements of `datatype`.
    pub fn from_bytes(bytes: Vec<u8>, count: usize, datatype: Datatype) -> Result<BufferDesc> {
        let needed = count
            .checked_mul(datatype.extent())
            .ok_or(Error::Count("buffer size overflows"))?;
        if bytes.len() < needed {
            return Err(Error::Buffer("storage is shorter than count elements"));
        }
        Ok(BufferDesc {
            storage: Some(bytes),
            count,
            datatype,
        })
    }

    /// A descriptor that has no storage at all.
    pub fn null(count: usize, datatype: Datatype) -> BufferDesc {
        BufferDesc {
            storage: None,
            count,
            datatype,
        }
    }

    /// Number of elements the buffer can hold.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Element datatype.
    pub fn datatype(&self) -> &Datatype {
        &self.datatype
    }

    /// `true` if the buffer has no storage.
    pub fn is_null(&self) -> bool {
        self.storage.is_none()
    }

    /// `true` if the received bytes can be written straight into the storage.
    pub fn is_contiguous(&self) -> bool {
        self.datatype.is_contiguous()
    }

    /// Number of bytes `count` elements occupy once packed.
    pub fn packed_len(&self) -> usize {
        self.count * self.datatype.size()
    }

    /// The storage, empty for a null descriptor.
    pub fn bytes(&self) -> &[u8] {
        self.storage.as_deref().unwrap_or(&[])
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_deref_mut().unwrap_or(&mut [])
    }

    /// Give up the storage.
    pub fn into_bytes(self) -> Vec<u8> {
        self.storage.unwrap_or_default()
    }

    /// Reject descriptors that cannot receive anything.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.storage.is_none() && self.count > 0 && self.datatype.size() > 0 {
            return Err(Error::Buffer("no storage for a positive count"));
        }
        Ok(())
    }
}

/// View a typed slice as the bytes it is made of.
pub fn bytes_of<T: Equivalence>(buf: &[T]) -> &[u8] {
    // Equivalence guarantees the datatype describes the memory of T
    unsafe { slice::from_raw_parts(buf.as_ptr() as *const u8, mem::size_of_val(buf)) }
}

/// View a typed slice as mutable bytes.
pub fn bytes_of_mut<T: Equivalence + EquivalenceFromAnyBytes>(buf: &mut [T]) -> &mut [u8] {
    // any byte pattern written here is a valid T
    unsafe { slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, mem::size_of_val(buf)) }
}
