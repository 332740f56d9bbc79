//! Gathering, scattering and converting typed data
//!
//! The matching engine treats the codec as opaque: it asks for the size of a typed buffer in a
//! sender's format, and it hands staging buffers to `unpack()` when a receive cannot be written
//! to directly. `NativeCodec` implements this over `Datatype` typemaps with byte swapping as the
//! only conversion between formats, so a packed element has the same size in every format.

use crate::checked_bool::Bool;
use crate::datatype::{Datatype, ElementKind, Format};
use crate::error::{try_alloc_bytes, Error, Result};

/// Conversion between typed memory and packed bytes.
pub trait Codec: Send + Sync {
    /// Size in bytes of `count` elements of `datatype` packed in `src_format`.
    fn sizeof_remote(&self, datatype: &Datatype, count: usize, src_format: Format) -> usize;

    /// Gather `count` elements of `datatype` from `src` into bytes in `dst_format`.
    fn pack(
        &self,
        src: &[u8],
        datatype: &Datatype,
        count: usize,
        dst_format: Format,
    ) -> Result<Vec<u8>>;

    /// Scatter as many whole elements of `datatype` as `staging` holds, up to `count`, into
    /// `dst`. Returns the number of bytes of `staging` consumed.
    fn unpack(
        &self,
        staging: &[u8],
        src_format: Format,
        dst: &mut [u8],
        datatype: &Datatype,
        count: usize,
    ) -> Result<usize>;
}

/// Codec for datatypes whose elements only differ in byte order between formats.
#[derive(Copy, Clone, Debug, Default)]
pub struct NativeCodec;

fn copy_element(kind: ElementKind, from: &[u8], to: &mut [u8], swap: bool) {
    to.copy_from_slice(from);
    if swap && kind.is_multibyte() {
        to.reverse();
    }
}

impl Codec for NativeCodec {
    fn sizeof_remote(&self, datatype: &Datatype, count: usize, _src_format: Format) -> usize {
        datatype.size() * count
    }

    fn pack(
        &self,
        src: &[u8],
        datatype: &Datatype,
        count: usize,
        dst_format: Format,
    ) -> Result<Vec<u8>> {
        if count > 0 && src.len() < (count - 1) * datatype.extent() + span(datatype) {
            return Err(Error::Buffer("source is shorter than count elements"));
        }
        let mut packed = try_alloc_bytes(datatype.size() * count)?;
        if datatype.is_contiguous() && (dst_format.is_native() || !datatype.is_format_sensitive())
        {
            packed.copy_from_slice(&src[..datatype.size() * count]);
            return Ok(packed);
        }

        let swap = !dst_format.is_native();
        let mut cursor = 0;
        for element in 0..count {
            let base = element * datatype.extent();
            for segment in datatype.segments() {
                let len = segment.kind.size();
                let from = &src[base + segment.offset..base + segment.offset + len];
                copy_element(segment.kind, from, &mut packed[cursor..cursor + len], swap);
                cursor += len;
            }
        }
        Ok(packed)
    }

    fn unpack(
        &self,
        staging: &[u8],
        src_format: Format,
        dst: &mut [u8],
        datatype: &Datatype,
        count: usize,
    ) -> Result<usize> {
        let size = datatype.size();
        if size == 0 {
            return Ok(0);
        }
        let elements = count.min(staging.len() / size);
        if elements > 0 && dst.len() < (elements - 1) * datatype.extent() + span(datatype) {
            return Err(Error::Buffer("destination is shorter than count elements"));
        }

        let swap = !src_format.is_native();
        let mut cursor = 0;
        for element in 0..elements {
            let base = element * datatype.extent();
            for segment in datatype.segments() {
                let len = segment.kind.size();
                let from = &staging[cursor..cursor + len];
                if segment.kind == ElementKind::Bool {
                    if let Err(e) = Bool::from_byte(from[0]).valid() {
                        return Err(Error::intern(format!("cannot decode element: {}", e)));
                    }
                }
                let to = &mut dst[base + segment.offset..base + segment.offset + len];
                copy_element(segment.kind, from, to, swap);
                cursor += len;
            }
        }
        Ok(cursor)
    }
}

/// Bytes from the start of an element to the end of its last segment.
fn span(datatype: &Datatype) -> usize {
    datatype
        .segments()
        .iter()
        .map(|s| s.offset + s.kind.size())
        .max()
        .unwrap_or(0)
}

/// Pack `count` elements into a buffer suitable for `Datatype::packed()`: the format byte
/// followed by the packed data.
pub fn pack_external(
    codec: &dyn Codec,
    src: &[u8],
    datatype: &Datatype,
    count: usize,
    format: Format,
) -> Result<Vec<u8>> {
    let body = codec.pack(src, datatype, count, format)?;
    let mut packed = Vec::new();
    packed
        .try_reserve_exact(body.len() + 1)
        .map_err(|_| Error::Exhausted)?;
    packed.push(format.byte());
    packed.extend_from_slice(&body);
    Ok(packed)
}

/// Unpack a `Datatype::packed()` buffer into freshly allocated storage for `count` elements.
pub fn unpack_external(
    codec: &dyn Codec,
    packed: &[u8],
    datatype: &Datatype,
    count: usize,
) -> Result<Vec<u8>> {
    let (&header, body) = packed
        .split_first()
        .ok_or(Error::Buffer("packed buffer has no format header"))?;
    let format = Format::from_byte(header)
        .ok_or_else(|| Error::intern(format!("unknown data format 0x{:x}", header)))?;
    let mut storage = try_alloc_bytes(count * datatype.extent())?;
    codec.unpack(body, format, &mut storage, datatype, count)?;
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{bytes_of, Equivalence};

    fn other(format: Format) -> Format {
        match format {
            Format::Little => Format::Big,
            Format::Big => Format::Little,
        }
    }

    #[test]
    fn pack_unpack_identity() {
        let values = [1.5f64, -2.25, 1e300];
        let dt = f64::equivalent_datatype();
        for format in [Format::native(), other(Format::native())] {
            let packed = NativeCodec.pack(bytes_of(&values[..]), &dt, 3, format).unwrap();
            assert_eq!(packed.len(), NativeCodec.sizeof_remote(&dt, 3, format));
            let mut out = [0.0f64; 3];
            let used = NativeCodec
                .unpack(&packed, format, crate::datatype::bytes_of_mut(&mut out[..]), &dt, 3)
                .unwrap();
            assert_eq!(used, 24);
            assert_eq!(out, values);
        }
    }

    #[test]
    fn foreign_format_swaps_bytes() {
        let value = [0x0102_0304u32];
        let dt = u32::equivalent_datatype();
        let packed = NativeCodec
            .pack(bytes_of(&value[..]), &dt, 1, other(Format::native()))
            .unwrap();
        let mut expected = 0x0102_0304u32.to_ne_bytes();
        expected.reverse();
        assert_eq!(packed, expected);
    }

    #[test]
    fn strided_gather_and_scatter() {
        let row = [1i32, 2, 3, 4, 5, 6];
        let every_other = Datatype::vector(3, 1, 2, &i32::equivalent_datatype()).unwrap();
        let packed = NativeCodec
            .pack(bytes_of(&row[..]), &every_other, 1, Format::native())
            .unwrap();
        assert_eq!(packed.len(), 12);

        let mut out = [0i32; 5];
        NativeCodec
            .unpack(
                &packed,
                Format::native(),
                crate::datatype::bytes_of_mut(&mut out[..]),
                &every_other,
                1,
            )
            .unwrap();
        assert_eq!(out, [1, 0, 3, 0, 5]);
    }

    #[test]
    fn unpack_stops_at_whole_elements() {
        let dt = u32::equivalent_datatype();
        let staging = [7u8; 10];
        let mut out = [0u32; 4];
        let used = NativeCodec
            .unpack(
                &staging,
                Format::native(),
                crate::datatype::bytes_of_mut(&mut out[..]),
                &dt,
                4,
            )
            .unwrap();
        assert_eq!(used, 8);
        assert_eq!(out[2], 0);
    }

    #[test]
    fn invalid_bool_is_a_decode_failure() {
        let dt = bool::equivalent_datatype();
        let mut out = [0u8; 2];
        let err = NativeCodec
            .unpack(&[1, 5], Format::native(), &mut out, &dt, 2)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Intern);
    }

    #[test]
    fn external_round_trip() {
        let values = [3u16, 4, 5];
        let dt = u16::equivalent_datatype();
        let packed = pack_external(&NativeCodec, bytes_of(&values[..]), &dt, 3, Format::Big).unwrap();
        assert_eq!(packed[0], Format::Big.byte());
        assert_eq!(&packed[1..3], &[0, 3]);
        let storage = unpack_external(&NativeCodec, &packed, &dt, 3).unwrap();
        assert_eq!(storage, bytes_of(&values[..]));

        let err = unpack_external(&NativeCodec, &[9, 0, 0], &dt, 1).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Intern);
    }
}
