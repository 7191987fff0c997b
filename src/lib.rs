//! Inspection core for AVIF still images.
//!
//! Two independent passes: [`read_meta`] walks the ISO Base Media File Format
//! box tree inside the top-level `meta` box and assembles the item and
//! property tables, and [`obu`] walks a size-delimited AV1 OBU stream to
//! locate and decode the Sequence Header. [`MetaSummary::plan_extraction`]
//! turns the item table into the byte ranges that reconstitute the primary
//! item's payload.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[macro_use]
extern crate log;

use arrayvec::ArrayVec;
use bitreader::BitReader;
use byteorder::ReadBytesExt;
use std::convert::TryInto as _;

use std::io::{Read, Write};

#[macro_use]
mod macros;

mod boxes;
use crate::boxes::BoxType;
pub use crate::boxes::FourCC;

pub mod obu;


/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail TryInto<usize> is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        static_assertions::const_assert!(
            std::mem::size_of::<usize>() <= std::mem::size_of::<u64>()
        );
        self.try_into().expect("usize -> u64 conversion failed")
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail TryInto<usize> is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                static_assertions::const_assert!(
                    std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>()
                );
                self.try_into().expect(concat!(
                    stringify!($from_type),
                    " -> usize conversion failed"
                ))
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes inspection failures.
///
/// Structural variants report corrupt or malformed data; unsupported variants
/// report well-formed data outside this crate's single-still-picture scope.
/// The first such condition aborts the containing parse.
#[derive(Debug)]
pub enum Error {
    /// A box header needs more bytes than remain before its container's end.
    TruncatedHeader { offset: u64 },
    /// A box declares a total size smaller than its own header.
    InvalidSize { offset: u64 },
    /// A box extends past the end of its parent box or the file.
    OverrunsParent { offset: u64 },
    /// No top-level `meta` box in the file.
    NoMetaBox,
    /// `iinf` ends before its declared entry count is satisfied.
    TruncatedIinf,
    /// FullBox version outside the supported set.
    UnsupportedVersion {
        box_type: &'static str,
        version: u8,
    },
    /// `pitm` is absent or names no entry in the item table.
    MissingPrimary,
    /// The primary item is not an `av01` coded still picture.
    NotCodedStill,
    /// The primary item has no `iloc` entry or no extents.
    NoExtents,
    /// `iloc.data_reference_index != 0`; the payload lives in another file.
    ExternalData,
    /// `iloc` construction method this crate does not extract from.
    UnsupportedConstruction(u8),
    /// An extent carries an extent_index, which only construction method 2 uses.
    UnsupportedExtentIndex,
    /// An extent with length zero.
    ZeroExtentLength,
    /// OBU header byte with the forbidden bit set.
    ForbiddenBit { offset: usize },
    /// OBU without a size field; only size-delimited streams are read.
    NoSizeField { offset: usize },
    /// OBU payload extends past the end of the buffer.
    PayloadOverrun { offset: usize },
    /// uvlc() with more than 31 leading zeros.
    UvlcTooLong,
    /// The input ended in the middle of a field.
    EndOfStream,
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// Out of memory
    OutOfMemory,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TruncatedHeader { offset } => {
                write!(f, "truncated box header at offset {offset}")
            }
            Self::InvalidSize { offset } => {
                write!(f, "box size smaller than its header at offset {offset}")
            }
            Self::OverrunsParent { offset } => {
                write!(f, "box at offset {offset} overruns its parent")
            }
            Self::NoMetaBox => f.write_str("no top-level meta box"),
            Self::TruncatedIinf => f.write_str("iinf ends before its declared entry count"),
            Self::UnsupportedVersion { box_type, version } => {
                write!(f, "unsupported {box_type} version {version}")
            }
            Self::MissingPrimary => f.write_str("primary item is missing from the item table"),
            Self::NotCodedStill => f.write_str("primary item is not an av01 coded still picture"),
            Self::NoExtents => f.write_str("primary item has no extents"),
            Self::ExternalData => f.write_str("item data lives in an external file"),
            Self::UnsupportedConstruction(method) => {
                write!(f, "unsupported iloc construction method {method}")
            }
            Self::UnsupportedExtentIndex => f.write_str("extent indices are not supported"),
            Self::ZeroExtentLength => f.write_str("extent with zero length"),
            Self::ForbiddenBit { offset } => {
                write!(f, "obu forbidden bit set at offset {offset}")
            }
            Self::NoSizeField { offset } => {
                write!(f, "obu without a size field at offset {offset}")
            }
            Self::PayloadOverrun { offset } => {
                write!(f, "obu payload at offset {offset} overruns the buffer")
            }
            Self::UvlcTooLong => f.write_str("uvlc value with more than 31 leading zeros"),
            Self::EndOfStream => f.write_str("input ended mid-field"),
            Self::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    fn from(err: bitreader::BitReaderError) -> Error {
        match err {
            bitreader::BitReaderError::NotEnoughData { .. } => Error::EndOfStream,
            bitreader::BitReaderError::TooManyBitsForType { .. } => {
                Error::Unsupported("bit read wider than the target type")
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::EndOfStream,
            _ => Error::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Error {
        Error::Unsupported("integer conversion failed")
    }
}

impl From<fallible_collections::TryReserveError> for Error {
    fn from(_: fallible_collections::TryReserveError) -> Error {
        Error::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Borrowed window into the input buffer with an absolute read position.
///
/// `end` is the containing box's end (the file's end at top level), so reads
/// can never stray past the parent and offsets reported to callers are file
/// offsets.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            end: buf.len(),
        }
    }

    fn offset(&self) -> u64 {
        self.pos.to_u64()
    }

    fn bytes_left(&self) -> u64 {
        (self.end - self.pos).to_u64()
    }

    fn skip(&mut self, bytes: u64) -> Result<()> {
        let bytes: usize = bytes.try_into()?;
        if bytes > self.end - self.pos {
            return Err(Error::EndOfStream);
        }
        self.pos += bytes;
        Ok(())
    }

    /// Hand out everything up to the container's end and advance past it.
    fn take_remaining(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..self.end];
        self.pos = self.end;
        slice
    }
}

impl Read for Cursor<'_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let n = out.len().min(self.end - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Basic ISO box structure.
///
/// An ISOBMFF file is a sequence of possibly-nested 'box' structures. Each
/// box begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    /// Box type.
    name: BoxType,
    /// Absolute file offset of the first byte of the box.
    offset: u64,
    /// Total size of the box in bytes, header included.
    size: u64,
    /// Length of the header preceding the content: 8, 16, 24 or 32.
    header_len: u64,
    /// Uuid for extended type.
    #[allow(dead_code)]
    uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    const MIN_SIZE: u64 = 8; // 4-byte size + 4-byte type
    const MIN_LARGE_SIZE: u64 = 16; // 4-byte size + 4-byte type + 8-byte size
}

/// See ISO 14496-12:2015 § 4.2
struct BMFFBox<'a> {
    head: BoxHeader,
    content: Cursor<'a>,
}

struct BoxIter<'a, 'b> {
    src: &'b mut Cursor<'a>,
}

impl<'a, 'b> BoxIter<'a, 'b> {
    fn new(src: &'b mut Cursor<'a>) -> Self {
        BoxIter { src }
    }

    fn next_box(&mut self) -> Result<Option<BMFFBox<'a>>> {
        if self.src.bytes_left() == 0 {
            return Ok(None);
        }
        let head = read_box_header(self.src)?;
        // Bounded by the parent check in read_box_header.
        let end = usize::try_from(head.offset + head.size)?;
        let content = Cursor {
            buf: self.src.buf,
            pos: self.src.pos,
            end,
        };
        self.src.pos = end;
        Ok(Some(BMFFBox { head, content }))
    }
}

impl Read for BMFFBox<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<'a> BMFFBox<'a> {
    fn bytes_left(&self) -> u64 {
        self.content.bytes_left()
    }

    fn get_header(&self) -> &BoxHeader {
        &self.head
    }

    /// Absolute file offset of the box content.
    fn content_offset(&self) -> u64 {
        self.head.offset + self.head.header_len
    }

    fn take_remaining(&mut self) -> &'a [u8] {
        self.content.take_remaining()
    }

    fn box_iter<'b>(&'b mut self) -> BoxIter<'a, 'b> {
        BoxIter::new(&mut self.content)
    }
}

impl Drop for BMFFBox<'_> {
    fn drop(&mut self) {
        if self.content.bytes_left() > 0 {
            let name: FourCC = From::from(self.head.name);
            debug!("Dropping {} bytes in '{}'", self.content.bytes_left(), name);
        }
    }
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular box and its length.
/// Used internally for dispatching to specific parsers for the internal
/// content, or to get the length to skip unknown or uninteresting boxes.
///
/// See ISO 14496-12:2015 § 4.2
fn read_box_header(src: &mut Cursor<'_>) -> Result<BoxHeader> {
    let offset = src.offset();
    let truncated = |_| Error::TruncatedHeader { offset };
    let size32 = be_u32(src).map_err(truncated)?;
    let name = BoxType::from(be_u32(src).map_err(truncated)?);
    let (size, mut header_len) = match size32 {
        // The box occupies the rest of its container.
        0 => (src.end.to_u64() - offset, BoxHeader::MIN_SIZE),
        1 => (be_u64(src).map_err(truncated)?, BoxHeader::MIN_LARGE_SIZE),
        _ => (u64::from(size32), BoxHeader::MIN_SIZE),
    };
    let uuid = if name == BoxType::UuidBox {
        let mut buffer = [0u8; 16];
        src.read_exact(&mut buffer)
            .map_err(|_| Error::TruncatedHeader { offset })?;
        header_len += 16;
        Some(buffer)
    } else {
        None
    };
    if size < header_len {
        return Err(Error::InvalidSize { offset });
    }
    if offset
        .checked_add(size)
        .map_or(true, |end| end > src.end.to_u64())
    {
        return Err(Error::OverrunsParent { offset });
    }
    Ok(BoxHeader {
        name,
        offset,
        size,
        header_len,
        uuid,
    })
}

/// Parse the extra header fields for a full box.
fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

/// Skip over the entire contents of a box.
fn skip_box_content(src: &mut BMFFBox<'_>) -> Result<()> {
    let to_skip = {
        let header = src.get_header();
        debug!("{:?} (skipped)", header);
        src.bytes_left()
    };
    src.content.skip(to_skip)
}

/// Skip over the remaining data of a box.
fn skip_box_remain(src: &mut BMFFBox<'_>) -> Result<()> {
    let remain = {
        let header = src.get_header();
        let len = src.bytes_left();
        if len > 0 {
            debug!("remain {} (skipped) in {:?}", len, header);
        }
        len
    };
    src.content.skip(remain)
}

/// An item of the `meta` box, assembled from `infe`, `iloc` and `ipma`.
///
/// Any of the three boxes may name an id the others never mention, so every
/// field beyond the id is optional.
#[derive(Debug, PartialEq)]
pub struct Item {
    pub id: u32,
    /// Four-byte item type; `infe` versions 0 and 1 carry none.
    pub item_type: Option<FourCC>,
    pub location: Option<ItemLocation>,
    /// `ipma` associations in file order.
    pub associations: TryVec<PropertyAssociation>,
}

/// Where an item's payload lives, from the `iloc` box.
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, PartialEq)]
pub struct ItemLocation {
    /// Raw construction method nibble; the extent planner polices the value.
    pub construction_method: u8,
    pub data_reference_index: u16,
    pub base_offset: u64,
    pub extents: TryVec<Extent>,
}

/// A single byte range of an item's payload. `offset` already includes the
/// item's base offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    /// Extent index, recorded for `iloc` versions 1 and 2 when index_size > 0.
    pub index: Option<u64>,
}

/// One `ipma` association value: a 1-based property index and the essential
/// flag. The flag is preserved but not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyAssociation {
    pub property_index: u16,
    pub essential: bool,
}

/// One entry of the `ipco` property table, in container order.
#[derive(Debug, PartialEq)]
pub struct Property {
    pub name: FourCC,
    /// Absolute file offset of the property box.
    pub offset: u64,
    pub size: u64,
    pub detail: PropertyDetail,
}

/// Decoded payload of a property box.
#[derive(Debug, PartialEq)]
pub enum PropertyDetail {
    ImageSpatialExtents {
        width: u32,
        height: u32,
    },
    PixelInformation {
        num_channels: u8,
        /// Bit depth per channel; at most 16 are kept.
        depths: ArrayVec<u8, 16>,
        truncated: bool,
    },
    Av1Config(AV1ConfigBox),
    /// Recognised property type with a version this crate does not decode.
    Unavailable,
    /// Property type without a decoder; only type, offset and size are kept.
    Unknown,
}

/// The four fixed bytes of an AV1CodecConfigurationBox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AV1ConfigBox {
    pub profile: u8,
    pub level: u8,
    pub tier: u8,
    pub high_bitdepth: bool,
    pub twelve_bit: bool,
    pub monochrome: bool,
    pub chroma_subsampling_x: u8,
    pub chroma_subsampling_y: u8,
    pub chroma_sample_position: u8,
    pub initial_presentation_delay_present: bool,
    pub initial_presentation_delay_minus_one: u8,
}

/// An Item Data Box: an inline payload store referenced by `iloc`
/// construction method 1.
/// See ISO 14496-12:2015 § 8.11.11
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemDataBox {
    /// Absolute file offset of the payload.
    pub offset: u64,
    pub size: u64,
}

/// Everything collected from a single forward pass over the `meta` box.
///
/// Tables are immutable once [`read_meta`] returns.
#[derive(Debug, PartialEq)]
pub struct MetaSummary {
    /// `hdlr` handler type, verbatim.
    pub handler_type: Option<FourCC>,
    /// The item designated by `pitm`, if any.
    pub primary_item_id: Option<u32>,
    pub idat: Option<ItemDataBox>,
    pub items: TryVec<Item>,
    /// `ipco` properties in container order; `ipma` indices are 1-based into
    /// this table.
    pub properties: TryVec<Property>,
    /// Count of tolerated anomalies (also reported through `log`).
    pub warnings: u32,
}

impl MetaSummary {
    pub fn item(&self, id: u32) -> Option<&Item> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn primary_item(&self) -> Option<&Item> {
        self.item(self.primary_item_id?)
    }

    /// Look up a 1-based `ipma` property index.
    pub fn property(&self, index: u16) -> Option<&Property> {
        let index = index.checked_sub(1)?;
        self.properties.get(index.to_usize())
    }

    /// Properties associated with an item, in association order.
    ///
    /// Indices outside the property table resolve to `None`.
    pub fn item_properties(
        &self,
        id: u32,
    ) -> impl Iterator<Item = (&PropertyAssociation, Option<&Property>)> {
        let associations = self
            .item(id)
            .map_or(&[][..], |item| item.associations.as_slice());
        associations
            .iter()
            .map(move |a| (a, self.property(a.property_index)))
    }

    /// Get-or-create table entry; `infe`, `iloc` and `ipma` each key by id.
    fn item_entry(&mut self, id: u32) -> Result<&mut Item> {
        if !self.items.iter().any(|item| item.id == id) {
            self.items.push(Item {
                id,
                item_type: None,
                location: None,
                associations: TryVec::new(),
            })?;
        }
        Ok(self
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .expect("entry just ensured"))
    }

    /// Plan the byte ranges that reconstitute the primary item's payload.
    ///
    /// Checks are applied in a fixed order so a given file always refuses
    /// with the same condition. The returned ranges are bounds-checked
    /// against `file_len` (or against the `idat` payload for construction
    /// method 1, whose ranges are then rebased onto the file).
    pub fn plan_extraction(&self, file_len: u64) -> Result<ExtractionPlan> {
        let item = self.primary_item().ok_or(Error::MissingPrimary)?;
        match item.item_type {
            Some(item_type) if item_type == b"av01" => (),
            Some(item_type) => {
                warn!("primary item type: {item_type}");
                return Err(Error::NotCodedStill);
            }
            None => return Err(Error::NotCodedStill),
        }
        let location = item.location.as_ref().ok_or(Error::NoExtents)?;
        if location.extents.is_empty() {
            return Err(Error::NoExtents);
        }
        if location.data_reference_index != 0 {
            return Err(Error::ExternalData);
        }
        let idat = match location.construction_method {
            0 => None,
            1 => Some(self.idat.as_ref().ok_or(Error::InvalidData(
                "construction method 1 without an idat box",
            ))?),
            method => return Err(Error::UnsupportedConstruction(method)),
        };

        let mut ranges = TryVec::with_capacity(location.extents.len())?;
        for extent in location.extents.iter() {
            if extent.index.is_some() {
                return Err(Error::UnsupportedExtentIndex);
            }
            if extent.length == 0 {
                return Err(Error::ZeroExtentLength);
            }
            let end = extent
                .offset
                .checked_add(extent.length)
                .ok_or(Error::InvalidData("extent end overflow"))?;
            let src_offset = match idat {
                None => {
                    if end > file_len {
                        return Err(Error::InvalidData("extent overruns the file"));
                    }
                    extent.offset
                }
                Some(idat) => {
                    if end > idat.size {
                        return Err(Error::InvalidData("extent overruns the idat payload"));
                    }
                    idat.offset
                        .checked_add(extent.offset)
                        .ok_or(Error::InvalidData("offset calculation overflow"))?
                }
            };
            ranges.push(ByteRange {
                src_offset,
                len: extent.length,
            })?;
        }
        Ok(ExtractionPlan { ranges })
    }

    /// The condition [`Self::plan_extraction`] would refuse with, if any.
    pub fn extraction_refusal(&self, file_len: u64) -> Option<Error> {
        self.plan_extraction(file_len).err()
    }
}

/// Ordered byte ranges that reconstitute the primary item's payload.
#[derive(Debug, PartialEq)]
pub struct ExtractionPlan {
    pub ranges: TryVec<ByteRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub src_offset: u64,
    pub len: u64,
}

/// Stream an extraction plan's byte ranges from the file to a sink.
///
/// Returns the number of bytes written.
pub fn copy_plan<W: Write>(file: &[u8], plan: &ExtractionPlan, out: &mut W) -> Result<u64> {
    let mut written: u64 = 0;
    for range in plan.ranges.iter() {
        let start: usize = range.src_offset.try_into()?;
        let end = start
            .checked_add(range.len.try_into()?)
            .ok_or(Error::InvalidData("plan range end overflow"))?;
        let chunk = file
            .get(start..end)
            .ok_or(Error::InvalidData("plan range outside the file"))?;
        out.write_all(chunk)?;
        written += range.len;
    }
    Ok(written)
}

/// Read the item metadata of an AVIF file.
///
/// Scans top-level boxes for the first `meta` box and assembles its item and
/// property tables in a single forward pass.
pub fn read_meta(buf: &[u8]) -> Result<MetaSummary> {
    let mut cursor = Cursor::new(buf);
    let mut iter = BoxIter::new(&mut cursor);
    while let Some(mut b) = iter.next_box()? {
        if b.head.name == BoxType::MetadataBox {
            return read_meta_content(&mut b);
        }
        skip_box_content(&mut b)?;
    }
    Err(Error::NoMetaBox)
}

/// Parse the children of a `meta` box.
/// See ISO 14496-12:2015 § 8.11.1
fn read_meta_content(src: &mut BMFFBox<'_>) -> Result<MetaSummary> {
    // meta is a FullBox, but nothing in it depends on version or flags.
    let (_version, _flags) = read_fullbox_extra(src)?;

    let mut meta = MetaSummary {
        handler_type: None,
        primary_item_id: None,
        idat: None,
        items: TryVec::new(),
        properties: TryVec::new(),
        warnings: 0,
    };

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::HandlerBox => meta.handler_type = Some(read_hdlr(&mut b)?),
            BoxType::PrimaryItemBox => meta.primary_item_id = Some(read_pitm(&mut b)?),
            BoxType::ItemInfoBox => read_iinf(&mut b, &mut meta)?,
            BoxType::ItemLocationBox => read_iloc(&mut b, &mut meta)?,
            BoxType::ItemPropertiesBox => read_iprp(&mut b, &mut meta)?,
            BoxType::ItemDataBox => {
                meta.idat = Some(ItemDataBox {
                    offset: b.content_offset(),
                    size: b.bytes_left(),
                });
                skip_box_remain(&mut b)?;
            }
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state!(b);
    }

    Ok(meta)
}

/// Parse a Handler Reference Box, keeping only the handler type.
/// See ISO 14496-12:2015 § 8.4.3
fn read_hdlr(src: &mut BMFFBox<'_>) -> Result<FourCC> {
    let (_version, _flags) = read_fullbox_extra(src)?;

    let _pre_defined = be_u32(src)?;
    let handler_type = be_u32(src)?;

    // Reserved fields and the null-terminated name are not of interest.
    skip_box_remain(src)?;

    Ok(handler_type.into())
}

/// Parse a Primary Item Box.
/// See ISO 14496-12:2015 § 8.11.4
fn read_pitm(src: &mut BMFFBox<'_>) -> Result<u32> {
    let (version, _flags) = read_fullbox_extra(src)?;

    let item_id = match version {
        0 => be_u16(src)?.into(),
        1 => be_u32(src)?,
        version => {
            return Err(Error::UnsupportedVersion {
                box_type: "pitm",
                version,
            })
        }
    };

    Ok(item_id)
}

/// Parse an Item Information Box.
/// See ISO 14496-12:2015 § 8.11.6
fn read_iinf(src: &mut BMFFBox<'_>, meta: &mut MetaSummary) -> Result<()> {
    let (version, _flags) = read_fullbox_extra(src)?;

    let entry_count = match version {
        0 => be_u16(src)?.to_usize(),
        1 => be_u32(src)?.to_usize(),
        version => {
            return Err(Error::UnsupportedVersion {
                box_type: "iinf",
                version,
            })
        }
    };

    let mut iter = src.box_iter();
    for _ in 0..entry_count {
        let mut b = iter.next_box()?.ok_or(Error::TruncatedIinf)?;
        if b.head.name != BoxType::ItemInfoEntry {
            return Err(Error::InvalidData(
                "iinf box should contain only infe boxes",
            ));
        }
        read_infe(&mut b, meta)?;
        check_parser_state!(b);
    }

    skip_box_remain(src)
}

/// Parse an Item Info Entry.
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe(src: &mut BMFFBox<'_>, meta: &mut MetaSummary) -> Result<()> {
    // According to the standard, it seems the flags field should be 0, but
    // at least one sample AVIF image has a nonzero value.
    let (version, _flags) = read_fullbox_extra(src)?;

    let item_id = match version {
        0..=2 => be_u16(src)?.into(),
        3 => be_u32(src)?,
        version => {
            warn!("skipping infe with unknown version {version}");
            meta.warnings += 1;
            return skip_box_remain(src);
        }
    };

    let _item_protection_index = be_u16(src)?;

    // Only versions 2 and 3 carry an item_type.
    let item_type = if version >= 2 {
        let item_type = be_u32(src)?;
        debug!(
            "infe item_id {} item_type: {}",
            item_id,
            FourCC::from(item_type)
        );
        Some(item_type)
    } else {
        None
    };

    let entry = meta.item_entry(item_id)?;
    if let Some(item_type) = item_type {
        entry.item_type = Some(item_type.into());
    }

    // item_name and the fields after it are not of interest to us.
    skip_box_remain(src)
}

/// Parse an Item Location Box into per-item extent lists.
///
/// All multi-byte field widths are nibble-encoded byte counts in 0..=8; a
/// width of zero reads as the value zero.
/// See ISO 14496-12:2015 § 8.11.3
fn read_iloc(src: &mut BMFFBox<'_>, meta: &mut MetaSummary) -> Result<()> {
    let (version, _flags) = read_fullbox_extra(src)?;
    match version {
        0..=2 => (),
        version => {
            return Err(Error::UnsupportedVersion {
                box_type: "iloc",
                version,
            })
        }
    }

    let mut iloc = BitReader::new(src.take_remaining());

    let offset_size = iloc.read_u8(4)?;
    let length_size = iloc.read_u8(4)?;
    let base_offset_size = iloc.read_u8(4)?;
    let index_size = match version {
        1 | 2 => iloc.read_u8(4)?,
        _ => {
            let _reserved = iloc.read_u8(4)?;
            0
        }
    };
    for width in [offset_size, length_size, base_offset_size, index_size] {
        if width > 8 {
            return Err(Error::InvalidData("iloc field widths are at most 8 bytes"));
        }
    }

    let item_count = match version {
        2 => iloc.read_u32(32)?,
        _ => iloc.read_u32(16)?,
    };

    for _ in 0..item_count {
        let item_id = match version {
            2 => iloc.read_u32(32)?,
            _ => iloc.read_u32(16)?,
        };

        // Version 0 has no construction_method field; such items use file
        // offsets, like method 0.
        let construction_method = match version {
            0 => 0,
            _ => {
                let _reserved = iloc.read_u16(12)?;
                iloc.read_u8(4)?
            }
        };

        let data_reference_index = iloc.read_u16(16)?;
        let base_offset = iloc.read_u64(base_offset_size * 8)?;
        let extent_count = iloc.read_u16(16)?;

        let mut extents = TryVec::with_capacity(extent_count.to_usize())?;
        for _ in 0..extent_count {
            let index = match index_size {
                0 => None,
                n => Some(iloc.read_u64(n * 8)?),
            };

            // Per ISO 14496-12:2015 § 8.11.3.1:
            // "If the offset is not identified (the field has a length of zero), then the
            //  beginning of the source (offset 0) is implied"
            // This behavior will follow from BitReader::read_u64(0) -> 0.
            let extent_offset = iloc.read_u64(offset_size * 8)?;
            let extent_length = iloc.read_u64(length_size * 8)?;

            let offset = base_offset
                .checked_add(extent_offset)
                .ok_or(Error::InvalidData("offset calculation overflow"))?;

            extents.push(Extent {
                offset,
                length: extent_length,
                index,
            })?;
        }

        let entry = meta.item_entry(item_id)?;
        entry.location = Some(ItemLocation {
            construction_method,
            data_reference_index,
            base_offset,
            extents,
        });
    }

    if iloc.remaining() != 0 {
        return Err(Error::InvalidData("invalid iloc size"));
    }
    Ok(())
}

/// Parse an Item Properties Box: an `ipco` property container plus `ipma`
/// association maps.
/// See ISO 23008-12:2017 § 9.3
fn read_iprp(src: &mut BMFFBox<'_>, meta: &mut MetaSummary) -> Result<()> {
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::ItemPropertyContainerBox => read_ipco(&mut b, meta)?,
            BoxType::ItemPropertyAssociationBox => read_ipma(&mut b, meta)?,
            _ => skip_box_content(&mut b)?,
        }
        check_parser_state!(b);
    }
    Ok(())
}

/// Parse an Item Property Container into the property table.
fn read_ipco(src: &mut BMFFBox<'_>, meta: &mut MetaSummary) -> Result<()> {
    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        // Every child occupies a slot so 1-based ipma indices stay aligned.
        let detail = match b.head.name {
            BoxType::ImageSpatialExtentsProperty => read_ispe(&mut b)?,
            BoxType::PixelInformationBox => read_pixi(&mut b, &mut meta.warnings)?,
            BoxType::AV1CodecConfigurationBox => read_av1c(&mut b)?,
            _ => {
                skip_box_remain(&mut b)?;
                PropertyDetail::Unknown
            }
        };

        meta.properties.push(Property {
            name: b.head.name.into(),
            offset: b.head.offset,
            size: b.head.size,
            detail,
        })?;

        check_parser_state!(b);
    }
    Ok(())
}

/// Parse an Image Spatial Extents property.
fn read_ispe(src: &mut BMFFBox<'_>) -> Result<PropertyDetail> {
    let (version, _flags) = read_fullbox_extra(src)?;
    if version != 0 {
        skip_box_remain(src)?;
        return Ok(PropertyDetail::Unavailable);
    }

    let width = be_u32(src)?;
    let height = be_u32(src)?;

    Ok(PropertyDetail::ImageSpatialExtents { width, height })
}

/// Parse a Pixel Information property.
fn read_pixi(src: &mut BMFFBox<'_>, warnings: &mut u32) -> Result<PropertyDetail> {
    let (version, _flags) = read_fullbox_extra(src)?;
    if version != 0 {
        skip_box_remain(src)?;
        return Ok(PropertyDetail::Unavailable);
    }

    let num_channels = src.read_u8()?;
    let mut depths = ArrayVec::new();
    let mut truncated = false;
    for _ in 0..num_channels {
        let depth = src.read_u8()?;
        if depths.try_push(depth).is_err() {
            truncated = true;
        }
    }
    if truncated {
        warn!(
            "pixi lists more than {} channels, extra depths dropped",
            depths.capacity()
        );
        *warnings += 1;
    }

    Ok(PropertyDetail::PixelInformation {
        num_channels,
        depths,
        truncated,
    })
}

/// Decode the four fixed bytes of an AV1CodecConfigurationBox.
///
/// Any config OBUs after the fixed bytes are left in place; the OBU scanner
/// can be pointed at them separately.
fn read_av1c(src: &mut BMFFBox<'_>) -> Result<PropertyDetail> {
    let mut fixed = [0u8; 4];
    src.read_exact(&mut fixed)?;
    let mut c = BitReader::new(&fixed);

    let _marker = c.read_bool()?;
    let _version = c.read_u8(7)?;
    let profile = c.read_u8(3)?;
    let level = c.read_u8(5)?;
    let tier = c.read_u8(1)?;
    let high_bitdepth = c.read_bool()?;
    let twelve_bit = c.read_bool()?;
    let monochrome = c.read_bool()?;
    let chroma_subsampling_x = c.read_u8(1)?;
    let chroma_subsampling_y = c.read_u8(1)?;
    let chroma_sample_position = c.read_u8(2)?;
    let _reserved = c.read_u8(3)?;
    let initial_presentation_delay_present = c.read_bool()?;
    let initial_presentation_delay_minus_one = if initial_presentation_delay_present {
        c.read_u8(4)?
    } else {
        let _reserved = c.read_u8(4)?;
        0
    };

    skip_box_remain(src)?;

    Ok(PropertyDetail::Av1Config(AV1ConfigBox {
        profile,
        level,
        tier,
        high_bitdepth,
        twelve_bit,
        monochrome,
        chroma_subsampling_x,
        chroma_subsampling_y,
        chroma_sample_position,
        initial_presentation_delay_present,
        initial_presentation_delay_minus_one,
    }))
}

/// Parse an Item Property Association box into the item table.
fn read_ipma(src: &mut BMFFBox<'_>, meta: &mut MetaSummary) -> Result<()> {
    let (version, flags) = read_fullbox_extra(src)?;
    match version {
        0 | 1 => (),
        version => {
            return Err(Error::UnsupportedVersion {
                box_type: "ipma",
                version,
            })
        }
    }

    let entry_count = be_u32(src)?;
    for _ in 0..entry_count {
        let item_id = if version == 0 {
            be_u16(src)?.into()
        } else {
            be_u32(src)?
        };
        let association_count = src.read_u8()?;
        let mut associations = TryVec::with_capacity(association_count.to_usize())?;
        for _ in 0..association_count {
            // Flags bit 0 selects 15-bit property indices over 7-bit.
            let (essential, property_index) = if flags & 1 != 0 {
                let value = be_u16(src)?;
                (value & 0x8000 != 0, value & 0x7fff)
            } else {
                let value = src.read_u8()?;
                (value & 0x80 != 0, u16::from(value & 0x7f))
            };
            associations.push(PropertyAssociation {
                property_index,
                essential,
            })?;
        }

        let entry = meta.item_entry(item_id)?;
        entry.associations.append(&mut associations)?;
    }
    Ok(())
}

fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}
