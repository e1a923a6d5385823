//! EBML element tree: reading, rendering, size recomputation and the Void
//! reserve-and-replace protocol used to patch headers in place.

pub mod ids;
pub mod vint;

pub use ids::{EbmlId, ElementKind};
pub use vint::ElementSize;

use std::io::SeekFrom;

use crate::error::{Error, Result};
use crate::io::{IoReader, IoWriter};
use crate::span::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum ElementData {
    UInt(u64),
    SInt(i64),
    Float(f64),
    /// Latin-1 string.
    Str(String),
    Utf8(String),
    Binary(Span),
    /// Nanoseconds since 2001-01-01 00:00:00 UTC.
    Date(i64),
    Master(Vec<Element>),
}

/// A tagged tree node. Mutable until rendered; `render` records the element's
/// position so it can later be voided or patched in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub id: EbmlId,
    pub data: ElementData,
    /// Minimum width of the size field, for rewrite-in-place stability.
    size_len: u8,
    position: Option<u64>,
    cached_size: Option<u64>,
}

impl Element {
    fn new(id: EbmlId, data: ElementData) -> Element {
        Element {
            id,
            data,
            size_len: 0,
            position: None,
            cached_size: None,
        }
    }

    pub fn uint(id: EbmlId, value: u64) -> Element {
        Element::new(id, ElementData::UInt(value))
    }

    pub fn sint(id: EbmlId, value: i64) -> Element {
        Element::new(id, ElementData::SInt(value))
    }

    pub fn float(id: EbmlId, value: f64) -> Element {
        Element::new(id, ElementData::Float(value))
    }

    pub fn string(id: EbmlId, value: impl Into<String>) -> Element {
        Element::new(id, ElementData::Str(value.into()))
    }

    pub fn utf8(id: EbmlId, value: impl Into<String>) -> Element {
        Element::new(id, ElementData::Utf8(value.into()))
    }

    pub fn binary(id: EbmlId, value: impl Into<Span>) -> Element {
        Element::new(id, ElementData::Binary(value.into()))
    }

    pub fn date(id: EbmlId, value: i64) -> Element {
        Element::new(id, ElementData::Date(value))
    }

    pub fn master(id: EbmlId, children: Vec<Element>) -> Element {
        Element::new(id, ElementData::Master(children))
    }

    /// A Void reserving `payload` bytes of space (total footprint is
    /// `payload` plus the head).
    pub fn void(payload: u64) -> Element {
        Element::binary(ids::VOID, vec![0u8; payload as usize])
    }

    pub fn with_size_len(mut self, size_len: u8) -> Element {
        self.size_len = size_len;
        self
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn children(&self) -> Option<&[Element]> {
        match &self.data {
            ElementData::Master(children) => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Element>> {
        match &mut self.data {
            ElementData::Master(children) => Some(children),
            _ => None,
        }
    }

    pub fn push(&mut self, child: Element) -> &mut Element {
        let children = self
            .children_mut()
            .expect("push on a non-master element");
        children.push(child);
        children.last_mut().unwrap()
    }

    pub fn find(&self, id: EbmlId) -> Option<&Element> {
        self.children()?.iter().find(|c| c.id == id)
    }

    pub fn as_uint(&self) -> Option<u64> {
        match &self.data {
            ElementData::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_sint(&self) -> Option<i64> {
        match &self.data {
            ElementData::SInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match &self.data {
            ElementData::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            ElementData::Str(v) | ElementData::Utf8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Span> {
        match &self.data {
            ElementData::Binary(v) => Some(v),
            _ => None,
        }
    }

    fn uint_len(value: u64) -> u64 {
        if value == 0 {
            1
        } else {
            (71 - value.leading_zeros() as u64) / 8
        }
    }

    fn sint_len(value: i64) -> u64 {
        for len in 1..8u64 {
            let bits = 8 * len - 1;
            if value >= -(1i64 << bits) && value < (1i64 << bits) {
                return len;
            }
        }
        8
    }

    /// Recursively recomputes each master's size from its children. Must be
    /// called with the same `write_defaults` later passed to [`render`];
    /// sizes are cached so the VINT widths stay stable between the calls.
    pub fn update_size(&mut self, write_defaults: bool) -> u64 {
        let size = match &mut self.data {
            ElementData::UInt(v) => Self::uint_len(*v),
            ElementData::SInt(v) => Self::sint_len(*v),
            ElementData::Float(_) => 8,
            ElementData::Str(s) | ElementData::Utf8(s) => s.len() as u64,
            ElementData::Binary(b) => b.len() as u64,
            ElementData::Date(_) => 8,
            ElementData::Master(children) => children
                .iter_mut()
                .map(|c| {
                    let data = c.update_size(write_defaults);
                    c.head_len() as u64 + data
                })
                .sum(),
        };

        self.cached_size = Some(size);
        size
    }

    pub fn data_size(&self) -> u64 {
        self.cached_size.expect("update_size not called")
    }

    pub fn head_len(&self) -> u8 {
        let size = self.cached_size.unwrap_or(0);
        vint::id_len(self.id.0) + vint::coded_len(size).max(self.size_len.max(1))
    }

    pub fn total_size(&self) -> u64 {
        self.head_len() as u64 + self.data_size()
    }

    /// Emits id + size + payload and records the element position. Returns
    /// the number of bytes written.
    pub fn render(&mut self, io: &mut IoWriter, write_defaults: bool) -> Result<u64> {
        if self.cached_size.is_none() {
            self.update_size(write_defaults);
        }

        self.position = Some(io.tell()?);

        let size = self.data_size();
        vint::write_id(io, self.id.0)?;
        vint::write(io, size, self.size_len.max(1))?;

        match &mut self.data {
            ElementData::UInt(v) => {
                let bytes = v.to_be_bytes();
                io.write_all(&bytes[8 - Self::uint_len(*v) as usize..])?;
            }
            ElementData::SInt(v) => {
                let bytes = v.to_be_bytes();
                io.write_all(&bytes[8 - Self::sint_len(*v) as usize..])?;
            }
            ElementData::Float(v) => io.write_f64_be(*v)?,
            ElementData::Str(s) | ElementData::Utf8(s) => io.write_all(s.as_bytes())?,
            ElementData::Binary(b) => {
                for piece in b.spans() {
                    io.write_all(piece)?;
                }
            }
            ElementData::Date(v) => io.write_all(&v.to_be_bytes())?,
            ElementData::Master(children) => {
                for child in children.iter_mut() {
                    child.render(io, write_defaults)?;
                }
            }
        }

        Ok(self.total_size())
    }

    /// Replaces a rendered Void with `new`, filling leftover space with a
    /// fresh Void. Requires the replacement to fit and the leftover to not be
    /// exactly one byte (a Void needs at least two bytes of head).
    pub fn replace_with(
        &self,
        new: &mut Element,
        io: &mut IoWriter,
        come_back_afterward: bool,
        write_defaults: bool,
    ) -> Result<u64> {
        let position = self.position.ok_or_else(|| {
            crate::internal_error!("replace_with on a Void that was never rendered")
        })?;
        let mine = self.total_size();

        new.update_size(write_defaults);
        let theirs = new.total_size();

        if mine < theirs {
            return Err(crate::internal_error!(
                "element of {theirs} bytes does not fit a {mine}-byte Void"
            ));
        }
        let leftover = mine - theirs;
        if leftover == 1 {
            return Err(crate::internal_error!(
                "replacing would leave a one-byte gap that no Void can fill"
            ));
        }

        let saved = io.tell()?;
        io.seek(SeekFrom::Start(position))?;
        new.render(io, write_defaults)?;

        if leftover >= 2 {
            write_void_head(io, leftover)?;
        }

        if come_back_afterward {
            io.seek(SeekFrom::Start(saved))?;
        }

        Ok(mine)
    }

    /// Replaces a rendered element with a Void of equal total footprint.
    pub fn overwrite_with_void(&self, io: &mut IoWriter, come_back_afterward: bool) -> Result<u64> {
        let position = self.position.ok_or_else(|| {
            crate::internal_error!("overwrite on an element that was never rendered")
        })?;
        let total = self.total_size();
        if total < 2 {
            return Err(crate::internal_error!("element too small to void"));
        }

        let saved = io.tell()?;
        io.seek(SeekFrom::Start(position))?;
        write_void_head(io, total)?;

        if come_back_afterward {
            io.seek(SeekFrom::Start(saved))?;
        }

        Ok(total)
    }
}

/// Writes a Void whose total head+payload footprint is exactly `total`.
/// Picking the payload size changes the size field's own width, so the width
/// is searched until the arithmetic closes.
fn write_void_head(io: &mut IoWriter, total: u64) -> Result<()> {
    debug_assert!(total >= 2);

    let mut size_len = 1u8;
    loop {
        let payload = total - 1 - size_len as u64;
        if vint::coded_len(payload) <= size_len {
            vint::write_id(io, ids::VOID.0)?;
            vint::write(io, payload, size_len)?;
            // The reserved region is already zero-filled; rewrite it anyway
            // so a Void is all zeros no matter what it replaced.
            let mut remaining = payload;
            let zeroes = [0u8; 4096];
            while remaining > 0 {
                let chunk = remaining.min(zeroes.len() as u64);
                io.write_all(&zeroes[..chunk as usize])?;
                remaining -= chunk;
            }
            return Ok(());
        }
        size_len += 1;
        if size_len > 8 {
            return Err(crate::internal_error!("cannot fit a Void into {total} bytes"));
        }
    }
}

/// Header of one element as found in the stream: id, declared size and the
/// position of the id byte. The payload has not been loaded yet.
#[derive(Debug, Clone, Copy)]
pub struct Head {
    pub id: EbmlId,
    pub size: ElementSize,
    pub position: u64,
    pub head_len: u8,
}

impl Head {
    pub fn data_start(&self) -> u64 {
        self.position + self.head_len as u64
    }

    pub fn end(&self) -> Option<u64> {
        match self.size {
            ElementSize::Known(size) => Some(self.data_start() + size),
            ElementSize::Unknown => None,
        }
    }
}

#[derive(Debug)]
pub enum Next {
    /// An allowed child of the parent context; payload not yet read.
    Child(Head),
    /// An element belonging to an ancestor of the parent context. The stream
    /// is positioned after this element's head.
    UpperLevel(Head),
    /// An id unknown to the parent and every ancestor, surfaced because the
    /// caller asked for dummies.
    Dummy(Head),
    /// Clean end of the parent's extent or of the stream.
    End,
}

/// Reads one element head and classifies it against `parent`'s allowed-child
/// table. Unknown ids are skipped (or surfaced as [`Next::Dummy`]).
pub fn find_next_element(
    io: &mut IoReader,
    parent: EbmlId,
    max_end: Option<u64>,
    allow_dummy: bool,
) -> Result<Next> {
    loop {
        let position = io.tell()?;
        if let Some(end) = max_end {
            if position >= end {
                return Ok(Next::End);
            }
        }

        // A clean EOF at an element boundary is the end, not an error.
        let mut first = [0u8; 1];
        if io.read_some(&mut first)? == 0 {
            return Ok(Next::End);
        }
        io.seek(SeekFrom::Current(-1))?;

        let (id_len, id) = vint::read_id(io)?;
        let (size_vint_len, raw_size) = vint::read(io, 8)?;
        let head = Head {
            id: EbmlId(id),
            size: ElementSize::from_vint(size_vint_len, raw_size),
            position,
            head_len: id_len + size_vint_len,
        };

        if ids::context(parent).contains(&head.id)
            || head.id == ids::VOID
            || head.id == ids::CRC32
        {
            return Ok(Next::Child(head));
        }

        // Upper level: the id belongs to an ancestor's context, meaning the
        // parent's extent has ended.
        let mut ancestor = ids::parent(parent);
        while let Some(level) = ancestor {
            if ids::context(level).contains(&head.id) {
                return Ok(Next::UpperLevel(head));
            }
            ancestor = ids::parent(level);
        }

        if allow_dummy {
            return Ok(Next::Dummy(head));
        }

        log::debug!("skipping unknown element {:?} at {}", head.id, position);
        skip_data(io, &head)?;
    }
}

/// Advances the stream past the element's payload.
pub fn skip_data(io: &mut IoReader, head: &Head) -> Result<()> {
    let size = head.size.require()?;
    io.seek(SeekFrom::Start(head.data_start() + size))?;
    Ok(())
}

/// Loads the payload for `head`, recursing into masters until their size is
/// exhausted. Unknown children inside a master are kept as Binary dummies.
pub fn read_element(io: &mut IoReader, head: &Head) -> Result<Element> {
    let kind = ids::kind(head.id).unwrap_or(ElementKind::Binary);
    let size = head.size.require()?;

    let data = match kind {
        ElementKind::UInt => {
            if size > 8 {
                return Err(invalid_size(io, head, size));
            }
            let mut value = 0u64;
            for _ in 0..size {
                value = (value << 8) | io.read_u8()? as u64;
            }
            ElementData::UInt(value)
        }
        ElementKind::SInt | ElementKind::Date => {
            if size > 8 {
                return Err(invalid_size(io, head, size));
            }
            let mut value = 0i64;
            let mut first = true;
            for _ in 0..size {
                let byte = io.read_u8()?;
                if first {
                    value = (byte as i8) as i64;
                    first = false;
                } else {
                    value = (value << 8) | byte as i64;
                }
            }
            if kind == ElementKind::Date {
                ElementData::Date(value)
            } else {
                ElementData::SInt(value)
            }
        }
        ElementKind::Float => {
            let value = match size {
                0 => 0.0,
                4 => f32::from_be_bytes(io.read_vec(4)?.try_into().unwrap()) as f64,
                8 => f64::from_be_bytes(io.read_vec(8)?.try_into().unwrap()),
                _ => return Err(invalid_size(io, head, size)),
            };
            ElementData::Float(value)
        }
        ElementKind::Str | ElementKind::Utf8 => {
            let mut raw = io.read_vec(size as usize)?;
            // Old libebml writers NUL-terminate; never keep that on read.
            while raw.last() == Some(&0) {
                raw.pop();
            }
            let text = String::from_utf8_lossy(&raw).into_owned();
            if kind == ElementKind::Str {
                ElementData::Str(text)
            } else {
                ElementData::Utf8(text)
            }
        }
        ElementKind::Binary => ElementData::Binary(io.read_span(size as usize)?),
        ElementKind::Master => {
            let end = head.end().unwrap();
            let mut children = Vec::new();
            loop {
                match find_next_element(io, head.id, Some(end), true)? {
                    Next::Child(child) | Next::Dummy(child) => {
                        children.push(read_element(io, &child)?);
                    }
                    Next::UpperLevel(upper) => {
                        // A sized master cannot legally contain its ancestor's
                        // children; rewind to the stray head and stop.
                        io.seek(SeekFrom::Start(upper.position))?;
                        break;
                    }
                    Next::End => break,
                }
            }
            ElementData::Master(children)
        }
    };

    let mut element = Element::new(head.id, data);
    element.position = Some(head.position);
    element.cached_size = Some(size);
    Ok(element)
}

fn invalid_size(io: &IoReader, head: &Head, size: u64) -> Error {
    Error::invalid(
        io.name(),
        "EBML",
        head.position,
        format!("implausible size {size} for {:?}", head.id),
    )
}

/// Rewrites a size field in place with a fixed width; used to close an
/// unknown-size Segment once the real extent is known.
pub fn patch_size(io: &mut IoWriter, size_pos: u64, size: u64, width: u8) -> Result<()> {
    let saved = io.tell()?;
    io.seek(SeekFrom::Start(size_pos))?;
    vint::write(io, size, width)?;
    io.seek(SeekFrom::Start(saved))?;
    Ok(())
}
