//! Character Devices - device numbers, classes, cdev bindings and nodes
//!
//! This module models the pieces of a character-device subsystem that a
//! driver touches while it loads:
//!
//! 1. A region of device numbers (dynamic major, caller-chosen minors)
//! 2. A device class the node is grouped under
//! 3. A cdev binding that routes the numbers to a [`FileOperations`] table
//! 4. A named device node user space opens
//!
//! User space reaches a driver only through a node: [`ChrdevTable::lookup`]
//! resolves the node name to its number, then to the bound operations.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::{CapabilityError, Result};

/// Bits reserved for the minor number
pub const MINORBITS: u32 = 20;

/// Largest minor number
pub const MINORMASK: u32 = (1 << MINORBITS) - 1;

/// Majors handed out dynamically, each range searched from the top down
const DYNAMIC_MAJORS: [RangeInclusive<u32>; 2] = [234..=254, 384..=511];

/// Device number (major:minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevNum {
    major: u32,
    minor: u32,
}

impl DevNum {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn major(self) -> u32 {
        self.major
    }

    pub fn minor(self) -> u32 {
        self.minor
    }

    /// Packed representation (`MKDEV`)
    pub fn raw(self) -> u32 {
        (self.major << MINORBITS) | (self.minor & MINORMASK)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: raw >> MINORBITS,
            minor: raw & MINORMASK,
        }
    }

    /// Whether `other` falls inside `count` numbers starting at `self`
    fn covers(self, count: u32, other: DevNum) -> bool {
        self.major == other.major
            && other.minor >= self.minor
            && other.minor - self.minor < count
    }
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Allocated device number region
#[derive(Debug)]
pub struct ChrdevRegion {
    first: DevNum,
    count: u32,
    name: String,
}

impl ChrdevRegion {
    /// First device number of the region
    pub fn first(&self) -> DevNum {
        self.first
    }

    pub fn major(&self) -> u32 {
        self.first.major
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Device class handle
#[derive(Debug)]
pub struct ClassHandle {
    id: u64,
    name: String,
}

impl ClassHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// cdev binding handle
#[derive(Debug)]
pub struct CdevHandle {
    dev: DevNum,
    count: u32,
}

impl CdevHandle {
    pub fn dev(&self) -> DevNum {
        self.dev
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Device node handle
#[derive(Debug)]
pub struct NodeHandle {
    name: String,
    dev: DevNum,
}

impl NodeHandle {
    /// Node name (the `/dev` entry)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dev(&self) -> DevNum {
        self.dev
    }
}

/// Per-open context passed to every file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileContext {
    dev: DevNum,
    session: u64,
}

impl FileContext {
    pub(crate) fn new(dev: DevNum, session: u64) -> Self {
        Self { dev, session }
    }

    /// Device number the file was opened through
    pub fn dev(&self) -> DevNum {
        self.dev
    }

    /// Identifier unique to this open
    pub fn session(&self) -> u64 {
        self.session
    }
}

/// Destination of a read: user memory that may refuse the copy
pub trait UserBuffer {
    /// Bytes the buffer can still accept
    fn capacity(&self) -> usize;

    /// Copy `src` into the buffer (`copy_to_user`)
    ///
    /// # Errors
    /// Returns `BadAddress` if the buffer cannot take the bytes. Nothing is
    /// written in that case.
    fn write_bytes(&mut self, src: &[u8]) -> Result<()>;
}

/// [`UserBuffer`] over a plain byte slice
#[derive(Debug)]
pub struct UserSliceWriter<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl<'a> UserSliceWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, written: 0 }
    }

    /// Bytes written so far
    pub fn written(&self) -> usize {
        self.written
    }
}

impl UserBuffer for UserSliceWriter<'_> {
    fn capacity(&self) -> usize {
        self.buf.len() - self.written
    }

    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.capacity() {
            return Err(CapabilityError::BadAddress);
        }
        let end = self.written + src.len();
        self.buf[self.written..end].copy_from_slice(src);
        self.written = end;
        Ok(())
    }
}

/// File operations a driver binds to its device numbers
///
/// Called from process context; implementations may block.
pub trait FileOperations: Send + Sync {
    fn open(&self, ctx: &FileContext) -> Result<()>;

    fn release(&self, ctx: &FileContext);

    /// Read into `buf` starting at `*offset`, advancing `*offset` by the
    /// number of bytes delivered
    ///
    /// Returns 0 at end of file.
    fn read(&self, ctx: &FileContext, buf: &mut dyn UserBuffer, offset: &mut u64) -> Result<usize>;
}

/// An open device file
///
/// The file position lives here, not in the driver. Dropping the file
/// releases it.
pub struct OpenFile {
    fops: Arc<dyn FileOperations>,
    ctx: FileContext,
    pos: u64,
}

impl OpenFile {
    pub(crate) fn new(fops: Arc<dyn FileOperations>, ctx: FileContext) -> Self {
        Self { fops, ctx, pos: 0 }
    }

    pub fn context(&self) -> FileContext {
        self.ctx
    }

    /// Current file position
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read at the file position, advancing it
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut writer = UserSliceWriter::new(buf);
        self.read_into(&mut writer)
    }

    /// Read into an arbitrary user buffer, advancing the file position
    pub fn read_into(&mut self, buf: &mut dyn UserBuffer) -> Result<usize> {
        self.fops.read(&self.ctx, buf, &mut self.pos)
    }

    /// Positional read; the file position is left alone (`pread`)
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut offset = offset;
        let mut writer = UserSliceWriter::new(buf);
        self.fops.read(&self.ctx, &mut writer, &mut offset)
    }

    /// Read in `chunk`-sized pieces until end of file
    pub fn read_to_end(&mut self, chunk: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk.max(1)];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("ctx", &self.ctx)
            .field("pos", &self.pos)
            .finish()
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.fops.release(&self.ctx);
    }
}

struct RegionEntry {
    first: DevNum,
    count: u32,
    name: String,
}

struct CdevEntry {
    dev: DevNum,
    count: u32,
    fops: Arc<dyn FileOperations>,
}

struct NodeEntry {
    class: u64,
    dev: DevNum,
}

/// Registry of regions, classes, cdevs and nodes
#[derive(Default)]
pub(crate) struct ChrdevTable {
    regions: Vec<RegionEntry>,
    classes: BTreeMap<u64, String>,
    next_class: u64,
    cdevs: Vec<CdevEntry>,
    nodes: BTreeMap<String, NodeEntry>,
}

impl ChrdevTable {
    /// Allocate `count` minors starting at `first_minor` under a free dynamic major
    pub(crate) fn alloc_region(&mut self, first_minor: u32, count: u32, name: &str) -> Result<ChrdevRegion> {
        if count == 0 {
            return Err(CapabilityError::InvalidRange { reason: "empty region" });
        }
        if first_minor > MINORMASK || count - 1 > MINORMASK - first_minor {
            return Err(CapabilityError::InvalidRange {
                reason: "minor range exceeds MINORMASK",
            });
        }

        let major = DYNAMIC_MAJORS
            .iter()
            .flat_map(|range| range.clone().rev())
            .find(|major| !self.regions.iter().any(|r| r.first.major == *major))
            .ok_or(CapabilityError::OutOfMajors)?;

        let first = DevNum::new(major, first_minor);
        self.regions.push(RegionEntry {
            first,
            count,
            name: name.to_string(),
        });

        Ok(ChrdevRegion {
            first,
            count,
            name: name.to_string(),
        })
    }

    pub(crate) fn unregister_region(&mut self, region: ChrdevRegion) {
        match self
            .regions
            .iter()
            .position(|r| r.first == region.first && r.count == region.count)
        {
            Some(index) => {
                self.regions.remove(index);
            }
            None => log::warn!("unregister of unknown chrdev region {} ({})", region.first, region.name),
        }
    }

    pub(crate) fn class_create(&mut self, name: &str) -> Result<ClassHandle> {
        if self.classes.values().any(|existing| existing == name) {
            return Err(CapabilityError::ClassExists { name: name.to_string() });
        }

        let id = self.next_class;
        self.next_class += 1;
        self.classes.insert(id, name.to_string());

        Ok(ClassHandle {
            id,
            name: name.to_string(),
        })
    }

    pub(crate) fn class_destroy(&mut self, class: ClassHandle) {
        let orphans = self.nodes.values().filter(|n| n.class == class.id).count();
        if orphans > 0 {
            log::warn!("class {} destroyed with {} node(s) still present", class.name, orphans);
        }
        self.classes.remove(&class.id);
    }

    pub(crate) fn cdev_add(&mut self, dev: DevNum, count: u32, fops: Arc<dyn FileOperations>) -> Result<CdevHandle> {
        if count == 0 {
            return Err(CapabilityError::InvalidRange { reason: "empty cdev range" });
        }

        let overlaps = self.cdevs.iter().any(|c| {
            c.dev.major == dev.major
                && c.dev.minor < dev.minor.saturating_add(count)
                && dev.minor < c.dev.minor.saturating_add(c.count)
        });
        if overlaps {
            return Err(CapabilityError::DevNumBusy { dev });
        }

        self.cdevs.push(CdevEntry { dev, count, fops });
        Ok(CdevHandle { dev, count })
    }

    pub(crate) fn cdev_del(&mut self, cdev: CdevHandle) {
        match self.cdevs.iter().position(|c| c.dev == cdev.dev && c.count == cdev.count) {
            Some(index) => {
                self.cdevs.remove(index);
            }
            None => log::warn!("cdev_del of unbound {}", cdev.dev),
        }
    }

    pub(crate) fn device_create(&mut self, class: &ClassHandle, dev: DevNum, name: &str) -> Result<NodeHandle> {
        if !self.classes.contains_key(&class.id) {
            return Err(CapabilityError::UnknownClass {
                name: class.name.clone(),
            });
        }
        if self.nodes.contains_key(name) {
            return Err(CapabilityError::NodeExists { name: name.to_string() });
        }

        self.nodes.insert(name.to_string(), NodeEntry { class: class.id, dev });
        Ok(NodeHandle {
            name: name.to_string(),
            dev,
        })
    }

    pub(crate) fn device_destroy(&mut self, node: NodeHandle) {
        if self.nodes.remove(&node.name).is_none() {
            log::warn!("device_destroy of unknown node {}", node.name);
        }
    }

    /// Resolve a node name to its device number and bound operations
    pub(crate) fn lookup(&self, name: &str) -> Result<(DevNum, Arc<dyn FileOperations>)> {
        let no_device = || CapabilityError::NoDevice { name: name.to_string() };

        let node = self.nodes.get(name).ok_or_else(no_device)?;
        let cdev = self
            .cdevs
            .iter()
            .find(|c| c.dev.covers(c.count, node.dev))
            .ok_or_else(no_device)?;

        Ok((node.dev, Arc::clone(&cdev.fops)))
    }

    /// Allocated majors and their owners
    pub(crate) fn devices(&self) -> Vec<(u32, String)> {
        let mut devices: Vec<_> = self
            .regions
            .iter()
            .map(|r| (r.first.major, r.name.clone()))
            .collect();
        devices.sort();
        devices
    }
}
