//! Region manager
//!
//! A region is a named, persistently backed byte range that is mapped at
//! the same virtual address on every open, because the structures inside
//! it hold absolute pointers. The mapping addresses live in a side "map
//! file" next to the data file, one `0x<hex_address> <decimal_size>` line
//! per segment; index 0 is the primary segment. Growing a region appends
//! a segment line rather than moving anything.

use crate::error::Error;
use crate::result::Result;
use crate::utils::round_up;
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Region segments are carved in 2 MiB grains; smaller grains sometimes
/// produce a disagreement between the server and peer mappings.
pub const REGION_GRAIN: usize = 2 * 1024 * 1024;

/// How the bytes survive (or don't)
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PersistenceKind {
    /// A file on a DAX filesystem
    FsDax,
    /// A character device such as `/dev/dax0.0`
    DevDax,
    /// Anonymous memory; contents do not survive the process
    Dram,
}

/// One mapped piece of a region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: usize,
}

/// An open region: all segments are mapped read-write at their recorded
/// addresses until [`RegionManager::close`] unmaps them.
#[derive(Debug)]
pub struct Region {
    id: u64,
    name: String,
    kind: PersistenceKind,
    numa_node: u32,
    segments: Vec<Segment>,
    file: Option<File>,
    anon: Option<memmap::MmapMut>,
}

impl Region {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PersistenceKind {
        self.kind
    }

    pub fn numa_node(&self) -> u32 {
        self.numa_node
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The primary segment, holding the pool header
    pub fn base(&self) -> u64 {
        self.segments[0].addr
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// True if `[addr, addr+len)` lies inside one mapped segment
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        self.segments
            .iter()
            .any(|s| addr >= s.addr && addr + len as u64 <= s.addr + s.len as u64)
    }
}

fn region_id(name: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    name.hash(&mut h);
    h.finish()
}

/// Process-wide free-address allocator
///
/// Fixed-address mappings need ranges nothing else in the process will
/// claim. One window is reserved for the whole process; regions take
/// 2 MiB-aligned pieces of it and return them on close/erase.
struct AddressAllocator {
    free: Vec<(u64, usize)>,
}

const ADDRESS_WINDOW_BASE: u64 = 0x6000_0000_0000;
const ADDRESS_WINDOW_LEN: usize = 0x0800_0000_0000; // 8 TiB of address space

impl AddressAllocator {
    fn new() -> Self {
        Self {
            free: vec![(ADDRESS_WINDOW_BASE, ADDRESS_WINDOW_LEN)],
        }
    }

    fn locate_free_range(&mut self, len: usize) -> Result<u64> {
        let len = round_up(len, REGION_GRAIN);
        // self-align power-of-two requests so a region can be carved as
        // one block by a buddy-style heap
        let align = if len.is_power_of_two() {
            len as u64
        } else {
            REGION_GRAIN as u64
        };
        for i in 0..self.free.len() {
            let (base, flen) = self.free[i];
            let aligned = round_up(base as usize, align as usize) as u64;
            let pad = (aligned - base) as usize;
            if flen >= pad + len {
                self.free.remove(i);
                if pad > 0 {
                    self.free.push((base, pad));
                }
                let tail = flen - pad - len;
                if tail > 0 {
                    self.free.push((aligned + len as u64, tail));
                }
                self.free.sort_unstable();
                return Ok(aligned);
            }
        }
        Err(Error::NoSpace)
    }

    /// Reclaims a range, coalescing with adjacent free ranges
    fn release(&mut self, base: u64, len: usize) {
        if base < ADDRESS_WINDOW_BASE || base >= ADDRESS_WINDOW_BASE + ADDRESS_WINDOW_LEN as u64 {
            return;
        }
        let len = round_up(len, REGION_GRAIN);
        self.free.push((base, len));
        self.free.sort_unstable();
        let mut merged: Vec<(u64, usize)> = Vec::with_capacity(self.free.len());
        for &(b, l) in self.free.iter() {
            if let Some(last) = merged.last_mut() {
                if last.0 + last.1 as u64 == b {
                    last.1 += l;
                    continue;
                }
            }
            merged.push((b, l));
        }
        self.free = merged;
    }

    /// Claims a specific range recorded in a map file, so later creates
    /// cannot hand it out again. Fails if any part is already claimed.
    fn claim(&mut self, base: u64, len: usize) -> Result<()> {
        let len = round_up(len, REGION_GRAIN);
        let end = base + len as u64;
        for i in 0..self.free.len() {
            let (fb, fl) = self.free[i];
            let fe = fb + fl as u64;
            if fb <= base && end <= fe {
                self.free.remove(i);
                if fb < base {
                    self.free.push((fb, (base - fb) as usize));
                }
                if end < fe {
                    self.free.push((end, (fe - end) as usize));
                }
                self.free.sort_unstable();
                return Ok(());
            }
        }
        // Outside the window entirely is fine (legacy map file); overlap
        // with a claimed range is a conflict.
        if end <= ADDRESS_WINDOW_BASE || base >= ADDRESS_WINDOW_BASE + ADDRESS_WINDOW_LEN as u64 {
            Ok(())
        } else {
            Err(Error::AddressConflict)
        }
    }
}

lazy_static! {
    static ref ADDRESS_ALLOCATOR: Mutex<AddressAllocator> = Mutex::new(AddressAllocator::new());
    static ref OPEN_REGIONS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Creates, opens, grows, and erases named regions under one directory.
#[derive(Clone)]
pub struct RegionManager {
    dir: PathBuf,
}

impl RegionManager {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path_data(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn path_map(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.map", name))
    }

    /// Creates a region of `size` bytes (rounded up to the 2 MiB grain),
    /// maps it at a fresh fixed address, and records the mapping in the
    /// side map file. Any failure after the data file exists unlinks both
    /// files again.
    pub fn create(&self, name: &str, size: usize, numa_node: u32) -> Result<Region> {
        if size == 0 {
            return Err(Error::Invalid("zero-size region".into()));
        }
        let size = round_up(size, REGION_GRAIN);
        let path_data = self.path_data(name);
        let path_map = self.path_map(name);
        if path_data.exists() {
            return Err(Error::AlreadyExists);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path_data)?;

        let res = (|| -> Result<Region> {
            crate::error::retry_transient(|| file.set_len(size as u64))?;

            let base = ADDRESS_ALLOCATOR.lock().unwrap().locate_free_range(size)?;
            if let Err(e) = map_fixed(&file, base, size, 0) {
                ADDRESS_ALLOCATOR.lock().unwrap().release(base, size);
                return Err(e);
            }

            let mut f = File::create(&path_map)?;
            writeln!(f, "{:#x} {}", base, size)?;
            f.sync_all()?;

            crate::log!(Green, "CREATE", "region {} at {:#x} ({} bytes)", name, base, size);
            OPEN_REGIONS.lock().unwrap().insert(name.to_string());
            Ok(Region {
                id: region_id(name),
                name: name.to_string(),
                kind: PersistenceKind::FsDax,
                numa_node,
                segments: vec![Segment { addr: base, len: size }],
                file: Some(file.try_clone()?),
                anon: None,
            })
        })();

        if res.is_err() {
            let _ = std::fs::remove_file(&path_data);
            let _ = std::fs::remove_file(&path_map);
        }
        res
    }

    /// An emulated-DRAM region: anonymous memory, create-only, gone with
    /// the process. Useful for exercising allocator logic without media.
    pub fn create_dram(&self, name: &str, size: usize, numa_node: u32) -> Result<Region> {
        let size = round_up(size, REGION_GRAIN);
        let anon = memmap::MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|e| Error::Transient(e.to_string()))?;
        let base = anon.as_ptr() as u64;
        Ok(Region {
            id: region_id(name),
            name: name.to_string(),
            kind: PersistenceKind::Dram,
            numa_node,
            segments: vec![Segment { addr: base, len: size }],
            file: None,
            anon: Some(anon),
        })
    }

    /// Opens an existing region, mapping every segment at its recorded
    /// address. A mapping that cannot land on its address fails the open
    /// with `AddressConflict`; segments already mapped are unwound.
    pub fn open(&self, name: &str) -> Result<Region> {
        let path_data = self.path_data(name);
        let path_map = self.path_map(name);
        if !path_data.exists() || !path_map.exists() {
            return Err(Error::RegionNotFound);
        }

        let segments = read_map_file(&path_map)?;
        if segments.is_empty() {
            return Err(Error::SizeMismatch);
        }
        let covered: usize = segments.iter().map(|s| s.len).sum();

        let file = OpenOptions::new().read(true).write(true).open(&path_data)?;
        let file_len = file.metadata()?.len();
        if file_len != covered as u64 {
            return Err(Error::SizeMismatch);
        }

        let kind = if file.metadata()?.file_type().is_file() {
            PersistenceKind::FsDax
        } else {
            PersistenceKind::DevDax
        };

        {
            let mut aa = ADDRESS_ALLOCATOR.lock().unwrap();
            let mut claimed: Vec<Segment> = Vec::new();
            for s in &segments {
                if let Err(e) = aa.claim(s.addr, s.len) {
                    for c in &claimed {
                        aa.release(c.addr, c.len);
                    }
                    return Err(e);
                }
                claimed.push(*s);
            }
        }

        let mut mapped: Vec<Segment> = Vec::with_capacity(segments.len());
        let mut offset = 0u64;
        for s in &segments {
            match map_fixed(&file, s.addr, s.len, offset) {
                Ok(()) => {
                    mapped.push(*s);
                    offset += s.len as u64;
                }
                Err(e) => {
                    // Unwind everything mapped so far; the side file is
                    // untouched and the addresses go back to the window.
                    let mut aa = ADDRESS_ALLOCATOR.lock().unwrap();
                    for m in &mapped {
                        unmap(m.addr, m.len);
                    }
                    for s in &segments {
                        aa.release(s.addr, s.len);
                    }
                    return Err(e);
                }
            }
        }

        crate::log!(Green, "OPEN", "region {} ({} segments)", name, mapped.len());
        OPEN_REGIONS.lock().unwrap().insert(name.to_string());
        Ok(Region {
            id: region_id(name),
            name: name.to_string(),
            kind,
            numa_node: 0,
            segments: mapped,
            file: Some(file),
            anon: None,
        })
    }

    /// Grows (or advisorily shrinks) a region.
    ///
    /// Growing extends the backing file first, then appends the new
    /// segment to the map file, then maps it; a crash in between leaves a
    /// region that still opens at its old size. Shrinking unmaps trailing
    /// segments, rewrites the map file, and truncates.
    pub fn resize(&self, region: &mut Region, new_size: usize) -> Result<()> {
        if region.kind == PersistenceKind::Dram {
            return Err(Error::Invalid("cannot resize an emulated region".into()));
        }
        let new_size = round_up(new_size, REGION_GRAIN);
        let cur = region.len();
        let file = region.file.as_ref().ok_or(Error::InvalidHandle)?;
        let path_map = self.path_map(&region.name);

        if new_size > cur {
            let added = new_size - cur;
            crate::error::retry_transient(|| file.set_len(new_size as u64))?;
            let base = ADDRESS_ALLOCATOR.lock().unwrap().locate_free_range(added)?;
            if let Err(e) = map_fixed(file, base, added, cur as u64) {
                ADDRESS_ALLOCATOR.lock().unwrap().release(base, added);
                return Err(e);
            }
            let mut f = OpenOptions::new().append(true).open(&path_map)?;
            writeln!(f, "{:#x} {}", base, added)?;
            f.sync_all()?;
            region.segments.push(Segment { addr: base, len: added });
        } else if new_size < cur {
            let mut to_remove = cur - new_size;
            while to_remove != 0 {
                let last = *region.segments.last().unwrap();
                if region.segments.len() == 1 || last.len > to_remove {
                    // Never drop the primary segment, and partial-segment
                    // shrink is advisory: stop here.
                    break;
                }
                unmap(last.addr, last.len);
                ADDRESS_ALLOCATOR.lock().unwrap().release(last.addr, last.len);
                region.segments.pop();
                to_remove -= last.len;
            }
            let retained: usize = region.len();
            let mut f = File::create(&path_map)?;
            for s in &region.segments {
                writeln!(f, "{:#x} {}", s.addr, s.len)?;
            }
            f.sync_all()?;
            crate::error::retry_transient(|| file.set_len(retained as u64))?;
        }
        Ok(())
    }

    /// Unmaps all segments and releases their address ranges.
    pub fn close(&self, region: &mut Region) {
        if region.anon.take().is_some() {
            region.segments.clear();
            return;
        }
        let mut aa = ADDRESS_ALLOCATOR.lock().unwrap();
        for s in &region.segments {
            unmap(s.addr, s.len);
            aa.release(s.addr, s.len);
        }
        region.segments.clear();
        region.file = None;
        OPEN_REGIONS.lock().unwrap().remove(&region.name);
    }

    /// Deletes the backing file and the map file. Fails with `InUse`
    /// while the region is open in this process.
    pub fn erase(&self, name: &str) -> Result<()> {
        if OPEN_REGIONS.lock().unwrap().contains(name) {
            return Err(Error::InUse);
        }
        let path_data = self.path_data(name);
        if !path_data.exists() {
            return Err(Error::RegionNotFound);
        }
        std::fs::remove_file(&path_data)?;
        let _ = std::fs::remove_file(self.path_map(name));
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_data(name).exists()
    }
}

fn read_map_file(path: &Path) -> Result<Vec<Segment>> {
    let f = File::open(path)?;
    let mut out = Vec::new();
    for line in BufReader::new(f).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut it = line.split_whitespace();
        let addr = it
            .next()
            .and_then(|s| s.strip_prefix("0x"))
            .and_then(|s| u64::from_str_radix(s, 16).ok());
        let len = it.next().and_then(|s| s.parse::<usize>().ok());
        match (addr, len) {
            (Some(a), Some(l)) => out.push(Segment { addr: a, len: l }),
            _ => return Err(Error::SizeMismatch),
        }
    }
    Ok(out)
}

fn map_fixed(file: &File, addr: u64, len: usize, offset: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    unsafe {
        let p = libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
            file.as_raw_fd(),
            offset as libc::off_t,
        );
        if p == libc::MAP_FAILED {
            return Err(Error::AddressConflict);
        }
        if p as u64 != addr {
            // Older kernels treat MAP_FIXED_NOREPLACE as a hint; never
            // accept a mapping anywhere but the recorded address.
            libc::munmap(p, len);
            return Err(Error::AddressConflict);
        }
        libc::madvise(p, len, libc::MADV_DONTFORK);
    }
    Ok(())
}

fn unmap(addr: u64, len: usize) {
    unsafe {
        libc::munmap(addr as *mut libc::c_void, len);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tmpdir(tag: &str) -> PathBuf {
        let d = std::env::temp_dir().join(format!("pmstore-region-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&d);
        d
    }

    #[test]
    fn create_open_roundtrip_same_address() {
        let rm = RegionManager::new(tmpdir("roundtrip")).unwrap();
        let mut r = rm.create("r0", REGION_GRAIN, 0).unwrap();
        let base = r.base();
        unsafe {
            *(base as *mut u64) = 0xfeed_beef;
        }
        rm.close(&mut r);
        let mut r = rm.open("r0").unwrap();
        assert_eq!(r.base(), base);
        assert_eq!(unsafe { *(base as *const u64) }, 0xfeed_beef);
        rm.close(&mut r);
        rm.erase("r0").unwrap();
    }

    #[test]
    fn open_missing_region_fails() {
        let rm = RegionManager::new(tmpdir("missing")).unwrap();
        assert_eq!(rm.open("nope").unwrap_err(), Error::RegionNotFound);
    }

    #[test]
    fn size_mismatch_is_detected() {
        let rm = RegionManager::new(tmpdir("mismatch")).unwrap();
        let mut r = rm.create("r1", REGION_GRAIN, 0).unwrap();
        rm.close(&mut r);
        // Grow the data file behind the map file's back
        let f = OpenOptions::new()
            .write(true)
            .open(rm.path_data("r1"))
            .unwrap();
        f.set_len(2 * REGION_GRAIN as u64).unwrap();
        assert_eq!(rm.open("r1").unwrap_err(), Error::SizeMismatch);
        rm.erase("r1").unwrap();
    }

    #[test]
    fn grow_appends_segment_and_preserves_base() {
        let rm = RegionManager::new(tmpdir("grow")).unwrap();
        let mut r = rm.create("r2", REGION_GRAIN, 0).unwrap();
        let base = r.base();
        rm.resize(&mut r, 3 * REGION_GRAIN).unwrap();
        assert_eq!(r.base(), base);
        assert_eq!(r.len(), 3 * REGION_GRAIN);
        assert_eq!(r.segments().len(), 2);
        // All of it is writable
        unsafe {
            *(r.segments()[1].addr as *mut u64) = 1;
        }
        rm.close(&mut r);
        let mut r = rm.open("r2").unwrap();
        assert_eq!(r.len(), 3 * REGION_GRAIN);
        rm.close(&mut r);
        rm.erase("r2").unwrap();
    }

    #[test]
    fn erase_while_open_is_in_use() {
        let rm = RegionManager::new(tmpdir("inuse")).unwrap();
        let mut r = rm.create("r3", REGION_GRAIN, 0).unwrap();
        assert_eq!(rm.erase("r3").unwrap_err(), Error::InUse);
        rm.close(&mut r);
        rm.erase("r3").unwrap();
    }

    #[test]
    fn create_existing_fails() {
        let rm = RegionManager::new(tmpdir("exists")).unwrap();
        let mut r = rm.create("r4", REGION_GRAIN, 0).unwrap();
        assert_eq!(
            rm.create("r4", REGION_GRAIN, 0).unwrap_err(),
            Error::AlreadyExists
        );
        rm.close(&mut r);
        rm.erase("r4").unwrap();
    }

    #[test]
    fn address_allocator_reuses_released_ranges() {
        let mut aa = AddressAllocator::new();
        let a = aa.locate_free_range(REGION_GRAIN).unwrap();
        let b = aa.locate_free_range(REGION_GRAIN).unwrap();
        assert_ne!(a, b);
        aa.release(a, REGION_GRAIN);
        aa.release(b, REGION_GRAIN);
        let c = aa.locate_free_range(2 * REGION_GRAIN).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn claim_rejects_overlap() {
        let mut aa = AddressAllocator::new();
        let a = aa.locate_free_range(REGION_GRAIN).unwrap();
        assert_eq!(aa.claim(a, REGION_GRAIN).unwrap_err(), Error::AddressConflict);
    }
}
