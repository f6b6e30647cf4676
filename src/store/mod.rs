//! The key-value store surface
//!
//! [`Store`] manages pools by name inside one region directory and
//! exposes the pool API: create/open/close/delete/grow plus the key
//! operations. Every operation returns a status; nothing partially
//! succeeds in a user-visible way.

pub mod map;
pub mod pool;

use crate::atomic::UpdateOp;
use crate::error::Error;
use crate::persist::{Persist, Persister};
use crate::region::RegionManager;
use crate::result::Result;
use self::pool::{LockTable, Pool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Operation flags, in the pool-flag style of `open_flags`
pub mod flags {
    /// No special behavior
    pub const NONE: u32 = 0;

    /// `put`: fail with `AlreadyExists` instead of replacing
    pub const DONT_STOMP: u32 = 0x0000_0001;

    /// `create_pool`: use the crash-consistent heap flavor instead of
    /// the reconstituting one
    pub const CRASH_CONSISTENT: u32 = 0x0000_0002;
}

/// Attributes readable through [`Store::get_attribute`]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Attribute {
    /// Length in bytes of a key's value
    ValueLen,
    /// Live entries in the pool
    Count,
    /// Heap usage in percent
    PercentUsed,
    /// TSC-derived write timestamp of a key
    Timestamp,
    /// CRC-32 of a key's value
    Crc32,
}

/// Key-scan expressions for [`Store::find`]
pub enum FindExpr {
    Exact(Vec<u8>),
    Prefix(Vec<u8>),
    /// Full-match anchoring: the pattern must cover the whole key
    Regex(regex::Regex),
    /// Any key; with an offset this resumes an enumeration
    Next,
}

impl FindExpr {
    /// Compiles a regex expression with full-match anchoring.
    pub fn regex(pattern: &str) -> Result<FindExpr> {
        let re = regex::Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| Error::Invalid(format!("bad regex: {}", e)))?;
        Ok(FindExpr::Regex(re))
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            FindExpr::Exact(k) => key == &k[..],
            FindExpr::Prefix(p) => key.starts_with(p),
            FindExpr::Regex(re) => match std::str::from_utf8(key) {
                Ok(s) => re.is_match(s),
                Err(_) => false,
            },
            FindExpr::Next => true,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockMode {
    Read,
    Write,
}

/// Issued by [`Store::lock`]; required by [`Store::unlock`].
#[derive(Clone, Copy, Debug)]
pub struct LockHandle {
    pool: PoolHandle,
    id: u64,
    write: bool,
    pinned: bool,
}

/// Concurrency capability of the implementation
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadSafety {
    /// All operations may run concurrently
    FullySafe,
    /// Operations on one pool are serialized; pools are independent
    SingleWriter,
    /// No concurrent use at all
    SingleThread,
}

pub type PoolHandle = u64;

struct PoolSlot<P: Persister> {
    name: String,
    pool: Arc<Mutex<Pool<P>>>,
    locks: Arc<LockTable>,
}

/// The storage engine: named pools in one region directory.
pub struct Store<P: Persister = Persist> {
    rm: RegionManager,
    pers: P,
    pools: Mutex<HashMap<PoolHandle, PoolSlot<P>>>,
    next: AtomicU64,
}

impl Store<Persist> {
    pub fn new<D: AsRef<Path>>(dir: D) -> Result<Self> {
        Self::with_persister(dir, Persist)
    }
}

impl<P: Persister> Store<P> {
    pub fn with_persister<D: AsRef<Path>>(dir: D, pers: P) -> Result<Self> {
        crate::utils::env();
        Ok(Self {
            rm: RegionManager::new(dir)?,
            pers,
            pools: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        })
    }

    pub fn thread_safety(&self) -> ThreadSafety {
        ThreadSafety::SingleWriter
    }

    fn insert_slot(&self, name: &str, pool: Pool<P>, locks: Arc<LockTable>) -> PoolHandle {
        let h = self.next.fetch_add(1, Ordering::SeqCst);
        self.pools.lock().unwrap().insert(
            h,
            PoolSlot {
                name: name.to_string(),
                pool: Arc::new(Mutex::new(pool)),
                locks,
            },
        );
        h
    }

    fn slot(&self, handle: PoolHandle) -> Result<(Arc<Mutex<Pool<P>>>, Arc<LockTable>)> {
        let pools = self.pools.lock().unwrap();
        let s = pools.get(&handle).ok_or(Error::InvalidHandle)?;
        Ok((s.pool.clone(), s.locks.clone()))
    }

    pub fn create_pool(
        &self,
        name: &str,
        size: usize,
        flags: u32,
        expected_obj_count: u64,
    ) -> Result<PoolHandle> {
        {
            let pools = self.pools.lock().unwrap();
            if pools.values().any(|s| s.name == name) {
                return Err(Error::AlreadyExists);
            }
        }
        let pool = Pool::create(
            &self.rm,
            name,
            size,
            flags & flags::CRASH_CONSISTENT != 0,
            expected_obj_count,
            self.pers.clone(),
        )?;
        Ok(self.insert_slot(name, pool, Arc::new(LockTable::new())))
    }

    pub fn open_pool(&self, name: &str, _flags: u32) -> Result<PoolHandle> {
        // a second open of an already-open pool shares the state
        {
            let pools = self.pools.lock().unwrap();
            if let Some((_, s)) = pools.iter().find(|(_, s)| s.name == name) {
                let pool = s.pool.clone();
                let locks = s.locks.clone();
                drop(pools);
                let h = self.next.fetch_add(1, Ordering::SeqCst);
                self.pools.lock().unwrap().insert(
                    h,
                    PoolSlot {
                        name: name.to_string(),
                        pool,
                        locks,
                    },
                );
                return Ok(h);
            }
        }
        let pool = Pool::open(&self.rm, name, self.pers.clone())?;
        let name = pool.name().to_string();
        Ok(self.insert_slot(&name, pool, Arc::new(LockTable::new())))
    }

    pub fn close_pool(&self, handle: PoolHandle) -> Result<()> {
        let mut pools = self.pools.lock().unwrap();
        let slot = pools.remove(&handle).ok_or(Error::InvalidHandle)?;
        let shared = pools.values().any(|s| s.name == slot.name);
        drop(pools);
        if !shared {
            if let Ok(m) = Arc::try_unwrap(slot.pool) {
                m.into_inner().unwrap().close();
            }
        }
        Ok(())
    }

    pub fn delete_pool(&self, name: &str) -> Result<()> {
        {
            let pools = self.pools.lock().unwrap();
            if pools.values().any(|s| s.name == name) {
                return Err(Error::InUse);
            }
        }
        if !self.rm.exists(name) {
            return Err(Error::NotFound);
        }
        // a short open collects the grown regions recorded in the pool
        let names = match Pool::open(&self.rm, name, self.pers.clone()) {
            Ok(pool) => {
                let names = pool.region_names();
                pool.close();
                names
            }
            Err(_) => vec![name.to_string()],
        };
        for n in names {
            let _ = self.rm.erase(&n);
        }
        Ok(())
    }

    pub fn grow_pool(&self, handle: PoolHandle, increment: usize) -> Result<usize> {
        let (pool, _) = self.slot(handle)?;
        let mut pool = pool.lock().unwrap();
        pool.grow(increment)
    }

    pub fn pool_size(&self, handle: PoolHandle) -> Result<usize> {
        let (pool, _) = self.slot(handle)?;
        let pool = pool.lock().unwrap();
        Ok(pool.size())
    }

    pub fn put(&self, handle: PoolHandle, key: &[u8], value: &[u8], flags: u32) -> Result<()> {
        let (pool, _) = self.slot(handle)?;
        let mut pool = pool.lock().unwrap();
        pool.put(key, value, flags)
    }

    /// `put` from a caller-owned buffer; same durability contract.
    pub fn put_direct(
        &self,
        handle: PoolHandle,
        key: &[u8],
        value: &[u8],
        flags: u32,
    ) -> Result<()> {
        self.put(handle, key, value, flags)
    }

    pub fn get(&self, handle: PoolHandle, key: &[u8]) -> Result<Vec<u8>> {
        let (pool, _) = self.slot(handle)?;
        let pool = pool.lock().unwrap();
        pool.get(key)
    }

    /// Copies the value into `out`, returning its length.
    pub fn get_direct(&self, handle: PoolHandle, key: &[u8], out: &mut [u8]) -> Result<usize> {
        let (pool, _) = self.slot(handle)?;
        let pool = pool.lock().unwrap();
        pool.get_direct(key, out)
    }

    pub fn erase(&self, handle: PoolHandle, key: &[u8]) -> Result<()> {
        let (pool, _) = self.slot(handle)?;
        let mut pool = pool.lock().unwrap();
        pool.erase(key)
    }

    pub fn swap_keys(&self, handle: PoolHandle, key_a: &[u8], key_b: &[u8]) -> Result<()> {
        let (pool, _) = self.slot(handle)?;
        let mut pool = pool.lock().unwrap();
        pool.swap(key_a, key_b)
    }

    pub fn atomic_update(
        &self,
        handle: PoolHandle,
        key: &[u8],
        ops: &[UpdateOp<'_>],
    ) -> Result<()> {
        let (pool, _) = self.slot(handle)?;
        let mut pool = pool.lock().unwrap();
        pool.atomic_update(key, ops)
    }

    /// Atomic whole-value replace with optional zero-extension and
    /// payload alignment.
    pub fn resize_value(
        &self,
        handle: PoolHandle,
        key: &[u8],
        bytes: &[u8],
        zero_extend: usize,
        align: usize,
    ) -> Result<()> {
        let (pool, _) = self.slot(handle)?;
        let mut pool = pool.lock().unwrap();
        pool.replace(key, bytes, zero_extend, align)
    }

    /// Advisory per-entry lock. `timeout` of `None` fails immediately
    /// with `WouldBlock` when contended.
    pub fn lock(
        &self,
        handle: PoolHandle,
        key: &[u8],
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<LockHandle> {
        let (pool, locks) = self.slot(handle)?;
        let id = {
            let pool = pool.lock().unwrap();
            pool.entry_id(key)?
        };
        let write = mode == LockMode::Write;
        locks.acquire(id, write, timeout)?;
        // a write holder gets the entry's pointers pinned so a crash
        // mid-modification restores them
        let pinned = if write {
            let mut pool = pool.lock().unwrap();
            pool.pin_entry(key).unwrap_or(false)
        } else {
            false
        };
        Ok(LockHandle {
            pool: handle,
            id,
            write,
            pinned,
        })
    }

    pub fn unlock(&self, handle: PoolHandle, lh: LockHandle) -> Result<()> {
        if lh.pool != handle {
            return Err(Error::InvalidHandle);
        }
        let (pool, locks) = self.slot(handle)?;
        if lh.pinned {
            pool.lock().unwrap().unpin_entry();
        }
        locks.release(lh.id, lh.write)
    }

    pub fn count(&self, handle: PoolHandle) -> Result<u64> {
        let (pool, _) = self.slot(handle)?;
        let pool = pool.lock().unwrap();
        Ok(pool.count())
    }

    pub fn map<F: FnMut(&[u8], &[u8], u64)>(&self, handle: PoolHandle, f: F) -> Result<()> {
        let (pool, _) = self.slot(handle)?;
        let pool = pool.lock().unwrap();
        pool.map_entries(f);
        Ok(())
    }

    pub fn map_keys<F: FnMut(&[u8])>(&self, handle: PoolHandle, f: F) -> Result<()> {
        let (pool, _) = self.slot(handle)?;
        let pool = pool.lock().unwrap();
        pool.map_keys(f);
        Ok(())
    }

    pub fn find(
        &self,
        handle: PoolHandle,
        expr: &FindExpr,
        offset: u64,
    ) -> Result<(Vec<u8>, u64)> {
        let (pool, _) = self.slot(handle)?;
        let pool = pool.lock().unwrap();
        pool.find(expr, offset)
    }

    pub fn get_attribute(
        &self,
        handle: PoolHandle,
        attr: Attribute,
        key: Option<&[u8]>,
    ) -> Result<Vec<u64>> {
        let (pool, _) = self.slot(handle)?;
        let pool = pool.lock().unwrap();
        let v = match attr {
            Attribute::Count => vec![pool.count()],
            Attribute::PercentUsed => vec![pool.percent_used() as u64],
            Attribute::ValueLen => {
                vec![pool.value_len(key.ok_or(Error::Invalid("key required".into()))?)? as u64]
            }
            Attribute::Timestamp => {
                vec![pool.timestamp(key.ok_or(Error::Invalid("key required".into()))?)?]
            }
            Attribute::Crc32 => {
                vec![pool.checksum(key.ok_or(Error::Invalid("key required".into()))?)? as u64]
            }
        };
        Ok(v)
    }
}
