//! Access-control façade
//!
//! Wraps the store and binds it to one authority identity. Permissions
//! are ordinary entries stored inside the pool under reserved keys:
//!
//! ```text
//!   acs.auth_check           sentinel marking an access-controlled pool
//!   acs.control.<authority>  permission bits for the ACL keys themselves
//!   acs.data.<authority>     permission bits for normal keys
//! ```
//!
//! A pool without the sentinel is a legacy pool and grants everything.
//! ACL keys are themselves written through `put`, gated by the `control`
//! namespace, and are never surfaced by iteration.

use crate::atomic::UpdateOp;
use crate::error::Error;
use crate::persist::{Persist, Persister};
use crate::result::Result;
use crate::store::{flags, Attribute, FindExpr, LockHandle, LockMode, PoolHandle, Store};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Permission bits
pub mod access {
    pub type AccessType = u8;
    pub const READ: AccessType = 0x4;
    pub const WRITE: AccessType = 0x2;
    pub const LIST: AccessType = 0x1;
    pub const ALL: AccessType = READ | WRITE | LIST;
    pub const NONE: AccessType = 0x0;
}

const KEY_PREFIX: &str = "acs.";
const KEY_INFIX: [&str; 2] = ["control.", "data."];
const IX_CONTROL: usize = 0;
const IX_DATA: usize = 1;
const KEY_AUTH_CHECK: &str = "acs.auth_check";
const VALUE_MIN_SIZE: usize = 8;
const VALUE_AUTH_CHECK: &[u8; VALUE_MIN_SIZE] = b"xxxxxxxx";

fn access_key(infix: &str, auth_id: u64) -> String {
    format!("{}{}{}", KEY_PREFIX, infix, auth_id)
}

/// True for normal data keys (everything outside the `acs.` key space)
fn is_data(key: &[u8]) -> bool {
    !key.starts_with(KEY_PREFIX.as_bytes())
}

fn encode_access(bits: access::AccessType) -> Vec<u8> {
    format!("0000000{}", bits).into_bytes()
}

/// The store as seen by one authority.
pub struct AcStore<P: Persister = Persist> {
    store: Store<P>,
    auth_id: u64,
    allowed: Mutex<HashMap<PoolHandle, [access::AccessType; 2]>>,
}

impl<P: Persister> AcStore<P> {
    pub fn new(store: Store<P>, auth_id: u64) -> Self {
        Self {
            store,
            auth_id,
            allowed: Mutex::new(HashMap::new()),
        }
    }

    pub fn auth_id(&self) -> u64 {
        self.auth_id
    }

    pub fn inner(&self) -> &Store<P> {
        &self.store
    }

    fn check_pool(&self, pool: PoolHandle, required: access::AccessType) -> Result<()> {
        let allowed = self.allowed.lock().unwrap();
        match allowed.get(&pool) {
            Some(a) if a[IX_CONTROL] & a[IX_DATA] & required == required => Ok(()),
            _ => Err(Error::PermissionDenied),
        }
    }

    fn check_key(
        &self,
        pool: PoolHandle,
        key: &[u8],
        required: access::AccessType,
    ) -> Result<()> {
        let ix = if is_data(key) { IX_DATA } else { IX_CONTROL };
        let allowed = self.allowed.lock().unwrap();
        match allowed.get(&pool) {
            Some(a) if a[ix] & required == required => Ok(()),
            _ => {
                crate::log!(
                    Red,
                    "ACCESS",
                    "denied: pool {:x} auth {:x} need {:x}",
                    pool,
                    self.auth_id,
                    required
                );
                Err(Error::PermissionDenied)
            }
        }
    }

    pub fn create_pool(
        &self,
        name: &str,
        size: usize,
        fl: u32,
        expected_obj_count: u64,
    ) -> Result<PoolHandle> {
        let pool = self.store.create_pool(name, size, fl, expected_obj_count)?;
        if self.auth_id != 0 {
            // write the sentinel and grant the creator everything
            self.store
                .put(pool, KEY_AUTH_CHECK.as_bytes(), VALUE_AUTH_CHECK, flags::NONE)?;
            for infix in &KEY_INFIX {
                self.store.put(
                    pool,
                    access_key(infix, self.auth_id).as_bytes(),
                    &encode_access(access::ALL),
                    flags::NONE,
                )?;
            }
            self.allowed
                .lock()
                .unwrap()
                .insert(pool, [access::ALL, access::ALL]);
        }
        // with no authority there is no grant to cache: the creator is
        // denied until the pool is reopened, at which point the missing
        // sentinel makes it a legacy pool
        Ok(pool)
    }

    pub fn open_pool(&self, name: &str, fl: u32) -> Result<PoolHandle> {
        let pool = self.store.open_pool(name, fl)?;
        let mut buf = [0u8; VALUE_MIN_SIZE];
        let sentinel = self
            .store
            .get_direct(pool, KEY_AUTH_CHECK.as_bytes(), &mut buf);
        let ac = match sentinel {
            Ok(n) if n == VALUE_MIN_SIZE && &buf == VALUE_AUTH_CHECK => {
                let mut ac = [access::NONE; 2];
                for (i, infix) in KEY_INFIX.iter().enumerate() {
                    let key = access_key(infix, self.auth_id);
                    let mut v = [0u8; VALUE_MIN_SIZE];
                    if let Ok(n) = self.store.get_direct(pool, key.as_bytes(), &mut v) {
                        if n == VALUE_MIN_SIZE {
                            ac[i] = v[VALUE_MIN_SIZE - 1].wrapping_sub(b'0');
                        }
                    }
                }
                ac
            }
            // legacy pool: everything is allowed
            _ => [access::ALL, access::ALL],
        };
        self.allowed.lock().unwrap().insert(pool, ac);
        Ok(pool)
    }

    pub fn close_pool(&self, pool: PoolHandle) -> Result<()> {
        self.allowed.lock().unwrap().remove(&pool);
        self.store.close_pool(pool)
    }

    pub fn delete_pool(&self, name: &str) -> Result<()> {
        self.store.delete_pool(name)
    }

    pub fn grow_pool(&self, pool: PoolHandle, increment: usize) -> Result<usize> {
        self.store.grow_pool(pool, increment)
    }

    pub fn put(&self, pool: PoolHandle, key: &[u8], value: &[u8], fl: u32) -> Result<()> {
        self.check_key(pool, key, access::WRITE)?;
        self.store.put(pool, key, value, fl)
    }

    pub fn put_direct(&self, pool: PoolHandle, key: &[u8], value: &[u8], fl: u32) -> Result<()> {
        self.check_key(pool, key, access::WRITE)?;
        self.store.put_direct(pool, key, value, fl)
    }

    pub fn get(&self, pool: PoolHandle, key: &[u8]) -> Result<Vec<u8>> {
        self.check_key(pool, key, access::READ)?;
        self.store.get(pool, key)
    }

    pub fn get_direct(&self, pool: PoolHandle, key: &[u8], out: &mut [u8]) -> Result<usize> {
        self.check_key(pool, key, access::READ)?;
        self.store.get_direct(pool, key, out)
    }

    pub fn erase(&self, pool: PoolHandle, key: &[u8]) -> Result<()> {
        self.check_key(pool, key, access::WRITE)?;
        self.store.erase(pool, key)
    }

    pub fn swap_keys(&self, pool: PoolHandle, key_a: &[u8], key_b: &[u8]) -> Result<()> {
        self.check_key(pool, key_a, access::WRITE)?;
        self.check_key(pool, key_b, access::WRITE)?;
        self.store.swap_keys(pool, key_a, key_b)
    }

    pub fn atomic_update(
        &self,
        pool: PoolHandle,
        key: &[u8],
        ops: &[UpdateOp<'_>],
    ) -> Result<()> {
        self.check_key(pool, key, access::READ | access::WRITE)?;
        self.store.atomic_update(pool, key, ops)
    }

    pub fn lock(
        &self,
        pool: PoolHandle,
        key: &[u8],
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<LockHandle> {
        self.check_key(pool, key, access::READ | access::WRITE)?;
        self.store.lock(pool, key, mode, timeout)
    }

    pub fn unlock(&self, pool: PoolHandle, lh: LockHandle) -> Result<()> {
        self.store.unlock(pool, lh)
    }

    pub fn count(&self, pool: PoolHandle) -> Result<u64> {
        self.check_pool(pool, access::LIST)?;
        let mut n = 0u64;
        self.map_keys(pool, |_| n += 1)?;
        Ok(n)
    }

    /// Iteration never surfaces ACL keys.
    pub fn map<F: FnMut(&[u8], &[u8], u64)>(&self, pool: PoolHandle, mut f: F) -> Result<()> {
        self.check_pool(pool, access::READ | access::LIST)?;
        self.store.map(pool, |k, v, ts| {
            if is_data(k) {
                f(k, v, ts)
            }
        })
    }

    pub fn map_keys<F: FnMut(&[u8])>(&self, pool: PoolHandle, mut f: F) -> Result<()> {
        self.check_pool(pool, access::READ | access::LIST)?;
        self.store.map_keys(pool, |k| {
            if is_data(k) {
                f(k)
            }
        })
    }

    pub fn find(
        &self,
        pool: PoolHandle,
        expr: &FindExpr,
        offset: u64,
    ) -> Result<(Vec<u8>, u64)> {
        self.check_pool(pool, access::READ | access::LIST)?;
        let mut off = offset;
        loop {
            let (key, next) = self.store.find(pool, expr, off)?;
            if is_data(&key) {
                return Ok((key, next));
            }
            off = next;
        }
    }

    pub fn get_attribute(
        &self,
        pool: PoolHandle,
        attr: Attribute,
        key: Option<&[u8]>,
    ) -> Result<Vec<u64>> {
        if let Some(k) = key {
            self.check_key(pool, k, access::READ)?;
        }
        self.store.get_attribute(pool, attr, key)
    }
}
