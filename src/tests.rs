#[cfg(test)]
pub(crate) mod scenarios {
    use crate::acl::AcStore;
    use crate::atomic::UpdateOp;
    use crate::error::Error;
    use crate::persist::NoOp;
    use crate::store::{flags, Attribute, FindExpr, LockMode, Store};
    use std::path::PathBuf;
    use std::time::Duration;

    const MB: usize = 1 << 20;

    fn tmpdir(tag: &str) -> PathBuf {
        let d = std::env::temp_dir().join(format!("pmstore-scen-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&d);
        d
    }

    fn store(tag: &str) -> Store<NoOp> {
        Store::with_persister(tmpdir(tag), NoOp).unwrap()
    }

    #[test]
    fn basic_round_trip() {
        let s = store("basic");
        let p = s.create_pool("p", 64 * MB, flags::NONE, 1000).unwrap();
        s.put(p, b"hello", b"world", flags::NONE).unwrap();
        assert_eq!(s.get(p, b"hello").unwrap(), b"world");
        assert_eq!(s.count(p).unwrap(), 1);
        s.close_pool(p).unwrap();
    }

    #[test]
    fn create_open_close_cycles_preserve_keys() {
        let s = store("cycles");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 100).unwrap();
        for i in 0..50 {
            s.put(
                p,
                format!("k{}", i).as_bytes(),
                format!("v{}", i).as_bytes(),
                flags::NONE,
            )
            .unwrap();
        }
        s.close_pool(p).unwrap();
        let p = s.open_pool("p", flags::NONE).unwrap();
        assert_eq!(s.count(p).unwrap(), 50);
        s.close_pool(p).unwrap();
        let p = s.open_pool("p", flags::NONE).unwrap();
        assert_eq!(s.get(p, b"k31").unwrap(), b"v31");
        s.close_pool(p).unwrap();
    }

    #[test]
    fn dont_stomp_refuses_replacement() {
        let s = store("stomp");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        s.put(p, b"k", b"old", flags::NONE).unwrap();
        assert_eq!(
            s.put(p, b"k", b"new", flags::DONT_STOMP).unwrap_err(),
            Error::AlreadyExists
        );
        assert_eq!(s.get(p, b"k").unwrap(), b"old");
        s.put(p, b"k", b"new", flags::NONE).unwrap();
        assert_eq!(s.get(p, b"k").unwrap(), b"new");
        s.close_pool(p).unwrap();
    }

    #[test]
    fn pool_lifecycle_errors() {
        let s = store("lifecycle");
        assert_eq!(
            s.open_pool("missing", flags::NONE).unwrap_err(),
            Error::RegionNotFound
        );
        let p = s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        assert_eq!(
            s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap_err(),
            Error::AlreadyExists
        );
        assert_eq!(s.delete_pool("p").unwrap_err(), Error::InUse);
        s.close_pool(p).unwrap();
        s.delete_pool("p").unwrap();
        assert_eq!(s.delete_pool("p").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn put_map_keys_observes_each_key_once() {
        let s = store("maponce");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 64).unwrap();
        for i in 0..20 {
            s.put(p, format!("key{:02}", i).as_bytes(), b"v", flags::NONE)
                .unwrap();
        }
        let mut seen = std::collections::HashMap::new();
        s.map_keys(p, |k| {
            *seen.entry(k.to_vec()).or_insert(0) += 1;
        })
        .unwrap();
        assert_eq!(seen.len(), 20);
        assert!(seen.values().all(|&n| n == 1));
        s.close_pool(p).unwrap();
    }

    #[test]
    fn atomic_update_equals_read_modify_write() {
        let s = store("rmw");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        s.put(p, b"k", b"AAAAAAAA", flags::NONE).unwrap();
        s.atomic_update(
            p,
            b"k",
            &[
                UpdateOp::Write { offset: 0, bytes: b"B" },
                UpdateOp::Write { offset: 4, bytes: b"C" },
            ],
        )
        .unwrap();
        assert_eq!(s.get(p, b"k").unwrap(), b"BAAACAAA");

        // zero op and extension beyond the old length
        s.atomic_update(
            p,
            b"k",
            &[
                UpdateOp::Zero { offset: 1, len: 2 },
                UpdateOp::Write { offset: 8, bytes: b"ZZ" },
            ],
        )
        .unwrap();
        let v = s.get(p, b"k").unwrap();
        assert_eq!(&v[..8], b"B\0\0ACAAA");
        assert_eq!(&v[8..], b"ZZ");
        s.close_pool(p).unwrap();
    }

    #[test]
    fn swap_exchanges_values() {
        let s = store("swap");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        s.put(p, b"k1", b"v1", flags::NONE).unwrap();
        s.put(p, b"k2", b"v2", flags::NONE).unwrap();
        s.swap_keys(p, b"k1", b"k2").unwrap();
        assert_eq!(s.get(p, b"k1").unwrap(), b"v2");
        assert_eq!(s.get(p, b"k2").unwrap(), b"v1");
        s.close_pool(p).unwrap();
    }

    #[test]
    fn access_control_denies_other_authorities() {
        let dir = tmpdir("acl");
        let a = AcStore::new(Store::with_persister(&dir, NoOp).unwrap(), 1);
        let p = a.create_pool("p", 8 * MB, flags::NONE, 64).unwrap();
        a.put(p, b"secret", b"x", flags::NONE).unwrap();
        assert_eq!(a.get(p, b"secret").unwrap(), b"x");
        // ACL keys are invisible to iteration even for the creator
        let mut keys = Vec::new();
        a.map_keys(p, |k| keys.push(k.to_vec())).unwrap();
        assert_eq!(keys, vec![b"secret".to_vec()]);
        assert_eq!(a.count(p).unwrap(), 1);
        a.close_pool(p).unwrap();

        let b = AcStore::new(Store::with_persister(&dir, NoOp).unwrap(), 2);
        let p = b.open_pool("p", flags::NONE).unwrap();
        assert_eq!(b.get(p, b"secret").unwrap_err(), Error::PermissionDenied);
        assert_eq!(
            b.put(p, b"mine", b"y", flags::NONE).unwrap_err(),
            Error::PermissionDenied
        );
        assert_eq!(b.count(p).unwrap_err(), Error::PermissionDenied);
        b.close_pool(p).unwrap();
    }

    #[test]
    fn acl_grants_can_be_extended_by_the_controller() {
        let dir = tmpdir("acl-grant");
        let a = AcStore::new(Store::with_persister(&dir, NoOp).unwrap(), 1);
        let p = a.create_pool("p", 8 * MB, flags::NONE, 64).unwrap();
        // grant authority 2 read on data, via an ordinary control write
        a.put(p, b"acs.data.2", b"00000004", flags::NONE).unwrap();
        a.close_pool(p).unwrap();

        let b = AcStore::new(Store::with_persister(&dir, NoOp).unwrap(), 2);
        let p = b.open_pool("p", flags::NONE).unwrap();
        assert_eq!(
            b.put(p, b"k", b"v", flags::NONE).unwrap_err(),
            Error::PermissionDenied
        );
        // reads of data keys are now allowed
        assert_eq!(b.get(p, b"nope").unwrap_err(), Error::NotFound);
        // the ACL keys themselves stay off limits
        assert_eq!(
            b.get(p, b"acs.data.2").unwrap_err(),
            Error::PermissionDenied
        );
        b.close_pool(p).unwrap();
    }

    #[test]
    fn zero_authority_creator_is_locked_out_until_reopen() {
        let dir = tmpdir("acl-zero");
        let a = AcStore::new(Store::with_persister(&dir, NoOp).unwrap(), 0);
        let p = a.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        // no grants were cached for the creating handle
        assert_eq!(
            a.put(p, b"k", b"v", flags::NONE).unwrap_err(),
            Error::PermissionDenied
        );
        assert_eq!(a.count(p).unwrap_err(), Error::PermissionDenied);
        a.close_pool(p).unwrap();

        // no sentinel was written either, so the reopen reads as legacy
        let p = a.open_pool("p", flags::NONE).unwrap();
        a.put(p, b"k", b"v", flags::NONE).unwrap();
        assert_eq!(a.get(p, b"k").unwrap(), b"v");
        a.close_pool(p).unwrap();
    }

    #[test]
    fn legacy_pool_grants_everything() {
        let dir = tmpdir("acl-legacy");
        let plain = Store::with_persister(&dir, NoOp).unwrap();
        let p = plain.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        plain.put(p, b"k", b"v", flags::NONE).unwrap();
        plain.close_pool(p).unwrap();

        let b = AcStore::new(Store::with_persister(&dir, NoOp).unwrap(), 99);
        let p = b.open_pool("p", flags::NONE).unwrap();
        assert_eq!(b.get(p, b"k").unwrap(), b"v");
        b.put(p, b"k2", b"v2", flags::NONE).unwrap();
        b.close_pool(p).unwrap();
    }

    #[test]
    fn locks_block_and_time_out() {
        let s = store("locks");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        s.put(p, b"k", b"v", flags::NONE).unwrap();

        let r1 = s.lock(p, b"k", LockMode::Read, None).unwrap();
        let r2 = s.lock(p, b"k", LockMode::Read, None).unwrap();
        assert_eq!(
            s.lock(p, b"k", LockMode::Write, None).unwrap_err(),
            Error::WouldBlock
        );
        assert_eq!(
            s.lock(p, b"k", LockMode::Write, Some(Duration::from_millis(20)))
                .unwrap_err(),
            Error::Timeout
        );
        s.unlock(p, r1).unwrap();
        s.unlock(p, r2).unwrap();
        let w = s.lock(p, b"k", LockMode::Write, None).unwrap();
        assert_eq!(
            s.lock(p, b"k", LockMode::Read, None).unwrap_err(),
            Error::WouldBlock
        );
        s.unlock(p, w).unwrap();
        assert_eq!(
            s.lock(p, b"missing", LockMode::Read, None).unwrap_err(),
            Error::NotFound
        );
        s.close_pool(p).unwrap();
    }

    #[test]
    fn attributes_report_lengths_counts_and_checksums() {
        let s = store("attrs");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        s.put(p, b"k", b"123456789", flags::NONE).unwrap();
        assert_eq!(
            s.get_attribute(p, Attribute::ValueLen, Some(b"k")).unwrap(),
            vec![9]
        );
        assert_eq!(s.get_attribute(p, Attribute::Count, None).unwrap(), vec![1]);
        assert_eq!(
            s.get_attribute(p, Attribute::Crc32, Some(b"k")).unwrap(),
            vec![0xCBF4_3926]
        );
        let ts = s.get_attribute(p, Attribute::Timestamp, Some(b"k")).unwrap();
        assert!(ts[0] > 0);
        let used = s.get_attribute(p, Attribute::PercentUsed, None).unwrap();
        assert!(used[0] <= 100);
        s.close_pool(p).unwrap();
    }

    #[test]
    fn find_expressions() {
        let s = store("findexpr");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 64).unwrap();
        for k in ["alpha", "beta", "beta2", "gamma"] {
            s.put(p, k.as_bytes(), b"v", flags::NONE).unwrap();
        }
        let (k, _) = s.find(p, &FindExpr::Exact(b"beta".to_vec()), 0).unwrap();
        assert_eq!(k, b"beta");
        let (k, next) = s.find(p, &FindExpr::Prefix(b"beta".to_vec()), 0).unwrap();
        assert_eq!(k, b"beta");
        let (k, _) = s.find(p, &FindExpr::Prefix(b"beta".to_vec()), next).unwrap();
        assert_eq!(k, b"beta2");
        let (k, _) = s.find(p, &FindExpr::regex("[a-z]+2").unwrap(), 0).unwrap();
        assert_eq!(k, b"beta2");
        let mut offset = 0;
        let mut all = Vec::new();
        while let Ok((k, next)) = s.find(p, &FindExpr::Next, offset) {
            all.push(k);
            offset = next;
        }
        assert_eq!(all.len(), 4);
        assert_eq!(
            s.find(p, &FindExpr::Exact(b"delta".to_vec()), 0).unwrap_err(),
            Error::NotFound
        );
        s.close_pool(p).unwrap();
    }

    #[test]
    fn grow_pool_reports_new_size() {
        let s = store("growapi");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        let before = s.pool_size(p).unwrap();
        let after = s.grow_pool(p, 8 * MB).unwrap();
        assert!(after >= before + 8 * MB);
        s.close_pool(p).unwrap();
    }

    #[test]
    fn alignment_requests_round_up_to_powers_of_two() {
        let s = store("align");
        let p = s.create_pool("p", 8 * MB, flags::NONE, 16).unwrap();
        s.put(p, b"k", b"x", flags::NONE).unwrap();
        // 12 is not a power of two; the payload lands on a 16-boundary
        s.resize_value(p, b"k", b"abcdef", 2, 12).unwrap();
        assert_eq!(s.get(p, b"k").unwrap(), b"abcdef\0\0");
        s.close_pool(p).unwrap();
    }

    #[test]
    fn crash_consistent_flavor_round_trips_too() {
        let s = store("ccflavor");
        let p = s
            .create_pool("p", 8 * MB, flags::CRASH_CONSISTENT, 64)
            .unwrap();
        for i in 0..100 {
            s.put(p, format!("k{}", i).as_bytes(), b"v", flags::NONE).unwrap();
        }
        s.erase(p, b"k0").unwrap();
        s.close_pool(p).unwrap();
        let p = s.open_pool("p", flags::NONE).unwrap();
        assert_eq!(s.count(p).unwrap(), 99);
        assert_eq!(s.get(p, b"k99").unwrap(), b"v");
        s.close_pool(p).unwrap();
    }

    #[test]
    fn randomized_round_trip_survives_reopen() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let s = store("random");
        let p = s.create_pool("p", 16 * MB, flags::NONE, 256).unwrap();
        let mut model = std::collections::HashMap::new();
        for i in 0..500 {
            let key = format!("key-{}", rng.gen_range(0..200));
            let len = rng.gen_range(0..2048);
            let val: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            if i % 7 == 3 && model.contains_key(key.as_bytes()) {
                s.erase(p, key.as_bytes()).unwrap();
                model.remove(key.as_bytes());
            } else {
                s.put(p, key.as_bytes(), &val, flags::NONE).unwrap();
                model.insert(key.as_bytes().to_vec(), val);
            }
        }
        s.close_pool(p).unwrap();

        let p = s.open_pool("p", flags::NONE).unwrap();
        assert_eq!(s.count(p).unwrap(), model.len() as u64);
        for (k, v) in &model {
            assert_eq!(&s.get(p, k).unwrap(), v);
        }
        s.close_pool(p).unwrap();
    }

    #[test]
    fn invalid_handles_are_rejected() {
        let s = store("handles");
        assert_eq!(s.get(0xdead, b"k").unwrap_err(), Error::InvalidHandle);
        assert_eq!(s.close_pool(0xdead).unwrap_err(), Error::InvalidHandle);
    }
}
