//! Source groups: several independent HWRNGs vote into a staging buffer
//! that is XOR-combined before anything reaches the pool.
//!
//! A group commits only once every member has contributed, so no single
//! device can steer the committed bytes. Group id 0 is a pass-through with
//! no staging.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::pool::Pool;

struct GroupInner {
    member_mask: u32,
    filled_mask: u32,
    staging: Vec<u8>,
}

pub struct Group {
    id: u32,
    size: usize,
    inner: Mutex<GroupInner>,
}

impl Group {
    pub fn new(id: u32, size: usize) -> Result<Arc<Self>> {
        if size == 0 || !size.is_power_of_two() {
            return Err(Error::Config(format!(
                "group {id} buffer size {size} is not a power of two"
            )));
        }
        Ok(Arc::new(Self {
            id,
            size,
            inner: Mutex::new(GroupInner {
                member_mask: 0,
                filled_mask: 0,
                staging: vec![0; size],
            }),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn member_count(&self) -> u32 {
        self.inner.lock().unwrap().member_mask.count_ones()
    }

    /// Claim the next free membership bit.
    pub fn take_mask(&self) -> Result<u32> {
        let mut g = self.inner.lock().unwrap();
        for bit in 0..32 {
            let mask = 1u32 << bit;
            if g.member_mask & mask == 0 {
                g.member_mask |= mask;
                return Ok(mask);
            }
        }
        Err(Error::Config(format!("group {} is full", self.id)))
    }

    /// Return a membership bit; any staged contribution from it is
    /// discarded with the bit.
    pub fn release_mask(&self, mask: u32) {
        let mut g = self.inner.lock().unwrap();
        g.member_mask &= !mask;
        g.filled_mask &= !mask;
        if g.member_mask == 0 {
            g.filled_mask = 0;
        }
    }

    /// Contribute one buffer on behalf of `mask`.
    ///
    /// Pass-through groups hand the bytes straight to the pool (the only
    /// place a group lock nests around the pool lock). Otherwise the bytes
    /// are staged or XOR-ed in; once every member has contributed, the
    /// staging buffer is snapshotted and cleared, the group lock dropped,
    /// and the snapshot committed — the lock ordering that keeps group and
    /// pool mutexes deadlock-free.
    pub fn add_entropy(&self, pool: &Pool, mask: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != self.size {
            return Err(Error::Pool(format!(
                "group {} commit of {} bytes into {}-byte staging",
                self.id,
                buf.len(),
                self.size
            )));
        }

        let mut g = self.inner.lock().unwrap();
        if self.id == 0 || g.member_mask.count_ones() <= 1 {
            pool.add_entropy(buf);
            return Ok(());
        }
        if g.member_mask & mask == 0 {
            return Err(Error::Pool(format!(
                "group {}: mask {mask:#x} is not a member",
                self.id
            )));
        }

        if g.filled_mask == 0 {
            g.staging.copy_from_slice(buf);
        } else {
            for (dst, src) in g.staging.iter_mut().zip(buf) {
                *dst ^= *src;
            }
        }
        g.filled_mask |= mask;

        if g.filled_mask == g.member_mask {
            let snapshot = std::mem::replace(&mut g.staging, vec![0; self.size]);
            g.filled_mask = 0;
            drop(g);
            pool.add_entropy(&snapshot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_commit_of_two_members() {
        let pool = Pool::new(256).unwrap();
        let group = Group::new(1, 64).unwrap();
        let a = group.take_mask().unwrap();
        let b = group.take_mask().unwrap();
        assert_ne!(a, b);

        let buf_a: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let buf_b: Vec<u8> = (0..64).map(|i| 255 - i as u8).collect();

        group.add_entropy(&pool, a, &buf_a).unwrap();
        assert_eq!(pool.fill(), 0, "nothing commits until every member voted");
        group.add_entropy(&pool, b, &buf_b).unwrap();
        assert_eq!(pool.fill(), 64);

        let mut out = [0u8; 64];
        assert_eq!(pool.read(&mut out), 64);
        assert!(out.iter().all(|&x| x == 255));
    }

    #[test]
    fn staging_clears_between_commits() {
        let pool = Pool::new(256).unwrap();
        let group = Group::new(2, 16).unwrap();
        let a = group.take_mask().unwrap();
        let b = group.take_mask().unwrap();

        group.add_entropy(&pool, a, &[0x0F; 16]).unwrap();
        group.add_entropy(&pool, b, &[0xF0; 16]).unwrap();
        group.add_entropy(&pool, a, &[0xAA; 16]).unwrap();
        group.add_entropy(&pool, b, &[0x55; 16]).unwrap();

        let mut out = [0u8; 32];
        assert_eq!(pool.read(&mut out), 32);
        assert!(out[..16].iter().all(|&x| x == 0xFF), "first commit");
        assert!(out[16..].iter().all(|&x| x == 0xFF), "second commit");
    }

    #[test]
    fn pass_through_group_zero() {
        let pool = Pool::new(64).unwrap();
        let group = Group::new(0, 16).unwrap();
        let mask = group.take_mask().unwrap();
        group.add_entropy(&pool, mask, &[7u8; 16]).unwrap();
        assert_eq!(pool.fill(), 16, "group 0 never stages");
    }

    #[test]
    fn single_member_short_circuits() {
        let pool = Pool::new(64).unwrap();
        let group = Group::new(3, 16).unwrap();
        let mask = group.take_mask().unwrap();
        group.add_entropy(&pool, mask, &[9u8; 16]).unwrap();
        assert_eq!(pool.fill(), 16);
    }

    #[test]
    fn mask_allocation_exhausts_at_32() {
        let group = Group::new(4, 16).unwrap();
        let mut masks = Vec::new();
        for _ in 0..32 {
            masks.push(group.take_mask().unwrap());
        }
        assert!(group.take_mask().is_err());

        group.release_mask(masks[5]);
        assert_eq!(group.take_mask().unwrap(), masks[5]);
    }

    #[test]
    fn commit_size_mismatch_is_fatal() {
        let pool = Pool::new(64).unwrap();
        let group = Group::new(5, 16).unwrap();
        let mask = group.take_mask().unwrap();
        let err = group.add_entropy(&pool, mask, &[0u8; 8]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn rejects_non_power_of_two_size() {
        assert!(Group::new(6, 48).is_err());
        assert!(Group::new(6, 0).is_err());
    }
}
