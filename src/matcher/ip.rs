use anyhow::{anyhow, Result};
use std::net::IpAddr;
use std::str::FromStr;

/// IPv4-mapped prefix used to fold IPv4 CIDRs into the 128-bit space.
const V4_MAPPED_PREFIX: u128 = 0xffff_0000_0000u128 << 32;

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => V4_MAPPED_PREFIX | (u32::from(v4) as u128),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn mask_of(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IpListError {
    #[error("ip list not sorted: call sort() before contains()")]
    NotSorted,
}

/// Sorted, canonicalized list of CIDR ranges folded into the IPv4-mapped
/// 128-bit address space, queried by binary search.
#[derive(Debug, Clone, Default)]
pub struct IpList {
    entries: Vec<(u128, u8)>, // (network base, prefix_len), sorted & deduped
    sorted: bool,
}

impl IpList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, cidr: &str) -> Result<()> {
        let (ip_part, prefix_part) = match cidr.split_once('/') {
            Some((ip, p)) => (ip, Some(p)),
            None => (cidr, None),
        };
        let ip: IpAddr = IpAddr::from_str(ip_part.trim())
            .map_err(|e| anyhow!("invalid ip in cidr {cidr}: {e}"))?;
        let max_bits = match ip {
            IpAddr::V4(_) => 32u8,
            IpAddr::V6(_) => 128u8,
        };
        let host_prefix_len: u8 = match prefix_part {
            Some(p) => p
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid prefix length in cidr {cidr}"))?,
            None => max_bits,
        };
        if host_prefix_len > max_bits {
            return Err(anyhow!("prefix length out of range in cidr {cidr}"));
        }
        // Offset into the folded 128-bit space: IPv4 prefixes sit in the low 32 bits.
        let folded_prefix_len = match ip {
            IpAddr::V4(_) => 96 + host_prefix_len,
            IpAddr::V6(_) => host_prefix_len,
        };
        let base = to_u128(ip) & mask_of(folded_prefix_len);
        self.entries.push((base, folded_prefix_len));
        self.sorted = false;
        Ok(())
    }

    /// Sorts and canonicalizes: merges/drops ranges fully contained in
    /// another, already-present range.
    pub fn sort(&mut self) {
        self.entries.sort_unstable();
        self.entries.dedup();
        let mut kept: Vec<(u128, u8)> = Vec::with_capacity(self.entries.len());
        for &(base, plen) in &self.entries {
            let contained = kept.iter().any(|&(kb, kp)| {
                kp <= plen && (base & mask_of(kp)) == kb
            });
            if !contained {
                kept.retain(|&(kb, kp)| !(plen <= kp && (kb & mask_of(plen)) == base));
                kept.push((base, plen));
            }
        }
        kept.sort_unstable();
        self.entries = kept;
        self.sorted = true;
    }

    pub fn contains(&self, ip: IpAddr) -> Result<bool, IpListError> {
        if !self.sorted {
            return Err(IpListError::NotSorted);
        }
        let target = to_u128(ip);
        // Binary search for the last entry whose base <= target, then scan
        // a small neighborhood backwards since prefix lengths vary.
        let idx = self.entries.partition_point(|&(base, _)| base <= target);
        for &(base, plen) in self.entries[..idx].iter().rev() {
            if (target & mask_of(plen)) == base {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
