//! CIDR range table layered on [`IpTable`], grounded on the original's
//! `IPRangeTable<T>`.

use crate::error::RegbandError;
use crate::ip::{IpValue, TOTAL_BIT_SIZE_V4, TOTAL_BIT_SIZE_V6};
use crate::ip_table::{IpTable, INDEX_WORD_BIT_SIZE_V4, INDEX_WORD_BIT_SIZE_V6, SKIP_BITS_V6};

struct RangeValue<T> {
    cidr_suffix: u8,
    value: T,
}

impl<T: Default> Default for RangeValue<T> {
    fn default() -> Self {
        RangeValue { cidr_suffix: 0, value: T::default() }
    }
}

/// A CIDR-keyed table: each stored entry carries the prefix length it was
/// first inserted with, which is immutable thereafter.
pub struct IpRangeTable<T> {
    inner: IpTable<RangeValue<T>>,
}

impl<T> Default for IpRangeTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> IpRangeTable<T> {
    pub fn new() -> Self {
        IpRangeTable { inner: IpTable::new() }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts the canonical network address for `ip`/`prefix_len`. If the
    /// IP already exists, the stored prefix length is left unchanged and
    /// the existing value slot is returned for the caller to overwrite or
    /// inspect. The minimum-indexable-prefix precondition (>= 8 for IPv4,
    /// >= 18 for IPv6) is only checked on a genuinely new insert.
    pub fn find_or_insert(&mut self, ip: IpValue, prefix_len: u8) -> Result<(bool, &mut T), RegbandError> {
        let (existed, slot) = self.inner.find_or_insert(ip);
        if !existed {
            let min_prefix = if ip.is_v6() {
                (SKIP_BITS_V6 + INDEX_WORD_BIT_SIZE_V6) as u8
            } else {
                INDEX_WORD_BIT_SIZE_V4 as u8
            };
            if prefix_len < min_prefix {
                return Err(RegbandError::Configuration(format!(
                    "CIDR suffix {prefix_len} for {ip} is too small for indexing (minimum {min_prefix})"
                )));
            }
            slot.cidr_suffix = prefix_len;
        }
        Ok((existed, &mut slot.value))
    }

    /// Returns `(network_ip, prefix_len, Some(&value))` on containment, or
    /// `(query_ip, 0, None)` on a miss.
    pub fn find_range_for(&self, ip: IpValue) -> (IpValue, u8, Option<&T>) {
        if let Some((entry_ip, entry)) = self.inner.lower_bound_entry(ip) {
            let total_bits = if ip.is_v6() { TOTAL_BIT_SIZE_V6 } else { TOTAL_BIT_SIZE_V4 };
            let shift = total_bits - entry.cidr_suffix as u32;
            let matches = if shift >= 64 { true } else { (ip.0 >> shift) == (entry_ip.0 >> shift) };
            if matches {
                return (entry_ip, entry.cidr_suffix, Some(&entry.value));
            }
        }
        (ip, 0, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_containment_v4_and_v6() {
        let mut t: IpRangeTable<i32> = IpRangeTable::new();
        let net_v4 = IpValue::parse("192.168.1.64").unwrap();
        let net_v6 = IpValue::parse("fd00:11::64").unwrap();

        *t.find_or_insert(net_v4, 24).unwrap().1 = 10;
        *t.find_or_insert(net_v6, 64).unwrap().1 = 20;
        assert_eq!(t.len(), 2);

        let (ip, cidr, v) = t.find_range_for(net_v4);
        assert_eq!(ip, net_v4);
        assert_eq!(cidr, 24);
        assert_eq!(v, Some(&10));

        let hit = IpValue::parse("192.168.1.128").unwrap();
        let (ip, cidr, v) = t.find_range_for(hit);
        assert_eq!(ip, net_v4);
        assert_eq!(cidr, 24);
        assert_eq!(v, Some(&10));

        let miss = IpValue::parse("192.168.2.3").unwrap();
        let (ip, cidr, v) = t.find_range_for(miss);
        assert_eq!(ip, miss);
        assert_eq!(cidr, 0);
        assert_eq!(v, None);

        let hit6 = IpValue::parse("fd00:11:0:0:1::").unwrap();
        let (ip, cidr, v) = t.find_range_for(hit6);
        assert_eq!(ip, net_v6);
        assert_eq!(cidr, 64);
        assert_eq!(v, Some(&20));

        let miss6 = IpValue::parse("fd00:12::").unwrap();
        let (ip, cidr, v) = t.find_range_for(miss6);
        assert_eq!(ip, miss6);
        assert_eq!(cidr, 0);
        assert_eq!(v, None);
    }

    #[test]
    fn reinsert_keeps_original_prefix() {
        let mut t: IpRangeTable<i32> = IpRangeTable::new();
        let net = IpValue::parse("192.168.1.64").unwrap();
        *t.find_or_insert(net, 24).unwrap().1 = 1;

        let (existed, v) = t.find_or_insert(net, 32).unwrap();
        assert!(existed);
        assert_eq!(*v, 1);
        assert_eq!(t.find_range_for(net).1, 24);
    }

    #[test]
    fn minimum_prefix_precondition() {
        let mut t4: IpRangeTable<i32> = IpRangeTable::new();
        let net4 = IpValue::parse("10.0.0.0").unwrap();
        assert!(t4.find_or_insert(net4, 4).is_err());

        let mut t6: IpRangeTable<i32> = IpRangeTable::new();
        let net6 = IpValue::parse("fd00::").unwrap();
        assert!(t6.find_or_insert(net6, 8).is_err());
    }

    #[test]
    fn exact_match_only_at_host_prefix() {
        let mut t: IpRangeTable<i32> = IpRangeTable::new();
        let host = IpValue::parse("192.168.1.1").unwrap();
        *t.find_or_insert(host, 32).unwrap().1 = 5;

        assert_eq!(t.find_range_for(host).2, Some(&5));
        let other = IpValue::parse("192.168.1.2").unwrap();
        assert_eq!(t.find_range_for(other).2, None);
    }
}
