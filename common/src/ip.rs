//! Packed IPv4/IPv6 value type.
//!
//! A single 64-bit scalar holds either a full IPv4 address in the low 32
//! bits or the upper 64 bits of an IPv6 address (the lower 64 are always
//! zero in this system). Any bit set above position 32 means the value
//! is an IPv6 prefix; this keeps bucket dispatch and comparisons
//! branchless and the containers generic over both families.

use std::fmt;

const IPV6_MASK: u64 = ((1u64 << 32) - 1) << 32;

pub const TOTAL_BIT_SIZE_V4: u32 = 32;
pub const TOTAL_BIT_SIZE_V6: u32 = 64;

/// A packed IPv4 address or IPv6 /64 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpValue(pub u64);

impl IpValue {
    pub const fn is_v6(self) -> bool {
        self.0 & IPV6_MASK != 0
    }

    pub fn bytes_v4(self) -> [u8; 4] {
        (self.0 as u32).to_be_bytes()
    }

    /// 16-byte big-endian representation; the low 8 bytes are always zero.
    pub fn bytes_v6(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.0.to_be_bytes());
        out
    }

    /// Parses dotted-decimal IPv4 or up to four colon-separated hex groups
    /// terminated by `::` for IPv6. Returns `None` on any malformed input;
    /// unlike the C++ original, `0.0.0.0` and "parse failed" are
    /// distinguishable.
    pub fn parse(s: &str) -> Option<IpValue> {
        if s.contains(':') {
            Self::parse_v6(s)
        } else {
            Self::parse_v4(s)
        }
    }

    fn parse_v4(s: &str) -> Option<IpValue> {
        let mut parts = s.split('.');
        let mut value: u32 = 0;
        for _ in 0..4 {
            let part = parts.next()?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let octet: u32 = part.parse().ok()?;
            if octet > 255 {
                return None;
            }
            value = (value << 8) | octet;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(IpValue(value as u64))
    }

    fn parse_v6(s: &str) -> Option<IpValue> {
        let mut groups: [u16; 4] = [0; 4];
        let mut count = 0usize;
        let mut rest = s;
        while count < 4 {
            let sep = rest.find(':')?;
            let group = &rest[..sep];
            if group.is_empty() || group.len() > 4 || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            groups[count] = u16::from_str_radix(group, 16).ok()?;
            count += 1;
            rest = &rest[sep + 1..];
            if rest.is_empty() {
                // a bare trailing ':' with nothing left is not "::"
                return None;
            }
            if let Some(stripped) = rest.strip_prefix(':') {
                if stripped.is_empty() {
                    rest = "";
                    break;
                }
                return None;
            }
        }
        if !rest.is_empty() {
            return None;
        }
        let mut value: u64 = 0;
        for g in groups.iter().take(count) {
            value = (value << 16) | (*g as u64);
        }
        value <<= 16 * (4 - count as u32);
        Some(IpValue(value))
    }
}

impl fmt::Display for IpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_v6() {
            let groups = [
                (self.0 >> 48) & 0xffff,
                (self.0 >> 32) & 0xffff,
                (self.0 >> 16) & 0xffff,
                self.0 & 0xffff,
            ];
            let last_nonzero = groups.iter().rposition(|g| *g != 0);
            match last_nonzero {
                Some(idx) => {
                    for g in &groups[..=idx] {
                        write!(f, "{:x}:", g)?;
                    }
                    write!(f, ":")
                }
                None => write!(f, "::"),
            }
        } else {
            let b = self.bytes_v4();
            write!(f, "{}.{}.{}.{}", b[0], b[1], b[2], b[3])
        }
    }
}
