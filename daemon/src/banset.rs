//! Kernel nftables set driver, grounded on `original_source/include/SystemBanSet.h`
//! and the batch send/receive shape in the kieled-http-proxy-to-tun `nft.rs`
//! reference file.
//!
//! Built on the `nftnl`/`mnl` crates rather than shelling out to the `nft`
//! binary, since a long-running daemon wants one persistent netlink socket
//! and typed set-element messages, not a process fork per ban. The pinned
//! `add-set-elem-timeout` branch adds the per-element timeout the `nft`
//! CLI exposes but the upstream crate historically didn't.
//!
//! Adding and committing bans stays on the safe `nftnl` wrapper, but
//! confirming a configured set actually exists and supports timeouts/
//! intervals needs to read back attributes (`NFTNL_SET_FLAGS`,
//! `NFTNL_SET_KEY_TYPE`) the safe wrapper has no accessor for, so
//! `check_set` drops to the raw `nftnl-sys` bindings for that one
//! GETSET dump, the same way `SystemBanSet::check_set` does.

use nftnl::set::{Set, SetElem, SetKey};
use nftnl::{Batch, FinalizedBatch, MsgType, ProtoFamily, Table};
use regband_common::{IpValue, RegbandError, Result};
use std::ffi::{CStr, CString};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// nftables/include/datatype.h: TYPE_IPADDR / TYPE_IP6ADDR. Stable ABI
// constants, same values `SystemBanSet.h` hardcodes under the same names.
const KEY_TYPE_IPV4: u32 = 7;
const KEY_TYPE_IPV6: u32 = 8;

fn proto_family(table_type: &str) -> Result<ProtoFamily> {
    Ok(match table_type {
        "inet" => ProtoFamily::Inet,
        "ip" => ProtoFamily::Ipv4,
        "ip6" => ProtoFamily::Ipv6,
        "bridge" => ProtoFamily::Bridge,
        "arp" => ProtoFamily::Arp,
        "unspec" => ProtoFamily::Unspec,
        other => {
            return Err(RegbandError::Configuration(format!(
                "invalid table type {other:?}, use inet, ip, ip6, bridge, arp, or unspec"
            )))
        }
    })
}

fn next_seq() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as u32
}

fn nlmsg_align(len: u32) -> u32 {
    (len + 3) & !3
}

struct PendingBan {
    ip: IpValue,
    timeout: Option<Duration>,
}

/// Owns the netlink socket and the table/set handles for one nftables
/// table. Bans are buffered by [`BanSetDriver::add_ip`] and flushed in one
/// batch by [`BanSetDriver::commit_batch`], mirroring the original's
/// per-cycle `add_ip` + `commit_batch` pairing.
pub struct BanSetDriver {
    socket: mnl::Socket,
    table: Table,
    table_name: CString,
    family: ProtoFamily,
    set_v4_name: Option<CString>,
    set_v6_name: Option<CString>,
    pending: Vec<PendingBan>,
}

impl BanSetDriver {
    /// Opens the netlink socket and confirms the configured sets exist and
    /// support timeouts before the daemon starts scoring traffic.
    pub fn initialize(table_type: &str, table_name: &str, set_v4_name: Option<&str>, set_v6_name: Option<&str>) -> Result<Self> {
        let family = proto_family(table_type)?;
        let table_c = CString::new(table_name).map_err(|_| RegbandError::Configuration("nft.table must not contain a NUL byte".into()))?;
        let table = Table::new(&table_c, family);

        let socket = mnl::Socket::new(mnl::Bus::Netfilter).map_err(|e| RegbandError::BanSet(format!("could not open mnl socket: {e}")))?;

        let set_v4_name = set_v4_name
            .map(|s| CString::new(s).map_err(|_| RegbandError::Configuration("nft.ipv4set must not contain a NUL byte".into())))
            .transpose()?;
        let set_v6_name = set_v6_name
            .map(|s| CString::new(s).map_err(|_| RegbandError::Configuration("nft.ipv6set must not contain a NUL byte".into())))
            .transpose()?;

        let driver = BanSetDriver { socket, table, table_name: table_c, family, set_v4_name, set_v6_name, pending: Vec::new() };
        if let Some(name) = &driver.set_v4_name {
            driver.check_set(name, false)?;
        }
        if let Some(name) = &driver.set_v6_name {
            driver.check_set(name, true)?;
        }
        Ok(driver)
    }

    /// Issues a GETSET dump restricted to this table's family and confirms
    /// `set_name` exists, supports element timeouts and, for ipv6,
    /// interval keys, and has the expected key type. Mirrors
    /// `SystemBanSet::check_set`'s four checks one for one.
    fn check_set(&self, set_name: &CString, is_v6: bool) -> Result<()> {
        let expect_key_type = if is_v6 { KEY_TYPE_IPV6 } else { KEY_TYPE_IPV4 };
        let seq = next_seq();

        let mut req_buf = vec![0u8; 8192];
        let sent_len = unsafe {
            let probe = nftnl_sys::nftnl_set_alloc();
            if probe.is_null() {
                return Err(RegbandError::BanSet("could not allocate nftnl set".into()));
            }
            let nlh = nftnl_sys::nftnl_set_nlmsg_build_hdr(
                req_buf.as_mut_ptr() as *mut _,
                nftnl_sys::NFT_MSG_GETSET as u16,
                self.family as u16,
                (libc::NLM_F_DUMP | libc::NLM_F_ACK) as u16,
                seq,
            );
            nftnl_sys::nftnl_set_set_str(probe, nftnl_sys::NFTNL_SET_TABLE as u16, self.table_name.as_ptr());
            nftnl_sys::nftnl_set_set_u32(probe, nftnl_sys::NFTNL_SET_FAMILY as u16, self.family as u32);
            nftnl_sys::nftnl_set_nlmsg_build_payload(nlh, probe);
            nftnl_sys::nftnl_set_free(probe);
            (*nlh).nlmsg_len as usize
        };

        self.socket
            .send(&req_buf[..sent_len])
            .map_err(|e| RegbandError::BanSet(format!("could not send GETSET for set {}: {e}", set_name.to_string_lossy())))?;

        let mut found = false;
        let mut recv_buf = vec![0u8; 65536];
        'recv: loop {
            let len = self
                .socket
                .recv(&mut recv_buf[..])
                .map_err(|e| RegbandError::BanSet(format!("error reading GETSET reply for set {}: {e}", set_name.to_string_lossy())))?;
            if len == 0 {
                break;
            }

            let mut offset = 0usize;
            while offset + std::mem::size_of::<libc::nlmsghdr>() <= len {
                let nlh = unsafe { &*(recv_buf.as_ptr().add(offset) as *const libc::nlmsghdr) };
                let msg_len = nlh.nlmsg_len as usize;
                if msg_len < std::mem::size_of::<libc::nlmsghdr>() || offset + msg_len > len {
                    break;
                }

                match nlh.nlmsg_type as i32 {
                    libc::NLMSG_DONE => break 'recv,
                    libc::NLMSG_ERROR => {
                        let err_off = offset + std::mem::size_of::<libc::nlmsghdr>();
                        let errno = unsafe { *(recv_buf.as_ptr().add(err_off) as *const i32) };
                        if errno == 0 {
                            // a bare ack, not an error
                        } else if errno == -libc::ENOENT {
                            return Err(RegbandError::BanSet(format!("nftable table not found while checking set {}", set_name.to_string_lossy())));
                        } else {
                            return Err(RegbandError::BanSet(format!(
                                "netlink error while checking set {}: {}",
                                set_name.to_string_lossy(),
                                std::io::Error::from_raw_os_error(-errno)
                            )));
                        }
                    }
                    _ => unsafe {
                        let parsed = nftnl_sys::nftnl_set_alloc();
                        if parsed.is_null() {
                            return Err(RegbandError::BanSet("could not allocate nftnl set".into()));
                        }
                        let rc = nftnl_sys::nftnl_set_nlmsg_parse(nlh as *const libc::nlmsghdr as *const _, parsed);
                        if rc >= 0 {
                            let name_ptr = nftnl_sys::nftnl_set_get_str(parsed, nftnl_sys::NFTNL_SET_NAME as u16);
                            if !name_ptr.is_null() && CStr::from_ptr(name_ptr) == set_name.as_c_str() {
                                found = true;
                                let flags = nftnl_sys::nftnl_set_get_u32(parsed, nftnl_sys::NFTNL_SET_FLAGS as u16);
                                let key_type = nftnl_sys::nftnl_set_get_u32(parsed, nftnl_sys::NFTNL_SET_KEY_TYPE as u16);
                                if flags & nftnl_sys::NFT_SET_TIMEOUT == 0 {
                                    nftnl_sys::nftnl_set_free(parsed);
                                    return Err(RegbandError::BanSet(format!("nftable set {} does not support element timeouts", set_name.to_string_lossy())));
                                }
                                if is_v6 && flags & nftnl_sys::NFT_SET_INTERVAL == 0 {
                                    nftnl_sys::nftnl_set_free(parsed);
                                    return Err(RegbandError::BanSet(format!("nftable set {} does not support interval keys", set_name.to_string_lossy())));
                                }
                                if key_type != expect_key_type {
                                    nftnl_sys::nftnl_set_free(parsed);
                                    return Err(RegbandError::BanSet(format!("nftable set {} is of the wrong key type", set_name.to_string_lossy())));
                                }
                            }
                        }
                        nftnl_sys::nftnl_set_free(parsed);
                    },
                }
                offset += nlmsg_align(msg_len as u32) as usize;
            }
        }

        if !found {
            return Err(RegbandError::BanSet(format!("nftable set {} not found", set_name.to_string_lossy())));
        }
        Ok(())
    }

    /// Queues a ban. `timeout_secs == 0` means permanent (no timeout set).
    pub fn add_ip(&mut self, ip: IpValue, timeout_secs: u64) {
        let timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
        self.pending.push(PendingBan { ip, timeout });
    }

    /// Sends every queued ban as one netlink batch, split into an ipv4 and
    /// an ipv6 `NEWSETELEM` message as the original does, and clears the
    /// queue regardless of outcome. An address already present in the set
    /// (`EEXIST`) is logged and treated as success, matching the
    /// original's `commit_batch`; every other netlink error is fatal.
    pub fn commit_batch(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);

        let mut batch = Batch::new();
        let mut any = false;

        if let Some(name) = &self.set_v6_name {
            let mut set = Set::<Ipv6Key>::new(name, 0, &self.table, ProtoFamily::Ipv6);
            let mut has_elems = false;
            for ban in pending.iter().filter(|b| b.ip.is_v6()) {
                let end = IpValue(ban.ip.0.wrapping_add(1));
                let mut elem = SetElem::new(Ipv6Key(ban.ip), &set);
                elem.set_interval_end(Ipv6Key(end));
                if let Some(timeout) = ban.timeout {
                    elem.set_timeout(timeout);
                }
                set.add(&elem);
                has_elems = true;
            }
            if has_elems {
                batch.add(&set, MsgType::Add);
                any = true;
            }
        }

        if let Some(name) = &self.set_v4_name {
            let mut set = Set::<Ipv4Key>::new(name, 0, &self.table, ProtoFamily::Ipv4);
            let mut has_elems = false;
            for ban in pending.iter().filter(|b| !b.ip.is_v6()) {
                let mut elem = SetElem::new(Ipv4Key(ban.ip), &set);
                if let Some(timeout) = ban.timeout {
                    elem.set_timeout(timeout);
                }
                set.add(&elem);
                has_elems = true;
            }
            if has_elems {
                batch.add(&set, MsgType::Add);
                any = true;
            }
        }

        if !any {
            return Ok(());
        }

        let finalized = batch.finalize();
        match send_and_process(&self.socket, &finalized) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                tracing::debug!("one or more banned addresses were already present in the set");
                Ok(())
            }
            Err(e) => Err(RegbandError::BanSet(e.to_string())),
        }
    }
}

/// A `SetKey` adapter so [`IpValue`]'s ipv4 bytes can be handed straight to
/// `nftnl::set::SetElem::new` without an intermediate `std::net` type.
struct Ipv4Key(IpValue);
/// As [`Ipv4Key`], for the 16-byte ipv6 key (top 64 bits plus a zeroed
/// low half, matching [`IpValue::bytes_v6`]).
struct Ipv6Key(IpValue);

impl SetKey for Ipv4Key {
    fn data(&self) -> Vec<u8> {
        self.0.bytes_v4().to_vec()
    }
}

impl SetKey for Ipv6Key {
    fn data(&self) -> Vec<u8> {
        self.0.bytes_v6().to_vec()
    }
}

fn send_and_process(socket: &mnl::Socket, batch: &FinalizedBatch) -> std::io::Result<()> {
    let portid = socket.portid();
    socket.send_all(batch)?;
    let mut buffer = vec![0u8; nftnl::nft_nlmsg_maxsize() as usize];
    let mut expected_seqs = batch.sequence_numbers();
    while !expected_seqs.is_empty() {
        let len = socket.recv(&mut buffer[..])?;
        if len == 0 {
            break;
        }
        let expected_seq = expected_seqs.next().expect("unexpected nft ack");
        mnl::cb_run(&buffer[..len], expected_seq, portid)?;
    }
    Ok(())
}
