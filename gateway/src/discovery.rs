//! Discovery responder.
//!
//! Serves discovery log pages built from a state map snapshot: one record
//! per (subsystem, listener) reachable in the cluster, filtered by the
//! requesting host's ACL. The wire side speaks the minimal NVMe/TCP subset a
//! discovery controller needs: connection initialization, fabrics connect
//! and get-log-page for the discovery log (LID 70h).

use crate::state::{
    keys::StateKey,
    map::StateMap,
    records::{AddressFamily, HostRecord, ListenerRecord, SubsystemRecord},
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

/// Size of one discovery log page entry.
const ENTRY_LEN: usize = 1024;
/// Size of the discovery log page header.
const HEADER_LEN: usize = 1024;
/// Discovery log page identifier.
const LID_DISCOVERY: u8 = 0x70;

/// One record of the discovery log page.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryLogEntry {
    pub trtype: u8,
    pub adrfam: u8,
    /// 2 = NVM subsystem.
    pub subtype: u8,
    pub treq: u8,
    pub portid: u16,
    pub trsvcid: String,
    pub subnqn: String,
    pub traddr: String,
}

fn put_padded(buf: &mut [u8], text: &str, pad: u8) {
    for b in buf.iter_mut() {
        *b = pad;
    }
    let bytes = text.as_bytes();
    let len = bytes.len().min(buf.len());
    buf[.. len].copy_from_slice(&bytes[.. len]);
}

impl DiscoveryLogEntry {
    /// Fixed 1024 byte wire form.
    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut buf = [0u8; ENTRY_LEN];
        buf[0] = self.trtype;
        buf[1] = self.adrfam;
        buf[2] = self.subtype;
        buf[3] = self.treq;
        buf[4 .. 6].copy_from_slice(&self.portid.to_le_bytes());
        // dynamic controller model
        buf[6 .. 8].copy_from_slice(&0xffffu16.to_le_bytes());
        // admin submission queue size
        buf[8 .. 10].copy_from_slice(&32u16.to_le_bytes());
        put_padded(&mut buf[32 .. 64], &self.trsvcid, b' ');
        put_padded(&mut buf[256 .. 512], &self.subnqn, 0);
        put_padded(&mut buf[512 .. 768], &self.traddr, b' ');
        buf
    }
}

/// A complete discovery log page.
#[derive(Debug, Clone)]
pub struct DiscoveryLogPage {
    /// Generation counter, the state map epoch.
    pub genctr: u64,
    pub entries: Vec<DiscoveryLogEntry>,
}

impl DiscoveryLogPage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            vec![0u8; HEADER_LEN + self.entries.len() * ENTRY_LEN];
        buf[0 .. 8].copy_from_slice(&self.genctr.to_le_bytes());
        buf[8 .. 16].copy_from_slice(&(self.entries.len() as u64).to_le_bytes());
        // recfmt 0
        for (idx, entry) in self.entries.iter().enumerate() {
            let off = HEADER_LEN + idx * ENTRY_LEN;
            buf[off .. off + ENTRY_LEN].copy_from_slice(&entry.encode());
        }
        buf
    }
}

fn adrfam_code(adrfam: AddressFamily) -> u8 {
    match adrfam {
        AddressFamily::Ipv4 => 1,
        AddressFamily::Ipv6 => 2,
    }
}

/// Build the log page one host is allowed to see from a state map snapshot.
pub fn build_log_page(
    snapshot: &crate::store::store_defs::Snapshot,
    host_nqn: &str,
) -> DiscoveryLogPage {
    let mut subsystems: BTreeMap<String, SubsystemRecord> = BTreeMap::new();
    let mut listeners: BTreeMap<String, Vec<ListenerRecord>> = BTreeMap::new();
    let mut allowed: BTreeMap<String, bool> = BTreeMap::new();

    for (key, record) in &snapshot.entries {
        match key.parse::<StateKey>() {
            Ok(StateKey::Subsystem { nqn }) => {
                if let Ok(sub) = serde_json::from_value::<SubsystemRecord>(
                    record.payload.clone(),
                ) {
                    allowed
                        .entry(nqn.clone())
                        .and_modify(|a| *a |= sub.allow_any_host)
                        .or_insert(sub.allow_any_host);
                    subsystems.insert(nqn, sub);
                }
            }
            Ok(StateKey::Listener { nqn, .. }) => {
                if let Ok(listener) = serde_json::from_value::<ListenerRecord>(
                    record.payload.clone(),
                ) {
                    listeners.entry(nqn).or_default().push(listener);
                }
            }
            Ok(StateKey::Host { nqn, .. }) => {
                if let Ok(host) = serde_json::from_value::<HostRecord>(
                    record.payload.clone(),
                ) {
                    let hit = host.is_wildcard() || host.host_nqn == host_nqn;
                    allowed
                        .entry(nqn)
                        .and_modify(|a| *a |= hit)
                        .or_insert(hit);
                }
            }
            _ => {}
        }
    }

    let mut entries = Vec::new();
    let mut portid: u16 = 0;
    for (nqn, _) in &subsystems {
        if !allowed.get(nqn).copied().unwrap_or(false) {
            continue;
        }
        for listener in listeners.get(nqn).map(|l| l.as_slice()).unwrap_or(&[])
        {
            entries.push(DiscoveryLogEntry {
                // tcp
                trtype: 3,
                adrfam: adrfam_code(listener.adrfam),
                subtype: 2,
                treq: 0,
                portid,
                trsvcid: listener.trsvcid.to_string(),
                subnqn: nqn.clone(),
                traddr: listener.traddr.clone(),
            });
            portid = portid.wrapping_add(1);
        }
    }
    DiscoveryLogPage {
        genctr: snapshot.epoch,
        entries,
    }
}

// NVMe/TCP PDU types used by the responder.
const PDU_ICREQ: u8 = 0x00;
const PDU_ICRESP: u8 = 0x01;
const PDU_CAPSULE_CMD: u8 = 0x04;
const PDU_CAPSULE_RESP: u8 = 0x05;
const PDU_C2H_DATA: u8 = 0x07;

/// Embedded discovery responder serving the discovery port.
pub struct DiscoveryResponder {
    state: Arc<StateMap>,
    addr: String,
    port: u16,
}

impl DiscoveryResponder {
    pub fn new(state: Arc<StateMap>, addr: &str, port: u16) -> Self {
        Self {
            state,
            addr: addr.to_string(),
            port,
        }
    }

    /// Accept loop; one task per probing host.
    pub async fn run(self) -> std::io::Result<()> {
        let listener =
            TcpListener::bind((self.addr.as_str(), self.port)).await?;
        info!(
            "Discovery responder listening on {}:{}",
            self.addr, self.port
        );
        let state = self.state;
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Discovery probe from {}", peer);
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_probe(stream, state).await {
                    debug!("Discovery probe from {} ended: {}", peer, err);
                }
            });
        }
    }
}

async fn read_pdu(
    stream: &mut TcpStream,
) -> std::io::Result<(u8, Vec<u8>)> {
    // common header: type, flags, hlen, pdo, plen(le32)
    let mut ch = [0u8; 8];
    stream.read_exact(&mut ch).await?;
    let pdu_type = ch[0];
    let plen = u32::from_le_bytes([ch[4], ch[5], ch[6], ch[7]]) as usize;
    if plen < 8 || plen > 1 << 20 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("implausible pdu length {}", plen),
        ));
    }
    let mut body = vec![0u8; plen - 8];
    stream.read_exact(&mut body).await?;
    Ok((pdu_type, body))
}

async fn write_pdu(
    stream: &mut TcpStream,
    pdu_type: u8,
    hlen: u8,
    pdo: u8,
    body: &[u8],
) -> std::io::Result<()> {
    let mut pdu = Vec::with_capacity(8 + body.len());
    pdu.push(pdu_type);
    pdu.push(0);
    pdu.push(hlen);
    pdu.push(pdo);
    pdu.extend_from_slice(&((8 + body.len()) as u32).to_le_bytes());
    pdu.extend_from_slice(body);
    stream.write_all(&pdu).await?;
    stream.flush().await
}

/// Success completion for one command id.
fn completion(cid: u16) -> [u8; 16] {
    let mut cqe = [0u8; 16];
    cqe[12 .. 14].copy_from_slice(&cid.to_le_bytes());
    cqe
}

fn ascii_until_nul(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[.. end]).to_string()
}

/// Serve one probing host: ICReq/ICResp, fabrics connect, then discovery
/// get-log-page until the host hangs up.
async fn serve_probe(
    mut stream: TcpStream,
    state: Arc<StateMap>,
) -> std::io::Result<()> {
    let (pdu_type, _icreq) = read_pdu(&mut stream).await?;
    if pdu_type != PDU_ICREQ {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "probe did not start with ICReq",
        ));
    }
    // ICResp: pfv 0, cpda 0, digests off, maxh2cdata 128k
    let mut icresp = [0u8; 120];
    icresp[8 .. 12].copy_from_slice(&(128 * 1024u32).to_le_bytes());
    write_pdu(&mut stream, PDU_ICRESP, 128, 0, &icresp).await?;

    let mut host_nqn = String::new();
    loop {
        let (pdu_type, body) = match read_pdu(&mut stream).await {
            Ok(pdu) => pdu,
            // clean hangup after the host read its log page
            Err(err)
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(())
            }
            Err(err) => return Err(err),
        };
        if pdu_type != PDU_CAPSULE_CMD || body.len() < 64 {
            continue;
        }
        let sqe = &body[.. 64];
        let opcode = sqe[0];
        let cid = u16::from_le_bytes([sqe[2], sqe[3]]);
        match opcode {
            // fabrics command
            0x7f => {
                let fctype = sqe[4];
                // connect carries its data in-capsule: hostnqn at offset 512
                if fctype == 0x01 && body.len() >= 64 + 1024 {
                    host_nqn = ascii_until_nul(&body[64 + 512 .. 64 + 768]);
                    debug!("Discovery connect from host '{}'", host_nqn);
                }
                write_pdu(&mut stream, PDU_CAPSULE_RESP, 24, 0, &completion(cid))
                    .await?;
            }
            // get log page
            0x02 => {
                let cdw10 = u32::from_le_bytes([
                    sqe[40], sqe[41], sqe[42], sqe[43],
                ]);
                let lid = (cdw10 & 0xff) as u8;
                if lid != LID_DISCOVERY {
                    warn!("Discovery probe asked for log page {:#x}", lid);
                    write_pdu(
                        &mut stream,
                        PDU_CAPSULE_RESP,
                        24,
                        0,
                        &completion(cid),
                    )
                    .await?;
                    continue;
                }
                let numdl = ((cdw10 >> 16) & 0xffff) as usize;
                let wanted = (numdl + 1) * 4;
                let page =
                    build_log_page(&state.cached_snapshot(), &host_nqn);
                let mut data = page.encode();
                data.resize(data.len().max(wanted), 0);
                data.truncate(wanted);

                // C2HData: cccid, ttag, datao, datal then the payload
                let mut c2h = Vec::with_capacity(24 + data.len());
                c2h.extend_from_slice(&cid.to_le_bytes());
                c2h.extend_from_slice(&0u16.to_le_bytes());
                c2h.extend_from_slice(&0u32.to_le_bytes());
                c2h.extend_from_slice(&(data.len() as u32).to_le_bytes());
                c2h.extend_from_slice(&0u32.to_le_bytes());
                c2h.extend_from_slice(&data);
                write_pdu(&mut stream, PDU_C2H_DATA, 24, 24, &c2h).await?;
                write_pdu(&mut stream, PDU_CAPSULE_RESP, 24, 0, &completion(cid))
                    .await?;
            }
            other => {
                debug!("Ignoring opcode {:#x} on discovery socket", other);
                write_pdu(&mut stream, PDU_CAPSULE_RESP, 24, 0, &completion(cid))
                    .await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state::records::HostRecord,
        store::store_defs::{Record, Snapshot},
    };
    use serde_json::json;

    fn record(payload: serde_json::Value) -> Record {
        Record {
            version: 1,
            writer: "gw-1".to_string(),
            payload,
        }
    }

    fn snapshot() -> Snapshot {
        let sub = SubsystemRecord {
            nqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            serial: "SPDK000000000001".to_string(),
            max_namespaces: 256,
            allow_any_host: false,
            created_without_group_append: true,
        };
        let listener = ListenerRecord {
            nqn: sub.nqn.clone(),
            gateway: "gw-1".to_string(),
            transport: "tcp".to_string(),
            adrfam: AddressFamily::Ipv4,
            traddr: "192.168.13.3".to_string(),
            trsvcid: 4420,
            secure: false,
        };
        let host = HostRecord {
            nqn: sub.nqn.clone(),
            host_nqn: "nqn.2016-06.io.spdk:host1".to_string(),
            use_psk: false,
            use_dhchap: false,
        };
        Snapshot {
            epoch: 7,
            entries: vec![
                (
                    "hst/nqn.2016-06.io.spdk:cnode1/nqn.2016-06.io.spdk:host1"
                        .to_string(),
                    record(serde_json::to_value(&host).unwrap()),
                ),
                (
                    "lst/nqn.2016-06.io.spdk:cnode1/gw-1/ipv4/192.168.13.3/4420"
                        .to_string(),
                    record(serde_json::to_value(&listener).unwrap()),
                ),
                (
                    "sub/nqn.2016-06.io.spdk:cnode1".to_string(),
                    record(serde_json::to_value(&sub).unwrap()),
                ),
            ],
        }
    }

    #[test]
    fn acl_filters_records() {
        let snap = snapshot();
        let allowed = build_log_page(&snap, "nqn.2016-06.io.spdk:host1");
        assert_eq!(allowed.entries.len(), 1);
        assert_eq!(allowed.genctr, 7);
        assert_eq!(allowed.entries[0].traddr, "192.168.13.3");
        assert_eq!(allowed.entries[0].trsvcid, "4420");

        let denied = build_log_page(&snap, "nqn.2016-06.io.spdk:mallory");
        assert!(denied.entries.is_empty());
    }

    #[test]
    fn wildcard_opens_subsystem() {
        let mut snap = snapshot();
        snap.entries.insert(
            0,
            (
                "hst/nqn.2016-06.io.spdk:cnode1/*".to_string(),
                record(json!({
                    "nqn": "nqn.2016-06.io.spdk:cnode1",
                    "host_nqn": "*",
                })),
            ),
        );
        let page = build_log_page(&snap, "nqn.2016-06.io.spdk:anyone");
        assert_eq!(page.entries.len(), 1);
    }

    #[test]
    fn entry_wire_form() {
        let entry = DiscoveryLogEntry {
            trtype: 3,
            adrfam: 1,
            subtype: 2,
            treq: 0,
            portid: 5,
            trsvcid: "4420".to_string(),
            subnqn: "nqn.2016-06.io.spdk:cnode1".to_string(),
            traddr: "192.168.13.3".to_string(),
        };
        let buf = entry.encode();
        assert_eq!(buf[0], 3);
        assert_eq!(buf[1], 1);
        assert_eq!(buf[2], 2);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 5);
        // dynamic controller id
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 0xffff);
        // trsvcid is space padded ascii
        assert_eq!(&buf[32 .. 36], b"4420");
        assert_eq!(buf[36], b' ');
        // subnqn is zero padded
        assert_eq!(&buf[256 .. 282], b"nqn.2016-06.io.spdk:cnode1");
        assert_eq!(buf[282], 0);
        assert_eq!(&buf[512 .. 524], b"192.168.13.3");
    }

    #[test]
    fn page_header_counts_records() {
        let snap = snapshot();
        let page = build_log_page(&snap, "nqn.2016-06.io.spdk:host1");
        let buf = page.encode();
        assert_eq!(buf.len(), 1024 + 1024);
        assert_eq!(
            u64::from_le_bytes(buf[0 .. 8].try_into().unwrap()),
            7
        );
        assert_eq!(
            u64::from_le_bytes(buf[8 .. 16].try_into().unwrap()),
            1
        );
    }
}
