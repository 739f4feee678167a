//! Versioned wire and record codec
//!
//! Peer frames are laid out as `[magic][wire version][message tag][body]`.
//! The sender picks the body layout from the version the recipient last
//! advertised; the receiver reads the version from the header, so both the
//! current and the prior layout stay decodable during a rolling upgrade.
//!
//! | version | differences |
//! |---------|-------------|
//! | `V1`    | inline command bodies, no `force_install_snapshot`, no snapshot `server_config` |
//! | `V2`    | length-prefixed command envelopes, both optional fields present |
//!
//! Persisted records (term info, journal records, journal meta, snapshots)
//! start with a record-format byte and always use the envelope layout.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::raft::journal::{JournalMeta, JournalRecord};
use crate::raft::messages::*;
use crate::raft::registry::{PayloadKind, PayloadRegistry, CLUSTER_CONFIG_TAG, NOOP_TAG};
use crate::raft::types::*;

pub const FRAME_MAGIC: u8 = 0xAF;
const RECORD_FORMAT: u8 = 1;

const TAG_REQUEST_VOTE: u8 = 1;
const TAG_REQUEST_VOTE_REPLY: u8 = 2;
const TAG_APPEND_ENTRIES: u8 = 3;
const TAG_APPEND_ENTRIES_REPLY: u8 = 4;
const TAG_INSTALL_SNAPSHOT: u8 = 5;
const TAG_INSTALL_SNAPSHOT_REPLY: u8 = 6;
const TAG_TIMEOUT_NOW: u8 = 7;

const RECORD_ENTRY: u8 = 1;
const RECORD_LEGACY_APPLIED: u8 = 2;
const RECORD_LEGACY_DELETE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WireVersion {
    V1 = 1,
    V2 = 2,
}

impl WireVersion {
    pub const CURRENT: WireVersion = WireVersion::V2;
    pub const PRIOR: WireVersion = WireVersion::V1;

    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(WireVersion::V1),
            2 => Ok(WireVersion::V2),
            other => Err(CodecError::UnsupportedVersion(other)),
        }
    }

    /// Version to use towards a peer that advertised `advertised`.
    pub fn negotiate(advertised: u8) -> Self {
        if advertised >= WireVersion::CURRENT as u8 {
            WireVersion::CURRENT
        } else {
            WireVersion::PRIOR
        }
    }
}

fn need(buf: &impl Buf, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        Err(CodecError::Truncated {
            needed: n,
            remaining: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, CodecError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut impl Buf) -> Result<u64, CodecError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_bool(buf: &mut impl Buf) -> Result<bool, CodecError> {
    Ok(get_u8(buf)? != 0)
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_opt_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_u64(buf: &mut impl Buf) -> Result<Option<u64>, CodecError> {
    if get_bool(buf)? {
        Ok(Some(get_u64(buf)?))
    } else {
        Ok(None)
    }
}

fn put_cluster_config(buf: &mut BytesMut, config: &ClusterConfig) {
    buf.put_u32(config.len() as u32);
    for server in config.servers() {
        buf.put_u64(server.id);
        buf.put_u8(server.voting as u8);
    }
}

fn get_cluster_config(buf: &mut impl Buf) -> Result<ClusterConfig, CodecError> {
    let count = get_u32(buf)? as usize;
    let mut servers = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = get_u64(buf)?;
        let voting = get_bool(buf)?;
        servers.push(ServerInfo { id, voting });
    }
    Ok(ClusterConfig::new(servers))
}

fn command_tag(command: &Command) -> u8 {
    match command {
        Command::Noop => NOOP_TAG,
        Command::ClusterConfig(_) => CLUSTER_CONFIG_TAG,
        Command::Application(payload) => payload.tag,
    }
}

/// Encoder/decoder for peer frames and persisted records.
#[derive(Debug, Clone)]
pub struct RaftCodec {
    registry: Arc<PayloadRegistry>,
}

impl RaftCodec {
    pub fn new(registry: Arc<PayloadRegistry>) -> Self {
        RaftCodec { registry }
    }

    pub fn registry(&self) -> &PayloadRegistry {
        &self.registry
    }

    // -- frames --

    pub fn encode(&self, rpc: &RaftRpc, version: WireVersion) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(FRAME_MAGIC);
        buf.put_u8(version as u8);
        match rpc {
            RaftRpc::RequestVote(m) => {
                buf.put_u8(TAG_REQUEST_VOTE);
                buf.put_u64(m.term);
                buf.put_u64(m.candidate_id);
                buf.put_u64(m.last_log_index);
                buf.put_u64(m.last_log_term);
            }
            RaftRpc::RequestVoteReply(m) => {
                buf.put_u8(TAG_REQUEST_VOTE_REPLY);
                buf.put_u64(m.term);
                buf.put_u64(m.voter_id);
                buf.put_u8(m.vote_granted as u8);
                buf.put_u8(m.raft_version);
            }
            RaftRpc::AppendEntries(m) => {
                buf.put_u8(TAG_APPEND_ENTRIES);
                buf.put_u64(m.term);
                buf.put_u64(m.leader_id);
                buf.put_u64(m.prev_log_index);
                buf.put_u64(m.prev_log_term);
                buf.put_u64(m.leader_commit);
                buf.put_u32(m.entries.len() as u32);
                for entry in &m.entries {
                    match version {
                        WireVersion::V1 => self.put_entry_v1(&mut buf, entry),
                        WireVersion::V2 => self.put_entry_v2(&mut buf, entry),
                    }
                }
            }
            RaftRpc::AppendEntriesReply(m) => {
                buf.put_u8(TAG_APPEND_ENTRIES_REPLY);
                match version {
                    WireVersion::V1 => put_append_entries_reply_v1(&mut buf, m),
                    WireVersion::V2 => put_append_entries_reply_v2(&mut buf, m),
                }
            }
            RaftRpc::InstallSnapshot(m) => {
                buf.put_u8(TAG_INSTALL_SNAPSHOT);
                match version {
                    WireVersion::V1 => put_install_snapshot_v1(&mut buf, m),
                    WireVersion::V2 => put_install_snapshot_v2(&mut buf, m),
                }
            }
            RaftRpc::InstallSnapshotReply(m) => {
                buf.put_u8(TAG_INSTALL_SNAPSHOT_REPLY);
                buf.put_u64(m.term);
                buf.put_u64(m.follower_id);
                buf.put_u32(m.chunk_index);
                buf.put_u8(m.success as u8);
            }
            RaftRpc::TimeoutNow(m) => {
                buf.put_u8(TAG_TIMEOUT_NOW);
                buf.put_u64(m.term);
                buf.put_u64(m.leader_id);
            }
        }
        buf.freeze()
    }

    /// Decode a frame, returning the version it was written with.
    pub fn decode(&self, frame: Bytes) -> Result<(WireVersion, RaftRpc), CodecError> {
        let mut buf = frame;
        let magic = get_u8(&mut buf)?;
        if magic != FRAME_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = WireVersion::from_u8(get_u8(&mut buf)?)?;
        let tag = get_u8(&mut buf)?;
        let rpc = match tag {
            TAG_REQUEST_VOTE => RaftRpc::RequestVote(RequestVote {
                term: get_u64(&mut buf)?,
                candidate_id: get_u64(&mut buf)?,
                last_log_index: get_u64(&mut buf)?,
                last_log_term: get_u64(&mut buf)?,
            }),
            TAG_REQUEST_VOTE_REPLY => RaftRpc::RequestVoteReply(RequestVoteReply {
                term: get_u64(&mut buf)?,
                voter_id: get_u64(&mut buf)?,
                vote_granted: get_bool(&mut buf)?,
                raft_version: get_u8(&mut buf)?,
            }),
            TAG_APPEND_ENTRIES => {
                let term = get_u64(&mut buf)?;
                let leader_id = get_u64(&mut buf)?;
                let prev_log_index = get_u64(&mut buf)?;
                let prev_log_term = get_u64(&mut buf)?;
                let leader_commit = get_u64(&mut buf)?;
                let count = get_u32(&mut buf)? as usize;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let entry = match version {
                        WireVersion::V1 => self.get_entry_v1(&mut buf)?,
                        WireVersion::V2 => self.get_entry_v2(&mut buf)?,
                    };
                    entries.push(entry);
                }
                RaftRpc::AppendEntries(AppendEntries {
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                })
            }
            TAG_APPEND_ENTRIES_REPLY => RaftRpc::AppendEntriesReply(match version {
                WireVersion::V1 => get_append_entries_reply_v1(&mut buf)?,
                WireVersion::V2 => get_append_entries_reply_v2(&mut buf)?,
            }),
            TAG_INSTALL_SNAPSHOT => RaftRpc::InstallSnapshot(match version {
                WireVersion::V1 => get_install_snapshot_v1(&mut buf)?,
                WireVersion::V2 => get_install_snapshot_v2(&mut buf)?,
            }),
            TAG_INSTALL_SNAPSHOT_REPLY => RaftRpc::InstallSnapshotReply(InstallSnapshotReply {
                term: get_u64(&mut buf)?,
                follower_id: get_u64(&mut buf)?,
                chunk_index: get_u32(&mut buf)?,
                success: get_bool(&mut buf)?,
            }),
            TAG_TIMEOUT_NOW => RaftRpc::TimeoutNow(TimeoutNow {
                term: get_u64(&mut buf)?,
                leader_id: get_u64(&mut buf)?,
            }),
            other => return Err(CodecError::UnknownMessage(other)),
        };
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok((version, rpc))
    }

    // -- log entries --

    fn put_entry_v1(&self, buf: &mut BytesMut, entry: &LogEntry) {
        buf.put_u64(entry.index);
        buf.put_u64(entry.term);
        buf.put_u8(command_tag(&entry.command));
        match &entry.command {
            Command::Noop => {}
            Command::ClusterConfig(config) => put_cluster_config(buf, config),
            Command::Application(payload) => put_bytes(buf, &payload.data),
        }
    }

    fn get_entry_v1(&self, buf: &mut Bytes) -> Result<LogEntry, CodecError> {
        let index = get_u64(buf)?;
        let term = get_u64(buf)?;
        let tag = get_u8(buf)?;
        let command = match self.registry.lookup(tag)? {
            PayloadKind::Noop => Command::Noop,
            PayloadKind::ClusterConfig => Command::ClusterConfig(get_cluster_config(buf)?),
            PayloadKind::Application(_) => Command::Application(Payload {
                tag,
                data: get_bytes(buf)?,
            }),
        };
        Ok(LogEntry::new(index, term, command))
    }

    fn put_entry_v2(&self, buf: &mut BytesMut, entry: &LogEntry) {
        buf.put_u64(entry.index);
        buf.put_u64(entry.term);
        buf.put_u8(command_tag(&entry.command));
        match &entry.command {
            Command::Noop => buf.put_u32(0),
            Command::ClusterConfig(config) => {
                let mut body = BytesMut::new();
                put_cluster_config(&mut body, config);
                put_bytes(buf, &body);
            }
            Command::Application(payload) => put_bytes(buf, &payload.data),
        }
    }

    fn get_entry_v2(&self, buf: &mut Bytes) -> Result<LogEntry, CodecError> {
        let index = get_u64(buf)?;
        let term = get_u64(buf)?;
        let tag = get_u8(buf)?;
        let mut body = get_bytes(buf)?;
        let command = match self.registry.lookup(tag)? {
            PayloadKind::Noop => Command::Noop,
            PayloadKind::ClusterConfig => {
                let config = get_cluster_config(&mut body)?;
                if body.has_remaining() {
                    return Err(CodecError::TrailingBytes(body.remaining()));
                }
                Command::ClusterConfig(config)
            }
            PayloadKind::Application(_) => Command::Application(Payload { tag, data: body }),
        };
        Ok(LogEntry::new(index, term, command))
    }

    // -- persisted records --

    pub fn encode_term_info(&self, info: &TermInfo) -> Bytes {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u8(RECORD_FORMAT);
        buf.put_u64(info.term);
        put_opt_u64(&mut buf, info.voted_for);
        buf.freeze()
    }

    pub fn decode_term_info(&self, data: Bytes) -> Result<TermInfo, CodecError> {
        let mut buf = data;
        check_record_format(&mut buf)?;
        let info = TermInfo {
            term: get_u64(&mut buf)?,
            voted_for: get_opt_u64(&mut buf)?,
        };
        ensure_consumed(&buf)?;
        Ok(info)
    }

    pub fn encode_journal_record(&self, record: &JournalRecord) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(RECORD_FORMAT);
        match record {
            JournalRecord::Entry(entry) => {
                buf.put_u8(RECORD_ENTRY);
                self.put_entry_v2(&mut buf, entry);
            }
            JournalRecord::LegacyApplied { to_index } => {
                buf.put_u8(RECORD_LEGACY_APPLIED);
                buf.put_u64(*to_index);
            }
            JournalRecord::LegacyDelete { from_index } => {
                buf.put_u8(RECORD_LEGACY_DELETE);
                buf.put_u64(*from_index);
            }
        }
        buf.freeze()
    }

    pub fn decode_journal_record(&self, data: Bytes) -> Result<JournalRecord, CodecError> {
        let mut buf = data;
        check_record_format(&mut buf)?;
        let record = match get_u8(&mut buf)? {
            RECORD_ENTRY => JournalRecord::Entry(self.get_entry_v2(&mut buf)?),
            RECORD_LEGACY_APPLIED => JournalRecord::LegacyApplied {
                to_index: get_u64(&mut buf)?,
            },
            RECORD_LEGACY_DELETE => JournalRecord::LegacyDelete {
                from_index: get_u64(&mut buf)?,
            },
            other => return Err(CodecError::UnknownRecord(other)),
        };
        ensure_consumed(&buf)?;
        Ok(record)
    }

    pub fn encode_journal_meta(&self, meta: &JournalMeta) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(RECORD_FORMAT);
        buf.put_u64(meta.commit_index);
        buf.freeze()
    }

    pub fn decode_journal_meta(&self, data: Bytes) -> Result<JournalMeta, CodecError> {
        let mut buf = data;
        check_record_format(&mut buf)?;
        let meta = JournalMeta {
            commit_index: get_u64(&mut buf)?,
        };
        ensure_consumed(&buf)?;
        Ok(meta)
    }

    pub fn encode_snapshot(&self, snapshot: &Snapshot) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + snapshot.state.len());
        buf.put_u8(RECORD_FORMAT);
        buf.put_u64(snapshot.last_included_index);
        buf.put_u64(snapshot.last_included_term);
        match &snapshot.cluster_config {
            Some(config) => {
                buf.put_u8(1);
                put_cluster_config(&mut buf, config);
            }
            None => buf.put_u8(0),
        }
        put_bytes(&mut buf, &snapshot.state);
        buf.freeze()
    }

    pub fn decode_snapshot(&self, data: Bytes) -> Result<Snapshot, CodecError> {
        let mut buf = data;
        check_record_format(&mut buf)?;
        let last_included_index = get_u64(&mut buf)?;
        let last_included_term = get_u64(&mut buf)?;
        let cluster_config = if get_bool(&mut buf)? {
            Some(get_cluster_config(&mut buf)?)
        } else {
            None
        };
        let state = get_bytes(&mut buf)?;
        ensure_consumed(&buf)?;
        Ok(Snapshot {
            last_included_index,
            last_included_term,
            state,
            cluster_config,
        })
    }
}

fn check_record_format(buf: &mut impl Buf) -> Result<(), CodecError> {
    let format = get_u8(buf)?;
    if format != RECORD_FORMAT {
        return Err(CodecError::UnsupportedVersion(format));
    }
    Ok(())
}

fn ensure_consumed(buf: &impl Buf) -> Result<(), CodecError> {
    if buf.has_remaining() {
        Err(CodecError::TrailingBytes(buf.remaining()))
    } else {
        Ok(())
    }
}

fn put_append_entries_reply_v1(buf: &mut BytesMut, m: &AppendEntriesReply) {
    buf.put_u64(m.term);
    buf.put_u64(m.follower_id);
    buf.put_u8(m.success as u8);
    buf.put_u64(m.log_last_index);
    buf.put_u64(m.log_last_term);
    buf.put_u8(m.raft_version);
}

fn get_append_entries_reply_v1(buf: &mut impl Buf) -> Result<AppendEntriesReply, CodecError> {
    Ok(AppendEntriesReply {
        term: get_u64(buf)?,
        follower_id: get_u64(buf)?,
        success: get_bool(buf)?,
        log_last_index: get_u64(buf)?,
        log_last_term: get_u64(buf)?,
        raft_version: get_u8(buf)?,
        force_install_snapshot: false,
    })
}

fn put_append_entries_reply_v2(buf: &mut BytesMut, m: &AppendEntriesReply) {
    put_append_entries_reply_v1(buf, m);
    buf.put_u8(m.force_install_snapshot as u8);
}

fn get_append_entries_reply_v2(buf: &mut impl Buf) -> Result<AppendEntriesReply, CodecError> {
    let mut reply = get_append_entries_reply_v1(buf)?;
    reply.force_install_snapshot = get_bool(buf)?;
    Ok(reply)
}

fn put_install_snapshot_v1(buf: &mut BytesMut, m: &InstallSnapshot) {
    buf.put_u64(m.term);
    buf.put_u64(m.leader_id);
    buf.put_u64(m.last_included_index);
    buf.put_u64(m.last_included_term);
    buf.put_u32(m.chunk_index);
    buf.put_u32(m.total_chunks);
    put_opt_u64(buf, m.last_chunk_hash_code.map(u64::from));
    put_bytes(buf, &m.data);
}

fn get_install_snapshot_v1(buf: &mut Bytes) -> Result<InstallSnapshot, CodecError> {
    Ok(InstallSnapshot {
        term: get_u64(buf)?,
        leader_id: get_u64(buf)?,
        last_included_index: get_u64(buf)?,
        last_included_term: get_u64(buf)?,
        chunk_index: get_u32(buf)?,
        total_chunks: get_u32(buf)?,
        last_chunk_hash_code: get_opt_u64(buf)?.map(|h| h as u32),
        data: get_bytes(buf)?,
        server_config: None,
    })
}

fn put_install_snapshot_v2(buf: &mut BytesMut, m: &InstallSnapshot) {
    put_install_snapshot_v1(buf, m);
    match &m.server_config {
        Some(config) => {
            buf.put_u8(1);
            put_cluster_config(buf, config);
        }
        None => buf.put_u8(0),
    }
}

fn get_install_snapshot_v2(buf: &mut Bytes) -> Result<InstallSnapshot, CodecError> {
    let mut msg = get_install_snapshot_v1(buf)?;
    if get_bool(buf)? {
        msg.server_config = Some(get_cluster_config(buf)?);
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> RaftCodec {
        let registry = PayloadRegistry::new().with(2, "kv").unwrap();
        RaftCodec::new(Arc::new(registry))
    }

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry::new(5, 2, Command::Noop),
            LogEntry::new(
                6,
                2,
                Command::ClusterConfig(ClusterConfig::new([
                    ServerInfo { id: 1, voting: true },
                    ServerInfo {
                        id: 4,
                        voting: false,
                    },
                ])),
            ),
            LogEntry::new(7, 3, Command::Application(Payload::new(2, &b"set a=1"[..]))),
        ]
    }

    #[test]
    fn test_append_entries_decodes_under_both_versions() {
        let codec = codec();
        let rpc = RaftRpc::AppendEntries(AppendEntries {
            term: 3,
            leader_id: 1,
            prev_log_index: 4,
            prev_log_term: 2,
            entries: sample_entries(),
            leader_commit: 4,
        });
        for version in [WireVersion::V1, WireVersion::V2] {
            let frame = codec.encode(&rpc, version);
            assert_eq!(frame[1], version as u8);
            let (decoded_version, decoded) = codec.decode(frame).unwrap();
            assert_eq!(decoded_version, version);
            assert_eq!(decoded, rpc);
        }
    }

    #[test]
    fn test_prior_version_drops_new_fields() {
        let codec = codec();
        let reply = RaftRpc::AppendEntriesReply(AppendEntriesReply {
            term: 9,
            follower_id: 2,
            success: false,
            log_last_index: 10,
            log_last_term: 8,
            force_install_snapshot: true,
            raft_version: WireVersion::CURRENT as u8,
        });
        let (_, v2) = codec.decode(codec.encode(&reply, WireVersion::V2)).unwrap();
        assert_eq!(v2, reply);
        let (_, v1) = codec.decode(codec.encode(&reply, WireVersion::V1)).unwrap();
        match v1 {
            RaftRpc::AppendEntriesReply(r) => {
                assert!(!r.force_install_snapshot);
                assert_eq!(r.log_last_index, 10);
            }
            other => panic!("unexpected {:?}", other),
        }

        let chunk = RaftRpc::InstallSnapshot(InstallSnapshot {
            term: 4,
            leader_id: 1,
            last_included_index: 100,
            last_included_term: 3,
            data: Bytes::from_static(b"chunk"),
            chunk_index: 2,
            total_chunks: 3,
            last_chunk_hash_code: Some(0xdead_beef),
            server_config: Some(ClusterConfig::voting([1, 2, 3])),
        });
        let (_, v1) = codec.decode(codec.encode(&chunk, WireVersion::V1)).unwrap();
        match v1 {
            RaftRpc::InstallSnapshot(m) => {
                assert_eq!(m.server_config, None);
                assert_eq!(m.last_chunk_hash_code, Some(0xdead_beef));
                assert_eq!(&m.data[..], b"chunk");
            }
            other => panic!("unexpected {:?}", other),
        }
        let (_, v2) = codec.decode(codec.encode(&chunk, WireVersion::V2)).unwrap();
        assert_eq!(v2, chunk);
    }

    #[test]
    fn test_rejects_malformed_frames() {
        let codec = codec();
        let frame = codec.encode(
            &RaftRpc::TimeoutNow(TimeoutNow {
                term: 1,
                leader_id: 1,
            }),
            WireVersion::CURRENT,
        );

        let mut bad_magic = frame.to_vec();
        bad_magic[0] = 0;
        assert_eq!(
            codec.decode(Bytes::from(bad_magic)),
            Err(CodecError::BadMagic(0))
        );

        let mut bad_version = frame.to_vec();
        bad_version[1] = 9;
        assert_eq!(
            codec.decode(Bytes::from(bad_version)),
            Err(CodecError::UnsupportedVersion(9))
        );

        let truncated = frame.slice(..frame.len() - 1);
        assert!(matches!(
            codec.decode(truncated),
            Err(CodecError::Truncated { .. })
        ));

        let mut trailing = frame.to_vec();
        trailing.push(0);
        assert_eq!(
            codec.decode(Bytes::from(trailing)),
            Err(CodecError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_unregistered_payload_is_rejected() {
        let codec = codec();
        let rpc = RaftRpc::AppendEntries(AppendEntries {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(
                1,
                1,
                Command::Application(Payload::new(42, &b"?"[..])),
            )],
            leader_commit: 0,
        });
        let frame = codec.encode(&rpc, WireVersion::V2);
        assert_eq!(
            codec.decode(frame),
            Err(CodecError::UnknownPayloadType(42))
        );
    }

    #[test]
    fn test_persisted_records() {
        let codec = codec();
        let info = TermInfo::with_vote(7, 3);
        assert_eq!(
            codec.decode_term_info(codec.encode_term_info(&info)).unwrap(),
            info
        );
        assert_eq!(
            codec
                .decode_term_info(codec.encode_term_info(&TermInfo::new(8)))
                .unwrap()
                .voted_for,
            None
        );

        let snapshot = Snapshot {
            last_included_index: 42,
            last_included_term: 5,
            state: Bytes::from_static(b"state"),
            cluster_config: Some(ClusterConfig::voting([1, 2])),
        };
        assert_eq!(
            codec.decode_snapshot(codec.encode_snapshot(&snapshot)).unwrap(),
            snapshot
        );

        for record in [
            JournalRecord::Entry(sample_entries().remove(1)),
            JournalRecord::LegacyApplied { to_index: 12 },
            JournalRecord::LegacyDelete { from_index: 3 },
        ] {
            let bytes = codec.encode_journal_record(&record);
            assert_eq!(codec.decode_journal_record(bytes).unwrap(), record);
        }

        let meta = JournalMeta { commit_index: 10 };
        assert_eq!(
            codec.decode_journal_meta(codec.encode_journal_meta(&meta)).unwrap(),
            meta
        );
    }
}
