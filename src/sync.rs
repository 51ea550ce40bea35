// File: src/sync.rs
//
// MS-SYNC: primary/secondary replication for the ST virtual machine.
// Two nodes exchange self-framing datagrams over UDP: heartbeats for
// liveness, incremental variable updates, periodic full checkpoints and
// state snapshots. A secondary that loses the primary's heartbeat takes
// over and resumes dispatching from the last replicated program counter.
// The engine is single-threaded and cooperative: the VM's dispatch loop
// calls process() between instructions.

use crate::errors::VmError;
use crate::time_lib::{now_ms, uptime_ms};
use crate::value::{Value, ValueTag};
use crate::vm::{SyncMode, Vm};
use colored::Colorize;
use num_enum::TryFromPrimitive;
use std::fmt;
use std::io::ErrorKind;
use std::net::UdpSocket;

/// Largest datagram on the wire
pub const MAX_SYNC_MESSAGE_SIZE: usize = 1024;

/// Default sync port
pub const DEFAULT_SYNC_PORT: u16 = 8888;

/// Heartbeat cadence
pub const HEARTBEAT_INTERVAL_MS: u64 = 100;

/// Gap after which a heartbeat is considered missed
pub const HEARTBEAT_TIMEOUT_MS: u64 = 500;

/// Consecutive missed-heartbeat windows before the peer is declared dead
pub const HEARTBEAT_DEAD_COUNT: u32 = 3;

/// Registration table capacity
pub const MAX_SYNC_VARIABLES: usize = 256;

/// Default checkpoint cadence
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 1000;

/// Wire magic, "STBC"
pub const SYNC_MAGIC: u32 = 0x5354_4243;

/// Header bytes on the wire
pub const SYNC_HEADER_SIZE: usize = 28;

/// Longest string value that fits a VarSync payload
pub const MAX_WIRE_STRING: usize = 128;

/// Checkpoint snapshot byte budget
pub const MAX_SNAPSHOT_BYTES: usize = 512;

/// Replication role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum NodeRole {
    Primary = 0,
    Secondary = 1,
    Standalone = 2,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            NodeRole::Primary => "PRIMARY",
            NodeRole::Secondary => "SECONDARY",
            NodeRole::Standalone => "STANDALONE",
        };
        write!(f, "{}", text)
    }
}

/// Node lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum NodeState {
    Init = 0,
    Active = 1,
    Standby = 2,
    Takeover = 3,
    Failed = 4,
    Shutdown = 5,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            NodeState::Init => "INIT",
            NodeState::Active => "ACTIVE",
            NodeState::Standby => "STANDBY",
            NodeState::Takeover => "TAKEOVER",
            NodeState::Failed => "FAILED",
            NodeState::Shutdown => "SHUTDOWN",
        };
        write!(f, "{}", text)
    }
}

/// Wire message discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SyncMsgType {
    Heartbeat = 0,
    VarSync = 1,
    StateSync = 2,
    Checkpoint = 3,
    Takeover = 4,
    Ack = 5,
    Error = 6,
}

/// Endpoint configuration for one node
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub local_ip: String,
    pub peer_ip: String,
    pub port: u16,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub checkpoint_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_ip: "0.0.0.0".into(),
            peer_ip: "127.0.0.1".into(),
            port: DEFAULT_SYNC_PORT,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            checkpoint_interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
        }
    }
}

// ---- wire messages ----

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatMsg {
    pub role: NodeRole,
    pub state: NodeState,
    pub vm_pc: u32,
    pub sync_var_count: u32,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarSyncMsg {
    pub var_index: u32,
    pub var_type: u32,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSyncMsg {
    pub vm_pc: u32,
    pub stack_depth: u32,
    pub call_stack_depth: u32,
    pub node_state: NodeState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMsg {
    pub checkpoint_id: u32,
    pub var_count: u32,
    pub snapshot: Vec<u8>,
}

/// Message payload, discriminated by the header's type field
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPayload {
    Heartbeat(HeartbeatMsg),
    VarSync(VarSyncMsg),
    StateSync(StateSyncMsg),
    Checkpoint(CheckpointMsg),
    Takeover,
    Ack { sequence: u32 },
    Error { message: String },
}

impl SyncPayload {
    pub fn msg_type(&self) -> SyncMsgType {
        match self {
            SyncPayload::Heartbeat(_) => SyncMsgType::Heartbeat,
            SyncPayload::VarSync(_) => SyncMsgType::VarSync,
            SyncPayload::StateSync(_) => SyncMsgType::StateSync,
            SyncPayload::Checkpoint(_) => SyncMsgType::Checkpoint,
            SyncPayload::Takeover => SyncMsgType::Takeover,
            SyncPayload::Ack { .. } => SyncMsgType::Ack,
            SyncPayload::Error { .. } => SyncMsgType::Error,
        }
    }
}

/// One decoded sync message
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub sequence: u32,
    pub timestamp: u64,
    pub payload: SyncPayload,
}

/// Bytewise accumulator with a rotate-left per byte, computed over the
/// encoded payload
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &byte in data {
        sum = sum.wrapping_add(byte as u32);
        sum = sum.rotate_left(1);
    }
    sum
}

// ---- wire encoding (network byte order) ----

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn encode_value(out: &mut Vec<u8>, value: &Value) -> Result<(), String> {
    put_u32(out, value.tag() as u32);
    match value {
        Value::Bool(b) => out.push(*b as u8),
        Value::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
        Value::DInt(i) => out.extend_from_slice(&i.to_be_bytes()),
        Value::Real(r) => put_u64(out, r.to_bits()),
        Value::String(s) => {
            if s.len() > MAX_WIRE_STRING {
                return Err(format!("string value of {} bytes exceeds wire limit", s.len()));
            }
            put_u32(out, s.len() as u32);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Time(ms) => put_u64(out, *ms),
        Value::Undefined => {}
    }
    Ok(())
}

pub fn encode_message(msg: &SyncMessage) -> Result<Vec<u8>, String> {
    let mut payload = Vec::new();
    match &msg.payload {
        SyncPayload::Heartbeat(hb) => {
            put_u32(&mut payload, hb.role as u32);
            put_u32(&mut payload, hb.state as u32);
            put_u32(&mut payload, hb.vm_pc);
            put_u32(&mut payload, hb.sync_var_count);
            put_u64(&mut payload, hb.uptime_ms);
        }
        SyncPayload::VarSync(vs) => {
            put_u32(&mut payload, vs.var_index);
            put_u32(&mut payload, vs.var_type);
            encode_value(&mut payload, &vs.value)?;
        }
        SyncPayload::StateSync(ss) => {
            put_u32(&mut payload, ss.vm_pc);
            put_u32(&mut payload, ss.stack_depth);
            put_u32(&mut payload, ss.call_stack_depth);
            put_u32(&mut payload, ss.node_state as u32);
        }
        SyncPayload::Checkpoint(cp) => {
            if cp.snapshot.len() > MAX_SNAPSHOT_BYTES {
                return Err(format!("checkpoint snapshot of {} bytes too large", cp.snapshot.len()));
            }
            put_u32(&mut payload, cp.checkpoint_id);
            put_u32(&mut payload, cp.var_count);
            payload.extend_from_slice(&cp.snapshot);
        }
        SyncPayload::Takeover => {}
        SyncPayload::Ack { sequence } => put_u32(&mut payload, *sequence),
        SyncPayload::Error { message } => {
            let bytes = message.as_bytes();
            let len = bytes.len().min(255);
            put_u32(&mut payload, len as u32);
            payload.extend_from_slice(&bytes[..len]);
        }
    }

    let mut out = Vec::with_capacity(SYNC_HEADER_SIZE + payload.len());
    put_u32(&mut out, SYNC_MAGIC);
    put_u32(&mut out, msg.sequence);
    put_u32(&mut out, msg.payload.msg_type() as u32);
    put_u32(&mut out, payload.len() as u32);
    put_u32(&mut out, checksum(&payload));
    put_u64(&mut out, msg.timestamp);
    out.extend_from_slice(&payload);

    if out.len() > MAX_SYNC_MESSAGE_SIZE {
        return Err(format!("message of {} bytes exceeds wire limit", out.len()));
    }
    Ok(out)
}

/// Byte reader over a received datagram
struct WireCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], String> {
        if self.pos + count > self.data.len() {
            return Err("truncated sync message".into());
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, String> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, String> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

fn decode_value(cursor: &mut WireCursor) -> Result<Value, String> {
    let raw_tag = cursor.u32()?;
    let tag = ValueTag::try_from(raw_tag).map_err(|_| format!("unknown value tag {}", raw_tag))?;
    let value = match tag {
        ValueTag::Bool => Value::Bool(cursor.u8()? != 0),
        ValueTag::Int => Value::Int(cursor.i32()?),
        ValueTag::DInt => Value::DInt(cursor.i64()?),
        ValueTag::Real => Value::Real(f64::from_bits(cursor.u64()?)),
        ValueTag::String => {
            let len = cursor.u32()? as usize;
            if len > MAX_WIRE_STRING {
                return Err(format!("string value of {} bytes exceeds wire limit", len));
            }
            let bytes = cursor.take(len)?;
            Value::String(
                String::from_utf8(bytes.to_vec()).map_err(|_| "string value is not UTF-8")?,
            )
        }
        ValueTag::Time => Value::Time(cursor.u64()?),
        ValueTag::Undefined => Value::Undefined,
    };
    Ok(value)
}

pub fn decode_message(data: &[u8]) -> Result<SyncMessage, String> {
    if data.len() < SYNC_HEADER_SIZE {
        return Err("datagram shorter than the sync header".into());
    }
    let mut cursor = WireCursor::new(data);

    let magic = cursor.u32()?;
    if magic != SYNC_MAGIC {
        return Err(format!("bad sync magic {:#x}", magic));
    }
    let sequence = cursor.u32()?;
    let raw_type = cursor.u32()?;
    let msg_type =
        SyncMsgType::try_from(raw_type).map_err(|_| format!("unknown message type {}", raw_type))?;
    let payload_size = cursor.u32()? as usize;
    let expected_checksum = cursor.u32()?;
    let timestamp = cursor.u64()?;

    if cursor.remaining() < payload_size {
        return Err("payload shorter than declared size".into());
    }
    let payload_bytes = &data[SYNC_HEADER_SIZE..SYNC_HEADER_SIZE + payload_size];
    if checksum(payload_bytes) != expected_checksum {
        return Err("payload checksum mismatch".into());
    }

    let mut cursor = WireCursor::new(payload_bytes);
    let payload = match msg_type {
        SyncMsgType::Heartbeat => {
            let raw_role = cursor.u32()?;
            let raw_state = cursor.u32()?;
            SyncPayload::Heartbeat(HeartbeatMsg {
                role: NodeRole::try_from(raw_role)
                    .map_err(|_| format!("unknown node role {}", raw_role))?,
                state: NodeState::try_from(raw_state)
                    .map_err(|_| format!("unknown node state {}", raw_state))?,
                vm_pc: cursor.u32()?,
                sync_var_count: cursor.u32()?,
                uptime_ms: cursor.u64()?,
            })
        }
        SyncMsgType::VarSync => SyncPayload::VarSync(VarSyncMsg {
            var_index: cursor.u32()?,
            var_type: cursor.u32()?,
            value: decode_value(&mut cursor)?,
        }),
        SyncMsgType::StateSync => {
            let vm_pc = cursor.u32()?;
            let stack_depth = cursor.u32()?;
            let call_stack_depth = cursor.u32()?;
            let raw_state = cursor.u32()?;
            SyncPayload::StateSync(StateSyncMsg {
                vm_pc,
                stack_depth,
                call_stack_depth,
                node_state: NodeState::try_from(raw_state)
                    .map_err(|_| format!("unknown node state {}", raw_state))?,
            })
        }
        SyncMsgType::Checkpoint => {
            let checkpoint_id = cursor.u32()?;
            let var_count = cursor.u32()?;
            let snapshot = cursor.take(cursor.remaining())?.to_vec();
            SyncPayload::Checkpoint(CheckpointMsg { checkpoint_id, var_count, snapshot })
        }
        SyncMsgType::Takeover => SyncPayload::Takeover,
        SyncMsgType::Ack => SyncPayload::Ack { sequence: cursor.u32()? },
        SyncMsgType::Error => {
            let len = cursor.u32()? as usize;
            let bytes = cursor.take(len)?;
            SyncPayload::Error {
                message: String::from_utf8_lossy(bytes).into_owned(),
            }
        }
    };

    Ok(SyncMessage { sequence, timestamp, payload })
}

// ---- engine ----

/// Registration record for one replicated global
#[derive(Debug, Clone)]
pub struct SyncVarInfo {
    pub vm_index: u32,
    pub name: String,
    pub tag: ValueTag,
    pub size: u32,
    pub dirty: bool,
    pub last_sync_time: u64,
}

/// Transfer and health counters
#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub sync_errors: u64,
    pub checksum_errors: u64,
    pub timeouts: u64,
    pub failovers: u64,
}

/// The replication engine for one node
pub struct SyncEngine {
    role: NodeRole,
    state: NodeState,
    config: SyncConfig,

    socket: UdpSocket,
    peer_addr: String,

    send_sequence: u32,
    sync_vars: Vec<SyncVarInfo>,

    last_heartbeat_time: u64,
    peer_last_heartbeat_time: u64,
    heartbeat_timeout_count: u32,
    peer_alive: bool,

    last_checkpoint_id: u32,
    last_checkpoint_time: u64,
    last_applied_checkpoint_id: u32,

    last_error: Option<String>,
    stats: SyncStats,
    enabled: bool,
}

impl SyncEngine {
    /// Bind the sync socket and start in the state implied by the role
    pub fn new(config: SyncConfig, role: NodeRole) -> Result<Self, VmError> {
        let socket = UdpSocket::bind((config.local_ip.as_str(), config.port))
            .map_err(|e| VmError::sync(format!("cannot bind {}:{}: {}", config.local_ip, config.port, e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| VmError::sync(format!("cannot set socket nonblocking: {}", e)))?;

        let state = match role {
            NodeRole::Primary | NodeRole::Standalone => NodeState::Active,
            NodeRole::Secondary => NodeState::Standby,
        };
        let peer_addr = format!("{}:{}", config.peer_ip, config.port);

        let engine = Self {
            role,
            state,
            socket,
            peer_addr,
            send_sequence: 1,
            sync_vars: Vec::new(),
            last_heartbeat_time: now_ms(),
            peer_last_heartbeat_time: 0,
            heartbeat_timeout_count: 0,
            peer_alive: false,
            last_checkpoint_id: 0,
            last_checkpoint_time: now_ms(),
            last_applied_checkpoint_id: 0,
            last_error: None,
            stats: SyncStats::default(),
            enabled: true,
            config,
        };
        engine.log(
            "INFO",
            &format!(
                "sync engine started: role={} local={} peer={}",
                engine.role,
                engine.socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                engine.peer_addr
            ),
        );
        Ok(engine)
    }

    /// Register a replicated global. Registration is additive and only
    /// valid during initialization.
    pub fn register_variable(
        &mut self,
        name: &str,
        vm_index: u32,
        tag: ValueTag,
        size: u32,
    ) -> Result<(), VmError> {
        if self.sync_vars.len() >= MAX_SYNC_VARIABLES {
            return Err(VmError::sync("sync variable table is full"));
        }
        if self.sync_vars.iter().any(|v| v.name == name) {
            return Err(VmError::sync(format!("sync variable {} already registered", name)));
        }
        self.sync_vars.push(SyncVarInfo {
            vm_index,
            name: name.to_string(),
            tag,
            size,
            dirty: false,
            last_sync_time: 0,
        });
        Ok(())
    }

    pub fn mark_dirty(&mut self, vm_index: u32) {
        if let Some(var) = self.sync_vars.iter_mut().find(|v| v.vm_index == vm_index) {
            var.dirty = true;
        }
    }

    /// One cooperative pass: drain datagrams, dispatch handlers, check
    /// peer health, emit heartbeat and checkpoint when due, flush dirty
    /// variables (primary only)
    pub fn process(&mut self, vm: &mut Vm) {
        if !self.enabled {
            return;
        }

        let mut buffer = [0u8; MAX_SYNC_MESSAGE_SIZE];
        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, _from)) => match decode_message(&buffer[..len]) {
                    Ok(message) => {
                        self.stats.messages_received += 1;
                        self.stats.bytes_received += len as u64;
                        self.handle_message(vm, message);
                    }
                    Err(reason) => {
                        self.stats.checksum_errors += 1;
                        self.log("WARN", &format!("discarding datagram: {}", reason));
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.stats.sync_errors += 1;
                    self.set_error(format!("receive failed: {}", e));
                    break;
                }
            }
        }

        self.check_peer_health(vm);

        let now = now_ms();
        if now.saturating_sub(self.last_heartbeat_time) >= self.config.heartbeat_interval_ms {
            self.send_heartbeat(vm);
        }

        if self.role == NodeRole::Primary {
            if now.saturating_sub(self.last_checkpoint_time) >= self.config.checkpoint_interval_ms {
                self.send_checkpoint(vm);
                self.send_state_sync(vm);
            }
            self.flush_dirty_variables(vm);
        }
    }

    fn handle_message(&mut self, vm: &mut Vm, message: SyncMessage) {
        match message.payload {
            SyncPayload::Heartbeat(hb) => self.handle_heartbeat(vm, &hb),
            SyncPayload::VarSync(vs) => self.handle_var_sync(vm, vs),
            SyncPayload::StateSync(ss) => self.handle_state_sync(vm, &ss),
            SyncPayload::Checkpoint(cp) => self.handle_checkpoint(vm, &cp),
            SyncPayload::Takeover => {
                // Peer announced its promotion; a lingering primary steps down
                if self.role == NodeRole::Primary {
                    self.log("WARN", "peer took over, demoting to secondary");
                    self.set_role(NodeRole::Secondary);
                    vm.set_sync_mode(SyncMode::Secondary);
                }
            }
            SyncPayload::Ack { .. } => {}
            SyncPayload::Error { message } => {
                self.stats.sync_errors += 1;
                self.log("ERROR", &format!("peer reported: {}", message));
            }
        }
    }

    fn handle_heartbeat(&mut self, vm: &mut Vm, hb: &HeartbeatMsg) {
        self.peer_last_heartbeat_time = now_ms();
        self.peer_alive = true;
        self.heartbeat_timeout_count = 0;
        self.stats.heartbeats_received += 1;

        // Dual-primary resolution: demote before any further write leaks
        if hb.role == NodeRole::Primary && self.role == NodeRole::Primary {
            self.log("WARN", "dual primary detected, demoting self to secondary");
            self.set_role(NodeRole::Secondary);
            vm.set_sync_mode(SyncMode::Secondary);
        }
    }

    fn handle_var_sync(&mut self, vm: &mut Vm, vs: VarSyncMsg) {
        if self.role != NodeRole::Secondary {
            return;
        }
        vm.apply_synced_global(vs.var_index, vs.value);
        if let Some(var) = self.sync_vars.iter_mut().find(|v| v.vm_index == vs.var_index) {
            var.last_sync_time = now_ms();
            var.dirty = false;
        }
    }

    fn handle_state_sync(&mut self, vm: &mut Vm, ss: &StateSyncMsg) {
        if self.role != NodeRole::Secondary {
            return;
        }
        vm.set_pc(ss.vm_pc);
    }

    fn handle_checkpoint(&mut self, vm: &mut Vm, cp: &CheckpointMsg) {
        if self.role != NodeRole::Secondary {
            return;
        }
        // Idempotent: a retransmitted checkpoint is a no-op
        if cp.checkpoint_id == self.last_applied_checkpoint_id {
            return;
        }

        let mut cursor = WireCursor::new(&cp.snapshot);
        let count = (cp.var_count as usize).min(self.sync_vars.len());
        for i in 0..count {
            match decode_value(&mut cursor) {
                Ok(value) => {
                    let vm_index = self.sync_vars[i].vm_index;
                    vm.apply_synced_global(vm_index, value);
                    self.sync_vars[i].last_sync_time = now_ms();
                    self.sync_vars[i].dirty = false;
                }
                Err(reason) => {
                    self.stats.sync_errors += 1;
                    self.log("ERROR", &format!("checkpoint {} truncated: {}", cp.checkpoint_id, reason));
                    return;
                }
            }
        }

        self.last_applied_checkpoint_id = cp.checkpoint_id;
        vm.checkpoint_applied();
    }

    fn check_peer_health(&mut self, vm: &mut Vm) {
        let now = now_ms();
        if self.peer_last_heartbeat_time > 0
            && now.saturating_sub(self.peer_last_heartbeat_time) > self.config.heartbeat_timeout_ms
        {
            self.heartbeat_timeout_count += 1;
            self.stats.timeouts += 1;

            if self.heartbeat_timeout_count >= HEARTBEAT_DEAD_COUNT && self.peer_alive {
                self.log("WARN", "peer heartbeat lost, marking peer dead");
                self.peer_alive = false;
                if self.should_takeover() {
                    self.initiate_failover(vm);
                }
            }
        } else {
            self.heartbeat_timeout_count = 0;
            if !self.peer_alive && self.peer_last_heartbeat_time > 0 {
                self.log("INFO", "peer recovered");
                self.peer_alive = true;
            }
        }
    }

    /// Takeover predicate: a secondary whose peer is dead, or silent for
    /// three full timeout windows
    pub fn should_takeover(&self) -> bool {
        if self.role != NodeRole::Secondary {
            return false;
        }
        if !self.peer_alive {
            return true;
        }
        let now = now_ms();
        self.peer_last_heartbeat_time > 0
            && now.saturating_sub(self.peer_last_heartbeat_time)
                > self.config.heartbeat_timeout_ms * HEARTBEAT_DEAD_COUNT as u64
    }

    /// Promote this secondary to primary and flip the VM's sync mode; the
    /// VM resumes dispatching from the last replicated pc
    pub fn initiate_failover(&mut self, vm: &mut Vm) {
        if self.role != NodeRole::Secondary {
            return;
        }
        self.log("WARN", "initiating failover from secondary to primary");
        self.state = NodeState::Takeover;

        self.send_message(SyncPayload::Takeover);
        self.set_role(NodeRole::Primary);
        vm.set_sync_mode(SyncMode::Primary);
        vm.checkpoint_applied();
        self.stats.failovers += 1;

        self.log("INFO", "failover completed");
    }

    fn set_role(&mut self, new_role: NodeRole) {
        let old_role = self.role;
        self.role = new_role;
        self.state = match new_role {
            NodeRole::Primary | NodeRole::Standalone => NodeState::Active,
            NodeRole::Secondary => NodeState::Standby,
        };
        self.log("INFO", &format!("role changed from {} to {}", old_role, new_role));
    }

    // ---- senders ----

    fn send_message(&mut self, payload: SyncPayload) -> bool {
        let message =
            SyncMessage { sequence: self.send_sequence, timestamp: now_ms(), payload };
        let bytes = match encode_message(&message) {
            Ok(bytes) => bytes,
            Err(reason) => {
                self.stats.sync_errors += 1;
                self.set_error(reason);
                return false;
            }
        };
        self.send_sequence = self.send_sequence.wrapping_add(1);

        match self.socket.send_to(&bytes, self.peer_addr.as_str()) {
            Ok(sent) => {
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += sent as u64;
                true
            }
            Err(e) => {
                self.stats.sync_errors += 1;
                self.set_error(format!("send failed: {}", e));
                false
            }
        }
    }

    fn send_heartbeat(&mut self, vm: &mut Vm) {
        let heartbeat = SyncPayload::Heartbeat(HeartbeatMsg {
            role: self.role,
            state: self.state,
            vm_pc: vm.pc(),
            sync_var_count: self.sync_vars.len() as u32,
            uptime_ms: uptime_ms(),
        });
        if self.send_message(heartbeat) {
            self.stats.heartbeats_sent += 1;
        }
        self.last_heartbeat_time = now_ms();
    }

    /// Snapshot every registered variable into one checkpoint message.
    /// Variables past the snapshot byte budget are left to VarSync.
    pub fn send_checkpoint(&mut self, vm: &mut Vm) {
        let mut snapshot = Vec::new();
        let mut included = 0u32;
        for var in &self.sync_vars {
            let value = vm.global(var.vm_index).cloned().unwrap_or(Value::Undefined);
            let mut encoded = Vec::new();
            if encode_value(&mut encoded, &value).is_err() {
                self.stats.sync_errors += 1;
                continue;
            }
            if snapshot.len() + encoded.len() > MAX_SNAPSHOT_BYTES {
                break;
            }
            snapshot.extend_from_slice(&encoded);
            included += 1;
        }

        let checkpoint = SyncPayload::Checkpoint(CheckpointMsg {
            checkpoint_id: self.last_checkpoint_id + 1,
            var_count: included,
            snapshot,
        });
        if self.send_message(checkpoint) {
            self.last_checkpoint_id += 1;
            self.last_checkpoint_time = now_ms();
        }
    }

    fn send_state_sync(&mut self, vm: &mut Vm) {
        let state_sync = SyncPayload::StateSync(StateSyncMsg {
            vm_pc: vm.pc(),
            stack_depth: vm.stack_depth() as u32,
            call_stack_depth: vm.call_depth() as u32,
            node_state: self.state,
        });
        self.send_message(state_sync);
    }

    fn flush_dirty_variables(&mut self, vm: &mut Vm) {
        for i in 0..self.sync_vars.len() {
            if !self.sync_vars[i].dirty {
                continue;
            }
            let var_index = self.sync_vars[i].vm_index;
            let var_type = self.sync_vars[i].tag as u32;
            let value = vm.global(var_index).cloned().unwrap_or(Value::Undefined);
            let update = SyncPayload::VarSync(VarSyncMsg { var_index, var_type, value });
            if self.send_message(update) {
                self.sync_vars[i].dirty = false;
                self.sync_vars[i].last_sync_time = now_ms();
            }
        }
    }

    pub fn shutdown(mut self) {
        self.enabled = false;
        self.state = NodeState::Shutdown;
        self.log("INFO", "sync engine stopped");
    }

    // ---- accessors and diagnostics ----

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn peer_alive(&self) -> bool {
        self.peer_alive
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn sync_var_count(&self) -> usize {
        self.sync_vars.len()
    }

    pub fn last_checkpoint_id(&self) -> u32 {
        self.last_checkpoint_id
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn set_error(&mut self, message: String) {
        self.log("ERROR", &message);
        self.last_error = Some(message);
    }

    fn log(&self, level: &str, message: &str) {
        let tag = match level {
            "WARN" => level.yellow().bold(),
            "ERROR" => level.red().bold(),
            _ => level.cyan(),
        };
        eprintln!("[MS-SYNC] {} {}", tag, message);
    }

    pub fn print_status(&self) {
        println!("=== Sync status ===");
        println!("Role:              {}", self.role);
        println!("State:             {}", self.state);
        println!("Peer alive:        {}", self.peer_alive);
        println!("Sync variables:    {}", self.sync_vars.len());
        println!("Last checkpoint:   {}", self.last_checkpoint_id);
        println!("Messages sent:     {}", self.stats.messages_sent);
        println!("Messages received: {}", self.stats.messages_received);
        println!("Bytes sent:        {}", self.stats.bytes_sent);
        println!("Bytes received:    {}", self.stats.bytes_received);
        println!("Heartbeats:        {} sent, {} received", self.stats.heartbeats_sent, self.stats.heartbeats_received);
        println!("Checksum errors:   {}", self.stats.checksum_errors);
        println!("Timeouts:          {}", self.stats.timeouts);
        println!("Failovers:         {}", self.stats.failovers);
    }
}
