//! Deterministic envelope encoding for signing.
//!
//! Both the agent and the bus must produce bit-identical bytes for the same
//! envelope, so this module avoids protobuf serialization entirely: protobuf
//! map fields carry no ordering guarantee. Instead every field is written
//! explicitly with fixed-width big-endian integers, length-prefixed strings,
//! and attributes sorted by key bytes. The signature field is omitted.

use amoskys_protos::amoskys::v1::{
  envelope::Payload, AuditEvent, Envelope, FlowEvent, MetricEvent, ProcessEvent, SecurityEvent,
};

// Payload discriminants reuse the proto field numbers so the two schemas
// cannot drift apart silently.
const TAG_FLOW: u8 = 5;
const TAG_PROCESS: u8 = 6;
const TAG_SECURITY: u8 = 7;
const TAG_AUDIT: u8 = 8;
const TAG_METRIC: u8 = 9;

/// Produce the canonical byte encoding of an envelope minus its signature.
pub fn canonical_bytes(envelope: &Envelope) -> Vec<u8> {
  let mut buf = Vec::with_capacity(128);

  put_u32(&mut buf, envelope.version);
  put_str(&mut buf, &envelope.source_agent_id);
  put_str(&mut buf, &envelope.event_id);
  put_i64(&mut buf, envelope.timestamp_ns);

  match &envelope.payload {
    Some(Payload::FlowEvent(e)) => {
      buf.push(TAG_FLOW);
      put_flow(&mut buf, e);
    }
    Some(Payload::ProcessEvent(e)) => {
      buf.push(TAG_PROCESS);
      put_process(&mut buf, e);
    }
    Some(Payload::SecurityEvent(e)) => {
      buf.push(TAG_SECURITY);
      put_security(&mut buf, e);
    }
    Some(Payload::AuditEvent(e)) => {
      buf.push(TAG_AUDIT);
      put_audit(&mut buf, e);
    }
    Some(Payload::MetricEvent(e)) => {
      buf.push(TAG_METRIC);
      put_metric(&mut buf, e);
    }
    None => buf.push(0),
  }

  let mut keys: Vec<&String> = envelope.attributes.keys().collect();
  keys.sort_unstable();
  put_u32(&mut buf, keys.len() as u32);
  for key in keys {
    put_str(&mut buf, key);
    put_str(&mut buf, &envelope.attributes[key]);
  }

  buf
}

fn put_flow(buf: &mut Vec<u8>, e: &FlowEvent) {
  put_str(buf, &e.src_ip);
  put_u32(buf, e.src_port);
  put_str(buf, &e.dst_ip);
  put_u32(buf, e.dst_port);
  put_str(buf, &e.protocol);
  put_u64(buf, e.bytes_sent);
  put_u64(buf, e.bytes_received);
}

fn put_process(buf: &mut Vec<u8>, e: &ProcessEvent) {
  put_i64(buf, e.pid);
  put_i64(buf, e.parent_pid);
  put_str(buf, &e.executable_path);
  put_str(buf, &e.command_line);
  put_str(buf, &e.user);
}

fn put_security(buf: &mut Vec<u8>, e: &SecurityEvent) {
  put_u32(buf, e.auth_type as u32);
  put_u32(buf, e.result as u32);
  put_str(buf, &e.user);
  put_str(buf, &e.source_ip);
  put_str(buf, &e.sudo_command);
}

fn put_audit(buf: &mut Vec<u8>, e: &AuditEvent) {
  put_u32(buf, e.action as u32);
  put_u32(buf, e.object_type as u32);
  put_str(buf, &e.path);
}

fn put_metric(buf: &mut Vec<u8>, e: &MetricEvent) {
  put_str(buf, &e.name);
  buf.extend_from_slice(&e.value.to_bits().to_be_bytes());
  put_str(buf, &e.unit);
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
  buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
  buf.extend_from_slice(&v.to_be_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
  buf.extend_from_slice(&v.to_be_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
  put_u32(buf, s.len() as u32);
  buf.extend_from_slice(s.as_bytes());
}
