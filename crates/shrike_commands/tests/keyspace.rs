//! End-to-end command scenarios: EXPIRE family, TTL sentinels, EXISTS and
//! TYPE dispatch, and lazy-eviction completeness. Records are seeded
//! directly through the store layer, the way the write path would.

use std::sync::Arc;

use tempfile::TempDir;

use shrike_commands::expire::expire_key_if_needed;
use shrike_commands::keys::{
    exists_command, expire_command, expireat_command, pexpire_command, pexpireat_command,
    pttl_command, ttl_command, type_command,
};
use shrike_commands::{ServerEntry, Session};
use shrike_common::config::ShrikeConfig;
use shrike_common::now_millis;
use shrike_storage::{RecordKey, RecordType, RecordValue};

fn open_server(dir: &TempDir) -> Arc<ServerEntry> {
    let cfg = ShrikeConfig::from_toml_str(&format!(
        "[storage]\ndb_path = '{}'\nstore_count = 2\nblock_cache_mb = 4\nmemtable_budget_mb = 4\n",
        dir.path().display()
    ))
    .unwrap();
    ServerEntry::open(&cfg).unwrap()
}

fn command_session(server: &Arc<ServerEntry>, args: &[&[u8]]) -> Session {
    Session::new(
        server.clone(),
        0,
        args.iter().map(|a| a.to_vec()).collect(),
    )
}

/// Write a meta record the way the write path would.
fn seed(server: &Arc<ServerEntry>, rtype: RecordType, key: &[u8], payload: &[u8], ttl: u64) {
    let mgr = server.segment_mgr();
    let chunk_id = mgr.chunk_of(key);
    let store = mgr.store_for_chunk(chunk_id).unwrap();
    let rk = RecordKey::new(chunk_id, 0, rtype, key.to_vec(), b"".to_vec());
    let mut txn = store.create_transaction().unwrap();
    store.set_kv(&rk, &RecordValue::new(payload.to_vec(), ttl), &mut txn);
    txn.commit().unwrap();
}

/// Write one element record of a composite container.
fn seed_element(
    server: &Arc<ServerEntry>,
    element_kind: RecordType,
    key: &[u8],
    field: &[u8],
    payload: &[u8],
) {
    let mgr = server.segment_mgr();
    let chunk_id = mgr.chunk_of(key);
    let store = mgr.store_for_chunk(chunk_id).unwrap();
    let rk = RecordKey::new(chunk_id, 0, element_kind, key.to_vec(), field.to_vec());
    let mut txn = store.create_transaction().unwrap();
    store.set_kv(&rk, &RecordValue::new(payload.to_vec(), 0), &mut txn);
    txn.commit().unwrap();
}

/// Raw store read, bypassing the expiration protocol.
fn probe_raw(
    server: &Arc<ServerEntry>,
    rtype: RecordType,
    key: &[u8],
    field: &[u8],
) -> Option<RecordValue> {
    let mgr = server.segment_mgr();
    let chunk_id = mgr.chunk_of(key);
    let store = mgr.store_for_chunk(chunk_id).unwrap();
    let rk = RecordKey::new(chunk_id, 0, rtype, key.to_vec(), field.to_vec());
    let txn = store.create_transaction().unwrap();
    store.get_kv(&rk, &txn).ok()
}

fn int_reply(raw: &[u8]) -> i64 {
    assert_eq!(raw[0], b':');
    assert_eq!(&raw[raw.len() - 2..], b"\r\n");
    std::str::from_utf8(&raw[1..raw.len() - 2])
        .unwrap()
        .parse()
        .unwrap()
}

#[test]
fn expire_in_future_sets_ttl() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::Kv, b"k", b"v", 0);

    let reply = expire_command(&command_session(&server, &[b"expire", b"k", b"10"])).unwrap();
    assert_eq!(reply, b":1\r\n");

    let reply = pttl_command(&command_session(&server, &[b"pttl", b"k"])).unwrap();
    let remaining = int_reply(&reply);
    assert!(remaining > 0 && remaining <= 10_000, "remaining = {remaining}");

    let reply = ttl_command(&command_session(&server, &[b"ttl", b"k"])).unwrap();
    let remaining = int_reply(&reply);
    assert!((0..=10).contains(&remaining));

    // The stored record carries the absolute deadline.
    let stored = probe_raw(&server, RecordType::Kv, b"k", b"").unwrap();
    assert!(stored.ttl_millis > now_millis());
    assert_eq!(stored.payload, b"v");
}

#[test]
fn expireat_in_past_deletes_key() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::Kv, b"k", b"v", 0);

    let reply = expireat_command(&command_session(&server, &[b"expireat", b"k", b"1"])).unwrap();
    assert_eq!(reply, b":1\r\n");

    let reply = exists_command(&command_session(&server, &[b"exists", b"k"])).unwrap();
    assert_eq!(reply, b":0\r\n");

    let reply = ttl_command(&command_session(&server, &[b"ttl", b"k"])).unwrap();
    assert_eq!(int_reply(&reply), -2);

    assert!(probe_raw(&server, RecordType::Kv, b"k", b"").is_none());
}

#[test]
fn negative_expire_deletes_key() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::Kv, b"k", b"v", 0);

    let reply = expire_command(&command_session(&server, &[b"expire", b"k", b"-1"])).unwrap();
    assert_eq!(reply, b":1\r\n");
    assert!(probe_raw(&server, RecordType::Kv, b"k", b"").is_none());
}

#[test]
fn expire_missing_key_returns_zero() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);

    let reply = expire_command(&command_session(&server, &[b"expire", b"ghost", b"10"])).unwrap();
    assert_eq!(reply, b":0\r\n");
    let reply = expireat_command(&command_session(&server, &[b"expireat", b"ghost", b"1"])).unwrap();
    assert_eq!(reply, b":0\r\n");
    let reply = exists_command(&command_session(&server, &[b"exists", b"ghost"])).unwrap();
    assert_eq!(reply, b":0\r\n");
}

#[test]
fn pexpire_sets_millisecond_deadline() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::Kv, b"k", b"v", 0);

    let reply = pexpire_command(&command_session(&server, &[b"pexpire", b"k", b"5000"])).unwrap();
    assert_eq!(reply, b":1\r\n");

    let reply = pttl_command(&command_session(&server, &[b"pttl", b"k"])).unwrap();
    let remaining = int_reply(&reply);
    assert!(remaining > 0 && remaining <= 5_000);
}

#[test]
fn pexpireat_absolute_millis() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::SetMeta, b"s", b"", 0);

    let deadline = (now_millis() + 60_000).to_string();
    let reply = pexpireat_command(&command_session(
        &server,
        &[b"pexpireat", b"s", deadline.as_bytes()],
    ))
    .unwrap();
    assert_eq!(reply, b":1\r\n");

    let stored = probe_raw(&server, RecordType::SetMeta, b"s", b"").unwrap();
    assert_eq!(stored.ttl_millis, deadline.parse::<u64>().unwrap());
}

#[test]
fn ttl_sentinels() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);

    // No TTL set → -1.
    seed(&server, RecordType::Kv, b"plain", b"v", 0);
    let reply = ttl_command(&command_session(&server, &[b"ttl", b"plain"])).unwrap();
    assert_eq!(int_reply(&reply), -1);
    let reply = pttl_command(&command_session(&server, &[b"pttl", b"plain"])).unwrap();
    assert_eq!(int_reply(&reply), -1);

    // Missing key → -2.
    let reply = ttl_command(&command_session(&server, &[b"ttl", b"missing"])).unwrap();
    assert_eq!(int_reply(&reply), -2);
}

#[test]
fn ttl_probe_evicts_expired_key() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::Kv, b"stale", b"v", 1);

    let reply = ttl_command(&command_session(&server, &[b"ttl", b"stale"])).unwrap();
    assert_eq!(int_reply(&reply), -2);
    // The probe deleted the record on its way through.
    assert!(probe_raw(&server, RecordType::Kv, b"stale", b"").is_none());
}

#[test]
fn type_disambiguates_and_follows_expiry() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::HashMeta, b"h", b"", 0);
    seed_element(&server, RecordType::HashEle, b"h", b"f1", b"v1");

    let reply = type_command(&command_session(&server, &[b"type", b"h"])).unwrap();
    assert_eq!(reply, b"$4\r\nhash\r\n");

    let reply = pexpireat_command(&command_session(&server, &[b"pexpireat", b"h", b"1"])).unwrap();
    assert_eq!(reply, b":1\r\n");

    let reply = type_command(&command_session(&server, &[b"type", b"h"])).unwrap();
    assert_eq!(reply, b"$4\r\nnone\r\n");
}

#[test]
fn type_names_per_kind() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    let cases: [(RecordType, &[u8], &[u8]); 5] = [
        (RecordType::Kv, b"ks", b"$6\r\nstring\r\n"),
        (RecordType::ListMeta, b"kl", b"$4\r\nlist\r\n"),
        (RecordType::HashMeta, b"kh", b"$4\r\nhash\r\n"),
        (RecordType::SetMeta, b"kset", b"$3\r\nset\r\n"),
        (RecordType::ZsetMeta, b"kz", b"$4\r\nzset\r\n"),
    ];
    for (rtype, key, want) in cases {
        seed(&server, rtype, key, b"", 0);
        let reply = type_command(&command_session(&server, &[b"type", key])).unwrap();
        assert_eq!(reply, want.to_vec());
    }
}

#[test]
fn exists_probes_every_type() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::ZsetMeta, b"z", b"", 0);

    let reply = exists_command(&command_session(&server, &[b"exists", b"z"])).unwrap();
    assert_eq!(reply, b":1\r\n");
}

#[test]
fn lazy_eviction_removes_subordinate_records() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);

    // A hash that expired in the past, with fields still on disk.
    seed(&server, RecordType::HashMeta, b"h", b"", 1);
    seed_element(&server, RecordType::HashEle, b"h", b"f1", b"v1");
    seed_element(&server, RecordType::HashEle, b"h", b"f2", b"v2");
    // An unrelated hash that must survive.
    seed(&server, RecordType::HashMeta, b"hx", b"", 0);
    seed_element(&server, RecordType::HashEle, b"hx", b"f1", b"keep");

    let sess = command_session(&server, &[]);
    let err = expire_key_if_needed(&sess, b"h", RecordType::HashMeta).unwrap_err();
    assert!(err.is_expired());

    assert!(probe_raw(&server, RecordType::HashMeta, b"h", b"").is_none());
    assert!(probe_raw(&server, RecordType::HashEle, b"h", b"f1").is_none());
    assert!(probe_raw(&server, RecordType::HashEle, b"h", b"f2").is_none());

    // A second probe sees a plainly missing key.
    let err = expire_key_if_needed(&sess, b"h", RecordType::HashMeta).unwrap_err();
    assert!(err.is_not_found());

    // The neighbour is untouched.
    assert!(probe_raw(&server, RecordType::HashMeta, b"hx", b"").is_some());
    assert!(probe_raw(&server, RecordType::HashEle, b"hx", b"f1").is_some());
}

#[test]
fn expire_rewrite_then_delete() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);
    seed(&server, RecordType::ListMeta, b"l", b"", 0);
    seed_element(&server, RecordType::ListEle, b"l", b"0", b"head");

    let reply = expire_command(&command_session(&server, &[b"expire", b"l", b"100"])).unwrap();
    assert_eq!(reply, b":1\r\n");
    let reply = ttl_command(&command_session(&server, &[b"ttl", b"l"])).unwrap();
    assert!(int_reply(&reply) > 0);

    // Re-expiring with a past deadline removes list and elements.
    let reply = expire_command(&command_session(&server, &[b"expire", b"l", b"-5"])).unwrap();
    assert_eq!(reply, b":1\r\n");
    assert!(probe_raw(&server, RecordType::ListMeta, b"l", b"").is_none());
    assert!(probe_raw(&server, RecordType::ListEle, b"l", b"0").is_none());
}

#[test]
fn malformed_arguments_rejected() {
    let dir = TempDir::new().unwrap();
    let server = open_server(&dir);

    let err = expire_command(&command_session(&server, &[b"expire", b"k", b"abc"])).unwrap_err();
    assert!(err.to_string().contains("not an integer"));

    let err = expire_command(&command_session(&server, &[b"expire"])).unwrap_err();
    assert!(err.to_string().contains("wrong number of arguments"));
}
