//! The key-expiration protocol.
//!
//! TTLs live on the meta record of each key. Expired keys are evicted
//! lazily: every probe checks the deadline and, when past due, deletes the
//! meta record and all subordinate element records in one transaction
//! before reporting `Expired`. TTL rewrites and evictions run under the
//! exclusive key lock and reapply on optimistic commit conflicts, up to
//! `RETRY_CNT` attempts.

use std::sync::Arc;

use shrike_common::{now_millis, ShrikeError, ShrikeResult};
use shrike_storage::{KVStore, RecordKey, RecordType, RecordValue, Transaction};

use crate::segment::LockMode;
use crate::session::Session;

/// Attempts for the `(open, work, commit)` loop before a conflict surfaces.
pub const RETRY_CNT: u32 = 3;

/// What to do with the transaction after the work closure ran.
pub(crate) enum TxnOutcome<T> {
    /// Commit the write set; reapply on `CommitRetry`.
    Commit(T),
    /// Discard the transaction and return immediately.
    Abort(T),
}

/// Run `body` inside a fresh transaction, committing its write set and
/// reapplying on optimistic conflicts. Both the TTL rewrite and lazy
/// eviction funnel through here.
pub(crate) fn exec_with_retry<T>(
    store: &Arc<KVStore>,
    mut body: impl FnMut(&mut Transaction) -> ShrikeResult<TxnOutcome<T>>,
) -> ShrikeResult<T> {
    let mut attempt = 0;
    loop {
        let mut txn = store.create_transaction()?;
        match body(&mut txn)? {
            TxnOutcome::Abort(value) => {
                txn.rollback();
                return Ok(value);
            }
            TxnOutcome::Commit(value) => match txn.commit() {
                Ok(_) => return Ok(value),
                Err(e) if e.is_commit_retry() => {
                    attempt += 1;
                    if attempt == RETRY_CNT {
                        tracing::warn!(store = store.id(), "commit retries exhausted");
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            },
        }
    }
}

enum ProbeOutcome {
    Evicted,
    Gone,
    Live(RecordValue),
}

/// Read-path probe: fetch the meta record of `(db, type, key)` and decide
/// whether the key is live.
///
/// Returns the value when live, `NotFound` when absent, and `Expired` after
/// synchronously evicting a past-due key together with its element records.
pub fn expire_key_if_needed(
    sess: &Session,
    key: &[u8],
    rtype: RecordType,
) -> ShrikeResult<RecordValue> {
    debug_assert!(rtype.is_meta_kind());
    let mgr = sess.server().segment_mgr();

    // Probe under the shared lock; only eviction takes the writer side.
    let value = {
        let db = mgr.get_db_with_key_lock(sess, key, LockMode::Shared)?;
        let rk = RecordKey::new(db.chunk_id, sess.ctx.db_id, rtype, key, b"");
        let txn = db.store.create_transaction()?;
        db.store.get_kv(&rk, &txn)?
    };
    if !value.is_expired_at(now_millis()) {
        return Ok(value);
    }

    // Past due. Re-acquire exclusively and re-validate: the record may have
    // been rewritten or already evicted while the lock was released.
    let db = mgr.get_db_with_key_lock(sess, key, LockMode::Exclusive)?;
    let rk = RecordKey::new(db.chunk_id, sess.ctx.db_id, rtype, key, b"");
    let outcome = exec_with_retry(&db.store, |txn| {
        let value = match db.store.get_kv(&rk, txn) {
            Ok(value) => value,
            Err(e) if e.is_not_found() => return Ok(TxnOutcome::Abort(ProbeOutcome::Gone)),
            Err(e) => return Err(e),
        };
        if !value.is_expired_at(now_millis()) {
            return Ok(TxnOutcome::Abort(ProbeOutcome::Live(value)));
        }
        delete_record_tree(&db.store, txn, &rk, rtype)?;
        Ok(TxnOutcome::Commit(ProbeOutcome::Evicted))
    })?;

    match outcome {
        ProbeOutcome::Evicted => {
            tracing::debug!(
                key = %String::from_utf8_lossy(key),
                db = sess.ctx.db_id,
                "evicted expired key"
            );
            Err(ShrikeError::Expired)
        }
        ProbeOutcome::Gone => Err(ShrikeError::NotFound),
        ProbeOutcome::Live(value) => Ok(value),
    }
}

/// Rewrite the TTL of a live key to a future deadline.
///
/// Returns `false` without error when the key was absent, already expired,
/// or disappeared between the probe and the rewrite.
pub fn expire_after_now(
    sess: &Session,
    rtype: RecordType,
    key: &[u8],
    expire_at: u64,
) -> ShrikeResult<bool> {
    match expire_key_if_needed(sess, key, rtype) {
        Ok(_) => {}
        Err(e) if e.is_absent() => return Ok(false),
        Err(e) => return Err(e),
    }

    let db = sess
        .server()
        .segment_mgr()
        .get_db_with_key_lock(sess, key, LockMode::Exclusive)?;
    let rk = RecordKey::new(db.chunk_id, sess.ctx.db_id, rtype, key, b"");
    exec_with_retry(&db.store, |txn| {
        let mut value = match db.store.get_kv(&rk, txn) {
            Ok(value) => value,
            // Lost a race with a concurrent eviction.
            Err(e) if e.is_not_found() => return Ok(TxnOutcome::Abort(false)),
            Err(e) => return Err(e),
        };
        value.set_ttl(expire_at);
        db.store.set_kv(&rk, &value, txn);
        Ok(TxnOutcome::Commit(true))
    })
}

/// Delete a key whose new deadline is already in the past. Returns `true`
/// iff a live record (and its element records) was removed.
pub fn expire_before_now(sess: &Session, rtype: RecordType, key: &[u8]) -> ShrikeResult<bool> {
    match expire_key_if_needed(sess, key, rtype) {
        Ok(_) => del_key(sess, key, rtype),
        Err(e) if e.is_absent() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete the meta record and every subordinate element record in one
/// transaction. Returns `true` iff the meta record existed.
pub fn del_key(sess: &Session, key: &[u8], rtype: RecordType) -> ShrikeResult<bool> {
    let db = sess
        .server()
        .segment_mgr()
        .get_db_with_key_lock(sess, key, LockMode::Exclusive)?;
    let rk = RecordKey::new(db.chunk_id, sess.ctx.db_id, rtype, key, b"");
    exec_with_retry(&db.store, |txn| {
        match db.store.get_kv(&rk, txn) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(TxnOutcome::Abort(false)),
            Err(e) => return Err(e),
        }
        delete_record_tree(&db.store, txn, &rk, rtype)?;
        Ok(TxnOutcome::Commit(true))
    })
}

/// Buffer deletes for the meta record plus, for composite types, every
/// element record under the container's prefix.
fn delete_record_tree(
    store: &KVStore,
    txn: &mut Transaction,
    meta: &RecordKey,
    rtype: RecordType,
) -> ShrikeResult<()> {
    store.del_kv(meta, txn);
    let Some(element_kind) = rtype.element_kind() else {
        return Ok(());
    };
    let prefix = RecordKey::new(
        meta.chunk_id,
        meta.db_id,
        element_kind,
        meta.primary_key.clone(),
        b"",
    )
    .prefix();

    let mut doomed = Vec::new();
    {
        let mut cursor = txn.cursor()?;
        cursor.seek(&prefix);
        while let Some((encoded, _)) = cursor.next() {
            if !encoded.starts_with(&prefix) {
                break;
            }
            doomed.push(encoded);
        }
    }
    for encoded in doomed {
        txn.delete(encoded);
    }
    Ok(())
}
