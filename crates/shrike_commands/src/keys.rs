//! Key-typed commands: EXPIRE/PEXPIRE/EXPIREAT/PEXPIREAT, TTL/PTTL,
//! EXISTS and TYPE.
//!
//! These commands do not know which type a key lives under, so they probe
//! each meta kind in a fixed order and aggregate. The model keeps a user
//! key under at most one type; the probe returns the first live hit.

use shrike_common::{now_millis, ShrikeResult};
use shrike_storage::RecordType;

use crate::expire::{expire_after_now, expire_before_now, expire_key_if_needed};
use crate::reply::{fmt_bulk, fmt_longlong, fmt_one, fmt_zero};
use crate::session::Session;

/// Apply a deadline to `key` across all type namespaces: future deadlines
/// rewrite the TTL, past deadlines delete the key outright. Replies `:1` if
/// at least one type probe applied the change.
pub fn expire_generic(sess: &Session, expire_at: u64, key: &[u8]) -> ShrikeResult<Vec<u8>> {
    let mut applied = false;
    if expire_at >= now_millis() {
        for rtype in RecordType::META_KINDS {
            applied |= expire_after_now(sess, rtype, key, expire_at)?;
        }
    } else {
        for rtype in RecordType::META_KINDS {
            applied |= expire_before_now(sess, rtype, key)?;
        }
    }
    Ok(if applied { fmt_one() } else { fmt_zero() })
}

/// Deadline from `args[2]`, in milliseconds, clamped at 0. Relative forms
/// add to the current clock; negative arguments land in the past and take
/// the delete path.
fn deadline_from_args(sess: &Session, unit_ms: i64, absolute: bool) -> ShrikeResult<(Vec<u8>, u64)> {
    let key = sess.arg(1)?.to_vec();
    let n = sess.arg_i64(2)?;
    let offset = n.saturating_mul(unit_ms);
    let deadline = if absolute {
        offset
    } else {
        (now_millis() as i64).saturating_add(offset)
    };
    Ok((key, deadline.max(0) as u64))
}

/// `EXPIRE key seconds`
pub fn expire_command(sess: &Session) -> ShrikeResult<Vec<u8>> {
    let (key, deadline) = deadline_from_args(sess, 1000, false)?;
    expire_generic(sess, deadline, &key)
}

/// `PEXPIRE key millis`
pub fn pexpire_command(sess: &Session) -> ShrikeResult<Vec<u8>> {
    let (key, deadline) = deadline_from_args(sess, 1, false)?;
    expire_generic(sess, deadline, &key)
}

/// `EXPIREAT key unix-seconds`
pub fn expireat_command(sess: &Session) -> ShrikeResult<Vec<u8>> {
    let (key, deadline) = deadline_from_args(sess, 1000, true)?;
    expire_generic(sess, deadline, &key)
}

/// `PEXPIREAT key unix-millis`
pub fn pexpireat_command(sess: &Session) -> ShrikeResult<Vec<u8>> {
    let (key, deadline) = deadline_from_args(sess, 1, true)?;
    expire_generic(sess, deadline, &key)
}

/// Shared body of TTL and PTTL: remaining time of the first live type probe,
/// `-1` for no TTL, `-2` for a missing key.
pub fn ttl_generic(sess: &Session, in_millis: bool) -> ShrikeResult<Vec<u8>> {
    let key = sess.arg(1)?.to_vec();
    for rtype in RecordType::META_KINDS {
        let value = match expire_key_if_needed(sess, &key, rtype) {
            Ok(value) => value,
            Err(e) if e.is_absent() => continue,
            Err(e) => return Err(e),
        };
        if value.ttl_millis == 0 {
            return Ok(fmt_longlong(-1));
        }
        let mut ms = value.ttl_millis as i64 - now_millis() as i64;
        if ms < 0 {
            // The key slipped past its deadline since the probe but has not
            // been evicted yet; report it as barely alive.
            ms = 1;
        }
        return Ok(fmt_longlong(if in_millis { ms } else { ms / 1000 }));
    }
    Ok(fmt_longlong(-2))
}

/// `TTL key`
pub fn ttl_command(sess: &Session) -> ShrikeResult<Vec<u8>> {
    ttl_generic(sess, false)
}

/// `PTTL key`
pub fn pttl_command(sess: &Session) -> ShrikeResult<Vec<u8>> {
    ttl_generic(sess, true)
}

/// `EXISTS key`
pub fn exists_command(sess: &Session) -> ShrikeResult<Vec<u8>> {
    let key = sess.arg(1)?.to_vec();
    for rtype in RecordType::META_KINDS {
        match expire_key_if_needed(sess, &key, rtype) {
            Ok(_) => return Ok(fmt_one()),
            Err(e) if e.is_absent() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(fmt_zero())
}

/// `TYPE key`
pub fn type_command(sess: &Session) -> ShrikeResult<Vec<u8>> {
    const TYPE_NAMES: [(RecordType, &[u8]); 5] = [
        (RecordType::Kv, b"string"),
        (RecordType::ListMeta, b"list"),
        (RecordType::HashMeta, b"hash"),
        (RecordType::SetMeta, b"set"),
        (RecordType::ZsetMeta, b"zset"),
    ];
    let key = sess.arg(1)?.to_vec();
    for (rtype, name) in TYPE_NAMES {
        match expire_key_if_needed(sess, &key, rtype) {
            Ok(_) => return Ok(fmt_bulk(name)),
            Err(e) if e.is_absent() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(fmt_bulk(b"none"))
}
