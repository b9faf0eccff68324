//! Wire-protocol reply fragments. The command layer hands these back to the
//! front-end verbatim, so the byte shapes are fixed.

/// `:1\r\n`
pub fn fmt_one() -> Vec<u8> {
    b":1\r\n".to_vec()
}

/// `:0\r\n`
pub fn fmt_zero() -> Vec<u8> {
    b":0\r\n".to_vec()
}

/// `:<v>\r\n`
pub fn fmt_longlong(v: i64) -> Vec<u8> {
    format!(":{v}\r\n").into_bytes()
}

/// `$<len>\r\n<data>\r\n`
pub fn fmt_bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}
