/*
 * This file is part of ktd, a networked, expiration-aware key-value
 * cache server with master/slave replication.
 *
 * Copyright (c) 2024, ktd contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Value framing (§4.D.1): when persistence-option is off every stored
//! value on disk/in the backing store is `xt_be5 || payload`, a 5-byte
//! big-endian unsigned expiration prefix followed by the payload.

/// `2^40 - 1`: the sentinel meaning "no expiration".
pub const XT_MAX: i64 = (1i64 << 40) - 1;
const XT_PREFIX_LEN: usize = 5;

/// Packs `payload` behind an absolute-epoch `xt` prefix, clamped to
/// `[0, XT_MAX]`.
pub fn pack(payload: &[u8], xt: i64) -> Vec<u8> {
    let clamped = xt.clamp(0, XT_MAX) as u64;
    let be = clamped.to_be_bytes();
    let mut out = Vec::with_capacity(XT_PREFIX_LEN + payload.len());
    out.extend_from_slice(&be[3..8]);
    out.extend_from_slice(payload);
    out
}

/// Splits a stored value into `(xt, payload)`. Returns `None` if `stored`
/// is too short to hold a valid prefix — callers should treat this as data
/// corruption (`KtError::Broken`), since the TimedDB invariant guarantees
/// every stored value is at least 5 bytes when persistence-option is off.
pub fn unpack(stored: &[u8]) -> Option<(i64, &[u8])> {
    if stored.len() < XT_PREFIX_LEN {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[3..8].copy_from_slice(&stored[..XT_PREFIX_LEN]);
    Some((u64::from_be_bytes(buf) as i64, &stored[XT_PREFIX_LEN..]))
}

/// `true` once `now` has passed `xt` (and `xt` isn't the no-expiry
/// sentinel).
pub fn is_expired(xt: i64, now: i64) -> bool {
    xt != XT_MAX && now > xt
}

/// Implements the visitor's `newXt` convention: positive is relative to
/// `now`, non-positive is an absolute epoch given by its magnitude. Always
/// clamped to `[0, XT_MAX]`.
pub fn modify_exp_time(new_xt: i64, now: i64) -> i64 {
    let absolute = if new_xt > 0 {
        now.saturating_add(new_xt)
    } else {
        new_xt.unsigned_abs() as i64
    };
    absolute.clamp(0, XT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let packed = pack(b"hello", 1_700_000_000);
        let (xt, payload) = unpack(&packed).unwrap();
        assert_eq!(xt, 1_700_000_000);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn xt_max_means_no_expiry() {
        assert!(!is_expired(XT_MAX, i64::MAX / 2));
    }

    #[test]
    fn expiry_is_strictly_after_xt() {
        assert!(!is_expired(100, 100));
        assert!(is_expired(100, 101));
    }

    #[test]
    fn modify_exp_time_relative_and_absolute() {
        assert_eq!(modify_exp_time(60, 1000), 1060);
        assert_eq!(modify_exp_time(-500, 1000), 500);
        assert_eq!(modify_exp_time(0, 1000), 0);
    }

    #[test]
    fn unpack_rejects_short_values() {
        assert!(unpack(&[1, 2, 3]).is_none());
    }
}
