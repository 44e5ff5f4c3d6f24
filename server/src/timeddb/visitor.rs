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

//! The visitor protocol (§4.D.2): a capability pair invoked under the DB's
//! per-key lock to atomically read-modify-write a record. Rather than the
//! reference implementation's mutable out-parameters, visitors here return
//! a tagged [`VisitResult`] — idiomatic for a language with sum types and
//! no need for writable out-pointers (see DESIGN.md).

/// The outcome of a single visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitResult {
    /// Leave the record unchanged.
    Nop,
    /// Delete the record.
    Remove,
    /// Replace the record's payload. `new_xt` follows the
    /// [`super::value::modify_exp_time`] convention: positive is relative
    /// to now, non-positive is an absolute epoch given by its magnitude.
    Replace(Vec<u8>, i64),
}

/// A capability pair invoked per-key by `TimedDb` iteration/visit
/// operations. `visit_before`/`visit_after` bracket a batch (e.g. one
/// `iterate` call, one bulk operation).
pub trait Visitor {
    fn visit_full(&mut self, key: &[u8], value: &[u8], xt: i64) -> VisitResult;
    fn visit_empty(&mut self, key: &[u8]) -> VisitResult {
        let _ = key;
        VisitResult::Nop
    }
    fn visit_before(&mut self) {}
    fn visit_after(&mut self) {}
}

/// Adapts a pair of closures into a [`Visitor`], for the common case where
/// callers don't need a named type (mirrors how nested local classes used
/// purely as visitors collapse down to closures).
pub struct ClosureVisitor<F, E>
where
    F: FnMut(&[u8], &[u8], i64) -> VisitResult,
    E: FnMut(&[u8]) -> VisitResult,
{
    pub full: F,
    pub empty: E,
}

impl<F, E> Visitor for ClosureVisitor<F, E>
where
    F: FnMut(&[u8], &[u8], i64) -> VisitResult,
    E: FnMut(&[u8]) -> VisitResult,
{
    fn visit_full(&mut self, key: &[u8], value: &[u8], xt: i64) -> VisitResult {
        (self.full)(key, value, xt)
    }
    fn visit_empty(&mut self, key: &[u8]) -> VisitResult {
        (self.empty)(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_visitor_dispatches_to_the_right_closure() {
        let mut v = ClosureVisitor {
            full: |_k: &[u8], _v: &[u8], _xt: i64| VisitResult::Remove,
            empty: |_k: &[u8]| VisitResult::Nop,
        };
        assert_eq!(v.visit_full(b"k", b"v", 0), VisitResult::Remove);
        assert_eq!(v.visit_empty(b"k"), VisitResult::Nop);
    }
}
