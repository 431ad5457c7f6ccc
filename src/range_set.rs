//! # Range Sets
//!
//! Normalized sets of intervals over orderable literals (int, real, char,
//! string). The extent analyzer intersects range sets under `andalso` and
//! unions them under `orelse` before falling back to collection combinators;
//! extent expressions carry a range set that bounds the universal extent of
//! their element type.
//!
//! A range set is kept normalized: ranges are non-empty, sorted by lower
//! bound, and pairwise disjoint and non-touching.

use std::cmp::Ordering;
use std::fmt;

use crate::ir::Literal;

/// One endpoint of a range
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Bound {
    /// Negative infinity for lower bounds, positive infinity for upper bounds
    Unbounded,
    Inclusive(Literal),
    Exclusive(Literal),
}

impl Bound {
    fn literal(&self) -> Option<&Literal> {
        match self {
            Bound::Unbounded => None,
            Bound::Inclusive(l) | Bound::Exclusive(l) => Some(l),
        }
    }
}

/// A single interval
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Range {
    pub lo: Bound,
    pub hi: Bound,
}

impl Range {
    /// True when the interval contains at least one point.
    ///
    /// `lo > hi` is empty; `lo = hi` requires both endpoints inclusive.
    fn is_non_empty(&self) -> bool {
        match (self.lo.literal(), self.hi.literal()) {
            (Some(a), Some(b)) => match cmp_lit(a, b) {
                Ordering::Less => true,
                Ordering::Equal => {
                    matches!(self.lo, Bound::Inclusive(_)) && matches!(self.hi, Bound::Inclusive(_))
                }
                Ordering::Greater => false,
            },
            _ => true,
        }
    }

    fn is_bounded(&self) -> bool {
        self.lo != Bound::Unbounded && self.hi != Bound::Unbounded
    }
}

/// Literals inside one range set are homogeneous; a cross-kind comparison is
/// an upstream type error and collapses to `Equal` rather than panicking.
fn cmp_lit(a: &Literal, b: &Literal) -> Ordering {
    a.compare(b).unwrap_or(Ordering::Equal)
}

/// Compare two lower bounds: which one starts earlier
fn cmp_lo(a: &Bound, b: &Bound) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Inclusive(x), Bound::Inclusive(y)) | (Bound::Exclusive(x), Bound::Exclusive(y)) => {
            cmp_lit(x, y)
        }
        (Bound::Inclusive(x), Bound::Exclusive(y)) => cmp_lit(x, y).then(Ordering::Less),
        (Bound::Exclusive(x), Bound::Inclusive(y)) => cmp_lit(x, y).then(Ordering::Greater),
    }
}

/// Compare two upper bounds: which one ends later
fn cmp_hi(a: &Bound, b: &Bound) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Inclusive(x), Bound::Inclusive(y)) | (Bound::Exclusive(x), Bound::Exclusive(y)) => {
            cmp_lit(x, y)
        }
        (Bound::Inclusive(x), Bound::Exclusive(y)) => cmp_lit(x, y).then(Ordering::Greater),
        (Bound::Exclusive(x), Bound::Inclusive(y)) => cmp_lit(x, y).then(Ordering::Less),
    }
}

/// True when range `b` starts no later than where range `a` ends, i.e. the
/// two ranges overlap or touch without a gap.
fn connects(a_hi: &Bound, b_lo: &Bound) -> bool {
    match (a_hi, b_lo) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        _ => match (a_hi.literal(), b_lo.literal()) {
            (Some(x), Some(y)) => match cmp_lit(x, y) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => {
                    // [.., v] (v, ..] touches; (.., v) (v, ..] leaves a gap at v
                    matches!(a_hi, Bound::Inclusive(_)) || matches!(b_lo, Bound::Inclusive(_))
                }
            },
            _ => true,
        },
    }
}

/// A normalized set of disjoint intervals
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    /// The full line `(-inf, +inf)`
    pub fn full() -> RangeSet {
        RangeSet {
            ranges: vec![Range {
                lo: Bound::Unbounded,
                hi: Bound::Unbounded,
            }],
        }
    }

    /// The empty set
    pub fn empty() -> RangeSet {
        RangeSet { ranges: Vec::new() }
    }

    /// The single point `{v}`
    pub fn point(v: Literal) -> RangeSet {
        RangeSet {
            ranges: vec![Range {
                lo: Bound::Inclusive(v.clone()),
                hi: Bound::Inclusive(v),
            }],
        }
    }

    /// Everything except the point `{v}`
    pub fn except(v: Literal) -> RangeSet {
        RangeSet {
            ranges: vec![
                Range {
                    lo: Bound::Unbounded,
                    hi: Bound::Exclusive(v.clone()),
                },
                Range {
                    lo: Bound::Exclusive(v),
                    hi: Bound::Unbounded,
                },
            ],
        }
    }

    /// `[v, +inf)` or `(v, +inf)`
    pub fn at_least(v: Literal, strict: bool) -> RangeSet {
        RangeSet {
            ranges: vec![Range {
                lo: if strict {
                    Bound::Exclusive(v)
                } else {
                    Bound::Inclusive(v)
                },
                hi: Bound::Unbounded,
            }],
        }
    }

    /// `(-inf, v]` or `(-inf, v)`
    pub fn at_most(v: Literal, strict: bool) -> RangeSet {
        RangeSet {
            ranges: vec![Range {
                lo: Bound::Unbounded,
                hi: if strict {
                    Bound::Exclusive(v)
                } else {
                    Bound::Inclusive(v)
                },
            }],
        }
    }

    /// The ranges, in order
    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ranges.len() == 1
            && self.ranges[0].lo == Bound::Unbounded
            && self.ranges[0].hi == Bound::Unbounded
    }

    /// True when every range has both endpoints.
    ///
    /// A bounded range set over an infinite type still yields a FINITE extent
    /// (int: enumerable; the analyzer only produces bounded sets it can
    /// enumerate).
    pub fn is_bounded(&self) -> bool {
        self.ranges.iter().all(Range::is_bounded)
    }

    /// True when the set contains the literal
    pub fn contains(&self, v: &Literal) -> bool {
        self.ranges.iter().any(|r| {
            let above_lo = match &r.lo {
                Bound::Unbounded => true,
                Bound::Inclusive(l) => cmp_lit(l, v) != Ordering::Greater,
                Bound::Exclusive(l) => cmp_lit(l, v) == Ordering::Less,
            };
            let below_hi = match &r.hi {
                Bound::Unbounded => true,
                Bound::Inclusive(l) => cmp_lit(v, l) != Ordering::Greater,
                Bound::Exclusive(l) => cmp_lit(v, l) == Ordering::Less,
            };
            above_lo && below_hi
        })
    }

    /// Set intersection
    pub fn intersect(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                let lo = if cmp_lo(&a.lo, &b.lo) == Ordering::Less {
                    b.lo.clone()
                } else {
                    a.lo.clone()
                };
                let hi = if cmp_hi(&a.hi, &b.hi) == Ordering::Greater {
                    b.hi.clone()
                } else {
                    a.hi.clone()
                };
                let r = Range { lo, hi };
                if r.is_non_empty() {
                    out.push(r);
                }
            }
        }
        RangeSet::normalize(out)
    }

    /// Set union
    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut all = self.ranges.clone();
        all.extend(other.ranges.iter().cloned());
        RangeSet::normalize(all)
    }

    fn normalize(mut ranges: Vec<Range>) -> RangeSet {
        ranges.retain(Range::is_non_empty);
        ranges.sort_by(|a, b| cmp_lo(&a.lo, &b.lo));
        let mut out: Vec<Range> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match out.last_mut() {
                Some(prev) if connects(&prev.hi, &r.lo) => {
                    if cmp_hi(&r.hi, &prev.hi) == Ordering::Greater {
                        prev.hi = r.hi;
                    }
                }
                _ => out.push(r),
            }
        }
        RangeSet { ranges: out }
    }

    /// Inclusive integer bounds when the set is a single bounded int range.
    ///
    /// Strict endpoints are tightened by one, so `(2, 7)` becomes `(3, 6)`.
    /// The range may come out inverted (`lo > hi`), which callers turn into
    /// an empty generator rather than an error.
    pub fn single_int_bounds(&self) -> Option<(i64, i64)> {
        if self.ranges.len() != 1 {
            return None;
        }
        let r = &self.ranges[0];
        let lo = match &r.lo {
            Bound::Inclusive(Literal::Int(v)) => *v,
            Bound::Exclusive(Literal::Int(v)) => v + 1,
            _ => return None,
        };
        let hi = match &r.hi {
            Bound::Inclusive(Literal::Int(v)) => *v,
            Bound::Exclusive(Literal::Int(v)) => v - 1,
            _ => return None,
        };
        Some((lo, hi))
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "{{}}");
        }
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, " u ")?;
            }
            match &r.lo {
                Bound::Unbounded => write!(f, "(-inf")?,
                Bound::Inclusive(l) => write!(f, "[{l}")?,
                Bound::Exclusive(l) => write!(f, "({l}")?,
            }
            write!(f, ", ")?;
            match &r.hi {
                Bound::Unbounded => write!(f, "+inf)")?,
                Bound::Inclusive(l) => write!(f, "{l}]")?,
                Bound::Exclusive(l) => write!(f, "{l})")?,
            }
        }
        Ok(())
    }
}
