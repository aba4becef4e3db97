//! The eight-point signed-interval lattice and named constraints over it.
//!
//! The operation tables here are load-bearing: inference decides whether a
//! block lies on an error path by meeting a branch constraint against a
//! function's error interval, and the missing-check detector decides whether
//! a comparison is sufficient with `covers`.

use std::fmt;
use std::str::FromStr;

use derive_more::Display;

use super::ir::{Loc, Predicate, ValueRef};

// SECTION: intervals

/// Abstraction of a set of signed integers. `Lez`, `Gez` and `Ntz` are the
/// pairwise unions of the three atoms; null pointers count as 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Interval {
    Bot,
    Ltz,
    Zero,
    Gtz,
    Lez,
    Gez,
    Ntz,
    Top,
}

impl Interval {
    /// Every concrete value denoted by `other` is also denoted by `self`.
    pub fn covers(self, other: Interval) -> bool {
        use Interval::*;

        match (self, other) {
            (a, b) if a == b => true,
            (Top, _) => true,
            (_, Top) => false,
            (_, Bot) => true,
            (Bot, _) => false,
            (Lez, Ltz) | (Lez, Zero) => true,
            (Gez, Zero) | (Gez, Gtz) => true,
            (Ntz, Ltz) | (Ntz, Gtz) => true,
            _ => false,
        }
    }

    /// Least upper bound.
    pub fn join(self, other: Interval) -> Interval {
        use Interval::*;

        match (self, other) {
            (a, b) if a == b => a,
            (Top, _) | (_, Top) => Top,
            (Bot, x) | (x, Bot) => x,

            // atoms merge to their two-atom union
            (Ltz, Zero) | (Zero, Ltz) => Lez,
            (Zero, Gtz) | (Gtz, Zero) => Gez,
            (Ltz, Gtz) | (Gtz, Ltz) => Ntz,

            // an atom is absorbed by a union containing it
            (Lez, Ltz) | (Ltz, Lez) | (Lez, Zero) | (Zero, Lez) => Lez,
            (Gez, Zero) | (Zero, Gez) | (Gez, Gtz) | (Gtz, Gez) => Gez,
            (Ntz, Ltz) | (Ltz, Ntz) | (Ntz, Gtz) | (Gtz, Ntz) => Ntz,

            // atom vs. a union that misses it, or two distinct unions
            _ => Top,
        }
    }

    /// Greatest lower bound.
    pub fn meet(self, other: Interval) -> Interval {
        use Interval::*;

        match (self, other) {
            (a, b) if a == b => a,
            (Bot, _) | (_, Bot) => Bot,
            (Top, x) | (x, Top) => x,

            // an atom survives a union containing it
            (Lez, Ltz) | (Ltz, Lez) => Ltz,
            (Lez, Zero) | (Zero, Lez) => Zero,
            (Gez, Zero) | (Zero, Gez) => Zero,
            (Gez, Gtz) | (Gtz, Gez) => Gtz,
            (Ntz, Ltz) | (Ltz, Ntz) => Ltz,
            (Ntz, Gtz) | (Gtz, Ntz) => Gtz,

            // distinct unions share exactly one atom
            (Lez, Gez) | (Gez, Lez) => Zero,
            (Lez, Ntz) | (Ntz, Lez) => Ltz,
            (Gez, Ntz) | (Ntz, Gez) => Gtz,

            // distinct atoms, or an atom vs. a union that misses it
            _ => Bot,
        }
    }

    /// Abstraction of a single integer (null pointers are passed in as 0).
    pub fn of_int(v: i64) -> Interval {
        use std::cmp::Ordering::*;

        match v.cmp(&0) {
            Less => Interval::Ltz,
            Equal => Interval::Zero,
            Greater => Interval::Gtz,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let token = match self {
            Interval::Ltz => "<0",
            Interval::Gez => ">=0",
            Interval::Gtz => ">0",
            Interval::Lez => "<=0",
            Interval::Zero => "==0",
            Interval::Ntz => "!=0",
            Interval::Top => "top",
            Interval::Bot => "bottom",
        };
        write!(f, "{token}")
    }
}

#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "unknown interval token: {}", _0)]
pub struct ParseIntervalError(pub String);

impl std::error::Error for ParseIntervalError {}

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<0" => Ok(Interval::Ltz),
            ">=0" => Ok(Interval::Gez),
            ">0" => Ok(Interval::Gtz),
            "<=0" => Ok(Interval::Lez),
            "==0" => Ok(Interval::Zero),
            "!=0" => Ok(Interval::Ntz),
            "top" => Ok(Interval::Top),
            "bottom" => Ok(Interval::Bot),
            other => Err(ParseIntervalError(other.to_string())),
        }
    }
}

// SECTION: constraints

/// An interval attached to a function name, with the source location of the
/// compare that produced it when one is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraint {
    pub fname: String,
    pub interval: Interval,
    pub loc: Option<Loc>,
}

impl Constraint {
    pub fn new(fname: impl Into<String>) -> Self {
        Constraint {
            fname: fname.into(),
            interval: Interval::Bot,
            loc: None,
        }
    }

    pub fn with_interval(fname: impl Into<String>, interval: Interval) -> Self {
        Constraint {
            fname: fname.into(),
            interval,
            loc: None,
        }
    }

    pub fn covers(&self, other: Interval) -> bool {
        self.interval.covers(other)
    }

    // join and meet are only meaningful between constraints on the same
    // function; mixing names is a bug in the caller, not in the input.

    pub fn join(&self, other: &Constraint) -> Constraint {
        assert_eq!(self.fname, other.fname, "join of constraints on different functions");
        Constraint {
            fname: self.fname.clone(),
            interval: self.interval.join(other.interval),
            loc: self.loc.clone().or_else(|| other.loc.clone()),
        }
    }

    pub fn meet(&self, other: &Constraint) -> Constraint {
        assert_eq!(self.fname, other.fname, "meet of constraints on different functions");
        Constraint {
            fname: self.fname.clone(),
            interval: self.interval.meet(other.interval),
            loc: self.loc.clone().or_else(|| other.loc.clone()),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.fname, self.interval)
    }
}

// SECTION: compare abstraction

/// The `(true-branch, false-branch)` intervals implied by a compare against
/// zero, null, or a nonzero constant.
///
/// Compares against a single negative constant only pin the true branch: the
/// negation of "one specific negative value" may still be negative, so the
/// false branch stays `top`. Same reasoning for positive constants.
pub fn abstract_icmp(pred: Predicate, lhs: ValueRef, rhs: ValueRef) -> (Interval, Interval) {
    use Interval::*;

    let constant = match (lhs, rhs) {
        (_, ValueRef::Const(k)) => Some(k),
        (ValueRef::Const(k), _) => Some(k),
        _ => None,
    };

    if constant == Some(0) || matches!(rhs, ValueRef::Null) {
        match pred {
            Predicate::Sle => (Lez, Gtz),
            Predicate::Slt => (Ltz, Gez),
            Predicate::Sgt => (Gtz, Lez),
            Predicate::Sge => (Gez, Ltz),
            Predicate::Eq => (Zero, Ntz),
            Predicate::Ne => (Ntz, Zero),
            _ => (Top, Top),
        }
    } else if let Some(k) = constant {
        if k < 0 {
            (Ltz, Top)
        } else {
            (Gtz, Top)
        }
    } else {
        (Top, Top)
    }
}

// SECTION: tests

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Interval::*;
    use super::*;

    const ALL: [Interval; 8] = [Bot, Ltz, Zero, Gtz, Lez, Gez, Ntz, Top];
    const ATOMS: [Interval; 3] = [Ltz, Zero, Gtz];

    #[test]
    fn join_meet_laws() {
        for a in ALL {
            assert_eq!(a.join(a), a);
            assert_eq!(a.meet(a), a);
            assert_eq!(Bot.join(a), a);
            assert_eq!(Top.join(a), Top);
            assert_eq!(Top.meet(a), a);
            assert_eq!(Bot.meet(a), Bot);
            for b in ALL {
                assert_eq!(a.join(b), b.join(a), "join commutes: {a} {b}");
                assert_eq!(a.meet(b), b.meet(a), "meet commutes: {a} {b}");
                for c in ALL {
                    assert_eq!(a.join(b).join(c), a.join(b.join(c)), "join assoc: {a} {b} {c}");
                    assert_eq!(a.meet(b).meet(c), a.meet(b.meet(c)), "meet assoc: {a} {b} {c}");
                }
            }
        }
    }

    #[test]
    fn covers_agrees_with_join_and_meet() {
        for a in ALL {
            for b in ALL {
                assert_eq!(a.covers(b), a.join(b) == a, "covers/join: {a} {b}");
                assert_eq!(a.covers(b), a.meet(b) == b, "covers/meet: {a} {b}");
            }
        }
    }

    #[test]
    fn atoms_and_their_unions() {
        let unions = [(Ltz, Zero, Lez), (Zero, Gtz, Gez), (Ltz, Gtz, Ntz)];
        for (a1, a2, u) in unions {
            assert_eq!(a1.join(a2), u);
            assert!(u.covers(a1) && u.covers(a2));
            assert_eq!(u.meet(a1), a1);
            assert_eq!(u.meet(a2), a2);
        }
        // atom vs. the one union that misses it
        assert_eq!(Ltz.join(Gez), Top);
        assert_eq!(Zero.join(Ntz), Top);
        assert_eq!(Gtz.join(Lez), Top);
        assert_eq!(Ltz.meet(Gez), Bot);
        assert_eq!(Zero.meet(Ntz), Bot);
        assert_eq!(Gtz.meet(Lez), Bot);
        // distinct unions meet at their shared atom
        assert_eq!(Lez.meet(Gez), Zero);
        assert_eq!(Lez.meet(Ntz), Ltz);
        assert_eq!(Gez.meet(Ntz), Gtz);
        for a in ATOMS {
            for b in ATOMS {
                if a != b {
                    assert_eq!(a.meet(b), Bot);
                }
            }
        }
    }

    #[test]
    fn interval_tokens_round_trip() {
        for a in ALL {
            assert_eq!(a.to_string().parse::<Interval>().unwrap(), a);
        }
        assert!("<>0".parse::<Interval>().is_err());
    }

    #[test]
    fn icmp_abstraction_against_zero() {
        use Predicate::*;

        let zero = ValueRef::Const(0);
        let x = ValueRef::Const(7); // stands in for any non-constant side below
        let table = [
            (Sle, Lez, Gtz),
            (Slt, Ltz, Gez),
            (Sgt, Gtz, Lez),
            (Sge, Gez, Ltz),
            (Eq, Zero, Ntz),
            (Ne, Ntz, Zero),
        ];
        for (pred, t, f) in table {
            assert_eq!(abstract_icmp(pred, x, zero), (t, f), "{pred} k=0");
            assert_eq!(abstract_icmp(pred, x, ValueRef::Null), (t, f), "{pred} null");
        }
        assert_eq!(abstract_icmp(Ult, x, zero), (Top, Top));
    }

    #[test]
    fn icmp_abstraction_against_nonzero() {
        let x = ValueRef::Param(crate::middle_end::ir::ParamId(0));
        assert_eq!(abstract_icmp(Predicate::Eq, x, ValueRef::Const(-5)), (Ltz, Top));
        assert_eq!(abstract_icmp(Predicate::Eq, x, ValueRef::Const(3)), (Gtz, Top));
        // no constant on either side
        let y = ValueRef::Param(crate::middle_end::ir::ParamId(1));
        assert_eq!(abstract_icmp(Predicate::Slt, x, y), (Top, Top));
    }

    #[test]
    #[should_panic(expected = "different functions")]
    fn join_checks_fname() {
        let a = Constraint::with_interval("a", Ltz);
        let b = Constraint::with_interval("b", Gtz);
        let _ = a.join(&b);
    }
}
