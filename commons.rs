//! Bits and pieces shared by the front end, the analyses, and the binaries.

use std::fmt;
use std::ops::Deref;

/// A witness that a value has passed validation.
///
/// The only way to build a `Valid<T>` is through a validator (e.g.
/// `Module::validate`), so functions taking `&Valid<T>` can rely on the
/// structural invariants the validator checks.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);

impl<T> Deref for Valid<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: fmt::Display> fmt::Display for Valid<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
