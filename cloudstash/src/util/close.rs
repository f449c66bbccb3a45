//! Provides the [Close] trait for writers whose finalization may fail.

use std::io;

/// A trait for types that need to be finalized.
///
/// Using [Close::close] instead of just dropping allows to retrieve potential errors and handle
/// them. Dropping a value without closing it must abandon the operation rather than complete it,
/// so that interrupted writes never become visible.
pub trait Close {
    fn close(self) -> io::Result<()>;
}
