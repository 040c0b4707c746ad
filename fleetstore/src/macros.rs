//! Error construction macros.
//!
//! Errors in this crate are built from a classification kind, a static description and
//! an optional dynamic detail. The detail position accepts either a ready-made
//! expression rendered through `Display`, or a format string with arguments, so call
//! sites addressing a row (`"{cluster}/{namespace}/{name}"`) don't wrap their own
//! `format!`. Expansions name the error type through `$crate`, so using the macros
//! does not require importing it.

/// Builds a [`crate::error::FleetError`].
///
/// ```ignore
/// fleet_error!(ErrorKind::Throttled, "request was throttled");
/// fleet_error!(ErrorKind::NotFound, "resource not found", "{cluster}/{name}");
/// fleet_error!(ErrorKind::QueryFailed, "database operation failed", err);
/// ```
#[macro_export]
macro_rules! fleet_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::FleetError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::error::FleetError::from(($kind, $desc, format!($fmt $(, $arg)*)))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::FleetError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Returns early with a [`crate::error::FleetError`]; accepts the same argument forms
/// as [`fleet_error!`].
#[macro_export]
macro_rules! bail {
    ($($args:tt)+) => {
        return Err($crate::fleet_error!($($args)+))
    };
}
