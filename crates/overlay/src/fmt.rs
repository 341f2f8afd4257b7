//! Logging front end.
//!
//! Every macro forwards to `defmt` on hardware builds and to `tracing` on
//! desktop builds. With neither backend enabled the arguments are still
//! borrowed so call sites type-check identically in every configuration.
//!
//! Format strings must stay within the `{}` subset both backends accept.
//! Arguments are integers, booleans, `&str` or types deriving both
//! `defmt::Format` and `Display`.

#![allow(unused_macros)]

macro_rules! log_event {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::$level!($s $(, $x)*);
        #[cfg(all(feature = "tracing", not(feature = "defmt")))]
        ::tracing::$level!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "tracing")))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! trace {
    ($($t:tt)*) => { log_event!(trace, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { log_event!(debug, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { log_event!(info, $($t)*) };
}

macro_rules! warn {
    ($($t:tt)*) => { log_event!(warn, $($t)*) };
}

macro_rules! error {
    ($($t:tt)*) => { log_event!(error, $($t)*) };
}

/// Stop the core on a broken invariant.
///
/// Logs at `error` first so the reason reaches RTT/stdout before the core
/// stops. `panic = "abort"` in every profile turns this into a halt.
macro_rules! halt {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        error!($s $(, $x)*);
        $crate::fmt::halted(format_args!($s $(, $x)*))
    }};
}

#[cold]
#[inline(never)]
#[allow(clippy::panic)] // the single halt point for fatal conditions
pub(crate) fn halted(args: core::fmt::Arguments<'_>) -> ! {
    panic!("OS halt: {args}")
}
