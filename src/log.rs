//! Logging interface, contingent on the `defmt-03` or `log` features
//!
//! Without either feature, the arguments are type checked and discarded.
//! Only log integers and `&str`s, with `{}` and `{:#x}`, so that every back
//! end accepts the same format strings.
//!
//! Enable logging only when you're certain that your logger isn't using USB!

macro_rules! trace {
    ($($args:tt)*) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt_03::trace!($($args)*);
        #[cfg(all(feature = "log", not(feature = "defmt-03")))]
        ::log::trace!($($args)*);
        #[cfg(not(any(feature = "log", feature = "defmt-03")))]
        let _ = format_args!($($args)*);
    }};
}

macro_rules! debug {
    ($($args:tt)*) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt_03::debug!($($args)*);
        #[cfg(all(feature = "log", not(feature = "defmt-03")))]
        ::log::debug!($($args)*);
        #[cfg(not(any(feature = "log", feature = "defmt-03")))]
        let _ = format_args!($($args)*);
    }};
}

macro_rules! info {
    ($($args:tt)*) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt_03::info!($($args)*);
        #[cfg(all(feature = "log", not(feature = "defmt-03")))]
        ::log::info!($($args)*);
        #[cfg(not(any(feature = "log", feature = "defmt-03")))]
        let _ = format_args!($($args)*);
    }};
}

macro_rules! warn {
    ($($args:tt)*) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt_03::warn!($($args)*);
        #[cfg(all(feature = "log", not(feature = "defmt-03")))]
        ::log::warn!($($args)*);
        #[cfg(not(any(feature = "log", feature = "defmt-03")))]
        let _ = format_args!($($args)*);
    }};
}

macro_rules! error {
    ($($args:tt)*) => {{
        #[cfg(feature = "defmt-03")]
        ::defmt_03::error!($($args)*);
        #[cfg(all(feature = "log", not(feature = "defmt-03")))]
        ::log::error!($($args)*);
        #[cfg(not(any(feature = "log", feature = "defmt-03")))]
        let _ = format_args!($($args)*);
    }};
}
