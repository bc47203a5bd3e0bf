//! Phase executors: the operations each customization phase performs on
//! an image root.
//!
//! Executors that only write configuration files take the image root path.
//! Executors that run tools inside the image take the [`Chroot`] handle.
//!
//! [`Chroot`]: crate::chroot::Chroot

pub mod accounts;
pub mod files;
pub mod modules;
pub mod services;
pub mod users;
