//! Authorization and asset resolution.
//!
//! The bastion never decides on its own who may reach which backend: it asks an
//! [`AssetResolver`]. The crate ships [`StaticInventory`], built from the `[[assets]]` and
//! `[[tokens]]` tables of the configuration file.

pub mod inventory;
pub mod types;

pub use inventory::{AssetResolver, StaticInventory};
pub use types::{Asset, SystemUser, User};
