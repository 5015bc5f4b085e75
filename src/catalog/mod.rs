//! Catalog repository (C5) — persistent storage of images, variants, tags,
//! albums, and users, with a batch-loaded read path that never issues a
//! per-row follow-up query (spec §4.5, P8).

pub mod albums;
pub mod images;
pub mod users;
