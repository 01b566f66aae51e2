pub mod analyze;
pub mod compare;
pub mod describe;
pub mod difftree;
pub mod error;
pub mod hash;
pub mod index;
pub mod meta;
pub mod report;
pub mod repository;
pub mod walker;

pub use error::Error;
pub use hash::{Digest, HashAlgorithm};
pub use repository::Repository;
