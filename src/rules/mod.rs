//! Bundled capability variants.
//!
//! Concrete production rules (stylesheet compilers, template compilers,
//! bundlers) live with the host; these are the generic building blocks
//! that keep showing up.

pub mod cached_file;
pub mod includes;
pub mod symlink;

pub use cached_file::CachedFile;
pub use includes::IncludeScanner;
pub use symlink::CreateSymlink;
