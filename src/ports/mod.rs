//! Port allocation and virtualization.
//!
//! Each running worktree holds an exclusive offset (a positive multiple of
//! the configured step). Two mechanisms make the offset take effect inside
//! the child process tree: explicit env-variable substitution (primary, see
//! [`env_map`]) and the preload interposition shim (fallback, see [`shim`]).

pub mod allocator;
pub mod discovery;
pub mod env_map;
pub mod shim;

pub use allocator::PortAllocator;
