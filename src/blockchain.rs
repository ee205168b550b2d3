// Thin re-export module: the chain data model and its verification rules
// live in the submodules under `blockchain/`.

pub mod block;
pub mod link;
pub mod roster;
pub mod verify;

pub use block::*;
pub use link::*;
pub use roster::*;
pub use verify::*;
