pub mod crud;
pub mod filter_compiler;
pub mod pagination;
pub mod plan;
pub mod predicate;
pub mod reconcile;
pub mod resolve;
pub mod serialize;

pub use crud::*;
pub use filter_compiler::*;
pub use pagination::*;
pub use plan::*;
pub use predicate::*;
pub use reconcile::*;
pub use resolve::*;
pub use serialize::*;
