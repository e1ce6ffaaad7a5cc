pub mod common;
pub mod field_spec;
pub mod filter;
pub mod record;
pub mod relation;
pub mod resource;
pub mod schema;
pub mod write;

pub use common::*;
pub use field_spec::*;
pub use filter::*;
pub use record::*;
pub use relation::*;
pub use resource::*;
pub use schema::*;
pub use write::*;
