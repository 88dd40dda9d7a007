pub mod cache;
pub mod operation;
pub mod rule;
pub mod schema;
pub mod stats;
pub mod sync;

pub use cache::*;
pub use operation::*;
pub use rule::*;
pub use schema::*;
pub use stats::*;
pub use sync::*;
