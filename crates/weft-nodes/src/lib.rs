pub mod aggregate;
pub mod backend;
pub mod builtin;
pub mod expr;
pub mod path;
pub mod registry;
pub mod template;

pub use aggregate::Strategy;
pub use registry::ExecutorRegistry;
