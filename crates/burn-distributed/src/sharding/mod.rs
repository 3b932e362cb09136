mod mesh;
mod spec;

pub use mesh::*;
pub use spec::*;
