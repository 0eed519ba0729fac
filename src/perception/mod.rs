pub mod ax_tree;
pub mod pipeline;
pub mod traits;
pub mod types;
