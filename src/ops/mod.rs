pub mod adapter;
pub mod ai;
pub mod normalize;
pub mod pipeline;
