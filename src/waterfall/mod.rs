mod model;
mod seed;

pub use model::{BuildNode, BuildsetRow, StepNode, WaterfallModel};
pub use seed::{builders_of, seed_events};
